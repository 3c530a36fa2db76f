//! PMT (Program Map Table) parsing and Verimatrix CA-descriptor detection,
//! §4.5.

use crate::error::{EngineError, Result};

const CA_DESCRIPTOR_TAG: u8 = 0x09;
const VERIMATRIX_CA_SYSTEM_ID: u16 = 0x5601;

pub struct PmtInfo {
    pub version: u8,
    pub ecm_pid: Option<u16>,
    pub is_clear: bool,
    /// The PMT section bytes, captured regardless of `is_clear`: an
    /// encrypted stream still publishes its own PMT snapshot.
    pub snapshot: Option<Vec<u8>>,
}

/// Scan a TLV descriptor region for the first CA descriptor naming the
/// Verimatrix system id, honouring an optional operator-id extension.
/// Returns the CA PID of the first accepted match ("first match wins").
fn scan_ca_descriptor(region: &[u8], opid: Option<u8>) -> Option<u16> {
    let mut p = 0usize;
    while p + 2 <= region.len() {
        let tag = region[p];
        let len = region[p + 1] as usize;
        let entry_len = len + 2;
        if p + entry_len > region.len() {
            break;
        }
        if tag == CA_DESCRIPTOR_TAG && len >= 4 {
            let ca_system_id = ((region[p + 2] as u16) << 8) | region[p + 3] as u16;
            if ca_system_id == VERIMATRIX_CA_SYSTEM_ID {
                let accepted = if entry_len > 6 {
                    let ext = &region[p + 6..p + entry_len];
                    ext.len() >= 2 && opid.map_or(true, |o| o == ext[1])
                } else {
                    true
                };
                if accepted {
                    let ca_pid = (((region[p + 4] as u16) << 8) | region[p + 5] as u16) & 0x1FFF;
                    return Some(ca_pid);
                }
            }
        }
        p += entry_len;
    }
    None
}

/// Parse one PMT packet. Table id must be `0x02`. Scans program
/// descriptors, then the per-stream descriptor loops, in wire order for the
/// Verimatrix CA descriptor; the first match wins across both loops.
pub fn parse_pmt(packet: &[u8], opid: Option<u8>) -> Result<PmtInfo> {
    if packet.len() < 188 {
        return Err(EngineError::PsiMalformed("short packet"));
    }
    let offs = if packet[3] & 0x30 == 0x30 {
        packet[4] as usize + 1
    } else {
        0
    };
    if offs > 184 {
        return Err(EngineError::PsiMalformed("adaptation field too long"));
    }
    let table = &packet[offs..];
    if table.len() < 17 {
        return Err(EngineError::PsiMalformed("PMT section too short"));
    }
    if table[5] != 0x02 {
        return Err(EngineError::PsiMalformed("wrong PMT table id"));
    }

    let section_len = (((table[6] as usize) << 8) | table[7] as usize) & 0xFFF;
    let program_info_len = (((table[15] as usize) << 8) | table[16] as usize) & 0x0FFF;
    let version = (table[10] & 0x3E) >> 1;

    if program_info_len > section_len {
        return Err(EngineError::PsiMalformed("descriptor length exceeds section"));
    }

    let program_descriptors_start = 17usize;
    let program_descriptors_end = program_descriptors_start
        .checked_add(program_info_len)
        .filter(|&end| end <= table.len())
        .ok_or(EngineError::PsiMalformed("program descriptors out of bounds"))?;

    let mut ecm_pid = scan_ca_descriptor(
        &table[program_descriptors_start..program_descriptors_end],
        opid,
    );

    // remaining section bytes after program_number/version/section_number/
    // last_section_number/PCR_PID/program_info_length (9 bytes) and the
    // program descriptors themselves, not counting the trailing CRC.
    let mut rem_section_bytes = section_len.saturating_sub(9).saturating_sub(program_info_len);
    let mut p = program_descriptors_end;

    while ecm_pid.is_none() && rem_section_bytes > 4 {
        if p + 5 > table.len() {
            return Err(EngineError::PsiMalformed("stream loop entry out of bounds"));
        }
        let es_info_len = (((table[p + 3] as usize) << 8) | table[p + 4] as usize) & 0xFFF;
        let es_descriptors_start = p + 5;
        let es_descriptors_end = es_descriptors_start
            .checked_add(es_info_len)
            .filter(|&end| end <= table.len())
            .ok_or(EngineError::PsiMalformed("ES descriptors out of bounds"))?;

        ecm_pid = scan_ca_descriptor(&table[es_descriptors_start..es_descriptors_end], opid);

        p = es_descriptors_end;
        rem_section_bytes = rem_section_bytes.saturating_sub(es_info_len + 5);
    }

    let is_clear = ecm_pid.is_none();
    Ok(PmtInfo {
        version,
        ecm_pid,
        is_clear,
        snapshot: Some(packet[5..].to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmt_with_ca_descriptor(ca_system_id: u16, ecm_pid: u16) -> Vec<u8> {
        let descriptor = [
            0x09,
            0x04,
            (ca_system_id >> 8) as u8,
            (ca_system_id & 0xFF) as u8,
            0xE0 | ((ecm_pid >> 8) as u8),
            (ecm_pid & 0xFF) as u8,
        ];
        let program_info_len = descriptor.len();
        let section_len = 9 + program_info_len + 4; // + CRC, no streams
        let mut p = vec![0u8; 188];
        p[0] = 0x47;
        p[5] = 0x02; // table_id
        p[6] = 0xB0 | ((section_len >> 8) as u8 & 0x0F);
        p[7] = (section_len & 0xFF) as u8;
        p[8] = 0x00;
        p[9] = 0x01; // program_number
        p[10] = 0xC0; // version 0
        p[11] = 0x00;
        p[12] = 0x00;
        p[13] = 0xE1;
        p[14] = 0x00; // PCR_PID
        p[15] = ((program_info_len >> 8) as u8) & 0x0F;
        p[16] = (program_info_len & 0xFF) as u8;
        p[17..17 + descriptor.len()].copy_from_slice(&descriptor);
        p
    }

    fn clear_pmt() -> Vec<u8> {
        let mut p = vec![0u8; 188];
        p[0] = 0x47;
        p[5] = 0x02;
        p[6] = 0xB0;
        p[7] = 0x09; // section_len = 9 (no descriptors, no streams, + CRC omitted here)
        p[8] = 0x00;
        p[9] = 0x01;
        p[10] = 0xC0;
        p[11] = 0x00;
        p[12] = 0x00;
        p[13] = 0xE1;
        p[14] = 0x00;
        p[15] = 0x00;
        p[16] = 0x00; // program_info_length = 0
        p
    }

    #[test]
    fn verimatrix_descriptor_yields_ecm_pid() {
        let packet = pmt_with_ca_descriptor(0x5601, 0x0123);
        let info = parse_pmt(&packet, None).unwrap();
        assert_eq!(info.ecm_pid, Some(0x0123));
        assert!(!info.is_clear);
    }

    #[test]
    fn non_verimatrix_ca_system_is_ignored() {
        let packet = pmt_with_ca_descriptor(0x0001, 0x0123);
        let info = parse_pmt(&packet, None).unwrap();
        assert_eq!(info.ecm_pid, None);
        assert!(info.is_clear);
    }

    #[test]
    fn no_descriptors_is_a_clear_stream() {
        let packet = clear_pmt();
        let info = parse_pmt(&packet, None).unwrap();
        assert!(info.is_clear);
        assert!(info.snapshot.is_some());
    }

    #[test]
    fn encrypted_stream_still_snapshots_its_pmt() {
        let packet = pmt_with_ca_descriptor(0x5601, 0x0123);
        let info = parse_pmt(&packet, None).unwrap();
        assert!(!info.is_clear);
        assert!(info.snapshot.is_some());
    }

    #[test]
    fn wrong_table_id_is_rejected() {
        let mut packet = clear_pmt();
        packet[5] = 0x00;
        assert!(parse_pmt(&packet, None).is_err());
    }
}
