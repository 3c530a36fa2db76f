//! RTP reorder/reassembler, §4.1 and §8 scenarios 1–3.
//!
//! Single-threaded within one listener; the caller (the socket read loop)
//! serializes calls to [`RtpReassembler::process`].

use crate::config::{MAX_CACHE, MAX_DIFF};
use crate::error::EngineError;
use crate::rtp::header::RtpPacket;

/// Signed circular distance `a - b` over 16-bit modular sequence numbers:
/// wraps are interpreted as the short direction whenever `|delta| <= 2^15`.
pub fn signed_seq_diff(a: u16, b: u16) -> i32 {
    let raw = a as i32 - b as i32;
    if raw > i16::MAX as i32 {
        raw - 0x1_0000
    } else if raw < i16::MIN as i32 {
        raw + 0x1_0000
    } else {
        raw
    }
}

struct CacheEntry {
    sequence: u16,
    payload: Vec<u8>,
}

/// Reorders out-of-order RTP packets within a bounded window and detects
/// discontinuities, per §4.1.
pub struct RtpReassembler {
    expected: Option<u16>,
    /// Pending future packets, sorted oldest-to-newest by circular distance
    /// from `expected`. The expected sequence itself is never cached.
    cache: Vec<CacheEntry>,
}

impl Default for RtpReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpReassembler {
    pub fn new() -> Self {
        Self {
            expected: None,
            cache: Vec::with_capacity(MAX_CACHE),
        }
    }

    /// Process one raw RTP datagram. On success, returns the ordered payloads
    /// that should now be pushed downstream (zero, one, or many — a
    /// discontinuity flushes the whole cache, and an in-order arrival can
    /// drain several cached successors at once).
    ///
    /// Returns `Err(EngineError::Fatal)` only on the documented invariant
    /// breach: the cache is full and a *new* out-of-window packet arrives
    /// that is itself within the reorder distance (never overwritten).
    pub fn process(&mut self, datagram: &[u8]) -> Result<Vec<Vec<u8>>, EngineError> {
        let packet = match RtpPacket::parse(datagram) {
            Some(p) => p,
            None => return Ok(Vec::new()), // malformed offsets: drop, continue
        };
        self.process_seq(packet.header.sequence, packet.payload)
    }

    fn process_seq(&mut self, seq: u16, payload: &[u8]) -> Result<Vec<Vec<u8>>, EngineError> {
        let mut out = Vec::new();

        let expected = match self.expected {
            None => {
                // First packet ever seen: accept unconditionally.
                out.push(payload.to_vec());
                self.expected = Some(seq.wrapping_add(1));
                self.drain_cache(&mut out);
                return Ok(out);
            }
            Some(e) => e,
        };

        if seq == expected {
            out.push(payload.to_vec());
            self.expected = Some(seq.wrapping_add(1));
            self.drain_cache(&mut out);
            return Ok(out);
        }

        let d = signed_seq_diff(expected, seq);

        if d.unsigned_abs() > MAX_DIFF as u32 {
            // Discontinuity: flush the cache in order, then accept the jump.
            for entry in self.cache.drain(..) {
                out.push(entry.payload);
            }
            out.push(payload.to_vec());
            self.expected = Some(seq.wrapping_add(1));
            return Ok(out);
        }

        if self.cache.len() < MAX_CACHE {
            let insert_at = self
                .cache
                .iter()
                .position(|entry| signed_seq_diff(entry.sequence, seq) > 0)
                .unwrap_or(self.cache.len());
            self.cache.insert(
                insert_at,
                CacheEntry {
                    sequence: seq,
                    payload: payload.to_vec(),
                },
            );
            return Ok(out);
        }

        Err(EngineError::Fatal(
            "RTP reorder cache overflow: invariant breach".to_string(),
        ))
    }

    /// Drain any cached entries whose sequence now equals `self.expected`,
    /// repeatedly, in ascending order.
    fn drain_cache(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            let expected = match self.expected {
                Some(e) => e,
                None => return,
            };
            match self.cache.iter().position(|entry| entry.sequence == expected) {
                Some(idx) => {
                    let entry = self.cache.remove(idx);
                    out.push(entry.payload);
                    self.expected = Some(expected.wrapping_add(1));
                }
                None => return,
            }
        }
    }

    /// Current expected next sequence number (for tests/observability).
    pub fn next_expected(&self) -> Option<u16> {
        self.expected
    }

    /// Current cache occupancy (for tests/observability).
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut d = vec![0x80, 33, (seq >> 8) as u8, (seq & 0xFF) as u8, 0, 0, 0, 0, 0, 0, 0, 0];
    d.extend_from_slice(payload);
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_sequence_passes_through() {
        let mut r = RtpReassembler::new();
        let mut received = Vec::new();
        for seq in [100u16, 101, 102, 103] {
            let pkt = rtp_datagram(seq, &[seq as u8]);
            received.extend(r.process(&pkt).unwrap());
        }
        let payloads: Vec<u8> = received.iter().map(|p| p[0]).collect();
        assert_eq!(payloads, vec![100, 101, 102, 103]);
        assert_eq!(r.next_expected(), Some(104));
    }

    #[test]
    fn single_swap_is_reordered() {
        let mut r = RtpReassembler::new();
        let mut received = Vec::new();
        for seq in [100u16, 102, 101, 103] {
            let pkt = rtp_datagram(seq, &[seq as u8]);
            let out = r.process(&pkt).unwrap();
            received.extend(out);
            assert!(r.cache_len() <= 1);
        }
        let payloads: Vec<u8> = received.iter().map(|p| p[0]).collect();
        assert_eq!(payloads, vec![100, 101, 102, 103]);
    }

    #[test]
    fn large_gap_is_a_discontinuity() {
        let mut r = RtpReassembler::new();
        let mut received = Vec::new();
        for seq in [100u16, 101, 2000] {
            let pkt = rtp_datagram(seq, &[(seq % 256) as u8]);
            received.extend(r.process(&pkt).unwrap());
        }
        let payloads: Vec<u8> = received.iter().map(|p| p[0]).collect();
        assert_eq!(payloads, vec![100, 101, (2000u16 % 256) as u8]);
        assert_eq!(r.next_expected(), Some(2001));
        assert_eq!(r.cache_len(), 0);
    }

    #[test]
    fn nothing_is_duplicated_across_reorder_and_drain() {
        let mut r = RtpReassembler::new();
        let mut received = Vec::new();
        for seq in [5u16, 7, 6, 9, 8] {
            let pkt = rtp_datagram(seq, &[seq as u8]);
            received.extend(r.process(&pkt).unwrap());
        }
        let payloads: Vec<u8> = received.iter().map(|p| p[0]).collect();
        assert_eq!(payloads, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn cache_overflow_is_fatal() {
        let mut r = RtpReassembler::new();
        r.process(&rtp_datagram(0, &[0])).unwrap();
        // Fill the cache with 5 out-of-order-but-in-window packets that never drain.
        for seq in [3u16, 4, 5, 6, 7] {
            r.process(&rtp_datagram(seq, &[seq as u8])).unwrap();
        }
        // A sixth pending packet cannot fit: fatal.
        let res = r.process(&rtp_datagram(9, &[9]));
        assert!(matches!(res, Err(EngineError::Fatal(_))));
    }
}
