//! PSI/PAT/PMT/ECM state machine, §3 and §4.5.
//!
//! Runs on its own thread, draining a queue fed by [`PsiParser::post`].
//! Publishes `drm0`/`pat0`/`pmt0`/`ecm0` to the [`crate::mvar`] bus; it is
//! the sole writer for those ids once a channel is open.

pub mod ecm;
pub mod pat;
pub mod pmt;
pub mod windower;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::config::{POOL_COUNT, TS_PACKET_SIZE};
use crate::mvar::{self, ids, MvarValue};
use crate::protection::{Confidence, StreamProtectionConfig};
use ecm::EcmCollector;
use windower::{TsWindower, WindowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsiParserState {
    NeedsPat,
    NeedsPmt,
    NeedsVmxPmt,
    NeedsEcm,
    GotEcm,
    NoEcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Drop,
    Error,
    DecryptOdd,
    DecryptEven,
    NewEcm,
    NewEcmT,
    NewPatPmt,
}

#[derive(Default, Clone)]
struct PidSlot {
    pid: Option<u16>,
    version: Option<u8>,
    snapshot: Option<Vec<u8>>,
}

impl PidSlot {
    fn is_pid(&self, pid: u16) -> bool {
        self.pid == Some(pid)
    }

    fn is_new(&self, version: u8) -> bool {
        match self.version {
            None => true,
            Some(v) => v != version,
        }
    }

    fn set_pid(&mut self, pid: u16) {
        self.pid = Some(pid);
    }

    fn reset(&mut self) {
        *self = PidSlot::default();
    }
}

/// Owns the full PID/version/collection state machine. Single-threaded by
/// construction: the parser thread is the only caller.
pub struct PsiState {
    pat: PidSlot,
    pmt: PidSlot,
    ecm: PidSlot,
    is_clear: bool,
    state: PsiParserState,
    opid: Option<u8>,
    ecm_collector: EcmCollector,
    channel: String,
    /// Publish `drm0` once per channel; cleared by `on_open`.
    running: bool,
    last_published: Option<StreamProtectionConfig>,
}

impl PsiState {
    pub fn new(opid: Option<u8>) -> Self {
        let mut pat = PidSlot::default();
        pat.set_pid(0);
        Self {
            pat,
            pmt: PidSlot::default(),
            ecm: PidSlot::default(),
            is_clear: false,
            state: PsiParserState::NeedsPat,
            opid,
            ecm_collector: EcmCollector::new(),
            channel: String::new(),
            running: true,
            last_published: None,
        }
    }

    pub fn on_open(&mut self, channel: &str) {
        self.pat = PidSlot::default();
        self.pat.set_pid(0);
        self.pmt.reset();
        self.ecm.reset();
        self.ecm_collector.reset();
        self.is_clear = false;
        self.state = PsiParserState::NeedsPat;
        self.channel = channel.to_string();
        self.running = true;
        self.last_published = None;
        log::info!("psi: channel switch to {channel:?}, state reset to NeedsPat");
    }

    pub fn current_pat(&self) -> &[u8] {
        self.pat.snapshot.as_deref().unwrap_or(&[])
    }

    pub fn current_pmt(&self) -> &[u8] {
        self.pmt.snapshot.as_deref().unwrap_or(&[])
    }

    pub fn current_ecm(&self) -> &[u8] {
        self.ecm.snapshot.as_deref().unwrap_or(&[])
    }

    pub fn is_clear(&self) -> bool {
        self.is_clear
    }

    pub fn state(&self) -> PsiParserState {
        self.state
    }

    fn get_pid(packet: &[u8]) -> u16 {
        (((packet[1] as u16) << 8) + packet[2] as u16) & 0x1FFF
    }

    fn scrambling_bits(packet: &[u8]) -> u8 {
        packet[3] & 0xC0
    }

    /// Dispatch one TS packet through the state machine, per §4.5's
    /// `parseTsPacket`.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Action {
        let pid = Self::get_pid(packet);

        if self.pat.is_pid(pid) {
            let action = self.parse_pat_packet(packet);
            if self.state == PsiParserState::NeedsPat
                && self.pat.version.is_some()
                && self.pmt.pid.is_some()
            {
                self.state = PsiParserState::NeedsPmt;
            }
            return action;
        }

        if self.pmt.is_pid(pid) {
            let action = self.parse_pmt_packet(packet);
            if self.pmt.version.is_none() {
                return action;
            }
            match self.state {
                PsiParserState::NeedsPmt | PsiParserState::NeedsVmxPmt | PsiParserState::NoEcm => {
                    if !self.is_clear {
                        self.state = if self.ecm.pid.is_some() {
                            PsiParserState::NeedsEcm
                        } else {
                            PsiParserState::NeedsVmxPmt
                        };
                    }
                }
                PsiParserState::NeedsEcm | PsiParserState::GotEcm => {
                    if self.is_clear {
                        self.state = PsiParserState::NoEcm;
                        self.ecm.reset();
                    }
                }
                PsiParserState::NeedsPat => {}
            }
            return action;
        }

        if self.ecm.is_pid(pid) {
            let action = self.parse_ecm_packet(packet);
            if self.state == PsiParserState::NeedsEcm
                && matches!(action, Action::NewEcm | Action::NewEcmT)
            {
                self.state = PsiParserState::GotEcm;
            }
            return action;
        }

        if Self::scrambling_bits(packet) != 0 {
            if Self::scrambling_bits(packet) == 0x80 {
                Action::DecryptEven
            } else {
                Action::DecryptOdd
            }
        } else {
            Action::Ignore
        }
    }

    fn parse_pat_packet(&mut self, packet: &[u8]) -> Action {
        let info = match pat::parse_pat(packet) {
            Ok(info) => info,
            Err(e) => {
                log::debug!("psi: malformed PAT, dropping packet: {e}");
                return Action::Error;
            }
        };
        if self.pat.is_new(info.version) {
            log::info!(
                "psi: new PAT version {} -> pmt_pid {:#06x}",
                info.version,
                info.pmt_pid
            );
            self.pmt.reset();
            self.ecm.reset();
            self.pat.version = Some(info.version);
            self.pmt.set_pid(info.pmt_pid);
            self.pat.snapshot = Some(info.snapshot.clone());
            mvar::write(ids::PAT0, MvarValue::Bytes(info.snapshot));
        }
        Action::Ignore
    }

    fn parse_pmt_packet(&mut self, packet: &[u8]) -> Action {
        let info = match pmt::parse_pmt(packet, self.opid) {
            Ok(info) => info,
            Err(e) => {
                log::debug!("psi: malformed PMT, dropping packet: {e}");
                return Action::Error;
            }
        };
        if !self.pmt.is_new(info.version) {
            return Action::Ignore;
        }
        log::info!(
            "psi: new PMT version {} -> {}",
            info.version,
            if info.is_clear { "clear" } else { "encrypted" }
        );
        self.pmt.version = Some(info.version);
        self.is_clear = info.is_clear;

        if let Some(ecm_pid) = info.ecm_pid {
            if !self.ecm.is_pid(ecm_pid) {
                self.ecm.reset();
                self.ecm.set_pid(ecm_pid);
            }
        }

        if let Some(snapshot) = info.snapshot {
            self.pmt.snapshot = Some(snapshot.clone());
            mvar::write(ids::PMT0, MvarValue::Bytes(snapshot));
        }

        if info.is_clear {
            mvar::write(ids::CDM0, MvarValue::Bool(true));
            Action::NewPatPmt
        } else {
            Action::Ignore
        }
    }

    fn parse_ecm_packet(&mut self, packet: &[u8]) -> Action {
        if self.ecm_collector.in_progress() {
            let offs = if packet[3] & 0x30 == 0x30 {
                packet[4] as usize + 1
            } else {
                0
            };
            if offs > 184 {
                log::debug!("psi: ECM continuation packet has an oversized adaptation field");
                return Action::Error;
            }
            let payload = &packet[4 + offs..];
            return match self.ecm_collector.append(payload) {
                Some(bytes) => self.accept_ecm(bytes, Action::NewEcmT),
                None => Action::Ignore,
            };
        }

        let offs = if packet[3] & 0x30 == 0x30 {
            packet[4] as usize + 1
        } else {
            0
        };
        if offs > 184 {
            log::debug!("psi: ECM packet has an oversized adaptation field");
            return Action::Error;
        }
        let table = &packet[5 + offs..];
        match self.ecm_collector.start(table) {
            Ok(Some(bytes)) => self.accept_ecm(bytes, Action::NewEcm),
            Ok(None) => Action::Ignore,
            Err(e) => {
                log::debug!("psi: malformed ECM header, dropping packet: {e}");
                Action::Error
            }
        }
    }

    fn accept_ecm(&mut self, bytes: Vec<u8>, fresh_action: Action) -> Action {
        let version = self.ecm_collector.version();
        if self.ecm.is_new(version) {
            log::info!("psi: new ECM version {version} ({} bytes)", bytes.len());
            self.ecm.version = Some(version);
            self.ecm.snapshot = Some(bytes.clone());
            mvar::write(ids::ECM0, MvarValue::Bytes(bytes));
            fresh_action
        } else {
            Action::Ignore
        }
    }

    /// Publish `drm0` once per channel on `NEW_ECM | NEW_ECMT | NEW_PAT_PMT`.
    pub fn maybe_publish_drm(&mut self) {
        if !self.running {
            return;
        }
        let candidate = StreamProtectionConfig {
            confidence: Some(Confidence::High),
            channel: self.channel.clone(),
            ecm: self.current_ecm().to_vec(),
            pat: self.current_pat().to_vec(),
            pmt: self.current_pmt().to_vec(),
            is_clear: self.is_clear,
        };
        if StreamProtectionConfig::accepts(self.last_published.as_ref(), &candidate) {
            let json = serde_json::json!({
                "channel": candidate.channel,
                "ecm": hex::encode_upper(&candidate.ecm),
                "pat": hex::encode_upper(&candidate.pat),
                "pmt": hex::encode_upper(&candidate.pmt),
                "clear": candidate.is_clear,
            });
            mvar::write(ids::DRM0, MvarValue::Json(json));
            self.last_published = Some(candidate);
            self.running = false;
        }
    }
}

struct Shared {
    producer: Mutex<HeapProd<Vec<u8>>>,
    /// Only the Condvar's wait/notify path touches this lock; chunk data
    /// itself flows through the lock-free ring buffer below.
    wake: Mutex<()>,
    cv: Condvar,
    exit_requested: AtomicBool,
    /// Set by `on_open`; the worker drains its queue and resets state before
    /// processing any further chunks, per §4.5's concurrency note.
    pending_reset: Mutex<Option<String>>,
}

/// Drains a lock-free SPSC ring buffer of chunks on its own thread, windowing
/// them into 188-byte TS packets and feeding [`PsiState`].
pub struct PsiParser {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PsiParser {
    pub fn start(chunk_size: usize, opid: Option<u8>) -> Arc<Self> {
        let rb = HeapRb::<Vec<u8>>::new(POOL_COUNT);
        let (producer, consumer) = rb.split();
        let shared = Arc::new(Shared {
            producer: Mutex::new(producer),
            wake: Mutex::new(()),
            cv: Condvar::new(),
            exit_requested: AtomicBool::new(false),
            pending_reset: Mutex::new(None),
        });
        let worker_shared = shared.clone();
        let handle =
            std::thread::spawn(move || Self::run(worker_shared, consumer, chunk_size, opid));
        Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(shared: Arc<Shared>, mut consumer: HeapCons<Vec<u8>>, chunk_size: usize, opid: Option<u8>) {
        let mut windower = TsWindower::new(chunk_size);
        let mut state = PsiState::new(opid);
        loop {
            if let Some(channel) = shared.pending_reset.lock().take() {
                while consumer.try_pop().is_some() {}
                windower = TsWindower::new(chunk_size);
                state.on_open(&channel);
            }

            let chunk = loop {
                if shared.pending_reset.lock().is_some() {
                    break None;
                }
                if let Some(chunk) = consumer.try_pop() {
                    break Some(chunk);
                }
                if shared.exit_requested.load(Ordering::Acquire) {
                    return;
                }
                let mut guard = shared.wake.lock();
                shared.cv.wait_for(&mut guard, Duration::from_millis(100));
            };
            let Some(chunk) = chunk else {
                continue;
            };

            if windower.needs_new_chunk() {
                windower.insert_chunk(chunk);
            }
            loop {
                match windower.next_packet() {
                    Ok(packet) => {
                        let action = state.handle_packet(&packet);
                        if matches!(action, Action::NewEcm | Action::NewEcmT | Action::NewPatPmt) {
                            state.maybe_publish_drm();
                        }
                    }
                    Err(WindowError::DataCcError) => break,
                    Err(WindowError::NotEnoughData) => break,
                }
            }
        }
    }

    /// Feed one chunk (same `CHUNK_SIZE` as ingress) to the parser thread.
    pub fn post(&self, chunk: Vec<u8>) {
        debug_assert_eq!(chunk.len() % TS_PACKET_SIZE, 0);
        if let Err(dropped) = self.shared.producer.lock().try_push(chunk) {
            log::warn!("psi: ring buffer full, dropping {}-byte chunk", dropped.len());
        }
        let _guard = self.shared.wake.lock();
        self.shared.cv.notify_one();
    }

    /// Channel switch: drop whatever is queued and reset all PID/state.
    pub fn on_open(&self, channel: &str) {
        *self.shared.pending_reset.lock() = Some(channel.to_string());
        self.shared.cv.notify_all();
    }

    pub fn on_end_of_stream(&self) {}

    pub fn request_exit(&self) {
        self.shared.exit_requested.store(true, Ordering::Release);
        self.shared.cv.notify_all();
    }
}

impl Drop for PsiParser {
    fn drop(&mut self) {
        self.request_exit();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_pat_packet(pmt_pid: u16, version: u8) -> Vec<u8> {
        let mut p = vec![0u8; 188];
        p[0] = 0x47;
        p[5] = 0x00;
        p[6] = 0xB0;
        p[7] = 0x0D;
        p[8] = 0x00;
        p[9] = 0x01;
        p[10] = (version << 1) | 0xC0;
        p[11] = 0x00;
        p[12] = 0x00;
        p[13] = 0x00;
        p[14] = 0x01; // program_number = 1 (nonzero)
        p[15] = 0xE0 | ((pmt_pid >> 8) as u8);
        p[16] = (pmt_pid & 0xFF) as u8;
        p
    }

    #[test]
    fn pat_acceptance_sets_pmt_pid_and_advances_state() {
        let mut state = PsiState::new(None);
        let packet = minimal_pat_packet(0x0100, 1);
        let action = state.handle_packet(&packet);
        assert_eq!(action, Action::Ignore);
        assert_eq!(state.pmt.pid, Some(0x0100));
        assert_eq!(state.state(), PsiParserState::NeedsPmt);
    }

    #[test]
    fn duplicate_pat_version_is_a_no_op() {
        let mut state = PsiState::new(None);
        let packet = minimal_pat_packet(0x0100, 1);
        state.handle_packet(&packet);
        let before = state.pmt.pid;
        state.handle_packet(&packet);
        assert_eq!(state.pmt.pid, before);
    }

    #[test]
    fn on_open_resets_to_needs_pat() {
        let mut state = PsiState::new(None);
        state.handle_packet(&minimal_pat_packet(0x0100, 1));
        state.on_open("chan2");
        assert_eq!(state.state(), PsiParserState::NeedsPat);
        assert_eq!(state.pmt.pid, None);
    }
}
