//! Live-television streaming engine core: RTP/UDP/HTTP transport-stream
//! ingest, a bounded time-shift buffer with random-access seek and
//! trick-play, PSI/PAT/PMT/ECM parsing for DRM state, and a virtual-file
//! read surface for the host player.
//!
//! Laid out one module per concern: a threaded listener feeding a bounded
//! buffer, and a C-ABI surface in [`ffi`]. Built around a single [`Engine`]
//! value rather than per-stream opaque handles, since the host addresses
//! this core through file paths, not a create/free pair per channel.

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ffi;
pub mod mvar;
pub mod protection;
pub mod psi;
pub mod rtp;
pub mod source;
pub mod tsb;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use buffer::{BufferPool, IngressQueue};
use config::{EngineConfig, SourceKind};
use coordinator::{Coordinator, StreamProcessor};
use error::Result;
use psi::PsiParser;
use source::http::HttpSrc;
use source::udp::UdpSrc;
use source::Source;
use tsb::{BufferIndexer, PlayerState, RingBufferPool, TsbConsumer};

/// Nominal stream bit rate the ring is sized against, matching the budget
/// noted in [`config::tsb_capacity`]'s doc comment.
const NOMINAL_BYTES_PER_SEC: f64 = 20_000_000.0 / 8.0;

/// The one explicit engine value, created once at startup and held by the
/// host for as long as the plugin is loaded. The MVar registry is the one
/// deliberate exception to "no ambient globals": it's process-wide so that
/// independent observers (the PSI thread, the monitor loop, the host) can
/// all reach `drm0`/`stream_status`/etc. without being wired through this
/// struct by hand.
pub struct Engine {
    config: EngineConfig,
    tsb: Arc<TsbConsumer>,
    coordinator: Arc<Coordinator>,
    start: Instant,
    chan_select_timestamp_ms: AtomicU64,
    next_handle: AtomicU64,
    iface: Mutex<String>,
    cdm_ready: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let chunk_period =
            Duration::from_secs_f64(config.chunk_size as f64 / NOMINAL_BYTES_PER_SEC);
        let capacity = config::tsb_capacity(chunk_period);

        let ring = Arc::new(RingBufferPool::new(capacity, config.chunk_size, config.tail_size));
        let indexer = Arc::new(BufferIndexer::new(capacity, config.sampling_ratio));
        let tsb = TsbConsumer::new(ring, indexer);
        let psi = PsiParser::start(config.chunk_size, None);
        let processor = StreamProcessor::new(tsb.clone(), psi);

        let queue = Arc::new(IngressQueue::new(config.pool_count));
        let pool = Arc::new(BufferPool::new(config.pool_count, config.buffer_size));
        let source = match config.source_kind {
            SourceKind::Multicast => Source::Udp(UdpSrc::new(false)),
            SourceKind::Http => Source::Http(HttpSrc::new()),
        };

        let coordinator = Coordinator::new(processor, queue, pool, source);
        coordinator.start();

        Arc::new(Self {
            config,
            tsb,
            coordinator,
            start: Instant::now(),
            chan_select_timestamp_ms: AtomicU64::new(0),
            next_handle: AtomicU64::new(1),
            iface: Mutex::new(String::from("0.0.0.0")),
            cdm_ready: AtomicBool::new(false),
        })
    }

    pub fn from_env() -> Result<Arc<Self>> {
        Ok(Self::new(EngineConfig::from_env()?))
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn max_seek_ms(&self) -> u64 {
        self.config.tsb_size_sec * 1000
    }

    /// `chan_select0` write: switch channel over the given interface.
    pub fn open_channel(&self, uri: &str) -> bool {
        let iface = self.iface.lock().clone();
        let opened = self.coordinator.open(uri, &iface);
        if opened {
            self.chan_select_timestamp_ms
                .store(self.now_ms(), Ordering::Release);
        }
        opened
    }

    pub fn set_interface(&self, iface: &str) {
        *self.iface.lock() = iface.to_string();
    }

    /// `chan_select_timestamp0`: monotonic ms of the last channel switch.
    pub fn chan_select_timestamp_ms(&self) -> u64 {
        self.chan_select_timestamp_ms.load(Ordering::Acquire)
    }

    pub fn new_read_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn release_read_handle(&self, handle: u64) {
        self.tsb.release_handle(handle);
    }

    /// `stream0.ts` read.
    pub fn read_stream(&self, handle: u64, dst: &mut [u8]) -> usize {
        self.tsb.read_data(handle, dst)
    }

    pub fn player_state(&self) -> PlayerState {
        self.tsb.player_state()
    }

    pub fn set_player_state(&self, state: PlayerState) {
        self.tsb.set_player_state(state);
    }

    /// `seek0` read: `"cur,max,off,actual,capacity"`, seconds and bytes.
    /// `cur` and `actual` both reflect the post-clamp position the TSB
    /// consumer actually holds — the consumer does not retain the
    /// pre-clamp request once `set_seek_time` returns.
    pub fn seek_status(&self) -> String {
        let cur_s = self.tsb.get_seek_time() / 1000;
        let max_s = self.config.tsb_size_sec;
        let off = self.tsb.seek_offset_bytes();
        let capacity = self.tsb.capacity_bytes();
        format!("{cur_s},{max_s},{off},{cur_s},{capacity}")
    }

    /// `seek0` write, in seconds.
    pub fn set_seek_seconds(&self, seconds: u64) -> Result<()> {
        self.tsb.set_seek_time(seconds * 1000, self.max_seek_ms())
    }

    pub fn trick_play_speed(&self) -> i16 {
        self.tsb.trick_play_speed()
    }

    pub fn set_trick_play_speed(&self, speed: i16) {
        self.tsb.set_trick_play_speed(speed, self.max_seek_ms());
    }

    /// `flush0` write: raise the flush sentinel.
    pub fn raise_flush(&self) {
        mvar::write(mvar::ids::FLUSH0, mvar::MvarValue::Bytes(vec![1]));
    }

    pub fn cdm_ready(&self) -> bool {
        self.cdm_ready.load(Ordering::Acquire)
    }

    /// `cdm_ready0` write: only `"1"` is meaningful, per spec.
    pub fn set_cdm_ready(&self) {
        self.cdm_ready.store(true, Ordering::Release);
        mvar::write(mvar::ids::CDM0, mvar::MvarValue::Bool(true));
    }

    /// `stream_status`: `"0|1,<lost_counter>"`.
    pub fn stream_status(&self) -> String {
        self.coordinator.stream_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> Arc<Engine> {
        let mut cfg = EngineConfig::default();
        cfg.chunk_size = 8;
        cfg.tail_size = 2;
        cfg.tsb_size_sec = 1;
        Engine::new(cfg)
    }

    #[test]
    fn fresh_engine_reports_undef_player_state() {
        let engine = test_engine();
        assert_eq!(engine.player_state(), PlayerState::Undef);
    }

    #[test]
    fn stream_status_starts_clean() {
        let engine = test_engine();
        assert_eq!(engine.stream_status(), "0,0");
    }

    #[test]
    fn set_cdm_ready_is_observable() {
        let engine = test_engine();
        assert!(!engine.cdm_ready());
        engine.set_cdm_ready();
        assert!(engine.cdm_ready());
    }
}
