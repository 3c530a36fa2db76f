//! Engine-wide tunables.
//!
//! Values match the constants carried over from the original FCC/time-shift
//! core (see `examples/original_source/include/config_fcc.h`): buffer sizes
//! aligned to `7 * 188` bytes, a 64-entry producer pool, and a default socket
//! port of 8433.

use std::time::Duration;

/// Fixed 188-byte MPEG-2 Transport Stream packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// Size of one TSB ring chunk, a whole multiple of `TS_PACKET_SIZE`.
pub const CHUNK_SIZE: usize = 32 * 1024 - (32 * 1024 % TS_PACKET_SIZE);

/// Maximum payload size of one producer buffer, aligned to `7 * 188` bytes
/// per the original Nokia FEIP buffer convention.
pub const BUFFER_SIZE: usize = 32 * 7 * TS_PACKET_SIZE;

/// Number of producer buffers in the fixed pool.
pub const POOL_COUNT: usize = 64;

/// Time-shift buffer span, in seconds.
pub const TSB_SIZE_SEC: u64 = 60 * 60;

/// Extra chunks kept as an unreachable safety tail beyond `TSB_CAPACITY`.
pub const TAIL_SIZE: usize = 16;

/// One indexer sample is kept every `SAMPLING_RATIO` chunks.
pub const SAMPLING_RATIO: usize = 4;

/// RTP reorder cache capacity.
pub const MAX_CACHE: usize = 5;

/// Circular sequence-distance beyond which a gap is a discontinuity, not reorder.
pub const MAX_DIFF: i32 = 10;

/// Trick-play tick period.
pub const TRICK_RATE_MS: u64 = 350;

/// Pause-post-read watchdog timeout.
pub const PAUSE_POST_READ_MS: u64 = 1000;

/// Data-monitor loop tick period.
pub const BUFFER_CHECK_PERIOD_MS: u64 = 500;

/// Loss duration after which null-TS injection begins.
pub const NO_BUFFER_THRESHOLD_MS: u64 = 2000;

/// Loss duration after which a full reconnect is requested.
pub const NO_BUFFER_RECONFIGURE_MS: u64 = 5000;

/// Default RTP/UDP source port when a URI omits one.
pub const DEFAULT_SOURCE_PORT: u16 = 8433;

/// Channel-read defer timeout used by the virtual-file read surface.
pub const CHANNEL_READ_TIMEOUT_MS: u64 = 1000;

/// Zero-filled footer appended near the reported `i64::MAX` file size so
/// readers that probe near EOF get zero bytes instead of an error.
pub const TS_FILE_FOOTER_BYTES: u64 = 4 * TS_PACKET_SIZE as u64;

/// Derived TSB capacity in chunks, from `TSB_SIZE_SEC` and the nominal
/// per-chunk duration implied by `CHUNK_SIZE` at a ~20 Mbit/s stream rate
/// (the budget the original core sizes its ring for), plus the safety tail.
pub fn tsb_capacity(chunk_period: Duration) -> usize {
    let total_chunks = (TSB_SIZE_SEC as f64 * 1000.0 / chunk_period.as_millis().max(1) as f64)
        .ceil() as usize;
    total_chunks + TAIL_SIZE
}

/// Source selection, mirroring the `STREAM_TYPE` environment switch (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// UDP/RTP/DVB multicast (default, `STREAM_TYPE` unset).
    Multicast,
    /// HTTP pull source (`STREAM_TYPE=http`).
    Http,
}

impl SourceKind {
    /// Parse `STREAM_TYPE`. Any value other than unset or `"http"` is rejected.
    pub fn from_env() -> Result<Self, crate::error::EngineError> {
        match std::env::var("STREAM_TYPE") {
            Err(std::env::VarError::NotPresent) => Ok(SourceKind::Multicast),
            Ok(ref v) if v == "http" => Ok(SourceKind::Http),
            Ok(other) => Err(crate::error::EngineError::Config(format!(
                "unrecognized STREAM_TYPE: {other:?}"
            ))),
            Err(e) => Err(crate::error::EngineError::Config(e.to_string())),
        }
    }
}

/// Top-level engine configuration, gathering every spec-named tunable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub buffer_size: usize,
    pub pool_count: usize,
    pub tsb_size_sec: u64,
    pub tail_size: usize,
    pub sampling_ratio: usize,
    pub max_cache: usize,
    pub max_diff: i32,
    pub trick_rate_ms: u64,
    pub pause_post_read_ms: u64,
    pub buffer_check_period_ms: u64,
    pub no_buffer_threshold_ms: u64,
    pub no_buffer_reconfigure_ms: u64,
    pub default_port: u16,
    pub source_kind: SourceKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            buffer_size: BUFFER_SIZE,
            pool_count: POOL_COUNT,
            tsb_size_sec: TSB_SIZE_SEC,
            tail_size: TAIL_SIZE,
            sampling_ratio: SAMPLING_RATIO,
            max_cache: MAX_CACHE,
            max_diff: MAX_DIFF,
            trick_rate_ms: TRICK_RATE_MS,
            pause_post_read_ms: PAUSE_POST_READ_MS,
            buffer_check_period_ms: BUFFER_CHECK_PERIOD_MS,
            no_buffer_threshold_ms: NO_BUFFER_THRESHOLD_MS,
            no_buffer_reconfigure_ms: NO_BUFFER_RECONFIGURE_MS,
            default_port: DEFAULT_SOURCE_PORT,
            source_kind: SourceKind::Multicast,
        }
    }
}

impl EngineConfig {
    /// Build from the process environment, honouring `STREAM_TYPE`.
    pub fn from_env() -> Result<Self, crate::error::EngineError> {
        Ok(Self {
            source_kind: SourceKind::from_env()?,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_multiple_of_packet_size() {
        assert_eq!(CHUNK_SIZE % TS_PACKET_SIZE, 0);
    }

    #[test]
    fn buffer_size_is_7x188_aligned() {
        assert_eq!(BUFFER_SIZE % (7 * TS_PACKET_SIZE), 0);
    }

    #[test]
    fn stream_type_unset_is_multicast() {
        std::env::remove_var("STREAM_TYPE");
        assert_eq!(SourceKind::from_env().unwrap(), SourceKind::Multicast);
    }

    #[test]
    fn stream_type_http_selects_http() {
        std::env::set_var("STREAM_TYPE", "http");
        assert_eq!(SourceKind::from_env().unwrap(), SourceKind::Http);
        std::env::remove_var("STREAM_TYPE");
    }

    #[test]
    fn stream_type_other_is_rejected() {
        std::env::set_var("STREAM_TYPE", "carrier-pigeon");
        assert!(SourceKind::from_env().is_err());
        std::env::remove_var("STREAM_TYPE");
    }
}
