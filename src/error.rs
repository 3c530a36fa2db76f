//! Crate-wide error kinds, grounded on the error *kinds* of §7.
//!
//! Per-packet and per-buffer errors are absorbed locally by callers (logged
//! and dropped); only [`EngineError::Fatal`] is meant to terminate the
//! process. A typed enum in place of ad hoc `Result<_, String>` plumbing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("malformed RTP packet: {0}")]
    RtpMalformed(&'static str),

    #[error("buffer source lost")]
    BufferSourceLost,

    #[error("malformed PSI section: {0}")]
    PsiMalformed(&'static str),

    #[error("indexer offset out of range")]
    IndexerOutOfRange,

    #[error("handle not found")]
    HandleNotFound,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid channel URI: {0}")]
    InvalidUri(String),

    #[error("fatal engine error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
