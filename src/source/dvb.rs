//! DVB/Nokia socket callback demuxer — interface only, §1 Non-goals
//! ("the DVB/Nokia-specific socket callback" is an external collaborator).
//!
//! Also hosts [`DemuxerCallbackHandler`], the cyclic strong/weak pair of
//! §9's Design Notes: a source owns its handler strongly; the handler
//! holds a weak back-reference to the source's reconnect hook, resolved
//! only when a socket error actually needs to propagate.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{BufferPool, IngressQueue};
use crate::error::{EngineError, Result};
use crate::source::{Demuxer, SourceStats};

type ReconnectHook = dyn Fn() + Send + Sync;

/// Resolves a weak back-reference to its owning source on demand; never
/// holds the owner alive by itself.
#[derive(Default)]
pub struct DemuxerCallbackHandler {
    reconnect: Mutex<Option<Weak<ReconnectHook>>>,
}

impl DemuxerCallbackHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, reconnect: &Arc<ReconnectHook>) {
        *self.reconnect.lock() = Some(Arc::downgrade(reconnect));
    }

    /// Invoked by the listener thread on a socket error; a no-op once the
    /// owning source has been dropped.
    pub fn notify_socket_error(&self) {
        if let Some(hook) = self.reconnect.lock().as_ref().and_then(Weak::upgrade) {
            hook();
        }
    }
}

#[derive(Default)]
pub struct DvbSrc {
    handler: Option<Arc<DemuxerCallbackHandler>>,
}

impl DvbSrc {
    pub fn new() -> Self {
        Self {
            handler: Some(DemuxerCallbackHandler::new()),
        }
    }
}

impl Demuxer for DvbSrc {
    fn open(&mut self, _uri: &str, _iface: &str) -> Result<()> {
        Err(EngineError::Fatal(
            "DVB/Nokia socket callback source is an external collaborator, not implemented here"
                .to_string(),
        ))
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn start(&mut self, _queue: Arc<IngressQueue>, _pool: Arc<BufferPool>) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }

    fn callback_handler(&self) -> Arc<DemuxerCallbackHandler> {
        self.handler.clone().unwrap_or_else(DemuxerCallbackHandler::new)
    }
}

impl DvbSrc {
    /// A message that arrives after ECM parsing has already completed for
    /// the same section is silently dropped; preserved here as observed
    /// behaviour rather than fixed.
    pub fn on_late_ecm_message(&self) {
        log::warn!("dvb source: message received after ECM parsing already completed, dropping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn handler_resolves_while_owner_lives() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let hook: Arc<ReconnectHook> = Arc::new(move || fired2.store(true, Ordering::SeqCst));
        let handler = DemuxerCallbackHandler::new();
        handler.bind(&hook);
        handler.notify_socket_error();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn handler_is_a_no_op_once_owner_is_dropped() {
        let handler = DemuxerCallbackHandler::new();
        {
            let hook: Arc<ReconnectHook> = Arc::new(|| panic!("should never run"));
            handler.bind(&hook);
        }
        handler.notify_socket_error();
    }
}
