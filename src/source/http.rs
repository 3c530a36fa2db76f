//! HTTP pull source — interface only, §1 Non-goals ("the HTTP source
//! using a URL-transport library" is an external collaborator). Selected
//! when `STREAM_TYPE=http` (§6); wired here only as far as the shared
//! capability set so the rest of the engine can be built and tested without
//! depending on a live transport crate.

use std::sync::Arc;

use crate::buffer::{BufferPool, IngressQueue};
use crate::error::Result;
use crate::source::dvb::DemuxerCallbackHandler;
use crate::source::{Demuxer, SourceStats};

#[derive(Default)]
pub struct HttpSrc {
    uri: String,
    handler: Option<Arc<DemuxerCallbackHandler>>,
    stats: SourceStats,
}

impl HttpSrc {
    pub fn new() -> Self {
        Self {
            handler: Some(DemuxerCallbackHandler::new()),
            ..Default::default()
        }
    }
}

impl Demuxer for HttpSrc {
    fn open(&mut self, uri: &str, _iface: &str) -> Result<()> {
        self.uri = uri.to_string();
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn start(&mut self, _queue: Arc<IngressQueue>, _pool: Arc<BufferPool>) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        self.stats
    }

    fn callback_handler(&self) -> Arc<DemuxerCallbackHandler> {
        self.handler.clone().unwrap_or_else(DemuxerCallbackHandler::new)
    }
}
