//! Stream Processor fan-out and the Media Source Coordinator's three
//! threads (consumer/monitor/message), §4.6.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::{BufferPool, IngressQueue};
use crate::config::{
    BUFFER_CHECK_PERIOD_MS, CHUNK_SIZE, NO_BUFFER_RECONFIGURE_MS, NO_BUFFER_THRESHOLD_MS,
};
use crate::mvar::{self, ids, MvarValue};
use crate::psi::PsiParser;
use crate::source::{Demuxer, Source};
use crate::tsb::TsbConsumer;

/// Resets the live ECM/PAT/PMT bytes promptly on channel switch, ahead of
/// the asynchronous PSI thread catching up to the same `onOpen`.
pub struct EcmCache;

impl EcmCache {
    pub fn on_open(&self, _channel: &str) {
        mvar::write(ids::ECM0, MvarValue::Bytes(Vec::new()));
        mvar::write(ids::PAT0, MvarValue::Bytes(Vec::new()));
        mvar::write(ids::PMT0, MvarValue::Bytes(Vec::new()));
    }
}

/// One consumer of the Stream Processor's fan-out, tagged rather than
/// behind a trait object: `TsbConsumer::post` and `PsiParser::post` differ
/// in both receiver (`Arc<Self>` vs `&self`) and payload ownership
/// (borrowed vs owned), so a shared trait would need to erase one of them.
enum Consumer {
    Tsb(Arc<TsbConsumer>),
    Ecm(Arc<EcmCache>),
    Psi(Arc<PsiParser>),
}

impl Consumer {
    fn post(&self, chunk: &[u8]) {
        match self {
            Consumer::Tsb(c) => c.post(chunk),
            Consumer::Ecm(_) => {}
            Consumer::Psi(c) => c.post(chunk.to_vec()),
        }
    }

    fn on_open(&self, channel: &str) {
        match self {
            Consumer::Tsb(c) => c.on_open(channel),
            Consumer::Ecm(c) => c.on_open(channel),
            Consumer::Psi(c) => c.on_open(channel),
        }
    }

    fn on_end_of_stream(&self) {
        match self {
            Consumer::Tsb(c) => c.on_end_of_stream(),
            Consumer::Ecm(_) => {}
            Consumer::Psi(c) => c.on_end_of_stream(),
        }
    }
}

/// Holds the TSB/ECM-cache/PSI consumers in list order; `post` invokes each
/// synchronously, §4.6.
pub struct StreamProcessor {
    consumers: Vec<Consumer>,
}

impl StreamProcessor {
    pub fn new(tsb: Arc<TsbConsumer>, psi: Arc<PsiParser>) -> Self {
        Self {
            consumers: vec![
                Consumer::Tsb(tsb),
                Consumer::Ecm(Arc::new(EcmCache)),
                Consumer::Psi(psi),
            ],
        }
    }

    pub fn post(&self, chunk: &[u8]) {
        for consumer in &self.consumers {
            consumer.post(chunk);
        }
    }

    pub fn on_open(&self, channel: &str) {
        for consumer in &self.consumers {
            consumer.on_open(channel);
        }
    }

    pub fn on_end_of_stream(&self) {
        for consumer in &self.consumers {
            consumer.on_end_of_stream();
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub uri: String,
}

#[derive(Debug, Clone)]
pub enum RouteMessage {
    NoGateway,
    NewGateway(String),
    NoMulticast,
}

struct Shared {
    processor: StreamProcessor,
    queue: Arc<IngressQueue>,
    pool: Arc<BufferPool>,
    source: Mutex<Source>,
    config: Mutex<Option<ChannelConfig>>,
    last_valid_buffer_time: Mutex<Instant>,
    buffer_source_lost: AtomicBool,
    lost_counter: AtomicU64,
    exit_requested: AtomicBool,
    messages: Mutex<std::collections::VecDeque<RouteMessage>>,
    message_cv: parking_lot::Condvar,
}

/// Owns the three Media Source Coordinator threads atop one
/// [`StreamProcessor`]. `start()` spawns all three; `Drop` requests exit and
/// joins them.
pub struct Coordinator {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        processor: StreamProcessor,
        queue: Arc<IngressQueue>,
        pool: Arc<BufferPool>,
        source: Source,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                processor,
                queue,
                pool,
                source: Mutex::new(source),
                config: Mutex::new(None),
                last_valid_buffer_time: Mutex::new(Instant::now()),
                buffer_source_lost: AtomicBool::new(false),
                lost_counter: AtomicU64::new(0),
                exit_requested: AtomicBool::new(false),
                messages: Mutex::new(std::collections::VecDeque::new()),
                message_cv: parking_lot::Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        threads.push(self.spawn_consumer_loop());
        threads.push(self.spawn_monitor_loop());
        threads.push(self.spawn_message_loop());
    }

    pub fn post_message(&self, message: RouteMessage) {
        self.shared.messages.lock().push_back(message);
        self.shared.message_cv.notify_one();
    }

    /// `open(uri, demuxer_id)`: compare against the current URI under the
    /// config mutex; a no-op republish of the same URI fails silently.
    pub fn open(self: &Arc<Self>, uri: &str, iface: &str) -> bool {
        let mut config = self.shared.config.lock();
        if config.as_ref().map(|c| c.uri.as_str()) == Some(uri) {
            return false;
        }
        *config = Some(ChannelConfig { uri: uri.to_string() });
        drop(config);

        let mut source = self.shared.source.lock();
        source.disconnect();
        self.shared.processor.on_open(uri);
        if let Err(e) = source.open(uri, iface) {
            log::warn!("coordinator: open({uri:?}) failed: {e}");
            return false;
        }
        if let Err(e) = source.connect() {
            log::warn!("coordinator: connect() failed for {uri:?}: {e}");
            return false;
        }
        if let Err(e) = source.start(self.shared.queue.clone(), self.shared.pool.clone()) {
            log::warn!("coordinator: start() failed for {uri:?}: {e}");
            return false;
        }
        *self.shared.last_valid_buffer_time.lock() = Instant::now();
        true
    }

    fn spawn_consumer_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            let mut pending = Vec::<u8>::with_capacity(CHUNK_SIZE);
            while !shared.exit_requested.load(Ordering::Acquire) {
                let Some(id) = shared.queue.pop_filled(Duration::from_secs(1)) else {
                    continue;
                };
                {
                    let buffer = shared.pool.lock(id);
                    let mut offset = 0usize;
                    while offset < buffer.size {
                        let take = (CHUNK_SIZE - pending.len()).min(buffer.size - offset);
                        pending.extend_from_slice(&buffer.payload[offset..offset + take]);
                        offset += take;
                        if pending.len() == CHUNK_SIZE {
                            shared.processor.post(&pending);
                            pending.clear();
                        }
                    }
                }
                shared.queue.release_empty(id);
                *shared.last_valid_buffer_time.lock() = Instant::now();
            }
        })
    }

    fn spawn_monitor_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            while !shared.exit_requested.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(BUFFER_CHECK_PERIOD_MS));
                if shared.config.lock().is_none() {
                    continue;
                }
                let delta = shared.last_valid_buffer_time.lock().elapsed();
                if delta > Duration::from_millis(NO_BUFFER_RECONFIGURE_MS) {
                    shared.messages.lock().push_back(RouteMessage::NoMulticast);
                    shared.message_cv.notify_one();
                } else if delta > Duration::from_millis(NO_BUFFER_THRESHOLD_MS) {
                    shared.buffer_source_lost.store(true, Ordering::Release);
                    let counter = shared.lost_counter.fetch_add(1, Ordering::AcqRel) + 1;
                    mvar::write(
                        ids::BUFFER_SRC_LOST0,
                        MvarValue::Text(format!("1,{counter}")),
                    );
                    inject_null_ts(&shared);
                } else {
                    shared.buffer_source_lost.store(false, Ordering::Release);
                }
            }
        })
    }

    fn spawn_message_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let this = Arc::downgrade(self);
        std::thread::spawn(move || loop {
            let message = {
                let mut guard = shared.messages.lock();
                loop {
                    if let Some(m) = guard.pop_front() {
                        break Some(m);
                    }
                    if shared.exit_requested.load(Ordering::Acquire) {
                        return;
                    }
                    shared.message_cv.wait_for(&mut guard, Duration::from_millis(200));
                }
            };
            let Some(message) = message else { continue };
            let Some(this) = this.upgrade() else { return };

            match message {
                RouteMessage::NoGateway => {
                    this.open("0.0.0.0:5900", "lo");
                }
                RouteMessage::NewGateway(iface) => {
                    *shared.last_valid_buffer_time.lock() = Instant::now();
                    if let Some(cfg) = shared.config.lock().clone() {
                        this.open(&cfg.uri, &iface);
                    }
                }
                RouteMessage::NoMulticast => {
                    *shared.last_valid_buffer_time.lock() = Instant::now();
                    let uri = shared.config.lock().clone();
                    if let Some(cfg) = uri {
                        let mut source = shared.source.lock();
                        source.disconnect();
                        let _ = source.connect();
                        let _ = source.open(&cfg.uri, "");
                    }
                }
            }
        })
    }

    pub fn request_exit(&self) {
        self.shared.exit_requested.store(true, Ordering::Release);
        self.shared.queue.request_exit();
        self.shared.message_cv.notify_all();
    }

    /// `stream_status` virtual-file contents: `"0|1,<lost_counter>"`, §6.
    pub fn stream_status(&self) -> String {
        let lost = self.shared.buffer_source_lost.load(Ordering::Acquire) as u8;
        format!("{lost},{}", self.shared.lost_counter.load(Ordering::Acquire))
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.request_exit();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Acquire a producer buffer, fill it with null-TS packets, and push it to
/// the ingress queue so the TSB keeps advancing under loss (§4.6).
fn inject_null_ts(shared: &Shared) {
    let Some(id) = shared.queue.acquire_empty(Duration::from_millis(50)) else {
        return;
    };
    {
        let mut buffer = shared.pool.lock(id);
        buffer.fill_null_ts(crate::config::TS_PACKET_SIZE);
    }
    shared.queue.push_filled(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsb::{BufferIndexer, RingBufferPool};

    fn new_processor() -> StreamProcessor {
        let ring = Arc::new(RingBufferPool::new(16, 4, 2));
        let indexer = Arc::new(BufferIndexer::new(16, 1));
        let tsb = TsbConsumer::new(ring, indexer);
        let psi = PsiParser::start(4, None);
        StreamProcessor::new(tsb, psi)
    }

    #[test]
    fn on_open_fans_out_to_every_consumer() {
        let processor = new_processor();
        processor.on_open("chan1");
        // TSB consumer is streaming iff on_open ran.
        if let Consumer::Tsb(tsb) = &processor.consumers[0] {
            assert!(tsb.is_streaming());
        } else {
            unreachable!();
        }
    }

    #[test]
    fn ecm_cache_clears_mvars_on_open() {
        mvar::write(ids::ECM0, MvarValue::Bytes(vec![1, 2, 3]));
        EcmCache.on_open("chan2");
        assert_eq!(mvar::read(ids::ECM0), MvarValue::Bytes(Vec::new()));
    }

    #[test]
    fn posting_through_the_processor_is_readable_back_from_the_tsb() {
        let ring = Arc::new(RingBufferPool::new(16, 4, 2));
        let indexer = Arc::new(BufferIndexer::new(16, 1));
        let tsb = TsbConsumer::new(ring, indexer);
        let psi = PsiParser::start(4, None);
        let processor = StreamProcessor::new(tsb.clone(), psi);

        processor.on_open("chan3");
        processor.post(&[1, 2, 3, 4]);
        tsb.set_seek_time(0, 3_600_000).unwrap();
        processor.post(&[5, 6, 7, 8]);

        let mut dst = [0u8; 4];
        assert_eq!(tsb.read_data(1, &mut dst), 4);
        assert_eq!(dst, [5, 6, 7, 8]);
    }
}
