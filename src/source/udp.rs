//! UDP multicast/unicast source, plain TS or RTP-encapsulated, run from a
//! dedicated socket listener thread (§4.1, §4.6).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::{BufferPool, IngressQueue};
use crate::error::{EngineError, Result};
use crate::rtp::{IngestSocket, RtpReassembler};
use crate::source::dvb::DemuxerCallbackHandler;
use crate::source::{parse_uri, Demuxer, SourceStats};

/// Largest UDP datagram this listener expects (one RTP/TS burst).
const RECV_BUF_SIZE: usize = 1500 * 4;

#[derive(Default)]
struct Counters {
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
}

/// A UDP listener. `rtp_encapsulated` selects whether datagrams carry a
/// 12-byte RTP header (reordered via [`RtpReassembler`]) or raw-aligned TS
/// packets, matching the `Udp`/`Rtp` variants of [`super::Source`].
pub struct UdpSrc {
    rtp_encapsulated: bool,
    group: Option<Ipv4Addr>,
    port: u16,
    iface: Ipv4Addr,
    socket: Option<IngestSocket>,
    counters: Arc<Counters>,
    handler: Arc<DemuxerCallbackHandler>,
    exit_requested: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    current_buffer: Arc<Mutex<Option<usize>>>,
}

impl UdpSrc {
    pub fn new(rtp_encapsulated: bool) -> Self {
        Self {
            rtp_encapsulated,
            group: None,
            port: crate::config::DEFAULT_SOURCE_PORT,
            iface: Ipv4Addr::UNSPECIFIED,
            socket: None,
            counters: Arc::new(Counters::default()),
            handler: DemuxerCallbackHandler::new(),
            exit_requested: Arc::new(AtomicBool::new(false)),
            listener: None,
            current_buffer: Arc::new(Mutex::new(None)),
        }
    }
}

impl Demuxer for UdpSrc {
    fn open(&mut self, uri: &str, iface: &str) -> Result<()> {
        let (group, port, _source_ip) = parse_uri(uri, crate::config::DEFAULT_SOURCE_PORT)?;
        self.iface = iface
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.group = Some(group);
        self.port = port;
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        let local = std::net::SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port);
        let socket = IngestSocket::bind(local, self.group, self.iface)
            .map_err(EngineError::TransientIo)?;
        log::info!(
            "udp source: bound on {:?}, group {:?} via {:?}",
            socket.local_addr(),
            self.group,
            self.iface
        );
        self.socket = Some(socket);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.exit_requested.store(true, Ordering::Release);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        self.socket = None;
        self.exit_requested.store(false, Ordering::Release);
    }

    fn start(&mut self, queue: Arc<IngressQueue>, pool: Arc<BufferPool>) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| EngineError::Fatal("udp source started before connect()".to_string()))?
            .try_clone()
            .map_err(EngineError::TransientIo)?;

        let exit = self.exit_requested.clone();
        let counters = self.counters.clone();
        let current_buffer = self.current_buffer.clone();
        let rtp_encapsulated = self.rtp_encapsulated;
        let handler = self.handler.clone();

        self.listener = Some(std::thread::spawn(move || {
            run_listener(socket, queue, pool, exit, counters, current_buffer, rtp_encapsulated, handler);
        }));
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
        }
    }

    fn callback_handler(&self) -> Arc<DemuxerCallbackHandler> {
        self.handler.clone()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_listener(
    socket: IngestSocket,
    queue: Arc<IngressQueue>,
    pool: Arc<BufferPool>,
    exit: Arc<AtomicBool>,
    counters: Arc<Counters>,
    current_buffer: Arc<Mutex<Option<usize>>>,
    rtp_encapsulated: bool,
    handler: Arc<DemuxerCallbackHandler>,
) {
    let mut reassembler = RtpReassembler::new();
    let mut recv_buf = vec![0u8; RECV_BUF_SIZE];

    while !exit.load(Ordering::Acquire) {
        let n = match socket.recv(&mut recv_buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::debug!("udp source: transient recv error: {e}");
                handler.notify_socket_error();
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        counters.packets_received.fetch_add(1, Ordering::Relaxed);

        let payloads: Vec<Vec<u8>> = if rtp_encapsulated {
            match reassembler.process(&recv_buf[..n]) {
                Ok(payloads) => payloads,
                Err(_) => {
                    log::warn!("udp source: RTP reorder cache overflow, stopping listener");
                    return;
                }
            }
        } else {
            vec![recv_buf[..n].to_vec()]
        };

        for payload in payloads {
            feed_payload(&queue, &pool, &current_buffer, &payload);
        }
    }
}

/// Copy `payload` into the accumulating producer buffer, flushing to the
/// ingress queue's fill half whenever a buffer reaches capacity and
/// spanning multiple buffers if needed.
fn feed_payload(
    queue: &IngressQueue,
    pool: &BufferPool,
    current_buffer: &Mutex<Option<usize>>,
    payload: &[u8],
) {
    let mut offset = 0usize;
    while offset < payload.len() {
        let id = {
            let mut guard = current_buffer.lock();
            match *guard {
                Some(id) => id,
                None => {
                    let Some(id) = queue.acquire_empty(Duration::from_millis(200)) else {
                        return;
                    };
                    {
                        let mut b = pool.lock(id);
                        b.size = 0;
                    }
                    *guard = Some(id);
                    id
                }
            }
        };

        let mut buffer = pool.lock(id);
        let space = buffer.capacity - buffer.size;
        let n = space.min(payload.len() - offset);
        let dst_start = buffer.size;
        buffer.payload[dst_start..dst_start + n].copy_from_slice(&payload[offset..offset + n]);
        buffer.size += n;
        offset += n;

        if buffer.size >= buffer.capacity {
            drop(buffer);
            queue.push_filled(id);
            *current_buffer.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_parses_group_and_port() {
        let mut src = UdpSrc::new(false);
        src.open("239.1.2.3:9000", "0.0.0.0").unwrap();
        assert_eq!(src.group, Some("239.1.2.3".parse().unwrap()));
        assert_eq!(src.port, 9000);
    }

    #[test]
    fn feed_payload_spans_and_flushes_a_full_buffer() {
        let pool = BufferPool::new(2, 8);
        let queue = IngressQueue::new(2);
        let current = Mutex::new(None);
        feed_payload(&queue, &pool, &current, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let filled = queue.pop_filled(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.lock(filled).size, 8);
        assert!(current.lock().is_some());
    }
}
