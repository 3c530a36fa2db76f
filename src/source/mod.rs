//! Media source listeners behind one capability set, §9 Design Notes
//! ("dynamic dispatch over demuxers/listeners" → a tagged variant, no
//! inheritance). `Udp`/`Rtp` are fully implemented; `Http`/`Dvb` are
//! interface-only stubs per §1's Non-goals.

pub mod dvb;
pub mod http;
pub mod udp;

use std::sync::Arc;

use crate::buffer::{BufferPool, IngressQueue};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
}

/// The shared capability set every demuxer/listener exposes, per §9.
pub trait Demuxer {
    fn open(&mut self, uri: &str, iface: &str) -> Result<()>;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);
    fn start(&mut self, queue: Arc<IngressQueue>, pool: Arc<BufferPool>) -> Result<()>;
    fn stats(&self) -> SourceStats;
    fn callback_handler(&self) -> Arc<dvb::DemuxerCallbackHandler>;
}

/// One capability set, four concrete shapes. No inheritance: callers match
/// or delegate through `Demuxer`, never downcast.
pub enum Source {
    Udp(udp::UdpSrc),
    Rtp(udp::UdpSrc),
    Http(http::HttpSrc),
    Dvb(dvb::DvbSrc),
}

impl Demuxer for Source {
    fn open(&mut self, uri: &str, iface: &str) -> Result<()> {
        match self {
            Source::Udp(s) | Source::Rtp(s) => s.open(uri, iface),
            Source::Http(s) => s.open(uri, iface),
            Source::Dvb(s) => s.open(uri, iface),
        }
    }

    fn connect(&mut self) -> Result<()> {
        match self {
            Source::Udp(s) | Source::Rtp(s) => s.connect(),
            Source::Http(s) => s.connect(),
            Source::Dvb(s) => s.connect(),
        }
    }

    fn disconnect(&mut self) {
        match self {
            Source::Udp(s) | Source::Rtp(s) => s.disconnect(),
            Source::Http(s) => s.disconnect(),
            Source::Dvb(s) => s.disconnect(),
        }
    }

    fn start(&mut self, queue: Arc<IngressQueue>, pool: Arc<BufferPool>) -> Result<()> {
        match self {
            Source::Udp(s) | Source::Rtp(s) => s.start(queue, pool),
            Source::Http(s) => s.start(queue, pool),
            Source::Dvb(s) => s.start(queue, pool),
        }
    }

    fn stats(&self) -> SourceStats {
        match self {
            Source::Udp(s) | Source::Rtp(s) => s.stats(),
            Source::Http(s) => s.stats(),
            Source::Dvb(s) => s.stats(),
        }
    }

    fn callback_handler(&self) -> Arc<dvb::DemuxerCallbackHandler> {
        match self {
            Source::Udp(s) | Source::Rtp(s) => s.callback_handler(),
            Source::Http(s) => s.callback_handler(),
            Source::Dvb(s) => s.callback_handler(),
        }
    }
}

/// Parse the `A.B.C.D[:port][/?sourceIp=E.F.G.H]` URI of §6.
pub fn parse_uri(uri: &str, default_port: u16) -> Result<(std::net::Ipv4Addr, u16, Option<std::net::Ipv4Addr>)> {
    use crate::error::EngineError;

    let (host_port, query) = match uri.split_once("/?") {
        Some((h, q)) => (h, Some(q)),
        None => (uri, None),
    };
    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| EngineError::InvalidUri(format!("bad port in {uri:?}")))?;
            (h, port)
        }
        None => (host_port, default_port),
    };
    let group: std::net::Ipv4Addr = host
        .parse()
        .map_err(|_| EngineError::InvalidUri(format!("bad host in {uri:?}")))?;

    let source_ip = match query {
        Some(q) => q
            .split('&')
            .find_map(|kv| kv.strip_prefix("sourceIp="))
            .map(|ip| {
                ip.parse()
                    .map_err(|_| EngineError::InvalidUri(format!("bad sourceIp in {uri:?}")))
            })
            .transpose()?,
        None => None,
    };

    Ok((group, port, source_ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_default_port() {
        let (host, port, src) = parse_uri("239.1.1.1", 8433).unwrap();
        assert_eq!(host.to_string(), "239.1.1.1");
        assert_eq!(port, 8433);
        assert_eq!(src, None);
    }

    #[test]
    fn parses_explicit_port_and_source_ip() {
        let (host, port, src) = parse_uri("239.1.1.1:9000/?sourceIp=10.0.0.5", 8433).unwrap();
        assert_eq!(host.to_string(), "239.1.1.1");
        assert_eq!(port, 9000);
        assert_eq!(src, Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn rejects_garbage_host() {
        assert!(parse_uri("not-an-ip", 8433).is_err());
    }
}
