//! UDP socket wrapper supporting unicast and multicast ingest, built on
//! `socket2` for the join-multicast and reuse-address setup stdlib sockets
//! don't expose.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// A bound UDP socket used by a source listener thread.
pub struct IngestSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl IngestSocket {
    /// Bind to `local_addr`, optionally joining a multicast group on
    /// `interface`. `group` is `None` for plain unicast/RTP-unicast sources.
    pub fn bind(
        local_addr: SocketAddrV4,
        group: Option<Ipv4Addr>,
        interface: Ipv4Addr,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);

        if let Some(group) = group {
            socket.join_multicast_v4(&group, &interface)?;
        }

        let socket: UdpSocket = socket.into();
        let actual_local = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv4 only"))
            }
        };

        Ok(Self {
            socket,
            local_addr: actual_local,
        })
    }

    /// Receive one datagram. `WouldBlock`/`TimedOut` are expected idle
    /// results, not errors — callers should treat them as "no data yet".
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            local_addr: self.local_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_unicast_assigns_ephemeral_port() {
        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let socket = IngestSocket::bind(local, None, Ipv4Addr::UNSPECIFIED).unwrap();
        assert_ne!(socket.local_addr().port(), 0);
    }
}
