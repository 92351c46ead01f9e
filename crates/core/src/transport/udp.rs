use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::error::Result;

use super::SinkTransport;

/// Attempts at binding an adjacent even/odd local port pair.
const PAIR_BIND_ATTEMPTS: usize = 8;

/// UDP sink for RTP or RTCP delivery.
///
/// The socket is connected to its peer, so ICMP port-unreachable and
/// similar errors come back on the next `send` and the session can tell a
/// vanished receiver from a full buffer.
///
/// This layer is address-only and does not know about sessions. The
/// caller resolves the destination before constructing the sink.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpSink {
    /// Connect an ephemeral socket to `peer`.
    ///
    /// `ttl` sets the multicast TTL for multicast peers and the unicast
    /// TTL otherwise.
    pub fn connect(peer: SocketAddr, ttl: Option<u32>) -> Result<Self> {
        Self::connect_from(SocketAddr::new(unspecified(peer.ip()), 0), peer, ttl)
    }

    /// Connect a socket bound to `local` to `peer`.
    pub fn connect_from(local: SocketAddr, peer: SocketAddr, ttl: Option<u32>) -> Result<Self> {
        let socket = UdpSocket::bind(local)?;
        if let Some(ttl) = ttl {
            match peer.ip() {
                IpAddr::V4(ip) if ip.is_multicast() => socket.set_multicast_ttl_v4(ttl)?,
                // IPv6 multicast hop limit has no std setter; the default (1) applies.
                IpAddr::V6(ip) if ip.is_multicast() => {}
                _ => socket.set_ttl(ttl)?,
            }
        }
        socket.connect(peer)?;
        tracing::debug!(%peer, local = ?socket.local_addr().ok(), "UDP sink connected");
        Ok(Self { socket, peer })
    }

    /// Open an RTP sink to `rtp_peer` and an RTCP sink to `rtcp_peer` on
    /// adjacent local ports (RTP even, RTCP = RTP + 1) when possible.
    ///
    /// Falls back to two unrelated ephemeral ports if no pair is free.
    pub fn pair(rtp_peer: SocketAddr, rtcp_peer: SocketAddr) -> Result<(Self, Self)> {
        let any = unspecified(rtp_peer.ip());
        for _ in 0..PAIR_BIND_ATTEMPTS {
            let rtp = Self::connect(rtp_peer, None)?;
            let port = rtp.socket.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            if let Ok(rtcp) = Self::connect_from(SocketAddr::new(any, port + 1), rtcp_peer, None) {
                return Ok((rtp, rtcp));
            }
        }
        tracing::debug!(%rtp_peer, "no adjacent port pair free, using unrelated ports");
        Ok((Self::connect(rtp_peer, None)?, Self::connect(rtcp_peer, None)?))
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl SinkTransport for UdpSink {
    fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send(packet)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

fn unspecified(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
