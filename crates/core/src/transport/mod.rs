//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! The streaming core only talks to the network through two seams:
//!
//! - **[`SinkTransport`]**: where RTP and RTCP packets go. Implemented by
//!   [`udp::UdpSink`] (connected unicast/multicast datagrams),
//!   [`stream::StreamSink`] (RFC 4571 framing over TCP) and
//!   [`memory::MemoryTransport`] (in-process capture).
//!
//! - **[`TransportServer`]**: per-path registration of RTSP
//!   [`RequestHandler`]s. The RTSP negotiator and the VoD serializer
//!   register on it and never see sockets. [`crate::mount::MountRegistry`]
//!   implements it, and [`tcp::RtspListener`] serves the registry over TCP
//!   with a thread per connection.

pub mod memory;
pub mod stream;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{RtspRequest, RtspResponse};

pub use memory::MemoryTransport;
pub use stream::StreamSink;
pub use tcp::RtspListener;
pub use udp::UdpSink;

/// Outbound packet transport of one sink.
///
/// `send` is called from the session's send thread and, for RTCP BYE,
/// from whichever thread removes the sink.
pub trait SinkTransport: Send + Sync + fmt::Debug {
    /// Send one complete RTP or RTCP packet.
    fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Datagram transports get one retry on ICMP-reported soft errors.
    fn is_datagram(&self) -> bool {
        true
    }

    /// Local address, used as the RTCP CNAME.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Answers RTSP requests for one path.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &RtspRequest, client: SocketAddr) -> RtspResponse;

    /// Drop client sessions that stopped sending requests.
    fn reap_expired(&self) {}
}

/// Path-keyed registry of RTSP handlers (the embedded server's callback
/// table).
pub trait TransportServer: Send + Sync {
    /// Fails if `path` is already registered.
    fn register(&self, path: &str, handler: Arc<dyn RequestHandler>) -> Result<()>;

    /// Returns `false` if nothing was registered at `path`.
    fn unregister(&self, path: &str) -> bool;
}
