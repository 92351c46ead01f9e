use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;

use super::SinkTransport;

/// A stalled receiver is dropped after this long instead of blocking the
/// session's send thread.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// RTP/RTCP over a TCP connection, framed per RFC 4571.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |             LENGTH            |  RTP or RTCP packet ...       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// RTP and RTCP share the connection (RFC 5761 demultiplexing applies).
/// A partial write would corrupt the framing, so write timeouts are
/// reported as [`io::ErrorKind::TimedOut`], which removes the sink.
#[derive(Debug)]
pub struct StreamSink {
    stream: Mutex<TcpStream>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl StreamSink {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream: Mutex::new(stream),
            local,
            peer,
        })
    }

    /// Actively connect to a receiver.
    pub fn connect(peer: SocketAddr) -> Result<Self> {
        Self::new(TcpStream::connect(peer)?)
    }
}

impl SinkTransport for StreamSink {
    fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let length = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet exceeds RFC 4571 frame"))?;

        let mut frame = Vec::with_capacity(2 + packet.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(packet);

        match self.stream.lock().write_all(&frame) {
            Ok(()) => Ok(packet.len()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, e))
            }
            Err(e) => Err(e),
        }
    }

    fn is_datagram(&self) -> bool {
        false
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn frames_packets_with_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sink = StreamSink::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        sink.send(&[1, 2, 3]).unwrap();
        sink.send(&[4]).unwrap();

        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 3, 1, 2, 3, 0, 1, 4]);
        assert!(!sink.is_datagram());
    }

    #[test]
    fn oversized_packet_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sink = StreamSink::connect(listener.local_addr().unwrap()).unwrap();
        let err = sink.send(&vec![0; 70_000]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
