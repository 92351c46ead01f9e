//! Sink list of one RTP session and per-sink send-error policy.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StreamError};
use crate::rtcp::RtcpReporter;
use crate::transport::SinkTransport;

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const ENOBUFS: i32 = 55;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "freebsd")))]
const ENOBUFS: i32 = -1;

/// Identifies a sink within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Outcome of delivering one packet to one sink.
#[derive(Debug)]
pub(crate) enum Delivery {
    Sent,
    /// Retry failed with a transient error. The packet is lost for this
    /// sink only.
    Dropped,
    /// The sink is unusable and must be removed.
    Failed(io::Error),
}

/// Errors that a full socket buffer or a busy kernel can produce.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::OutOfMemory
    ) || e.raw_os_error() == Some(ENOBUFS)
}

/// ICMP errors reported on connected datagram sockets. The receiver may
/// come back, so they do not kill the sink.
pub(crate) fn is_soft_icmp(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable
    )
}

fn is_retryable(e: &io::Error, datagram: bool) -> bool {
    is_transient(e) || (datagram && is_soft_icmp(e))
}

/// Send with at most one retry.
pub(crate) fn deliver(transport: &dyn SinkTransport, packet: &[u8]) -> Delivery {
    let datagram = transport.is_datagram();
    match transport.send(packet) {
        Ok(_) => Delivery::Sent,
        Err(e) if is_retryable(&e, datagram) => match transport.send(packet) {
            Ok(_) => Delivery::Sent,
            Err(e) if is_retryable(&e, datagram) => Delivery::Dropped,
            Err(e) => Delivery::Failed(e),
        },
        Err(e) => Delivery::Failed(e),
    }
}

struct SinkInner {
    rtp: Option<Arc<dyn SinkTransport>>,
    rtcp: Option<RtcpReporter>,
}

/// One destination of an RTP session: an RTP transport and its optional
/// RTCP reporter.
///
/// After [`close`](Self::close) returns, nothing more is sent on the RTP
/// transport.
pub struct Sink {
    id: SinkId,
    inner: Mutex<SinkInner>,
}

impl Sink {
    fn new(id: SinkId, rtp: Arc<dyn SinkTransport>, rtcp: Option<Arc<dyn SinkTransport>>, tool: &str) -> Self {
        Self {
            id,
            inner: Mutex::new(SinkInner {
                rtp: Some(rtp),
                rtcp: rtcp.map(|t| RtcpReporter::open(t, tool)),
            }),
        }
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Deliver `wire` and account the cleartext `rtp` packet in RTCP.
    pub(crate) fn send(&self, wire: &[u8], rtp: &[u8]) -> Delivery {
        let mut inner = self.inner.lock();
        let Some(transport) = inner.rtp.clone() else {
            return Delivery::Dropped;
        };
        let delivery = deliver(transport.as_ref(), wire);
        if let (Delivery::Sent, Some(reporter)) = (&delivery, inner.rtcp.as_mut()) {
            reporter.on_rtp_sent(rtp);
        }
        delivery
    }

    /// Send RTCP BYE and release both transports. Returns `false` if the
    /// sink was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if let Some(mut reporter) = inner.rtcp.take() {
            reporter.close();
        }
        inner.rtp.take().is_some()
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").field("id", &self.id).finish()
    }
}

/// Sink list of one session.
///
/// The send thread iterates a snapshot, so adding or removing a sink never
/// waits for a send in progress on another sink.
#[derive(Debug)]
pub(crate) struct SinkSet {
    sinks: Mutex<SinkList>,
    next_id: AtomicU64,
    tool: String,
}

#[derive(Debug, Default)]
struct SinkList {
    sinks: Vec<Arc<Sink>>,
    closed: bool,
}

impl SinkSet {
    pub(crate) fn new(tool: impl Into<String>) -> Self {
        Self {
            sinks: Mutex::new(SinkList::default()),
            next_id: AtomicU64::new(1),
            tool: tool.into(),
        }
    }

    pub(crate) fn add(&self, rtp: Arc<dyn SinkTransport>, rtcp: Option<Arc<dyn SinkTransport>>) -> Result<SinkId> {
        let mut list = self.sinks.lock();
        if list.closed {
            return Err(StreamError::SessionClosed);
        }
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = rtp.peer_addr();
        list.sinks.push(Arc::new(Sink::new(id, rtp, rtcp, &self.tool)));
        tracing::info!(sink = %id, peer = ?peer, total = list.sinks.len(), "sink added");
        Ok(id)
    }

    pub(crate) fn remove(&self, id: SinkId) -> bool {
        let sink = {
            let mut list = self.sinks.lock();
            let pos = list.sinks.iter().position(|s| s.id == id);
            pos.map(|pos| list.sinks.remove(pos))
        };
        match sink {
            Some(sink) => {
                sink.close();
                tracing::info!(sink = %id, "sink removed");
                true
            }
            None => false,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Sink>> {
        self.sinks.lock().sinks.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.lock().sinks.len()
    }

    /// Close every sink and refuse new ones.
    pub(crate) fn close_all(&self) {
        let sinks = {
            let mut list = self.sinks.lock();
            list.closed = true;
            std::mem::take(&mut list.sinks)
        };
        for sink in sinks {
            sink.close();
        }
    }
}
