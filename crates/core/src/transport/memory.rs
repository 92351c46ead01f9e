use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use parking_lot::Mutex;

use super::SinkTransport;

/// In-process sink that records every packet.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next) (one-shot,
/// queued in order) or [`fail_always`](Self::fail_always) to exercise the
/// session's per-sink error handling without sockets.
#[derive(Debug)]
pub struct MemoryTransport {
    datagram: bool,
    local: Option<SocketAddr>,
    sent: Mutex<Vec<Vec<u8>>>,
    queued_failures: Mutex<VecDeque<io::ErrorKind>>,
    permanent_failure: Mutex<Option<io::ErrorKind>>,
}

impl MemoryTransport {
    /// A datagram-style transport.
    pub fn new() -> Self {
        Self {
            datagram: true,
            local: None,
            sent: Mutex::new(Vec::new()),
            queued_failures: Mutex::new(VecDeque::new()),
            permanent_failure: Mutex::new(None),
        }
    }

    /// A connection-oriented transport (no ICMP soft-error retries).
    pub fn stream() -> Self {
        Self {
            datagram: false,
            ..Self::new()
        }
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr);
        self
    }

    /// Make the next `send` fail once with `kind`.
    pub fn fail_next(&self, kind: io::ErrorKind) {
        self.queued_failures.lock().push_back(kind);
    }

    /// Make every `send` fail with `kind` until [`recover`](Self::recover).
    pub fn fail_always(&self, kind: io::ErrorKind) {
        *self.permanent_failure.lock() = Some(kind);
    }

    pub fn recover(&self) {
        *self.permanent_failure.lock() = None;
        self.queued_failures.lock().clear();
    }

    /// Copy of every packet sent so far.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Remove and return every packet sent so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkTransport for MemoryTransport {
    fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if let Some(kind) = *self.permanent_failure.lock() {
            return Err(io::Error::from(kind));
        }
        if let Some(kind) = self.queued_failures.lock().pop_front() {
            return Err(io::Error::from(kind));
        }
        self.sent.lock().push(packet.to_vec());
        Ok(packet.len())
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}
