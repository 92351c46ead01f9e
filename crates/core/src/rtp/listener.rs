use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::Result;
use crate::transport::StreamSink;
use crate::transport::tcp::accept_retry_delay;

use super::sink::SinkSet;

/// Passive TCP endpoint of a COMEDIA session (RFC 4145 `setup:passive`).
///
/// Every inbound connection becomes a sink carrying both RTP and RTCP.
pub(crate) struct ComediaListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ComediaListener {
    pub(crate) fn bind(port: u16, sinks: Arc<SinkSet>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let handle = thread::Builder::new()
            .name(format!("comedia-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, sinks, r))?;

        tracing::info!(%local_addr, "COMEDIA listener started");
        Ok(Self {
            running,
            handle: Some(handle),
            local_addr,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ComediaListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Checks the `running` flag between accepts, waiting one poll interval
/// after an idle or failed accept.
fn accept_loop(listener: TcpListener, sinks: Arc<SinkSet>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sink = match StreamSink::new(stream) {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "COMEDIA connection setup failed");
                        continue;
                    }
                };
                if sinks.add(sink.clone(), Some(sink)).is_err() {
                    break;
                }
            }
            Err(e) => thread::sleep(accept_retry_delay(&e, &running, "COMEDIA")),
        }
    }
    tracing::debug!("COMEDIA accept loop exited");
}
