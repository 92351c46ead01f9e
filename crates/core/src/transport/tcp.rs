use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::mount::MountRegistry;
use crate::protocol::{RtspRequest, RtspResponse};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Requests larger than this are not RTSP control traffic.
const MAX_BODY: usize = 64 * 1024;

/// RTSP-over-TCP front end for a [`MountRegistry`].
///
/// One accept thread plus one thread per client connection. The accept
/// thread also expires idle sessions on every mount about once a second.
pub struct RtspListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RtspListener {
    pub fn bind(addr: &str, mounts: MountRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let handle = thread::Builder::new()
            .name("rtsp-accept".to_string())
            .spawn(move || accept_loop(listener, mounts, r))?;

        tracing::info!(addr = %local_addr, "RTSP listener started");
        Ok(Self {
            running,
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait for the accept thread. Open connections
    /// close at their next read timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            tracing::info!(addr = %self.local_addr, "RTSP listener stopped");
        }
    }
}

impl Drop for RtspListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`RtspListener::stop`] can terminate it promptly.
fn accept_loop(listener: TcpListener, mounts: MountRegistry, running: Arc<AtomicBool>) {
    let mut last_reap = Instant::now();
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let m = mounts.clone();
                let r = running.clone();
                let spawned = thread::Builder::new()
                    .name("rtsp-conn".to_string())
                    .spawn(move || Connection::handle(stream, m, r));
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(e) => thread::sleep(accept_retry_delay(&e, &running, "RTSP")),
        }

        if last_reap.elapsed() >= REAP_INTERVAL {
            mounts.reap_expired();
            last_reap = Instant::now();
        }
    }
    tracing::debug!("accept loop exited");
}

/// Wait before the next accept after `e`.
///
/// `WouldBlock` only means no client is pending. Anything else (fd
/// exhaustion, aborted handshakes) is logged while `running` and waits the
/// same poll interval, so a persistent failure cannot spin the thread.
pub(crate) fn accept_retry_delay(e: &io::Error, running: &AtomicBool, listener: &str) -> Duration {
    if e.kind() != io::ErrorKind::WouldBlock && running.load(Ordering::SeqCst) {
        tracing::warn!(listener, error = %e, "accept error");
    }
    ACCEPT_POLL
}

/// A single RTSP client connection with its own lifecycle.
///
/// RTSP sessions outlive the connection: they end on TEARDOWN or when
/// their mount expires them.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    mounts: MountRegistry,
    peer_addr: SocketAddr,
}

enum Incoming {
    Request(String),
    Closed(&'static str),
}

impl Connection {
    fn handle(stream: TcpStream, mounts: MountRegistry, running: Arc<AtomicBool>) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
            return;
        }
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            mounts,
            peer_addr,
        };

        let reason = conn.run(&running);
        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        loop {
            let text = match self.read_message(running) {
                Incoming::Request(text) => text,
                Incoming::Closed(reason) => return reason,
            };
            if text.trim().is_empty() {
                continue;
            }

            let mut request = match RtspRequest::parse(&text) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    if self.write(&RtspResponse::bad_request()).is_err() {
                        return "write error";
                    }
                    continue;
                }
            };

            let length = match request.content_length() {
                Ok(length) if length <= MAX_BODY => length,
                _ => {
                    let resp = RtspResponse::bad_request().add_header("CSeq", request.cseq().unwrap_or("0"));
                    let _ = self.write(&resp);
                    return "bad content length";
                }
            };
            if length > 0 {
                let mut body = vec![0u8; length];
                if self.read_body(&mut body, running).is_err() {
                    return "read error";
                }
                request.body = Some(String::from_utf8_lossy(&body).into_owned());
            }

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                version = %request.version,
                "request"
            );

            let response = match self.mounts.resolve_from_uri(&request.uri) {
                Some(handler) => handler.handle(&request, self.peer_addr),
                None => {
                    tracing::warn!(uri = %request.uri, "no mount for request");
                    RtspResponse::not_found().add_header("CSeq", request.cseq().unwrap_or("0"))
                }
            };

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if self.write(&response).is_err() {
                return "write error";
            }
        }
    }

    /// Read a request line and headers, up to the blank line.
    fn read_message(&mut self, running: &AtomicBool) -> Incoming {
        let mut text = String::new();
        let mut line = String::new();
        loop {
            if !running.load(Ordering::SeqCst) {
                return Incoming::Closed("server shutting down");
            }
            match self.reader.read_line(&mut line) {
                Ok(0) => return Incoming::Closed("connection closed by client"),
                Ok(_) => {
                    let blank = line == "\r\n" || line == "\n";
                    text.push_str(&line);
                    line.clear();
                    if blank {
                        return Incoming::Request(text);
                    }
                }
                // A partial line stays in `line` across timeouts.
                Err(ref e) if is_timeout(e) => continue,
                Err(_) => return Incoming::Closed("read error"),
            }
        }
    }

    fn read_body(&mut self, body: &mut [u8], running: &AtomicBool) -> io::Result<()> {
        let mut filled = 0;
        while filled < body.len() {
            if !running.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::Interrupted.into());
            }
            match self.reader.read(&mut body[filled..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write(&mut self, response: &RtspResponse) -> io::Result<()> {
        self.writer.write_all(response.serialize().as_bytes())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
