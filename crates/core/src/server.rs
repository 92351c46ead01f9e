use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::announce::{FileAnnouncer, SdpAnnouncer};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StreamError};
use crate::media::{Block, EsDescriptor, FormatOptions, resolve_format_with};
use crate::mount::{DEFAULT_MOUNT_PATH, MountRegistry};
use crate::protocol::Negotiator;
use crate::protocol::sdp::{self, SdpSession};
use crate::rtcp::ntp_now;
use crate::rtp::{DEFAULT_CACHING_MS, DEFAULT_MTU, NptReference, Protocol, RtpSession, SessionConfig};
use crate::session::DEFAULT_SESSION_TIMEOUT_SECS;
use crate::transport::{RtspListener, TransportServer};

/// Default base port for static destinations (RFC 3551 §8).
pub const DEFAULT_BASE_PORT: u16 = 5004;

/// RTSP settings used by the negotiator and its listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// Listen address of the RTSP TCP listener.
    pub bind: String,
    /// Mount path of the live output.
    pub path: String,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// Idle client sessions are torn down after this many seconds.
    pub timeout_secs: u64,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8554".to_string(),
            path: DEFAULT_MOUNT_PATH.to_string(),
            public_host: None,
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
        }
    }
}

/// Settings of one streaming output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Static unicast or multicast destination every stream is sent to.
    pub destination: Option<IpAddr>,
    /// Base port. Stream `n` uses `port + 2n`, RTCP the next one up.
    pub port: u16,
    /// TTL for the static destination.
    pub ttl: Option<u32>,
    pub protocol: Protocol,
    pub mtu: usize,
    pub caching_ms: u64,
    pub rtcp_mux: bool,
    pub format: FormatOptions,
    /// Serve the output over RTSP.
    pub rtsp: Option<RtspConfig>,
    /// Publish the SDP to this file whenever the stream set changes.
    pub sdp_file: Option<PathBuf>,
    pub session_name: String,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            destination: None,
            port: DEFAULT_BASE_PORT,
            ttl: None,
            protocol: Protocol::Udp,
            mtu: DEFAULT_MTU,
            caching_ms: DEFAULT_CACHING_MS,
            rtcp_mux: false,
            format: FormatOptions::default(),
            rtsp: None,
            sdp_file: None,
            session_name: "Stream".to_string(),
        }
    }
}

/// Handle of one elementary stream of a [`Streamer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "es-{}", self.0)
    }
}

struct Stream {
    id: StreamId,
    track_id: Option<u32>,
    session: Arc<RtpSession>,
}

struct RtspOutput {
    negotiator: Arc<Negotiator>,
    mounts: MountRegistry,
    path: String,
    listener: Mutex<Option<RtspListener>>,
}

/// A streaming output: one RTP session per elementary stream, sharing
/// one NPT reference, optionally served over RTSP.
///
/// ```text
///  add_stream(es) ──► resolve format ──► RtpSession ──► static sink?
///                                             │
///                                             └──► RTSP track
///  send(id, block) ─────────────────────────► RtpSession::send
/// ```
pub struct Streamer {
    config: StreamerConfig,
    clock: Arc<dyn Clock>,
    npt: Arc<NptReference>,
    streams: RwLock<Vec<Stream>>,
    next_index: AtomicU32,
    sdp_cache: Mutex<Option<String>>,
    sdp_session_id: u64,
    sdp_version: AtomicU64,
    rtsp: Option<RtspOutput>,
    announcer: Option<Box<dyn SdpAnnouncer>>,
}

impl Streamer {
    pub fn new(config: StreamerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create an output paced by `clock`. Block timestamps are on the
    /// clock's timeline.
    pub fn with_clock(config: StreamerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.rtsp.is_none() && config.destination.is_none() && config.protocol != Protocol::Tcp {
            tracing::warn!("output has no destination and no RTSP access");
        }

        let rtsp = match &config.rtsp {
            Some(rtsp_config) => {
                let mounts = MountRegistry::new();
                let negotiator = Arc::new(Negotiator::new(&rtsp_config.path, Arc::new(rtsp_config.clone())));
                mounts.register(&rtsp_config.path, negotiator.clone())?;
                mounts.set_default(&rtsp_config.path);
                let listener = RtspListener::bind(&rtsp_config.bind, mounts.clone())?;
                Some(RtspOutput {
                    negotiator,
                    mounts,
                    path: rtsp_config.path.clone(),
                    listener: Mutex::new(Some(listener)),
                })
            }
            None => None,
        };

        let announcer = config
            .sdp_file
            .as_ref()
            .map(|path| Box::new(FileAnnouncer::new(path.clone())) as Box<dyn SdpAnnouncer>);

        let sdp_session_id = ntp_now() >> 32;
        Ok(Self {
            config,
            clock,
            npt: Arc::new(NptReference::new()),
            streams: RwLock::new(Vec::new()),
            next_index: AtomicU32::new(0),
            sdp_cache: Mutex::new(None),
            sdp_session_id,
            sdp_version: AtomicU64::new(sdp_session_id),
            rtsp,
            announcer,
        })
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Create the RTP session of a new elementary stream.
    ///
    /// Fails without side effects if the codec has no payload format or
    /// the session configuration is rejected.
    pub fn add_stream(&self, es: &EsDescriptor) -> Result<StreamId> {
        let format = resolve_format_with(es, &self.config.format)?;

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let port = self.stream_port(index)?;
        let session_config = SessionConfig {
            protocol: self.config.protocol,
            destination: self.config.destination.map(|ip| SocketAddr::new(ip, port)),
            ttl: self.config.ttl,
            port,
            rtcp_mux: self.config.rtcp_mux,
            mtu: self.config.mtu,
            caching_ms: self.config.caching_ms,
            ..Default::default()
        };

        let session = RtpSession::create(format, &session_config, self.npt.clone(), self.clock.clone())?;
        let track_id = self.rtsp.as_ref().map(|r| r.negotiator.add_track(session.clone()));

        let id = StreamId(index);
        tracing::info!(
            stream = %id,
            codec = ?es.codec,
            encoding = session.format().encoding,
            port = session.local_port(),
            track_id,
            "stream added"
        );
        self.streams.write().push(Stream { id, track_id, session });
        self.invalidate_sdp();
        Ok(id)
    }

    /// Port of the `index`-th stream. Only static destinations and COMEDIA
    /// listeners need one; RTSP clients get per-client ports.
    fn stream_port(&self, index: u32) -> Result<u16> {
        if self.config.destination.is_none() && self.config.protocol != Protocol::Tcp {
            return Ok(0);
        }
        if self.config.destination.is_none() && self.config.port == 0 {
            return Ok(0);
        }
        index
            .checked_mul(2)
            .and_then(|offset| u16::try_from(offset).ok())
            .and_then(|offset| self.config.port.checked_add(offset))
            .ok_or_else(|| StreamError::InvalidConfig(format!("no port left for stream {}", index)))
    }

    /// Queue one block of stream `id` for delivery.
    pub fn send(&self, id: StreamId, block: &Block) -> Result<()> {
        let session = self
            .streams
            .read()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.session.clone())
            .ok_or(StreamError::SessionClosed)?;
        session.send(block)
    }

    /// Destroy a stream's RTP session and withdraw its RTSP track.
    pub fn remove_stream(&self, id: StreamId) -> bool {
        let removed = {
            let mut streams = self.streams.write();
            match streams.iter().position(|s| s.id == id) {
                Some(pos) => streams.remove(pos),
                None => return false,
            }
        };
        if let (Some(rtsp), Some(track_id)) = (&self.rtsp, removed.track_id) {
            rtsp.negotiator.remove_track(track_id);
        }
        removed.session.destroy();
        tracing::info!(stream = %id, "stream removed");
        self.invalidate_sdp();
        true
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn session(&self, id: StreamId) -> Option<Arc<RtpSession>> {
        self.streams.read().iter().find(|s| s.id == id).map(|s| s.session.clone())
    }

    /// SDP of the whole output, regenerated only after the stream set
    /// changed.
    pub fn sdp(&self) -> String {
        let mut cache = self.sdp_cache.lock();
        if let Some(sdp) = cache.as_ref() {
            return sdp.clone();
        }

        let connection = self.config.destination.map_or_else(|| "0.0.0.0".to_string(), |ip| ip.to_string());
        let multicast = self.config.destination.is_some_and(|ip| ip.is_multicast());
        let session = SdpSession {
            session_id: self.sdp_session_id.to_string(),
            session_version: self.sdp_version.load(Ordering::SeqCst).to_string(),
            session_name: self.config.session_name.clone(),
            origin: connection.clone(),
            connection,
            ttl: self.config.ttl.filter(|_| multicast),
            ..Default::default()
        };
        let media: Vec<_> = self.streams.read().iter().map(|s| s.session.sdp_media()).collect();

        let sdp = sdp::generate(&session, &media);
        *cache = Some(sdp.clone());
        sdp
    }

    fn invalidate_sdp(&self) {
        self.sdp_cache.lock().take();
        self.sdp_version.fetch_add(1, Ordering::SeqCst);
        if let Some(announcer) = &self.announcer
            && let Err(e) = announcer.announce(&self.sdp())
        {
            tracing::warn!(error = %e, "failed to publish SDP");
        }
    }

    pub fn rtsp_addr(&self) -> Option<SocketAddr> {
        let rtsp = self.rtsp.as_ref()?;
        rtsp.listener.lock().as_ref().map(RtspListener::local_addr)
    }

    /// The live mount's negotiator, when RTSP is enabled.
    pub fn negotiator(&self) -> Option<&Arc<Negotiator>> {
        self.rtsp.as_ref().map(|r| &r.negotiator)
    }

    /// Stop RTSP, tear down every client and destroy every stream.
    /// Idempotent.
    pub fn close(&self) {
        if let Some(rtsp) = &self.rtsp
            && let Some(mut listener) = rtsp.listener.lock().take()
        {
            listener.stop();
            rtsp.mounts.unregister(&rtsp.path);
            rtsp.negotiator.close();
        }

        let streams: Vec<_> = self.streams.write().drain(..).collect();
        for stream in &streams {
            stream.session.destroy();
        }

        if let Some(announcer) = &self.announcer
            && let Err(e) = announcer.withdraw()
        {
            tracing::warn!(error = %e, "failed to withdraw SDP");
        }
        if !streams.is_empty() {
            tracing::info!(streams = streams.len(), "output closed");
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::Codec;

    fn config(destination: Option<&str>, port: u16) -> StreamerConfig {
        StreamerConfig {
            destination: destination.map(|d| d.parse().unwrap()),
            port,
            ..Default::default()
        }
    }

    fn streamer(config: StreamerConfig) -> Streamer {
        Streamer::with_clock(config, Arc::new(ManualClock::new(0))).unwrap()
    }

    fn pcmu() -> EsDescriptor {
        EsDescriptor::audio(Codec::Mulaw, 8000, 1)
    }

    #[test]
    fn ports_follow_stream_index() {
        let s = streamer(config(Some("127.0.0.1"), 45000));
        let a = s.add_stream(&pcmu()).unwrap();
        let b = s.add_stream(&pcmu()).unwrap();
        assert_eq!(s.session(a).unwrap().local_port(), 45000);
        assert_eq!(s.session(b).unwrap().local_port(), 45002);

        let sdp = s.sdp();
        assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(sdp.contains("m=audio 45000 RTP/AVP 0\r\n"));
        assert!(sdp.contains("m=audio 45002 RTP/AVP 0\r\n"));

        // Indices are never reused.
        assert!(s.remove_stream(a));
        let c = s.add_stream(&pcmu()).unwrap();
        assert_eq!(s.session(c).unwrap().local_port(), 45004);
    }

    #[test]
    fn sdp_cached_until_stream_set_changes() {
        let s = streamer(config(Some("127.0.0.1"), 46000));
        let id = s.add_stream(&pcmu()).unwrap();
        let first = s.sdp();
        assert_eq!(first, s.sdp());

        assert!(s.remove_stream(id));
        assert!(!s.remove_stream(id));
        let second = s.sdp();
        assert_ne!(first, second);
        assert!(!second.contains("m=audio"));
        assert_eq!(s.stream_count(), 0);
    }

    #[test]
    fn rejected_stream_leaves_output_untouched() {
        let s = streamer(StreamerConfig {
            protocol: Protocol::Dccp,
            ..config(Some("127.0.0.1"), 47000)
        });
        assert!(matches!(s.add_stream(&pcmu()), Err(StreamError::UnsupportedProtocol(_))));

        let s = streamer(config(Some("127.0.0.1"), 47001));
        assert!(matches!(s.add_stream(&pcmu()), Err(StreamError::PortConflict(47001))));
        assert_eq!(s.stream_count(), 0);
    }

    #[test]
    fn send_to_removed_stream_fails() {
        let s = streamer(config(Some("127.0.0.1"), 48000));
        let id = s.add_stream(&pcmu()).unwrap();
        s.remove_stream(id);
        let block = Block::new(vec![0xff; 160], 0);
        assert!(matches!(s.send(id, &block), Err(StreamError::SessionClosed)));
    }

    #[test]
    fn rtsp_tracks_follow_streams() {
        let s = streamer(StreamerConfig {
            rtsp: Some(RtspConfig {
                bind: "127.0.0.1:0".to_string(),
                ..Default::default()
            }),
            ..config(None, 0)
        });
        assert!(s.rtsp_addr().is_some());

        let a = s.add_stream(&pcmu()).unwrap();
        s.add_stream(&pcmu()).unwrap();
        assert_eq!(s.negotiator().unwrap().track_ids(), vec![0, 1]);
        assert_eq!(s.session(a).unwrap().local_port(), 0);

        s.remove_stream(a);
        assert_eq!(s.negotiator().unwrap().track_ids(), vec![1]);

        s.close();
        assert!(s.rtsp_addr().is_none());
        assert_eq!(s.stream_count(), 0);
    }
}
