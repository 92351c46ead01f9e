use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpSession};
use crate::protocol::transport;
use crate::rtp::RtpSession;
use crate::server::RtspConfig;
use crate::session::{AttachedTrack, ClientSession, SessionManager, SessionState, TrackSelector};
use crate::transport::{RequestHandler, UdpSink};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";
const LIVE_AGGREGATE_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER";

/// Playback commands of an on-demand mount, forwarded from RTSP requests.
///
/// Implementations must not block; the VoD serializer only queues them.
pub trait PlaybackControl: Send + Sync {
    /// `start` is the `Range` npt start in seconds, when given.
    fn play(&self, session_id: &str, start: Option<f64>);
    fn pause(&self, session_id: &str);
    fn stop(&self, session_id: &str);
    fn seek(&self, session_id: &str, position: f64);
}

struct Track {
    id: u32,
    session: Arc<RtpSession>,
}

/// The request URI split into the aggregate URL and the addressed tracks.
struct Target {
    base: String,
    selector: TrackSelector,
}

/// RTSP state machine of one mount (RFC 2326 §A.1).
///
/// Each RTP session added with [`add_track`](Self::add_track) is exposed
/// as `<aggregate url>/trackID=<n>`. Client sessions attach tracks on
/// SETUP and hold one sink per playing track in the track's RTP session.
pub struct Negotiator {
    path: String,
    config: Arc<RtspConfig>,
    tracks: RwLock<Vec<Track>>,
    next_track_id: AtomicU32,
    sessions: SessionManager,
    playback: Option<Arc<dyn PlaybackControl>>,
    duration: Option<f64>,
}

impl Negotiator {
    pub fn new(path: &str, config: Arc<RtspConfig>) -> Self {
        let sessions = SessionManager::new(config.timeout_secs);
        Self {
            path: path.to_string(),
            config,
            tracks: RwLock::new(Vec::new()),
            next_track_id: AtomicU32::new(0),
            sessions,
            playback: None,
            duration: None,
        }
    }

    /// Back this mount with on-demand playback control.
    pub fn with_playback(mut self, playback: Arc<dyn PlaybackControl>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Media duration in seconds, announced as `a=range`.
    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Expose an RTP session as a new track. Returns its track id.
    pub fn add_track(&self, session: Arc<RtpSession>) -> u32 {
        let id = self.next_track_id.fetch_add(1, Ordering::SeqCst);
        self.tracks.write().push(Track { id, session });
        tracing::debug!(path = %self.path, track_id = id, "track added");
        id
    }

    /// Withdraw a track and detach it from every client session.
    pub fn remove_track(&self, id: u32) -> Option<Arc<RtpSession>> {
        let removed = {
            let mut tracks = self.tracks.write();
            let pos = tracks.iter().position(|t| t.id == id)?;
            tracks.remove(pos).session
        };
        let mut detached = 0;
        for client in self.sessions.all() {
            detached += client.detach_rtp_session(&removed);
        }
        tracing::debug!(path = %self.path, track_id = id, detached, "track removed");
        Some(removed)
    }

    pub fn track_ids(&self) -> Vec<u32> {
        self.tracks.read().iter().map(|t| t.id).collect()
    }

    fn track(&self, id: u32) -> Option<Arc<RtpSession>> {
        self.tracks.read().iter().find(|t| t.id == id).map(|t| t.session.clone())
    }

    /// SDP of every track, with control URLs under `base_url`.
    pub fn sdp(&self, base_url: &str, host: &str) -> String {
        let session = SdpSession {
            username: self.config.sdp_username.clone(),
            session_id: self.config.sdp_session_id.clone(),
            session_version: self.config.sdp_session_version.clone(),
            session_name: self.config.sdp_session_name.clone(),
            origin: host.to_string(),
            connection: host.to_string(),
            duration: self.duration,
            ..Default::default()
        };
        let media: Vec<_> = self
            .tracks
            .read()
            .iter()
            .map(|t| {
                let mut m = t.session.sdp_media();
                m.control = Some(format!("{}/trackID={}", base_url, t.id));
                m
            })
            .collect();
        sdp::generate(&session, &media)
    }

    /// Tear down every client session without notifying playback.
    pub fn close(&self) {
        for session in self.sessions.drain() {
            session.terminate();
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str, client: SocketAddr) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri.strip_prefix("rtsp://").or_else(|| uri.strip_prefix("rtsps://")) {
            let authority = after_scheme.split('/').next().unwrap_or("");
            let host = match authority.strip_prefix('[') {
                Some(v6) => v6.split(']').next().unwrap_or(""),
                None => authority.split(':').next().unwrap_or(""),
            }
            .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        client.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, target: &Target, uri: &str, client: SocketAddr) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");
        if target.selector != TrackSelector::All {
            return RtspResponse::status(459).add_header("CSeq", cseq);
        }

        let host = self.host_from_uri_or_client(uri, client);
        let sdp = self.sdp(&target.base, &host);

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &format!("{}/", target.base))
            .with_body(sdp)
    }

    fn handle_setup(
        &self,
        cseq: &str,
        target: &Target,
        request: &RtspRequest,
        session: Option<Arc<ClientSession>>,
        client: SocketAddr,
    ) -> RtspResponse {
        let TrackSelector::Track(track_id) = target.selector else {
            tracing::warn!(uri = %request.uri, "SETUP on aggregate URL");
            return RtspResponse::status(459).add_header("CSeq", cseq);
        };
        let Some(rtp) = self.track(track_id) else {
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };
        if extract_session_id(request).is_some() && session.is_none() {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
        };

        let (attached, reply) = if let Some((group, port, ttl)) = rtp.multicast_group() {
            (
                AttachedTrack::multicast(track_id, rtp.clone()),
                transport::multicast_reply(group, port, ttl),
            )
        } else {
            let Some(spec) = transport::alternatives(transport_header).find(|s| !s.multicast) else {
                tracing::warn!(%cseq, transport = transport_header, "no acceptable transport");
                return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
            };
            let Some((lo, hi)) = spec.client_port else {
                return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
            };
            let peer = client.ip();
            let (rtp_sink, rtcp_sink) = match UdpSink::pair(SocketAddr::new(peer, lo), SocketAddr::new(peer, hi)) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, %peer, "failed to open client sink");
                    return RtspResponse::internal_error().add_header("CSeq", cseq);
                }
            };
            let reply = transport::unicast_reply((lo, hi), (rtp_sink.local_port(), rtcp_sink.local_port()), rtp.ssrc());
            (
                AttachedTrack::unicast(track_id, rtp.clone(), Arc::new(rtp_sink), Some(Arc::new(rtcp_sink))),
                reply,
            )
        };

        let session = session.unwrap_or_else(|| self.sessions.create_session());
        session.attach(attached);

        tracing::info!(
            session_id = %session.id,
            path = %self.path,
            track_id,
            client = %client,
            "track set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &reply)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&self, cseq: &str, target: &Target, request: &RtspRequest, session: Option<Arc<ClientSession>>) -> RtspResponse {
        let Some(session) = session else {
            tracing::warn!(%cseq, "PLAY without valid session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if let TrackSelector::Track(id) = target.selector
            && !session.has_track(id)
        {
            return RtspResponse::status(455).add_header("CSeq", cseq);
        }

        let was_playing = session.state() == SessionState::Playing;
        if let Err(e) = session.play(target.selector) {
            tracing::error!(session_id = %session.id, error = %e, "PLAY failed");
            return RtspResponse::internal_error().add_header("CSeq", cseq);
        }

        let start = request.get_header("Range").and_then(parse_npt_start);
        if let Some(playback) = &self.playback {
            match (was_playing, start) {
                (true, Some(position)) => playback.seek(&session.id, position),
                (true, None) => {}
                (false, start) => playback.play(&session.id, start),
            }
        }

        let active = session.active_tracks(target.selector);
        let npt = active.first().and_then(|(_, rtp)| rtp.npt_now()).unwrap_or(0);
        let rtp_info: Vec<String> = active
            .iter()
            .map(|(id, rtp)| {
                let (seq, rtptime) = rtp.rtp_info();
                format!("url={}/trackID={};seq={};rtptime={}", target.base, id, seq, rtptime)
            })
            .collect();

        tracing::info!(session_id = %session.id, tracks = active.len(), "session playing");

        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", &format!("npt={:.3}-", npt as f64 / 1_000_000.0));
        if !rtp_info.is_empty() {
            resp = resp.add_header("RTP-Info", &rtp_info.join(","));
        }
        resp
    }

    fn handle_pause(&self, cseq: &str, target: &Target, session: Option<Arc<ClientSession>>) -> RtspResponse {
        let Some(session) = session else {
            tracing::warn!(%cseq, "PAUSE without valid session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match (target.selector, &self.playback) {
            (TrackSelector::All, None) => {
                return RtspResponse::status(405)
                    .add_header("CSeq", cseq)
                    .add_header("Allow", LIVE_AGGREGATE_METHODS);
            }
            (TrackSelector::All, Some(playback)) => {
                session.pause(TrackSelector::All);
                playback.pause(&session.id);
            }
            (TrackSelector::Track(id), _) => {
                if !session.has_track(id) {
                    return RtspResponse::status(455).add_header("CSeq", cseq);
                }
                session.pause(target.selector);
            }
        }

        tracing::info!(session_id = %session.id, state = ?session.state(), "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&self, cseq: &str, target: &Target, session: Option<Arc<ClientSession>>) -> RtspResponse {
        let Some(session) = session else {
            tracing::debug!(%cseq, "TEARDOWN without valid session");
            return RtspResponse::ok().add_header("CSeq", cseq);
        };

        let remaining = session.detach(target.selector);
        if remaining == 0 {
            self.end_session(&session);
            tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
        }
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, session: Option<Arc<ClientSession>>) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(session) = session {
            resp = resp.add_header("Session", &session.session_header_value());
        }
        resp
    }

    fn end_session(&self, session: &ClientSession) {
        self.sessions.remove_session(&session.id);
        session.terminate();
        if let Some(playback) = &self.playback {
            playback.stop(&session.id);
        }
    }
}

impl RequestHandler for Negotiator {
    fn handle(&self, request: &RtspRequest, client: SocketAddr) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        if let Some(require) = request.get_header("Require") {
            tracing::warn!(%cseq, require, "unsupported Require option");
            return RtspResponse::status(551)
                .add_header("CSeq", cseq)
                .add_header("Unsupported", require);
        }

        let session = extract_session_id(request).and_then(|id| self.sessions.get_session(&id));
        if let Some(session) = &session {
            session.touch();
        }

        let Some(target) = parse_target(&request.uri) else {
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };
        if let TrackSelector::Track(id) = target.selector
            && self.track(id).is_none()
        {
            tracing::warn!(uri = %request.uri, "unknown track");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &target, &request.uri, client),
            "SETUP" => self.handle_setup(cseq, &target, request, session, client),
            "PLAY" => self.handle_play(cseq, &target, request, session),
            "PAUSE" => self.handle_pause(cseq, &target, session),
            "TEARDOWN" => self.handle_teardown(cseq, &target, session),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, session),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    fn reap_expired(&self) {
        for session in self.sessions.take_expired(Instant::now()) {
            session.terminate();
            if let Some(playback) = &self.playback {
                playback.stop(&session.id);
            }
            tracing::info!(session_id = %session.id, path = %self.path, "session timed out");
        }
    }
}

/// Extract session ID from the Session header.
/// Handles timeout suffix: "SESSIONID;timeout=60" -> "SESSIONID"
fn extract_session_id(request: &RtspRequest) -> Option<String> {
    request
        .get_header("Session")
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
}

/// Split `rtsp://host/path/trackID=N` into the aggregate URL and track.
fn parse_target(uri: &str) -> Option<Target> {
    match uri.rfind("/trackID=") {
        Some(pos) => {
            let id = uri[pos + "/trackID=".len()..].trim_end_matches('/').parse().ok()?;
            Some(Target {
                base: uri[..pos].to_string(),
                selector: TrackSelector::Track(id),
            })
        }
        None => Some(Target {
            base: uri.trim_end_matches('/').to_string(),
            selector: TrackSelector::All,
        }),
    }
}

/// Start of a `Range: npt=<start>-[<end>]` header, in seconds.
fn parse_npt_start(range: &str) -> Option<f64> {
    let spec = range.trim().strip_prefix("npt=")?;
    let start = spec.split('-').next()?.trim();
    if start.is_empty() || start == "now" {
        return None;
    }
    start.parse().ok()
}
