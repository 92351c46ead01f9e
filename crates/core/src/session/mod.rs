//! RTSP client session management (RFC 2326 §3, §12.37).
//!
//! A client session is server-side state created by the first SETUP and
//! destroyed by TEARDOWN or timeout. It tracks:
//!
//! - A random 64-bit session ID (hex string, returned in the `Session` header).
//! - The tracks the client set up, each with the transports opened for it
//!   and, while playing, the [`SinkId`] it holds in the track's RTP session.
//! - The time of the last request, for the timeout (default 60s, per
//!   RFC 2326 §12.37). Any request naming the session refreshes it.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP         -> Ready    (first track attached)
//! PLAY          -> Playing
//! PAUSE         -> Ready    (when no track plays any more)
//! TEARDOWN      -> Terminated (all tracks detached, removed)
//! timeout       -> Terminated (via reap_expired)
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::rtp::{RtpSession, SinkId};
use crate::transport::SinkTransport;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no track attached yet.
    Idle,
    /// At least one track set up, none playing.
    Ready,
    /// At least one track delivering media.
    Playing,
    /// Torn down. The id is no longer valid.
    Terminated,
}

/// Which tracks a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSelector {
    All,
    Track(u32),
}

impl TrackSelector {
    fn matches(self, track_id: u32) -> bool {
        match self {
            Self::All => true,
            Self::Track(id) => id == track_id,
        }
    }
}

/// One track set up by a client.
pub struct AttachedTrack {
    pub track_id: u32,
    session: Arc<RtpSession>,
    /// `None` for fixed multicast tracks, which need no per-client sink.
    rtp: Option<Arc<dyn SinkTransport>>,
    rtcp: Option<Arc<dyn SinkTransport>>,
    sink: Option<SinkId>,
    playing: bool,
}

impl AttachedTrack {
    pub fn unicast(
        track_id: u32,
        session: Arc<RtpSession>,
        rtp: Arc<dyn SinkTransport>,
        rtcp: Option<Arc<dyn SinkTransport>>,
    ) -> Self {
        Self {
            track_id,
            session,
            rtp: Some(rtp),
            rtcp,
            sink: None,
            playing: false,
        }
    }

    pub fn multicast(track_id: u32, session: Arc<RtpSession>) -> Self {
        Self {
            track_id,
            session,
            rtp: None,
            rtcp: None,
            sink: None,
            playing: false,
        }
    }

    pub fn rtp_session(&self) -> &Arc<RtpSession> {
        &self.session
    }

    fn start(&mut self) -> Result<()> {
        if self.playing {
            return Ok(());
        }
        if let Some(rtp) = &self.rtp {
            self.sink = Some(self.session.add_sink(rtp.clone(), self.rtcp.clone())?);
        }
        self.playing = true;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.session.remove_sink(sink);
        }
        self.playing = false;
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

/// A single RTSP client session (RFC 2326 §3).
///
/// Interior mutability lets the listener's connection threads share it.
pub struct ClientSession {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    state: Mutex<SessionState>,
    tracks: Mutex<Vec<AttachedTrack>>,
    last_activity: Mutex<Instant>,
}

impl ClientSession {
    fn new(id: String, timeout_secs: u64) -> Self {
        ClientSession {
            id,
            timeout_secs,
            state: Mutex::new(SessionState::Idle),
            tracks: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Attach a track, replacing an earlier SETUP of the same track.
    pub fn attach(&self, track: AttachedTrack) {
        let mut tracks = self.tracks.lock();
        if let Some(pos) = tracks.iter().position(|t| t.track_id == track.track_id) {
            tracks.remove(pos).stop();
        }
        tracing::debug!(session_id = %self.id, track_id = track.track_id, "track attached");
        tracks.push(track);
        drop(tracks);
        self.recompute_state();
    }

    /// Start delivery on every selected track that is not playing yet.
    ///
    /// Returns how many selected tracks are playing afterwards. If one track
    /// fails to start, the tracks started by this call are stopped again.
    pub fn play(&self, selector: TrackSelector) -> Result<usize> {
        let mut tracks = self.tracks.lock();
        let mut started = Vec::new();
        let mut playing = 0;
        let mut failure = None;
        for (index, track) in tracks.iter_mut().enumerate() {
            if !selector.matches(track.track_id) {
                continue;
            }
            let was_playing = track.is_playing();
            if let Err(e) = track.start() {
                failure = Some(e);
                break;
            }
            if !was_playing {
                started.push(index);
            }
            playing += 1;
        }
        if failure.is_some() {
            for index in started {
                tracks[index].stop();
            }
        }
        drop(tracks);
        self.recompute_state();
        match failure {
            Some(e) => Err(e),
            None => Ok(playing),
        }
    }

    /// Stop delivery on the selected tracks; they stay attached.
    pub fn pause(&self, selector: TrackSelector) {
        for track in self.tracks.lock().iter_mut().filter(|t| selector.matches(t.track_id)) {
            track.stop();
        }
        self.recompute_state();
    }

    /// Detach the selected tracks. Returns how many remain.
    pub fn detach(&self, selector: TrackSelector) -> usize {
        let mut tracks = self.tracks.lock();
        tracks.retain_mut(|t| {
            if selector.matches(t.track_id) {
                t.stop();
                false
            } else {
                true
            }
        });
        let remaining = tracks.len();
        drop(tracks);
        self.recompute_state();
        remaining
    }

    /// Detach every track bound to `session`. Returns how many were removed.
    pub fn detach_rtp_session(&self, session: &Arc<RtpSession>) -> usize {
        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain_mut(|t| {
            if Arc::ptr_eq(&t.session, session) {
                t.stop();
                false
            } else {
                true
            }
        });
        let removed = before - tracks.len();
        drop(tracks);
        self.recompute_state();
        removed
    }

    /// Detach everything and move to [`SessionState::Terminated`].
    pub fn terminate(&self) {
        for mut track in std::mem::take(&mut *self.tracks.lock()) {
            track.stop();
        }
        self.set_state(SessionState::Terminated);
    }

    pub fn has_track(&self, track_id: u32) -> bool {
        self.tracks.lock().iter().any(|t| t.track_id == track_id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    /// `(track_id, rtp session)` of every selected track that is playing.
    pub fn active_tracks(&self, selector: TrackSelector) -> Vec<(u32, Arc<RtpSession>)> {
        self.tracks
            .lock()
            .iter()
            .filter(|t| selector.matches(t.track_id) && t.is_playing())
            .map(|t| (t.track_id, t.session.clone()))
            .collect()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Record client activity, restarting the timeout.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(*self.last_activity.lock()) > Duration::from_secs(self.timeout_secs)
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"1a2b3c4d5e6f7081;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }

    fn recompute_state(&self) {
        let tracks = self.tracks.lock();
        let next = if tracks.is_empty() {
            SessionState::Idle
        } else if tracks.iter().any(|t| t.is_playing()) {
            SessionState::Playing
        } else {
            SessionState::Ready
        };
        drop(tracks);
        self.set_state(next);
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state && *current != SessionState::Terminated {
            tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
            *current = state;
        }
    }
}

/// Thread-safe registry of active client sessions.
///
/// Backed by `parking_lot::RwLock`; every request does a lookup.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<ClientSession>>>>,
    timeout_secs: u64,
}

impl SessionManager {
    pub fn new(timeout_secs: u64) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            timeout_secs,
        }
    }

    /// Create a session with a fresh random ID and register it.
    pub fn create_session(&self) -> Arc<ClientSession> {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = format!("{:016x}", rand::random::<u64>());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(ClientSession::new(id.clone(), self.timeout_secs));
        sessions.insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session created");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove and return every session idle past its timeout.
    pub fn take_expired(&self, now: Instant) -> Vec<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();
        expired.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn all(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::{Codec, EsDescriptor, resolve_format};
    use crate::rtp::{NptReference, SessionConfig};
    use crate::transport::MemoryTransport;

    fn rtp_session() -> Arc<RtpSession> {
        let format = resolve_format(&EsDescriptor::audio(Codec::Mulaw, 8000, 1)).unwrap();
        RtpSession::create(
            format,
            &SessionConfig::default(),
            Arc::new(NptReference::new()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    fn unicast(track_id: u32, session: &Arc<RtpSession>) -> AttachedTrack {
        AttachedTrack::unicast(track_id, session.clone(), Arc::new(MemoryTransport::new()), None)
    }

    #[test]
    fn ids_are_unique_hex() {
        let manager = SessionManager::default();
        let a = manager.create_session();
        let b = manager.create_session();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.session_header_value(), format!("{};timeout=60", a.id));
    }

    #[test]
    fn state_follows_tracks() {
        let rtp = rtp_session();
        let session = SessionManager::default().create_session();
        assert_eq!(session.state(), SessionState::Idle);

        session.attach(unicast(0, &rtp));
        assert_eq!(session.state(), SessionState::Ready);

        assert_eq!(session.play(TrackSelector::All).unwrap(), 1);
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(rtp.sink_count(), 1);

        session.pause(TrackSelector::Track(0));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(rtp.sink_count(), 0);

        session.terminate();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn play_is_idempotent() {
        let rtp = rtp_session();
        let session = SessionManager::default().create_session();
        session.attach(unicast(0, &rtp));
        session.play(TrackSelector::All).unwrap();
        session.play(TrackSelector::All).unwrap();
        session.play(TrackSelector::Track(0)).unwrap();
        assert_eq!(rtp.sink_count(), 1);
    }

    #[test]
    fn detach_removes_only_selected_sinks() {
        let video = rtp_session();
        let audio = rtp_session();
        let session = SessionManager::default().create_session();
        session.attach(unicast(0, &video));
        session.attach(unicast(1, &audio));
        session.play(TrackSelector::All).unwrap();

        assert_eq!(session.detach(TrackSelector::Track(1)), 1);
        assert_eq!(audio.sink_count(), 0);
        assert_eq!(video.sink_count(), 1);
        assert_eq!(session.state(), SessionState::Playing);

        assert_eq!(session.detach_rtp_session(&video), 1);
        assert_eq!(video.sink_count(), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn multicast_track_plays_without_sink() {
        let rtp = rtp_session();
        let session = SessionManager::default().create_session();
        session.attach(AttachedTrack::multicast(0, rtp.clone()));
        session.play(TrackSelector::All).unwrap();
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(session.active_tracks(TrackSelector::All).len(), 1);
        assert_eq!(rtp.sink_count(), 0);

        session.pause(TrackSelector::All);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.active_tracks(TrackSelector::All).is_empty());
    }

    #[test]
    fn failed_play_rolls_back_started_tracks() {
        let video = rtp_session();
        let audio = rtp_session();
        let session = SessionManager::default().create_session();
        session.attach(unicast(0, &video));
        session.attach(unicast(1, &audio));
        audio.destroy();

        assert!(session.play(TrackSelector::All).is_err());
        assert_eq!(video.sink_count(), 0);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.active_tracks(TrackSelector::All).is_empty());

        // A track that was already playing keeps its sink.
        session.play(TrackSelector::Track(0)).unwrap();
        assert!(session.play(TrackSelector::All).is_err());
        assert_eq!(video.sink_count(), 1);
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn resetup_replaces_track() {
        let rtp = rtp_session();
        let session = SessionManager::default().create_session();
        session.attach(unicast(0, &rtp));
        session.play(TrackSelector::All).unwrap();
        session.attach(unicast(0, &rtp));
        assert_eq!(session.track_count(), 1);
        assert_eq!(rtp.sink_count(), 0);
    }

    #[test]
    fn expiry() {
        let manager = SessionManager::new(0);
        let session = manager.create_session();
        let later = Instant::now() + Duration::from_secs(2);
        assert!(session.is_expired(later));
        let expired = manager.take_expired(later);
        assert_eq!(expired.len(), 1);
        assert!(manager.is_empty());
    }
}
