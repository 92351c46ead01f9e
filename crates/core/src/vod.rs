//! On-demand media served over RTSP.
//!
//! RTSP handler threads and the media library's controller thread never
//! call each other directly. Everything goes through one FIFO drained by
//! a single worker:
//!
//! ```text
//!  RTSP PLAY/PAUSE/TEARDOWN ──┐
//!  (VodPlayback)              ├──► FIFO ──► worker ──► MediaController
//!  add_media / del_media ─────┘                   └──► TransportServer
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::error::{Result, StreamError};
use crate::media::{Block, EsDescriptor, resolve_format};
use crate::protocol::handler::{Negotiator, PlaybackControl};
use crate::rtp::{NptReference, RtpSession, SessionConfig};
use crate::server::RtspConfig;
use crate::transport::TransportServer;

/// The media library side of on-demand playback.
///
/// Called from the serializer worker only, one command at a time.
pub trait MediaController: Send + Sync {
    fn play(&self, path: &str, session_id: &str, start: Option<f64>);
    fn pause(&self, path: &str, session_id: &str);
    fn stop(&self, path: &str, session_id: &str);
    fn seek(&self, path: &str, session_id: &str, position: f64);
}

#[derive(Debug, Clone)]
pub enum VodCommand {
    /// Expose media at `path` with one RTSP track per stream.
    AddMedia {
        path: String,
        streams: Vec<EsDescriptor>,
        duration: Option<f64>,
    },
    DelMedia {
        path: String,
    },
    Play {
        path: String,
        session: String,
        start: Option<f64>,
    },
    Pause {
        path: String,
        session: String,
    },
    Stop {
        path: String,
        session: String,
    },
    Seek {
        path: String,
        session: String,
        position: f64,
    },
}

impl VodCommand {
    fn is_control(&self) -> bool {
        !matches!(self, Self::AddMedia { .. } | Self::DelMedia { .. })
    }
}

enum Message {
    Command(VodCommand),
    Shutdown,
}

/// One registered on-demand media: its RTP sessions and RTSP negotiator.
pub struct VodMedia {
    path: String,
    negotiator: Arc<Negotiator>,
    sessions: Vec<Arc<RtpSession>>,
}

impl VodMedia {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    pub fn stream_count(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver a block of stream `es_index` to every playing client.
    pub fn send(&self, es_index: usize, block: &Block) -> Result<()> {
        let session = self
            .sessions
            .get(es_index)
            .ok_or_else(|| StreamError::InvalidConfig(format!("no stream {} in {}", es_index, self.path)))?;
        session.send(block)
    }

    fn destroy(&self) {
        self.negotiator.close();
        for session in &self.sessions {
            session.destroy();
        }
    }
}

/// Forwards RTSP playback requests of one media to the serializer.
struct VodPlayback {
    path: String,
    queue: Sender<Message>,
}

impl VodPlayback {
    fn push(&self, command: VodCommand) {
        if self.queue.send(Message::Command(command)).is_err() {
            tracing::debug!(path = %self.path, "VoD worker gone, command dropped");
        }
    }
}

impl PlaybackControl for VodPlayback {
    fn play(&self, session_id: &str, start: Option<f64>) {
        self.push(VodCommand::Play {
            path: self.path.clone(),
            session: session_id.to_string(),
            start,
        });
    }

    fn pause(&self, session_id: &str) {
        self.push(VodCommand::Pause {
            path: self.path.clone(),
            session: session_id.to_string(),
        });
    }

    fn stop(&self, session_id: &str) {
        self.push(VodCommand::Stop {
            path: self.path.clone(),
            session: session_id.to_string(),
        });
    }

    fn seek(&self, session_id: &str, position: f64) {
        self.push(VodCommand::Seek {
            path: self.path.clone(),
            session: session_id.to_string(),
            position,
        });
    }
}

type MediaTable = Arc<RwLock<HashMap<String, Arc<VodMedia>>>>;

/// The VoD command serializer.
pub struct VodServer {
    queue: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
    media: MediaTable,
}

impl VodServer {
    /// Start the worker. Media RTP sessions use `SessionConfig::default()`
    /// and are paced by `clock`.
    pub fn new(
        server: Arc<dyn TransportServer>,
        controller: Arc<dyn MediaController>,
        config: Arc<RtspConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let media: MediaTable = Arc::new(RwLock::new(HashMap::new()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let worker = VodWorker {
            queue: rx,
            playback_queue: tx.clone(),
            server,
            controller,
            config,
            clock,
            media: media.clone(),
            shutting_down: shutting_down.clone(),
        };
        let handle = thread::Builder::new()
            .name("vod".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            shutting_down,
            media,
        })
    }

    /// Queue a command. Fails once [`shutdown`](Self::shutdown) started.
    pub fn submit(&self, command: VodCommand) -> Result<()> {
        let queue = self.queue.lock();
        let queue = queue.as_ref().ok_or(StreamError::SessionClosed)?;
        queue
            .send(Message::Command(command))
            .map_err(|_| StreamError::SessionClosed)
    }

    pub fn add_media(&self, path: &str, streams: Vec<EsDescriptor>, duration: Option<f64>) -> Result<()> {
        self.submit(VodCommand::AddMedia {
            path: path.to_string(),
            streams,
            duration,
        })
    }

    pub fn del_media(&self, path: &str) -> Result<()> {
        self.submit(VodCommand::DelMedia { path: path.to_string() })
    }

    /// Registered media at `path`, once its `AddMedia` has been applied.
    pub fn media(&self, path: &str) -> Option<Arc<VodMedia>> {
        self.media.read().get(path).cloned()
    }

    /// Drain the queue, delete every media and join the worker. Idempotent.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(queue) = self.queue.lock().take() {
            let _ = queue.send(Message::Shutdown);
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
            tracing::info!("VoD serializer stopped");
        }
    }
}

impl Drop for VodServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct VodWorker {
    queue: Receiver<Message>,
    playback_queue: Sender<Message>,
    server: Arc<dyn TransportServer>,
    controller: Arc<dyn MediaController>,
    config: Arc<RtspConfig>,
    clock: Arc<dyn Clock>,
    media: MediaTable,
    shutting_down: Arc<AtomicBool>,
}

impl VodWorker {
    fn run(self) {
        while let Ok(Message::Command(command)) = self.queue.recv() {
            self.apply(command);
        }

        // Shutdown: the queue may still hold commands pushed by RTSP threads.
        while let Ok(message) = self.queue.try_recv() {
            if let Message::Command(command) = message {
                self.apply(command);
            }
        }

        let paths: Vec<String> = self.media.read().keys().cloned().collect();
        for path in paths {
            self.del_media(&path);
        }
        tracing::debug!("VoD worker exited");
    }

    fn apply(&self, command: VodCommand) {
        if command.is_control() && self.shutting_down.load(Ordering::SeqCst) {
            tracing::debug!(?command, "skipping control command during shutdown");
            return;
        }

        match command {
            VodCommand::AddMedia { path, streams, duration } => self.add_media(path, &streams, duration),
            VodCommand::DelMedia { path } => self.del_media(&path),
            VodCommand::Play { path, session, start } => self.controller.play(&path, &session, start),
            VodCommand::Pause { path, session } => self.controller.pause(&path, &session),
            VodCommand::Stop { path, session } => self.controller.stop(&path, &session),
            VodCommand::Seek {
                path,
                session,
                position,
            } => self.controller.seek(&path, &session, position),
        }
    }

    fn add_media(&self, path: String, streams: &[EsDescriptor], duration: Option<f64>) {
        if self.media.read().contains_key(&path) {
            tracing::warn!(%path, "media already registered");
            return;
        }

        let npt = Arc::new(NptReference::new());
        let session_config = SessionConfig::default();
        let mut sessions = Vec::with_capacity(streams.len());
        for es in streams {
            let created = resolve_format(es)
                .and_then(|format| RtpSession::create(format, &session_config, npt.clone(), self.clock.clone()));
            match created {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(%path, codec = ?es.codec, error = %e, "cannot serve media");
                    for session in &sessions {
                        session.destroy();
                    }
                    return;
                }
            }
        }

        let playback = Arc::new(VodPlayback {
            path: path.clone(),
            queue: self.playback_queue.clone(),
        });
        let negotiator = Negotiator::new(&path, self.config.clone())
            .with_playback(playback)
            .with_duration(duration);
        for session in &sessions {
            negotiator.add_track(session.clone());
        }
        let negotiator = Arc::new(negotiator);

        let media = Arc::new(VodMedia {
            path: path.clone(),
            negotiator: negotiator.clone(),
            sessions,
        });
        if let Err(e) = self.server.register(&path, negotiator) {
            tracing::warn!(%path, error = %e, "cannot register media");
            media.destroy();
            return;
        }

        tracing::info!(%path, streams = media.stream_count(), duration, "media added");
        self.media.write().insert(path, media);
    }

    fn del_media(&self, path: &str) {
        let Some(media) = self.media.write().remove(path) else {
            tracing::debug!(path, "no such media");
            return;
        };
        self.server.unregister(path);
        media.destroy();
        tracing::info!(path, "media deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::Codec;
    use crate::mount::MountRegistry;
    use crate::protocol::RtspRequest;
    use crate::transport::RequestHandler;
    use crossbeam_channel::bounded;
    use std::net::{SocketAddr, UdpSocket};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        gate: Mutex<Option<Receiver<()>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl MediaController for Recorder {
        fn play(&self, path: &str, _: &str, start: Option<f64>) {
            self.calls.lock().push(format!("play {} {:?}", path, start));
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
        }
        fn pause(&self, path: &str, _: &str) {
            self.calls.lock().push(format!("pause {}", path));
        }
        fn stop(&self, path: &str, _: &str) {
            self.calls.lock().push(format!("stop {}", path));
        }
        fn seek(&self, path: &str, _: &str, position: f64) {
            self.calls.lock().push(format!("seek {} {}", path, position));
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn server(controller: Arc<Recorder>) -> (VodServer, MountRegistry) {
        let mounts = MountRegistry::new();
        let vod = VodServer::new(
            Arc::new(mounts.clone()),
            controller,
            Arc::new(RtspConfig::default()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        (vod, mounts)
    }

    fn pcmu() -> Vec<EsDescriptor> {
        vec![EsDescriptor::audio(Codec::Mulaw, 8000, 1)]
    }

    fn request(method: &str, uri: &str, extra: &[(&str, &str)]) -> RtspRequest {
        let mut raw = format!("{} {} RTSP/1.0\r\nCSeq: 1\r\n", method, uri);
        for (name, value) in extra {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("\r\n");
        RtspRequest::parse(&raw).unwrap()
    }

    #[test]
    fn add_and_delete_media() {
        let (vod, mounts) = server(Arc::new(Recorder::default()));
        vod.add_media("/movie", pcmu(), Some(90.0)).unwrap();
        assert!(wait_for(|| vod.media("/movie").is_some()));
        assert!(mounts.get("/movie").is_some());
        assert_eq!(vod.media("/movie").unwrap().stream_count(), 1);

        let client: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let resp = mounts
            .get("/movie")
            .unwrap()
            .handle(&request("DESCRIBE", "rtsp://h/movie", &[]), client);
        assert!(resp.body.unwrap().contains("a=range:npt=0-90.000\r\n"));

        vod.del_media("/movie").unwrap();
        assert!(wait_for(|| vod.media("/movie").is_none()));
        assert!(mounts.get("/movie").is_none());
    }

    #[test]
    fn rtsp_commands_reach_controller() {
        let recorder = Arc::new(Recorder::default());
        let (vod, mounts) = server(recorder.clone());
        vod.add_media("/movie", pcmu(), None).unwrap();
        assert!(wait_for(|| mounts.get("/movie").is_some()));
        let handler = mounts.get("/movie").unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let client: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
        let resp = handler.handle(
            &request("SETUP", "rtsp://h/movie/trackID=0", &[("Transport", &transport)]),
            client,
        );
        let session = resp.get_header("Session").unwrap().split(';').next().unwrap().to_string();

        handler.handle(&request("PLAY", "rtsp://h/movie", &[("Session", &session)]), client);
        handler.handle(&request("PAUSE", "rtsp://h/movie", &[("Session", &session)]), client);
        handler.handle(&request("TEARDOWN", "rtsp://h/movie", &[("Session", &session)]), client);

        assert!(wait_for(|| recorder.calls().len() == 3));
        assert_eq!(recorder.calls(), vec!["play /movie None", "pause /movie", "stop /movie"]);
    }

    #[test]
    fn unsupported_stream_registers_nothing() {
        let (vod, mounts) = server(Arc::new(Recorder::default()));
        vod.add_media("/bad", vec![EsDescriptor::audio(Codec::G726, 8000, 1).with_bitrate(12_345)], None)
            .unwrap();
        vod.add_media("/good", pcmu(), None).unwrap();
        assert!(wait_for(|| vod.media("/good").is_some()));
        assert!(vod.media("/bad").is_none());
        assert!(mounts.get("/bad").is_none());
    }

    #[test]
    fn shutdown_applies_media_commands_and_skips_control() {
        let recorder = Arc::new(Recorder::default());
        let (gate_tx, gate_rx) = bounded(1);
        *recorder.gate.lock() = Some(gate_rx);
        let (vod, mounts) = server(recorder.clone());
        let vod = Arc::new(vod);

        vod.submit(VodCommand::Play {
            path: "/a".to_string(),
            session: "s".to_string(),
            start: None,
        })
        .unwrap();
        assert!(wait_for(|| recorder.calls().len() == 1));

        // The worker is parked inside the first play.
        vod.submit(VodCommand::Seek {
            path: "/a".to_string(),
            session: "s".to_string(),
            position: 3.0,
        })
        .unwrap();
        vod.add_media("/late", pcmu(), None).unwrap();

        let stopper = {
            let vod = vod.clone();
            thread::spawn(move || vod.shutdown())
        };
        assert!(wait_for(|| vod.shutting_down.load(Ordering::SeqCst)));
        gate_tx.send(()).unwrap();
        stopper.join().unwrap();

        assert_eq!(recorder.calls(), vec!["play /a None"]);
        assert!(vod.media("/late").is_none());
        assert!(mounts.is_empty());
        assert!(matches!(vod.del_media("/late"), Err(StreamError::SessionClosed)));
    }
}
