//! RTP sessions: one per elementary stream.
//!
//! [`RtpSession::send`] packetizes a block on the caller's thread under the
//! header lock and queues the packets. A dedicated send thread releases
//! each packet at `dts + caching` on the session [`Clock`] and fans it out
//! to a snapshot of the sinks:
//!
//! ```text
//!  send(block) ──► packetize ──► FIFO ──► send thread ──► wait(dts+caching)
//!                  (seq/ts)                                 │
//!                                            ┌──────────────┼──────────────┐
//!                                            ▼              ▼              ▼
//!                                          sink 1         sink 2    ...  sink n
//!                                         (+RTCP)        (+RTCP)
//! ```
//!
//! A failing sink never affects the others: transient errors are retried
//! once, anything else removes that sink alone.

mod listener;
pub mod npt;
pub mod sink;

use std::borrow::Cow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::clock::Clock;
use crate::error::{Result, StreamError};
use crate::media::rtp::{RtpHeader, compute_ts};
use crate::media::{Block, PayloadFormat, RtpPacket};
use crate::protocol::sdp::{RtcpMode, SdpMedia};
use crate::transport::{SinkTransport, StreamSink, UdpSink};

use listener::ComediaListener;
use sink::SinkSet;

pub use npt::{NptReference, NptZero};
pub use sink::{Sink, SinkId};

/// Default RTP packet size limit, headers included.
pub const DEFAULT_MTU: usize = 1400;
/// Default delay between a block's dts and its release to the network.
pub const DEFAULT_CACHING_MS: u64 = 300;
/// Smallest MTU that leaves room for the largest codec header.
pub const MIN_MTU: usize = 64;

/// Transport protocol of a session's sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    Dccp,
    #[serde(rename = "udplite")]
    UdpLite,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Dccp => "dccp",
            Self::UdpLite => "udplite",
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub protocol: Protocol,
    /// Static destination (unicast or multicast) opened at creation.
    pub destination: Option<SocketAddr>,
    /// TTL for the static destination.
    pub ttl: Option<u32>,
    /// Local port announced in SDP. With TCP and no destination, the
    /// COMEDIA listen port (0 picks one).
    pub port: u16,
    /// Carry RTCP on the RTP port (RFC 5761).
    pub rtcp_mux: bool,
    pub mtu: usize,
    pub caching_ms: u64,
    /// RTCP SDES TOOL item.
    pub tool: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            destination: None,
            ttl: None,
            port: 0,
            rtcp_mux: false,
            mtu: DEFAULT_MTU,
            caching_ms: DEFAULT_CACHING_MS,
            tool: crate::protocol::response::SERVER_AGENT.to_string(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        match self.protocol {
            Protocol::Udp | Protocol::Tcp => {}
            other => return Err(StreamError::UnsupportedProtocol(other.name().to_string())),
        }
        if self.mtu < MIN_MTU || self.mtu > usize::from(u16::MAX) {
            return Err(StreamError::InvalidMtu(self.mtu));
        }
        if self.port % 2 != 0 && !self.rtcp_mux {
            return Err(StreamError::PortConflict(self.port));
        }
        Ok(())
    }

    fn caching(&self) -> i64 {
        (self.caching_ms as i64).saturating_mul(1000)
    }
}

/// Transform applied to each outgoing RTP packet, such as SRTP encryption.
///
/// Runs on the send thread. RTCP accounting still sees the cleartext.
pub trait PacketProtector: Send + Sync {
    fn protect(&self, packet: &[u8]) -> io::Result<Vec<u8>>;
}

/// RTP session of one elementary stream.
pub struct RtpSession {
    format: PayloadFormat,
    config: SessionConfig,
    header: Mutex<RtpHeader>,
    npt: Arc<NptReference>,
    clock: Arc<dyn Clock>,
    sinks: Arc<SinkSet>,
    queue: Mutex<Option<Sender<RtpPacket>>>,
    cancel: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<ComediaListener>>,
    local_port: u16,
}

impl RtpSession {
    /// Create a session and start its send thread.
    ///
    /// Fails with a configuration error for unsupported protocols, MTUs
    /// outside 64..=65535 and odd RTP ports without rtcp-mux. A static
    /// destination is connected immediately.
    pub fn create(
        format: PayloadFormat,
        config: &SessionConfig,
        npt: Arc<NptReference>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        Self::create_protected(format, config, npt, clock, None)
    }

    /// [`create`](Self::create) with a per-packet protection hook.
    pub fn create_protected(
        format: PayloadFormat,
        config: &SessionConfig,
        npt: Arc<NptReference>,
        clock: Arc<dyn Clock>,
        protector: Option<Arc<dyn PacketProtector>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let header = RtpHeader::with_random_state(format.payload_type, format.clock_rate);
        let ssrc = header.ssrc;
        let sinks = Arc::new(SinkSet::new(config.tool.clone()));

        let listener = match (config.protocol, config.destination) {
            (Protocol::Tcp, None) => Some(ComediaListener::bind(config.port, sinks.clone())?),
            _ => None,
        };
        let local_port = listener.as_ref().map_or(config.port, |l| l.local_addr().port());

        let (queue_tx, queue_rx) = unbounded();
        let (cancel_tx, cancel_rx) = unbounded();
        let worker = SendWorker {
            queue: queue_rx,
            cancel: cancel_rx,
            clock: clock.clone(),
            caching: config.caching(),
            sinks: sinks.clone(),
            protector,
        };
        let handle = thread::Builder::new()
            .name(format!("rtp-{:08x}", ssrc))
            .spawn(move || worker.run())?;

        let session = Arc::new(Self {
            format,
            config: config.clone(),
            header: Mutex::new(header),
            npt,
            clock,
            sinks,
            queue: Mutex::new(Some(queue_tx)),
            cancel: Mutex::new(Some(cancel_tx)),
            worker: Mutex::new(Some(handle)),
            listener: Mutex::new(listener),
            local_port,
        });

        if let Some(destination) = config.destination {
            session.open_destination(destination)?;
        }

        tracing::info!(
            ssrc = format_args!("{:#010X}", ssrc),
            encoding = session.format.encoding,
            pt = session.format.payload_type,
            protocol = config.protocol.name(),
            port = local_port,
            "RTP session created"
        );
        Ok(session)
    }

    fn open_destination(&self, destination: SocketAddr) -> Result<SinkId> {
        let (rtp, rtcp): (Arc<dyn SinkTransport>, Arc<dyn SinkTransport>) = match self.config.protocol {
            Protocol::Tcp => {
                let sink = Arc::new(StreamSink::connect(destination)?);
                (sink.clone(), sink)
            }
            _ if self.config.rtcp_mux => {
                let sink = Arc::new(UdpSink::connect(destination, self.config.ttl)?);
                (sink.clone(), sink)
            }
            _ => {
                let rtcp_peer = SocketAddr::new(destination.ip(), destination.port().wrapping_add(1));
                (
                    Arc::new(UdpSink::connect(destination, self.config.ttl)?),
                    Arc::new(UdpSink::connect(rtcp_peer, self.config.ttl)?),
                )
            }
        };
        self.add_sink(rtp, Some(rtcp))
    }

    /// Packetize `block` and queue its packets for release.
    ///
    /// The first block of the whole output fixes the shared NPT origin.
    pub fn send(&self, block: &Block) -> Result<()> {
        let Some(queue) = self.queue.lock().clone() else {
            return Err(StreamError::SessionClosed);
        };

        let mut header = self.header.lock();
        if !header.has_offset() {
            let zero = self.npt.observe(block.pts_or_dts(), self.config.caching());
            header.set_offset(compute_ts(self.format.clock_rate, zero.pts_offset));
        }

        let packets = self.format.packetize(&mut header, self.config.mtu, block);
        if packets.is_empty() && !block.data.is_empty() {
            tracing::debug!(encoding = self.format.encoding, len = block.data.len(), "block produced no packets");
        }
        for packet in packets {
            queue.send(packet).map_err(|_| StreamError::SessionClosed)?;
        }
        Ok(())
    }

    /// Add a destination. RTCP reports go to `rtcp` when given.
    pub fn add_sink(&self, rtp: Arc<dyn SinkTransport>, rtcp: Option<Arc<dyn SinkTransport>>) -> Result<SinkId> {
        self.sinks.add(rtp, rtcp)
    }

    /// Remove a destination, sending RTCP BYE. Nothing is sent to it after
    /// this returns.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        self.sinks.remove(id)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Next sequence number and current RTP time, for `RTP-Info`.
    pub fn rtp_info(&self) -> (u16, u32) {
        let header = self.header.lock();
        let rtptime = if header.has_offset() {
            header.timestamp_for(self.clock.now() - self.config.caching())
        } else {
            compute_ts(self.format.clock_rate, self.npt.pts_zero())
        };
        (header.sequence(), rtptime)
    }

    /// Normal play time now, in microseconds. `None` before the first block.
    pub fn npt_now(&self) -> Option<i64> {
        self.npt.npt(self.clock.now())
    }

    /// `m=` section for this session, without a control URL.
    pub fn sdp_media(&self) -> SdpMedia {
        let comedia = self.listener.lock().is_some();
        let rtcp = if self.config.rtcp_mux || self.config.protocol == Protocol::Tcp {
            RtcpMode::Mux
        } else {
            RtcpMode::NextPort
        };
        let destination = self
            .config
            .destination
            .map(|d| (d.ip(), self.config.ttl.filter(|_| d.ip().is_multicast())));
        SdpMedia {
            media_type: self.format.category.media_type(),
            port: self.config.destination.map_or(self.local_port, |d| d.port()),
            proto: if self.config.protocol == Protocol::Tcp { "TCP/RTP/AVP" } else { "RTP/AVP" },
            payload_type: self.format.payload_type,
            rtpmap: self.format.rtpmap(),
            fmtp: self.format.fmtp.clone(),
            bitrate_kbps: self.format.bitrate_kbps,
            rtcp,
            setup_passive: comedia,
            destination,
            control: None,
        }
    }

    pub fn format(&self) -> &PayloadFormat {
        &self.format
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn ssrc(&self) -> u32 {
        self.header.lock().ssrc
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Multicast group of the static destination, if any.
    pub fn multicast_group(&self) -> Option<(IpAddr, u16, Option<u32>)> {
        self.config
            .destination
            .filter(|d| d.ip().is_multicast())
            .map(|d| (d.ip(), d.port(), self.config.ttl))
    }

    /// Stop the send thread and the COMEDIA listener, drop queued packets
    /// and close every sink. Idempotent.
    pub fn destroy(&self) {
        let Some(cancel) = self.cancel.lock().take() else {
            return;
        };
        self.queue.lock().take();
        drop(cancel);

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
        self.sinks.close_all();
        tracing::info!(encoding = self.format.encoding, "RTP session destroyed");
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct SendWorker {
    queue: Receiver<RtpPacket>,
    cancel: Receiver<()>,
    clock: Arc<dyn Clock>,
    caching: i64,
    sinks: Arc<SinkSet>,
    protector: Option<Arc<dyn PacketProtector>>,
}

impl SendWorker {
    fn run(self) {
        loop {
            let packet = select! {
                recv(self.queue) -> msg => match msg {
                    Ok(packet) => packet,
                    Err(_) => break,
                },
                recv(self.cancel) -> _ => break,
            };
            if !self.clock.wait_until(packet.dts + self.caching, &self.cancel) {
                break;
            }
            self.fan_out(&packet);
        }
        tracing::debug!("RTP send thread exited");
    }

    fn fan_out(&self, packet: &RtpPacket) {
        let wire = match &self.protector {
            Some(protector) => match protector.protect(&packet.data) {
                Ok(data) => Cow::Owned(data),
                Err(e) => {
                    tracing::warn!(error = %e, seq = packet.sequence(), "packet protection failed, dropping");
                    return;
                }
            },
            None => Cow::Borrowed(&packet.data[..]),
        };

        for sink in self.sinks.snapshot() {
            match sink.send(&wire, &packet.data) {
                sink::Delivery::Sent => {
                    tracing::trace!(sink = %sink.id(), seq = packet.sequence(), len = wire.len(), "RTP sent");
                }
                sink::Delivery::Dropped => {
                    tracing::debug!(sink = %sink.id(), seq = packet.sequence(), "packet dropped for sink");
                }
                sink::Delivery::Failed(e) => {
                    tracing::warn!(sink = %sink.id(), error = %e, "sink failed, removing");
                    self.sinks.remove(sink.id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::{Codec, EsDescriptor, resolve_format};
    use crate::transport::MemoryTransport;
    use std::time::{Duration, Instant};

    fn pcmu() -> PayloadFormat {
        resolve_format(&EsDescriptor::audio(Codec::Mulaw, 8000, 1)).unwrap()
    }

    fn session_with(config: SessionConfig) -> Arc<RtpSession> {
        RtpSession::create(
            pcmu(),
            &config,
            Arc::new(NptReference::with_pts_zero(0)),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    fn session() -> Arc<RtpSession> {
        session_with(SessionConfig::default())
    }

    fn wait_for(transport: &MemoryTransport, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn sequences(packets: &[Vec<u8>]) -> Vec<u16> {
        packets.iter().map(|p| u16::from_be_bytes([p[2], p[3]])).collect()
    }

    #[test]
    fn rejects_unsupported_protocols() {
        for protocol in [Protocol::Dccp, Protocol::UdpLite] {
            let config = SessionConfig { protocol, ..Default::default() };
            let result = RtpSession::create(
                pcmu(),
                &config,
                Arc::new(NptReference::new()),
                Arc::new(ManualClock::new(0)),
            );
            assert!(matches!(result, Err(StreamError::UnsupportedProtocol(_))));
        }
    }

    #[test]
    fn rejects_bad_mtu_and_odd_port() {
        let npt = Arc::new(NptReference::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let small = SessionConfig { mtu: 20, ..Default::default() };
        assert!(matches!(
            RtpSession::create(pcmu(), &small, npt.clone(), clock.clone()),
            Err(StreamError::InvalidMtu(20))
        ));

        let odd = SessionConfig { port: 5005, ..Default::default() };
        assert!(matches!(
            RtpSession::create(pcmu(), &odd, npt.clone(), clock.clone()),
            Err(StreamError::PortConflict(5005))
        ));

        let odd_mux = SessionConfig { port: 5005, rtcp_mux: true, ..Default::default() };
        assert!(RtpSession::create(pcmu(), &odd_mux, npt, clock).is_ok());
    }

    #[test]
    fn fan_out_keeps_sequence_continuous() {
        let s = session();
        let a = Arc::new(MemoryTransport::new());
        let b = Arc::new(MemoryTransport::new());
        s.add_sink(a.clone(), None).unwrap();
        s.add_sink(b.clone(), None).unwrap();

        for i in 0..10 {
            s.send(&Block::new(vec![0xFF; 160], i * 20_000)).unwrap();
        }
        wait_for(&a, 10);
        wait_for(&b, 10);

        let seq_a = sequences(&a.packets());
        assert_eq!(seq_a, sequences(&b.packets()));
        for pair in seq_a.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn removing_one_of_three_sinks() {
        let s = session();
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(MemoryTransport::new())).collect();
        let ids: Vec<_> = sinks.iter().map(|t| s.add_sink(t.clone(), None).unwrap()).collect();

        s.send(&Block::new(vec![1; 160], 0)).unwrap();
        for t in &sinks {
            wait_for(t, 1);
        }
        assert!(s.remove_sink(ids[1]));
        assert_eq!(s.sink_count(), 2);

        s.send(&Block::new(vec![2; 160], 20_000)).unwrap();
        wait_for(&sinks[0], 2);
        wait_for(&sinks[2], 2);

        assert_eq!(sinks[0].len(), 2);
        assert_eq!(sinks[1].len(), 1);
        assert_eq!(sinks[2].len(), 2);
        let seq0 = sequences(&sinks[0].packets());
        assert_eq!(seq0[1], seq0[0].wrapping_add(1));
    }

    #[test]
    fn failing_sink_removed_others_unaffected() {
        let s = session();
        let good = Arc::new(MemoryTransport::new());
        let bad = Arc::new(MemoryTransport::new());
        bad.fail_always(io::ErrorKind::PermissionDenied);
        s.add_sink(good.clone(), None).unwrap();
        s.add_sink(bad.clone(), None).unwrap();

        s.send(&Block::new(vec![1; 160], 0)).unwrap();
        wait_for(&good, 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        while s.sink_count() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(s.sink_count(), 1);

        s.send(&Block::new(vec![2; 160], 20_000)).unwrap();
        wait_for(&good, 2);
        assert_eq!(good.len(), 2);
        assert!(bad.is_empty());
    }

    #[test]
    fn transient_failure_drops_packet_keeps_sink() {
        let s = session();
        let t = Arc::new(MemoryTransport::new());
        t.fail_next(io::ErrorKind::WouldBlock);
        t.fail_next(io::ErrorKind::WouldBlock);
        s.add_sink(t.clone(), None).unwrap();

        s.send(&Block::new(vec![1; 160], 0)).unwrap();
        s.send(&Block::new(vec![2; 160], 20_000)).unwrap();
        wait_for(&t, 1);
        assert_eq!(t.len(), 1);
        assert_eq!(s.sink_count(), 1);
        assert_eq!(t.packets()[0][12], 2);
    }

    #[test]
    fn timestamps_follow_shared_npt() {
        let npt = Arc::new(NptReference::with_pts_zero(1_000_000));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let config = SessionConfig::default();
        let a = RtpSession::create(pcmu(), &config, npt.clone(), clock.clone()).unwrap();
        let b = RtpSession::create(pcmu(), &config, npt.clone(), clock).unwrap();
        let ta = Arc::new(MemoryTransport::new());
        let tb = Arc::new(MemoryTransport::new());
        a.add_sink(ta.clone(), None).unwrap();
        b.add_sink(tb.clone(), None).unwrap();

        a.send(&Block::new(vec![0; 160], 5_000_000)).unwrap();
        b.send(&Block::new(vec![0; 160], 6_000_000)).unwrap();
        wait_for(&ta, 1);
        wait_for(&tb, 1);

        let ts = |p: &Vec<u8>| u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
        let first = ts(&ta.packets()[0]);
        // pts 5 s maps to pts_zero (1 s) at 8 kHz.
        assert_eq!(first, 8000);
        assert_eq!(ts(&tb.packets()[0]).wrapping_sub(first), 8000);
    }

    #[test]
    fn rtp_info_before_first_block_uses_pts_zero() {
        let s = session_with(SessionConfig::default());
        let (_, rtptime) = s.rtp_info();
        assert_eq!(rtptime, 0);
    }

    #[test]
    fn destroy_is_idempotent_and_closes_sinks() {
        let s = session();
        let rtcp = Arc::new(MemoryTransport::new());
        s.add_sink(Arc::new(MemoryTransport::new()), Some(rtcp.clone())).unwrap();
        s.destroy();
        s.destroy();
        assert_eq!(s.sink_count(), 0);
        assert_eq!(rtcp.len(), 1, "exactly one BYE");
        assert!(matches!(s.send(&Block::new(vec![0; 10], 0)), Err(StreamError::SessionClosed)));
        assert!(s.add_sink(Arc::new(MemoryTransport::new()), None).is_err());
    }

    #[test]
    fn protector_transforms_wire_bytes() {
        struct Xor;
        impl PacketProtector for Xor {
            fn protect(&self, packet: &[u8]) -> io::Result<Vec<u8>> {
                let mut out = packet.to_vec();
                out.push(0xEE);
                Ok(out)
            }
        }
        let s = RtpSession::create_protected(
            pcmu(),
            &SessionConfig::default(),
            Arc::new(NptReference::new()),
            Arc::new(ManualClock::new(0)),
            Some(Arc::new(Xor)),
        )
        .unwrap();
        let t = Arc::new(MemoryTransport::new());
        s.add_sink(t.clone(), None).unwrap();
        s.send(&Block::new(vec![1; 4], 0)).unwrap();
        wait_for(&t, 1);
        assert_eq!(t.packets()[0].last(), Some(&0xEE));
    }

    #[test]
    fn comedia_session_accepts_connections() {
        use std::io::Read;
        use std::net::TcpStream;

        let config = SessionConfig { protocol: Protocol::Tcp, ..Default::default() };
        let s = session_with(config);
        let port = s.local_port();
        assert_ne!(port, 0);
        let media = s.sdp_media();
        assert_eq!(media.proto, "TCP/RTP/AVP");
        assert!(media.setup_passive);

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while s.sink_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(s.sink_count(), 1);

        s.send(&Block::new(vec![7; 20], 0)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut frame = [0u8; 2 + 12 + 20];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 32);
        assert_eq!(frame[2] >> 6, 2);
        s.destroy();
    }
}
