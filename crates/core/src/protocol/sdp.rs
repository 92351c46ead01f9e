//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses and written by
//! announcers. The format:
//!
//! ```text
//! v=0                                              ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>      ← origin
//! s=<session-name>                                  ← session name
//! c=IN IP4 <addr>[/<ttl>]                           ← connection address
//! t=0 0                                             ← timing (live stream)
//! a=tool:rtp-streamer/0.1.0                         ← server software
//! a=sendonly                                        ← direction
//! a=range:npt=0-<duration>                          ← only when known
//! m=video 5004 RTP/AVP 96                           ← one per RTP session
//! b=AS:<kbit/s>                                     ← only when known
//! a=rtpmap:96 H264/90000                            ← codec/clock rate
//! a=fmtp:96 packetization-mode=1                    ← codec parameters
//! a=rtcp:5005 | a=rtcp-mux                          ← RTCP port
//! a=setup:passive                                   ← COMEDIA only
//! a=control:rtsp://host/stream/trackID=0            ← RTSP only
//! ```

use std::net::IpAddr;

/// Session-level fields.
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub session_name: String,
    /// Address in the `o=` line.
    pub origin: String,
    /// Address in the session `c=` line.
    pub connection: String,
    /// Multicast TTL appended to the `c=` address.
    pub ttl: Option<u32>,
    pub tool: String,
    /// Total duration in seconds, for on-demand media.
    pub duration: Option<f64>,
}

impl Default for SdpSession {
    fn default() -> Self {
        Self {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            session_name: "Unnamed".to_string(),
            origin: "0.0.0.0".to_string(),
            connection: "0.0.0.0".to_string(),
            ttl: None,
            tool: crate::protocol::response::SERVER_AGENT.to_string(),
            duration: None,
        }
    }
}

/// How receivers find the RTCP flow of a media section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMode {
    /// RTCP shares the RTP port (RFC 5761).
    Mux,
    /// RTCP on the next port up.
    NextPort,
    /// Nothing to announce (port 0 or no RTCP).
    Unannounced,
}

/// One `m=` section.
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: &'static str,
    pub port: u16,
    /// `RTP/AVP`, or `TCP/RTP/AVP` for COMEDIA.
    pub proto: &'static str,
    pub payload_type: u8,
    pub rtpmap: String,
    pub fmtp: Option<String>,
    pub bitrate_kbps: u32,
    pub rtcp: RtcpMode,
    pub setup_passive: bool,
    /// Media-level `c=` when the stream goes to its own destination.
    pub destination: Option<(IpAddr, Option<u32>)>,
    pub control: Option<String>,
}

/// Generate an SDP session description, one `m=` per media in order.
pub fn generate(session: &SdpSession, media: &[SdpMedia]) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN {} {}",
        session.username,
        session.session_id,
        session.session_version,
        addr_type(&session.origin),
        session.origin
    ));
    sdp.push(format!("s={}", session.session_name));
    sdp.push(connection_line(&session.connection, session.ttl));
    sdp.push("t=0 0".to_string());
    sdp.push(format!("a=tool:{}", session.tool));
    sdp.push("a=sendonly".to_string());
    if let Some(duration) = session.duration {
        sdp.push(format!("a=range:npt=0-{:.3}", duration));
    }

    for m in media {
        sdp.push(format!("m={} {} {} {}", m.media_type, m.port, m.proto, m.payload_type));
        if let Some((addr, ttl)) = m.destination {
            let addr = addr.to_string();
            if addr != session.connection {
                sdp.push(connection_line(&addr, ttl));
            }
        }
        if m.bitrate_kbps > 0 {
            sdp.push(format!("b=AS:{}", m.bitrate_kbps));
        }
        sdp.push(format!("a=rtpmap:{} {}", m.payload_type, m.rtpmap));
        if let Some(fmtp) = &m.fmtp {
            sdp.push(format!("a=fmtp:{} {}", m.payload_type, fmtp));
        }
        match m.rtcp {
            RtcpMode::Mux => sdp.push("a=rtcp-mux".to_string()),
            RtcpMode::NextPort if m.port != 0 => sdp.push(format!("a=rtcp:{}", u32::from(m.port) + 1)),
            _ => {}
        }
        if m.setup_passive {
            sdp.push("a=setup:passive".to_string());
            sdp.push("a=connection:new".to_string());
        }
        if let Some(control) = &m.control {
            sdp.push(format!("a=control:{}", control));
        }
    }

    tracing::trace!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

fn connection_line(addr: &str, ttl: Option<u32>) -> String {
    let multicast = addr.parse::<IpAddr>().map(|ip| ip.is_multicast()).unwrap_or(false);
    match ttl {
        Some(ttl) if multicast && addr_type(addr) == "IP4" => format!("c=IN IP4 {}/{}", addr, ttl),
        _ => format!("c=IN {} {}", addr_type(addr), addr),
    }
}

fn addr_type(addr: &str) -> &'static str {
    if addr.contains(':') { "IP6" } else { "IP4" }
}
