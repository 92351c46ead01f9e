//! `Transport` header negotiation (RFC 2326 §12.39).
//!
//! ## Wire format example
//!
//! ```text
//! Client → Server:
//!   Transport: RTP/AVP;multicast,RTP/AVP;unicast;client_port=8000-8001
//!
//! Server → Client:
//!   Transport: RTP/AVP/UDP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=1A2B3C4D;mode=play
//! ```
//!
//! Alternatives are comma separated, in client preference order. Only UDP
//! delivery in play mode is offered; interleaved TCP is not.

use std::net::IpAddr;

/// One acceptable alternative from a client's `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSpec {
    pub multicast: bool,
    /// Client's (RTP, RTCP) receive ports. Always set for unicast.
    pub client_port: Option<(u16, u16)>,
}

/// Parse one alternative. `None` means the server cannot honour it.
///
/// The profile must be `RTP/AVP` or `RTP/AVP/UDP`. The only parameters
/// understood are `unicast`, `multicast`, `client_port=lo-hi` and
/// `mode=play`; anything else rejects the alternative, as does unicast
/// without `client_port`.
///
/// ## Examples
///
/// ```
/// use streamer::protocol::transport::parse_alternative;
///
/// let spec = parse_alternative("RTP/AVP;unicast;client_port=8000-8001").unwrap();
/// assert_eq!(spec.client_port, Some((8000, 8001)));
///
/// assert!(parse_alternative("RTP/AVP;unicast").is_none());
/// assert!(parse_alternative("RTP/AVP/TCP;interleaved=0-1").is_none());
/// ```
pub fn parse_alternative(alternative: &str) -> Option<TransportSpec> {
    let mut parts = alternative.split(';').map(str::trim);

    let profile = parts.next()?;
    if !profile.eq_ignore_ascii_case("RTP/AVP") && !profile.eq_ignore_ascii_case("RTP/AVP/UDP") {
        return None;
    }

    let mut spec = TransportSpec {
        multicast: false,
        client_port: None,
    };
    for part in parts {
        if part.is_empty() {
            continue;
        }
        let (name, value) = match part.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (part, None),
        };
        match (name.to_ascii_lowercase().as_str(), value) {
            ("unicast", None) => spec.multicast = false,
            ("multicast", None) => spec.multicast = true,
            ("mode", Some(mode)) if mode.trim_matches('"').eq_ignore_ascii_case("play") => {}
            ("client_port", Some(ports)) => spec.client_port = Some(parse_port_range(ports)?),
            _ => {
                tracing::trace!(parameter = part, "unsupported transport parameter");
                return None;
            }
        }
    }

    if !spec.multicast && spec.client_port.is_none() {
        return None;
    }
    Some(spec)
}

/// All acceptable alternatives of a `Transport` header, in order.
pub fn alternatives(header: &str) -> impl Iterator<Item = TransportSpec> + '_ {
    header.split(',').filter_map(parse_alternative)
}

/// `lo-hi`, or a single `lo` meaning `lo-(lo+1)`.
fn parse_port_range(ports: &str) -> Option<(u16, u16)> {
    match ports.split_once('-') {
        Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
        None => {
            let lo: u16 = ports.trim().parse().ok()?;
            Some((lo, lo.checked_add(1)?))
        }
    }
}

/// Transport response for a unicast sink.
pub fn unicast_reply(client_port: (u16, u16), server_port: (u16, u16), ssrc: u32) -> String {
    format!(
        "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X};mode=play",
        client_port.0, client_port.1, server_port.0, server_port.1, ssrc
    )
}

/// Transport response for a track with a fixed multicast destination.
pub fn multicast_reply(group: IpAddr, port: u16, ttl: Option<u32>) -> String {
    let mut reply = format!(
        "RTP/AVP/UDP;multicast;destination={};port={}-{}",
        group,
        port,
        port.wrapping_add(1)
    );
    if let Some(ttl) = ttl {
        reply.push_str(&format!(";ttl={}", ttl));
    }
    reply.push_str(";mode=play");
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let spec = parse_alternative("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert!(!spec.multicast);
        assert_eq!(spec.client_port, Some((5000, 5001)));
    }

    #[test]
    fn parse_no_client_port() {
        assert!(parse_alternative("RTP/AVP;unicast").is_none());
        assert!(parse_alternative("RTP/AVP").is_none());
    }

    #[test]
    fn udp_profile_and_mode() {
        let spec = parse_alternative("RTP/AVP/UDP;unicast;client_port=6000-6001;mode=\"PLAY\"").unwrap();
        assert_eq!(spec.client_port, Some((6000, 6001)));
        assert!(parse_alternative("RTP/AVP;unicast;client_port=6000-6001;mode=record").is_none());
    }

    #[test]
    fn unknown_parameter_rejects_alternative() {
        assert!(parse_alternative("RTP/AVP;unicast;client_port=6000-6001;interleaved=0-1").is_none());
        assert!(parse_alternative("RTP/AVP/TCP;unicast;client_port=6000-6001").is_none());
        assert!(parse_alternative("RTP/AVP;unicast;client_port=abc").is_none());
    }

    #[test]
    fn multicast_needs_no_ports() {
        let spec = parse_alternative("RTP/AVP;multicast").unwrap();
        assert!(spec.multicast);
        assert_eq!(spec.client_port, None);
    }

    #[test]
    fn single_port_implies_pair() {
        let spec = parse_alternative("RTP/AVP;unicast;client_port=7000").unwrap();
        assert_eq!(spec.client_port, Some((7000, 7001)));
    }

    #[test]
    fn alternatives_in_preference_order() {
        let header = "RTP/AVP/TCP;interleaved=0-1, RTP/AVP;multicast, RTP/AVP;unicast;client_port=9000-9001";
        let all: Vec<_> = alternatives(header).collect();
        assert_eq!(all.len(), 2);
        assert!(all[0].multicast);
        assert_eq!(all[1].client_port, Some((9000, 9001)));
    }

    #[test]
    fn replies() {
        assert_eq!(
            unicast_reply((8000, 8001), (5000, 5001), 0x1A2B3C4D),
            "RTP/AVP/UDP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=1A2B3C4D;mode=play"
        );
        assert_eq!(
            multicast_reply("239.0.0.1".parse().unwrap(), 5004, Some(16)),
            "RTP/AVP/UDP;multicast;destination=239.0.0.1;port=5004-5005;ttl=16;mode=play"
        );
    }
}
