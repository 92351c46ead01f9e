//! Vorbis and Theora RTP packetizer (RFC 5215).
//!
//! Every packet starts with a 6-byte payload header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Ident                     | F |TDT|# pkts.|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           length              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `F` is the fragment type: none (0), first (1), middle (2), last (3).
//! `TDT` is the data type: raw payload (0) or packed configuration (1).
//!
//! The three codec headers travel out of band in the `configuration=`
//! fmtp parameter, packed as: header count, ident, length, then the
//! 7-bit length-coded sizes of the first two headers followed by all
//! three headers.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Block;
use super::rtp::PacketWriter;

/// Configuration ident shared by the in-band and out-of-band headers.
pub const IDENT: u32 = 0;

const PAYLOAD_HEADER_LEN: usize = 6;
const DATA_TYPE_RAW: u32 = 0;
const DATA_TYPE_CONFIG: u32 = 1;
/// Count, ident and length fields in front of the packed headers.
const PACKED_PREFIX_LEN: usize = 9;

/// Split codec extradata into its headers.
///
/// Two layouts are accepted:
/// - Xiph lacing: first byte is `count - 1`, then `count - 1` sizes coded
///   as runs of 255 plus a final byte, then the headers back to back. The
///   last header takes the remaining bytes.
/// - Length-prefixed: every header preceded by a 16-bit big-endian size.
pub fn split_headers(extradata: &[u8]) -> Option<Vec<&[u8]>> {
    let (&first, rest) = extradata.split_first()?;
    if first == 0 {
        return split_length_prefixed(extradata);
    }

    let count = usize::from(first) + 1;
    let mut sizes = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count - 1 {
        let mut size = 0usize;
        loop {
            let b = *rest.get(pos)?;
            pos += 1;
            size += usize::from(b);
            if b != 255 {
                break;
            }
        }
        sizes.push(size);
    }

    let mut data = &rest[pos..];
    let mut headers = Vec::with_capacity(count);
    for size in sizes {
        if size > data.len() {
            return None;
        }
        let (header, tail) = data.split_at(size);
        headers.push(header);
        data = tail;
    }
    headers.push(data);
    Some(headers)
}

fn split_length_prefixed(mut data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut headers = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return None;
        }
        let size = usize::from(u16::from_be_bytes([data[0], data[1]]));
        let body = data.get(2..2 + size)?;
        headers.push(body);
        data = &data[2 + size..];
    }
    Some(headers)
}

/// Pack the first three headers into the configuration container,
/// including the 9-byte count/ident/length prefix.
pub fn packed_config(headers: &[&[u8]]) -> Option<Vec<u8>> {
    if headers.len() < 3 {
        return None;
    }

    let mut body = vec![2u8];
    for header in &headers[..2] {
        push_length(&mut body, header.len());
    }
    for header in &headers[..3] {
        body.extend_from_slice(header);
    }

    let total = PACKED_PREFIX_LEN + body.len();
    let length = u16::try_from(total).ok()?;
    let mut packed = Vec::with_capacity(total);
    packed.extend_from_slice(&1u32.to_be_bytes());
    packed.extend_from_slice(&IDENT.to_be_bytes()[1..]);
    packed.extend_from_slice(&length.to_be_bytes());
    packed.extend_from_slice(&body);
    Some(packed)
}

/// 7-bit big-endian groups, continuation bit on all but the last.
fn push_length(out: &mut Vec<u8>, size: usize) {
    let mut groups = Vec::new();
    let mut n = size;
    while n > 0 {
        groups.push((n & 0x7f) as u8);
        n >>= 7;
    }
    for (i, g) in groups.iter().enumerate().rev() {
        out.push(if i > 0 { g | 0x80 } else { *g });
    }
}

/// `fmtp` for Vorbis: `configuration=<base64>;`.
pub fn vorbis_fmtp(extradata: &[u8]) -> Option<String> {
    let headers = split_headers(extradata)?;
    let config = packed_config(&headers)?;
    Some(format!("configuration={};", BASE64_STANDARD.encode(config)))
}

/// `fmtp` for Theora, including sampling and frame size.
///
/// The chroma format comes from the identification header (byte 41).
/// The reserved format yields no fmtp.
pub fn theora_fmtp(extradata: &[u8], width: u32, height: u32) -> Option<String> {
    let headers = split_headers(extradata)?;
    let ident = headers.first()?;
    if ident.len() < 42 {
        return None;
    }
    let (c1, c2) = match (ident[41] >> 3) & 0x03 {
        0 => (2, 0),
        2 => (2, 2),
        3 => (4, 4),
        _ => return None,
    };
    let config = packed_config(&headers)?;
    Some(format!(
        "sampling=YCbCr-4:{}:{}; width={}; height={}; delivery-method=inline; configuration={}; delivery-method=in_band;",
        c1,
        c2,
        width,
        height,
        BASE64_STANDARD.encode(config)
    ))
}

/// Whether the format asks for the configuration to be repeated in band.
pub fn wants_inband_config(fmtp: &str) -> bool {
    fmtp.contains("delivery-method=in_band")
}

/// Packetize one codec packet as raw Xiph data.
pub fn packetize(out: &mut PacketWriter<'_>, block: &Block) {
    fragment(out, &block.data, DATA_TYPE_RAW, block.pts_or_dts(), |i, n| block.fragment_dts(i, n));
}

/// Send the packed configuration from `fmtp` in band (data type 1).
pub fn packetize_config(out: &mut PacketWriter<'_>, fmtp: &str, pts: i64) {
    let Some(config) = decode_config(fmtp) else {
        tracing::debug!("no usable configuration in fmtp, in-band config skipped");
        return;
    };
    fragment(out, &config[PACKED_PREFIX_LEN..], DATA_TYPE_CONFIG, pts, |_, _| pts);
}

fn decode_config(fmtp: &str) -> Option<Vec<u8>> {
    let start = fmtp.find("configuration=")? + "configuration=".len();
    let value = &fmtp[start..];
    let end = value.find(';')?;
    let config = BASE64_STANDARD.decode(&value[..end]).ok()?;
    (config.len() > PACKED_PREFIX_LEN).then_some(config)
}

fn fragment(
    out: &mut PacketWriter<'_>,
    data: &[u8],
    data_type: u32,
    pts: i64,
    dts_of: impl Fn(usize, usize) -> i64,
) {
    let max = out.room().saturating_sub(PAYLOAD_HEADER_LEN);
    if max == 0 || data.is_empty() {
        return;
    }
    let count = data.len().div_ceil(max);

    for (i, chunk) in data.chunks(max).enumerate() {
        let (frag_type, packets) = match (count, i) {
            (1, _) => (0, 1),
            (_, 0) => (1, 0),
            (n, i) if i + 1 == n => (3, 0),
            _ => (2, 0),
        };
        let header = ((IDENT & 0x00ff_ffff) << 8) | (frag_type << 6) | (data_type << 4) | packets;
        let length = chunk.len() as u16;
        out.push(false, pts, dts_of(i, count), &[&header.to_be_bytes(), &length.to_be_bytes(), chunk]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RtpPacket;
    use crate::media::rtp::RtpHeader;

    fn headers() -> Vec<Vec<u8>> {
        let mut ident = vec![0x80];
        ident.extend(b"theora");
        ident.resize(42, 0);
        ident[41] = 2 << 3; // 4:2:2
        let comment = vec![0x81; 300];
        let setup = vec![0x82; 20];
        vec![ident, comment, setup]
    }

    fn laced(headers: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![2u8];
        for h in &headers[..2] {
            let mut n = h.len();
            while n >= 255 {
                out.push(255);
                n -= 255;
            }
            out.push(n as u8);
        }
        for h in headers {
            out.extend_from_slice(h);
        }
        out
    }

    fn packetize_all(data: Vec<u8>, mtu: usize) -> Vec<RtpPacket> {
        let mut header = RtpHeader::new(96, 1, 90000, 0);
        let mut out = PacketWriter::new(&mut header, mtu);
        packetize(&mut out, &Block::new(data, 0));
        out.into_packets()
    }

    #[test]
    fn split_laced_headers() {
        let hs = headers();
        let extradata = laced(&hs);
        let split = split_headers(&extradata).unwrap();
        assert_eq!(split.len(), 3);
        assert_eq!(split[1], &hs[1][..]);
        assert_eq!(split[2], &hs[2][..]);
    }

    #[test]
    fn split_length_prefixed_headers() {
        let hs = headers();
        let mut extradata = Vec::new();
        for h in &hs {
            extradata.extend_from_slice(&(h.len() as u16).to_be_bytes());
            extradata.extend_from_slice(h);
        }
        let split = split_headers(&extradata).unwrap();
        assert_eq!(split, hs.iter().map(|h| &h[..]).collect::<Vec<_>>());
    }

    #[test]
    fn split_rejects_truncated() {
        assert!(split_headers(&[]).is_none());
        assert!(split_headers(&[0, 10, 1, 2]).is_none());
        assert!(split_headers(&[2, 200, 5, 1]).is_none());
    }

    #[test]
    fn packed_config_layout() {
        let hs = headers();
        let refs: Vec<&[u8]> = hs.iter().map(|h| &h[..]).collect();
        let packed = packed_config(&refs).unwrap();
        assert_eq!(&packed[..4], &[0, 0, 0, 1]);
        assert_eq!(&packed[4..7], &[0, 0, 0]);
        assert_eq!(usize::from(u16::from_be_bytes([packed[7], packed[8]])), packed.len());
        // count, then 42 in one byte and 300 = 0b10_0101100 in two.
        assert_eq!(&packed[9..13], &[2, 42, 0x82, 0x2c]);
        assert_eq!(packed.len(), 9 + 4 + 42 + 300 + 20);
    }

    #[test]
    fn theora_fmtp_sampling() {
        let extradata = laced(&headers());
        let fmtp = theora_fmtp(&extradata, 640, 480).unwrap();
        assert!(fmtp.starts_with("sampling=YCbCr-4:2:2; width=640; height=480; delivery-method=inline; configuration="));
        assert!(fmtp.ends_with("; delivery-method=in_band;"));
        assert!(wants_inband_config(&fmtp));
    }

    #[test]
    fn theora_reserved_pixel_format() {
        let mut hs = headers();
        hs[0][41] = 1 << 3;
        assert!(theora_fmtp(&laced(&hs), 640, 480).is_none());
    }

    #[test]
    fn vorbis_fmtp_round_trips_configuration() {
        let fmtp = vorbis_fmtp(&laced(&headers())).unwrap();
        let config = decode_config(&fmtp).unwrap();
        assert_eq!(config[9], 2);
    }

    #[test]
    fn single_packet_unfragmented() {
        let packets = packetize_all(vec![7; 100], 1400);
        assert_eq!(packets.len(), 1);
        let p = packets[0].payload();
        assert_eq!(&p[..4], &[0, 0, 0, 0x01]); // F=0, TDT=0, 1 packet
        assert_eq!(u16::from_be_bytes([p[4], p[5]]), 100);
    }

    #[test]
    fn fragmented_round_trip() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let packets = packetize_all(data.clone(), 12 + 6 + 300);
        assert_eq!(packets.len(), 4);

        let frag_types: Vec<u8> = packets.iter().map(|p| p.payload()[3] >> 6).collect();
        assert_eq!(frag_types, vec![1, 2, 2, 3]);

        let mut rebuilt = Vec::new();
        for p in &packets {
            let payload = p.payload();
            assert_eq!(payload[3] & 0x0f, 0, "fragments carry no packet count");
            let len = usize::from(u16::from_be_bytes([payload[4], payload[5]]));
            rebuilt.extend_from_slice(&payload[6..6 + len]);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn inband_config_uses_config_data_type() {
        let fmtp = vorbis_fmtp(&laced(&headers())).unwrap();
        let mut header = RtpHeader::new(96, 1, 90000, 0);
        let mut out = PacketWriter::new(&mut header, 200);
        packetize_config(&mut out, &fmtp, 0);
        let packets = out.into_packets();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| (p.payload()[3] >> 4) & 0x03 == 1));
    }
}
