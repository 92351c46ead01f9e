//! H.265 (HEVC) RTP packetizer (RFC 7798).
//!
//! Key differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header**. The NAL type is in bits 1..6 of the
//!   first byte.
//! - **FU packets** (§4.4.3) replace the NAL header with a payload header
//!   of type 49 and add a 1-byte FU header `[S|E|FuType]`.
//! - **SDP parameters** (§7.1) carry parameter sets per type:
//!   `sprop-vps`, `sprop-sps`, `sprop-pps`, `sprop-sei`.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Block;
use super::h264::nal_units;
use super::rtp::PacketWriter;

const NAL_TYPE_VPS: u8 = 32;
const NAL_TYPE_SPS: u8 = 33;
const NAL_TYPE_PPS: u8 = 34;
const NAL_TYPE_PREFIX_SEI: u8 = 39;
const NAL_TYPE_SUFFIX_SEI: u8 = 40;
/// Payload header of an FU packet: type 49, F/LayerId/TID taken from the NAL.
const FU_PAYLOAD_HEADER: u16 = 49 << 9;

fn nal_type(nal: &[u8]) -> u8 {
    (nal[0] & 0x7e) >> 1
}

/// Build the `fmtp` value from Annex B extradata.
///
/// Always starts with `tx-mode=SRST;`. Profile, level, tier and profile
/// space come from the first SPS's `profile_tier_level()`. Multiple
/// parameter sets of one kind are comma separated.
pub fn fmtp(extradata: &[u8]) -> String {
    let mut sets: [(&str, Vec<String>); 4] = [
        ("vps", Vec::new()),
        ("sps", Vec::new()),
        ("pps", Vec::new()),
        ("sei", Vec::new()),
    ];
    let mut ptl: Option<(u8, u8, u8, u8)> = None;

    for nal in nal_units(extradata) {
        if nal.len() < 3 {
            continue;
        }
        let slot = match nal_type(nal) {
            NAL_TYPE_VPS => 0,
            NAL_TYPE_SPS => 1,
            NAL_TYPE_PPS => 2,
            NAL_TYPE_PREFIX_SEI | NAL_TYPE_SUFFIX_SEI => 3,
            _ => continue,
        };
        sets[slot].1.push(BASE64_STANDARD.encode(nal));

        // NAL header (2) + vps_id/max_sub_layers/nesting (1), then
        // profile_tier_level: space(2) tier(1) profile(5), 4 bytes of
        // compatibility flags, 6 bytes of constraint flags, level.
        if slot == 1 && ptl.is_none() && nal.len() > 14 {
            let b = nal[3];
            ptl = Some((b & 0x1f, nal[14], (b >> 5) & 1, b >> 6));
        }
    }

    let mut fmtp = String::from("tx-mode=SRST;");
    if let Some((profile, level, tier, space)) = ptl {
        fmtp.push_str(&format!(
            "profile-id={};level-id={};tier-flag={};profile-space={};",
            profile, level, tier, space
        ));
    }
    for (name, values) in &sets {
        if !values.is_empty() {
            fmtp.push_str(&format!("sprop-{}={};", name, values.join(",")));
        }
    }
    fmtp
}

/// Packetize one access unit.
pub fn packetize(out: &mut PacketWriter<'_>, block: &Block) {
    let nals = nal_units(&block.data);
    let pts = block.pts_or_dts();
    let total = block.data.len().max(1) as i64;

    for (i, nal) in nals.iter().enumerate() {
        let duration = block.duration * nal.len() as i64 / total;
        packetize_nal(out, nal, pts, block.dts, duration, i + 1 == nals.len());
    }
}

fn packetize_nal(
    out: &mut PacketWriter<'_>,
    nal: &[u8],
    pts: i64,
    dts: i64,
    duration: i64,
    last_nal: bool,
) {
    if nal.len() < 3 {
        return;
    }

    let room = out.room();
    if nal.len() <= room {
        out.push(last_nal, pts, dts, &[nal]);
        return;
    }
    if room <= 3 {
        tracing::warn!(room, "payload room too small for FU, NAL dropped");
        return;
    }

    let header = (u16::from_be_bytes([nal[0], nal[1]]) & 0x81ff) | FU_PAYLOAD_HEADER;
    let header = header.to_be_bytes();
    let fu_type = nal_type(nal);
    let payload = &nal[2..];
    let max_fragment = room - 3;
    let count = payload.len().div_ceil(max_fragment);

    for (i, chunk) in payload.chunks(max_fragment).enumerate() {
        let last = i + 1 == count;
        let fu_header = (if i == 0 { 0x80 } else { 0 }) | (if last { 0x40 } else { 0 }) | fu_type;
        let frag_dts = dts + i as i64 * duration / count as i64;
        out.push(
            last_nal && last,
            pts,
            frag_dts,
            &[&[header[0], header[1], fu_header], chunk],
        );
    }

    tracing::trace!(fu_type, nal_size = nal.len(), fragments = count, "FU fragmented NAL unit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;

    #[test]
    fn fmtp_without_extradata() {
        assert_eq!(fmtp(&[]), "tx-mode=SRST;");
    }

    #[test]
    fn fmtp_collects_parameter_sets() {
        let vps = [0x40, 0x01, 0x0c];
        let mut sps = vec![0x42, 0x01, 0x01, 0x21, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0x5d, 0xa0];
        sps.truncate(16);
        let pps = [0x44, 0x01, 0xc1];
        let data = [
            &[0u8, 0, 0, 1][..],
            &vps[..],
            &[0, 0, 0, 1][..],
            &sps[..],
            &[0, 0, 0, 1][..],
            &pps[..],
        ]
        .concat();
        let f = fmtp(&data);
        assert!(f.starts_with("tx-mode=SRST;profile-id=1;level-id=93;tier-flag=1;profile-space=0;"));
        assert!(f.contains("sprop-vps=QAEM;"));
        assert!(f.contains("sprop-pps=RAHB;"));
        assert!(f.contains("sprop-sps="));
    }

    #[test]
    fn fu_fragmentation_round_trip() {
        let mut nal = vec![0x26, 0x01]; // IDR_W_RADL
        nal.extend((0..500).map(|i| i as u8));
        let data = [&[0u8, 0, 0, 1][..], &nal[..]].concat();

        let mut header = RtpHeader::new(96, 1, 90000, 0);
        let mut out = PacketWriter::new(&mut header, 212);
        packetize(&mut out, &Block::new(data, 0));
        let packets = out.into_packets();
        assert_eq!(packets.len(), 3);

        let mut rebuilt = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            let payload = p.payload();
            assert_eq!(nal_type(payload), 49);
            assert_eq!(payload[2] & 0x3f, 19);
            assert_eq!(payload[2] & 0x80 != 0, i == 0);
            assert_eq!(payload[2] & 0x40 != 0, i == 2);
            if i == 0 {
                rebuilt.push((payload[0] & 0x81) | (payload[2] & 0x3f) << 1);
                rebuilt.push(payload[1]);
            }
            rebuilt.extend_from_slice(&payload[3..]);
        }
        assert_eq!(rebuilt, nal);
        assert!(packets[2].marker());
    }
}
