//! H.264 RTP packetizer (RFC 6184).
//!
//! Converts Annex B access units into RTP packets using packetization
//! mode 1 (non-interleaved):
//!
//! - **Single NAL Unit** (§5.6): NALs that fit in the payload room are sent
//!   as-is after the start code is stripped.
//!
//! - **FU-A Fragmentation** (§5.8): larger NALs are split. Each fragment
//!   carries a 2-byte FU header before the NAL payload:
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   Fragment data: [...]               (up to room - 2 bytes)
//!   ```
//!
//! The marker bit is set on the last packet of the access unit (§5.1).

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Block;
use super::rtp::PacketWriter;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_FU_A: u8 = 28;

/// Split an Annex B bitstream into NAL units, excluding start codes.
///
/// Handles both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes,
/// mixed freely. Bytes before the first start code are ignored.
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            starts.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(start, _)) in starts.iter().enumerate() {
        let end = match starts.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nals.push(&data[start..end]);
        }
    }
    nals
}

/// Build the `fmtp` value from Annex B extradata (RFC 6184 §8.1).
///
/// With both an SPS (at least 4 bytes) and a PPS present, the result is
/// `packetization-mode=1;profile-level-id=<hex6>;sprop-parameter-sets=<sps>,<pps>`.
/// Otherwise only `packetization-mode=1`. The last SPS/PPS wins.
pub fn fmtp(extradata: &[u8]) -> String {
    let mut sps: Option<&[u8]> = None;
    let mut pps: Option<&[u8]> = None;

    for nal in nal_units(extradata) {
        if nal.len() < 2 {
            continue;
        }
        match nal[0] & 0x1f {
            NAL_TYPE_SPS if nal.len() >= 4 => sps = Some(nal),
            NAL_TYPE_PPS => pps = Some(nal),
            _ => {}
        }
    }

    match (sps, pps) {
        (Some(sps), Some(pps)) => format!(
            "packetization-mode=1;profile-level-id={:02x}{:02x}{:02x};sprop-parameter-sets={},{}",
            sps[1],
            sps[2],
            sps[3],
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ),
        _ => "packetization-mode=1".to_string(),
    }
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

    tracing::trace!(
        nal_count = nals.len(),
        rtp_packets = out.len(),
        frame_bytes = block.data.len(),
        "access unit packetized"
    );
}

fn packetize_nal(
    out: &mut PacketWriter<'_>,
    nal: &[u8],
    pts: i64,
    dts: i64,
    duration: i64,
    last_nal: bool,
) {
    if nal.len() < 2 {
        return;
    }

    let room = out.room();
    if nal.len() <= room {
        out.push(last_nal, pts, dts, &[nal]);
        return;
    }
    if room <= 2 {
        tracing::warn!(room, "payload room too small for FU-A, NAL dropped");
        return;
    }

    let nal_header = nal[0];
    let nal_type = nal_header & 0x1f;
    // FU indicator keeps F and NRI from the original NAL header.
    let fu_indicator = (nal_header & 0x60) | NAL_TYPE_FU_A;
    let payload = &nal[1..];
    let max_fragment = room - 2;
    let count = payload.len().div_ceil(max_fragment);

    for (i, chunk) in payload.chunks(max_fragment).enumerate() {
        let first = i == 0;
        let last = i + 1 == count;
        let fu_header = (if first { 0x80 } else { 0 }) | (if last { 0x40 } else { 0 }) | nal_type;
        let frag_dts = dts + i as i64 * duration / count as i64;
        out.push(last_nal && last, pts, frag_dts, &[&[fu_indicator, fu_header], chunk]);
    }

    tracing::trace!(nal_type, nal_size = nal.len(), fragments = count, "FU-A fragmented NAL unit");
}
