//! AC-3 (RFC 4184) and Speex (RFC 5574) packetizers.

use super::Block;
use super::rtp::PacketWriter;

/// AC-3: 2-byte header of frame count (always 1) and fragment type 0.
pub fn packetize_ac3(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room().saturating_sub(2);
    if max == 0 || block.data.is_empty() {
        return;
    }
    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[&[1, 0], chunk]);
    }
}

/// Speex frames are never fragmented. The payload is padded to a 4-byte
/// boundary with a `0` bit followed by `1` bits (0x7F, then 0xFF).
pub fn packetize_speex(out: &mut PacketWriter<'_>, block: &Block) {
    if block.data.len() > out.room() {
        tracing::debug!(size = block.data.len(), room = out.room(), "speex frame exceeds MTU, dropped");
        return;
    }

    let padding: &[u8] = match block.data.len() % 4 {
        0 => &[],
        1 => &[0x7f, 0xff, 0xff],
        2 => &[0x7f, 0xff],
        _ => &[0x7f],
    };
    out.push(false, block.pts_or_dts(), block.dts, &[&block.data, padding]);
}
