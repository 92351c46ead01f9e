//! G.726 ADPCM (RFC 3551 §4.5.4).
//!
//! Samples are packed back to back, so a packet must end on a whole
//! number of samples. The alignment is the smallest byte count holding
//! an integral number of codewords: 4 bytes of 2-bit codes, 8 bytes of
//! 3-bit codes, and so on.

use super::Block;
use super::rtp::PacketWriter;

/// Encoding name and byte alignment for a bitrate in bit/s.
pub fn variant(bitrate: u32) -> Option<(&'static str, usize)> {
    match bitrate / 1000 {
        16 => Some(("G726-16", 4)),
        24 => Some(("G726-24", 8)),
        32 => Some(("G726-32", 2)),
        40 => Some(("G726-40", 8)),
        _ => None,
    }
}

pub fn packetize(out: &mut PacketWriter<'_>, block: &Block, align: usize) {
    let align = align.max(1);
    let max = out.room() / align * align;
    if max == 0 || block.data.is_empty() {
        return;
    }

    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        out.push(false, pts, block.fragment_dts(i, count), &[chunk]);
    }
}
