//! H.263+ (RFC 4629) and VP8 (RFC 7741) packetizers.

use super::Block;
use super::rtp::PacketWriter;

/// H.263 picture start code prefix bit in the RFC 4629 header.
const H263_P_BIT: u16 = 1 << 10;
/// VP8 payload descriptor `S` bit: start of a partition.
const VP8_START_OF_PARTITION: u8 = 0x10;

/// H.263-1998: frames must start with the picture start code, whose two
/// zero bytes are elided and signalled by `P=1` in the first packet.
pub fn packetize_h263(out: &mut PacketWriter<'_>, block: &Block) {
    let data = match block.data.as_slice() {
        [0, 0, rest @ ..] if !rest.is_empty() => rest,
        _ => {
            tracing::debug!("H.263 frame without picture start code, dropped");
            return;
        }
    };
    let max = out.room().saturating_sub(2);
    if max == 0 {
        return;
    }

    let count = data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in data.chunks(max).enumerate() {
        let header = if i == 0 { H263_P_BIT } else { 0 };
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[&header.to_be_bytes(), chunk]);
    }
}

/// VP8 with a 1-byte payload descriptor; every frame is one partition.
pub fn packetize_vp8(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room().saturating_sub(1);
    if max == 0 || block.data.is_empty() {
        return;
    }

    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        let descriptor = if i == 0 { VP8_START_OF_PARTITION } else { 0 };
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[&[descriptor], chunk]);
    }
}
