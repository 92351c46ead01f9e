//! Payload formats without a payload-specific header.
//!
//! - **Simple**: one block per packet, marker on discontinuity (Opus).
//! - **Split**: plain MTU split with the marker on the last packet
//!   (GSM, MPEG-4 video).
//! - **PCM**: MTU split where each packet advances the presentation time
//!   by its share of the block duration (RFC 3551 §4.5.10-11). Little-endian
//!   16-bit input is swapped to network order.
//! - **T.140**: real-time text (RFC 4103), split on UTF-8 boundaries.

use super::Block;
use super::rtp::PacketWriter;

pub fn packetize_simple(out: &mut PacketWriter<'_>, block: &Block) {
    out.push(block.discontinuity, block.pts_or_dts(), block.dts, &[&block.data]);
}

pub fn packetize_split(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room();
    if max == 0 || block.data.is_empty() {
        return;
    }
    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[chunk]);
    }
}

/// Split raw samples. Only the first packet of a discontinuous block
/// carries the marker.
pub fn packetize_pcm(out: &mut PacketWriter<'_>, block: &Block, swab: bool) {
    let max = out.room();
    if max == 0 {
        return;
    }

    let mut data = &block.data[..];
    let mut pts = block.pts_or_dts();
    let mut dts = block.dts;
    let mut length = block.duration;
    let mut marker = block.discontinuity;

    loop {
        let size = data.len().min(max);
        let duration = if data.is_empty() {
            0
        } else {
            length * size as i64 / data.len() as i64
        };
        let (chunk, rest) = data.split_at(size);

        if swab {
            out.push(marker, pts, dts, &[&swap_pairs(chunk)]);
        } else {
            out.push(marker, pts, dts, &[chunk]);
        }

        data = rest;
        if data.is_empty() {
            break;
        }
        pts += duration;
        dts += duration;
        length -= duration;
        marker = false;
    }
}

/// Swap every byte pair; an odd trailing byte is copied as-is.
fn swap_pairs(data: &[u8]) -> Vec<u8> {
    let mut swapped = Vec::with_capacity(data.len());
    let mut pairs = data.chunks_exact(2);
    for pair in pairs.by_ref() {
        swapped.extend_from_slice(&[pair[1], pair[0]]);
    }
    swapped.extend_from_slice(pairs.remainder());
    swapped
}

/// Split text on character boundaries. Packet `n` is stamped `pts + n`
/// so redundant receivers can order them; no marker is set.
pub fn packetize_t140(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room();
    if max == 0 {
        return;
    }
    let pts = block.pts_or_dts();
    let mut data = &block.data[..];
    let mut n = 0i64;

    while !data.is_empty() {
        let mut size = data.len();
        if size > max {
            size = max;
            // Back up over UTF-8 continuation bytes.
            while data[size] & 0xc0 == 0x80 {
                if size == 0 {
                    tracing::debug!("T.140 block has no character boundary, dropped");
                    return;
                }
                size -= 1;
            }
            if size == 0 {
                tracing::debug!("T.140 character larger than payload room, dropped");
                return;
            }
        }

        let (chunk, rest) = data.split_at(size);
        out.push(false, pts + n, pts, &[chunk]);
        data = rest;
        n += 1;
    }
}
