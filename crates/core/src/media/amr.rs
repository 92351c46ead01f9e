//! AMR and AMR-WB packetizer, octet-aligned mode (RFC 4867 §4.4).
//!
//! Each block holds one storage-format frame: a ToC byte followed by
//! speech bits. On the wire every packet becomes
//! `CMR (0xF0, no request) | ToC (F=0) | speech`.

use super::Block;
use super::rtp::PacketWriter;

/// `fmtp` value advertised for both AMR variants.
pub const FMTP: &str = "octet-align=1";

/// Codec mode request: no mode requested.
const CMR_NONE: u8 = 0xf0;

pub fn packetize(out: &mut PacketWriter<'_>, block: &Block) {
    let data = &block.data;
    // ToC byte plus at least one speech byte.
    if data.len() < 2 {
        return;
    }
    let max = out.room().saturating_sub(2);
    if max == 0 {
        return;
    }

    let count = data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in data.chunks(max).enumerate() {
        let toc = chunk[0] & 0x7c;
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[&[CMR_NONE, toc], &chunk[1..]]);
    }
}
