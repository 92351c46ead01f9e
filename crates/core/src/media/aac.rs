//! AAC packetizers: `mpeg4-generic` (RFC 3640, AAC-hbr) and `MP4A-LATM`
//! (RFC 3016).
//!
//! AAC-hbr prefixes every packet with a 16-bit AU-headers-length (always
//! 16 bits) followed by one AU header: 13-bit AU size and 3-bit index.
//! A fragmented access unit repeats the same AU header in each fragment.
//!
//! LATM carries the frame length in front of the first packet as
//! `PayloadLengthInfo`: a run of 0xFF bytes and a final remainder byte.

use super::Block;
use super::hex;
use super::rtp::PacketWriter;

/// Sampling frequency table of ISO 14496-3 §1.6.3.4.
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// `fmtp` for AAC-hbr with the AudioSpecificConfig in `config=`.
pub fn generic_fmtp(extradata: &[u8]) -> String {
    format!(
        "streamtype=5; profile-level-id=15; mode=AAC-hbr; config={}; \
         SizeLength=13; IndexLength=3; IndexDeltaLength=3; Profile=1;",
        hex(extradata)
    )
}

/// `fmtp` for LATM with a StreamMuxConfig built from rate and channels.
///
/// Unknown rates use the escape index 15.
pub fn latm_fmtp(rate: u32, channels: u8) -> String {
    let index = SAMPLE_RATES
        .iter()
        .position(|&r| r == rate)
        .unwrap_or(15) as u8;
    let config = [0x40, 0x00, 0x20 | index, channels << 4, 0x3f, 0xc0];
    format!("profile-level-id=15; object=2; cpresent=0; config={}", hex(&config))
}

pub fn packetize_generic(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room().saturating_sub(4);
    if max == 0 || block.data.is_empty() {
        return;
    }
    // 13-bit AU size, index 0.
    let au_header = ((block.data.len() as u16) << 3).to_be_bytes();
    let header = [0x00, 0x10, au_header[0], au_header[1]];

    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[&header, chunk]);
    }
}

pub fn packetize_latm(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room();
    if max == 0 || block.data.is_empty() {
        return;
    }

    let mut payload = Vec::with_capacity(block.data.len() / 0xff + 1 + block.data.len());
    let mut remaining = block.data.len();
    while remaining > 0xfe {
        payload.push(0xff);
        remaining -= 0xff;
    }
    payload.push(remaining as u8);
    payload.extend_from_slice(&block.data);

    let count = payload.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in payload.chunks(max).enumerate() {
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[chunk]);
    }
}
