//! Uncompressed video over RTP (RFC 4175).
//!
//! Each packet carries the high 16 bits of the extended sequence number,
//! then one 6-byte header per line segment, then the segments' pixel data:
//!
//! ```text
//! Extended seq (16)
//! Length (16) | F (1) Line No (15) | C (1) Offset (15)   repeated while C=1
//! pixel data of every segment, in header order
//! ```
//!
//! Segments are cut on pixel-group boundaries. The marker bit is set on the
//! packet that carries the last line of the frame.

use super::Block;
use super::rtp::PacketWriter;

const EXTENDED_SEQ_LEN: usize = 2;
const LINE_HEADER_LEN: usize = 6;
const CONTINUATION: u16 = 0x8000;
/// Line numbers and offsets are 15-bit fields.
pub const MAX_DIMENSION: u32 = 0x7fff;

/// Pixel layout of a raw video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    /// Planar 4:2:0, sent as 6-byte groups of 2x2 pixels.
    YCbCr420,
    /// Packed 8-bit RGB, 3-byte groups of one pixel.
    Rgb,
}

impl Sampling {
    /// Bytes in one pixel group.
    fn pgroup(self) -> usize {
        match self {
            Self::YCbCr420 => 6,
            Self::Rgb => 3,
        }
    }

    /// Horizontal and vertical subsampling factor.
    fn decimation(self) -> usize {
        match self {
            Self::YCbCr420 => 2,
            Self::Rgb => 1,
        }
    }

    pub fn fmtp(self, width: u32, height: u32) -> String {
        match self {
            Self::YCbCr420 => format!(
                "sampling=YCbCr-4:2:0; width={}; height={}; depth=8; colorimetry=BT{}",
                width,
                height,
                if height > 576 { "709-2" } else { "601-5" }
            ),
            Self::Rgb => format!(
                "sampling=RGB; width={}; height={}; depth=8; colorimetry=SMPTE240M",
                width, height
            ),
        }
    }

    /// Bytes in one complete frame.
    fn frame_len(self, width: usize, height: usize) -> usize {
        let dec = self.decimation();
        height.div_ceil(dec) * (width * self.pgroup() / dec)
    }
}

/// One line segment of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    length: usize,
    line: usize,
    offset: usize,
    more: bool,
}

impl Segment {
    fn header(&self) -> [u8; LINE_HEADER_LEN] {
        let mut h = [0u8; LINE_HEADER_LEN];
        h[0..2].copy_from_slice(&(self.length as u16).to_be_bytes());
        // Progressive only: field bit F stays 0.
        h[2..4].copy_from_slice(&(self.line as u16 & 0x7fff).to_be_bytes());
        let offset = (self.offset as u16 & 0x7fff) | if self.more { CONTINUATION } else { 0 };
        h[4..6].copy_from_slice(&offset.to_be_bytes());
        h
    }
}

pub fn packetize(out: &mut PacketWriter<'_>, block: &Block, sampling: Sampling, width: u16, height: u16) {
    let (width, height) = (usize::from(width), usize::from(height));
    let pgroup = sampling.pgroup();
    let dec = sampling.decimation();
    let min_segment = LINE_HEADER_LEN + pgroup;

    if width == 0 || height == 0 {
        return;
    }
    let expected = sampling.frame_len(width, height);
    if block.data.len() < expected {
        tracing::warn!(len = block.data.len(), expected, "raw video frame too short, dropped");
        return;
    }
    if out.room() <= EXTENDED_SEQ_LEN + min_segment {
        tracing::warn!(room = out.room(), "payload room too small for raw video, frame dropped");
        return;
    }

    let pts = block.pts_or_dts();
    let stride = width * pgroup / dec;
    let (mut line, mut column) = (0usize, 0usize);
    // 4:2:0 planes are consumed in order; RGB is addressed by line/offset.
    let mut cursor = 0usize;

    while line < height {
        let mut room = out.room() - EXTENDED_SEQ_LEN;
        let mut segments = Vec::new();
        let mut more = true;
        while more && room > min_segment {
            room -= LINE_HEADER_LEN;
            let mut pixels = width - column;
            let mut length = pixels * pgroup / dec;
            let next_line = room >= length;
            if !next_line {
                pixels = room / pgroup * dec;
                length = pixels * pgroup / dec;
            }
            room -= length;
            more = room > min_segment && line + dec < height;
            segments.push(Segment {
                length,
                line,
                offset: column,
                more,
            });
            if next_line {
                column = 0;
                line += dec;
            } else {
                column += pixels;
            }
        }

        let mut payload = Vec::with_capacity(out.room());
        payload.extend_from_slice(&((out.extended_sequence() >> 16) as u16).to_be_bytes());
        for segment in &segments {
            payload.extend_from_slice(&segment.header());
        }
        for segment in &segments {
            let start = match sampling {
                Sampling::Rgb => segment.line * stride + segment.offset / dec * pgroup,
                Sampling::YCbCr420 => cursor,
            };
            let Some(pixels) = block.data.get(start..start + segment.length) else {
                tracing::warn!(line = segment.line, offset = segment.offset, "raw video segment out of range");
                return;
            };
            payload.extend_from_slice(pixels);
            cursor += segment.length;
        }
        out.push(line >= height, pts, block.dts, &[&payload]);
    }
}
