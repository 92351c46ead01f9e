//! MJPEG RTP packetizer: RFC 2435.
//!
//! Simpler than H.264/H.265:
//!
//! - Each JPEG frame maps to one or more RTP packets.
//! - The JFIF headers are parsed and stripped; only the entropy-coded scan
//!   is sent, preceded by an 8-byte JPEG header
//!   (fragment offset, type, Q, width/8, height/8).
//! - With a restart interval (DRI), a 4-byte restart marker header follows.
//! - The first packet of a frame carries the quantization tables in-band
//!   (Q = 255).
//! - Uses static payload type 26: `a=rtpmap:26 JPEG/90000`
//!
//! Only baseline 8-bit, 3-component 4:2:0 / 4:2:2 images up to 2040
//! pixels per side can be described; anything else is dropped.

use super::Block;
use super::rtp::PacketWriter;

const SOI: u16 = 0xffd8;
const DQT: u16 = 0xffdb;
const SOF0: u16 = 0xffc0;
const DRI: u16 = 0xffdd;
const SOS: u16 = 0xffda;

const MAX_DIMENSION: u16 = 2040;
const QTABLE_LEN: usize = 64;
/// Dynamic quantization tables (RFC 2435 §3.1.8).
const Q_INBAND: u8 = 255;

/// Frame parameters gathered from the JFIF headers.
#[derive(Debug, PartialEq, Eq)]
struct FrameInfo<'a> {
    kind: u8,
    width: u8,
    height: u8,
    restart_interval: Option<u16>,
    qtables: Vec<&'a [u8]>,
    /// Entropy-coded data following the SOS segment.
    scan: &'a [u8],
}

fn be16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]))
}

fn parse(data: &[u8]) -> Option<FrameInfo<'_>> {
    if be16(data, 0)? != SOI {
        return None;
    }

    let mut pos = 2;
    let mut qtables = Vec::new();
    let mut dims: Option<(u8, u8)> = None;
    let mut y_sampling = 0u8;
    let mut restart_interval = None;

    loop {
        let marker = be16(data, pos)?;
        let size = usize::from(be16(data, pos + 2)?);
        if size < 2 || pos + 2 + size > data.len() {
            return None;
        }
        let body = &data[pos + 4..pos + 2 + size];
        pos += 2 + size;

        match marker {
            DQT => {
                for table in body.chunks_exact(QTABLE_LEN + 1) {
                    // Pq (upper nibble) 0 means 8-bit precision.
                    if table[0] >> 4 != 0 {
                        return None;
                    }
                    qtables.push(&table[1..]);
                }
            }
            SOF0 => {
                let height = be16(body, 1)?;
                let width = be16(body, 3)?;
                if width > MAX_DIMENSION || height > MAX_DIMENSION || *body.get(5)? != 3 {
                    return None;
                }
                dims = Some((width.div_ceil(8) as u8, height.div_ceil(8) as u8));
                for component in body.get(6..15)?.chunks_exact(3) {
                    if component[0] == 1 {
                        y_sampling = component[1];
                    } else if component[1] != 0x11 {
                        return None;
                    }
                }
            }
            DRI => restart_interval = Some(be16(body, 0)?),
            SOS => break,
            _ => {}
        }
    }

    let (width, height) = dims.filter(|&(w, h)| w > 0 && h > 0)?;
    let mut kind = match y_sampling {
        0x22 => 1,
        0x21 => 0,
        _ => return None,
    };
    if restart_interval.is_some() {
        kind += 64;
    }

    Some(FrameInfo {
        kind,
        width,
        height,
        restart_interval,
        qtables,
        scan: &data[pos..],
    })
}

pub fn packetize(out: &mut PacketWriter<'_>, block: &Block) {
    let Some(frame) = parse(&block.data) else {
        tracing::debug!(size = block.data.len(), "unsupported or malformed JPEG frame, dropped");
        return;
    };

    let mut main = [0u8; 8];
    main[4] = frame.kind;
    main[5] = Q_INBAND;
    main[6] = frame.width;
    main[7] = frame.height;

    let restart = frame
        .restart_interval
        .map(|interval| {
            let i = interval.to_be_bytes();
            // F=1, L=1, restart count 0x3fff.
            vec![i[0], i[1], 0xff, 0xff]
        })
        .unwrap_or_default();

    let mut quant = Vec::new();
    if !frame.qtables.is_empty() {
        let length = ((QTABLE_LEN * frame.qtables.len()) as u16).to_be_bytes();
        quant.extend_from_slice(&[0, 0, length[0], length[1]]);
        for table in &frame.qtables {
            quant.extend_from_slice(table);
        }
    }

    let pts = block.pts_or_dts();
    let mut offset = 0usize;
    let mut data = frame.scan;
    let mut sent = Vec::new();

    while !data.is_empty() {
        let mut header_len = main.len() + restart.len();
        if offset == 0 {
            header_len += quant.len();
        }
        let max = out.room().saturating_sub(header_len);
        if max == 0 {
            tracing::warn!(header_len, room = out.room(), "JPEG headers exceed payload room, frame dropped");
            return;
        }
        let size = data.len().min(max);
        main[1..4].copy_from_slice(&(offset as u32).to_be_bytes()[1..]);
        let quant_part: &[u8] = if offset == 0 { &quant } else { &[] };
        sent.push((size == data.len(), main, quant_part.to_vec(), &data[..size]));
        offset += size;
        data = &data[size..];
    }

    let count = sent.len();
    for (i, (last, main, quant, chunk)) in sent.into_iter().enumerate() {
        out.push(last, pts, block.fragment_dts(i, count), &[&main[..], &restart[..], &quant[..], chunk]);
    }
}
