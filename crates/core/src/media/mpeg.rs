//! MPEG-1/2 elementary streams over RTP (RFC 2250).
//!
//! Both formats use a 4-byte payload-specific header and the 90 kHz clock.
//!
//! Audio (§3.5): `MBZ(16) | Frag_offset(16)`.
//!
//! Video (§3.4):
//!
//! ```text
//! MBZ:5 T:1 TR:10 AN:1 N:1 S:1 B:1 E:1 P:3 FBV:1 BFC:3 FFV:1 FFC:3
//! ```
//!
//! The video header fields are taken from the start codes found in the
//! frame and repeated in every fragment; only `E` (end of slice) varies.

use super::Block;
use super::h264::nal_units;
use super::rtp::PacketWriter;

const SEQUENCE_HEADER: u8 = 0xb3;
const PICTURE_START: u8 = 0x00;
const LAST_SLICE_START: u8 = 0xaf;

pub fn packetize_audio(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room().saturating_sub(4);
    if max == 0 || block.data.is_empty() {
        return;
    }
    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        let offset = ((i * max) as u16).to_be_bytes();
        out.push(i + 1 == count, pts, block.fragment_dts(i, count), &[&[0, 0, offset[0], offset[1]], chunk]);
    }
}

/// Picture fields gathered from the start codes of one frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PictureInfo {
    sequence_start: bool,
    slice_start: bool,
    temporal_ref: u32,
    coding_type: u32,
    fbv: u32,
    bfc: u32,
    ffv: u32,
    ffc: u32,
}

impl PictureInfo {
    fn scan(data: &[u8]) -> Self {
        let mut info = Self::default();
        for p in nal_units(data) {
            match p[0] {
                SEQUENCE_HEADER => info.sequence_start = true,
                PICTURE_START if p.len() >= 5 => {
                    info.temporal_ref = (u32::from(p[1]) << 2) | (u32::from(p[2]) >> 6);
                    info.coding_type = (u32::from(p[2]) >> 3) & 0x07;
                    // P and B pictures carry forward vectors, B also backward.
                    if matches!(info.coding_type, 2 | 3) {
                        info.ffv = (u32::from(p[3]) >> 2) & 0x01;
                        info.ffc = ((u32::from(p[3]) & 0x03) << 1) | (u32::from(p[4]) >> 7);
                        if p.len() > 5 && info.coding_type == 3 {
                            info.fbv = (u32::from(p[4]) >> 6) & 0x01;
                            info.bfc = (u32::from(p[4]) >> 3) & 0x07;
                        }
                    }
                }
                // A picture start code too short to parse counts as a slice.
                code if code <= LAST_SLICE_START => info.slice_start = true,
                _ => {}
            }
        }
        info
    }

    fn header(&self, end_of_slice: bool) -> u32 {
        (self.temporal_ref << 16)
            | (u32::from(self.sequence_start) << 13)
            | (u32::from(self.slice_start) << 12)
            | (u32::from(end_of_slice) << 11)
            | (self.coding_type << 8)
            | (self.fbv << 7)
            | (self.bfc << 4)
            | (self.ffv << 3)
            | self.ffc
    }
}

pub fn packetize_video(out: &mut PacketWriter<'_>, block: &Block) {
    let max = out.room().saturating_sub(4);
    if max == 0 || block.data.is_empty() {
        return;
    }
    let info = PictureInfo::scan(&block.data);
    let count = block.data.len().div_ceil(max);
    let pts = block.pts_or_dts();
    for (i, chunk) in block.data.chunks(max).enumerate() {
        let last = i + 1 == count;
        out.push(last, pts, block.fragment_dts(i, count), &[&info.header(last).to_be_bytes(), chunk]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::RtpPacket;
    use crate::media::rtp::RtpHeader;

    fn run(f: fn(&mut PacketWriter<'_>, &Block), data: Vec<u8>, mtu: usize) -> Vec<RtpPacket> {
        let mut header = RtpHeader::new(32, 1, 90000, 0);
        let mut out = PacketWriter::new(&mut header, mtu);
        f(&mut out, &Block::new(data, 0));
        out.into_packets()
    }

    #[test]
    fn audio_fragment_offsets() {
        let packets = run(packetize_audio, vec![0; 250], 12 + 104);
        let offsets: Vec<u16> = packets
            .iter()
            .map(|p| u16::from_be_bytes([p.payload()[2], p.payload()[3]]))
            .collect();
        assert_eq!(offsets, vec![0, 100, 200]);
        assert!(packets.iter().all(|p| p.payload()[..2] == [0, 0]));
        assert!(packets[2].marker());
    }

    #[test]
    fn picture_header_fields() {
        // Sequence header, then a B picture with TR=5.
        let mut data = vec![0, 0, 1, 0xb3, 0x14, 0x00];
        // TR=5: p1=0x01, p2=0b01_011_000 (TR low bits 01, PCT 3).
        data.extend_from_slice(&[0, 0, 1, 0x00, 0x01, 0x58, 0x07, 0xd8, 0xff]);
        data.extend_from_slice(&[0, 0, 1, 0x01, 0xaa]);

        let info = PictureInfo::scan(&data);
        assert!(info.sequence_start);
        assert!(info.slice_start);
        assert_eq!(info.temporal_ref, 5);
        assert_eq!(info.coding_type, 3);
        assert_eq!(info.ffv, 1);
        assert_eq!(info.ffc, 0b111);
        assert_eq!(info.fbv, 1);
        assert_eq!(info.bfc, 0b011);
    }

    #[test]
    fn truncated_picture_header_marks_slice_start() {
        let info = PictureInfo::scan(&[0, 0, 1, 0xb3, 0x14, 0, 0, 1, 0x00, 0x01, 0x58]);
        assert!(info.sequence_start);
        assert!(info.slice_start);
        assert_eq!(info.coding_type, 0);

        let complete = PictureInfo::scan(&[0, 0, 1, 0x00, 0x00, 0x08, 0xff, 0xff]);
        assert!(!complete.slice_start);
        assert_eq!(complete.coding_type, 1);
    }

    #[test]
    fn video_end_bit_on_last_fragment() {
        let mut data = vec![0, 0, 1, 0x00, 0x00, 0x08, 0xff, 0xff];
        data.resize(300, 0x11);
        let packets = run(packetize_video, data, 12 + 104);
        assert_eq!(packets.len(), 3);
        for (i, p) in packets.iter().enumerate() {
            let h = u32::from_be_bytes([p.payload()[0], p.payload()[1], p.payload()[2], p.payload()[3]]);
            assert_eq!((h >> 8) & 0x07, 1, "I picture");
            assert_eq!(h & (1 << 11) != 0, i == 2);
        }
        assert!(packets[2].marker());
    }
}
