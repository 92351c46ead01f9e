use super::RtpPacket;

/// Size of the RTP fixed header without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Convert a microsecond timestamp to RTP clock units (mod 2^32).
///
/// The multiply is split into whole seconds and the sub-second remainder
/// so that `pts * clock_rate` never overflows for large presentation
/// times. Negative times round toward negative infinity.
pub fn compute_ts(clock_rate: u32, pts: i64) -> u32 {
    let rate = i64::from(clock_rate);
    let secs = pts.div_euclid(1_000_000);
    let rem = pts.rem_euclid(1_000_000);
    secs.wrapping_mul(rate).wrapping_add(rem * rate / 1_000_000) as u32
}

/// RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One builder belongs to each RTP session and is shared by every codec
/// packetizer through [`PacketWriter`]. It manages:
/// - **Sequence number**: a 32-bit extended counter; the low 16 bits go on
///   the wire. Incremented on every header written.
/// - **Timestamp**: derived from the packet's presentation time with
///   [`compute_ts`] plus a fixed per-session offset, so streams that share
///   an NPT reference stay mutually synchronized.
/// - **SSRC**: random per RFC 3550 §8.1.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    clock_rate: u32,
    sequence: u32,
    offset: Option<u32>,
    last_timestamp: u32,
}

impl RtpHeader {
    /// Create header state with explicit SSRC and initial sequence number.
    pub fn new(pt: u8, ssrc: u32, clock_rate: u32, initial_sequence: u16) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            clock_rate,
            initial_sequence,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            clock_rate,
            sequence: u32::from(initial_sequence),
            offset: None,
            last_timestamp: 0,
        }
    }

    /// Create with a random SSRC and initial sequence number.
    ///
    /// Per RFC 3550 §5.1 both should be unpredictable.
    pub fn with_random_state(pt: u8, clock_rate: u32) -> Self {
        Self::new(pt, rand::random(), clock_rate, rand::random())
    }

    /// Next sequence number to be written (wire representation).
    pub fn sequence(&self) -> u16 {
        self.sequence as u16
    }

    /// Extended sequence counter, counting wraps of the 16-bit field.
    pub fn extended_sequence(&self) -> u32 {
        self.sequence
    }

    /// RTP clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Whether the timestamp offset has been fixed.
    pub fn has_offset(&self) -> bool {
        self.offset.is_some()
    }

    /// Fix the timestamp offset. Later calls are ignored.
    pub fn set_offset(&mut self, offset: u32) {
        if self.offset.is_none() {
            self.offset = Some(offset);
        }
    }

    /// RTP timestamp for a presentation time in microseconds.
    pub fn timestamp_for(&self, pts: i64) -> u32 {
        compute_ts(self.clock_rate, pts).wrapping_add(self.offset.unwrap_or(0))
    }

    /// Timestamp of the most recently written header.
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of a frame
    /// for video; audio formats use it for the first packet after silence.
    pub fn write(&mut self, marker: bool, pts: i64) -> [u8; RTP_HEADER_LEN] {
        let timestamp = self.timestamp_for(pts);

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&(self.sequence as u16).to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        self.last_timestamp = timestamp;
        header
    }
}

/// Collects the RTP packets a packetizer produces for one block.
///
/// Every [`push`](Self::push) writes a fresh fixed header from the session's
/// [`RtpHeader`], so sequence numbers are allocated in emission order.
pub struct PacketWriter<'a> {
    header: &'a mut RtpHeader,
    mtu: usize,
    packets: Vec<RtpPacket>,
}

impl<'a> PacketWriter<'a> {
    pub fn new(header: &'a mut RtpHeader, mtu: usize) -> Self {
        Self {
            header,
            mtu,
            packets: Vec::new(),
        }
    }

    /// Payload bytes available after the 12-byte fixed header.
    pub fn room(&self) -> usize {
        self.mtu.saturating_sub(RTP_HEADER_LEN)
    }

    /// Append one packet whose payload is the concatenation of `parts`.
    pub fn push(&mut self, marker: bool, pts: i64, dts: i64, parts: &[&[u8]]) {
        let len = parts.iter().map(|p| p.len()).sum::<usize>();
        let mut data = Vec::with_capacity(RTP_HEADER_LEN + len);
        data.extend_from_slice(&self.header.write(marker, pts));
        for part in parts {
            data.extend_from_slice(part);
        }
        self.packets.push(RtpPacket { data, dts });
    }

    /// Extended sequence number the next pushed packet will carry.
    pub fn extended_sequence(&self) -> u32 {
        self.header.extended_sequence()
    }

    /// Number of packets emitted so far.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn into_packets(self) -> Vec<RtpPacket> {
        self.packets
    }
}
