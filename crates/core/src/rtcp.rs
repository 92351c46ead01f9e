//! RTCP sender reports (RFC 3550 §6).
//!
//! Every sink with an RTCP path owns one [`RtcpReporter`]. The reporter
//! keeps a pre-built compound packet (SR followed by SDES) and patches the
//! SR fields in place when a report is due:
//!
//! ```text
//! SR:   V=2 RC=0 | PT=200 | len=6 | SSRC | NTP hi | NTP lo | RTP ts | packets | octets
//! SDES: V=2 SC=1 | PT=202 | len   | SSRC | CNAME item | TOOL item | END | pad
//! BYE:  V=2 SC=1 | PT=203 | len=1 | SSRC
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::transport::SinkTransport;

const SR_LEN: usize = 28;
const PT_SR: u8 = 200;
const PT_SDES: u8 = 202;
const PT_BYE: u8 = 203;
const SDES_CNAME: u8 = 1;
const SDES_TOOL: u8 = 6;

/// Minimum spacing between two sender reports, in NTP units (5 s).
const MIN_REPORT_INTERVAL: u64 = 5 << 32;

/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Sender-side RTCP state for one sink.
#[derive(Debug)]
pub struct RtcpReporter {
    transport: Option<Arc<dyn SinkTransport>>,
    buffer: Vec<u8>,
    ssrc: u32,
    packets: u32,
    octets: u32,
    counter: u64,
    last_report: Option<u64>,
}

impl RtcpReporter {
    /// Build the SR + SDES compound for `transport`.
    ///
    /// CNAME is the transport's local numeric address; `tool` goes into the
    /// TOOL item.
    pub fn open(transport: Arc<dyn SinkTransport>, tool: &str) -> Self {
        let cname = transport
            .local_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let mut buffer = Vec::with_capacity(SR_LEN + 64);
        buffer.extend_from_slice(&[0x80, PT_SR, 0, 6]);
        buffer.resize(SR_LEN, 0);

        let sdes_start = buffer.len();
        buffer.extend_from_slice(&[0x81, PT_SDES, 0, 0, 0, 0, 0, 0]);
        push_item(&mut buffer, SDES_CNAME, cname.as_bytes());
        push_item(&mut buffer, SDES_TOOL, tool.as_bytes());
        buffer.push(0);
        while buffer.len() % 4 != 0 {
            buffer.push(0);
        }
        let words = ((buffer.len() - sdes_start) / 4 - 1) as u16;
        buffer[sdes_start + 2..sdes_start + 4].copy_from_slice(&words.to_be_bytes());

        tracing::debug!(%cname, tool, "RTCP reporter opened");
        Self {
            transport: Some(transport),
            buffer,
            ssrc: 0,
            packets: 0,
            octets: 0,
            counter: 0,
            last_report: None,
        }
    }

    /// Account for one RTP packet and send an SR if one is due.
    pub fn on_rtp_sent(&mut self, rtp: &[u8]) -> bool {
        self.on_rtp_sent_at(rtp, ntp_now())
    }

    /// [`on_rtp_sent`](Self::on_rtp_sent) with an explicit 64-bit NTP time.
    ///
    /// Returns `true` if a report went out.
    pub fn on_rtp_sent_at(&mut self, rtp: &[u8], ntp: u64) -> bool {
        if rtp.len() < 12 || self.transport.is_none() {
            return false;
        }

        let ssrc = u32::from_be_bytes([rtp[8], rtp[9], rtp[10], rtp[11]]);
        if ssrc != self.ssrc {
            self.set_ssrc(ssrc);
        }
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add((rtp.len() - 12) as u32);
        self.counter += rtp.len() as u64;

        if self.counter / 80 < self.buffer.len() as u64 {
            return false;
        }
        if let Some(last) = self.last_report {
            if ntp.wrapping_sub(last) < MIN_REPORT_INTERVAL {
                return false;
            }
        }

        self.buffer[8..16].copy_from_slice(&ntp.to_be_bytes());
        self.buffer[16..20].copy_from_slice(&rtp[4..8]);
        self.buffer[20..24].copy_from_slice(&self.packets.to_be_bytes());
        self.buffer[24..28].copy_from_slice(&self.octets.to_be_bytes());

        let Some(transport) = &self.transport else {
            return false;
        };
        match transport.send(&self.buffer) {
            Ok(_) => {
                self.counter = 0;
                self.last_report = Some(ntp);
                tracing::trace!(
                    ssrc = format_args!("{:#010X}", self.ssrc),
                    packets = self.packets,
                    octets = self.octets,
                    "RTCP SR sent"
                );
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "RTCP SR send failed");
                false
            }
        }
    }

    /// Send SR + SDES + BYE once and release the transport.
    pub fn close(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        let mut compound = self.buffer.clone();
        compound.extend_from_slice(&[0x81, PT_BYE, 0, 1]);
        compound.extend_from_slice(&self.ssrc.to_be_bytes());
        if let Err(e) = transport.send(&compound) {
            tracing::debug!(error = %e, "RTCP BYE send failed");
        }
    }

    /// Packets accounted so far.
    pub fn packet_count(&self) -> u32 {
        self.packets
    }

    pub fn octet_count(&self) -> u32 {
        self.octets
    }

    fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
        self.buffer[4..8].copy_from_slice(&ssrc.to_be_bytes());
        self.buffer[SR_LEN + 4..SR_LEN + 8].copy_from_slice(&ssrc.to_be_bytes());
    }
}

impl Drop for RtcpReporter {
    fn drop(&mut self) {
        self.close();
    }
}

fn push_item(buffer: &mut Vec<u8>, kind: u8, value: &[u8]) {
    let value = &value[..value.len().min(255)];
    buffer.push(kind);
    buffer.push(value.len() as u8);
    buffer.extend_from_slice(value);
}

/// Current wall-clock time as a 64-bit NTP timestamp.
pub fn ntp_now() -> u64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs() + NTP_UNIX_OFFSET;
    let frac = (u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::net::SocketAddr;

    fn rtp_packet(ssrc: u32, timestamp: u32, payload: usize) -> Vec<u8> {
        let mut p = vec![0x80, 96, 0, 1];
        p.extend_from_slice(&timestamp.to_be_bytes());
        p.extend_from_slice(&ssrc.to_be_bytes());
        p.resize(12 + payload, 0xAB);
        p
    }

    fn reporter() -> (Arc<MemoryTransport>, RtcpReporter) {
        let addr: SocketAddr = "192.0.2.7:5005".parse().unwrap();
        let transport = Arc::new(MemoryTransport::new().with_local_addr(addr));
        let reporter = RtcpReporter::open(transport.clone(), "rtp-streamer/test");
        (transport, reporter)
    }

    /// Feed enough bytes that the size gate opens.
    fn fill(reporter: &mut RtcpReporter, ntp: u64) -> bool {
        let packet = rtp_packet(0x1234_5678, 9000, 1388);
        let mut sent = false;
        for _ in 0..10 {
            sent |= reporter.on_rtp_sent_at(&packet, ntp);
        }
        sent
    }

    #[test]
    fn compound_layout() {
        let (transport, mut reporter) = reporter();
        assert!(fill(&mut reporter, 10 << 32));

        let packets = transport.packets();
        assert_eq!(packets.len(), 1);
        let sr = &packets[0];
        assert_eq!(&sr[..4], &[0x80, 200, 0, 6]);
        assert_eq!(&sr[4..8], &0x1234_5678u32.to_be_bytes());
        assert_eq!(&sr[8..16], &(10u64 << 32).to_be_bytes());
        assert_eq!(&sr[16..20], &9000u32.to_be_bytes());
        // 68-byte compound: the gate opens once 68 * 80 bytes went out,
        // on the fourth 1400-byte packet.
        assert_eq!(u32::from_be_bytes([sr[20], sr[21], sr[22], sr[23]]), 4);
        assert_eq!(u32::from_be_bytes([sr[24], sr[25], sr[26], sr[27]]), 4 * 1388);
        assert_eq!(reporter.packet_count(), 10);

        let sdes = &sr[SR_LEN..];
        assert_eq!(&sdes[..2], &[0x81, 202]);
        let words = u16::from_be_bytes([sdes[2], sdes[3]]) as usize;
        assert_eq!((words + 1) * 4, sdes.len());
        assert_eq!(&sdes[4..8], &0x1234_5678u32.to_be_bytes());
        assert_eq!(sdes[8], SDES_CNAME);
        let cname_len = sdes[9] as usize;
        assert_eq!(&sdes[10..10 + cname_len], b"192.0.2.7");
        assert_eq!(sdes[10 + cname_len], SDES_TOOL);
        assert_eq!(sr.len() % 4, 0);
    }

    #[test]
    fn report_waits_for_enough_traffic() {
        let (transport, mut reporter) = reporter();
        let small = rtp_packet(1, 0, 100);
        assert!(!reporter.on_rtp_sent_at(&small, 100 << 32));
        assert!(transport.is_empty());
    }

    #[test]
    fn reports_are_at_least_five_seconds_apart() {
        let (transport, mut reporter) = reporter();
        assert!(fill(&mut reporter, 100 << 32));
        assert!(!fill(&mut reporter, (104 << 32) + 0xFFFF));
        assert_eq!(transport.len(), 1);
        assert!(fill(&mut reporter, 105 << 32));
        assert_eq!(transport.len(), 2);
    }

    #[test]
    fn counter_kept_after_failed_send() {
        let (transport, mut reporter) = reporter();
        transport.fail_always(std::io::ErrorKind::BrokenPipe);
        assert!(!fill(&mut reporter, 10 << 32));
        transport.recover();
        // Gate is still open, so the very next packet reports.
        assert!(reporter.on_rtp_sent_at(&rtp_packet(0x1234_5678, 0, 10), 10 << 32));
    }

    #[test]
    fn close_sends_bye_once() {
        let (transport, mut reporter) = reporter();
        reporter.on_rtp_sent_at(&rtp_packet(0xCAFE_BABE, 0, 10), 0);
        reporter.close();
        reporter.close();
        drop(reporter);

        let packets = transport.packets();
        assert_eq!(packets.len(), 1);
        let tail = &packets[0][packets[0].len() - 8..];
        assert_eq!(&tail[..4], &[0x81, 203, 0, 1]);
        assert_eq!(&tail[4..], &0xCAFE_BABEu32.to_be_bytes());
    }

    #[test]
    fn ntp_now_is_after_2020() {
        let secs = ntp_now() >> 32;
        assert!(secs > NTP_UNIX_OFFSET + 1_577_836_800);
    }
}
