//! Payload format registry and RTP packetization.
//!
//! [`resolve_format`] maps an elementary-stream descriptor to a
//! [`PayloadFormat`]: payload type, MIME subtype, `fmtp` parameters,
//! clock rate and a [`Packetizer`] tag. The packetizer splits each
//! timestamped [`Block`] into RTP packets no larger than the session MTU.
//!
//! ## RTP overview (RFC 3550)
//!
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping) - for reordering and loss detection.
//! - **Timestamp** (32-bit) - media clock, 90 kHz for video, sample rate for audio.
//! - **SSRC** (32-bit) - randomly chosen to identify the sender.
//! - **Marker bit** - codec specific, usually the last packet of a frame.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Encoding |
//! |-------|--------|-----|----------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | `H264` |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | `H265` |
//! | JPEG | [`mjpeg`] | [RFC 2435](https://tools.ietf.org/html/rfc2435) | `JPEG` (PT 26) |
//! | Vorbis, Theora | [`xiph`] | [RFC 5215](https://tools.ietf.org/html/rfc5215) | `vorbis`, `theora` |
//! | MPEG audio/video | [`mpeg`] | [RFC 2250](https://tools.ietf.org/html/rfc2250) | `MPA` (PT 14), `MPV` (PT 32) |
//! | AAC | [`aac`] | RFC 3640 / RFC 3016 | `mpeg4-generic`, `MP4A-LATM` |
//! | AMR, AMR-WB | [`amr`] | [RFC 4867](https://tools.ietf.org/html/rfc4867) | `AMR`, `AMR-WB` |
//! | G.726 | [`g726`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) | `G726-16/24/32/40` |
//! | AC-3, Speex | [`audio`] | RFC 4184 / RFC 5574 | `ac3`, `SPEEX` |
//! | H.263, VP8 | [`video`] | RFC 4629 / RFC 7741 | `H263-1998`, `VP8` |
//! | Raw 4:2:0, RGB | [`raw`] | [RFC 4175](https://tools.ietf.org/html/rfc4175) | `RAW` |
//! | PCM, GSM, Opus, MPEG-4 video, T.140 | [`generic`] | RFC 3551 / 7587 / 3016 / 4103 | `PCMU`, `PCMA`, `L8`, `L16`, `L24`, `GSM`, `opus`, `MP4V-ES`, `t140` |

pub mod aac;
pub mod amr;
pub mod audio;
pub mod g726;
pub mod generic;
pub mod h264;
pub mod h265;
pub mod mjpeg;
pub mod mpeg;
pub mod raw;
pub mod rtp;
pub mod video;
pub mod xiph;

use std::fmt;

use serde::Deserialize;

use crate::error::{Result, StreamError};
use rtp::{PacketWriter, RtpHeader};

/// First dynamic RTP payload type (RFC 3551 §3).
pub const DYNAMIC_PAYLOAD_TYPE: u8 = 96;

/// Elementary stream category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EsCategory {
    Audio,
    Video,
    Text,
}

impl EsCategory {
    /// SDP media type for the `m=` line.
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
        }
    }
}

/// Codec identifiers understood by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// G.711 µ-law.
    Mulaw,
    /// G.711 A-law.
    Alaw,
    /// Signed 16-bit big-endian PCM.
    S16Be,
    /// Signed 16-bit little-endian PCM (byte-swapped on the wire).
    S16Le,
    /// Unsigned 8-bit PCM.
    U8,
    /// Signed 24-bit big-endian PCM.
    S24Be,
    Mpga,
    Mpgv,
    G726,
    Ac3,
    H263,
    H264,
    Hevc,
    Mp4v,
    Mp4a,
    AmrNb,
    AmrWb,
    Speex,
    Vorbis,
    Theora,
    T140,
    Gsm,
    Opus,
    Vp8,
    Jpeg,
    /// Planar YUV 4:2:0, 8 bits per sample.
    R420,
    /// Packed 8-bit RGB.
    Rgb24,
    /// Any other codec, by FourCC. Never resolvable.
    Other([u8; 4]),
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(fourcc) => write!(f, "{}", String::from_utf8_lossy(fourcc)),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Immutable description of an elementary stream, supplied once by the
/// upstream pipeline before its first block.
#[derive(Debug, Clone)]
pub struct EsDescriptor {
    pub codec: Codec,
    pub category: EsCategory,
    /// Audio sample rate in Hz. Ignored for video.
    pub rate: u32,
    pub channels: u8,
    /// Average bitrate in bit/s, 0 when unknown.
    pub bitrate: u32,
    /// Codec configuration (parameter sets, Xiph headers, AudioSpecificConfig).
    pub extradata: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl EsDescriptor {
    pub fn video(codec: Codec) -> Self {
        Self::new(codec, EsCategory::Video, 0, 0)
    }

    pub fn audio(codec: Codec, rate: u32, channels: u8) -> Self {
        Self::new(codec, EsCategory::Audio, rate, channels)
    }

    pub fn text(codec: Codec) -> Self {
        Self::new(codec, EsCategory::Text, 0, 0)
    }

    fn new(codec: Codec, category: EsCategory, rate: u32, channels: u8) -> Self {
        Self {
            codec,
            category,
            rate,
            channels,
            bitrate: 0,
            extradata: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    pub fn with_extradata(mut self, extradata: impl Into<Vec<u8>>) -> Self {
        self.extradata = extradata.into();
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// One timestamped unit of encoded media (a frame or audio packet).
///
/// Times are microseconds on the output clock.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub data: Vec<u8>,
    /// Presentation time. Falls back to `dts` when absent.
    pub pts: Option<i64>,
    pub dts: i64,
    pub duration: i64,
    pub discontinuity: bool,
    pub keyframe: bool,
}

impl Block {
    pub fn new(data: impl Into<Vec<u8>>, dts: i64) -> Self {
        Self {
            data: data.into(),
            pts: Some(dts),
            dts,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn pts_or_dts(&self) -> i64 {
        self.pts.unwrap_or(self.dts)
    }

    /// Release time of fragment `index` out of `count`, spreading the block
    /// duration evenly across its packets.
    pub fn fragment_dts(&self, index: usize, count: usize) -> i64 {
        if count == 0 {
            return self.dts;
        }
        self.dts + index as i64 * self.duration / count as i64
    }
}

/// A complete RTP packet ready for the wire, with its release time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub data: Vec<u8>,
    pub dts: i64,
}

impl RtpPacket {
    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn marker(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[rtp::RTP_HEADER_LEN..]
    }
}

/// Codec framing selected by [`resolve_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packetizer {
    /// Whole block in one packet.
    Simple,
    /// Plain MTU split, marker on the last packet.
    Split,
    /// PCM split, marker on discontinuity, pts advanced per split.
    Pcm,
    /// Like `Pcm` but converts 16-bit little-endian samples to network order.
    PcmSwab,
    Mpa,
    Mpv,
    Ac3,
    H263,
    H264,
    H265,
    Mp4aGeneric,
    Mp4aLatm,
    Amr,
    Speex,
    T140,
    /// Payload size rounded down to a multiple of `align` bytes.
    G726 { align: usize },
    Xiph,
    Vp8,
    Jpeg,
    Raw {
        sampling: raw::Sampling,
        width: u16,
        height: u16,
    },
}

impl Packetizer {
    /// Frame one block, appending packets to `out`.
    ///
    /// Malformed input yields zero packets; it never fails the stream.
    pub fn packetize(self, out: &mut PacketWriter<'_>, block: &Block) {
        match self {
            Self::Simple => generic::packetize_simple(out, block),
            Self::Split => generic::packetize_split(out, block),
            Self::Pcm => generic::packetize_pcm(out, block, false),
            Self::PcmSwab => generic::packetize_pcm(out, block, true),
            Self::T140 => generic::packetize_t140(out, block),
            Self::Mpa => mpeg::packetize_audio(out, block),
            Self::Mpv => mpeg::packetize_video(out, block),
            Self::Ac3 => audio::packetize_ac3(out, block),
            Self::Speex => audio::packetize_speex(out, block),
            Self::H263 => video::packetize_h263(out, block),
            Self::Vp8 => video::packetize_vp8(out, block),
            Self::H264 => h264::packetize(out, block),
            Self::H265 => h265::packetize(out, block),
            Self::Mp4aGeneric => aac::packetize_generic(out, block),
            Self::Mp4aLatm => aac::packetize_latm(out, block),
            Self::Amr => amr::packetize(out, block),
            Self::G726 { align } => g726::packetize(out, block, align),
            Self::Xiph => xiph::packetize(out, block),
            Self::Jpeg => mjpeg::packetize(out, block),
            Self::Raw { sampling, width, height } => raw::packetize(out, block, sampling, width, height),
        }
    }
}

/// Options that change which payload format a codec resolves to.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Carry AAC as `MP4A-LATM` (RFC 3016) instead of `mpeg4-generic`.
    pub mp4a_latm: bool,
}

/// RTP payload format of one elementary stream. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct PayloadFormat {
    pub payload_type: u8,
    /// MIME subtype for `a=rtpmap`.
    pub encoding: &'static str,
    pub clock_rate: u32,
    pub channels: u8,
    pub category: EsCategory,
    /// Bitrate in kbit/s for `b=AS:`, 0 when unknown.
    pub bitrate_kbps: u32,
    pub fmtp: Option<String>,
    pub packetizer: Packetizer,
}

impl PayloadFormat {
    fn dynamic(desc: &EsDescriptor, encoding: &'static str, packetizer: Packetizer) -> Self {
        let (clock_rate, channels) = match desc.category {
            EsCategory::Audio => (desc.rate, desc.channels),
            _ => (90000, 0),
        };
        Self {
            payload_type: DYNAMIC_PAYLOAD_TYPE,
            encoding,
            clock_rate,
            channels,
            category: desc.category,
            bitrate_kbps: desc.bitrate / 1000,
            fmtp: None,
            packetizer,
        }
    }

    fn with_payload_type(mut self, pt: u8) -> Self {
        self.payload_type = pt;
        self
    }

    fn with_fmtp(mut self, fmtp: Option<String>) -> Self {
        self.fmtp = fmtp;
        self
    }

    /// Value of `a=rtpmap:` after the payload type, e.g. `H264/90000`.
    pub fn rtpmap(&self) -> String {
        if self.category == EsCategory::Audio && self.channels > 0 {
            format!("{}/{}/{}", self.encoding, self.clock_rate, self.channels)
        } else {
            format!("{}/{}", self.encoding, self.clock_rate)
        }
    }

    /// Frame one block into RTP packets using `header` for the fixed header.
    pub fn packetize(&self, header: &mut RtpHeader, mtu: usize, block: &Block) -> Vec<RtpPacket> {
        let mut out = PacketWriter::new(header, mtu);
        if let (Packetizer::Xiph, Some(fmtp)) = (self.packetizer, self.fmtp.as_deref()) {
            if block.keyframe && xiph::wants_inband_config(fmtp) {
                xiph::packetize_config(&mut out, fmtp, block.pts_or_dts());
            }
        }
        self.packetizer.packetize(&mut out, block);
        out.into_packets()
    }
}

/// Resolve the payload format of an elementary stream with default options.
pub fn resolve_format(desc: &EsDescriptor) -> Result<PayloadFormat> {
    resolve_format_with(desc, &FormatOptions::default())
}

/// Resolve the payload format of an elementary stream.
///
/// Payload types are dynamic (96) unless the codec has a static
/// assignment in RFC 3551 matching the stream parameters.
pub fn resolve_format_with(desc: &EsDescriptor, options: &FormatOptions) -> Result<PayloadFormat> {
    use PayloadFormat as F;

    let mono_8k = desc.channels == 1 && desc.rate == 8000;
    let format = match desc.codec {
        Codec::Mulaw => {
            let f = F::dynamic(desc, "PCMU", Packetizer::Pcm);
            if mono_8k { f.with_payload_type(0) } else { f }
        }
        Codec::Alaw => {
            let f = F::dynamic(desc, "PCMA", Packetizer::Pcm);
            if mono_8k { f.with_payload_type(8) } else { f }
        }
        Codec::S16Be | Codec::S16Le => {
            let packetizer = if desc.codec == Codec::S16Be {
                Packetizer::Pcm
            } else {
                Packetizer::PcmSwab
            };
            let f = F::dynamic(desc, "L16", packetizer);
            match (desc.channels, desc.rate) {
                (1, 44100) => f.with_payload_type(11),
                (2, 44100) => f.with_payload_type(10),
                _ => f,
            }
        }
        Codec::U8 => F::dynamic(desc, "L8", Packetizer::Pcm),
        Codec::S24Be => F::dynamic(desc, "L24", Packetizer::Pcm),
        Codec::Mpga => {
            let mut f = F::dynamic(desc, "MPA", Packetizer::Mpa).with_payload_type(14);
            // RFC 3551 §4.5.13: MPA always uses the 90 kHz clock.
            f.clock_rate = 90000;
            f
        }
        Codec::Mpgv => F::dynamic(desc, "MPV", Packetizer::Mpv).with_payload_type(32),
        Codec::G726 => {
            let (encoding, align) = g726::variant(desc.bitrate).ok_or_else(|| {
                StreamError::InvalidFormat(format!("unsupported G.726 bitrate: {}", desc.bitrate))
            })?;
            F::dynamic(desc, encoding, Packetizer::G726 { align })
        }
        Codec::Ac3 => F::dynamic(desc, "ac3", Packetizer::Ac3),
        Codec::H263 => F::dynamic(desc, "H263-1998", Packetizer::H263),
        Codec::H264 => F::dynamic(desc, "H264", Packetizer::H264)
            .with_fmtp(Some(h264::fmtp(&desc.extradata))),
        Codec::Hevc => F::dynamic(desc, "H265", Packetizer::H265)
            .with_fmtp(Some(h265::fmtp(&desc.extradata))),
        Codec::Mp4v => {
            let fmtp = (!desc.extradata.is_empty()).then(|| {
                format!("profile-level-id=3; config={};", hex(&desc.extradata))
            });
            F::dynamic(desc, "MP4V-ES", Packetizer::Split).with_fmtp(fmtp)
        }
        Codec::Mp4a if options.mp4a_latm => F::dynamic(desc, "MP4A-LATM", Packetizer::Mp4aLatm)
            .with_fmtp(Some(aac::latm_fmtp(desc.rate, desc.channels))),
        Codec::Mp4a => F::dynamic(desc, "mpeg4-generic", Packetizer::Mp4aGeneric)
            .with_fmtp(Some(aac::generic_fmtp(&desc.extradata))),
        Codec::AmrNb => F::dynamic(desc, "AMR", Packetizer::Amr)
            .with_fmtp(Some(amr::FMTP.to_string())),
        Codec::AmrWb => F::dynamic(desc, "AMR-WB", Packetizer::Amr)
            .with_fmtp(Some(amr::FMTP.to_string())),
        Codec::Speex => F::dynamic(desc, "SPEEX", Packetizer::Speex),
        Codec::Vorbis => {
            let fmtp = if desc.extradata.is_empty() {
                None
            } else {
                xiph::vorbis_fmtp(&desc.extradata)
            };
            F::dynamic(desc, "vorbis", Packetizer::Xiph).with_fmtp(fmtp)
        }
        Codec::Theora => {
            let fmtp = if desc.extradata.is_empty() {
                None
            } else {
                xiph::theora_fmtp(&desc.extradata, desc.width, desc.height)
            };
            F::dynamic(desc, "theora", Packetizer::Xiph).with_fmtp(fmtp)
        }
        Codec::T140 => {
            let mut f = F::dynamic(desc, "t140", Packetizer::T140);
            f.clock_rate = 1000;
            f
        }
        Codec::Gsm => F::dynamic(desc, "GSM", Packetizer::Split).with_payload_type(3),
        Codec::Opus => {
            if desc.channels > 2 {
                return Err(StreamError::InvalidFormat(format!(
                    "multistream opus not supported ({} channels)",
                    desc.channels
                )));
            }
            let mut f = F::dynamic(desc, "opus", Packetizer::Simple)
                .with_fmtp((desc.channels == 2).then(|| "sprop-stereo=1".to_string()));
            // RFC 7587 §7: always advertised as 48000/2.
            f.clock_rate = 48000;
            f.channels = 2;
            f
        }
        Codec::Vp8 => F::dynamic(desc, "VP8", Packetizer::Vp8),
        Codec::Jpeg => F::dynamic(desc, "JPEG", Packetizer::Jpeg).with_payload_type(26),
        Codec::R420 | Codec::Rgb24 => {
            let sampling = if desc.codec == Codec::R420 {
                raw::Sampling::YCbCr420
            } else {
                raw::Sampling::Rgb
            };
            let valid = 1..=raw::MAX_DIMENSION;
            if !valid.contains(&desc.width) || !valid.contains(&desc.height) {
                return Err(StreamError::InvalidFormat(format!(
                    "raw video needs dimensions up to {}, got {}x{}",
                    raw::MAX_DIMENSION,
                    desc.width,
                    desc.height
                )));
            }
            let packetizer = Packetizer::Raw {
                sampling,
                width: desc.width as u16,
                height: desc.height as u16,
            };
            F::dynamic(desc, "RAW", packetizer).with_fmtp(Some(sampling.fmtp(desc.width, desc.height)))
        }
        Codec::Other(_) => {
            tracing::warn!(codec = %desc.codec, "no RTP payload format for codec");
            return Err(StreamError::UnsupportedCodec(desc.codec.to_string()));
        }
    };

    if format.clock_rate == 0 {
        return Err(StreamError::InvalidFormat(format!(
            "{} stream has no clock rate",
            format.encoding
        )));
    }

    tracing::debug!(
        codec = %desc.codec,
        pt = format.payload_type,
        encoding = format.encoding,
        clock_rate = format.clock_rate,
        fmtp = format.fmtp.as_deref().unwrap_or(""),
        "payload format resolved"
    );
    Ok(format)
}

/// Lowercase hex encoding used by MPEG-4 `config=` parameters.
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_video_formats() {
        let f = resolve_format(&EsDescriptor::video(Codec::Rgb24).with_dimensions(320, 240)).unwrap();
        assert_eq!(f.encoding, "RAW");
        assert_eq!(f.payload_type, 96);
        assert_eq!(f.rtpmap(), "RAW/90000");
        assert_eq!(
            f.fmtp.as_deref(),
            Some("sampling=RGB; width=320; height=240; depth=8; colorimetry=SMPTE240M")
        );
        assert_eq!(
            f.packetizer,
            Packetizer::Raw { sampling: raw::Sampling::Rgb, width: 320, height: 240 }
        );

        let f = resolve_format(&EsDescriptor::video(Codec::R420).with_dimensions(1920, 1080)).unwrap();
        assert!(f.fmtp.unwrap().starts_with("sampling=YCbCr-4:2:0; width=1920; height=1080;"));

        assert!(matches!(
            resolve_format(&EsDescriptor::video(Codec::R420)),
            Err(StreamError::InvalidFormat(_))
        ));
        assert!(resolve_format(&EsDescriptor::video(Codec::Rgb24).with_dimensions(40000, 10)).is_err());
    }

    #[test]
    fn amr_nb_format() {
        let f = resolve_format(&EsDescriptor::audio(Codec::AmrNb, 8000, 1)).unwrap();
        assert_eq!(f.encoding, "AMR");
        assert_eq!(f.fmtp.as_deref(), Some("octet-align=1"));
        assert_eq!(f.payload_type, 96);
        assert_eq!(f.rtpmap(), "AMR/8000/1");
    }

    #[test]
    fn h264_with_parameter_sets() {
        let extradata = [
            &[0u8, 0, 0, 1][..],
            &[0x67, 0x42, 0xc0, 0x1e, 0xd9][..],
            &[0, 0, 0, 1][..],
            &[0x68, 0xce, 0x3c, 0x80][..],
        ]
        .concat();
        let f = resolve_format(&EsDescriptor::video(Codec::H264).with_extradata(extradata)).unwrap();
        assert_eq!(
            f.fmtp.as_deref(),
            Some("packetization-mode=1;profile-level-id=42c01e;sprop-parameter-sets=Z0LAHtk=,aM48gA==")
        );
        assert_eq!(f.clock_rate, 90000);
        assert_eq!(f.rtpmap(), "H264/90000");
    }

    #[test]
    fn static_payload_types() {
        let pcmu = resolve_format(&EsDescriptor::audio(Codec::Mulaw, 8000, 1)).unwrap();
        assert_eq!(pcmu.payload_type, 0);
        let pcmu_stereo = resolve_format(&EsDescriptor::audio(Codec::Mulaw, 8000, 2)).unwrap();
        assert_eq!(pcmu_stereo.payload_type, 96);
        let l16 = resolve_format(&EsDescriptor::audio(Codec::S16Le, 44100, 2)).unwrap();
        assert_eq!((l16.payload_type, l16.packetizer), (10, Packetizer::PcmSwab));
        let mpa = resolve_format(&EsDescriptor::audio(Codec::Mpga, 44100, 2)).unwrap();
        assert_eq!((mpa.payload_type, mpa.clock_rate), (14, 90000));
        let jpeg = resolve_format(&EsDescriptor::video(Codec::Jpeg)).unwrap();
        assert_eq!(jpeg.payload_type, 26);
    }

    #[test]
    fn g726_bitrates() {
        let f = resolve_format(&EsDescriptor::audio(Codec::G726, 8000, 1).with_bitrate(24000)).unwrap();
        assert_eq!(f.encoding, "G726-24");
        assert_eq!(f.bitrate_kbps, 24);
        let err = resolve_format(&EsDescriptor::audio(Codec::G726, 8000, 1).with_bitrate(48000));
        assert!(matches!(err, Err(StreamError::InvalidFormat(_))));
    }

    #[test]
    fn opus_rejects_multichannel() {
        let stereo = resolve_format(&EsDescriptor::audio(Codec::Opus, 48000, 2)).unwrap();
        assert_eq!(stereo.fmtp.as_deref(), Some("sprop-stereo=1"));
        assert_eq!(stereo.rtpmap(), "opus/48000/2");
        let mono = resolve_format(&EsDescriptor::audio(Codec::Opus, 48000, 1)).unwrap();
        assert_eq!(mono.rtpmap(), "opus/48000/2");
        assert!(mono.fmtp.is_none());
        assert!(resolve_format(&EsDescriptor::audio(Codec::Opus, 48000, 6)).is_err());
    }

    #[test]
    fn aac_latm_option() {
        let desc = EsDescriptor::audio(Codec::Mp4a, 48000, 2).with_extradata(vec![0x11, 0x90]);
        let generic = resolve_format(&desc).unwrap();
        assert_eq!(generic.encoding, "mpeg4-generic");
        let latm = resolve_format_with(&desc, &FormatOptions { mp4a_latm: true }).unwrap();
        assert_eq!(latm.encoding, "MP4A-LATM");
        assert_eq!(latm.packetizer, Packetizer::Mp4aLatm);
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let err = resolve_format(&EsDescriptor::video(Codec::Other(*b"WMV3"))).unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedCodec(ref c) if c == "WMV3"));
    }

    #[test]
    fn audio_without_rate_is_rejected() {
        assert!(resolve_format(&EsDescriptor::audio(Codec::AmrNb, 0, 1)).is_err());
    }

    #[test]
    fn t140_clock() {
        let f = resolve_format(&EsDescriptor::text(Codec::T140)).unwrap();
        assert_eq!(f.clock_rate, 1000);
        assert_eq!(f.rtpmap(), "t140/1000");
    }

    #[test]
    fn fragment_dts_spreads_duration() {
        let b = Block::new(vec![0; 10], 1000).with_duration(300);
        assert_eq!(b.fragment_dts(0, 3), 1000);
        assert_eq!(b.fragment_dts(2, 3), 1200);
    }
}
