//! Media model and RTP packetization.
//!
//! This module holds the types the upstream encoder hands to the server
//! ([`AccessUnit`], [`NalUnit`]) and the machinery that turns them into
//! RTP packets.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpPacket`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): 90 kHz media clock for video.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) |

pub mod h264;
pub mod h265;
pub mod nal;
pub mod packetizer;
pub mod parameters;
pub mod rtp;

use std::fmt;

pub use packetizer::Packetizer;
pub use parameters::CodecConfigStore;

/// RTP clock rate for video payloads (RFC 6184 §8.1, RFC 7798 §7.1).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Video codec carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Encoding name for the SDP `a=rtpmap` attribute.
    pub fn encoding_name(self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    /// Size of the NAL unit header in bytes.
    pub fn nal_header_len(self) -> usize {
        match self {
            Codec::H264 => 1,
            Codec::H265 => 2,
        }
    }

    /// Bytes a fragmentation unit adds in front of each fragment.
    ///
    /// FU-A: indicator + header (2). H.265 FU: PayloadHdr + FU header (3).
    pub fn fu_overhead(self) -> usize {
        match self {
            Codec::H264 => 2,
            Codec::H265 => 3,
        }
    }

    /// Read the NAL unit type from the first header byte.
    pub fn nal_type(self, first_byte: u8) -> u8 {
        match self {
            Codec::H264 => first_byte & 0x1f,
            Codec::H265 => (first_byte >> 1) & 0x3f,
        }
    }

    fn classify(self, nal_type: u8) -> NalKind {
        match self {
            Codec::H264 => h264::classify(nal_type),
            Codec::H265 => h265::classify(nal_type),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            other => Err(format!("unknown codec '{other}' (expected h264 or h265)")),
        }
    }
}

/// Coarse role of a NAL unit within the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// H.265 video parameter set.
    Vps,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    /// IDR (H.264) or IRAP (H.265) slice: decoding can start here.
    Keyframe,
    /// Any other VCL slice.
    Slice,
    /// SEI, AUD, filler and everything else.
    Other,
}

/// One NAL unit, without its Annex-B start code.
///
/// `data` starts with the NAL unit header, so it can be sent verbatim in
/// single-NAL mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub kind: NalKind,
    pub nal_type: u8,
    pub data: Vec<u8>,
}

impl NalUnit {
    /// Classify raw NAL bytes (header included) for the given codec.
    ///
    /// An empty buffer is classified as [`NalKind::Other`].
    pub fn new(codec: Codec, data: Vec<u8>) -> Self {
        let (nal_type, kind) = match data.first() {
            Some(&b) => {
                let t = codec.nal_type(b);
                (t, codec.classify(t))
            }
            None => (0, NalKind::Other),
        };
        Self {
            kind,
            nal_type,
            data,
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self.kind, NalKind::Vps | NalKind::Sps | NalKind::Pps)
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind == NalKind::Keyframe
    }

    /// Whether this NAL unit carries picture data.
    pub fn is_vcl(&self) -> bool {
        matches!(self.kind, NalKind::Keyframe | NalKind::Slice)
    }
}

/// All NAL units sharing one presentation timestamp.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub codec: Codec,
    pub presentation_time_us: i64,
    pub nal_units: Vec<NalUnit>,
}

impl AccessUnit {
    pub fn new(codec: Codec, presentation_time_us: i64, nal_units: Vec<NalUnit>) -> Self {
        Self {
            codec,
            presentation_time_us,
            nal_units,
        }
    }

    /// Build an access unit from an Annex-B buffer.
    pub fn from_annexb(codec: Codec, presentation_time_us: i64, data: &[u8]) -> Self {
        Self::new(codec, presentation_time_us, nal::extract(codec, data))
    }

    /// 90 kHz RTP timestamp for this unit, truncated and wrapped to 32 bits.
    pub fn rtp_timestamp(&self) -> u32 {
        rtp_timestamp(self.presentation_time_us)
    }

    pub fn is_keyframe(&self) -> bool {
        self.nal_units.iter().any(NalUnit::is_keyframe)
    }

    pub fn is_empty(&self) -> bool {
        self.nal_units.iter().all(|n| n.data.is_empty())
    }
}

/// Convert a presentation time in microseconds to a 90 kHz RTP timestamp.
pub fn rtp_timestamp(presentation_time_us: i64) -> u32 {
    let ticks = i128::from(presentation_time_us) * i128::from(VIDEO_CLOCK_RATE) / 1_000_000;
    ticks as u32
}

/// The most recent parameter-set NAL units (header included, no start code).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Parameter sets in the order a decoder expects them.
    pub fn in_decode_order(&self) -> impl Iterator<Item = &[u8]> {
        [&self.vps, &self.sps, &self.pps]
            .into_iter()
            .filter_map(|slot| slot.as_deref())
    }
}

/// Codec choice plus its parameter sets. Replaced as a whole, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub codec: Codec,
    pub parameter_sets: ParameterSets,
}

impl CodecConfig {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            parameter_sets: ParameterSets::default(),
        }
    }

    /// Whether every parameter set this codec needs for SDP is present.
    pub fn is_complete(&self) -> bool {
        let ps = &self.parameter_sets;
        let base = ps.sps.is_some() && ps.pps.is_some();
        match self.codec {
            Codec::H264 => base,
            Codec::H265 => base && ps.vps.is_some(),
        }
    }
}
