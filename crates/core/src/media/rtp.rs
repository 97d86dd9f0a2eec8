use std::fmt;

/// Length of the RTP fixed header without CSRCs (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

const RTP_VERSION: u8 = 2;

/// One RTP packet (RFC 3550 §5.1).
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
/// Packets built by this crate never carry padding, extensions or CSRCs,
/// so [`to_bytes`](Self::to_bytes) always yields `12 + payload.len()` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Write the fixed header into `buf`.
    pub fn write_header(&self, buf: &mut [u8; RTP_HEADER_LEN]) {
        buf[0] = (self.version << 6) | ((self.padding as u8) << 5) | ((self.extension as u8) << 4);
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Append the wire form to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut header = [0u8; RTP_HEADER_LEN];
        self.write_header(&mut header);
        out.reserve(self.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.write_to(&mut out);
        out
    }

    /// Parse a packet without CSRCs or header extension.
    ///
    /// Returns `None` for anything shorter than the fixed header, a version
    /// other than 2, or packets using CSRCs / extensions.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_LEN {
            return None;
        }
        let version = data[0] >> 6;
        let csrc_count = data[0] & 0x0f;
        let extension = data[0] & 0x10 != 0;
        if version != RTP_VERSION || csrc_count != 0 || extension {
            return None;
        }
        Some(Self {
            version,
            padding: data[0] & 0x20 != 0,
            extension,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: data[RTP_HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("marker", &self.marker)
            .field("pt", &self.payload_type)
            .field("seq", &self.sequence_number)
            .field("ts", &self.timestamp)
            .field("ssrc", &format_args!("{:#010X}", self.ssrc))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Per-stream RTP header state: payload type, SSRC and the next sequence number.
///
/// The sequence number is 16-bit and wrapping; it advances by exactly one
/// for every packet produced through [`next_packet`](Self::next_packet).
#[derive(Debug)]
pub struct RtpSequencer {
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpSequencer {
    pub fn new(payload_type: u8, ssrc: u32, initial_sequence: u16) -> Self {
        tracing::debug!(
            pt = payload_type,
            ssrc = format_args!("{:#010X}", ssrc),
            initial_sequence,
            "RTP sequencer created"
        );
        Self {
            payload_type,
            ssrc,
            sequence: initial_sequence,
        }
    }

    /// Random SSRC and initial sequence number.
    ///
    /// Per RFC 3550 §5.1 and §8.1 both should be unpredictable, which also
    /// keeps independent sessions from colliding.
    pub fn with_random_state(payload_type: u8) -> Self {
        Self::new(payload_type, rand::random::<u32>(), rand::random::<u16>())
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Build the next packet and advance the sequence number.
    pub fn next_packet(&mut self, marker: bool, timestamp: u32, payload: Vec<u8>) -> RtpPacket {
        let packet = RtpPacket {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence,
            timestamp,
            ssrc: self.ssrc,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}
