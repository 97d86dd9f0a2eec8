use super::rtp::{RTP_HEADER_LEN, RtpPacket, RtpSequencer};
use super::{AccessUnit, Codec, ParameterSets, h264, h265};

/// Default upper bound on a serialized RTP packet, header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// Smallest packet size that still leaves room for one H.265 FU data byte.
pub const MIN_PACKET_SIZE: usize = RTP_HEADER_LEN + 3 + 1;

/// Converts access units into RTP packets for one stream (one session).
///
/// Each NAL unit is sent in single-NAL mode when it fits in
/// `max_packet_size - 12` bytes and fragmented otherwise (FU-A for H.264,
/// FU for H.265). All packets of one access unit share its 90 kHz
/// timestamp, and only the final packet of the final NAL unit carries the
/// marker bit.
///
/// Sequence numbers continue across calls, so one instance must live as
/// long as the stream it feeds.
#[derive(Debug)]
pub struct Packetizer {
    sequencer: RtpSequencer,
    max_packet_size: usize,
}

impl Packetizer {
    /// Create with explicit SSRC and initial sequence number.
    pub fn new(payload_type: u8, ssrc: u32, initial_sequence: u16, max_packet_size: usize) -> Self {
        Self {
            sequencer: RtpSequencer::new(payload_type, ssrc, initial_sequence),
            max_packet_size: max_packet_size.max(MIN_PACKET_SIZE),
        }
    }

    /// Create with a random SSRC and initial sequence number.
    pub fn with_random_state(payload_type: u8, max_packet_size: usize) -> Self {
        Self {
            sequencer: RtpSequencer::with_random_state(payload_type),
            max_packet_size: max_packet_size.max(MIN_PACKET_SIZE),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.sequencer.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.sequencer.payload_type
    }

    /// Sequence number of the next packet (for the `RTP-Info` header).
    pub fn next_sequence(&self) -> u16 {
        self.sequencer.sequence()
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Largest NAL unit that is sent without fragmentation.
    pub fn max_single_nal(&self) -> usize {
        self.max_packet_size - RTP_HEADER_LEN
    }

    /// Fragment data bytes per packet for the given codec.
    pub fn fragment_capacity(&self, codec: Codec) -> usize {
        self.max_packet_size - RTP_HEADER_LEN - codec.fu_overhead()
    }

    /// Packetize one access unit.
    ///
    /// Empty NAL units are skipped. A unit with no usable NAL yields no packets.
    pub fn packetize(&mut self, unit: &AccessUnit) -> Vec<RtpPacket> {
        let timestamp = unit.rtp_timestamp();
        let Some(last_index) = unit.nal_units.iter().rposition(|n| !n.data.is_empty()) else {
            return Vec::new();
        };

        let mut packets = Vec::new();
        for (i, nal) in unit.nal_units.iter().enumerate() {
            if nal.data.is_empty() {
                continue;
            }
            let is_last_nal = i == last_index;

            if nal.data.len() <= self.max_single_nal() {
                // Single NAL Unit mode.
                packets.push(self.sequencer.next_packet(is_last_nal, timestamp, nal.data.clone()));
                continue;
            }

            let capacity = self.fragment_capacity(unit.codec);
            let fragments = match unit.codec {
                Codec::H264 => h264::fragment(&nal.data, capacity),
                Codec::H265 => h265::fragment(&nal.data, capacity),
            };
            let count = fragments.len();
            for (j, fragment) in fragments.into_iter().enumerate() {
                let marker = is_last_nal && j + 1 == count;
                packets.push(self.sequencer.next_packet(marker, timestamp, fragment));
            }
        }

        tracing::trace!(
            codec = %unit.codec,
            nal_count = unit.nal_units.len(),
            rtp_packets = packets.len(),
            ts = timestamp,
            next_seq = self.sequencer.sequence(),
            "access unit packetized"
        );

        packets
    }

    /// One unfragmented packet per parameter set, marker clear.
    ///
    /// Used to deliver parameter sets in-band when a client starts playing.
    pub fn packetize_config(
        &mut self,
        codec: Codec,
        parameter_sets: &ParameterSets,
        timestamp: u32,
    ) -> Vec<RtpPacket> {
        let packets: Vec<RtpPacket> = parameter_sets
            .in_decode_order()
            .filter(|nal| !nal.is_empty())
            .map(|nal| self.sequencer.next_packet(false, timestamp, nal.to_vec()))
            .collect();

        tracing::trace!(%codec, rtp_packets = packets.len(), ts = timestamp, "parameter sets packetized");
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NalUnit;

    const MAX: usize = 1400;

    fn make_packetizer() -> Packetizer {
        Packetizer::new(96, 0xAABBCCDD, 1000, MAX)
    }

    fn h264_nal(header: u8, len: usize) -> NalUnit {
        let mut data = vec![header];
        data.extend((1..len).map(|i| (i % 253) as u8));
        NalUnit::new(Codec::H264, data)
    }

    fn au(codec: Codec, nals: Vec<NalUnit>) -> AccessUnit {
        AccessUnit::new(codec, 1_000_000, nals)
    }

    /// Rebuild every NAL unit of an H.264 access unit from its packets.
    fn reassemble_h264(packets: &[RtpPacket]) -> Vec<Vec<u8>> {
        let mut nals = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        for p in packets {
            let indicator = p.payload[0];
            if indicator & 0x1f == h264::NAL_TYPE_FU_A {
                let fu = p.payload[1];
                if fu & 0x80 != 0 {
                    current = Some(vec![(indicator & 0xe0) | (fu & 0x1f)]);
                }
                let nal = current.as_mut().expect("fragment without start");
                nal.extend_from_slice(&p.payload[2..]);
                if fu & 0x40 != 0 {
                    nals.push(current.take().unwrap());
                }
            } else {
                nals.push(p.payload.clone());
            }
        }
        nals
    }

    #[test]
    fn sps_pps_idr_gives_three_packets_marker_on_last() {
        let mut p = make_packetizer();
        let unit = au(
            Codec::H264,
            vec![
                NalUnit::new(Codec::H264, vec![0x67, 0x42, 0x00, 0x1e]),
                NalUnit::new(Codec::H264, vec![0x68, 0xce, 0x38, 0x80]),
                h264_nal(0x65, 500),
            ],
        );
        let packets = p.packetize(&unit);
        let markers: Vec<bool> = packets.iter().map(|p| p.marker).collect();
        assert_eq!(markers, vec![false, false, true]);
        assert!(packets.iter().all(|p| p.timestamp == 90_000));
    }

    #[test]
    fn nal_at_exact_boundary_is_not_fragmented() {
        let mut p = make_packetizer();
        let unit = au(Codec::H264, vec![h264_nal(0x65, MAX - 12)]);
        let packets = p.packetize(&unit);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].to_bytes().len(), MAX);
        assert_eq!(packets[0].payload, unit.nal_units[0].data);
    }

    #[test]
    fn nal_one_byte_over_boundary_is_fragmented() {
        let mut p = make_packetizer();
        let len = MAX - 12 + 1;
        let unit = au(Codec::H264, vec![h264_nal(0x65, len)]);
        let packets = p.packetize(&unit);

        let remaining = len - 1;
        let capacity = MAX - 14;
        assert_eq!(packets.len(), remaining.div_ceil(capacity));
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.to_bytes().len() <= MAX));
    }

    #[test]
    fn h265_fragment_capacity() {
        let mut p = make_packetizer();
        assert_eq!(p.fragment_capacity(Codec::H265), MAX - 15);

        let mut data = vec![0x26, 0x01];
        data.extend(vec![0x55; 3 * (MAX - 15)]);
        let unit = au(Codec::H265, vec![NalUnit::new(Codec::H265, data)]);
        let packets = p.packetize(&unit);
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.to_bytes().len() <= MAX));
        assert_eq!(packets.iter().filter(|p| p.marker).count(), 1);
        assert!(packets[2].marker);
    }

    #[test]
    fn fragmented_units_reassemble_byte_for_byte() {
        let mut p = make_packetizer();
        let nals = vec![
            h264_nal(0x06, 20),
            h264_nal(0x65, 5000),
            h264_nal(0x41, 1388),
            h264_nal(0x41, 2777),
        ];
        let unit = au(Codec::H264, nals.clone());
        let packets = p.packetize(&unit);

        let rebuilt = reassemble_h264(&packets);
        let original: Vec<Vec<u8>> = nals.into_iter().map(|n| n.data).collect();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn marker_only_on_final_packet_of_unit() {
        let mut p = make_packetizer();
        let unit = au(
            Codec::H264,
            vec![h264_nal(0x65, 4000), h264_nal(0x65, 3000)],
        );
        let packets = p.packetize(&unit);
        assert_eq!(packets.iter().filter(|p| p.marker).count(), 1);
        assert!(packets.last().unwrap().marker);
    }

    #[test]
    fn trailing_empty_nal_does_not_steal_marker() {
        let mut p = make_packetizer();
        let unit = au(
            Codec::H264,
            vec![h264_nal(0x65, 100), NalUnit::new(Codec::H264, vec![])],
        );
        let packets = p.packetize(&unit);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].marker);
    }

    #[test]
    fn empty_unit_has_no_packets() {
        let mut p = make_packetizer();
        assert!(p.packetize(&au(Codec::H264, vec![])).is_empty());
        assert_eq!(p.next_sequence(), 1000);
    }

    #[test]
    fn sequence_contiguous_across_units_and_wraps() {
        let mut p = Packetizer::new(96, 1, u16::MAX - 3, MAX);
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let unit = au(Codec::H264, vec![h264_nal(0x41, 3000)]);
            seqs.extend(p.packetize(&unit).iter().map(|p| p.sequence_number));
        }
        assert_eq!(seqs.len(), 9);
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
        assert_eq!(seqs[0], u16::MAX - 3);
        assert!(seqs.contains(&0));
    }

    #[test]
    fn config_packets_are_unfragmented_without_marker() {
        let mut p = make_packetizer();
        let ps = ParameterSets {
            vps: Some(vec![0x40, 0x01, 0x0c]),
            sps: Some(vec![0x42, 0x01, 0x01]),
            pps: Some(vec![0x44, 0x01, 0xc1]),
        };
        let packets = p.packetize_config(Codec::H265, &ps, 4242);
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| !p.marker && p.timestamp == 4242));
        assert_eq!(packets[0].payload, vec![0x40, 0x01, 0x0c]);
        assert_eq!(packets[2].payload, vec![0x44, 0x01, 0xc1]);
        assert_eq!(p.next_sequence(), 1003);
    }

    #[test]
    fn config_then_media_sequence_continues() {
        let mut p = make_packetizer();
        let ps = ParameterSets {
            vps: None,
            sps: Some(vec![0x67, 0x42]),
            pps: Some(vec![0x68, 0xce]),
        };
        let cfg = p.packetize_config(Codec::H264, &ps, 0);
        let media = p.packetize(&au(Codec::H264, vec![h264_nal(0x65, 10)]));
        assert_eq!(cfg[1].sequence_number.wrapping_add(1), media[0].sequence_number);
    }

    #[test]
    fn tiny_max_packet_size_is_clamped() {
        let p = Packetizer::new(96, 1, 0, 4);
        assert_eq!(p.max_packet_size(), MIN_PACKET_SIZE);
        assert_eq!(p.fragment_capacity(Codec::H265), 1);
    }
}
