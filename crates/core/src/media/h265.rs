//! H.265 (HEVC) RTP payload format (RFC 7798).
//!
//! Differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header**; the type is in bits 1..6 of the first byte.
//!
//! - **Fragmentation units** (§4.4.3) carry a 2-byte PayloadHdr with
//!   type 49, copying F, LayerId and TID from the original header, then a
//!   1-byte FU header `[S|E|FuType(6)]`:
//!
//!   ```text
//!   PayloadHdr: [F|Type=49|LayerId|TID]  (2 bytes)
//!   FU header:  [S|E|FuType]             (1 byte)
//!   ```
//!
//! - **SDP** (§7.1) carries `sprop-vps`, `sprop-sps` and `sprop-pps`.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::{Codec, NalKind, ParameterSets};

pub const NAL_TYPE_VPS: u8 = 32;
pub const NAL_TYPE_SPS: u8 = 33;
pub const NAL_TYPE_PPS: u8 = 34;
pub const NAL_TYPE_FU: u8 = 49;

pub(super) fn classify(nal_type: u8) -> NalKind {
    match nal_type {
        NAL_TYPE_VPS => NalKind::Vps,
        NAL_TYPE_SPS => NalKind::Sps,
        NAL_TYPE_PPS => NalKind::Pps,
        // BLA, IDR and CRA pictures (IRAP range).
        16..=21 => NalKind::Keyframe,
        0..=9 => NalKind::Slice,
        _ => NalKind::Other,
    }
}

/// Split one NAL unit into FU payloads of at most `capacity` data bytes each.
///
/// `capacity` excludes the 3-byte PayloadHdr + FU header prefix.
pub fn fragment(nal: &[u8], capacity: usize) -> Vec<Vec<u8>> {
    let Some((header, payload)) = nal.split_at_checked(Codec::H265.nal_header_len()) else {
        return Vec::new();
    };

    let payload_hdr = [(header[0] & 0x81) | (NAL_TYPE_FU << 1), header[1]];
    let fu_type = (header[0] >> 1) & 0x3f;
    let capacity = capacity.max(1);

    let count = payload.len().div_ceil(capacity);
    let mut fragments = Vec::with_capacity(count);

    for (i, chunk) in payload.chunks(capacity).enumerate() {
        let start_bit = if i == 0 { 0x80 } else { 0x00 };
        let end_bit = if i + 1 == count { 0x40 } else { 0x00 };

        let mut fu = Vec::with_capacity(Codec::H265.fu_overhead() + chunk.len());
        fu.extend_from_slice(&payload_hdr);
        fu.push(start_bit | end_bit | fu_type);
        fu.extend_from_slice(chunk);
        fragments.push(fu);
    }

    tracing::trace!(
        fu_type,
        nal_size = nal.len(),
        fragments = fragments.len(),
        "H.265 FU fragmented NAL unit"
    );

    fragments
}

/// Format parameters for the `a=fmtp` line (RFC 7798 §7.1).
///
/// Returns `None` until VPS, SPS and PPS are all known.
pub fn fmtp_parameters(params: &ParameterSets) -> Option<String> {
    let vps = params.vps.as_deref()?;
    let sps = params.sps.as_deref()?;
    let pps = params.pps.as_deref()?;

    Some(format!(
        "sprop-vps={};sprop-sps={};sprop-pps={}",
        BASE64_STANDARD.encode(vps),
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fu_payload_header_layout() {
        // IDR_W_RADL (19): first byte 0x26, TID=1.
        let mut nal = vec![0x26, 0x01];
        nal.extend(vec![0xAB; 250]);
        let frags = fragment(&nal, 100);

        assert_eq!(frags.len(), 3);
        for f in &frags {
            assert_eq!((f[0] >> 1) & 0x3f, NAL_TYPE_FU);
            assert_eq!(f[1], 0x01);
            assert_eq!(f[2] & 0x3f, 19);
        }
        assert_eq!(frags[0][2] & 0xc0, 0x80);
        assert_eq!(frags[1][2] & 0xc0, 0x00);
        assert_eq!(frags[2][2] & 0xc0, 0x40);
        assert_eq!(frags[2].len(), 3 + 50);
    }

    #[test]
    fn truncated_header_has_no_fragments() {
        assert!(fragment(&[0x26], 100).is_empty());
        assert!(fragment(&[0x26, 0x01], 100).is_empty());
        assert_eq!(
            Codec::H265.fu_overhead(),
            Codec::H265.nal_header_len() + 1,
            "PayloadHdr mirrors the NAL header, plus one FU header byte"
        );
    }

    #[test]
    fn fragments_reassemble_to_original() {
        let mut nal = vec![0x02, 0x01];
        nal.extend((0..5000u32).map(|i| (i % 251) as u8));
        let frags = fragment(&nal, 1385);

        let first = &frags[0];
        let fu_type = first[2] & 0x3f;
        let mut rebuilt = vec![(first[0] & 0x81) | (fu_type << 1), first[1]];
        for f in &frags {
            rebuilt.extend_from_slice(&f[3..]);
        }
        assert_eq!(rebuilt, nal);
    }

    #[test]
    fn fmtp_lists_all_three_sets() {
        let ps = ParameterSets {
            vps: Some(vec![0x40, 0x01]),
            sps: Some(vec![0x42, 0x01]),
            pps: Some(vec![0x44, 0x01]),
        };
        assert_eq!(
            fmtp_parameters(&ps).unwrap(),
            "sprop-vps=QAE=;sprop-sps=QgE=;sprop-pps=RAE="
        );
    }

    #[test]
    fn fmtp_missing_vps() {
        let ps = ParameterSets {
            vps: None,
            sps: Some(vec![0x42, 0x01]),
            pps: Some(vec![0x44, 0x01]),
        };
        assert!(fmtp_parameters(&ps).is_none());
    }
}
