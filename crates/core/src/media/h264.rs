//! H.264 RTP payload format (RFC 6184).
//!
//! Two packetization modes are used:
//!
//! - **Single NAL Unit** (§5.6): NALs that fit in one packet are sent as-is
//!   (12-byte RTP header + NAL bytes).
//!
//! - **FU-A Fragmentation** (§5.8): larger NALs are split across packets.
//!   Each fragment carries a 2-byte prefix before the NAL payload:
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   Fragment data: [...]
//!   ```
//!
//!   The original 1-byte NAL header is not transmitted; receivers rebuild
//!   it from the F/NRI bits of the indicator and the type of the FU header.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::{Codec, NalKind, ParameterSets};

pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_FU_A: u8 = 28;

pub(super) fn classify(nal_type: u8) -> NalKind {
    match nal_type {
        NAL_TYPE_SPS => NalKind::Sps,
        NAL_TYPE_PPS => NalKind::Pps,
        NAL_TYPE_IDR => NalKind::Keyframe,
        1..=4 => NalKind::Slice,
        _ => NalKind::Other,
    }
}

/// Split one NAL unit into FU-A payloads of at most `capacity` data bytes each.
///
/// `capacity` counts fragment data only, excluding the 2-byte FU prefix.
pub fn fragment(nal: &[u8], capacity: usize) -> Vec<Vec<u8>> {
    let Some((header, payload)) = nal.split_at_checked(Codec::H264.nal_header_len()) else {
        return Vec::new();
    };
    let header = header[0];

    // FU indicator keeps F and NRI from the original header.
    let fu_indicator = (header & 0xe0) | NAL_TYPE_FU_A;
    let nal_type = header & 0x1f;
    let capacity = capacity.max(1);

    let count = payload.len().div_ceil(capacity);
    let mut fragments = Vec::with_capacity(count);

    for (i, chunk) in payload.chunks(capacity).enumerate() {
        let start_bit = if i == 0 { 0x80 } else { 0x00 };
        let end_bit = if i + 1 == count { 0x40 } else { 0x00 };

        let mut fu = Vec::with_capacity(Codec::H264.fu_overhead() + chunk.len());
        fu.push(fu_indicator);
        fu.push(start_bit | end_bit | nal_type);
        fu.extend_from_slice(chunk);
        fragments.push(fu);
    }

    tracing::trace!(
        nal_type,
        nal_size = nal.len(),
        fragments = fragments.len(),
        "FU-A fragmented NAL unit"
    );

    fragments
}

/// `profile-level-id` from the SPS (RFC 6184 §8.1): the three bytes after
/// the NAL header are profile_idc, constraint flags and level_idc.
pub fn profile_level_id(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

/// Format parameters for the `a=fmtp` line (RFC 6184 §8.1).
///
/// Returns `None` until both SPS and PPS are known.
pub fn fmtp_parameters(params: &ParameterSets) -> Option<String> {
    let sps = params.sps.as_deref()?;
    let pps = params.pps.as_deref()?;

    let mut fmtp = String::from("packetization-mode=1");
    if let Some(pl) = profile_level_id(sps) {
        fmtp.push_str(&format!(";profile-level-id={pl}"));
    }
    fmtp.push_str(&format!(
        ";sprop-parameter-sets={},{}",
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    ));
    Some(fmtp)
}
