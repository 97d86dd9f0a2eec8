//! Annex-B NAL unit extraction (ITU-T H.264 / H.265 Annex B).
//!
//! Annex-B bitstreams delimit NAL units with start codes:
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`
//!
//! Both forms may be mixed within one buffer. The start code length is
//! tracked per NAL so boundaries between adjacent units are computed
//! correctly.

use super::{Codec, NalUnit};

/// Split an Annex-B buffer into raw NAL unit slices (start codes removed).
///
/// Returns an empty vector when the buffer contains no start code. That is
/// not an error: there is simply nothing to packetize.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i + 2 < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            starts.push((i + 4, 4));
            i += 4;
        } else if data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (idx, &(start, _)) in starts.iter().enumerate() {
        let end = match starts.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            units.push(&data[start..end]);
        }
    }
    units
}

/// Extract and classify the NAL units of an Annex-B buffer.
pub fn extract(codec: Codec, data: &[u8]) -> Vec<NalUnit> {
    let units: Vec<NalUnit> = split_annexb(data)
        .into_iter()
        .map(|raw| NalUnit::new(codec, raw.to_vec()))
        .collect();

    tracing::trace!(
        %codec,
        bytes = data.len(),
        nal_count = units.len(),
        "extracted NAL units"
    );
    units
}

/// Remove a leading Annex-B start code, if any.
///
/// Parameter sets handed over by an encoder may or may not carry one.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        data
    }
}
