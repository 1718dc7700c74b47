//! Helpers for the FSN/BLP encoding of generic NACKs (RFC 4585 §6.2.1)

use webrtc::rtcp::transport_feedbacks::transport_layer_nack::NackPair;

/// A pair names its first lost packet plus up to 16 followers
pub const NACK_PAIR_SPAN: u16 = 17;

fn blp_bit(fsn: u16, sn: u16) -> u16 {
    let offset = sn.wrapping_sub(fsn);
    if (1..NACK_PAIR_SPAN).contains(&offset) {
        1 << (offset - 1)
    } else {
        0
    }
}

/// Mark `sn` as lost in the bitmask relative to `fsn`.
/// Sequence numbers outside `fsn + 1 ..= fsn + 16` leave the mask untouched.
#[must_use]
pub fn add_blp(fsn: u16, sn: u16, blp: u16) -> u16 {
    blp | blp_bit(fsn, sn)
}

/// Clear the bit for `sn` relative to `fsn`
#[must_use]
pub fn sub_blp(fsn: u16, sn: u16, blp: u16) -> u16 {
    blp & !blp_bit(fsn, sn)
}

/// Build a single pair from a sorted list of lost sequence numbers.
///
/// The first entry becomes the FSN. Entries more than 16 past it cannot be
/// represented in one pair and are dropped.
#[must_use]
pub fn create_nack_pair(seqs: &[u16]) -> Option<NackPair> {
    let (&fsn, rest) = seqs.split_first()?;
    let lost_packets = rest.iter().fold(0, |blp, &sn| add_blp(fsn, sn, blp));
    Some(NackPair {
        packet_id: fsn,
        lost_packets,
    })
}

/// Expand a pair into the sequence numbers it reports lost, FSN first.
///
/// Uses wrapping arithmetic so pairs straddling 65535 → 0 expand correctly.
#[must_use]
pub fn packet_list(pair: &NackPair) -> Vec<u16> {
    let mut seqs = Vec::with_capacity(usize::from(NACK_PAIR_SPAN));
    seqs.push(pair.packet_id);
    seqs.extend(
        (1..NACK_PAIR_SPAN)
            .filter(|offset| pair.lost_packets & (1 << (offset - 1)) != 0)
            .map(|offset| pair.packet_id.wrapping_add(offset)),
    );
    seqs
}
