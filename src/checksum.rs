//! Internet Checksum
//!
//! RFC 1071 one's-complement checksum used both as the fragmentation MIC and,
//! with the IPv6 pseudo-header, as the UDP checksum.

use crate::packet::NEXT_HEADER_UDP;

/// Compute the RFC 1071 checksum of `data`
///
/// Bytes are summed as big-endian 16-bit words; an odd trailing byte is
/// padded with a zero low byte. An empty buffer yields `0xFFFF`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(sum_words(0, data))
}

/// Compute the UDP checksum of `udp_segment` (header with a zeroed checksum
/// field, followed by the UDP payload) for the given IPv6 addresses
///
/// ```text
/// +-------------------------------+
/// |        Source Address         |  16 bytes
/// +-------------------------------+
/// |      Destination Address      |  16 bytes
/// +-------------------------------+
/// |    Upper-Layer Packet Length  |  4 bytes
/// +-----------------------+-------+
/// |         zero          |  NH   |  3 + 1 bytes
/// +-----------------------+-------+
/// ```
///
/// A computed value of zero is transmitted as `0xFFFF` (RFC 8200 §8.1).
pub fn udp_ipv6_checksum(src: &[u8; 16], dst: &[u8; 16], udp_segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(src);
    pseudo[16..32].copy_from_slice(dst);
    pseudo[32..36].copy_from_slice(&(udp_segment.len() as u32).to_be_bytes());
    pseudo[39] = NEXT_HEADER_UDP;

    let sum = sum_words(sum_words(0, &pseudo), udp_segment);
    match finish(sum) {
        0 => 0xFFFF,
        checksum => checksum,
    }
}

/// Accumulate big-endian 16-bit words of `data` onto `sum`
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold carries and complement
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
