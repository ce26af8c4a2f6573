//! Packet Header Builder
//!
//! Serializes a [`NormalizedPacket`] back into an IPv6/UDP/CoAP datagram and
//! computes the UDP checksum over the IPv6 pseudo-header.

use crate::checksum::udp_ipv6_checksum;
use crate::error::{Result, SchcError};
use crate::packet::{
    COAP_PAYLOAD_MARKER, IPV6_HEADER_LEN, MTU, NormalizedPacket, UDP_HEADER_LEN,
};
use crate::parser::Direction;

// =============================================================================
// Datagram Construction
// =============================================================================

/// Serialize a packet as it travels in `direction`
///
/// Length and checksum fields are written as stored in the packet; the
/// decompressor is responsible for filling them in when a rule computes them.
pub fn build_packet(packet: &NormalizedPacket, direction: Direction) -> Result<Vec<u8>> {
    packet.validate()?;

    let udp = build_udp_segment(packet, direction);
    let mut datagram = build_ipv6_header(packet, direction);
    datagram.extend_from_slice(&udp);

    if datagram.len() > MTU {
        return Err(SchcError::ResourceExhausted(format!(
            "datagram of {} bytes exceeds the {} byte MTU",
            datagram.len(),
            MTU
        )));
    }
    Ok(datagram)
}

/// Build IPv6 header from the packet fields
///
/// IPv6 Header Format (40 bytes):
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version| Traffic Class |           Flow Label                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Payload Length        |  Next Header  |   Hop Limit   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                         Source Address                        +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                      Destination Address                      +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn build_ipv6_header(packet: &NormalizedPacket, direction: Direction) -> Vec<u8> {
    let mut header = vec![0u8; IPV6_HEADER_LEN];

    let version = packet.ipv6_version;
    let tc = packet.ipv6_traffic_class;
    let fl = packet.ipv6_flow_label;

    header[0] = (version << 4) | ((tc >> 4) & 0x0F);
    header[1] = ((tc & 0x0F) << 4) | (((fl >> 16) & 0x0F) as u8);
    header[2] = ((fl >> 8) & 0xFF) as u8;
    header[3] = (fl & 0xFF) as u8;

    header[4..6].copy_from_slice(&packet.ipv6_payload_length.to_be_bytes());
    header[6] = packet.ipv6_next_header;
    header[7] = packet.ipv6_hop_limit;

    let (src, dst) = match direction {
        Direction::Up => (packet.dev_address(), packet.app_address()),
        Direction::Down => (packet.app_address(), packet.dev_address()),
    };
    header[8..24].copy_from_slice(&src);
    header[24..40].copy_from_slice(&dst);

    header
}

/// Build the UDP header followed by the CoAP message
///
/// UDP Header Format (8 bytes):
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Source Port          |       Destination Port        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            Length             |           Checksum            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn build_udp_segment(packet: &NormalizedPacket, direction: Direction) -> Vec<u8> {
    let (src_port, dst_port) = match direction {
        Direction::Up => (packet.udp_dev_port, packet.udp_app_port),
        Direction::Down => (packet.udp_app_port, packet.udp_dev_port),
    };

    let coap = build_coap_message(packet);
    let mut segment = Vec::with_capacity(UDP_HEADER_LEN + coap.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&packet.udp_length.to_be_bytes());
    segment.extend_from_slice(&packet.udp_checksum.to_be_bytes());
    segment.extend_from_slice(&coap);
    segment
}

// =============================================================================
// CoAP Message Construction
// =============================================================================

/// Build the CoAP header, token, options, payload marker and payload
pub fn build_coap_message(packet: &NormalizedPacket) -> Vec<u8> {
    let mut message = Vec::with_capacity(packet.coap_len());

    // Byte 0: Ver (2 bits) | Type (2 bits) | TKL (4 bits)
    message.push(
        ((packet.coap_version & 0x03) << 6)
            | ((packet.coap_type & 0x03) << 4)
            | (packet.coap_tkl & 0x0F),
    );
    message.push(packet.coap_code);
    message.extend_from_slice(&packet.coap_message_id);
    message.extend_from_slice(&packet.coap_token);

    for option in &packet.coap_options {
        encode_coap_option(option.delta, &option.value, &mut message);
    }

    if !packet.coap_payload.is_empty() {
        message.push(COAP_PAYLOAD_MARKER);
        message.extend_from_slice(&packet.coap_payload);
    }

    message
}

/// Encode a CoAP option from its delta (RFC 7252 §3.1)
pub fn encode_coap_option(delta: u16, value: &[u8], encoded: &mut Vec<u8>) {
    let delta = delta as usize;
    let length = value.len();

    encoded.push((option_nibble(delta) << 4) | option_nibble(length));
    push_extended(delta, encoded);
    push_extended(length, encoded);
    encoded.extend_from_slice(value);
}

fn option_nibble(value: usize) -> u8 {
    if value < 13 {
        value as u8
    } else if value < 269 {
        13
    } else {
        14
    }
}

fn push_extended(value: usize, encoded: &mut Vec<u8>) {
    if (13..269).contains(&value) {
        encoded.push((value - 13) as u8);
    } else if value >= 269 {
        encoded.extend_from_slice(&((value - 269) as u16).to_be_bytes());
    }
}

// =============================================================================
// Checksum Computation
// =============================================================================

/// Compute the UDP checksum of the packet as stored
///
/// The pseudo-header uses the device address as source and the application
/// address as destination; reversing both addresses and ports yields the same
/// sum, so the result is valid for either direction. A packet the builder
/// would reject has no checksum.
pub fn compute_udp_checksum(packet: &NormalizedPacket) -> Result<u16> {
    packet.validate()?;
    let mut unchecked = packet.clone();
    unchecked.udp_checksum = 0;
    let segment = build_udp_segment(&unchecked, Direction::Up);
    Ok(udp_ipv6_checksum(
        &packet.dev_address(),
        &packet.app_address(),
        &segment,
    ))
}
