//! Packet Parser
//!
//! Decodes a raw IPv6/UDP/CoAP datagram into a [`NormalizedPacket`]. IPv6 and
//! UDP header fields are read through `pnet` packet views; CoAP is decoded by
//! hand, with every length checked against the datagram so malformed input
//! is rejected instead of read past.

use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::UdpPacket;

use crate::error::{Result, SchcError};
use crate::packet::{
    COAP_HEADER_LEN, COAP_PAYLOAD_MARKER, CoapOption, IPV6_HEADER_LEN, MAX_COAP_OPTIONS,
    MAX_TOKEN_LEN, MTU, NEXT_HEADER_UDP, NormalizedPacket, UDP_HEADER_LEN,
};

// =============================================================================
// Direction
// =============================================================================

/// Packet direction, deciding which address and port belong to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,   // DEV -> APP
    Down, // APP -> DEV
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

// =============================================================================
// Link Layer Configuration
// =============================================================================

/// Link layer framing in front of the IPv6 header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkLayer {
    /// No link layer header (raw IP packets)
    None,
    /// Standard Ethernet header (14 bytes: 6 dst + 6 src + 2 ethertype)
    #[default]
    Ethernet,
    /// Custom link layer with specified header length in bytes
    Custom(usize),
}

impl LinkLayer {
    /// Get the header length in bytes for this link layer type
    pub fn header_len(&self) -> usize {
        match self {
            LinkLayer::None => 0,
            LinkLayer::Ethernet => 14,
            LinkLayer::Custom(len) => *len,
        }
    }

    /// Strip the link layer header from a captured frame
    pub fn strip<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        frame.get(self.header_len()..).ok_or_else(|| {
            SchcError::MalformedInput(format!(
                "frame of {} bytes shorter than its {} byte link header",
                frame.len(),
                self.header_len()
            ))
        })
    }
}

// =============================================================================
// Datagram Parsing
// =============================================================================

/// Parse a raw IPv6/UDP/CoAP datagram
///
/// `direction` tells which end is the device: for [`Direction::Up`] the
/// source address and port are the device's.
pub fn parse_packet(raw: &[u8], direction: Direction) -> Result<NormalizedPacket> {
    if raw.len() > MTU {
        return Err(SchcError::ResourceExhausted(format!(
            "datagram of {} bytes exceeds the {} byte MTU",
            raw.len(),
            MTU
        )));
    }

    let ipv6 = Ipv6Packet::new(raw)
        .ok_or_else(|| malformed(format!("{} bytes is too short for IPv6", raw.len())))?;

    if ipv6.get_version() != 6 {
        return Err(malformed(format!("IP version {} is not 6", ipv6.get_version())));
    }
    let next_header = ipv6.get_next_header().0;
    if next_header != NEXT_HEADER_UDP {
        return Err(malformed(format!("next header {} is not UDP", next_header)));
    }

    let payload_length = ipv6.get_payload_length();
    let ip_end = IPV6_HEADER_LEN + payload_length as usize;
    if ip_end > raw.len() {
        return Err(malformed(format!(
            "IPv6 payload length {} runs past the {} byte buffer",
            payload_length,
            raw.len()
        )));
    }

    let src = ipv6.get_source().octets();
    let dst = ipv6.get_destination().octets();
    let (dev_addr, app_addr) = match direction {
        Direction::Up => (src, dst),
        Direction::Down => (dst, src),
    };

    let mut packet = NormalizedPacket {
        ipv6_version: ipv6.get_version(),
        ipv6_traffic_class: ipv6.get_traffic_class(),
        ipv6_flow_label: ipv6.get_flow_label(),
        ipv6_payload_length: payload_length,
        ipv6_next_header: next_header,
        ipv6_hop_limit: ipv6.get_hop_limit(),
        ..Default::default()
    };
    packet.ipv6_dev_prefix.copy_from_slice(&dev_addr[..8]);
    packet.ipv6_dev_iid.copy_from_slice(&dev_addr[8..]);
    packet.ipv6_app_prefix.copy_from_slice(&app_addr[..8]);
    packet.ipv6_app_iid.copy_from_slice(&app_addr[8..]);

    let coap = parse_udp(&raw[IPV6_HEADER_LEN..ip_end], direction, &mut packet)?;
    parse_coap(coap, &mut packet)?;

    Ok(packet)
}

/// Fill the UDP fields and return the UDP payload
fn parse_udp<'a>(
    segment: &'a [u8],
    direction: Direction,
    packet: &mut NormalizedPacket,
) -> Result<&'a [u8]> {
    let udp = UdpPacket::new(segment)
        .ok_or_else(|| malformed(format!("{} bytes is too short for UDP", segment.len())))?;

    let length = udp.get_length() as usize;
    if length < UDP_HEADER_LEN || length > segment.len() {
        return Err(malformed(format!(
            "UDP length {} inconsistent with {} byte segment",
            length,
            segment.len()
        )));
    }

    let (dev_port, app_port) = match direction {
        Direction::Up => (udp.get_source(), udp.get_destination()),
        Direction::Down => (udp.get_destination(), udp.get_source()),
    };
    packet.udp_dev_port = dev_port;
    packet.udp_app_port = app_port;
    packet.udp_length = udp.get_length();
    packet.udp_checksum = udp.get_checksum();

    Ok(&segment[UDP_HEADER_LEN..length])
}

// =============================================================================
// CoAP Parsing
// =============================================================================

/// CoAP Header Format (RFC 7252):
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Ver| T |  TKL  |      Code     |          Message ID           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Token (if any, TKL bytes) ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Options (if any) ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |1 1 1 1 1 1 1 1|    Payload (if any) ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn parse_coap(data: &[u8], packet: &mut NormalizedPacket) -> Result<()> {
    if data.len() < COAP_HEADER_LEN {
        return Err(malformed(format!("{} bytes is too short for CoAP", data.len())));
    }

    packet.coap_version = data[0] >> 6;
    packet.coap_type = (data[0] >> 4) & 0x03;
    packet.coap_tkl = data[0] & 0x0F;
    packet.coap_code = data[1];
    packet.coap_message_id = [data[2], data[3]];

    let tkl = packet.coap_tkl as usize;
    if tkl > MAX_TOKEN_LEN {
        return Err(malformed(format!("reserved token length {}", tkl)));
    }
    let mut offset = COAP_HEADER_LEN + tkl;
    packet.coap_token = data
        .get(COAP_HEADER_LEN..offset)
        .ok_or_else(|| malformed("token runs past the datagram".to_string()))?
        .to_vec();

    packet.coap_options.clear();
    while offset < data.len() {
        let initial = data[offset];
        offset += 1;

        if initial == COAP_PAYLOAD_MARKER {
            if offset == data.len() {
                return Err(malformed("payload marker without payload".to_string()));
            }
            packet.coap_payload = data[offset..].to_vec();
            return Ok(());
        }

        if packet.coap_options.len() == MAX_COAP_OPTIONS {
            return Err(malformed(format!(
                "more than {} CoAP options",
                MAX_COAP_OPTIONS
            )));
        }

        let delta = read_extended(initial >> 4, data, &mut offset)?;
        let length = read_extended(initial & 0x0F, data, &mut offset)?;
        let delta = u16::try_from(delta)
            .map_err(|_| malformed(format!("option delta {} out of range", delta)))?;

        let value = data
            .get(offset..offset + length)
            .ok_or_else(|| {
                malformed(format!("option of {} bytes runs past the datagram", length))
            })?;
        offset += length;

        packet.coap_options.push(CoapOption::new(delta, value));
    }

    packet.coap_payload.clear();
    Ok(())
}

/// Resolve an option delta or length nibble, reading its extended bytes
fn read_extended(nibble: u8, data: &[u8], offset: &mut usize) -> Result<usize> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let ext = *data
                .get(*offset)
                .ok_or_else(|| malformed("truncated extended option field".to_string()))?;
            *offset += 1;
            Ok(ext as usize + 13)
        }
        14 => {
            let ext = data
                .get(*offset..*offset + 2)
                .ok_or_else(|| malformed("truncated extended option field".to_string()))?;
            *offset += 2;
            Ok(u16::from_be_bytes([ext[0], ext[1]]) as usize + 269)
        }
        _ => Err(malformed("reserved option nibble 15".to_string())),
    }
}

fn malformed(reason: String) -> SchcError {
    SchcError::MalformedInput(reason)
}
