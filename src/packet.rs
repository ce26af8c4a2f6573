//! Normalized Packet
//!
//! Field-level view of one IPv6/UDP/CoAP datagram. The header codec fills it
//! from raw bytes, the compressor reads it and the decompressor rebuilds it.
//! Addresses and ports are stored by role (device / application) rather than
//! by source / destination, so the same record describes an uplink and a
//! downlink packet.

use crate::error::{Result, SchcError};

// =============================================================================
// Protocol Constants
// =============================================================================

/// Largest IPv6 datagram handled by the codec and the reassembly buffer
pub const MTU: usize = 1280;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;
pub const COAP_HEADER_LEN: usize = 4;
/// Maximum number of CoAP options a packet may carry
pub const MAX_COAP_OPTIONS: usize = 4;
/// Option values longer than this cannot be sent in a one-byte residue length
pub const MAX_COAP_OPTION_LEN: usize = 255;
pub const MAX_TOKEN_LEN: usize = 8;
pub const COAP_PAYLOAD_MARKER: u8 = 0xFF;
pub const NEXT_HEADER_UDP: u8 = 17;

// =============================================================================
// CoAP Option
// =============================================================================

/// One CoAP option as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoapOption {
    /// Delta from the previous option number (not the absolute number)
    pub delta: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(delta: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            delta,
            value: value.into(),
        }
    }

    pub fn length(&self) -> usize {
        self.value.len()
    }

    /// Size of this option once encoded (RFC 7252 §3.1)
    pub fn encoded_len(&self) -> usize {
        1 + extended_len(self.delta as usize) + extended_len(self.length()) + self.length()
    }
}

/// Extra bytes an option delta or length needs beyond the initial nibble
pub fn extended_len(value: usize) -> usize {
    if value < 13 {
        0
    } else if value < 269 {
        1
    } else {
        2
    }
}

// =============================================================================
// Normalized Packet
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedPacket {
    pub ipv6_version: u8,
    pub ipv6_traffic_class: u8,
    /// 20-bit flow label
    pub ipv6_flow_label: u32,
    pub ipv6_payload_length: u16,
    pub ipv6_next_header: u8,
    pub ipv6_hop_limit: u8,
    pub ipv6_dev_prefix: [u8; 8],
    pub ipv6_dev_iid: [u8; 8],
    pub ipv6_app_prefix: [u8; 8],
    pub ipv6_app_iid: [u8; 8],

    pub udp_dev_port: u16,
    pub udp_app_port: u16,
    pub udp_length: u16,
    pub udp_checksum: u16,

    pub coap_version: u8,
    pub coap_type: u8,
    pub coap_tkl: u8,
    pub coap_code: u8,
    pub coap_message_id: [u8; 2],
    /// Exactly `coap_tkl` bytes
    pub coap_token: Vec<u8>,
    pub coap_options: Vec<CoapOption>,
    pub coap_payload: Vec<u8>,
}

impl NormalizedPacket {
    pub fn coap_option_num(&self) -> usize {
        self.coap_options.len()
    }

    /// Full device address (prefix + IID)
    pub fn dev_address(&self) -> [u8; 16] {
        join_address(&self.ipv6_dev_prefix, &self.ipv6_dev_iid)
    }

    /// Full application address (prefix + IID)
    pub fn app_address(&self) -> [u8; 16] {
        join_address(&self.ipv6_app_prefix, &self.ipv6_app_iid)
    }

    /// Size of the CoAP message: header, token, options, marker and payload
    pub fn coap_len(&self) -> usize {
        let options: usize = self.coap_options.iter().map(CoapOption::encoded_len).sum();
        let marker = usize::from(!self.coap_payload.is_empty());
        COAP_HEADER_LEN + self.coap_token.len() + options + marker + self.coap_payload.len()
    }

    /// Check the bounds the codec and the residue format depend on
    pub fn validate(&self) -> Result<()> {
        if self.coap_options.len() > MAX_COAP_OPTIONS {
            return Err(SchcError::MalformedInput(format!(
                "{} CoAP options exceed the maximum of {}",
                self.coap_options.len(),
                MAX_COAP_OPTIONS
            )));
        }
        if self.coap_token.len() != self.coap_tkl as usize || self.coap_token.len() > MAX_TOKEN_LEN
        {
            return Err(SchcError::MalformedInput(format!(
                "token of {} bytes does not match TKL {}",
                self.coap_token.len(),
                self.coap_tkl
            )));
        }
        if let Some(option) = self
            .coap_options
            .iter()
            .find(|o| o.length() > MAX_COAP_OPTION_LEN)
        {
            return Err(SchcError::MalformedInput(format!(
                "CoAP option of {} bytes exceeds {} bytes",
                option.length(),
                MAX_COAP_OPTION_LEN
            )));
        }
        let datagram_len = IPV6_HEADER_LEN + UDP_HEADER_LEN + self.coap_len();
        if datagram_len > MTU {
            return Err(SchcError::ResourceExhausted(format!(
                "datagram of {} bytes exceeds the {} byte MTU",
                datagram_len, MTU
            )));
        }
        Ok(())
    }
}

fn join_address(prefix: &[u8; 8], iid: &[u8; 8]) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[..8].copy_from_slice(prefix);
    addr[8..].copy_from_slice(iid);
    addr
}
