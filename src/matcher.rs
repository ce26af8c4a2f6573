//! Field Matching Logic
//!
//! Selects the compression rule for a packet. Rules are tried in table order
//! and the first rule whose every field matches, and whose option rows
//! account for exactly the packet's CoAP options, wins.

use crate::field_id::FieldId;
use crate::packet::{CoapOption, NormalizedPacket};
use crate::rule::{Field, MatchingOperator, Rule, RuleSet, RuleValue, fit_right};

// =============================================================================
// Packet Field Values
// =============================================================================

/// Value of one packet field, borrowed from the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Scalar(u64),
    Bytes(&'a [u8]),
}

/// Read a field from the packet
///
/// Option rows read the option under the cursor; `None` is returned when the
/// packet has no option left there.
pub fn field_value<'a>(
    packet: &'a NormalizedPacket,
    fid: FieldId,
    option: Option<&'a CoapOption>,
) -> Option<FieldValue<'a>> {
    use FieldValue::{Bytes, Scalar};

    let value = match fid {
        FieldId::Ipv6Ver => Scalar(packet.ipv6_version as u64),
        FieldId::Ipv6Tc => Scalar(packet.ipv6_traffic_class as u64),
        FieldId::Ipv6Fl => Scalar(packet.ipv6_flow_label as u64),
        FieldId::Ipv6Len => Scalar(packet.ipv6_payload_length as u64),
        FieldId::Ipv6Nxt => Scalar(packet.ipv6_next_header as u64),
        FieldId::Ipv6HopLmt => Scalar(packet.ipv6_hop_limit as u64),
        FieldId::Ipv6DevPrefix => Bytes(&packet.ipv6_dev_prefix),
        FieldId::Ipv6DevIid => Bytes(&packet.ipv6_dev_iid),
        FieldId::Ipv6AppPrefix => Bytes(&packet.ipv6_app_prefix),
        FieldId::Ipv6AppIid => Bytes(&packet.ipv6_app_iid),
        FieldId::UdpDevPort => Scalar(packet.udp_dev_port as u64),
        FieldId::UdpAppPort => Scalar(packet.udp_app_port as u64),
        FieldId::UdpLen => Scalar(packet.udp_length as u64),
        FieldId::UdpCksum => Scalar(packet.udp_checksum as u64),
        FieldId::CoapVer => Scalar(packet.coap_version as u64),
        FieldId::CoapType => Scalar(packet.coap_type as u64),
        FieldId::CoapTkl => Scalar(packet.coap_tkl as u64),
        FieldId::CoapCode => Scalar(packet.coap_code as u64),
        FieldId::CoapMid => Bytes(&packet.coap_message_id),
        FieldId::CoapToken => Bytes(&packet.coap_token),
        FieldId::CoapOptDelta => Scalar(option?.delta as u64),
        FieldId::CoapOptLen => Scalar(option?.length() as u64),
        FieldId::CoapOptValue => Bytes(&option?.value),
    };
    Some(value)
}

/// Check if a packet value equals a target value
#[inline]
pub fn values_match(packet_value: FieldValue<'_>, target_value: &RuleValue) -> bool {
    match (packet_value, target_value) {
        (FieldValue::Scalar(p), RuleValue::U64(t)) => p == *t,
        (FieldValue::Bytes(p), RuleValue::Bytes(t)) => p == t.as_slice(),
        _ => false,
    }
}

// =============================================================================
// Option Cursor
// =============================================================================

/// Position in the packet's CoAP option list during one rule attempt
///
/// Delta and length rows look at the option under the cursor; a value row
/// closes the option and moves the cursor on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionCursor {
    position: usize,
}

impl OptionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current<'a>(&self, packet: &'a NormalizedPacket) -> Option<&'a CoapOption> {
        packet.coap_options.get(self.position)
    }

    pub fn advance(&mut self) {
        self.position += 1;
    }

    /// Number of options consumed so far
    pub fn position(&self) -> usize {
        self.position
    }
}

// =============================================================================
// Rule Matching
// =============================================================================

/// Test one rule row against the packet
pub fn field_matches(field: &Field, packet: &NormalizedPacket, cursor: &mut OptionCursor) -> bool {
    let option = cursor.current(packet);
    if field.fid == FieldId::CoapOptValue {
        cursor.advance();
    }

    let Some(packet_value) = field_value(packet, field.fid, option) else {
        return false;
    };

    match field.mo {
        MatchingOperator::Ignore => true,
        MatchingOperator::Equal => match field.target() {
            Some(RuleValue::Bytes(tv)) if field.fid == FieldId::CoapToken => {
                packet_value == FieldValue::Bytes(&fit_right(tv, packet.coap_tkl as usize))
            }
            Some(tv) => values_match(packet_value, tv),
            None => false,
        },
        MatchingOperator::MatchMapping | MatchingOperator::Msb(_) => false,
    }
}

/// Check whether every row of `rule` matches and all options are accounted for
pub fn rule_matches(rule: &Rule, packet: &NormalizedPacket) -> bool {
    let mut cursor = OptionCursor::new();
    rule.compression
        .iter()
        .all(|field| field_matches(field, packet, &mut cursor))
        && cursor.position() == packet.coap_option_num()
}

/// Find the first matching rule, returning its id
pub fn find_rule<'a>(rules: &'a RuleSet, packet: &NormalizedPacket) -> Option<(u8, &'a Rule)> {
    rules
        .rules
        .iter()
        .enumerate()
        .find(|(_, rule)| rule_matches(rule, packet))
        .map(|(index, rule)| (index as u8, rule))
}
