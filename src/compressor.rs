//! Compression Logic
//!
//! Applies the Compression/Decompression Actions of the matched rule to a
//! packet, producing the rule id, the residue of every value-sent field and
//! the CoAP payload.

use crate::error::{Result, SchcError};
use crate::field_id::{FieldId, FieldKind};
use crate::matcher::{FieldValue, OptionCursor, field_value, find_rule};
use crate::packet::{IPV6_HEADER_LEN, NormalizedPacket, UDP_HEADER_LEN};
use crate::rule::{CompressionAction, Field, Rule, RuleSet};

// =============================================================================
// Compressed Packet
// =============================================================================

/// Compressed packet output: `[rule id][residue][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPacket {
    pub rule_id: u8,
    /// Wire bytes, starting with the rule id
    pub data: Vec<u8>,
    /// Size of the IPv6, UDP and CoAP headers that were compressed
    pub original_header_bytes: usize,
    /// Rule id plus residue
    pub compressed_header_bytes: usize,
}

impl CompressedPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Header bytes saved by compression
    pub fn savings_bytes(&self) -> i64 {
        self.original_header_bytes as i64 - self.compressed_header_bytes as i64
    }
}

// =============================================================================
// Compression Functions
// =============================================================================

/// Compress a packet with the first matching rule of `rules`
pub fn compress(packet: &NormalizedPacket, rules: &RuleSet) -> Result<CompressedPacket> {
    packet.validate()?;

    let (rule_id, rule) = find_rule(rules, packet).ok_or(SchcError::NoMatchingRule)?;
    log::debug!("Packet matched rule {}", rule_id);

    compress_with_rule(rule_id, rule, packet)
}

/// Compress a packet with an already matched rule
pub fn compress_with_rule(
    rule_id: u8,
    rule: &Rule,
    packet: &NormalizedPacket,
) -> Result<CompressedPacket> {
    let mut data = vec![rule_id];
    let mut cursor = OptionCursor::new();

    for field in &rule.compression {
        compress_field(&mut data, field, packet, &mut cursor)?;
    }

    let compressed_header_bytes = data.len();
    data.extend_from_slice(&packet.coap_payload);

    let original_header_bytes =
        IPV6_HEADER_LEN + UDP_HEADER_LEN + packet.coap_len() - packet.coap_payload.len();

    Ok(CompressedPacket {
        rule_id,
        data,
        original_header_bytes,
        compressed_header_bytes,
    })
}

/// Compress a single field according to its CDA
fn compress_field(
    out: &mut Vec<u8>,
    field: &Field,
    packet: &NormalizedPacket,
    cursor: &mut OptionCursor,
) -> Result<()> {
    let option = cursor.current(packet);
    if field.fid == FieldId::CoapOptValue {
        cursor.advance();
    }

    match field.cda {
        CompressionAction::ValueSent => {
            let value = field_value(packet, field.fid, option).ok_or_else(|| {
                SchcError::Compression(format!("{}: packet has no option to send", field.fid))
            })?;
            send_field_value(out, field.fid, value)
        }
        CompressionAction::NotSent
        | CompressionAction::ComputeLength
        | CompressionAction::ComputeChecksum => Ok(()),
        CompressionAction::MappingSent
        | CompressionAction::Lsb
        | CompressionAction::DevIid
        | CompressionAction::AppIid => Ok(()),
    }
}

/// Append a value-sent field to the residue
///
/// ```text
/// 1 byte   IPV6.VER IPV6.TC IPV6.NXT IPV6.HOP_LMT COAP.VER COAP.TYPE
///          COAP.TKL COAP.CODE COAP.OPT_DELTA COAP.OPT_LEN
/// 2 bytes  IPV6.LEN UDP.DEV_PORT UDP.APP_PORT UDP.LEN UDP.CKSUM COAP.MID
/// 3 bytes  IPV6.FL
/// 8 bytes  IPV6.DEV_PREFIX IPV6.DEV_IID IPV6.APP_PREFIX IPV6.APP_IID
/// TKL      COAP.TOKEN
/// length   COAP.OPT_VALUE
/// ```
fn send_field_value(out: &mut Vec<u8>, fid: FieldId, value: FieldValue<'_>) -> Result<()> {
    match value {
        FieldValue::Scalar(n) => {
            let width = residue_width(fid);
            if width < 8 && n >> (width * 8) != 0 {
                return Err(SchcError::Compression(format!(
                    "{}: value {} does not fit in {} residue byte(s)",
                    fid, n, width
                )));
            }
            out.extend_from_slice(&n.to_be_bytes()[8 - width..]);
        }
        FieldValue::Bytes(bytes) => out.extend_from_slice(bytes),
    }
    Ok(())
}

/// Residue size in bytes of a scalar field
pub(crate) fn residue_width(fid: FieldId) -> usize {
    match fid {
        FieldId::Ipv6Fl => 3,
        FieldId::CoapOptDelta | FieldId::CoapOptLen => 1,
        _ => match fid.kind() {
            FieldKind::Scalar(bits) => (bits as usize).div_ceil(8),
            FieldKind::FixedBytes(len) => len,
            FieldKind::Token | FieldKind::OptionValue => 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CoapOption;
    use crate::parser::{Direction, parse_packet};

    const UPLINK_HEX: &str = "6000000000141140fe80000000000000080027fffe000000\
                              fe800000000000000a0027fffe542e4ae7db16330014a56d\
                              50020000b162ff68656c6c6f";

    fn uplink() -> NormalizedPacket {
        parse_packet(&hex::decode(UPLINK_HEX).unwrap(), Direction::Up).unwrap()
    }

    fn single_rule(fields: &str) -> RuleSet {
        RuleSet::from_json(&format!(r#"[{{ "Compression": [ {} ] }}]"#, fields)).unwrap()
    }

    // =========================================================================
    // Residue width tests
    // =========================================================================

    #[test]
    fn test_residue_widths() {
        assert_eq!(residue_width(FieldId::Ipv6Ver), 1);
        assert_eq!(residue_width(FieldId::Ipv6Fl), 3);
        assert_eq!(residue_width(FieldId::Ipv6Len), 2);
        assert_eq!(residue_width(FieldId::UdpCksum), 2);
        assert_eq!(residue_width(FieldId::CoapCode), 1);
        assert_eq!(residue_width(FieldId::CoapOptDelta), 1);
        assert_eq!(residue_width(FieldId::CoapMid), 2);
        assert_eq!(residue_width(FieldId::Ipv6DevIid), 8);
    }

    // =========================================================================
    // Compression tests
    // =========================================================================

    #[test]
    fn test_builtin_rule_two() {
        let mut packet = uplink();
        packet.coap_type = 0;
        packet.coap_message_id = [0x12, 0x34];
        let rules = RuleSet::lo_coap_eap().unwrap();

        let compressed = compress(&packet, &rules).unwrap();
        assert_eq!(compressed.rule_id, 2);
        assert_eq!(compressed.data, b"\x02\x12\x34hello".to_vec());
        assert_eq!(compressed.compressed_header_bytes, 3);
        assert_eq!(compressed.original_header_bytes, 40 + 8 + 7);
        assert_eq!(compressed.savings_bytes(), 52);
    }

    #[test]
    fn test_value_sent_layout() {
        let rules = single_rule(
            r#"{ "FID": "IPV6.FL", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "UDP.DEV_PORT", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.TYPE", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_DELTA", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_LEN", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_VALUE", "MO": "ignore", "CDA": "value-sent" }"#,
        );
        let mut packet = uplink();
        packet.ipv6_flow_label = 0xABCDE;

        let compressed = compress(&packet, &rules).unwrap();
        assert_eq!(
            compressed.data,
            b"\x00\x0A\xBC\xDE\xE7\xDB\x01\x0B\x01bhello".to_vec()
        );
    }

    #[test]
    fn test_no_matching_rule() {
        let rules =
            single_rule(r#"{ "FID": "IPV6.NXT", "TV": 6, "MO": "equal", "CDA": "not-sent" }"#);
        assert!(matches!(
            compress(&uplink(), &rules),
            Err(SchcError::NoMatchingRule)
        ));
    }

    #[test]
    fn test_option_delta_too_large_for_residue() {
        let rules = single_rule(
            r#"{ "FID": "COAP.OPT_DELTA", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_LEN", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_VALUE", "MO": "ignore", "CDA": "value-sent" }"#,
        );
        let mut packet = uplink();
        packet.coap_options = vec![CoapOption::new(300, b"x".to_vec())];
        assert!(matches!(
            compress(&packet, &rules),
            Err(SchcError::Compression(_))
        ));
    }

    #[test]
    fn test_unimplemented_actions_send_nothing() {
        let rules = single_rule(
            r#"{ "FID": "IPV6.DEV_IID", "MO": "ignore", "CDA": "DevIID" },
               { "FID": "COAP.OPT_DELTA", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_LEN", "MO": "ignore", "CDA": "value-sent" },
               { "FID": "COAP.OPT_VALUE", "MO": "ignore", "CDA": "mapping-sent" }"#,
        );
        let compressed = compress(&uplink(), &rules).unwrap();
        assert_eq!(compressed.data, b"\x00\x0B\x01hello".to_vec());
    }

    #[test]
    fn test_invalid_packet_rejected_before_matching() {
        let rules = RuleSet::lo_coap_eap().unwrap();
        let mut packet = uplink();
        packet.coap_options = vec![CoapOption::default(); 5];
        assert!(matches!(
            compress(&packet, &rules),
            Err(SchcError::MalformedInput(_))
        ));
    }
}
