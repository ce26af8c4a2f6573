//! SCHC Rule structures and parsing
//!
//! Rules are loaded from JSON once. Every target value is parsed into a typed
//! [`RuleValue`] at load time, so matching and decompression never look at
//! the textual form again.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::net::Ipv6Addr;
use std::path::Path;

use crate::error::{Result, SchcError};
use crate::field_id::{FieldId, FieldKind};
use crate::parser::Direction;

/// Rule id reserved for the fragmentation sub-protocol
pub const FRAGMENT_RULE_ID: u8 = 0x80;

/// Built-in rule table for the LO-CoAP-EAP exchange
const LO_COAP_EAP_RULES: &str = include_str!("../rules/lo-coap-eap.json");

/// Parsed target value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleValue {
    U64(u64),
    Bytes(Vec<u8>),
}

/// SCHC Compression Rule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rule {
    /// Optional in rule files; when present it must equal the rule's index
    #[serde(rename = "RuleID", default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<u8>,

    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(rename = "Compression")]
    pub compression: Vec<Field>,
}

/// Field descriptor within a rule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Field {
    #[serde(rename = "FID")]
    pub fid: FieldId,

    #[serde(rename = "FL", default, skip_serializing_if = "Option::is_none")]
    pub fl: Option<u16>,

    #[serde(rename = "FP", default = "default_fp")]
    pub fp: u8,

    /// `None` means bidirectional
    #[serde(rename = "DI", default)]
    #[serde(deserialize_with = "deserialize_di")]
    #[serde(serialize_with = "serialize_di")]
    pub di: Option<Direction>,

    #[serde(rename = "TV", default, skip_serializing_if = "Option::is_none")]
    pub tv: Option<serde_json::Value>,

    #[serde(rename = "MO")]
    #[serde(deserialize_with = "deserialize_mo")]
    #[serde(serialize_with = "serialize_mo")]
    pub mo: MatchingOperator,

    #[serde(rename = "CDA")]
    #[serde(deserialize_with = "deserialize_cda")]
    #[serde(serialize_with = "serialize_cda")]
    pub cda: CompressionAction,

    #[serde(rename = "MO.val", default, skip_serializing_if = "Option::is_none")]
    pub mo_val: Option<u8>,

    #[serde(skip)]
    pub parsed_tv: Option<RuleValue>,
}

fn default_fp() -> u8 {
    1
}

impl Field {
    /// Parse the target value and check the row is usable.
    pub fn parse_tv(&mut self) -> Result<()> {
        let field_length = self.fl.or_else(|| self.fid.default_size_bits());

        if let MatchingOperator::Msb(_) = self.mo {
            let mo_val = self.mo_val.unwrap_or(0);
            self.mo = MatchingOperator::Msb(mo_val);

            if let Some(field_length) = field_length
                && mo_val as u16 > field_length
            {
                return Err(SchcError::RuleValidation(format!(
                    "Field {}: MO.val ({}) exceeds field length ({} bits)",
                    self.fid, mo_val, field_length
                )));
            }
        }

        match self.cda {
            CompressionAction::ComputeLength
                if !matches!(self.fid, FieldId::Ipv6Len | FieldId::UdpLen) =>
            {
                return Err(SchcError::RuleValidation(format!(
                    "Field {}: compute-length applies only to IPV6.LEN and UDP.LEN",
                    self.fid
                )));
            }
            CompressionAction::ComputeChecksum if self.fid != FieldId::UdpCksum => {
                return Err(SchcError::RuleValidation(format!(
                    "Field {}: compute-checksum applies only to UDP.CKSUM",
                    self.fid
                )));
            }
            _ => {}
        }

        self.parsed_tv = match (&self.mo, &self.tv) {
            (MatchingOperator::MatchMapping, _) | (_, None) => None,
            (_, Some(tv)) => Some(parse_single_value(tv, self.fid)?),
        };

        let needs_tv = self.mo == MatchingOperator::Equal || self.cda == CompressionAction::NotSent;
        if needs_tv && self.parsed_tv.is_none() {
            return Err(SchcError::RuleValidation(format!(
                "Field {}: {} / {} requires a target value",
                self.fid,
                self.mo.as_str(),
                self.cda.as_str()
            )));
        }

        Ok(())
    }

    /// Typed target value, available after [`Field::parse_tv`]
    pub fn target(&self) -> Option<&RuleValue> {
        self.parsed_tv.as_ref()
    }
}

// =============================================================================
// Matching Operators and Compression Actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingOperator {
    Equal,
    Ignore,
    /// Not implemented: a rule using it never matches
    MatchMapping,
    /// Not implemented: a rule using it never matches
    Msb(u8),
}

impl MatchingOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchingOperator::Equal => "equal",
            MatchingOperator::Ignore => "ignore",
            MatchingOperator::MatchMapping => "match-mapping",
            MatchingOperator::Msb(_) => "MSB",
        }
    }

    pub fn is_implemented(&self) -> bool {
        matches!(self, MatchingOperator::Equal | MatchingOperator::Ignore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAction {
    NotSent,
    ValueSent,
    /// Not implemented: contributes nothing
    MappingSent,
    /// Not implemented: contributes nothing
    Lsb,
    ComputeLength,
    ComputeChecksum,
    /// Not implemented: contributes nothing
    DevIid,
    /// Not implemented: contributes nothing
    AppIid,
}

impl CompressionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAction::NotSent => "not-sent",
            CompressionAction::ValueSent => "value-sent",
            CompressionAction::MappingSent => "mapping-sent",
            CompressionAction::Lsb => "LSB",
            CompressionAction::ComputeLength => "compute-length",
            CompressionAction::ComputeChecksum => "compute-checksum",
            CompressionAction::DevIid => "DevIID",
            CompressionAction::AppIid => "AppIID",
        }
    }

    pub fn is_implemented(&self) -> bool {
        !matches!(
            self,
            CompressionAction::MappingSent
                | CompressionAction::Lsb
                | CompressionAction::DevIid
                | CompressionAction::AppIid
        )
    }
}

fn deserialize_mo<'de, D>(deserializer: D) -> std::result::Result<MatchingOperator, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.as_str() {
        "equal" => Ok(MatchingOperator::Equal),
        "ignore" => Ok(MatchingOperator::Ignore),
        "match-mapping" => Ok(MatchingOperator::MatchMapping),
        "MSB" => Ok(MatchingOperator::Msb(0)),
        other => Err(serde::de::Error::unknown_variant(
            other,
            &["equal", "ignore", "match-mapping", "MSB"],
        )),
    }
}

fn serialize_mo<S>(mo: &MatchingOperator, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(mo.as_str())
}

fn deserialize_cda<'de, D>(deserializer: D) -> std::result::Result<CompressionAction, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.as_str() {
        "not-sent" => Ok(CompressionAction::NotSent),
        "value-sent" => Ok(CompressionAction::ValueSent),
        "mapping-sent" => Ok(CompressionAction::MappingSent),
        "LSB" => Ok(CompressionAction::Lsb),
        "compute-length" => Ok(CompressionAction::ComputeLength),
        "compute-checksum" => Ok(CompressionAction::ComputeChecksum),
        "DevIID" => Ok(CompressionAction::DevIid),
        "AppIID" => Ok(CompressionAction::AppIid),
        other => Err(serde::de::Error::unknown_variant(
            other,
            &[
                "not-sent",
                "value-sent",
                "mapping-sent",
                "LSB",
                "compute-length",
                "compute-checksum",
                "DevIID",
                "AppIID",
            ],
        )),
    }
}

fn serialize_cda<S>(cda: &CompressionAction, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(cda.as_str())
}

fn deserialize_di<'de, D>(deserializer: D) -> std::result::Result<Option<Direction>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s.as_deref() {
        None | Some("BI") => Ok(None),
        Some("UP") => Ok(Some(Direction::Up)),
        Some("DOWN") => Ok(Some(Direction::Down)),
        Some(other) => Err(serde::de::Error::unknown_variant(
            other,
            &["UP", "DOWN", "BI"],
        )),
    }
}

fn serialize_di<S>(di: &Option<Direction>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = match di {
        None => "BI",
        Some(Direction::Up) => "UP",
        Some(Direction::Down) => "DOWN",
    };
    serializer.serialize_str(s)
}

// =============================================================================
// Target Value Parsing
// =============================================================================

fn parse_single_value(tv_json: &serde_json::Value, fid: FieldId) -> Result<RuleValue> {
    let invalid = |reason: &str| {
        SchcError::RuleValidation(format!("Field {}: invalid TV {}: {}", fid, tv_json, reason))
    };

    match (fid.kind(), tv_json) {
        (FieldKind::Scalar(bits), value) => {
            let n = match value {
                serde_json::Value::Number(n) => n
                    .as_u64()
                    .ok_or_else(|| invalid("not an unsigned integer"))?,
                serde_json::Value::String(s) => {
                    parse_integer(s).ok_or_else(|| invalid("not an integer"))?
                }
                _ => return Err(invalid("expected a number")),
            };
            if bits < 64 && n >> bits != 0 {
                return Err(invalid(&format!("does not fit in {} bits", bits)));
            }
            Ok(RuleValue::U64(n))
        }
        (FieldKind::FixedBytes(len), serde_json::Value::String(s)) => {
            let bytes = if s.contains(':') {
                parse_prefix(s).ok_or_else(|| invalid("not an IPv6 prefix"))?
            } else {
                decode_hex(s).ok_or_else(|| invalid("not a hex string"))?
            };
            let aligned = right_align(&bytes, len)
                .ok_or_else(|| invalid(&format!("longer than {} bytes", len)))?;
            Ok(RuleValue::Bytes(aligned))
        }
        (FieldKind::FixedBytes(len), serde_json::Value::Number(n)) => {
            let n = n.as_u64().ok_or_else(|| invalid("not an unsigned integer"))?;
            let aligned = right_align(&n.to_be_bytes(), len)
                .ok_or_else(|| invalid(&format!("longer than {} bytes", len)))?;
            Ok(RuleValue::Bytes(aligned))
        }
        (FieldKind::Token, serde_json::Value::String(s)) => {
            decode_hex(s).map(RuleValue::Bytes).ok_or_else(|| invalid("not a hex string"))
        }
        (FieldKind::Token, serde_json::Value::Number(n)) => n
            .as_u64()
            .map(|n| RuleValue::Bytes(n.to_be_bytes().to_vec()))
            .ok_or_else(|| invalid("not an unsigned integer")),
        (FieldKind::OptionValue, serde_json::Value::String(s)) => match s.strip_prefix("0x") {
            Some(hex_str) => decode_hex(hex_str)
                .map(RuleValue::Bytes)
                .ok_or_else(|| invalid("not a hex string")),
            None => Ok(RuleValue::Bytes(s.as_bytes().to_vec())),
        },
        (FieldKind::OptionValue, serde_json::Value::Number(n)) => {
            // CoAP uint: minimal big-endian, zero is empty
            let n = n.as_u64().ok_or_else(|| invalid("not an unsigned integer"))?;
            let bytes = n.to_be_bytes();
            let skip = bytes.iter().take_while(|b| **b == 0).count();
            Ok(RuleValue::Bytes(bytes[skip..].to_vec()))
        }
        _ => Err(invalid("unsupported JSON type")),
    }
}

fn parse_integer(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex_str) => u64::from_str_radix(hex_str, 16).ok(),
        None => s.parse::<u64>().ok(),
    }
}

/// Decode a hex string, tolerating a `0x` prefix and an odd digit count
fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 == 1 {
        hex::decode(format!("0{}", s)).ok()
    } else {
        hex::decode(s).ok()
    }
}

/// Upper 64 bits of an IPv6 prefix such as `fe80::/64`
fn parse_prefix(s: &str) -> Option<Vec<u8>> {
    let addr_str = s.split('/').next().unwrap_or(s);
    let addr: Ipv6Addr = addr_str.parse().ok()?;
    Some(addr.octets()[..8].to_vec())
}

/// Left-pad `bytes` with zeros to `len`; `None` if significant bytes would be lost
fn right_align(bytes: &[u8], len: usize) -> Option<Vec<u8>> {
    if bytes.len() > len {
        let (extra, rest) = bytes.split_at(bytes.len() - len);
        return extra.iter().all(|b| *b == 0).then(|| rest.to_vec());
    }
    let mut aligned = vec![0u8; len - bytes.len()];
    aligned.extend_from_slice(bytes);
    Some(aligned)
}

/// Resize a target value to exactly `len` bytes, keeping the rightmost bytes
pub(crate) fn fit_right(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        bytes[bytes.len() - len..].to_vec()
    } else {
        let mut fitted = vec![0u8; len - bytes.len()];
        fitted.extend_from_slice(bytes);
        fitted
    }
}

// =============================================================================
// Rule Set
// =============================================================================

/// Ordered rule table; a rule's id is its index
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Ids 0..=127; 0x80 belongs to fragmentation
    pub const MAX_RULES: usize = FRAGMENT_RULE_ID as usize;

    pub fn new(mut rules: Vec<Rule>) -> Result<Self> {
        if rules.len() > Self::MAX_RULES {
            return Err(SchcError::RuleValidation(format!(
                "{} rules exceed the maximum of {}",
                rules.len(),
                Self::MAX_RULES
            )));
        }

        for (index, rule) in rules.iter_mut().enumerate() {
            if let Some(id) = rule.rule_id
                && id as usize != index
            {
                return Err(SchcError::RuleValidation(format!(
                    "Rule at position {} declares RuleID {}",
                    index, id
                )));
            }

            for field in &mut rule.compression {
                field.parse_tv()?;
                if !field.mo.is_implemented() || !field.cda.is_implemented() {
                    log::warn!(
                        "Rule {}: field {} uses unimplemented {} / {}",
                        index,
                        field.fid,
                        field.mo.as_str(),
                        field.cda.as_str()
                    );
                }
            }
        }

        Ok(RuleSet { rules })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<Rule> = serde_json::from_str(json)?;
        Self::new(rules)
    }

    /// The compiled-in LO-CoAP-EAP rule table
    pub fn lo_coap_eap() -> Result<Self> {
        Self::from_json(LO_COAP_EAP_RULES)
    }

    pub fn get(&self, rule_id: u8) -> Option<&Rule> {
        self.rules.get(rule_id as usize)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_field(field: &str) -> Result<RuleSet> {
        RuleSet::from_json(&format!(r#"[{{ "Compression": [ {} ] }}]"#, field))
    }

    fn parsed(field: &str) -> RuleValue {
        let rules = single_field(field).unwrap();
        rules.rules[0].compression[0].target().cloned().unwrap()
    }

    // =========================================================================
    // Target value parsing tests
    // =========================================================================

    #[test]
    fn test_scalar_from_number_and_string() {
        assert_eq!(
            parsed(r#"{ "FID": "UDP.APP_PORT", "TV": 5683, "MO": "equal", "CDA": "not-sent" }"#),
            RuleValue::U64(5683)
        );
        assert_eq!(
            parsed(r#"{ "FID": "IPV6.NXT", "TV": "17", "MO": "equal", "CDA": "not-sent" }"#),
            RuleValue::U64(17)
        );
    }

    #[test]
    fn test_scalar_out_of_range() {
        let result = single_field(
            r#"{ "FID": "COAP.TYPE", "TV": 4, "MO": "equal", "CDA": "not-sent" }"#,
        );
        assert!(matches!(result, Err(SchcError::RuleValidation(_))));
    }

    #[test]
    fn test_iid_hex_is_eight_bytes() {
        assert_eq!(
            parsed(
                r#"{ "FID": "IPV6.APP_IID", "TV": "0A0027FFFE542E4A", "MO": "equal", "CDA": "not-sent" }"#
            ),
            RuleValue::Bytes(vec![0x0A, 0x00, 0x27, 0xFF, 0xFE, 0x54, 0x2E, 0x4A])
        );
    }

    #[test]
    fn test_prefix_ipv6_notation() {
        assert_eq!(
            parsed(
                r#"{ "FID": "IPV6.DEV_PREFIX", "TV": "fe80::/64", "MO": "equal", "CDA": "not-sent" }"#
            ),
            RuleValue::Bytes(vec![0xFE, 0x80, 0, 0, 0, 0, 0, 0])
        );
    }

    #[test]
    fn test_short_hex_is_right_aligned() {
        assert_eq!(
            parsed(r#"{ "FID": "COAP.MID", "TV": "0", "MO": "ignore", "CDA": "value-sent" }"#),
            RuleValue::Bytes(vec![0x00, 0x00])
        );
        assert_eq!(
            parsed(r#"{ "FID": "COAP.MID", "TV": "abc", "MO": "equal", "CDA": "not-sent" }"#),
            RuleValue::Bytes(vec![0x0A, 0xBC])
        );
    }

    #[test]
    fn test_option_value_raw_and_hex() {
        assert_eq!(
            parsed(r#"{ "FID": "COAP.OPT_VALUE", "TV": "b", "MO": "equal", "CDA": "not-sent" }"#),
            RuleValue::Bytes(b"b".to_vec())
        );
        assert_eq!(
            parsed(
                r#"{ "FID": "COAP.OPT_VALUE", "TV": "0x0b", "MO": "equal", "CDA": "not-sent" }"#
            ),
            RuleValue::Bytes(vec![0x0B])
        );
        assert_eq!(
            parsed(r#"{ "FID": "COAP.OPT_VALUE", "TV": 0, "MO": "equal", "CDA": "not-sent" }"#),
            RuleValue::Bytes(vec![])
        );
    }

    #[test]
    fn test_invalid_hex_rejected() {
        let result = single_field(
            r#"{ "FID": "IPV6.DEV_IID", "TV": "zz", "MO": "equal", "CDA": "not-sent" }"#,
        );
        assert!(matches!(result, Err(SchcError::RuleValidation(_))));
    }

    #[test]
    fn test_equal_requires_tv() {
        let result = single_field(r#"{ "FID": "IPV6.VER", "MO": "equal", "CDA": "value-sent" }"#);
        assert!(matches!(result, Err(SchcError::RuleValidation(_))));
    }

    #[test]
    fn test_fit_right() {
        assert_eq!(fit_right(&[0x00], 0), Vec::<u8>::new());
        assert_eq!(fit_right(&[0xAB], 2), vec![0x00, 0xAB]);
        assert_eq!(fit_right(&[0x01, 0x02, 0x03], 2), vec![0x02, 0x03]);
    }

    // =========================================================================
    // Operator and action parsing tests
    // =========================================================================

    #[test]
    fn test_unknown_mo_rejected() {
        let result = single_field(
            r#"{ "FID": "IPV6.VER", "TV": 6, "MO": "equals", "CDA": "not-sent" }"#,
        );
        assert!(matches!(result, Err(SchcError::Json(_))));
    }

    #[test]
    fn test_compute_actions_placement() {
        assert!(
            single_field(r#"{ "FID": "UDP.LEN", "MO": "ignore", "CDA": "compute-length" }"#)
                .is_ok()
        );
        assert!(
            single_field(r#"{ "FID": "UDP.CKSUM", "MO": "ignore", "CDA": "compute-checksum" }"#)
                .is_ok()
        );
        assert!(
            single_field(r#"{ "FID": "UDP.CKSUM", "MO": "ignore", "CDA": "compute-length" }"#)
                .is_err()
        );
        assert!(
            single_field(r#"{ "FID": "COAP.OPT_VALUE", "MO": "ignore", "CDA": "compute-checksum" }"#)
                .is_err()
        );
    }

    #[test]
    fn test_direction_indicator() {
        let rules = single_field(
            r#"{ "FID": "UDP.DEV_PORT", "DI": "UP", "TV": 1, "MO": "equal", "CDA": "not-sent" }"#,
        )
        .unwrap();
        assert_eq!(rules.rules[0].compression[0].di, Some(Direction::Up));
        assert_eq!(rules.rules[0].compression[0].fp, 1);
    }

    // =========================================================================
    // MO.val validation tests
    // =========================================================================

    #[test]
    fn test_mo_val_valid_within_field_length() {
        let result = single_field(
            r#"{ "FID": "UDP.APP_PORT", "TV": 5680, "MO": "MSB", "CDA": "LSB", "MO.val": 8 }"#,
        );
        let rules = result.unwrap();
        assert_eq!(rules.rules[0].compression[0].mo, MatchingOperator::Msb(8));
    }

    #[test]
    fn test_mo_val_exceeds_field_length_error() {
        let result = single_field(
            r#"{ "FID": "UDP.APP_PORT", "TV": 5680, "MO": "MSB", "CDA": "LSB", "MO.val": 20 }"#,
        );
        let err_msg = format!("{}", result.unwrap_err());
        assert!(err_msg.contains("MO.val"));
        assert!(err_msg.contains("20"));
    }

    // =========================================================================
    // RuleSet tests
    // =========================================================================

    #[test]
    fn test_rule_id_must_match_index() {
        let json = r#"[
            { "RuleID": 0, "Compression": [] },
            { "RuleID": 5, "Compression": [] }
        ]"#;
        assert!(matches!(RuleSet::from_json(json), Err(SchcError::RuleValidation(_))));
    }

    #[test]
    fn test_too_many_rules() {
        let rules = vec![
            Rule {
                rule_id: None,
                comment: None,
                compression: vec![],
            };
            RuleSet::MAX_RULES + 1
        ];
        assert!(matches!(RuleSet::new(rules), Err(SchcError::RuleValidation(_))));
    }

    #[test]
    fn test_builtin_table_loads() {
        let rules = RuleSet::lo_coap_eap().unwrap();
        assert_eq!(rules.len(), 12);
        assert!(rules.get(11).is_some());
        assert!(rules.get(12).is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let rules = RuleSet::lo_coap_eap().unwrap();
        let json = serde_json::to_string(&rules.rules).unwrap();
        let reloaded = RuleSet::from_json(&json).unwrap();
        assert_eq!(reloaded.len(), rules.len());
        assert_eq!(
            reloaded.rules[2].compression[22].target(),
            rules.rules[2].compression[22].target()
        );
    }
}
