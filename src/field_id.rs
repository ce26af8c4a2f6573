//! Field identifier enum
//!
//! Every IPv6, UDP and CoAP header field a rule row can describe. The string
//! names are the ones used in JSON rule files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header field addressed by a rule row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldId {
    #[serde(rename = "IPV6.VER")]
    Ipv6Ver,
    #[serde(rename = "IPV6.TC")]
    Ipv6Tc,
    #[serde(rename = "IPV6.FL")]
    Ipv6Fl,
    #[serde(rename = "IPV6.LEN")]
    Ipv6Len,
    #[serde(rename = "IPV6.NXT")]
    Ipv6Nxt,
    #[serde(rename = "IPV6.HOP_LMT")]
    Ipv6HopLmt,
    #[serde(rename = "IPV6.DEV_PREFIX")]
    Ipv6DevPrefix,
    #[serde(rename = "IPV6.DEV_IID")]
    Ipv6DevIid,
    #[serde(rename = "IPV6.APP_PREFIX")]
    Ipv6AppPrefix,
    #[serde(rename = "IPV6.APP_IID")]
    Ipv6AppIid,
    #[serde(rename = "UDP.DEV_PORT")]
    UdpDevPort,
    #[serde(rename = "UDP.APP_PORT")]
    UdpAppPort,
    #[serde(rename = "UDP.LEN")]
    UdpLen,
    #[serde(rename = "UDP.CKSUM")]
    UdpCksum,
    #[serde(rename = "COAP.VER")]
    CoapVer,
    #[serde(rename = "COAP.TYPE")]
    CoapType,
    #[serde(rename = "COAP.TKL")]
    CoapTkl,
    #[serde(rename = "COAP.CODE")]
    CoapCode,
    #[serde(rename = "COAP.MID")]
    CoapMid,
    #[serde(rename = "COAP.TOKEN")]
    CoapToken,
    #[serde(rename = "COAP.OPT_DELTA")]
    CoapOptDelta,
    #[serde(rename = "COAP.OPT_LEN")]
    CoapOptLen,
    #[serde(rename = "COAP.OPT_VALUE")]
    CoapOptValue,
}

/// Shape of a field's value, which decides how its target value is parsed
/// and how many residue bytes it occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned integer of the given bit width
    Scalar(u8),
    /// Byte array of fixed length
    FixedBytes(usize),
    /// CoAP token, TKL bytes long
    Token,
    /// CoAP option value, length given by the option
    OptionValue,
}

/// Error returned when a string does not name a known field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFieldId(pub String);

impl fmt::Display for UnknownFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown field id: {}", self.0)
    }
}

impl std::error::Error for UnknownFieldId {}

impl FieldId {
    pub const ALL: [FieldId; 23] = [
        FieldId::Ipv6Ver,
        FieldId::Ipv6Tc,
        FieldId::Ipv6Fl,
        FieldId::Ipv6Len,
        FieldId::Ipv6Nxt,
        FieldId::Ipv6HopLmt,
        FieldId::Ipv6DevPrefix,
        FieldId::Ipv6DevIid,
        FieldId::Ipv6AppPrefix,
        FieldId::Ipv6AppIid,
        FieldId::UdpDevPort,
        FieldId::UdpAppPort,
        FieldId::UdpLen,
        FieldId::UdpCksum,
        FieldId::CoapVer,
        FieldId::CoapType,
        FieldId::CoapTkl,
        FieldId::CoapCode,
        FieldId::CoapMid,
        FieldId::CoapToken,
        FieldId::CoapOptDelta,
        FieldId::CoapOptLen,
        FieldId::CoapOptValue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldId::Ipv6Ver => "IPV6.VER",
            FieldId::Ipv6Tc => "IPV6.TC",
            FieldId::Ipv6Fl => "IPV6.FL",
            FieldId::Ipv6Len => "IPV6.LEN",
            FieldId::Ipv6Nxt => "IPV6.NXT",
            FieldId::Ipv6HopLmt => "IPV6.HOP_LMT",
            FieldId::Ipv6DevPrefix => "IPV6.DEV_PREFIX",
            FieldId::Ipv6DevIid => "IPV6.DEV_IID",
            FieldId::Ipv6AppPrefix => "IPV6.APP_PREFIX",
            FieldId::Ipv6AppIid => "IPV6.APP_IID",
            FieldId::UdpDevPort => "UDP.DEV_PORT",
            FieldId::UdpAppPort => "UDP.APP_PORT",
            FieldId::UdpLen => "UDP.LEN",
            FieldId::UdpCksum => "UDP.CKSUM",
            FieldId::CoapVer => "COAP.VER",
            FieldId::CoapType => "COAP.TYPE",
            FieldId::CoapTkl => "COAP.TKL",
            FieldId::CoapCode => "COAP.CODE",
            FieldId::CoapMid => "COAP.MID",
            FieldId::CoapToken => "COAP.TOKEN",
            FieldId::CoapOptDelta => "COAP.OPT_DELTA",
            FieldId::CoapOptLen => "COAP.OPT_LEN",
            FieldId::CoapOptValue => "COAP.OPT_VALUE",
        }
    }

    /// Default field size in bits; `None` for variable-length fields
    pub fn default_size_bits(&self) -> Option<u16> {
        match self.kind() {
            FieldKind::Scalar(bits) => Some(bits as u16),
            FieldKind::FixedBytes(len) => Some(len as u16 * 8),
            FieldKind::Token | FieldKind::OptionValue => None,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldId::Ipv6Ver => FieldKind::Scalar(4),
            FieldId::Ipv6Tc => FieldKind::Scalar(8),
            FieldId::Ipv6Fl => FieldKind::Scalar(20),
            FieldId::Ipv6Len => FieldKind::Scalar(16),
            FieldId::Ipv6Nxt => FieldKind::Scalar(8),
            FieldId::Ipv6HopLmt => FieldKind::Scalar(8),
            FieldId::Ipv6DevPrefix
            | FieldId::Ipv6DevIid
            | FieldId::Ipv6AppPrefix
            | FieldId::Ipv6AppIid => FieldKind::FixedBytes(8),
            FieldId::UdpDevPort | FieldId::UdpAppPort | FieldId::UdpLen | FieldId::UdpCksum => {
                FieldKind::Scalar(16)
            }
            FieldId::CoapVer | FieldId::CoapType => FieldKind::Scalar(2),
            FieldId::CoapTkl => FieldKind::Scalar(4),
            FieldId::CoapCode => FieldKind::Scalar(8),
            FieldId::CoapMid => FieldKind::FixedBytes(2),
            FieldId::CoapToken => FieldKind::Token,
            FieldId::CoapOptDelta | FieldId::CoapOptLen => FieldKind::Scalar(16),
            FieldId::CoapOptValue => FieldKind::OptionValue,
        }
    }

    /// True for the rows that describe one CoAP option
    pub fn is_coap_option(&self) -> bool {
        matches!(
            self,
            FieldId::CoapOptDelta | FieldId::CoapOptLen | FieldId::CoapOptValue
        )
    }
}

impl FromStr for FieldId {
    type Err = UnknownFieldId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldId::ALL
            .iter()
            .copied()
            .find(|fid| fid.as_str() == s)
            .ok_or_else(|| UnknownFieldId(s.to_string()))
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // as_str tests
    // =========================================================================

    #[test]
    fn test_ipv6_field_strings() {
        assert_eq!(FieldId::Ipv6Ver.as_str(), "IPV6.VER");
        assert_eq!(FieldId::Ipv6Fl.as_str(), "IPV6.FL");
        assert_eq!(FieldId::Ipv6HopLmt.as_str(), "IPV6.HOP_LMT");
        assert_eq!(FieldId::Ipv6DevPrefix.as_str(), "IPV6.DEV_PREFIX");
        assert_eq!(FieldId::Ipv6AppIid.as_str(), "IPV6.APP_IID");
    }

    #[test]
    fn test_coap_option_strings() {
        assert_eq!(FieldId::CoapOptDelta.as_str(), "COAP.OPT_DELTA");
        assert_eq!(FieldId::CoapOptLen.as_str(), "COAP.OPT_LEN");
        assert_eq!(FieldId::CoapOptValue.as_str(), "COAP.OPT_VALUE");
    }

    // =========================================================================
    // FromStr tests
    // =========================================================================

    #[test]
    fn test_parse_every_field() {
        for fid in FieldId::ALL {
            assert_eq!(FieldId::from_str(fid.as_str()).unwrap(), fid);
        }
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = FieldId::from_str("IPV4.TTL").unwrap_err();
        assert_eq!(err.0, "IPV4.TTL");
    }

    #[test]
    fn test_parse_case_sensitive() {
        assert!(FieldId::from_str("ipv6.ver").is_err());
    }

    // =========================================================================
    // Size and kind tests
    // =========================================================================

    #[test]
    fn test_field_sizes() {
        assert_eq!(FieldId::Ipv6Ver.default_size_bits(), Some(4));
        assert_eq!(FieldId::Ipv6Fl.default_size_bits(), Some(20));
        assert_eq!(FieldId::Ipv6DevIid.default_size_bits(), Some(64));
        assert_eq!(FieldId::UdpCksum.default_size_bits(), Some(16));
        assert_eq!(FieldId::CoapTkl.default_size_bits(), Some(4));
        assert_eq!(FieldId::CoapMid.default_size_bits(), Some(16));
    }

    #[test]
    fn test_variable_length_fields() {
        assert_eq!(FieldId::CoapToken.default_size_bits(), None);
        assert_eq!(FieldId::CoapOptValue.default_size_bits(), None);
    }

    #[test]
    fn test_option_rows() {
        assert!(FieldId::CoapOptValue.is_coap_option());
        assert!(!FieldId::CoapToken.is_coap_option());
    }

    // =========================================================================
    // Serialization tests
    // =========================================================================

    #[test]
    fn test_serialize() {
        let json = serde_json::to_string(&FieldId::UdpAppPort).unwrap();
        assert_eq!(json, "\"UDP.APP_PORT\"");
    }

    #[test]
    fn test_deserialize() {
        let field: FieldId = serde_json::from_str("\"COAP.MID\"").unwrap();
        assert_eq!(field, FieldId::CoapMid);
        assert_eq!(format!("{}", field), "COAP.MID");
    }

    #[test]
    fn test_deserialize_unknown_fails() {
        let result: Result<FieldId, _> = serde_json::from_str("\"UNKNOWN.FIELD\"");
        assert!(result.is_err());
    }
}
