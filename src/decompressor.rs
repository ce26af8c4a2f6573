//! Decompression Logic
//!
//! Expands `[rule id][residue][payload]` back into a [`NormalizedPacket`].
//! Every call owns a [`DecompressionContext`] holding the read offset, the
//! option being rebuilt and the compute flags, so concurrent calls share
//! nothing but the read-only rule table.

use crate::compressor::residue_width;
use crate::error::{Result, SchcError};
use crate::field_id::{FieldId, FieldKind};
use crate::packet::{CoapOption, MAX_COAP_OPTIONS, NormalizedPacket, UDP_HEADER_LEN};
use crate::packet_builder::compute_udp_checksum;
use crate::rule::{CompressionAction, Field, RuleSet, RuleValue, fit_right};

/// Hop limit written into every decompressed packet
pub const DECOMPRESSED_HOP_LIMIT: u8 = 255;

// =============================================================================
// Decompression Context
// =============================================================================

/// Per-call decompression state
#[derive(Debug)]
struct DecompressionContext<'a> {
    data: &'a [u8],
    offset: usize,
    /// Delta of the option whose value row has not been seen yet
    pending_delta: Option<u16>,
    /// Length of the option whose value row has not been seen yet
    pending_len: Option<usize>,
    compute_length: bool,
    compute_checksum: bool,
}

impl<'a> DecompressionContext<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 1,
            pending_delta: None,
            pending_len: None,
            compute_length: false,
            compute_checksum: false,
        }
    }

    /// Consume `len` residue bytes
    fn read(&mut self, len: usize, fid: FieldId) -> Result<&'a [u8]> {
        let end = self.offset + len;
        let bytes = self.data.get(self.offset..end).ok_or_else(|| {
            SchcError::Decompression(format!(
                "{}: residue truncated, need {} byte(s) at offset {} of {}",
                fid,
                len,
                self.offset,
                self.data.len()
            ))
        })?;
        self.offset = end;
        Ok(bytes)
    }

    fn remaining(&self) -> &'a [u8] {
        self.data.get(self.offset..).unwrap_or_default()
    }

    /// Close the option under construction
    fn push_option(&mut self, packet: &mut NormalizedPacket, value: Vec<u8>) -> Result<()> {
        if packet.coap_options.len() >= MAX_COAP_OPTIONS {
            return Err(SchcError::MalformedInput(format!(
                "rule rebuilds more than {} CoAP options",
                MAX_COAP_OPTIONS
            )));
        }
        let delta = self.pending_delta.take().unwrap_or(0);
        self.pending_len = None;
        packet.coap_options.push(CoapOption::new(delta, value));
        Ok(())
    }
}

// =============================================================================
// Main Decompression Entry Point
// =============================================================================

/// Decompress a compressed packet with the rule its first byte names
///
/// Length fields and the UDP checksum are recomputed when the rule says so,
/// and the hop limit is always set to 255.
pub fn decompress(data: &[u8], rules: &RuleSet) -> Result<NormalizedPacket> {
    let rule_id = *data
        .first()
        .ok_or_else(|| SchcError::MalformedInput("empty compressed packet".to_string()))?;
    let rule = rules.get(rule_id).ok_or(SchcError::UnknownRuleId(rule_id))?;
    log::debug!("Decompressing {} bytes with rule {}", data.len(), rule_id);

    let mut ctx = DecompressionContext::new(data);
    let mut packet = NormalizedPacket::default();

    for field in &rule.compression {
        decompress_field(&mut ctx, field, &mut packet)?;
    }

    packet.coap_payload = ctx.remaining().to_vec();

    if packet.coap_token.len() != packet.coap_tkl as usize {
        return Err(SchcError::Decompression(format!(
            "token of {} bytes does not match TKL {}",
            packet.coap_token.len(),
            packet.coap_tkl
        )));
    }

    if ctx.compute_length {
        let udp_length = u16::try_from(packet.coap_len() + UDP_HEADER_LEN).map_err(|_| {
            SchcError::ResourceExhausted(format!(
                "UDP length {} does not fit in 16 bits",
                packet.coap_len() + UDP_HEADER_LEN
            ))
        })?;
        packet.udp_length = udp_length;
        packet.ipv6_payload_length = udp_length;
    }

    packet.ipv6_hop_limit = DECOMPRESSED_HOP_LIMIT;

    if ctx.compute_checksum {
        packet.udp_checksum = compute_udp_checksum(&packet)?;
    }

    Ok(packet)
}

/// Decompress a single field according to its CDA
fn decompress_field(
    ctx: &mut DecompressionContext<'_>,
    field: &Field,
    packet: &mut NormalizedPacket,
) -> Result<()> {
    match field.cda {
        CompressionAction::NotSent => {
            let tv = field.target().ok_or_else(|| {
                SchcError::Decompression(format!("{}: not-sent without target value", field.fid))
            })?;
            restore_target(ctx, field.fid, tv, packet)
        }
        CompressionAction::ValueSent => read_residue(ctx, field.fid, packet),
        CompressionAction::ComputeLength => {
            ctx.compute_length = true;
            Ok(())
        }
        CompressionAction::ComputeChecksum => {
            ctx.compute_checksum = true;
            Ok(())
        }
        CompressionAction::MappingSent
        | CompressionAction::Lsb
        | CompressionAction::DevIid
        | CompressionAction::AppIid => {
            // The compressor consumed an option on this row
            if field.fid == FieldId::CoapOptValue {
                ctx.push_option(packet, Vec::new())?;
            }
            Ok(())
        }
    }
}

/// Restore a not-sent field from its target value
fn restore_target(
    ctx: &mut DecompressionContext<'_>,
    fid: FieldId,
    tv: &RuleValue,
    packet: &mut NormalizedPacket,
) -> Result<()> {
    match (fid, tv) {
        (FieldId::CoapToken, RuleValue::Bytes(bytes)) => {
            packet.coap_token = fit_right(bytes, packet.coap_tkl as usize);
            Ok(())
        }
        (FieldId::CoapOptValue, RuleValue::Bytes(bytes)) => ctx.push_option(packet, bytes.clone()),
        (_, RuleValue::U64(n)) => set_scalar(ctx, fid, *n, packet),
        (_, RuleValue::Bytes(bytes)) => set_bytes(fid, bytes, packet),
    }
}

/// Read a value-sent field from the residue
fn read_residue(
    ctx: &mut DecompressionContext<'_>,
    fid: FieldId,
    packet: &mut NormalizedPacket,
) -> Result<()> {
    match fid.kind() {
        FieldKind::Scalar(bits) => {
            let bytes = ctx.read(residue_width(fid), fid)?;
            let n = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
            if n >> bits != 0 {
                return Err(SchcError::Decompression(format!(
                    "{}: residue value {} exceeds {} bits",
                    fid, n, bits
                )));
            }
            set_scalar(ctx, fid, n, packet)
        }
        FieldKind::FixedBytes(len) => {
            let bytes = ctx.read(len, fid)?;
            set_bytes(fid, bytes, packet)
        }
        FieldKind::Token => {
            packet.coap_token = ctx.read(packet.coap_tkl as usize, fid)?.to_vec();
            Ok(())
        }
        FieldKind::OptionValue => {
            let len = ctx.pending_len.ok_or_else(|| {
                SchcError::Decompression(format!("{}: value sent without an option length", fid))
            })?;
            let value = ctx.read(len, fid)?.to_vec();
            ctx.push_option(packet, value)
        }
    }
}

fn set_scalar(
    ctx: &mut DecompressionContext<'_>,
    fid: FieldId,
    n: u64,
    packet: &mut NormalizedPacket,
) -> Result<()> {
    match fid {
        FieldId::Ipv6Ver => packet.ipv6_version = n as u8,
        FieldId::Ipv6Tc => packet.ipv6_traffic_class = n as u8,
        FieldId::Ipv6Fl => packet.ipv6_flow_label = n as u32,
        FieldId::Ipv6Len => packet.ipv6_payload_length = n as u16,
        FieldId::Ipv6Nxt => packet.ipv6_next_header = n as u8,
        FieldId::Ipv6HopLmt => packet.ipv6_hop_limit = n as u8,
        FieldId::UdpDevPort => packet.udp_dev_port = n as u16,
        FieldId::UdpAppPort => packet.udp_app_port = n as u16,
        FieldId::UdpLen => packet.udp_length = n as u16,
        FieldId::UdpCksum => packet.udp_checksum = n as u16,
        FieldId::CoapVer => packet.coap_version = n as u8,
        FieldId::CoapType => packet.coap_type = n as u8,
        FieldId::CoapTkl => packet.coap_tkl = n as u8,
        FieldId::CoapCode => packet.coap_code = n as u8,
        FieldId::CoapOptDelta => ctx.pending_delta = Some(n as u16),
        FieldId::CoapOptLen => ctx.pending_len = Some(n as usize),
        _ => {
            return Err(SchcError::Decompression(format!(
                "{}: numeric value for a byte field",
                fid
            )));
        }
    }
    Ok(())
}

fn set_bytes(fid: FieldId, bytes: &[u8], packet: &mut NormalizedPacket) -> Result<()> {
    let target: &mut [u8] = match fid {
        FieldId::Ipv6DevPrefix => &mut packet.ipv6_dev_prefix,
        FieldId::Ipv6DevIid => &mut packet.ipv6_dev_iid,
        FieldId::Ipv6AppPrefix => &mut packet.ipv6_app_prefix,
        FieldId::Ipv6AppIid => &mut packet.ipv6_app_iid,
        FieldId::CoapMid => &mut packet.coap_message_id,
        _ => {
            return Err(SchcError::Decompression(format!(
                "{}: byte value for a numeric field",
                fid
            )));
        }
    };
    if target.len() != bytes.len() {
        return Err(SchcError::Decompression(format!(
            "{}: expected {} bytes, got {}",
            fid,
            target.len(),
            bytes.len()
        )));
    }
    target.copy_from_slice(bytes);
    Ok(())
}
