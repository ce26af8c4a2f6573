//! SCHC Endpoint
//!
//! One end of the LPWAN link. Outgoing datagrams are parsed, compressed,
//! fragmented and queued for the radio; incoming messages are reassembled,
//! decompressed and serialized back into datagrams. A failing packet is
//! dropped, logged and counted, and the endpoint keeps going.

use std::sync::Arc;
use std::time::Instant;

use crate::compressor::compress;
use crate::config::{LinkConfig, Role};
use crate::decompressor::decompress;
use crate::error::{Result, SchcError};
use crate::fragmentation::{Fragmenter, Reassembler};
use crate::link::LinkQueue;
use crate::packet_builder::build_packet;
use crate::parser::parse_packet;
use crate::rule::RuleSet;

// =============================================================================
// Statistics
// =============================================================================

/// Counters of processed and dropped packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub packets_sent: u64,
    pub messages_sent: u64,
    pub fragmented_packets: u64,
    pub packets_delivered: u64,
    pub messages_received: u64,

    pub no_matching_rule: u64,
    pub unknown_rule_id: u64,
    pub integrity_mismatch: u64,
    pub malformed_input: u64,
    pub resource_exhausted: u64,
    pub compression_errors: u64,
    pub decompression_errors: u64,
    pub reassembly_timeouts: u64,
}

impl EndpointStats {
    fn record_error(&mut self, error: &SchcError) {
        match error {
            SchcError::NoMatchingRule => self.no_matching_rule += 1,
            SchcError::UnknownRuleId(_) => self.unknown_rule_id += 1,
            SchcError::IntegrityMismatch { .. } => self.integrity_mismatch += 1,
            SchcError::MalformedInput(_) => self.malformed_input += 1,
            SchcError::ResourceExhausted(_) => self.resource_exhausted += 1,
            SchcError::Compression(_) => self.compression_errors += 1,
            SchcError::Decompression(_) => self.decompression_errors += 1,
            SchcError::Io(_)
            | SchcError::Json(_)
            | SchcError::RuleValidation(_)
            | SchcError::Config(_) => {}
        }
    }

    /// Packets dropped for any reason
    pub fn dropped(&self) -> u64 {
        self.no_matching_rule
            + self.unknown_rule_id
            + self.integrity_mismatch
            + self.malformed_input
            + self.resource_exhausted
            + self.compression_errors
            + self.decompression_errors
            + self.reassembly_timeouts
    }
}

/// Outcome of sending one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub rule_id: u8,
    pub datagram_len: usize,
    pub compressed_len: usize,
    pub original_header_bytes: usize,
    pub compressed_header_bytes: usize,
    /// Messages queued: 1 when unfragmented
    pub messages: usize,
}

// =============================================================================
// Endpoint
// =============================================================================

#[derive(Debug)]
pub struct SchcEndpoint {
    rules: Arc<RuleSet>,
    role: Role,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    stats: EndpointStats,
}

impl SchcEndpoint {
    pub fn new(rules: Arc<RuleSet>, config: &LinkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rules,
            role: config.role,
            fragmenter: config.fragmenter()?,
            reassembler: Reassembler::new(config.reassembly_ttl()),
            stats: EndpointStats::default(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            reassembly_timeouts: self.reassembler.evictions(),
            ..self.stats
        }
    }

    /// Compress a datagram and queue the resulting messages
    ///
    /// Nothing is queued when the packet fails at any stage.
    pub fn send(&mut self, datagram: &[u8], queue: &mut impl LinkQueue) -> Result<SendReport> {
        let result = self.try_send(datagram, queue);
        match &result {
            Ok(report) => {
                self.stats.packets_sent += 1;
                self.stats.messages_sent += report.messages as u64;
                if report.messages > 1 {
                    self.stats.fragmented_packets += 1;
                }
            }
            Err(e) => {
                log::warn!("Dropping outgoing {} byte datagram: {}", datagram.len(), e);
                self.stats.record_error(e);
            }
        }
        result
    }

    fn try_send(&self, datagram: &[u8], queue: &mut impl LinkQueue) -> Result<SendReport> {
        let packet = parse_packet(datagram, self.role.send_direction())?;
        let compressed = compress(&packet, &self.rules)?;
        log::debug!(
            "Compressed {} bytes to {} with rule {}",
            datagram.len(),
            compressed.len(),
            compressed.rule_id
        );

        let messages = self.fragmenter.fragment(compressed.as_bytes())?;
        let needed: usize = messages.iter().map(|m| m.len() + 1).sum();
        if needed > queue.free_space() {
            return Err(SchcError::ResourceExhausted(format!(
                "transmit queue has {} bytes free, {} needed",
                queue.free_space(),
                needed
            )));
        }
        for message in &messages {
            queue.push(message)?;
        }
        Ok(SendReport {
            rule_id: compressed.rule_id,
            datagram_len: datagram.len(),
            compressed_len: compressed.len(),
            original_header_bytes: compressed.original_header_bytes,
            compressed_header_bytes: compressed.compressed_header_bytes,
            messages: messages.len(),
        })
    }

    pub fn receive(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        self.receive_at(message, Instant::now())
    }

    /// Process one message from the link at time `now`
    ///
    /// Returns the rebuilt datagram once a complete packet is available.
    pub fn receive_at(&mut self, message: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        self.stats.messages_received += 1;
        let result = self.try_receive(message, now);
        match &result {
            Ok(Some(datagram)) => {
                log::debug!("Delivering {} byte datagram", datagram.len());
                self.stats.packets_delivered += 1;
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("Dropping incoming {} byte message: {}", message.len(), e);
                self.stats.record_error(e);
            }
        }
        result
    }

    fn try_receive(&mut self, message: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let Some(compressed) = self.reassembler.receive_at(message, now)? else {
            return Ok(None);
        };
        let packet = decompress(&compressed, &self.rules)?;
        build_packet(&packet, self.role.receive_direction()).map(Some)
    }

    /// Drop a partial packet whose reassembly timed out
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        self.reassembler.expire(now)
    }
}
