//! # SCHC Library - Static Context Header Compression
//!
//! Compresses IPv6/UDP/CoAP headers against a static rule table for LPWAN
//! links, and fragments compressed packets that exceed the link's message
//! size. The reverse path reassembles, decompresses and rebuilds the
//! original datagram.

pub mod checksum;
pub mod error;
pub mod field_id;
pub mod packet;
pub mod rule;

// Core functional modules
pub mod compressor;
pub mod decompressor;
pub mod fragmentation;
pub mod matcher;
pub mod packet_builder;
pub mod parser;

// Integration layer
pub mod config;
pub mod endpoint;
pub mod link;

// Core error/result types
pub use error::{Result, SchcError};
pub use field_id::FieldId;
pub use rule::{CompressionAction, Field, MatchingOperator, Rule, RuleSet, RuleValue};

pub use packet::{CoapOption, NormalizedPacket};
pub use parser::{Direction, LinkLayer, parse_packet};
pub use packet_builder::build_packet;

pub use compressor::{CompressedPacket, compress};
pub use decompressor::decompress;
pub use fragmentation::{Fragmenter, Reassembler};

pub use config::{LinkConfig, Role};
pub use endpoint::{EndpointStats, SchcEndpoint, SendReport};
pub use link::{LengthPrefixedQueue, LinkQueue};
