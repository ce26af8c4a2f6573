//! Link Configuration
//!
//! Deployment-tunable parameters of one SCHC endpoint, loaded from JSON.
//! Every field has a default, so `{}` is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SchcError};
use crate::fragmentation::{DEFAULT_MAX_PACKET_LEN, DEFAULT_TILE_SIZE, Fragmenter};
use crate::link::DEFAULT_QUEUE_CAPACITY;
use crate::parser::Direction;
use crate::rule::RuleSet;

/// Which end of the LPWAN link this endpoint sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Device,
    Gateway,
}

impl Role {
    /// Direction of the packets this endpoint compresses
    pub fn send_direction(self) -> Direction {
        match self {
            Role::Device => Direction::Up,
            Role::Gateway => Direction::Down,
        }
    }

    /// Direction of the packets this endpoint decompresses
    pub fn receive_direction(self) -> Direction {
        self.send_direction().reverse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub role: Role,

    /// Compressed packets up to this size are sent unfragmented
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: usize,

    /// Payload bytes per fragment
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,

    /// Partial packets older than this are dropped; `null` disables the timeout
    #[serde(default = "default_reassembly_ttl_ms")]
    pub reassembly_ttl_ms: Option<u64>,

    /// Bytes the transmit queue holds, length prefixes included
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Rule file; the built-in LO-CoAP-EAP table when absent
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

fn default_max_packet_len() -> usize {
    DEFAULT_MAX_PACKET_LEN
}

fn default_tile_size() -> usize {
    DEFAULT_TILE_SIZE
}

fn default_reassembly_ttl_ms() -> Option<u64> {
    Some(60_000)
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            max_packet_len: default_max_packet_len(),
            tile_size: default_tile_size(),
            reassembly_ttl_ms: default_reassembly_ttl_ms(),
            queue_capacity: default_queue_capacity(),
            rules_path: None,
        }
    }
}

impl LinkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.fragmenter()?;
        if self.reassembly_ttl_ms == Some(0) {
            return Err(SchcError::Config(
                "reassembly_ttl_ms must be positive or null".to_string(),
            ));
        }
        // The largest message plus its one-byte length prefix must fit
        let largest = self.max_packet_len.max(self.tile_size + 4) + 1;
        if self.queue_capacity < largest {
            return Err(SchcError::Config(format!(
                "queue_capacity {} cannot hold a {} byte record",
                self.queue_capacity, largest
            )));
        }
        Ok(())
    }

    pub fn fragmenter(&self) -> Result<Fragmenter> {
        Fragmenter::new(self.max_packet_len, self.tile_size)
    }

    pub fn reassembly_ttl(&self) -> Option<Duration> {
        self.reassembly_ttl_ms.map(Duration::from_millis)
    }

    /// Load the configured rule table
    pub fn load_rules(&self) -> Result<RuleSet> {
        match &self.rules_path {
            Some(path) => RuleSet::from_file(path),
            None => RuleSet::lo_coap_eap(),
        }
    }
}
