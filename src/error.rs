//! Error types for SCHC operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// No rule in the table matches the packet's fields and option count
    #[error("No matching rule found")]
    NoMatchingRule,

    /// Compressed packet carries a rule id outside the table
    #[error("Unknown rule ID {0}")]
    UnknownRuleId(u8),

    /// Reassembled packet does not match the MIC carried by the last fragment
    #[error("Integrity check failed: expected {expected:#06x}, computed {computed:#06x}")]
    IntegrityMismatch { expected: u16, computed: u16 },

    /// Input inconsistent with the declared bounds of the format
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Input or accumulated state larger than a fixed capacity
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Rule validation error: {0}")]
    RuleValidation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchcError>;
