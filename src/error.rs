//! Error types for feed-relay.
//!
//! One enum per concern, umbrella `Error` at the top. A message dropped by
//! the filter stage is a normal pipeline outcome, not an error, and has no
//! variant here.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Configuration-related errors. Fatal at load time; the pipeline assumes
/// all patterns are pre-validated and never fails at transform time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid pattern in rule set {rule_set}: {pattern}: {message}")]
    InvalidPattern {
        rule_set: String,
        pattern: String,
        message: String,
    },

    #[error("Progressive tiers for rule set {rule_set} are not strictly ascending at limit {limit}")]
    UnsortedTiers { rule_set: String, limit: String },

    #[error("Price rule in rule set {rule_set} has no capture group: {pattern}")]
    MissingCaptureGroup { rule_set: String, pattern: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue store errors. Sweeps fail closed on these: a state transition that
/// cannot be persisted is refused, never assumed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Dispatch transport failures, classified at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Retried on a later dispatch sweep, up to the configured attempt bound.
    #[error("Transient send failure to {destination}: {reason}")]
    Transient { destination: String, reason: String },

    /// Terminal for the owning queue — e.g. the destination no longer exists.
    #[error("Permanent send failure to {destination}: {reason}")]
    Permanent { destination: String, reason: String },
}

impl SendError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent { .. })
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
