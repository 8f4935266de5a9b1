//! Error types for the relink linkage engine
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation in the binary.
//!
//! Per-signal and per-pair failures (`MalformedSignal`, `InsufficientSignal`,
//! `Backpressure`, `DecisionFinalized`) are recoverable: callers log them and
//! keep processing the stream. `LedgerIntegrity` and `Configuration` are the
//! only system-level failures.

use thiserror::Error;

/// Main error type for relink operations
#[derive(Error, Debug)]
pub enum RelinkError {
    /// Raw signal is missing a mandatory field or carries an unparseable one
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    /// Too few features were comparable between the two signals
    #[error("Insufficient signal: {comparable} comparable features, {required} required")]
    InsufficientSignal { comparable: usize, required: usize },

    /// Hash chain broken
    #[error("Ledger integrity violated at sequence {sequence_number}: {reason}")]
    LedgerIntegrity { sequence_number: u64, reason: String },

    /// Persisted ledger uses a format this build does not understand
    #[error("Unsupported ledger format: {0}")]
    UnsupportedLedgerFormat(String),

    /// Invalid thresholds, weights or feature definitions
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Reset event violates epoch monotonicity
    #[error("Invalid reset event: {0}")]
    InvalidResetEvent(String),

    /// Ingestion queue is full and the policy rejects new signals
    #[error("Ingestion queue full ({capacity} signals)")]
    Backpressure { capacity: usize },

    /// Evidence arrived for a decision that has already been frozen
    #[error("Decision already finalized: {0}")]
    DecisionFinalized(String),

    /// No decision exists for the requested pair
    #[error("Pair not found: {0}")]
    PairNotFound(String),

    /// Layered configuration loading failed
    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl RelinkError {
    /// Whether the error requires operator attention rather than local recovery
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelinkError::LedgerIntegrity { .. }
                | RelinkError::Configuration(_)
                | RelinkError::Config(_)
                | RelinkError::Toml(_)
                | RelinkError::UnsupportedLedgerFormat(_)
        )
    }
}

/// Result type alias for relink operations
pub type Result<T> = std::result::Result<T, RelinkError>;

/// Convert anyhow::Error to RelinkError
impl From<anyhow::Error> for RelinkError {
    fn from(err: anyhow::Error) -> Self {
        RelinkError::Other(err.to_string())
    }
}
