//! Error types for promptguard.

use thiserror::Error;

use crate::evaluation::types::EvaluationRecord;

/// Result type alias using promptguard's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during prompt evaluation.
#[derive(Error, Debug)]
pub enum Error {
    /// A neutrosophic coordinate was non-finite or outside [0, 1]
    #[error(
        "invalid neutrosophic value: T={truth} I={indeterminacy} F={falsehood} (each must be in [0, 1])"
    )]
    InvalidNeutrosophic {
        truth: f64,
        indeterminacy: f64,
        falsehood: f64,
    },

    /// Model reply could not be parsed into an evaluation, even after repair
    #[error("parse error: {0}")]
    Parse(String),

    /// Transport-level failure reaching the model provider
    #[error("network error: {0}")]
    Network(String),

    /// Provider returned a non-success HTTP status
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Per-call deadline breached
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Provider returned no usable content
    #[error("empty response from model")]
    EmptyResponse,

    /// Model refused to evaluate and produced no parseable JSON
    #[error("model refused evaluation: {0}")]
    Refusal(String),

    /// Fire circle dropped below the minimum viable two active models
    #[error("fire circle degraded: {active} active model(s) remaining")]
    CircleDegraded {
        active: usize,
        /// Every record completed before the abort, kept as partial output.
        records: Vec<EvaluationRecord>,
    },

    /// An evaluator failed under STRICT failure mode
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    /// Cache backend I/O failure
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// Configuration rejected at engine construction
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a cache I/O error.
    pub fn cache_io(message: impl Into<String>) -> Self {
        Self::CacheIo(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }
}
