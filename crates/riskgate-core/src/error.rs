//! Error types for the risk-scoring pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoreError {
    /// Malformed input event. Names the offending field; no state is
    /// mutated when this is returned.
    #[error("validation failed on field `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },

    /// No anomaly model is active (first boot or mid-swap).
    #[error("no active anomaly model")]
    ModelUnavailable,

    /// A model artifact's feature signature does not match the expected
    /// contract. The previously active model remains active.
    #[error("model incompatible: {0}")]
    ModelIncompatible(String),

    /// Scoring exceeded the configured latency budget.
    #[error("scoring timed out after {0:?}")]
    ScoringTimeout(std::time::Duration),

    /// An internal invariant was violated for a single user's state
    /// (negative counter, NaN). That user's profile/window is reset.
    #[error("state corruption for user `{user_id}`: {detail}")]
    StateCorruption { user_id: String, detail: String },

    /// Invalid configuration (non-monotonic thresholds, zero windows).
    #[error("configuration error: {0}")]
    Config(String),

    #[error("deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The pipeline is shutting down and can no longer accept events.
    #[error("pipeline closed")]
    PipelineClosed,

    /// The audit writer's queue is full; the record was dropped.
    #[error("audit queue full, record dropped")]
    AuditQueueFull,
}

impl ScoreError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        ScoreError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScoreError>;
