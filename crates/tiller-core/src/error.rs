//! Contract error types.
//!
//! Validation of policies and candidates surfaces errors through
//! [`CoreError`].  Each variant carries enough context for callers to decide
//! how to handle the failure without inspecting opaque strings.

/// Unified error type for the Tiller contract crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A policy failed structural validation before a run could start.
    #[error("invalid policy: {reason}")]
    InvalidPolicy { reason: String },

    /// A candidate's allocation weights do not sum to 1.0 within tolerance.
    #[error("invalid allocation for candidate {candidate_id}: weights sum to {sum:.4}")]
    InvalidAllocation { candidate_id: String, sum: f64 },

    /// A candidate status transition violates the forward-monotonic rule.
    #[error("illegal candidate status transition for {candidate_id}: {from} -> {to}")]
    IllegalStatusTransition {
        candidate_id: String,
        from: String,
        to: String,
    },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the contract crate.
pub type Result<T> = std::result::Result<T, CoreError>;
