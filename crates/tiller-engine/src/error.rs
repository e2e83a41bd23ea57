//! Engine error types.
//!
//! Plan compilation is infallible; errors here cover execution:
//! infeasible optimization, exhausted repair, and configuration problems.

use tiller_core::CoreError;

/// Unified error type for the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Contract-level validation failed (policy or candidate invariants).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The optimizer could not satisfy the policy constraints.
    #[error("optimization infeasible: {reason}")]
    Infeasible { reason: String },

    /// The repair loop hit its iteration bound without producing a
    /// feasible solution.
    #[error("constraint repair exhausted after {iterations} iteration(s)")]
    RepairExhausted { iterations: u32 },

    /// Gate validation left no candidate in the `Passed` state.
    #[error("no candidate passed gate validation")]
    NoViableCandidate,

    /// A configured solver name is not in the solver catalog.
    #[error("unknown solver: {name}")]
    UnknownSolver { name: String },

    /// Engine configuration failed validation.
    #[error("invalid engine config: {reason}")]
    InvalidConfig { reason: String },

    /// Engine configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Filesystem access failed while loading configuration.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
