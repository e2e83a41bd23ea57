//! Tiller contract types.
//!
//! This crate defines the shared vocabulary between the execution engine
//! (producer) and the state reducer (consumer):
//!
//! - **[`policy`]** -- The immutable investor policy that parameterizes one
//!   workflow run.
//! - **[`event`]** -- The wire contract: an append-only, totally ordered
//!   stream of [`Event`] records with a closed tagged-union payload.
//! - **[`candidate`]** -- Portfolio candidate lifecycle, metrics, and gate
//!   verdicts.
//! - **[`error`]** -- Contract-level error types via [`thiserror`].
//!
//! Everything here is plain data: `Serialize`/`Deserialize`, `Send + Sync`,
//! and free of runtime dependencies.

pub mod candidate;
pub mod error;
pub mod event;
pub mod policy;

// Re-export the most commonly used types at the crate root for convenience.
pub use candidate::{
    Candidate, CandidateMetrics, CandidateStatus, GateType, GateVerdict, Severity,
};
pub use error::{CoreError, Result};
pub use event::{
    Actor, ActorKind, AgentRef, ConstraintDelta, DecisionKind, Event, EventKind, EventLevel,
    ExcludedAgentRef, GateDetail, GateEvent, PlannedAgentRef, PolicySummary, ScenarioImpact,
    StageRef,
};
pub use policy::{
    AllocationBand, AssetClass, BenchmarkSettings, Constraints, Policy, Preferences,
    RebalanceCadence, RiskAppetite, RiskTolerance, TimeHorizon,
};

/// Tolerance applied when checking that allocation weights sum to 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;
