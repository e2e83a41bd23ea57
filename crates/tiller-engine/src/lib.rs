//! Tiller execution engine.
//!
//! Turns an investor policy into a completed portfolio-construction run,
//! emitting the append-only event stream the observer reconstructs state
//! from:
//!
//! - **[`registry`]** -- The immutable agent catalog with inclusion
//!   predicates.
//! - **[`plan`]** -- Pure, deterministic plan compilation.
//! - **[`signals`]** -- Run-scoped observations read by injection logic.
//! - **[`solver`]** -- Deterministic portfolio solvers.
//! - **[`gates`]** -- The four verification gates as pure evaluators.
//! - **[`repair`]** -- Bounded constraint relaxation.
//! - **[`config`]** -- TOML-loadable engine configuration.
//! - **[`engine`]** -- The execution engine: stages, forks, gates,
//!   injection, selection, finalization.

pub mod config;
pub mod engine;
pub mod error;
pub mod gates;
pub mod plan;
pub mod registry;
pub mod repair;
pub mod signals;
pub mod solver;

pub use config::EngineConfig;
pub use engine::{EventSink, ExecutionEngine, MemorySink, RunOutcome, RunPhase};
pub use error::{EngineError, Result};
pub use gates::GateOutcome;
pub use plan::{ExecutionPlan, PlanCompiler};
pub use registry::{AgentCategory, AgentDefinition, AgentRegistry, Predicate, Stage};
pub use signals::RuntimeSignals;
pub use solver::{SolverOutput, SOLVER_NAMES};
