//! Portfolio candidate model.
//!
//! A candidate is one proposed portfolio solution produced by a solver and
//! driven through the verification gates.  Candidates live inside the
//! engine and are reconstructed by the reducer from `candidate.*` events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::WEIGHT_SUM_TOLERANCE;

/// Lifecycle status of a candidate.
///
/// Transitions are forward-monotonic: the first failing gate is terminal
/// for the candidate, so `Passed` can never regress to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    /// Created by a solver, not yet entered gate validation.
    Pending,
    /// Currently running through the gate sequence.
    Validating,
    /// Every applicable gate passed.
    Passed,
    /// A gate failed; no further gates run for this candidate.
    Failed,
    /// Chosen as the winning portfolio.
    Selected,
    /// Passed gates but lost the selection comparison.
    Rejected,
}

impl CandidateStatus {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: CandidateStatus) -> bool {
        use CandidateStatus::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Pending, Failed)
                | (Validating, Passed)
                | (Validating, Failed)
                | (Passed, Selected)
                | (Passed, Rejected)
        )
    }

    /// Whether this status ends the candidate's gate lifecycle.
    pub fn is_terminal_for_gates(self) -> bool {
        !matches!(self, CandidateStatus::Pending | CandidateStatus::Validating)
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Selected => "selected",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// The four verification gates, in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Compliance,
    Stress,
    Redteam,
    Liquidity,
}

impl GateType {
    /// All gates in execution order.  Compliance is mandatory; the rest
    /// run only when their enabling agent was selected by the plan.
    pub fn ordered() -> [GateType; 4] {
        [
            GateType::Compliance,
            GateType::Stress,
            GateType::Redteam,
            GateType::Liquidity,
        ]
    }
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Compliance => "compliance",
            Self::Stress => "stress",
            Self::Redteam => "redteam",
            Self::Liquidity => "liquidity",
        };
        write!(f, "{s}")
    }
}

/// Severity scale used by the red-team gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Verdict recorded on a candidate once a gate has run.
/// Absence of a gate in the candidate's map means it has not yet run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Risk/return metrics attached to a candidate at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandidateMetrics {
    pub expected_return_pct: f64,
    pub volatility_pct: f64,
    pub sharpe: f64,
    /// 95% one-year value-at-risk, in percent of portfolio value.
    pub var_95_pct: f64,
    pub turnover_pct: f64,
}

/// One proposed portfolio solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Name of the solver that produced this candidate.
    pub solver: String,
    pub status: CandidateStatus,
    /// Instrument -> weight.  Non-negative, sums to 1.0 within tolerance.
    pub allocations: BTreeMap<String, f64>,
    pub metrics: CandidateMetrics,
    /// Gate verdicts, populated incrementally as each gate runs.
    #[serde(default)]
    pub gates: BTreeMap<GateType, GateVerdict>,
    /// Assigned only after all candidates reach a terminal gate state.
    #[serde(default)]
    pub rank: Option<u32>,
    /// Populated only for the winner.
    #[serde(default)]
    pub selection_reason: Option<String>,
}

impl Candidate {
    pub fn new(
        id: impl Into<String>,
        solver: impl Into<String>,
        allocations: BTreeMap<String, f64>,
        metrics: CandidateMetrics,
    ) -> Self {
        Self {
            id: id.into(),
            solver: solver.into(),
            status: CandidateStatus::Pending,
            allocations,
            metrics,
            gates: BTreeMap::new(),
            rank: None,
            selection_reason: None,
        }
    }

    /// Check the allocation invariant: non-negative weights summing to
    /// 1.0 within [`WEIGHT_SUM_TOLERANCE`].
    pub fn validate_allocations(&self) -> Result<()> {
        let sum: f64 = self.allocations.values().sum();
        if self.allocations.values().any(|w| *w < 0.0)
            || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(CoreError::InvalidAllocation {
                candidate_id: self.id.clone(),
                sum,
            });
        }
        Ok(())
    }

    /// Apply a forward-monotonic status transition.
    pub fn transition(&mut self, next: CandidateStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::IllegalStatusTransition {
                candidate_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record a gate verdict.  Does not change status; the engine decides
    /// status from the full verdict set.
    pub fn record_gate(&mut self, gate: GateType, verdict: GateVerdict) {
        self.gates.insert(gate, verdict);
    }

    /// Whether every gate in `applicable` has run and passed.
    pub fn all_gates_passed(&self, applicable: &[GateType]) -> bool {
        applicable
            .iter()
            .all(|g| self.gates.get(g).is_some_and(|v| v.passed))
    }
}
