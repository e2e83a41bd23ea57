//! The event stream wire contract.
//!
//! Every observable fact about a run is an [`Event`]: an immutable,
//! append-only record carrying causal metadata (trace/span ids) and a
//! closed tagged-union payload ([`EventKind`], discriminated by
//! `eventType`).  Events for one run form a total order by `seq`;
//! consumers must treat the stream as potentially containing duplicates
//! and be safe to fold twice.
//!
//! Adding a new event kind is a compile-time-checked addition: the
//! reducer matches exhaustively, so a new variant will not compile until
//! every consumer handles it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::candidate::{CandidateMetrics, CandidateStatus, GateType, Severity};
use crate::policy::{Policy, RiskTolerance};

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// What kind of component emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Orchestrator,
    Agent,
    Gate,
    Solver,
}

/// The component that emitted an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub name: String,
}

impl Actor {
    pub fn orchestrator() -> Self {
        Self {
            kind: ActorKind::Orchestrator,
            name: "orchestrator".to_string(),
        }
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Agent,
            name: name.into(),
        }
    }
}

/// Condensed view of the policy carried on plan and run-start events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub risk_tolerance: RiskTolerance,
    pub max_volatility_pct: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
    pub esg: bool,
    pub themes: Vec<String>,
    pub target_return_pct: Option<f64>,
}

impl From<&Policy> for PolicySummary {
    fn from(policy: &Policy) -> Self {
        Self {
            risk_tolerance: policy.risk.risk_tolerance,
            max_volatility_pct: policy.risk.max_volatility_pct,
            max_drawdown_pct: policy.risk.max_drawdown_pct,
            esg: policy.preferences.esg,
            themes: policy.preferences.themes.clone(),
            target_return_pct: policy.benchmark.target_return_pct,
        }
    }
}

/// An agent reference carried on plan and decision events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// A selected agent with the reason it was included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAgentRef {
    pub id: String,
    pub name: String,
    pub reason: String,
    /// "core" or "conditional" from the observer's point of view.
    pub category: String,
}

/// An excluded agent with the reason it was left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedAgentRef {
    pub id: String,
    pub name: String,
    pub reason: String,
}

/// A stage reference carried on the plan event.  The roster gives
/// consumers a stable progress denominator before any stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRef {
    pub id: String,
    pub name: String,
}

/// The kinds of decision the orchestrator records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    IncludeAgent,
    ExcludeAgent,
    InjectAgent,
    SelectCandidate,
    Commit,
}

/// One constraint relaxation proposed by a repair iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDelta {
    pub constraint: String,
    pub before: f64,
    pub after: f64,
    pub reason: String,
}

/// Per-scenario stress impact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioImpact {
    pub scenario: String,
    /// Projected portfolio drawdown under this scenario, in percent
    /// (negative = loss).
    pub impact_pct: f64,
    pub breached: bool,
}

/// Structured detail attached to a gate event, typed per gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateDetail {
    Compliance {
        violations: Vec<String>,
    },
    Stress {
        scenarios: Vec<ScenarioImpact>,
        breaches: u32,
    },
    Redteam {
        severity: Severity,
        findings: Vec<String>,
    },
    Liquidity {
        turnover_pct: f64,
        threshold_pct: f64,
        slippage_bps: f64,
    },
}

/// Common body of the four `gate.*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvent {
    pub candidate_id: String,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    pub detail: GateDetail,
}

/// The closed union of event payloads, discriminated by `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted { policy_summary: PolicySummary },
    #[serde(rename = "run.completed")]
    RunCompleted { decision_count: u32, event_count: u64 },
    #[serde(rename = "run.failed")]
    RunFailed { error: String },

    #[serde(rename = "stage.started")]
    StageStarted { stage_id: String, stage_name: String },
    #[serde(rename = "stage.completed")]
    StageCompleted {
        stage_id: String,
        duration_ms: u64,
        #[serde(default)]
        artifacts: Vec<String>,
    },
    #[serde(rename = "stage.failed")]
    StageFailed { stage_id: String, error: String },

    #[serde(rename = "span.started")]
    SpanStarted {
        agent_id: String,
        agent_name: String,
        objective: String,
        progress_pct: u8,
    },
    #[serde(rename = "span.ended")]
    SpanEnded {
        agent_id: String,
        success: bool,
        result_summary: String,
        progress_pct: u8,
    },

    #[serde(rename = "orchestrator.plan")]
    Plan {
        selected: Vec<PlannedAgentRef>,
        excluded: Vec<ExcludedAgentRef>,
        /// Stages the run is planned to visit, in execution order.
        /// Repair may still be appended at runtime by injection.
        #[serde(default)]
        stages: Vec<StageRef>,
        policy_summary: PolicySummary,
    },
    #[serde(rename = "orchestrator.decision")]
    Decision {
        decision: DecisionKind,
        reason: String,
        confidence: f64,
        #[serde(default)]
        inputs: Vec<String>,
        #[serde(default)]
        added_agents: Vec<AgentRef>,
        #[serde(default)]
        selected_candidate_id: Option<String>,
        #[serde(default)]
        constraint_diff: Vec<ConstraintDelta>,
    },

    #[serde(rename = "handover")]
    Handover {
        from_agent: String,
        to_agent: String,
        reason: String,
    },

    #[serde(rename = "branch.fork")]
    BranchFork { branches: Vec<String>, reason: String },
    #[serde(rename = "branch.join")]
    BranchJoin { branches: Vec<String> },

    #[serde(rename = "candidate.created")]
    CandidateCreated {
        candidate_id: String,
        solver: String,
        allocations: BTreeMap<String, f64>,
        metrics: CandidateMetrics,
    },
    #[serde(rename = "candidate.updated")]
    CandidateUpdated {
        candidate_id: String,
        status: CandidateStatus,
        /// The gate responsible for this status change, when one is.
        /// Always explicit; never derived from message prose.
        #[serde(default)]
        gate: Option<GateType>,
        #[serde(default)]
        rank: Option<u32>,
        #[serde(default)]
        selection_reason: Option<String>,
        #[serde(default)]
        rejection_reason: Option<String>,
    },

    #[serde(rename = "gate.compliance")]
    GateCompliance(GateEvent),
    #[serde(rename = "gate.stress")]
    GateStress(GateEvent),
    #[serde(rename = "gate.redteam")]
    GateRedteam(GateEvent),
    #[serde(rename = "gate.liquidity")]
    GateLiquidity(GateEvent),

    #[serde(rename = "repair.started")]
    RepairStarted {
        iteration: u32,
        max_iterations: u32,
        deltas: Vec<ConstraintDelta>,
    },
    #[serde(rename = "repair.ended")]
    RepairEnded { iteration: u32, success: bool },

    #[serde(rename = "artifact.created")]
    ArtifactCreated {
        artifact_id: String,
        artifact_type: String,
        stage_id: String,
    },

    #[serde(rename = "agent.evidence")]
    AgentEvidence {
        agent_id: String,
        evidence_type: String,
        summary: String,
        confidence: f64,
    },

    #[serde(rename = "portfolio.update")]
    PortfolioUpdate {
        #[serde(default)]
        candidate_id: Option<String>,
        allocations: BTreeMap<String, f64>,
        metrics: CandidateMetrics,
        is_intermediate: bool,
    },
    #[serde(rename = "portfolio.explanation")]
    PortfolioExplanation { candidate_id: String, text: String },

    /// Channel keepalive.  Accepted by consumers, never folded into state.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EventKind {
    /// The gate body, if this is one of the four `gate.*` kinds.
    pub fn as_gate(&self) -> Option<(GateType, &GateEvent)> {
        match self {
            EventKind::GateCompliance(g) => Some((GateType::Compliance, g)),
            EventKind::GateStress(g) => Some((GateType::Stress, g)),
            EventKind::GateRedteam(g) => Some((GateType::Redteam, g)),
            EventKind::GateLiquidity(g) => Some((GateType::Liquidity, g)),
            _ => None,
        }
    }
}

/// One record in a run's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event identity.
    pub id: Uuid,
    /// Monotonic position within the run's stream, starting at 1.
    /// Doubles as the resume cursor.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub run_id: Uuid,
    pub trace_id: Uuid,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub actor: Actor,
    pub level: EventLevel,
    #[serde(default)]
    pub candidate_id: Option<String>,
    /// Short human-readable line for inline display.
    pub message: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Whether this event ends the run.  After a terminal event the
    /// producer emits nothing further and consumers stop reconnecting.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::RunCompleted { .. } | EventKind::RunFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(kind: EventKind) -> Event {
        Event {
            id: Uuid::now_v7(),
            seq: 1,
            ts: Utc::now(),
            run_id: Uuid::now_v7(),
            trace_id: Uuid::now_v7(),
            span_id: None,
            parent_span_id: None,
            actor: Actor::orchestrator(),
            level: EventLevel::Info,
            candidate_id: None,
            message: "test".to_string(),
            kind,
        }
    }

    #[test]
    fn event_type_discriminant_on_wire() {
        let event = base_event(EventKind::BranchFork {
            branches: vec!["risk_agent".into(), "return_agent".into()],
            reason: "parallel risk/return analysis".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "branch.fork");
        assert_eq!(json["branches"][0], "risk_agent");
    }

    #[test]
    fn gate_events_carry_their_own_type() {
        let event = base_event(EventKind::GateStress(GateEvent {
            candidate_id: "cand-1".into(),
            passed: false,
            issues: vec!["equity crash scenario breaches max drawdown".into()],
            detail: GateDetail::Stress {
                scenarios: vec![ScenarioImpact {
                    scenario: "equity crash -20%".into(),
                    impact_pct: -15.2,
                    breached: true,
                }],
                breaches: 1,
            },
        }));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        let (gate, body) = back.kind.as_gate().expect("gate event");
        assert_eq!(gate, GateType::Stress);
        assert!(!body.passed);
    }

    #[test]
    fn round_trip_preserves_equality() {
        let event = base_event(EventKind::Decision {
            decision: DecisionKind::SelectCandidate,
            reason: "highest Sharpe among passing candidates".into(),
            confidence: 0.95,
            inputs: vec!["cand-1: sharpe=1.20".into(), "cand-2: sharpe=0.90".into()],
            added_agents: vec![],
            selected_candidate_id: Some("cand-1".into()),
            constraint_diff: vec![],
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn unknown_event_type_fails_decoding() {
        let raw = r#"{"id":"018f0000-0000-7000-8000-000000000000","seq":1,
            "ts":"2024-01-01T00:00:00Z",
            "run_id":"018f0000-0000-7000-8000-000000000001",
            "trace_id":"018f0000-0000-7000-8000-000000000002",
            "actor":{"kind":"orchestrator","name":"orchestrator"},
            "level":"info","message":"x","eventType":"totally.new"}"#;
        assert!(serde_json::from_str::<Event>(raw).is_err());
    }

    #[test]
    fn terminal_detection() {
        assert!(base_event(EventKind::RunCompleted { decision_count: 3, event_count: 40 })
            .is_terminal());
        assert!(base_event(EventKind::RunFailed { error: "boom".into() }).is_terminal());
        assert!(!base_event(EventKind::Heartbeat).is_terminal());
    }
}
