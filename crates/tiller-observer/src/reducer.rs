//! The state reducer.
//!
//! [`RunState`] is a pure fold over a run's event stream: feed it events
//! in order and it reconstructs everything a consumer needs to display or
//! audit the run.  The fold is idempotent through the `seq` cursor, so
//! replaying a prefix after a resume is harmless, and it freezes at the
//! first terminal event.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use tiller_core::{
    CandidateMetrics, CandidateStatus, DecisionKind, Event, EventKind, GateEvent, GateType,
    PolicySummary,
};

/// What [`RunState::apply`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event advanced the state.
    Folded,
    /// At or below the cursor; ignored.
    Duplicate,
    /// Keepalive; accepted but never folded.
    Heartbeat,
    /// The run already reached a terminal state; nothing mutates.
    AfterTerminal,
}

/// Overall run status as seen by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Stage status as seen by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Announced by the plan, not yet started.
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Reconstructed view of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageState {
    pub id: String,
    pub name: String,
    /// Arrival order of the stage within the run.
    pub order: u32,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
    pub repair_attempts: u32,
}

/// Reconstructed view of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateState {
    pub id: String,
    pub solver: String,
    pub status: CandidateStatus,
    pub allocations: BTreeMap<String, f64>,
    pub metrics: CandidateMetrics,
    /// Gate verdicts observed so far.
    pub gates: BTreeMap<GateType, bool>,
    /// The gate that failed this candidate, when one did.
    pub failed_gate: Option<GateType>,
    pub rank: Option<u32>,
    pub selection_reason: Option<String>,
    pub rejection_reason: Option<String>,
    pub is_selected: bool,
}

/// The full reconstructed state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RunState {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub policy_summary: Option<PolicySummary>,
    pub stages: Vec<StageState>,
    /// Agents with an open span, id -> name.
    pub active_agents: BTreeMap<String, String>,
    /// Branches between a fork and its join.
    pub open_branches: Vec<String>,
    pub current_stage: Option<String>,
    pub candidates: BTreeMap<String, CandidateState>,
    pub selected_candidate: Option<String>,
    pub final_allocations: Option<BTreeMap<String, f64>>,
    pub final_metrics: Option<CandidateMetrics>,
    pub explanation: Option<String>,
    pub planned_agents: Vec<String>,
    pub excluded_agents: Vec<String>,
    /// Succeeded stages over the planned roster, in percent.  Recomputed
    /// only when a stage succeeds, so it never regresses mid-run.
    pub progress_pct: u8,
    pub decision_count: u32,
    pub repair_attempts: u32,
    pub artifact_count: u32,
    /// Events folded into this state.
    pub event_count: u64,
    pub error: Option<String>,
    /// Resume cursor: highest sequence number folded.
    pub last_seq: u64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been folded.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }

    /// Fold one event.  Safe to call with duplicates and out-of-window
    /// events; only events strictly after the cursor mutate state.
    pub fn apply(&mut self, event: &Event) -> Applied {
        if matches!(event.kind, EventKind::Heartbeat) {
            return Applied::Heartbeat;
        }
        if self.is_terminal() {
            return Applied::AfterTerminal;
        }
        if event.seq <= self.last_seq {
            debug!(seq = event.seq, cursor = self.last_seq, "dropping duplicate event");
            return Applied::Duplicate;
        }
        self.last_seq = event.seq;
        self.event_count += 1;
        if self.run_id.is_none() {
            self.run_id = Some(event.run_id);
        }

        match &event.kind {
            EventKind::RunStarted { policy_summary } => {
                self.status = RunStatus::Running;
                self.policy_summary = Some(policy_summary.clone());
            }
            EventKind::RunCompleted { .. } => {
                self.status = RunStatus::Completed;
                self.progress_pct = 100;
            }
            EventKind::RunFailed { error } => {
                self.status = RunStatus::Failed;
                self.error = Some(error.clone());
            }

            EventKind::StageStarted { stage_id, stage_name } => {
                let order = self.stages.len() as u32;
                let stage = self.stage_mut(stage_id, Some(stage_name), order);
                stage.status = StageStatus::Running;
                stage.started_at = Some(event.ts);
                self.current_stage = Some(stage_id.clone());
            }
            EventKind::StageCompleted {
                stage_id,
                duration_ms,
                artifacts,
            } => {
                let order = self.stages.len() as u32;
                let ts = event.ts;
                let (duration_ms, artifacts) = (*duration_ms, artifacts.clone());
                let stage = self.stage_mut(stage_id, None, order);
                stage.status = StageStatus::Succeeded;
                stage.completed_at = Some(ts);
                stage.duration_ms = Some(duration_ms);
                for artifact in artifacts {
                    if !stage.artifacts.contains(&artifact) {
                        stage.artifacts.push(artifact);
                    }
                }
                self.recompute_progress();
            }
            EventKind::StageFailed { stage_id, error } => {
                let order = self.stages.len() as u32;
                let error = error.clone();
                let stage = self.stage_mut(stage_id, None, order);
                stage.status = StageStatus::Failed;
                stage.error = Some(error);
            }

            EventKind::SpanStarted {
                agent_id,
                agent_name,
                ..
            } => {
                self.active_agents
                    .insert(agent_id.clone(), agent_name.clone());
            }
            EventKind::SpanEnded { agent_id, .. } => {
                self.active_agents.remove(agent_id);
            }

            EventKind::Plan {
                selected,
                excluded,
                stages,
                ..
            } => {
                self.planned_agents = selected.iter().map(|a| a.id.clone()).collect();
                self.excluded_agents = excluded.iter().map(|a| a.id.clone()).collect();
                // Pre-populate the roster so progress divides by the full
                // planned stage count from the start of the run.
                for stage in stages {
                    let order = self.stages.len() as u32;
                    self.stage_mut(&stage.id, Some(&stage.name), order);
                }
            }
            EventKind::Decision {
                decision,
                selected_candidate_id,
                ..
            } => {
                self.decision_count += 1;
                if *decision == DecisionKind::SelectCandidate {
                    self.selected_candidate = selected_candidate_id.clone();
                }
            }

            EventKind::Handover { .. } => {}

            EventKind::BranchFork { branches, .. } => {
                self.open_branches = branches.clone();
            }
            EventKind::BranchJoin { .. } => {
                self.open_branches.clear();
            }

            EventKind::CandidateCreated {
                candidate_id,
                solver,
                allocations,
                metrics,
            } => {
                self.candidates.insert(
                    candidate_id.clone(),
                    CandidateState {
                        id: candidate_id.clone(),
                        solver: solver.clone(),
                        status: CandidateStatus::Pending,
                        allocations: allocations.clone(),
                        metrics: metrics.clone(),
                        gates: BTreeMap::new(),
                        failed_gate: None,
                        rank: None,
                        selection_reason: None,
                        rejection_reason: None,
                        is_selected: false,
                    },
                );
            }
            EventKind::CandidateUpdated {
                candidate_id,
                status,
                gate,
                rank,
                selection_reason,
                rejection_reason,
            } => {
                // Upsert: a partially delivered stream may carry updates
                // for a candidate whose created event was never seen.
                let candidate = self
                    .candidates
                    .entry(candidate_id.clone())
                    .or_insert_with(|| CandidateState {
                        id: candidate_id.clone(),
                        solver: String::new(),
                        status: *status,
                        allocations: BTreeMap::new(),
                        metrics: CandidateMetrics::default(),
                        gates: BTreeMap::new(),
                        failed_gate: None,
                        rank: None,
                        selection_reason: None,
                        rejection_reason: None,
                        is_selected: false,
                    });
                candidate.status = *status;
                if gate.is_some() {
                    candidate.failed_gate = *gate;
                }
                if rank.is_some() {
                    candidate.rank = *rank;
                }
                if selection_reason.is_some() {
                    candidate.selection_reason = selection_reason.clone();
                }
                if rejection_reason.is_some() {
                    candidate.rejection_reason = rejection_reason.clone();
                }
                if *status == CandidateStatus::Selected {
                    candidate.is_selected = true;
                    self.selected_candidate = Some(candidate_id.clone());
                }
            }

            EventKind::GateCompliance(_)
            | EventKind::GateStress(_)
            | EventKind::GateRedteam(_)
            | EventKind::GateLiquidity(_) => {
                if let Some((gate, body)) = event.kind.as_gate() {
                    self.fold_gate(gate, body);
                }
            }

            EventKind::RepairStarted { .. } => {
                self.repair_attempts += 1;
                let order = self.stages.len() as u32;
                let stage = self.stage_mut("repair", None, order);
                stage.repair_attempts += 1;
            }
            EventKind::RepairEnded { .. } => {}

            EventKind::ArtifactCreated {
                artifact_id,
                stage_id,
                ..
            } => {
                self.artifact_count += 1;
                let order = self.stages.len() as u32;
                let artifact_id = artifact_id.clone();
                let stage = self.stage_mut(stage_id, None, order);
                if !stage.artifacts.contains(&artifact_id) {
                    stage.artifacts.push(artifact_id);
                }
            }

            EventKind::AgentEvidence { .. } => {}

            EventKind::PortfolioUpdate {
                allocations,
                metrics,
                is_intermediate,
                ..
            } => {
                if !is_intermediate {
                    self.final_allocations = Some(allocations.clone());
                    self.final_metrics = Some(metrics.clone());
                }
            }
            EventKind::PortfolioExplanation { text, .. } => {
                self.explanation = Some(text.clone());
            }

            // Filtered before the cursor check.
            EventKind::Heartbeat => {}
        }

        Applied::Folded
    }

    fn fold_gate(&mut self, gate: GateType, body: &GateEvent) {
        if let Some(candidate) = self.candidates.get_mut(&body.candidate_id) {
            candidate.gates.insert(gate, body.passed);
            if !body.passed {
                candidate.failed_gate = Some(gate);
            }
        }
    }

    fn stage_mut(&mut self, stage_id: &str, name: Option<&str>, order: u32) -> &mut StageState {
        if let Some(index) = self.stages.iter().position(|s| s.id == stage_id) {
            return &mut self.stages[index];
        }
        self.stages.push(StageState {
            id: stage_id.to_string(),
            name: name.unwrap_or(stage_id).to_string(),
            order,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            artifacts: Vec::new(),
            error: None,
            repair_attempts: 0,
        });
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    /// Succeeded stages over every stage known (planned or observed).
    /// Called only when a stage succeeds; a late-appearing stage grows
    /// the denominator together with the numerator, so the ratio never
    /// moves backward.
    fn recompute_progress(&mut self) {
        if self.stages.is_empty() {
            self.progress_pct = 0;
            return;
        }
        let succeeded = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .count();
        self.progress_pct = ((succeeded * 100) / self.stages.len()) as u8;
    }
}

/// Fold a complete stream into a fresh state.
pub fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> RunState {
    let mut state = RunState::new();
    for event in events {
        state.apply(event);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::{Actor, EventLevel, PolicySummary, RiskTolerance, StageRef};

    fn event(seq: u64, kind: EventKind) -> Event {
        Event {
            id: Uuid::now_v7(),
            seq,
            ts: Utc::now(),
            run_id: Uuid::nil(),
            trace_id: Uuid::nil(),
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
    fn duplicate_events_are_dropped() {
        let mut state = RunState::new();
        let e = event(
            1,
            EventKind::StageStarted {
                stage_id: "policy_parsing".to_string(),
                stage_name: "Policy Parsing".to_string(),
            },
        );
        assert_eq!(state.apply(&e), Applied::Folded);
        assert_eq!(state.apply(&e), Applied::Duplicate);
        assert_eq!(state.event_count, 1);
        assert_eq!(state.stages.len(), 1);
    }

    #[test]
    fn heartbeats_never_fold() {
        let mut state = RunState::new();
        let before = state.clone();
        assert_eq!(state.apply(&event(5, EventKind::Heartbeat)), Applied::Heartbeat);
        assert_eq!(state, before);
    }

    #[test]
    fn terminal_event_freezes_state() {
        let mut state = RunState::new();
        state.apply(&event(
            1,
            EventKind::RunFailed {
                error: "boom".to_string(),
            },
        ));
        assert!(state.is_terminal());
        let after_terminal = event(
            2,
            EventKind::StageStarted {
                stage_id: "audit".to_string(),
                stage_name: "Audit".to_string(),
            },
        );
        assert_eq!(state.apply(&after_terminal), Applied::AfterTerminal);
        assert!(state.stages.is_empty());
    }

    fn plan(stage_ids: &[&str]) -> EventKind {
        EventKind::Plan {
            selected: Vec::new(),
            excluded: Vec::new(),
            stages: stage_ids
                .iter()
                .map(|id| StageRef {
                    id: id.to_string(),
                    name: id.to_string(),
                })
                .collect(),
            policy_summary: PolicySummary {
                risk_tolerance: RiskTolerance::Moderate,
                max_volatility_pct: None,
                max_drawdown_pct: None,
                esg: false,
                themes: Vec::new(),
                target_return_pct: None,
            },
        }
    }

    fn start(id: &str) -> EventKind {
        EventKind::StageStarted {
            stage_id: id.to_string(),
            stage_name: id.to_string(),
        }
    }

    fn done(id: &str) -> EventKind {
        EventKind::StageCompleted {
            stage_id: id.to_string(),
            duration_ms: 10,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn progress_divides_by_the_planned_roster() {
        let mut state = RunState::new();
        state.apply(&event(1, plan(&["a", "b"])));
        assert_eq!(state.progress_pct, 0);
        state.apply(&event(2, start("a")));
        assert_eq!(state.progress_pct, 0);
        state.apply(&event(3, done("a")));
        assert_eq!(state.progress_pct, 50);
        state.apply(&event(4, start("b")));
        assert_eq!(state.progress_pct, 50);
        state.apply(&event(5, done("b")));
        assert_eq!(state.progress_pct, 100);
    }

    #[test]
    fn unplanned_stage_never_moves_progress_backward() {
        let mut state = RunState::new();
        state.apply(&event(1, plan(&["a", "b"])));
        state.apply(&event(2, start("a")));
        state.apply(&event(3, done("a")));
        assert_eq!(state.progress_pct, 50);

        // A stage the plan never announced, as injection produces.
        state.apply(&event(4, start("repair")));
        assert_eq!(state.progress_pct, 50);
        state.apply(&event(5, done("repair")));
        assert_eq!(state.progress_pct, 66);
        state.apply(&event(6, start("b")));
        state.apply(&event(7, done("b")));
        assert_eq!(state.progress_pct, 100);
    }

    #[test]
    fn candidate_update_without_created_upserts() {
        let mut state = RunState::new();
        state.apply(&event(
            1,
            EventKind::CandidateUpdated {
                candidate_id: "cand-2".to_string(),
                status: CandidateStatus::Validating,
                gate: None,
                rank: None,
                selection_reason: None,
                rejection_reason: None,
            },
        ));
        let candidate = &state.candidates["cand-2"];
        assert_eq!(candidate.status, CandidateStatus::Validating);
        assert!(candidate.allocations.is_empty());
    }

    #[test]
    fn repair_attempts_accumulate_on_the_repair_stage() {
        let mut state = RunState::new();
        state.apply(&event(
            1,
            EventKind::RepairStarted {
                iteration: 1,
                max_iterations: 2,
                deltas: Vec::new(),
            },
        ));
        state.apply(&event(
            2,
            EventKind::RepairStarted {
                iteration: 2,
                max_iterations: 2,
                deltas: Vec::new(),
            },
        ));
        assert_eq!(state.repair_attempts, 2);
        let stage = state.stages.iter().find(|s| s.id == "repair").unwrap();
        assert_eq!(stage.repair_attempts, 2);
    }
}
