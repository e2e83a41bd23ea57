//! The execution engine.
//!
//! Single producer of a run's event stream.  Drives the compiled plan
//! through the stage sequence, generates candidates, validates them
//! through the gates, injects bounded repair when the optimizer reports
//! infeasibility, selects the winner, and finalizes.
//!
//! Every observable step is an emitted [`Event`]; internal state (the
//! candidate set, runtime signals) exists only to decide what to emit
//! next.  One run, one writer: `run` holds the sequence counter for its
//! whole duration.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use tiller_core::{
    Actor, AgentRef, Candidate, CandidateStatus, ConstraintDelta, DecisionKind, Event,
    EventKind, EventLevel, ExcludedAgentRef, GateEvent, GateType, PlannedAgentRef, Policy,
    PolicySummary, StageRef,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::gates;
use crate::plan::{ExecutionPlan, PlanCompiler};
use crate::registry::{AgentDefinition, AgentRegistry, Predicate, Stage};
use crate::repair;
use crate::signals::RuntimeSignals;
use crate::solver::{self, SolverOutput};

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Where the engine writes its event stream.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> Result<()>;
}

/// Sink that collects events in memory, for tests and replay.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, in order.
    pub async fn collected(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: Event) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Phases of one run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Planning,
    Executing,
    Selecting,
    Finalizing,
    Completed,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Selecting => "selecting",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub winner: Candidate,
    pub candidates: Vec<Candidate>,
    pub decision_count: u32,
    pub event_count: u64,
}

/// Per-run mutable bookkeeping: sequence counter, span counter, phase,
/// and the runtime signals the injection logic reads.
struct RunContext {
    run_id: Uuid,
    trace_id: Uuid,
    seq: u64,
    span_counter: u32,
    decision_count: u32,
    phase: RunPhase,
    signals: RuntimeSignals,
}

impl RunContext {
    fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            trace_id: Uuid::now_v7(),
            seq: 0,
            span_counter: 0,
            decision_count: 0,
            phase: RunPhase::NotStarted,
            signals: RuntimeSignals::default(),
        }
    }

    fn next_span_id(&mut self) -> String {
        self.span_counter += 1;
        format!("span-{:04}", self.span_counter)
    }
}

/// Builder-style bundle of everything that varies between emitted events.
struct EventParts {
    actor: Actor,
    level: EventLevel,
    candidate_id: Option<String>,
    span_id: Option<String>,
    parent_span_id: Option<String>,
    message: String,
    kind: EventKind,
}

impl EventParts {
    fn new(actor: Actor, message: impl Into<String>, kind: EventKind) -> Self {
        Self {
            actor,
            level: EventLevel::Info,
            candidate_id: None,
            span_id: None,
            parent_span_id: None,
            message: message.into(),
            kind,
        }
    }

    fn level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    fn candidate(mut self, id: impl Into<String>) -> Self {
        self.candidate_id = Some(id.into());
        self
    }

    fn span(mut self, id: impl Into<String>) -> Self {
        self.span_id = Some(id.into());
        self
    }

    fn parent(mut self, id: impl Into<String>) -> Self {
        self.parent_span_id = Some(id.into());
        self
    }
}

fn gate_event_kind(gate: GateType, body: GateEvent) -> EventKind {
    match gate {
        GateType::Compliance => EventKind::GateCompliance(body),
        GateType::Stress => EventKind::GateStress(body),
        GateType::Redteam => EventKind::GateRedteam(body),
        GateType::Liquidity => EventKind::GateLiquidity(body),
    }
}

fn predicate_field(predicate: Predicate) -> &'static str {
    match predicate {
        Predicate::EsgEnabled | Predicate::HasThemes => "preferences",
        Predicate::StressRelevant => "risk.max_volatility_pct",
        Predicate::AggressiveRisk | Predicate::ConservativeRisk => "risk.risk_tolerance",
        Predicate::FrequentRebalancing => "benchmark.rebalance_cadence",
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives one policy through the whole workflow, emitting the run's
/// event stream into the sink.
pub struct ExecutionEngine<S> {
    compiler: PlanCompiler,
    config: EngineConfig,
    sink: S,
}

impl<S: EventSink> ExecutionEngine<S> {
    pub fn new(registry: AgentRegistry, config: EngineConfig, sink: S) -> Self {
        Self {
            compiler: PlanCompiler::new(registry),
            config,
            sink,
        }
    }

    /// Consume the engine, handing back the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Execute one run.
    ///
    /// Emits `run.failed` and stops on any unrecoverable condition;
    /// events emitted before the failure remain valid.
    pub async fn run(&self, policy: &Policy) -> Result<RunOutcome> {
        policy.validate()?;
        let mut ctx = RunContext::new();
        info!(run_id = %ctx.run_id, "starting run");

        match self.run_inner(policy, &mut ctx).await {
            Ok(outcome) => {
                info!(run_id = %ctx.run_id, winner = %outcome.winner.id, "run completed");
                Ok(outcome)
            }
            Err(err) => {
                error!(run_id = %ctx.run_id, error = %err, "run failed");
                ctx.phase = RunPhase::Failed;
                let parts = EventParts::new(
                    Actor::orchestrator(),
                    format!("run failed: {err}"),
                    EventKind::RunFailed {
                        error: err.to_string(),
                    },
                )
                .level(EventLevel::Error);
                if let Err(sink_err) = self.emit(&mut ctx, parts).await {
                    warn!(error = %sink_err, "could not emit terminal failure event");
                }
                Err(err)
            }
        }
    }

    async fn run_inner(&self, policy: &Policy, ctx: &mut RunContext) -> Result<RunOutcome> {
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                "portfolio construction run started",
                EventKind::RunStarted {
                    policy_summary: PolicySummary::from(policy),
                },
            ),
        )
        .await?;

        // Planning
        ctx.phase = RunPhase::Planning;
        let plan = self.compiler.compile(policy);
        self.emit_plan(ctx, policy, &plan).await?;

        // Executing
        ctx.phase = RunPhase::Executing;
        for stage in [Stage::PolicyParsing, Stage::MarketData, Stage::DataQuality] {
            self.run_simple_stage(ctx, &plan, stage, policy).await?;
        }
        self.run_risk_return_stage(ctx, &plan, policy).await?;
        self.run_simple_stage(ctx, &plan, Stage::RiskOverlay, policy)
            .await?;

        let mut candidates = self.run_optimization_stage(ctx, &plan, policy).await?;
        self.run_gate_stage(ctx, &plan, policy, &mut candidates)
            .await?;
        if ctx.signals.infeasible {
            self.run_repair_stage(ctx, &plan, policy, &mut candidates)
                .await?;
        }
        self.run_simple_stage(ctx, &plan, Stage::RebalancePlanning, policy)
            .await?;

        // Selecting
        ctx.phase = RunPhase::Selecting;
        let winner = self.select_winner(ctx, &mut candidates).await?;

        // Finalizing
        ctx.phase = RunPhase::Finalizing;
        self.run_explanation_stage(ctx, &plan, policy, &winner).await?;
        self.run_audit_stage(ctx, &plan).await?;

        let event_count = ctx.seq + 1;
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                "portfolio construction run completed",
                EventKind::RunCompleted {
                    decision_count: ctx.decision_count,
                    event_count,
                },
            ),
        )
        .await?;
        ctx.phase = RunPhase::Completed;

        Ok(RunOutcome {
            run_id: ctx.run_id,
            winner,
            candidates,
            decision_count: ctx.decision_count,
            event_count,
        })
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    async fn emit_plan(
        &self,
        ctx: &mut RunContext,
        policy: &Policy,
        plan: &ExecutionPlan,
    ) -> Result<()> {
        for excluded in plan.missing_data_exclusions() {
            if let Some(predicate) = excluded.agent.predicate {
                let field = predicate_field(predicate).to_string();
                if !ctx.signals.missing_fields.contains(&field) {
                    ctx.signals.missing_fields.push(field);
                }
            }
        }

        let selected: Vec<PlannedAgentRef> = plan
            .selected
            .iter()
            .map(|p| PlannedAgentRef {
                id: p.agent.id.to_string(),
                name: p.agent.name.to_string(),
                reason: p.reason.clone(),
                category: match p.agent.category {
                    crate::registry::AgentCategory::Core => "core".to_string(),
                    _ => "conditional".to_string(),
                },
            })
            .collect();
        let excluded: Vec<ExcludedAgentRef> = plan
            .excluded
            .iter()
            .map(|e| ExcludedAgentRef {
                id: e.agent.id.to_string(),
                name: e.agent.name.to_string(),
                reason: e.reason.clone(),
            })
            .collect();

        // Planned stage roster: stages with at least one selected agent,
        // plus gate validation, which runs even with no gate-stage agent.
        // Repair is not announced; it enters only by injection.
        let stages: Vec<StageRef> = Stage::ordered()
            .into_iter()
            .filter(|s| {
                *s == Stage::GateValidation || !plan.agents_in_stage(*s).is_empty()
            })
            .map(|s| StageRef {
                id: s.id().to_string(),
                name: s.display_name().to_string(),
            })
            .collect();

        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                format!(
                    "compiled plan: {} agents selected, {} excluded",
                    selected.len(),
                    excluded.len()
                ),
                EventKind::Plan {
                    selected,
                    excluded,
                    stages,
                    policy_summary: PolicySummary::from(policy),
                },
            ),
        )
        .await?;

        // One decision per conditional agent, either way, confidence 1.0.
        let decisions: Vec<(String, String, bool)> = plan
            .selected
            .iter()
            .filter(|p| p.agent.predicate.is_some())
            .map(|p| (p.agent.id.to_string(), p.reason.clone(), true))
            .chain(
                plan.excluded
                    .iter()
                    .map(|e| (e.agent.id.to_string(), e.reason.clone(), false)),
            )
            .collect();
        for (agent_id, reason, included) in decisions {
            let decision = if included {
                DecisionKind::IncludeAgent
            } else {
                DecisionKind::ExcludeAgent
            };
            let verb = if included { "include" } else { "exclude" };
            self.emit(
                ctx,
                EventParts::new(
                    Actor::orchestrator(),
                    format!("{verb} {agent_id}: {reason}"),
                    EventKind::Decision {
                        decision,
                        reason,
                        confidence: 1.0,
                        inputs: vec![format!("agent: {agent_id}")],
                        added_agents: Vec::new(),
                        selected_candidate_id: None,
                        constraint_diff: Vec::new(),
                    },
                ),
            )
            .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage execution
    // -----------------------------------------------------------------------

    /// A stage whose agents run sequentially with handovers in between.
    async fn run_simple_stage(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        stage: Stage,
        policy: &Policy,
    ) -> Result<()> {
        let agents: Vec<AgentDefinition> =
            plan.agents_in_stage(stage).into_iter().copied().collect();
        if agents.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        self.emit_stage_started(ctx, stage).await?;

        let mut previous: Option<&AgentDefinition> = None;
        for agent in &agents {
            if let Some(prev) = previous {
                self.emit(
                    ctx,
                    EventParts::new(
                        Actor::orchestrator(),
                        format!("handover {} -> {}", prev.id, agent.id),
                        EventKind::Handover {
                            from_agent: prev.id.to_string(),
                            to_agent: agent.id.to_string(),
                            reason: format!("{} output feeds {}", prev.id, agent.id),
                        },
                    ),
                )
                .await?;
            }
            let span_id = self.span_start(ctx, agent, None).await?;
            self.emit_evidence(ctx, agent, policy, &span_id).await?;
            self.span_end(ctx, agent, &span_id, true, format!("{} complete", agent.id))
                .await?;
            previous = Some(agent);
        }

        self.emit_stage_completed(ctx, stage, started, Vec::new())
            .await
    }

    /// Risk and return analysis run as parallel branches between an
    /// explicit fork and join.
    async fn run_risk_return_stage(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        policy: &Policy,
    ) -> Result<()> {
        let agents: Vec<AgentDefinition> = plan
            .agents_in_stage(Stage::RiskReturn)
            .into_iter()
            .copied()
            .collect();
        if agents.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        self.emit_stage_started(ctx, Stage::RiskReturn).await?;

        let branches: Vec<String> = agents.iter().map(|a| a.id.to_string()).collect();
        let fork_span = ctx.next_span_id();
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                "forking parallel risk and return analysis",
                EventKind::BranchFork {
                    branches: branches.clone(),
                    reason: "risk and return estimates are independent".to_string(),
                },
            )
            .span(fork_span.clone()),
        )
        .await?;

        for agent in &agents {
            let span_id = self.span_start(ctx, agent, Some(&fork_span)).await?;
            self.emit_evidence(ctx, agent, policy, &span_id).await?;
            self.span_end(ctx, agent, &span_id, true, format!("{} complete", agent.id))
                .await?;
        }

        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                "joining risk and return branches",
                EventKind::BranchJoin { branches },
            )
            .span(fork_span),
        )
        .await?;

        self.emit_stage_completed(ctx, Stage::RiskReturn, started, Vec::new())
            .await
    }

    /// Candidate generation.  Multi-solver when the challenger optimizer
    /// was selected, single primary solver otherwise.  Infeasibility does
    /// not fail the stage; it raises the signal the repair stage reads.
    async fn run_optimization_stage(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        policy: &Policy,
    ) -> Result<Vec<Candidate>> {
        let started = Instant::now();
        self.emit_stage_started(ctx, Stage::Optimization).await?;

        let optimizer = plan
            .agents_in_stage(Stage::Optimization)
            .into_iter()
            .copied()
            .collect::<Vec<_>>();
        let solvers: Vec<String> = if plan.multi_solver() {
            self.config.solver_names.clone()
        } else {
            vec![self.config.primary_solver().to_string()]
        };

        let mut candidates = Vec::new();
        let mut infeasible_reason: Option<String> = None;

        for agent in &optimizer {
            let span_id = self.span_start(ctx, agent, None).await?;

            // Candidate generation happens under the primary optimizer's
            // span; the challenger span records its participation only.
            if agent.id == "optimizer_agent" {
                match self.generate_candidates(ctx, policy, &solvers, &span_id).await? {
                    Ok(generated) => candidates = generated,
                    Err(reason) => infeasible_reason = Some(reason),
                }
            }

            let (success, summary) = match &infeasible_reason {
                Some(reason) if agent.id == "optimizer_agent" => (false, reason.clone()),
                _ => (true, format!("{} complete", agent.id)),
            };
            self.span_end(ctx, agent, &span_id, success, summary).await?;
        }

        if let Some(reason) = infeasible_reason {
            ctx.signals.infeasible = true;
            warn!(run_id = %ctx.run_id, %reason, "optimization infeasible");
        }

        self.emit_stage_completed(ctx, Stage::Optimization, started, Vec::new())
            .await?;
        Ok(candidates)
    }

    /// Run every configured solver.  `Err(reason)` is the recoverable
    /// infeasibility outcome; hard errors propagate.
    async fn generate_candidates(
        &self,
        ctx: &mut RunContext,
        policy: &Policy,
        solvers: &[String],
        parent_span: &str,
    ) -> Result<std::result::Result<Vec<Candidate>, String>> {
        let mut outputs: Vec<(String, SolverOutput)> = Vec::new();
        for name in solvers {
            match solver::solve(policy, name) {
                Ok(output) => outputs.push((name.clone(), output)),
                Err(EngineError::Infeasible { reason }) => return Ok(Err(reason)),
                Err(other) => return Err(other),
            }
        }

        if outputs.len() > 1 {
            let branches: Vec<String> = outputs.iter().map(|(n, _)| n.clone()).collect();
            self.emit(
                ctx,
                EventParts::new(
                    Actor::orchestrator(),
                    "forking challenger optimization",
                    EventKind::BranchFork {
                        branches: branches.clone(),
                        reason: "expressed themes warrant challenger candidates".to_string(),
                    },
                )
                .span(parent_span.to_string()),
            )
            .await?;
            let mut candidates = Vec::new();
            for (index, (name, output)) in outputs.into_iter().enumerate() {
                candidates.push(
                    self.create_candidate(ctx, &name, output, index + 1).await?,
                );
            }
            self.emit(
                ctx,
                EventParts::new(
                    Actor::orchestrator(),
                    "joining solver branches",
                    EventKind::BranchJoin { branches },
                )
                .span(parent_span.to_string()),
            )
            .await?;
            Ok(Ok(candidates))
        } else {
            let mut candidates = Vec::new();
            for (index, (name, output)) in outputs.into_iter().enumerate() {
                candidates.push(
                    self.create_candidate(ctx, &name, output, index + 1).await?,
                );
            }
            Ok(Ok(candidates))
        }
    }

    async fn create_candidate(
        &self,
        ctx: &mut RunContext,
        solver_name: &str,
        output: SolverOutput,
        index: usize,
    ) -> Result<Candidate> {
        let candidate = Candidate::new(
            format!("cand-{index}"),
            solver_name,
            output.allocations,
            output.metrics,
        );
        candidate.validate_allocations()?;
        ctx.signals.turnover_pct = ctx
            .signals
            .turnover_pct
            .max(candidate.metrics.turnover_pct);

        let actor = Actor {
            kind: tiller_core::ActorKind::Solver,
            name: solver_name.to_string(),
        };
        self.emit(
            ctx,
            EventParts::new(
                actor.clone(),
                format!("candidate {} produced by {solver_name}", candidate.id),
                EventKind::CandidateCreated {
                    candidate_id: candidate.id.clone(),
                    solver: solver_name.to_string(),
                    allocations: candidate.allocations.clone(),
                    metrics: candidate.metrics.clone(),
                },
            )
            .candidate(candidate.id.clone()),
        )
        .await?;
        self.emit(
            ctx,
            EventParts::new(
                actor,
                format!("intermediate portfolio from {solver_name}"),
                EventKind::PortfolioUpdate {
                    candidate_id: Some(candidate.id.clone()),
                    allocations: candidate.allocations.clone(),
                    metrics: candidate.metrics.clone(),
                    is_intermediate: true,
                },
            )
            .candidate(candidate.id.clone()),
        )
        .await?;
        Ok(candidate)
    }

    // -----------------------------------------------------------------------
    // Gate validation
    // -----------------------------------------------------------------------

    fn applicable_gates(&self, plan: &ExecutionPlan) -> Vec<GateType> {
        let mut applicable = vec![GateType::Compliance];
        if plan.is_selected("scenario_stress_agent") {
            applicable.push(GateType::Stress);
        }
        if plan.is_selected("red_team_agent") {
            applicable.push(GateType::Redteam);
        }
        if plan.is_selected("liquidity_tc_agent") {
            applicable.push(GateType::Liquidity);
        }
        applicable
    }

    async fn run_gate_stage(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        policy: &Policy,
        candidates: &mut [Candidate],
    ) -> Result<()> {
        let started = Instant::now();
        self.emit_stage_started(ctx, Stage::GateValidation).await?;
        let applicable = self.applicable_gates(plan);
        for candidate in candidates.iter_mut() {
            self.validate_candidate(ctx, policy, &applicable, candidate)
                .await?;
        }
        self.emit_stage_completed(ctx, Stage::GateValidation, started, Vec::new())
            .await
    }

    /// Drive one candidate through the applicable gates, fail-fast.
    async fn validate_candidate(
        &self,
        ctx: &mut RunContext,
        policy: &Policy,
        applicable: &[GateType],
        candidate: &mut Candidate,
    ) -> Result<()> {
        candidate.transition(CandidateStatus::Validating)?;
        self.emit_candidate_updated(ctx, candidate, None, None).await?;

        for gate in applicable {
            let outcome = gates::evaluate(*gate, candidate, policy);
            candidate.record_gate(
                *gate,
                tiller_core::GateVerdict {
                    passed: outcome.passed,
                    issues: outcome.issues.clone(),
                },
            );
            self.observe_gate(ctx, *gate, &outcome);

            let actor = Actor {
                kind: tiller_core::ActorKind::Gate,
                name: gate.to_string(),
            };
            let level = if outcome.passed {
                EventLevel::Info
            } else {
                EventLevel::Warn
            };
            let verdict = if outcome.passed { "passed" } else { "failed" };
            self.emit(
                ctx,
                EventParts::new(
                    actor,
                    format!("{gate} gate {verdict} for {}", candidate.id),
                    gate_event_kind(
                        *gate,
                        GateEvent {
                            candidate_id: candidate.id.clone(),
                            passed: outcome.passed,
                            issues: outcome.issues.clone(),
                            detail: outcome.detail.clone(),
                        },
                    ),
                )
                .level(level)
                .candidate(candidate.id.clone()),
            )
            .await?;

            if !outcome.passed {
                candidate.transition(CandidateStatus::Failed)?;
                self.emit_candidate_updated(
                    ctx,
                    candidate,
                    Some(*gate),
                    Some(outcome.issues.join("; ")),
                )
                .await?;
                return Ok(());
            }
        }

        candidate.transition(CandidateStatus::Passed)?;
        self.emit_candidate_updated(ctx, candidate, None, None).await
    }

    fn observe_gate(&self, ctx: &mut RunContext, gate: GateType, outcome: &gates::GateOutcome) {
        match (gate, &outcome.detail) {
            (GateType::Compliance, _) if !outcome.passed => {
                ctx.signals.compliance_failures += 1;
            }
            (GateType::Stress, tiller_core::GateDetail::Stress { breaches, .. }) => {
                ctx.signals.stress_breaches += *breaches;
            }
            (GateType::Redteam, tiller_core::GateDetail::Redteam { severity, .. }) => {
                ctx.signals.observe_redteam(*severity);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Inject the repair agent and relax constraints under a bound.
    /// Success re-solves and validates the new candidates; exhaustion
    /// fails the stage and the run.
    async fn run_repair_stage(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        policy: &Policy,
        candidates: &mut Vec<Candidate>,
    ) -> Result<()> {
        let started = Instant::now();
        self.emit_stage_started(ctx, Stage::Repair).await?;

        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                "injecting constraint repair agent",
                EventKind::Decision {
                    decision: DecisionKind::InjectAgent,
                    reason: "optimization infeasible under the stated constraints".to_string(),
                    confidence: 1.0,
                    inputs: vec!["signal: infeasible".to_string()],
                    added_agents: vec![AgentRef {
                        id: "constraint_repair_agent".to_string(),
                        name: "Constraint Repair Agent".to_string(),
                    }],
                    selected_candidate_id: None,
                    constraint_diff: Vec::new(),
                },
            ),
        )
        .await?;

        let repair_agent = AgentDefinition {
            id: "constraint_repair_agent",
            name: "Constraint Repair Agent",
            category: crate::registry::AgentCategory::Injectable,
            stage: Stage::Repair,
            predicate: None,
            objective: "relax constraints minimally to restore feasibility",
        };
        let span_id = self.span_start(ctx, &repair_agent, None).await?;

        let max_iterations = self.config.max_repair_iterations;
        let solvers: Vec<String> = if plan.multi_solver() {
            self.config.solver_names.clone()
        } else {
            vec![self.config.primary_solver().to_string()]
        };

        let mut working = policy.clone();
        let mut repaired: Option<(Policy, Vec<(String, SolverOutput)>)> = None;

        for iteration in 1..=max_iterations {
            let deltas = repair::propose_relaxation(&working);
            if deltas.is_empty() {
                break;
            }
            self.emit_repair_started(ctx, iteration, max_iterations, deltas.clone())
                .await?;
            working = repair::apply_relaxation(&working, &deltas);

            let attempt = self.try_solve_all(&working, &solvers);
            let success = attempt.is_some();
            self.emit(
                ctx,
                EventParts::new(
                    Actor::agent("constraint_repair_agent"),
                    format!(
                        "repair iteration {iteration} {}",
                        if success { "restored feasibility" } else { "still infeasible" }
                    ),
                    EventKind::RepairEnded { iteration, success },
                )
                .span(span_id.clone()),
            )
            .await?;
            if let Some(outputs) = attempt {
                repaired = Some((working.clone(), outputs));
                break;
            }
        }

        let Some((relaxed_policy, outputs)) = repaired else {
            self.span_end(
                ctx,
                &repair_agent,
                &span_id,
                false,
                "repair bound exhausted without a feasible solution".to_string(),
            )
            .await?;
            self.emit(
                ctx,
                EventParts::new(
                    Actor::orchestrator(),
                    "constraint repair exhausted",
                    EventKind::StageFailed {
                        stage_id: Stage::Repair.id().to_string(),
                        error: "no feasible solution within the repair bound".to_string(),
                    },
                )
                .level(EventLevel::Error),
            )
            .await?;
            return Err(EngineError::RepairExhausted {
                iterations: max_iterations,
            });
        };

        ctx.signals.infeasible = false;
        let mut new_candidates = Vec::new();
        for (index, (name, output)) in outputs.into_iter().enumerate() {
            new_candidates.push(self.create_candidate(ctx, &name, output, index + 1).await?);
        }
        // Repaired candidates are validated against the relaxed policy.
        // The stress gate's premise is the original tight volatility
        // bound; if the relaxation removed it, the gate no longer applies.
        let mut applicable = self.applicable_gates(plan);
        if Predicate::StressRelevant.evaluate(&relaxed_policy) != Some(true) {
            applicable.retain(|g| *g != GateType::Stress);
        }
        for candidate in new_candidates.iter_mut() {
            self.validate_candidate(ctx, &relaxed_policy, &applicable, candidate)
                .await?;
        }
        *candidates = new_candidates;

        self.span_end(
            ctx,
            &repair_agent,
            &span_id,
            true,
            "feasibility restored under relaxed constraints".to_string(),
        )
        .await?;
        self.emit_stage_completed(ctx, Stage::Repair, started, Vec::new())
            .await
    }

    fn try_solve_all(
        &self,
        policy: &Policy,
        solvers: &[String],
    ) -> Option<Vec<(String, SolverOutput)>> {
        let mut outputs = Vec::new();
        for name in solvers {
            match solver::solve(policy, name) {
                Ok(output) => outputs.push((name.clone(), output)),
                Err(_) => return None,
            }
        }
        Some(outputs)
    }

    async fn emit_repair_started(
        &self,
        ctx: &mut RunContext,
        iteration: u32,
        max_iterations: u32,
        deltas: Vec<ConstraintDelta>,
    ) -> Result<()> {
        self.emit(
            ctx,
            EventParts::new(
                Actor::agent("constraint_repair_agent"),
                format!("repair iteration {iteration} of {max_iterations}"),
                EventKind::RepairStarted {
                    iteration,
                    max_iterations,
                    deltas,
                },
            ),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Highest Sharpe among passed candidates wins; ties break toward
    /// lower volatility.  No passed candidate is a run failure, never a
    /// silent default.
    async fn select_winner(
        &self,
        ctx: &mut RunContext,
        candidates: &mut Vec<Candidate>,
    ) -> Result<Candidate> {
        let mut order: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].status == CandidateStatus::Passed)
            .collect();
        if order.is_empty() {
            return Err(EngineError::NoViableCandidate);
        }
        order.sort_by(|&a, &b| {
            let (ca, cb) = (&candidates[a], &candidates[b]);
            cb.metrics
                .sharpe
                .partial_cmp(&ca.metrics.sharpe)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    ca.metrics
                        .volatility_pct
                        .partial_cmp(&cb.metrics.volatility_pct)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let inputs: Vec<String> = candidates
            .iter()
            .map(|c| {
                format!(
                    "{}: status={} sharpe={:.2} volatility={:.1}%",
                    c.id, c.status, c.metrics.sharpe, c.metrics.volatility_pct
                )
            })
            .collect();
        let winner_index = order[0];
        let winner_id = candidates[winner_index].id.clone();
        let reason = format!(
            "highest Sharpe ({:.2}) among candidates that passed every gate",
            candidates[winner_index].metrics.sharpe
        );

        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                format!("selected {winner_id}: {reason}"),
                EventKind::Decision {
                    decision: DecisionKind::SelectCandidate,
                    reason: reason.clone(),
                    confidence: 1.0,
                    inputs,
                    added_agents: Vec::new(),
                    selected_candidate_id: Some(winner_id.clone()),
                    constraint_diff: Vec::new(),
                },
            ),
        )
        .await?;

        // Rank passed candidates first, then the failed ones.
        let mut rank: u32 = 0;
        for &index in &order {
            rank += 1;
            let candidate = &mut candidates[index];
            candidate.rank = Some(rank);
            if rank == 1 {
                candidate.selection_reason = Some(reason.clone());
                candidate.transition(CandidateStatus::Selected)?;
                self.emit_candidate_updated(ctx, candidate, None, None).await?;
            } else {
                candidate.transition(CandidateStatus::Rejected)?;
                let lost = format!("lower Sharpe than {winner_id}");
                self.emit_candidate_updated(ctx, candidate, None, Some(lost)).await?;
            }
        }
        for candidate in candidates
            .iter_mut()
            .filter(|c| c.status == CandidateStatus::Failed && c.rank.is_none())
        {
            rank += 1;
            candidate.rank = Some(rank);
            self.emit_candidate_updated(ctx, candidate, None, None).await?;
        }

        let winner = candidates[winner_index].clone();
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                "final portfolio committed",
                EventKind::PortfolioUpdate {
                    candidate_id: Some(winner.id.clone()),
                    allocations: winner.allocations.clone(),
                    metrics: winner.metrics.clone(),
                    is_intermediate: false,
                },
            )
            .candidate(winner.id.clone()),
        )
        .await?;
        Ok(winner)
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn run_explanation_stage(
        &self,
        ctx: &mut RunContext,
        plan: &ExecutionPlan,
        policy: &Policy,
        winner: &Candidate,
    ) -> Result<()> {
        let agents: Vec<AgentDefinition> = plan
            .agents_in_stage(Stage::Explanation)
            .into_iter()
            .copied()
            .collect();
        let Some(explainer) = agents.first() else {
            return Ok(());
        };
        let started = Instant::now();
        self.emit_stage_started(ctx, Stage::Explanation).await?;
        let span_id = self.span_start(ctx, explainer, None).await?;

        let top: Vec<String> = {
            let mut holdings: Vec<(&String, &f64)> = winner.allocations.iter().collect();
            holdings.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
            holdings
                .iter()
                .take(3)
                .map(|(k, w)| format!("{k} {:.0}%", **w * 100.0))
                .collect()
        };
        let text = format!(
            "For a {} investor, the {} solver produced the strongest risk-adjusted \
             portfolio: expected return {:.1}%, volatility {:.1}%, Sharpe {:.2}. \
             Largest positions: {}.",
            policy.risk.risk_tolerance,
            winner.solver,
            winner.metrics.expected_return_pct,
            winner.metrics.volatility_pct,
            winner.metrics.sharpe,
            top.join(", ")
        );
        self.emit(
            ctx,
            EventParts::new(
                Actor::agent(explainer.id),
                "portfolio explanation prepared",
                EventKind::PortfolioExplanation {
                    candidate_id: winner.id.clone(),
                    text,
                },
            )
            .span(span_id.clone())
            .candidate(winner.id.clone()),
        )
        .await?;

        self.span_end(ctx, explainer, &span_id, true, "explanation complete".to_string())
            .await?;
        self.emit_stage_completed(ctx, Stage::Explanation, started, Vec::new())
            .await
    }

    async fn run_audit_stage(&self, ctx: &mut RunContext, plan: &ExecutionPlan) -> Result<()> {
        let agents: Vec<AgentDefinition> = plan
            .agents_in_stage(Stage::Audit)
            .into_iter()
            .copied()
            .collect();
        let Some(auditor) = agents.first() else {
            return Ok(());
        };
        let started = Instant::now();
        self.emit_stage_started(ctx, Stage::Audit).await?;
        let span_id = self.span_start(ctx, auditor, None).await?;

        let artifact_id = format!("audit-{}", ctx.run_id);
        self.emit(
            ctx,
            EventParts::new(
                Actor::agent(auditor.id),
                "audit bundle assembled",
                EventKind::ArtifactCreated {
                    artifact_id: artifact_id.clone(),
                    artifact_type: "audit_bundle".to_string(),
                    stage_id: Stage::Audit.id().to_string(),
                },
            )
            .span(span_id.clone()),
        )
        .await?;

        self.span_end(ctx, auditor, &span_id, true, "audit complete".to_string())
            .await?;
        self.emit_stage_completed(ctx, Stage::Audit, started, vec![artifact_id])
            .await
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    async fn emit_stage_started(&self, ctx: &mut RunContext, stage: Stage) -> Result<()> {
        info!(run_id = %ctx.run_id, stage = %stage, "stage started");
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                format!("stage {} started", stage.id()),
                EventKind::StageStarted {
                    stage_id: stage.id().to_string(),
                    stage_name: stage.display_name().to_string(),
                },
            ),
        )
        .await
    }

    async fn emit_stage_completed(
        &self,
        ctx: &mut RunContext,
        stage: Stage,
        started: Instant,
        artifacts: Vec<String>,
    ) -> Result<()> {
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                format!("stage {} completed", stage.id()),
                EventKind::StageCompleted {
                    stage_id: stage.id().to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    artifacts,
                },
            ),
        )
        .await
    }

    async fn span_start(
        &self,
        ctx: &mut RunContext,
        agent: &AgentDefinition,
        parent: Option<&str>,
    ) -> Result<String> {
        let span_id = ctx.next_span_id();
        let mut parts = EventParts::new(
            Actor::agent(agent.id),
            format!("{} started", agent.id),
            EventKind::SpanStarted {
                agent_id: agent.id.to_string(),
                agent_name: agent.name.to_string(),
                objective: agent.objective.to_string(),
                progress_pct: 0,
            },
        )
        .span(span_id.clone());
        if let Some(parent) = parent {
            parts = parts.parent(parent.to_string());
        }
        self.emit(ctx, parts).await?;
        Ok(span_id)
    }

    async fn span_end(
        &self,
        ctx: &mut RunContext,
        agent: &AgentDefinition,
        span_id: &str,
        success: bool,
        result_summary: String,
    ) -> Result<()> {
        let level = if success { EventLevel::Info } else { EventLevel::Warn };
        self.emit(
            ctx,
            EventParts::new(
                Actor::agent(agent.id),
                format!("{} ended", agent.id),
                EventKind::SpanEnded {
                    agent_id: agent.id.to_string(),
                    success,
                    result_summary,
                    progress_pct: 100,
                },
            )
            .level(level)
            .span(span_id.to_string()),
        )
        .await
    }

    async fn emit_evidence(
        &self,
        ctx: &mut RunContext,
        agent: &AgentDefinition,
        policy: &Policy,
        span_id: &str,
    ) -> Result<()> {
        let (evidence_type, summary, confidence) = agent_evidence(agent.id, policy);
        if agent.id == "data_quality_agent" {
            ctx.signals.data_quality_score = confidence;
        }
        self.emit(
            ctx,
            EventParts::new(
                Actor::agent(agent.id),
                format!("{agent_id} evidence: {evidence_type}", agent_id = agent.id),
                EventKind::AgentEvidence {
                    agent_id: agent.id.to_string(),
                    evidence_type: evidence_type.to_string(),
                    summary,
                    confidence,
                },
            )
            .span(span_id.to_string()),
        )
        .await
    }

    async fn emit_candidate_updated(
        &self,
        ctx: &mut RunContext,
        candidate: &Candidate,
        gate: Option<GateType>,
        rejection_reason: Option<String>,
    ) -> Result<()> {
        let level = match candidate.status {
            CandidateStatus::Failed => EventLevel::Warn,
            _ => EventLevel::Info,
        };
        self.emit(
            ctx,
            EventParts::new(
                Actor::orchestrator(),
                format!("candidate {} is now {}", candidate.id, candidate.status),
                EventKind::CandidateUpdated {
                    candidate_id: candidate.id.clone(),
                    status: candidate.status,
                    gate,
                    rank: candidate.rank,
                    selection_reason: candidate.selection_reason.clone(),
                    rejection_reason,
                },
            )
            .level(level)
            .candidate(candidate.id.clone()),
        )
        .await
    }

    async fn emit(&self, ctx: &mut RunContext, parts: EventParts) -> Result<()> {
        ctx.seq += 1;
        if matches!(parts.kind, EventKind::Decision { .. }) {
            ctx.decision_count += 1;
        }
        let event = Event {
            id: Uuid::now_v7(),
            seq: ctx.seq,
            ts: Utc::now(),
            run_id: ctx.run_id,
            trace_id: ctx.trace_id,
            span_id: parts.span_id,
            parent_span_id: parts.parent_span_id,
            actor: parts.actor,
            level: parts.level,
            candidate_id: parts.candidate_id,
            message: parts.message,
            kind: parts.kind,
        };
        self.sink.emit(event).await
    }
}

/// Deterministic evidence each agent contributes during its span.
fn agent_evidence(agent_id: &str, policy: &Policy) -> (&'static str, String, f64) {
    match agent_id {
        "policy_agent" => (
            "policy_profile",
            format!(
                "parsed policy: {} tolerance, {:?} horizon",
                policy.risk.risk_tolerance, policy.risk.time_horizon
            ),
            1.0,
        ),
        "market_agent" => (
            "universe",
            "assembled investable universe across seven asset buckets".to_string(),
            0.92,
        ),
        "data_quality_agent" => (
            "data_quality",
            "coverage 97%, no stale series in the lookback window".to_string(),
            0.97,
        ),
        "risk_agent" => (
            "risk_estimate",
            "volatility and drawdown estimates per asset class".to_string(),
            0.88,
        ),
        "return_agent" => (
            "return_estimate",
            "expected returns blended from historical and forward views".to_string(),
            0.84,
        ),
        "esg_screening_agent" => (
            "esg_screen",
            "universe screened against ESG exclusion criteria".to_string(),
            0.9,
        ),
        "scenario_stress_agent" => (
            "stress_scenarios",
            "loaded equity crash, rate spike and inflation scenarios".to_string(),
            0.9,
        ),
        "hedge_tail_agent" => (
            "tail_hedge",
            "tail-hedge overlay sized for the conservative mandate".to_string(),
            0.85,
        ),
        "rebalance_planner" => (
            "trade_plan",
            "trade schedule drafted for the configured cadence".to_string(),
            0.9,
        ),
        _ => (
            "note",
            format!("{agent_id} contributed its stage output"),
            0.8,
        ),
    }
}
