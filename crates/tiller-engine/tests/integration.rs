//! End-to-end engine tests: full runs against the standard registry,
//! asserting on the emitted event stream.

use std::collections::BTreeMap;

use tiller_core::{
    BenchmarkSettings, Constraints, DecisionKind, Event, EventKind, Policy, Preferences,
    RiskAppetite, RiskTolerance, TimeHorizon, WEIGHT_SUM_TOLERANCE,
};
use tiller_engine::{
    AgentRegistry, EngineConfig, EngineError, ExecutionEngine, MemorySink, PlanCompiler,
};

fn base_policy(tolerance: RiskTolerance) -> Policy {
    Policy {
        risk: RiskAppetite {
            risk_tolerance: tolerance,
            max_volatility_pct: Some(15.0),
            max_drawdown_pct: Some(30.0),
            time_horizon: TimeHorizon::Long,
        },
        constraints: Constraints {
            bands: BTreeMap::new(),
            max_single_position: 0.5,
            min_position_count: 3,
        },
        preferences: Preferences::default(),
        benchmark: BenchmarkSettings::default(),
    }
}

fn engine() -> ExecutionEngine<MemorySink> {
    ExecutionEngine::new(
        AgentRegistry::standard(),
        EngineConfig::default(),
        MemorySink::new(),
    )
}

async fn run_and_collect(policy: &Policy) -> (Vec<Event>, Option<tiller_engine::RunOutcome>) {
    let engine = engine();
    let outcome = engine.run(policy).await.ok();
    (engine.into_sink().collected().await, outcome)
}

// ═══════════════════════════════════════════════════════════════════════════
// Plan compilation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn plan_compilation_is_deterministic() {
    let policy = base_policy(RiskTolerance::Aggressive);
    let compiler = PlanCompiler::new(AgentRegistry::standard());
    let a = compiler.compile(&policy);
    let b = compiler.compile(&policy.clone());
    let ids = |plan: &tiller_engine::ExecutionPlan| -> Vec<String> {
        plan.execution_order.iter().map(|x| x.id.to_string()).collect()
    };
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(a.excluded.len(), b.excluded.len());
}

// ═══════════════════════════════════════════════════════════════════════════
// Allocation invariant
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn every_emitted_allocation_sums_to_one() {
    let mut policy = base_policy(RiskTolerance::Moderate);
    policy.preferences.themes = vec!["clean_energy".to_string()];
    let (events, outcome) = run_and_collect(&policy).await;
    assert!(outcome.is_some());

    let mut seen = 0;
    for event in &events {
        let allocations = match &event.kind {
            EventKind::CandidateCreated { allocations, .. } => allocations,
            EventKind::PortfolioUpdate { allocations, .. } => allocations,
            _ => continue,
        };
        seen += 1;
        let sum: f64 = allocations.values().sum();
        assert!(
            (sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE,
            "seq {} sums to {sum}",
            event.seq
        );
    }
    assert!(seen >= 4, "expected candidate and portfolio events");
}

// ═══════════════════════════════════════════════════════════════════════════
// Fork/join discipline
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn every_fork_has_exactly_one_later_matching_join() {
    let mut policy = base_policy(RiskTolerance::Conservative);
    policy.preferences.themes = vec!["infrastructure".to_string()];
    let (events, outcome) = run_and_collect(&policy).await;
    assert!(outcome.is_some());

    let forks: Vec<(&Event, &Vec<String>)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::BranchFork { branches, .. } => Some((e, branches)),
            _ => None,
        })
        .collect();
    assert!(forks.len() >= 2, "risk/return fork plus solver fork expected");

    for (fork, branches) in forks {
        let mut sorted_branches = branches.clone();
        sorted_branches.sort();
        let joins: Vec<&Event> = events
            .iter()
            .filter(|e| {
                e.seq > fork.seq
                    && matches!(&e.kind, EventKind::BranchJoin { branches: jb } if {
                        let mut jb = jb.clone();
                        jb.sort();
                        jb == sorted_branches
                    })
            })
            .collect();
        assert_eq!(joins.len(), 1, "fork at seq {} has {} joins", fork.seq, joins.len());

        // No member's span may still be open when the join is emitted.
        let join_seq = joins[0].seq;
        for branch in branches {
            let ended = events.iter().any(|e| {
                e.seq > fork.seq
                    && e.seq < join_seq
                    && matches!(&e.kind, EventKind::SpanEnded { agent_id, .. } if agent_id == branch)
            });
            let is_agent_branch = events.iter().any(|e| {
                matches!(&e.kind, EventKind::SpanStarted { agent_id, .. } if agent_id == branch)
            });
            if is_agent_branch {
                assert!(ended, "join at {join_seq} precedes span.ended of {branch}");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Repair
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn infeasible_aggressive_policy_is_repaired_within_bound() {
    let mut policy = base_policy(RiskTolerance::Aggressive);
    policy.risk.max_volatility_pct = Some(6.0);
    let (events, outcome) = run_and_collect(&policy).await;
    let outcome = outcome.expect("repair should restore feasibility");
    assert_eq!(outcome.winner.id, "cand-1");

    let injections = events
        .iter()
        .filter(|e| {
            matches!(&e.kind, EventKind::Decision { decision: DecisionKind::InjectAgent, .. })
        })
        .count();
    assert_eq!(injections, 1);

    let iterations: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::RepairStarted { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert!(iterations.len() <= 2);
    assert_eq!(iterations.last(), Some(&2), "6% needs two relaxation steps");

    let last_repair_success = events.iter().rev().find_map(|e| match &e.kind {
        EventKind::RepairEnded { success, .. } => Some(*success),
        _ => None,
    });
    assert_eq!(last_repair_success, Some(true));
}

#[tokio::test]
async fn repair_exhaustion_fails_the_run() {
    let mut policy = base_policy(RiskTolerance::VeryAggressive);
    policy.risk.max_volatility_pct = Some(4.0);
    let engine = engine();
    let err = engine.run(&policy).await.unwrap_err();
    assert!(matches!(err, EngineError::RepairExhausted { iterations: 2 }));

    let events = engine.into_sink().collected().await;
    let last = events.last().unwrap();
    assert!(matches!(last.kind, EventKind::RunFailed { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::StageFailed { stage_id, .. } if stage_id == "repair")));
    let repair_starts = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::RepairStarted { .. }))
        .count();
    assert_eq!(repair_starts, 2);
}

// ═══════════════════════════════════════════════════════════════════════════
// Selection
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn winner_is_highest_sharpe_among_passed() {
    let mut policy = base_policy(RiskTolerance::Moderate);
    policy.preferences.themes = vec!["clean_energy".to_string()];
    let (events, outcome) = run_and_collect(&policy).await;
    let outcome = outcome.unwrap();

    let best_sharpe = outcome
        .candidates
        .iter()
        .map(|c| c.metrics.sharpe)
        .fold(f64::MIN, f64::max);
    assert_eq!(outcome.winner.metrics.sharpe, best_sharpe);

    let selected_id = events.iter().find_map(|e| match &e.kind {
        EventKind::Decision {
            decision: DecisionKind::SelectCandidate,
            selected_candidate_id,
            ..
        } => selected_candidate_id.clone(),
        _ => None,
    });
    assert_eq!(selected_id.as_deref(), Some(outcome.winner.id.as_str()));

    // Final portfolio.update mirrors the winner and is not intermediate.
    let final_update = events.iter().rev().find_map(|e| match &e.kind {
        EventKind::PortfolioUpdate {
            candidate_id,
            is_intermediate,
            ..
        } => Some((candidate_id.clone(), *is_intermediate)),
        _ => None,
    });
    assert_eq!(
        final_update,
        Some((Some(outcome.winner.id.clone()), false))
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Conservative stress behavior
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tight_conservative_bound_breaches_stress_without_injection() {
    let mut policy = base_policy(RiskTolerance::Conservative);
    policy.risk.max_volatility_pct = Some(8.0);
    policy.preferences.themes = vec!["income".to_string()];
    let (events, outcome) = run_and_collect(&policy).await;
    let outcome = outcome.expect("a low-volatility challenger should survive");

    // At least one candidate breaches the stress gate.
    let stress_failures: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::GateStress(g) if !g.passed))
        .collect();
    assert!(!stress_failures.is_empty());

    // Tight conservative bounds are a gate concern, never an injection.
    assert!(!events.iter().any(|e| {
        matches!(&e.kind, EventKind::Decision { decision: DecisionKind::InjectAgent, .. })
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e.kind, EventKind::RepairStarted { .. })));

    assert_eq!(outcome.winner.solver, "risk_parity");
}

#[tokio::test]
async fn failed_candidate_stops_at_first_failing_gate() {
    let mut policy = base_policy(RiskTolerance::Conservative);
    policy.risk.max_volatility_pct = Some(8.0);
    policy.preferences.themes = vec!["income".to_string()];
    policy.benchmark.rebalance_cadence = Some(tiller_core::RebalanceCadence::Monthly);
    let (events, _) = run_and_collect(&policy).await;

    let failed_id = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::GateStress(g) if !g.passed => Some(g.candidate_id.clone()),
            _ => None,
        })
        .expect("a stress failure");

    // The liquidity gate never runs for a candidate that failed stress.
    assert!(!events.iter().any(|e| {
        matches!(&e.kind, EventKind::GateLiquidity(g) if g.candidate_id == failed_id)
    }));

    // The failure update names the responsible gate explicitly.
    let gate = events.iter().find_map(|e| match &e.kind {
        EventKind::CandidateUpdated {
            candidate_id,
            status: tiller_core::CandidateStatus::Failed,
            gate,
            ..
        } if *candidate_id == failed_id => Some(*gate),
        _ => None,
    });
    assert_eq!(gate, Some(Some(tiller_core::GateType::Stress)));
}
