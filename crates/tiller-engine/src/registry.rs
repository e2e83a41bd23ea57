//! Agent catalog.
//!
//! The registry is an immutable, injected catalog of agent definitions.
//! Core agents always run; conditional agents carry a [`Predicate`] over
//! the policy; injectable agents are never compiled into a plan and enter
//! a run only through a runtime decision.

use serde::{Deserialize, Serialize};
use tiller_core::{Policy, RiskTolerance};

/// Maximum-volatility bound below which stress analysis is considered
/// necessary regardless of risk bucket.
const TIGHT_VOLATILITY_PCT: f64 = 10.0;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Workflow stages, in fixed topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PolicyParsing,
    MarketData,
    DataQuality,
    /// Risk and return analysis run as parallel branches of this stage.
    RiskReturn,
    RiskOverlay,
    Optimization,
    GateValidation,
    Repair,
    RebalancePlanning,
    Explanation,
    Audit,
}

impl Stage {
    /// Every stage in execution order.
    pub fn ordered() -> [Stage; 11] {
        [
            Stage::PolicyParsing,
            Stage::MarketData,
            Stage::DataQuality,
            Stage::RiskReturn,
            Stage::RiskOverlay,
            Stage::Optimization,
            Stage::GateValidation,
            Stage::Repair,
            Stage::RebalancePlanning,
            Stage::Explanation,
            Stage::Audit,
        ]
    }

    /// Stable identifier used in stage events.
    pub fn id(self) -> &'static str {
        match self {
            Stage::PolicyParsing => "policy_parsing",
            Stage::MarketData => "market_data",
            Stage::DataQuality => "data_quality",
            Stage::RiskReturn => "risk_return",
            Stage::RiskOverlay => "risk_overlay",
            Stage::Optimization => "optimization",
            Stage::GateValidation => "gate_validation",
            Stage::Repair => "repair",
            Stage::RebalancePlanning => "rebalance_planning",
            Stage::Explanation => "explanation",
            Stage::Audit => "audit",
        }
    }

    /// Human-readable name used in stage events.
    pub fn display_name(self) -> &'static str {
        match self {
            Stage::PolicyParsing => "Policy Parsing",
            Stage::MarketData => "Market Data",
            Stage::DataQuality => "Data Quality",
            Stage::RiskReturn => "Risk & Return Analysis",
            Stage::RiskOverlay => "Risk Overlay",
            Stage::Optimization => "Optimization",
            Stage::GateValidation => "Gate Validation",
            Stage::Repair => "Constraint Repair",
            Stage::RebalancePlanning => "Rebalance Planning",
            Stage::Explanation => "Explanation",
            Stage::Audit => "Audit",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Inclusion condition for a conditional agent.
///
/// Evaluation returns `Option<bool>`: `None` means the policy lacks the
/// data the predicate needs, and the agent is excluded with reason
/// "insufficient policy data".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// ESG screening was requested.
    EsgEnabled,
    /// Conservative bucket, or a tight maximum-volatility bound.
    StressRelevant,
    /// Aggressive or very aggressive risk bucket.
    AggressiveRisk,
    /// Conservative risk bucket.
    ConservativeRisk,
    /// Monthly or quarterly rebalance cadence.
    FrequentRebalancing,
    /// At least one investment theme was expressed.
    HasThemes,
}

impl Predicate {
    /// Evaluate against a policy.  `None` when a required field is absent.
    pub fn evaluate(self, policy: &Policy) -> Option<bool> {
        match self {
            Predicate::EsgEnabled => Some(policy.preferences.esg),
            Predicate::StressRelevant => match policy.risk.risk_tolerance {
                RiskTolerance::Conservative => Some(true),
                _ => Some(
                    policy
                        .risk
                        .max_volatility_pct
                        .is_some_and(|v| v < TIGHT_VOLATILITY_PCT),
                ),
            },
            Predicate::AggressiveRisk => Some(matches!(
                policy.risk.risk_tolerance,
                RiskTolerance::Aggressive | RiskTolerance::VeryAggressive
            )),
            Predicate::ConservativeRisk => Some(matches!(
                policy.risk.risk_tolerance,
                RiskTolerance::Conservative
            )),
            Predicate::FrequentRebalancing => policy.frequent_rebalancing(),
            Predicate::HasThemes => Some(!policy.preferences.themes.is_empty()),
        }
    }

    /// One-sentence reason recorded in the plan, phrased per outcome.
    pub fn describe(self, included: bool) -> String {
        let (yes, no) = match self {
            Predicate::EsgEnabled => (
                "ESG screening requested in preferences",
                "no ESG screening requested",
            ),
            Predicate::StressRelevant => (
                "risk profile calls for scenario stress analysis",
                "risk bucket tolerates volatility; stress scenarios not required",
            ),
            Predicate::AggressiveRisk => (
                "aggressive risk bucket warrants adversarial review",
                "risk bucket below the adversarial-review threshold",
            ),
            Predicate::ConservativeRisk => (
                "conservative profile benefits from tail hedging",
                "tail hedging reserved for conservative profiles",
            ),
            Predicate::FrequentRebalancing => (
                "frequent rebalancing requires turnover and cost analysis",
                "annual cadence does not justify trade planning",
            ),
            Predicate::HasThemes => (
                "expressed themes justify a challenger optimization",
                "no themes expressed; single optimizer is sufficient",
            ),
        };
        if included { yes.to_string() } else { no.to_string() }
    }
}

// ---------------------------------------------------------------------------
// Agent definitions
// ---------------------------------------------------------------------------

/// How an agent enters a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    /// Always part of the plan.
    Core,
    /// Part of the plan when its predicate holds.
    Conditional,
    /// Never compiled into a plan; injected at runtime.
    Injectable,
}

/// One entry in the agent catalog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub category: AgentCategory,
    pub stage: Stage,
    pub predicate: Option<Predicate>,
    /// One line describing what the agent contributes, used as the span
    /// objective.
    pub objective: &'static str,
}

/// The immutable agent catalog for one engine instance.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
}

impl AgentRegistry {
    /// The standard Tiller catalog.
    pub fn standard() -> Self {
        use AgentCategory::{Conditional, Core, Injectable};
        let agents = vec![
            AgentDefinition {
                id: "policy_agent",
                name: "Policy Agent",
                category: Core,
                stage: Stage::PolicyParsing,
                predicate: None,
                objective: "parse and validate the investor policy",
            },
            AgentDefinition {
                id: "market_agent",
                name: "Market Agent",
                category: Core,
                stage: Stage::MarketData,
                predicate: None,
                objective: "assemble the investable universe and market inputs",
            },
            AgentDefinition {
                id: "data_quality_agent",
                name: "Data Quality Agent",
                category: Core,
                stage: Stage::DataQuality,
                predicate: None,
                objective: "score market data completeness and freshness",
            },
            AgentDefinition {
                id: "risk_agent",
                name: "Risk Agent",
                category: Core,
                stage: Stage::RiskReturn,
                predicate: None,
                objective: "estimate volatility, drawdown and tail risk",
            },
            AgentDefinition {
                id: "return_agent",
                name: "Return Agent",
                category: Core,
                stage: Stage::RiskReturn,
                predicate: None,
                objective: "estimate expected returns per asset class",
            },
            AgentDefinition {
                id: "esg_screening_agent",
                name: "ESG Screening Agent",
                category: Conditional,
                stage: Stage::RiskOverlay,
                predicate: Some(Predicate::EsgEnabled),
                objective: "screen the universe against ESG criteria",
            },
            AgentDefinition {
                id: "scenario_stress_agent",
                name: "Scenario Stress Agent",
                category: Conditional,
                stage: Stage::RiskOverlay,
                predicate: Some(Predicate::StressRelevant),
                objective: "project candidate behavior under stress scenarios",
            },
            AgentDefinition {
                id: "hedge_tail_agent",
                name: "Hedge & Tail Agent",
                category: Conditional,
                stage: Stage::RiskOverlay,
                predicate: Some(Predicate::ConservativeRisk),
                objective: "propose tail-risk hedges for the allocation",
            },
            AgentDefinition {
                id: "optimizer_agent",
                name: "Optimizer Agent",
                category: Core,
                stage: Stage::Optimization,
                predicate: None,
                objective: "produce a constraint-satisfying portfolio candidate",
            },
            AgentDefinition {
                id: "challenger_optimizer",
                name: "Challenger Optimizer",
                category: Conditional,
                stage: Stage::Optimization,
                predicate: Some(Predicate::HasThemes),
                objective: "generate challenger candidates with alternative solvers",
            },
            AgentDefinition {
                id: "red_team_agent",
                name: "Red Team Agent",
                category: Conditional,
                stage: Stage::GateValidation,
                predicate: Some(Predicate::AggressiveRisk),
                objective: "attack candidate portfolios for hidden weaknesses",
            },
            AgentDefinition {
                id: "liquidity_tc_agent",
                name: "Liquidity & Transaction Cost Agent",
                category: Conditional,
                stage: Stage::GateValidation,
                predicate: Some(Predicate::FrequentRebalancing),
                objective: "assess turnover, liquidity and trading costs",
            },
            AgentDefinition {
                id: "constraint_repair_agent",
                name: "Constraint Repair Agent",
                category: Injectable,
                stage: Stage::Repair,
                predicate: None,
                objective: "relax constraints minimally to restore feasibility",
            },
            AgentDefinition {
                id: "rebalance_planner",
                name: "Rebalance Planner",
                category: Conditional,
                stage: Stage::RebalancePlanning,
                predicate: Some(Predicate::FrequentRebalancing),
                objective: "lay out the trade schedule for the chosen cadence",
            },
            AgentDefinition {
                id: "explainer_agent",
                name: "Explainer Agent",
                category: Core,
                stage: Stage::Explanation,
                predicate: None,
                objective: "explain the selected portfolio in plain language",
            },
            AgentDefinition {
                id: "audit_agent",
                name: "Audit Agent",
                category: Core,
                stage: Stage::Audit,
                predicate: None,
                objective: "assemble the audit bundle for the run",
            },
        ];
        Self { agents }
    }

    pub fn all(&self) -> &[AgentDefinition] {
        &self.agents
    }

    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Agents that are always part of a plan.
    pub fn core(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents
            .iter()
            .filter(|a| a.category == AgentCategory::Core)
    }

    /// Agents gated on a policy predicate.
    pub fn conditional(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents
            .iter()
            .filter(|a| a.category == AgentCategory::Conditional)
    }

    /// Agents only ever added by a runtime decision.
    pub fn injectable(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents
            .iter()
            .filter(|a| a.category == AgentCategory::Injectable)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tiller_core::{
        BenchmarkSettings, Constraints, Policy, Preferences, RebalanceCadence, RiskAppetite,
        TimeHorizon,
    };

    fn policy(tolerance: RiskTolerance) -> Policy {
        Policy {
            risk: RiskAppetite {
                risk_tolerance: tolerance,
                max_volatility_pct: Some(15.0),
                max_drawdown_pct: Some(25.0),
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

    #[test]
    fn catalog_has_unique_ids() {
        let registry = AgentRegistry::standard();
        let mut ids: Vec<_> = registry.all().iter().map(|a| a.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), registry.all().len());
    }

    #[test]
    fn injectable_agents_have_no_predicate() {
        let registry = AgentRegistry::standard();
        for agent in registry.injectable() {
            assert!(agent.predicate.is_none(), "{} has a predicate", agent.id);
        }
    }

    #[test]
    fn stress_predicate_always_true_for_conservative() {
        let mut p = policy(RiskTolerance::Conservative);
        p.risk.max_volatility_pct = None;
        assert_eq!(Predicate::StressRelevant.evaluate(&p), Some(true));
    }

    #[test]
    fn stress_predicate_requires_tight_bound_for_aggressive() {
        let mut p = policy(RiskTolerance::Aggressive);
        assert_eq!(Predicate::StressRelevant.evaluate(&p), Some(false));
        p.risk.max_volatility_pct = Some(8.0);
        assert_eq!(Predicate::StressRelevant.evaluate(&p), Some(true));
    }

    #[test]
    fn cadence_predicate_undecidable_without_cadence() {
        let mut p = policy(RiskTolerance::Moderate);
        assert_eq!(Predicate::FrequentRebalancing.evaluate(&p), None);
        p.benchmark.rebalance_cadence = Some(RebalanceCadence::Monthly);
        assert_eq!(Predicate::FrequentRebalancing.evaluate(&p), Some(true));
        p.benchmark.rebalance_cadence = Some(RebalanceCadence::Annual);
        assert_eq!(Predicate::FrequentRebalancing.evaluate(&p), Some(false));
    }
}
