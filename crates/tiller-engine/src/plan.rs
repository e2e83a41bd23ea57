//! Plan compilation.
//!
//! The compiler turns a policy into an [`ExecutionPlan`]: which agents run,
//! which were considered and left out, and in what order.  Compilation is
//! pure and deterministic, and it cannot fail: missing policy data degrades
//! to an exclusion with a recorded reason, never an error.

use tracing::debug;

use tiller_core::Policy;

use crate::registry::{AgentDefinition, AgentRegistry, Stage};

/// Exclusion reason used when a predicate cannot be evaluated.
pub const INSUFFICIENT_POLICY_DATA: &str = "insufficient policy data";

/// An agent selected into the plan, with the reason it was included.
#[derive(Debug, Clone)]
pub struct PlannedAgent {
    pub agent: AgentDefinition,
    pub reason: String,
}

/// An agent considered and left out, with the reason.
#[derive(Debug, Clone)]
pub struct ExcludedAgent {
    pub agent: AgentDefinition,
    pub reason: String,
}

/// The compiled shape of one run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub selected: Vec<PlannedAgent>,
    pub excluded: Vec<ExcludedAgent>,
    /// Selected agents sorted by stage order; registry order breaks ties
    /// within a stage.
    pub execution_order: Vec<AgentDefinition>,
}

impl ExecutionPlan {
    /// Whether the named agent made it into the plan.
    pub fn is_selected(&self, agent_id: &str) -> bool {
        self.execution_order.iter().any(|a| a.id == agent_id)
    }

    /// Selected agents belonging to one stage, in execution order.
    pub fn agents_in_stage(&self, stage: Stage) -> Vec<&AgentDefinition> {
        self.execution_order
            .iter()
            .filter(|a| a.stage == stage)
            .collect()
    }

    /// Distinct stages that have at least one selected agent, in order.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ordered()
            .into_iter()
            .filter(|s| self.execution_order.iter().any(|a| a.stage == *s))
            .collect()
    }

    /// Whether candidate generation runs multiple solvers in parallel.
    pub fn multi_solver(&self) -> bool {
        self.is_selected("challenger_optimizer")
    }

    /// Exclusion reasons caused by missing policy fields.
    pub fn missing_data_exclusions(&self) -> Vec<&ExcludedAgent> {
        self.excluded
            .iter()
            .filter(|e| e.reason == INSUFFICIENT_POLICY_DATA)
            .collect()
    }
}

/// Compiles policies into execution plans against a fixed registry.
#[derive(Debug, Clone)]
pub struct PlanCompiler {
    registry: AgentRegistry,
}

impl PlanCompiler {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }

    /// Compile a plan.  Deterministic: structurally equal policies yield
    /// identical plans.
    pub fn compile(&self, policy: &Policy) -> ExecutionPlan {
        let mut selected = Vec::new();
        let mut excluded = Vec::new();

        for agent in self.registry.core() {
            selected.push(PlannedAgent {
                agent: *agent,
                reason: "core agent; always part of the workflow".to_string(),
            });
        }

        for agent in self.registry.conditional() {
            // Conditional agents always carry a predicate.
            let Some(predicate) = agent.predicate else {
                continue;
            };
            match predicate.evaluate(policy) {
                Some(true) => selected.push(PlannedAgent {
                    agent: *agent,
                    reason: predicate.describe(true),
                }),
                Some(false) => excluded.push(ExcludedAgent {
                    agent: *agent,
                    reason: predicate.describe(false),
                }),
                None => excluded.push(ExcludedAgent {
                    agent: *agent,
                    reason: INSUFFICIENT_POLICY_DATA.to_string(),
                }),
            }
        }

        let mut execution_order: Vec<AgentDefinition> =
            selected.iter().map(|p| p.agent).collect();
        execution_order.sort_by_key(|a| a.stage);

        debug!(
            selected = execution_order.len(),
            excluded = excluded.len(),
            "compiled execution plan"
        );

        ExecutionPlan {
            selected,
            excluded,
            execution_order,
        }
    }
}
