//! Engine configuration.
//!
//! Loadable from TOML; every field has a sensible default so an empty file
//! is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::solver::SOLVER_NAMES;

/// Runtime knobs for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on constraint-repair iterations per run.
    pub max_repair_iterations: u32,
    /// Solvers used for candidate generation, in fork order.  The first
    /// entry is the primary solver when no challenger runs.
    pub solver_names: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_repair_iterations: 2,
            solver_names: SOLVER_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML document and validate.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_repair_iterations == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max_repair_iterations must be at least 1".to_string(),
            });
        }
        if self.solver_names.is_empty() {
            return Err(EngineError::InvalidConfig {
                reason: "solver_names must not be empty".to_string(),
            });
        }
        for name in &self.solver_names {
            if !SOLVER_NAMES.contains(&name.as_str()) {
                return Err(EngineError::UnknownSolver { name: name.clone() });
            }
        }
        Ok(())
    }

    /// The solver used when the plan calls for a single candidate.
    pub fn primary_solver(&self) -> &str {
        &self.solver_names[0]
    }
}
