//! Investor policy model.
//!
//! A [`Policy`] is the immutable input to one workflow run.  It is produced
//! upstream (elicitation is out of scope) and consumed by the plan compiler,
//! the solvers, and the gate evaluators.  Fields that elicitation may not
//! have produced are `Option`; an inclusion predicate over a missing field
//! cannot be evaluated and the affected agent is excluded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Investor risk tolerance bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
    VeryAggressive,
}

impl std::fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::VeryAggressive => "very_aggressive",
        };
        write!(f, "{s}")
    }
}

/// Investment time horizon bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    /// Under 3 years.
    Short,
    /// 3 to 10 years.
    Medium,
    /// Over 10 years.
    Long,
}

/// How often the portfolio is rebalanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceCadence {
    Monthly,
    Quarterly,
    Annual,
}

/// Broad asset classes used for allocation bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    FixedIncome,
    RealAssets,
    Cash,
}

/// Minimum and maximum weight for one asset class, as fractions of the
/// portfolio (0.0 to 1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationBand {
    pub min: f64,
    pub max: f64,
}

impl AllocationBand {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Whether `weight` falls inside this band (inclusive).
    pub fn contains(&self, weight: f64) -> bool {
        weight >= self.min && weight <= self.max
    }
}

/// Risk appetite section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAppetite {
    pub risk_tolerance: RiskTolerance,
    /// Maximum acceptable annualized volatility, in percent.
    pub max_volatility_pct: Option<f64>,
    /// Maximum acceptable peak-to-trough drawdown, in percent.
    pub max_drawdown_pct: Option<f64>,
    pub time_horizon: TimeHorizon,
}

/// Hard allocation constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Per-asset-class min/max bands.
    #[serde(default)]
    pub bands: BTreeMap<AssetClass, AllocationBand>,
    /// Largest weight any single position may hold (fraction, 0.0 to 1.0).
    pub max_single_position: f64,
    /// Minimum number of distinct positions.
    pub min_position_count: usize,
}

/// Soft preferences that tilt but do not bind the optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Preferences {
    #[serde(default)]
    pub esg: bool,
    /// Instruments that must not appear in any candidate.
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Investment themes the investor wants expressed.
    #[serde(default)]
    pub themes: Vec<String>,
    /// Desired overweight to domestic assets, in percent.
    #[serde(default)]
    pub home_bias_pct: Option<f64>,
}

/// Benchmark and cadence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BenchmarkSettings {
    #[serde(default)]
    pub target_return_pct: Option<f64>,
    #[serde(default)]
    pub rebalance_cadence: Option<RebalanceCadence>,
}

/// The investor policy: the single immutable input to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub risk: RiskAppetite,
    pub constraints: Constraints,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
}

impl Policy {
    /// Structural validation run before a policy enters the engine.
    ///
    /// Compilation itself cannot fail; this catches inputs that are
    /// internally contradictory rather than merely incomplete.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.constraints.max_single_position)
            || self.constraints.max_single_position == 0.0
        {
            return Err(CoreError::InvalidPolicy {
                reason: format!(
                    "max_single_position must be in (0, 1], got {}",
                    self.constraints.max_single_position
                ),
            });
        }
        for (class, band) in &self.constraints.bands {
            if band.min > band.max || band.min < 0.0 || band.max > 1.0 {
                return Err(CoreError::InvalidPolicy {
                    reason: format!("allocation band for {class:?} is not ordered: {band:?}"),
                });
            }
        }
        if let Some(v) = self.risk.max_volatility_pct {
            if v <= 0.0 {
                return Err(CoreError::InvalidPolicy {
                    reason: format!("max_volatility_pct must be positive, got {v}"),
                });
            }
        }
        Ok(())
    }

    /// Whether the rebalance cadence calls for trade planning.
    pub fn frequent_rebalancing(&self) -> Option<bool> {
        self.benchmark.rebalance_cadence.map(|c| {
            matches!(c, RebalanceCadence::Monthly | RebalanceCadence::Quarterly)
        })
    }
}
