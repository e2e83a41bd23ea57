//! Bounded constraint repair.
//!
//! When optimization is infeasible the repair agent proposes minimal
//! constraint relaxations, one step per iteration, each recorded as an
//! explicit before/after delta.  The engine re-solves after every step and
//! stops at the first feasible solution or at the iteration bound.

use tiller_core::{ConstraintDelta, Policy};

/// How much one repair iteration loosens the volatility bound, in
/// percentage points.
const VOLATILITY_STEP_PCT: f64 = 2.0;

/// Propose the relaxations for one repair iteration against the current
/// working policy.  Empty when nothing relaxable remains.
pub fn propose_relaxation(policy: &Policy) -> Vec<ConstraintDelta> {
    let mut deltas = Vec::new();
    if let Some(before) = policy.risk.max_volatility_pct {
        deltas.push(ConstraintDelta {
            constraint: "risk.max_volatility_pct".to_string(),
            before,
            after: before + VOLATILITY_STEP_PCT,
            reason: "loosen the volatility bound one step toward feasibility".to_string(),
        });
    }
    deltas
}

/// Apply proposed deltas, producing the next working policy.
pub fn apply_relaxation(policy: &Policy, deltas: &[ConstraintDelta]) -> Policy {
    let mut relaxed = policy.clone();
    for delta in deltas {
        if delta.constraint == "risk.max_volatility_pct" {
            relaxed.risk.max_volatility_pct = Some(delta.after);
        }
    }
    relaxed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tiller_core::{
        BenchmarkSettings, Constraints, Preferences, RiskAppetite, RiskTolerance, TimeHorizon,
    };

    fn policy(max_vol: Option<f64>) -> Policy {
        Policy {
            risk: RiskAppetite {
                risk_tolerance: RiskTolerance::Aggressive,
                max_volatility_pct: max_vol,
                max_drawdown_pct: None,
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
    fn relaxation_steps_accumulate() {
        let p0 = policy(Some(6.0));
        let d1 = propose_relaxation(&p0);
        assert_eq!(d1.len(), 1);
        assert_eq!(d1[0].before, 6.0);
        assert_eq!(d1[0].after, 8.0);

        let p1 = apply_relaxation(&p0, &d1);
        let d2 = propose_relaxation(&p1);
        assert_eq!(d2[0].before, 8.0);
        assert_eq!(d2[0].after, 10.0);
    }

    #[test]
    fn nothing_to_relax_without_a_bound() {
        assert!(propose_relaxation(&policy(None)).is_empty());
    }
}
