//! Deterministic portfolio solvers.
//!
//! Solvers are opaque simulations: given a policy they produce an
//! allocation and metrics from risk-tolerance-keyed base tables, perturbed
//! per solver so challengers genuinely differ.  No randomness; the same
//! policy always yields the same candidate.

use std::collections::BTreeMap;

use tiller_core::{AssetClass, CandidateMetrics, Policy, RiskTolerance};

use crate::error::{EngineError, Result};

/// Solver catalog, in challenger fork order.
pub const SOLVER_NAMES: [&str; 3] = ["mean_variance", "black_litterman", "risk_parity"];

/// Annualized risk-free rate used in Sharpe computation, in percent.
const RISK_FREE_PCT: f64 = 2.0;

/// Below this maximum-volatility bound an aggressive mandate cannot be
/// satisfied on the first pass.
pub const FEASIBLE_VOLATILITY_FLOOR_PCT: f64 = 10.0;

/// What a solver returns for one candidate.
#[derive(Debug, Clone)]
pub struct SolverOutput {
    pub allocations: BTreeMap<String, f64>,
    pub metrics: CandidateMetrics,
}

/// Asset class of an instrument in the simulated universe.
pub fn asset_class_of(instrument: &str) -> Option<AssetClass> {
    match instrument {
        "US_EQUITY" | "INTL_EQUITY" => Some(AssetClass::Equity),
        "GOV_BONDS" | "CORP_BONDS" => Some(AssetClass::FixedIncome),
        "REAL_ESTATE" | "COMMODITIES" => Some(AssetClass::RealAssets),
        "CASH" => Some(AssetClass::Cash),
        _ => None,
    }
}

/// Run one solver against a policy.
///
/// Fails with [`EngineError::Infeasible`] when an aggressive mandate is
/// paired with a maximum-volatility bound below the feasibility floor.
/// Conservative mandates are always feasible.
pub fn solve(policy: &Policy, solver: &str) -> Result<SolverOutput> {
    if !SOLVER_NAMES.contains(&solver) {
        return Err(EngineError::UnknownSolver {
            name: solver.to_string(),
        });
    }

    let tolerance = policy.risk.risk_tolerance;
    let aggressive = matches!(
        tolerance,
        RiskTolerance::Aggressive | RiskTolerance::VeryAggressive
    );
    if aggressive {
        if let Some(max_vol) = policy.risk.max_volatility_pct {
            if max_vol < FEASIBLE_VOLATILITY_FLOOR_PCT {
                return Err(EngineError::Infeasible {
                    reason: format!(
                        "{tolerance} mandate incompatible with max volatility {max_vol:.1}%"
                    ),
                });
            }
        }
    }

    let mut allocations = base_allocation(tolerance);
    perturb(&mut allocations, solver);
    apply_exclusions(&mut allocations, &policy.preferences.exclusions);

    let metrics = metrics_for(tolerance, solver);
    Ok(SolverOutput {
        allocations,
        metrics,
    })
}

/// Risk-tolerance-keyed base allocation tables.  Weights sum to 1.0.
fn base_allocation(tolerance: RiskTolerance) -> BTreeMap<String, f64> {
    let rows: &[(&str, f64)] = match tolerance {
        RiskTolerance::Conservative => &[
            ("GOV_BONDS", 0.35),
            ("CORP_BONDS", 0.20),
            ("US_EQUITY", 0.15),
            ("INTL_EQUITY", 0.05),
            ("REAL_ESTATE", 0.05),
            ("CASH", 0.20),
        ],
        RiskTolerance::Moderate => &[
            ("US_EQUITY", 0.30),
            ("INTL_EQUITY", 0.15),
            ("GOV_BONDS", 0.20),
            ("CORP_BONDS", 0.15),
            ("REAL_ESTATE", 0.10),
            ("CASH", 0.10),
        ],
        RiskTolerance::Aggressive => &[
            ("US_EQUITY", 0.40),
            ("INTL_EQUITY", 0.25),
            ("GOV_BONDS", 0.10),
            ("CORP_BONDS", 0.05),
            ("REAL_ESTATE", 0.15),
            ("CASH", 0.05),
        ],
        RiskTolerance::VeryAggressive => &[
            ("US_EQUITY", 0.45),
            ("INTL_EQUITY", 0.30),
            ("REAL_ESTATE", 0.15),
            ("COMMODITIES", 0.05),
            ("CASH", 0.05),
        ],
    };
    rows.iter().map(|(k, w)| (k.to_string(), *w)).collect()
}

/// Per-solver tilt, weight-preserving: challengers shift a fixed slice
/// between bonds and equity so the candidates are genuinely distinct.
fn perturb(allocations: &mut BTreeMap<String, f64>, solver: &str) {
    const SHIFT: f64 = 0.03;
    match solver {
        "black_litterman" => shift_weight(allocations, "GOV_BONDS", "US_EQUITY", SHIFT),
        "risk_parity" => shift_weight(allocations, "US_EQUITY", "GOV_BONDS", SHIFT),
        _ => {}
    }
}

fn shift_weight(allocations: &mut BTreeMap<String, f64>, from: &str, to: &str, amount: f64) {
    let available = allocations.get(from).copied().unwrap_or(0.0);
    let moved = amount.min(available);
    if moved <= 0.0 || !allocations.contains_key(to) {
        return;
    }
    if let Some(w) = allocations.get_mut(from) {
        *w -= moved;
    }
    if let Some(w) = allocations.get_mut(to) {
        *w += moved;
    }
}

/// Drop excluded instruments and renormalize the remainder to 1.0.
fn apply_exclusions(allocations: &mut BTreeMap<String, f64>, exclusions: &[String]) {
    if exclusions.is_empty() {
        return;
    }
    allocations.retain(|instrument, _| !exclusions.iter().any(|e| e == instrument));
    let sum: f64 = allocations.values().sum();
    if sum > 0.0 {
        for w in allocations.values_mut() {
            *w /= sum;
        }
    }
}

fn metrics_for(tolerance: RiskTolerance, solver: &str) -> CandidateMetrics {
    let (expected_return_pct, volatility_pct) = match tolerance {
        RiskTolerance::Conservative => (5.2, 8.5),
        RiskTolerance::Moderate => (7.1, 12.0),
        RiskTolerance::Aggressive => (9.0, 16.5),
        RiskTolerance::VeryAggressive => (10.4, 20.5),
    };
    let (return_tilt, vol_tilt, turnover_pct) = match solver {
        "black_litterman" => (0.4, 0.8, 22.0),
        "risk_parity" => (-0.3, -1.2, 12.0),
        _ => (0.0, 0.0, 18.0),
    };
    let expected_return_pct = expected_return_pct + return_tilt;
    let volatility_pct = volatility_pct + vol_tilt;
    CandidateMetrics {
        expected_return_pct,
        volatility_pct,
        sharpe: (expected_return_pct - RISK_FREE_PCT) / volatility_pct,
        var_95_pct: volatility_pct * 1.65,
        turnover_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tiller_core::{
        BenchmarkSettings, Constraints, Preferences, RiskAppetite, TimeHorizon,
        WEIGHT_SUM_TOLERANCE,
    };

    fn policy(tolerance: RiskTolerance, max_vol: Option<f64>) -> Policy {
        Policy {
            risk: RiskAppetite {
                risk_tolerance: tolerance,
                max_volatility_pct: max_vol,
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
    fn weights_sum_to_one_for_every_table_and_solver() {
        for tolerance in [
            RiskTolerance::Conservative,
            RiskTolerance::Moderate,
            RiskTolerance::Aggressive,
            RiskTolerance::VeryAggressive,
        ] {
            for solver in SOLVER_NAMES {
                let out = solve(&policy(tolerance, None), solver).unwrap();
                let sum: f64 = out.allocations.values().sum();
                assert!(
                    (sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE,
                    "{tolerance} {solver} sums to {sum}"
                );
            }
        }
    }

    #[test]
    fn aggressive_with_tight_volatility_is_infeasible() {
        let err = solve(&policy(RiskTolerance::Aggressive, Some(8.0)), "mean_variance")
            .unwrap_err();
        assert!(matches!(err, EngineError::Infeasible { .. }));
    }

    #[test]
    fn conservative_never_infeasible() {
        assert!(solve(&policy(RiskTolerance::Conservative, Some(8.0)), "mean_variance").is_ok());
    }

    #[test]
    fn exclusions_are_honored_and_renormalized() {
        let mut p = policy(RiskTolerance::Moderate, None);
        p.preferences.exclusions = vec!["REAL_ESTATE".to_string()];
        let out = solve(&p, "mean_variance").unwrap();
        assert!(!out.allocations.contains_key("REAL_ESTATE"));
        let sum: f64 = out.allocations.values().sum();
        assert!((sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
    }

    #[test]
    fn solvers_produce_distinct_candidates() {
        let p = policy(RiskTolerance::Moderate, None);
        let mv = solve(&p, "mean_variance").unwrap();
        let bl = solve(&p, "black_litterman").unwrap();
        assert_ne!(mv.allocations, bl.allocations);
        assert_ne!(mv.metrics.sharpe, bl.metrics.sharpe);
    }

    #[test]
    fn unknown_solver_rejected() {
        let err = solve(&policy(RiskTolerance::Moderate, None), "genetic").unwrap_err();
        assert!(matches!(err, EngineError::UnknownSolver { .. }));
    }
}
