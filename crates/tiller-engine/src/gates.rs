//! Gate evaluators.
//!
//! Each gate is a pure function over `(candidate, policy)`.  Gate failure
//! is a first-class outcome, not an error: the evaluator always returns a
//! [`GateOutcome`] and the engine decides what a failure means for the
//! candidate.  Order is fixed (compliance, stress, redteam, liquidity) and
//! evaluation is fail-fast per candidate, independent across candidates.

use std::collections::BTreeMap;

use tiller_core::{
    AssetClass, Candidate, GateDetail, GateType, Policy, ScenarioImpact, Severity,
};

use crate::solver::asset_class_of;

/// Turnover above this fraction of the portfolio fails the liquidity gate.
const TURNOVER_THRESHOLD_PCT: f64 = 25.0;

/// Estimated slippage per unit of turnover.
const SLIPPAGE_BPS_PER_TURNOVER_PCT: f64 = 1.2;

/// Single-position weight that counts as a concentration finding.
const CONCENTRATION_MEDIUM: f64 = 0.35;

/// Single-position weight the red team treats as disqualifying.
const CONCENTRATION_HIGH: f64 = 0.45;

/// What one gate concluded about one candidate.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub passed: bool,
    pub issues: Vec<String>,
    pub detail: GateDetail,
}

/// Evaluate one gate.
pub fn evaluate(gate: GateType, candidate: &Candidate, policy: &Policy) -> GateOutcome {
    match gate {
        GateType::Compliance => evaluate_compliance(candidate, policy),
        GateType::Stress => evaluate_stress(candidate, policy),
        GateType::Redteam => evaluate_redteam(candidate, policy),
        GateType::Liquidity => evaluate_liquidity(candidate, policy),
    }
}

// ---------------------------------------------------------------------------
// Compliance
// ---------------------------------------------------------------------------

/// Mandatory gate: hard constraints from the policy.
pub fn evaluate_compliance(candidate: &Candidate, policy: &Policy) -> GateOutcome {
    let mut violations = Vec::new();

    for (instrument, weight) in &candidate.allocations {
        if *weight > policy.constraints.max_single_position {
            violations.push(format!(
                "{instrument} weight {:.1}% exceeds single-position cap {:.1}%",
                weight * 100.0,
                policy.constraints.max_single_position * 100.0
            ));
        }
        if policy.preferences.exclusions.iter().any(|e| e == instrument) {
            violations.push(format!("{instrument} appears despite exclusion"));
        }
    }

    let by_class = class_weights(&candidate.allocations);
    for (class, band) in &policy.constraints.bands {
        let weight = by_class.get(class).copied().unwrap_or(0.0);
        if !band.contains(weight) {
            violations.push(format!(
                "{class:?} weight {:.1}% outside band [{:.1}%, {:.1}%]",
                weight * 100.0,
                band.min * 100.0,
                band.max * 100.0
            ));
        }
    }

    if candidate.allocations.len() < policy.constraints.min_position_count {
        violations.push(format!(
            "{} positions below minimum of {}",
            candidate.allocations.len(),
            policy.constraints.min_position_count
        ));
    }

    GateOutcome {
        passed: violations.is_empty(),
        issues: violations.clone(),
        detail: GateDetail::Compliance { violations },
    }
}

// ---------------------------------------------------------------------------
// Stress
// ---------------------------------------------------------------------------

/// Fixed stress scenarios: a scenario breaches when its projected drawdown
/// exceeds the policy's maximum drawdown, or when the candidate's
/// volatility exceeds the maximum-volatility bound.  The gate fails when
/// any scenario breaches.
pub fn evaluate_stress(candidate: &Candidate, policy: &Policy) -> GateOutcome {
    let by_class = class_weights(&candidate.allocations);
    let weight = |class: AssetClass| by_class.get(&class).copied().unwrap_or(0.0);

    let projections = [
        (
            "equity crash -20%",
            -(weight(AssetClass::Equity) * 20.0 + weight(AssetClass::RealAssets) * 10.0),
        ),
        (
            "rate spike +200bp",
            -(weight(AssetClass::FixedIncome) * 12.0),
        ),
        (
            "inflation surge",
            -(weight(AssetClass::FixedIncome) * 8.0 + weight(AssetClass::Cash) * 5.0),
        ),
    ];

    let volatility_breach = policy
        .risk
        .max_volatility_pct
        .is_some_and(|max| candidate.metrics.volatility_pct > max);

    let mut issues = Vec::new();
    let scenarios: Vec<ScenarioImpact> = projections
        .iter()
        .map(|(scenario, impact_pct)| {
            let drawdown_breach = policy
                .risk
                .max_drawdown_pct
                .is_some_and(|max| -impact_pct > max);
            let breached = drawdown_breach || volatility_breach;
            if breached {
                issues.push(format!(
                    "{scenario}: projected impact {impact_pct:.1}% breaches policy limits"
                ));
            }
            ScenarioImpact {
                scenario: scenario.to_string(),
                impact_pct: *impact_pct,
                breached,
            }
        })
        .collect();

    let breaches = scenarios.iter().filter(|s| s.breached).count() as u32;
    GateOutcome {
        passed: breaches == 0,
        issues,
        detail: GateDetail::Stress { scenarios, breaches },
    }
}

// ---------------------------------------------------------------------------
// Red team
// ---------------------------------------------------------------------------

/// Adversarial review: concentration and robustness findings with a
/// severity.  Fails only on a High-severity finding.
pub fn evaluate_redteam(candidate: &Candidate, _policy: &Policy) -> GateOutcome {
    let mut findings = Vec::new();
    let mut severity = Severity::Low;
    let bump = |s: Severity, severity: &mut Severity| {
        if s > *severity {
            *severity = s;
        }
    };

    for (instrument, weight) in &candidate.allocations {
        if *weight > CONCENTRATION_HIGH {
            findings.push(format!(
                "critical concentration: {instrument} at {:.1}%",
                weight * 100.0
            ));
            bump(Severity::High, &mut severity);
        } else if *weight > CONCENTRATION_MEDIUM {
            findings.push(format!(
                "elevated concentration: {instrument} at {:.1}%",
                weight * 100.0
            ));
            bump(Severity::Medium, &mut severity);
        }
    }
    if candidate.allocations.len() < 4 {
        findings.push("limited diversification across positions".to_string());
        bump(Severity::Medium, &mut severity);
    }
    if candidate.metrics.volatility_pct > 18.0 {
        findings.push(format!(
            "volatility {:.1}% leaves little margin under shocks",
            candidate.metrics.volatility_pct
        ));
        bump(Severity::Medium, &mut severity);
    }

    let passed = severity < Severity::High;
    GateOutcome {
        passed,
        issues: if passed { Vec::new() } else { findings.clone() },
        detail: GateDetail::Redteam { severity, findings },
    }
}

// ---------------------------------------------------------------------------
// Liquidity
// ---------------------------------------------------------------------------

/// Turnover versus threshold plus a slippage estimate.
pub fn evaluate_liquidity(candidate: &Candidate, _policy: &Policy) -> GateOutcome {
    let turnover_pct = candidate.metrics.turnover_pct;
    let slippage_bps = turnover_pct * SLIPPAGE_BPS_PER_TURNOVER_PCT;
    let passed = turnover_pct <= TURNOVER_THRESHOLD_PCT;
    let issues = if passed {
        Vec::new()
    } else {
        vec![format!(
            "turnover {turnover_pct:.1}% exceeds {TURNOVER_THRESHOLD_PCT:.0}% threshold"
        )]
    };
    GateOutcome {
        passed,
        issues,
        detail: GateDetail::Liquidity {
            turnover_pct,
            threshold_pct: TURNOVER_THRESHOLD_PCT,
            slippage_bps,
        },
    }
}

fn class_weights(allocations: &BTreeMap<String, f64>) -> BTreeMap<AssetClass, f64> {
    let mut by_class = BTreeMap::new();
    for (instrument, weight) in allocations {
        if let Some(class) = asset_class_of(instrument) {
            *by_class.entry(class).or_insert(0.0) += weight;
        }
    }
    by_class
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::{
        AllocationBand, BenchmarkSettings, CandidateMetrics, Constraints, Preferences,
        RiskAppetite, RiskTolerance, TimeHorizon,
    };

    fn policy() -> Policy {
        Policy {
            risk: RiskAppetite {
                risk_tolerance: RiskTolerance::Conservative,
                max_volatility_pct: Some(8.0),
                max_drawdown_pct: Some(10.0),
                time_horizon: TimeHorizon::Medium,
            },
            constraints: Constraints {
                bands: BTreeMap::from([(
                    AssetClass::Equity,
                    AllocationBand::new(0.0, 0.5),
                )]),
                max_single_position: 0.40,
                min_position_count: 3,
            },
            preferences: Preferences::default(),
            benchmark: BenchmarkSettings::default(),
        }
    }

    fn candidate(allocations: &[(&str, f64)], volatility: f64, turnover: f64) -> Candidate {
        Candidate::new(
            "cand-1",
            "mean_variance",
            allocations
                .iter()
                .map(|(k, w)| (k.to_string(), *w))
                .collect(),
            CandidateMetrics {
                expected_return_pct: 5.0,
                volatility_pct: volatility,
                sharpe: 0.35,
                var_95_pct: volatility * 1.65,
                turnover_pct: turnover,
            },
        )
    }

    #[test]
    fn compliance_flags_single_position_cap() {
        let c = candidate(&[("US_EQUITY", 0.55), ("GOV_BONDS", 0.45)], 8.0, 10.0);
        let outcome = evaluate_compliance(&c, &policy());
        assert!(!outcome.passed);
        assert!(outcome.issues.iter().any(|i| i.contains("US_EQUITY")));
    }

    #[test]
    fn compliance_flags_excluded_instrument() {
        let mut p = policy();
        p.preferences.exclusions = vec!["COMMODITIES".to_string()];
        let c = candidate(
            &[("US_EQUITY", 0.3), ("GOV_BONDS", 0.4), ("COMMODITIES", 0.3)],
            8.0,
            10.0,
        );
        assert!(!evaluate_compliance(&c, &p).passed);
    }

    #[test]
    fn compliance_passes_clean_candidate() {
        let c = candidate(
            &[("US_EQUITY", 0.3), ("GOV_BONDS", 0.4), ("CASH", 0.3)],
            8.0,
            10.0,
        );
        assert!(evaluate_compliance(&c, &policy()).passed);
    }

    #[test]
    fn stress_breaches_on_tight_volatility_bound() {
        // Conservative with max volatility 8: candidate volatility 8.5
        // breaches every scenario.
        let c = candidate(
            &[("US_EQUITY", 0.2), ("GOV_BONDS", 0.55), ("CASH", 0.25)],
            8.5,
            10.0,
        );
        let outcome = evaluate_stress(&c, &policy());
        assert!(!outcome.passed);
        match outcome.detail {
            GateDetail::Stress { breaches, .. } => assert!(breaches >= 1),
            other => panic!("unexpected detail: {other:?}"),
        }
    }

    #[test]
    fn stress_passes_under_the_bound() {
        let c = candidate(
            &[("US_EQUITY", 0.2), ("GOV_BONDS", 0.55), ("CASH", 0.25)],
            7.3,
            10.0,
        );
        assert!(evaluate_stress(&c, &policy()).passed);
    }

    #[test]
    fn redteam_fails_only_on_high_severity() {
        let medium = candidate(
            &[("US_EQUITY", 0.38), ("GOV_BONDS", 0.32), ("CASH", 0.30)],
            12.0,
            10.0,
        );
        let outcome = evaluate_redteam(&medium, &policy());
        assert!(outcome.passed);
        match outcome.detail {
            GateDetail::Redteam { severity, .. } => assert_eq!(severity, Severity::Medium),
            other => panic!("unexpected detail: {other:?}"),
        }

        let high = candidate(&[("US_EQUITY", 0.5), ("GOV_BONDS", 0.5)], 12.0, 10.0);
        assert!(!evaluate_redteam(&high, &policy()).passed);
    }

    #[test]
    fn liquidity_threshold() {
        let ok = candidate(&[("US_EQUITY", 0.5), ("GOV_BONDS", 0.5)], 10.0, 18.0);
        assert!(evaluate_liquidity(&ok, &policy()).passed);
        let heavy = candidate(&[("US_EQUITY", 0.5), ("GOV_BONDS", 0.5)], 10.0, 30.0);
        assert!(!evaluate_liquidity(&heavy, &policy()).passed);
    }
}
