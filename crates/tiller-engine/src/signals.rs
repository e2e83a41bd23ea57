//! Runtime signals.
//!
//! A scratchpad of facts the engine accumulates as stages complete.  The
//! injection logic reads it to decide whether the repair agent enters the
//! run.  Signals are reflected into events where relevant and never
//! persisted on their own.

use tiller_core::Severity;

/// Mutable run-scoped observations.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSignals {
    /// The optimizer could not satisfy the constraints as written.
    pub infeasible: bool,
    /// Highest turnover seen across candidates, in percent.
    pub turnover_pct: f64,
    /// Candidates that failed the compliance gate.
    pub compliance_failures: u32,
    /// Stress-scenario breaches across all candidates.
    pub stress_breaches: u32,
    /// Worst red-team severity observed, if that gate ran.
    pub redteam_severity: Option<Severity>,
    /// Data quality score in [0, 1] from the data quality stage.
    pub data_quality_score: f64,
    /// Policy fields whose absence excluded an agent at compile time.
    pub missing_fields: Vec<String>,
}

impl RuntimeSignals {
    /// Record a red-team severity, keeping the worst seen.
    pub fn observe_redteam(&mut self, severity: Severity) {
        self.redteam_severity = Some(match self.redteam_severity {
            Some(current) if current >= severity => current,
            _ => severity,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redteam_severity_keeps_worst() {
        let mut signals = RuntimeSignals::default();
        signals.observe_redteam(Severity::Medium);
        signals.observe_redteam(Severity::Low);
        assert_eq!(signals.redteam_severity, Some(Severity::Medium));
        signals.observe_redteam(Severity::High);
        assert_eq!(signals.redteam_severity, Some(Severity::High));
    }
}
