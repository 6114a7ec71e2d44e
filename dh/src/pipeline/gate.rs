//! Quality gate stage
//!
//! Decides what happens to a batch given its quality evaluation and the
//! task's gate policy: pass it, pass it annotated, quarantine it, or
//! drop it.

use crate::domain::GatePolicy;
use crate::quality::EvaluationOutcome;

/// Gate verdict for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Quality acceptable; write the batch
    Pass,
    /// Below threshold but policy lets it through with issues attached
    PassWithIssues,
    /// Below threshold; rows are withheld and recorded as issues
    Quarantine,
    /// Below threshold; rows are discarded (still counted as skipped)
    Drop,
}

impl GateDecision {
    /// Whether the batch's rows continue to the write stage
    pub fn writes(&self) -> bool {
        matches!(self, GateDecision::Pass | GateDecision::PassWithIssues)
    }
}

/// Apply the gate policy to an evaluation outcome
pub fn decide(outcome: &EvaluationOutcome, threshold: f64, policy: GatePolicy) -> GateDecision {
    if outcome.passes(threshold) {
        return GateDecision::Pass;
    }
    match policy {
        GatePolicy::PassThrough => GateDecision::PassWithIssues,
        GatePolicy::Quarantine => GateDecision::Quarantine,
        GatePolicy::Drop => GateDecision::Drop,
    }
}
