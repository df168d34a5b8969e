//! Validation gate verdicts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationDecision {
    Approve,
    /// Re-synthesize from the same evidence
    Revise,
    /// Go back to planning
    Retry,
    Fail,
}

impl ValidationDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidationDecision::Approve | ValidationDecision::Fail)
    }
}

/// Result of validating one synthesis.
///
/// # Invariants
/// - `confidence` is in `[0.0, 1.0]`
/// - `Approve` carries no issues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub decision: ValidationDecision,
    pub issues: Vec<String>,
    pub confidence: f64,
}

impl ValidationResult {
    pub fn approve(confidence: f64) -> Self {
        Self {
            decision: ValidationDecision::Approve,
            issues: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn with_decision(
        decision: ValidationDecision,
        issues: Vec<String>,
        confidence: f64,
    ) -> Self {
        Self {
            decision,
            issues,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}
