//! Validation gate - checks a synthesis against the turn's evidence.
//!
//! # Checks
//! - Unsupported: an assertion cites no known claim
//! - Fabricated: a URL or file path that no claim mentions verbatim
//! - Unaddressed: an achieved goal the synthesis does not address
//!
//! The gate is pure: it reads claims and counters, never the decision service.

use std::collections::HashSet;

use crate::config::ValidationConfig;
use crate::decision::Synthesis;
use crate::goal::{GoalId, ValidationDecision, ValidationResult};
use crate::state::{extract_references, Claim};

pub struct ValidationGate {
    config: ValidationConfig,
}

impl ValidationGate {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Judge one synthesis.
    ///
    /// `retries_done` and `revisions_done` count the RETRY and REVISE
    /// verdicts already acted on in this turn.
    ///
    /// # Postconditions
    /// - `APPROVE` iff no issue was found
    /// - `RETRY` is never returned once `retries_done >= max_retries`
    pub fn validate(
        &self,
        synthesis: &Synthesis,
        claims: &[Claim],
        achieved: &[GoalId],
        retries_done: u32,
        revisions_done: u32,
    ) -> ValidationResult {
        let known: HashSet<&str> = claims.iter().map(|c| c.id.as_str()).collect();

        let mut unsupported = Vec::new();
        let mut supported = 0usize;
        for assertion in &synthesis.assertions {
            if assertion.evidence.iter().any(|id| known.contains(id.as_str())) {
                supported += 1;
            } else {
                unsupported.push(format!("Unsupported assertion: {}", assertion.statement));
            }
        }

        let mut text = synthesis.text.clone();
        for assertion in &synthesis.assertions {
            text.push('\n');
            text.push_str(&assertion.statement);
        }
        let fabricated: Vec<String> = extract_references(&text)
            .into_iter()
            .filter(|r| !claims.iter().any(|c| c.mentions(r)))
            .map(|r| format!("Fabricated reference: {}", r))
            .collect();

        let unaddressed: Vec<String> = achieved
            .iter()
            .filter(|g| !synthesis.addressed_goals.contains(g))
            .map(|g| format!("Goal not addressed: {}", g))
            .collect();

        let confidence = if !fabricated.is_empty() {
            0.0
        } else if synthesis.assertions.is_empty() {
            1.0
        } else {
            supported as f64 / synthesis.assertions.len() as f64
        };

        let retry_or_fail = || {
            if retries_done >= self.config.max_retries {
                ValidationDecision::Fail
            } else {
                ValidationDecision::Retry
            }
        };

        let decision = if !fabricated.is_empty() {
            retry_or_fail()
        } else if !unsupported.is_empty() || !unaddressed.is_empty() {
            if revisions_done >= self.config.max_revisions {
                retry_or_fail()
            } else {
                ValidationDecision::Revise
            }
        } else {
            return ValidationResult::approve(confidence);
        };

        let issues: Vec<String> = fabricated
            .into_iter()
            .chain(unsupported)
            .chain(unaddressed)
            .collect();
        tracing::info!(decision = ?decision, issues = issues.len(), "Synthesis rejected");
        ValidationResult::with_decision(decision, issues, confidence)
    }
}
