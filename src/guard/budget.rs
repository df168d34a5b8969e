//! Per-turn call budget.
//!
//! # Invariants
//! - `calls_made <= max_calls` (a call is only counted after it was allowed)
//! - `spent_cents <= max_cost_cents`

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counted resources for one turn.
///
/// # Design for Provability
/// All mutations go through methods that enforce invariants.
/// Direct field access is prevented (fields are private).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBudget {
    max_calls: u32,
    calls_made: u32,
    max_duration: Duration,
    max_cost_cents: u64,
    spent_cents: u64,
}

impl CallBudget {
    /// # Postconditions
    /// - `calls_made() == 0`
    /// - `spent_cents() == 0`
    pub fn new(max_calls: u32, max_duration: Duration, max_cost_cents: u64) -> Self {
        Self {
            max_calls,
            calls_made: 0,
            max_duration,
            max_cost_cents,
            spent_cents: 0,
        }
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub fn calls_made(&self) -> u32 {
        self.calls_made
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn max_cost_cents(&self) -> u64 {
        self.max_cost_cents
    }

    pub fn spent_cents(&self) -> u64 {
        self.spent_cents
    }

    /// # Property
    /// `remaining_calls() == max_calls - calls_made`
    pub fn remaining_calls(&self) -> u32 {
        self.max_calls.saturating_sub(self.calls_made)
    }

    pub fn calls_exhausted(&self) -> bool {
        self.calls_made >= self.max_calls
    }

    pub fn duration_exhausted(&self, elapsed: Duration) -> bool {
        elapsed >= self.max_duration
    }

    /// Check if we can afford a call of the given estimated cost.
    pub fn can_afford(&self, cost_cents: u64) -> bool {
        self.spent_cents.saturating_add(cost_cents) <= self.max_cost_cents
    }

    /// Record one dispatched call.
    ///
    /// # Errors
    /// Returns `Err` if the call or cost limit would be exceeded; nothing is
    /// recorded in that case.
    pub fn charge(&mut self, cost_cents: u64) -> Result<(), BudgetError> {
        if self.calls_exhausted() {
            return Err(BudgetError::CallsExhausted {
                max: self.max_calls,
            });
        }
        if !self.can_afford(cost_cents) {
            return Err(BudgetError::InsufficientBudget {
                needed: cost_cents,
                available: self.max_cost_cents.saturating_sub(self.spent_cents),
            });
        }
        self.calls_made += 1;
        self.spent_cents += cost_cents;
        Ok(())
    }
}

/// Errors related to budget operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error("All {max} tool calls for this turn are used")]
    CallsExhausted { max: u32 },

    #[error("Insufficient budget: need {needed} cents, have {available} cents")]
    InsufficientBudget { needed: u64, available: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_invariants() {
        let mut budget = CallBudget::new(2, Duration::from_secs(10), 5);

        budget.charge(3).unwrap();
        assert_eq!(budget.remaining_calls(), 1);
        assert_eq!(budget.spent_cents(), 3);

        // Can't overspend; nothing recorded on failure
        assert!(matches!(
            budget.charge(3),
            Err(BudgetError::InsufficientBudget { needed: 3, available: 2 })
        ));
        assert_eq!(budget.calls_made(), 1);

        budget.charge(2).unwrap();
        assert!(budget.calls_exhausted());
        assert_eq!(budget.charge(0), Err(BudgetError::CallsExhausted { max: 2 }));
        assert_eq!(budget.calls_made(), 2);
    }

    #[test]
    fn test_duration() {
        let budget = CallBudget::new(1, Duration::from_secs(10), 0);
        assert!(!budget.duration_exhausted(Duration::from_secs(9)));
        assert!(budget.duration_exhausted(Duration::from_secs(10)));
    }
}
