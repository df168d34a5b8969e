//! Goals, goal sets and validation results.
//!
//! This module is designed with formal verification in mind:
//! - Status changes are explicit, validated transitions
//! - Goal set invariants are enforced at construction
//! - Everything here is pure data; no IO

mod goal;
mod plan;
mod validation;

pub use goal::{Goal, GoalError, GoalId, GoalStatus};
pub use plan::{GoalDraft, GoalSet, PlanError, Strategy};
pub use validation::{ValidationDecision, ValidationResult};
