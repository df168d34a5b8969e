//! Errors that abort a turn.
//!
//! Anything recoverable (tool failures, guard denials, validation verdicts)
//! is handled inside the loop and ends up in the turn outcome instead.

use crate::agents::TurnState;
use crate::decision::DecisionError;
use crate::goal::GoalError;
use crate::state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Turn store error: {0}")]
    Store(String),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error(transparent)]
    Goal(#[from] GoalError),

    #[error("No goal set has been planned")]
    NoGoalSet,

    #[error("Invalid turn transition from {from:?} to {to:?}")]
    InvalidTransition { from: TurnState, to: TurnState },
}
