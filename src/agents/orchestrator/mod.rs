//! Orchestration tier - planning and the turn state machine.

mod planner;
mod turn;

pub use planner::{PlanOutcome, Planner};
pub use turn::{TurnRunner, TurnState};
