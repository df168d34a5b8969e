//! Agents - the three tiers that drive a turn.
//!
//! # Tiers
//! - **Planner** (`orchestrator`): request to goal set, replans when blocked
//! - **Executor** (`leaf`): one goal at a time, one instruction at a time
//! - **Coordinator** (`leaf`): instruction to one guarded tool call
//!
//! The validation gate closes the loop between synthesis and the user.
//!
//! # Design Principles
//! - Tiers never call each other; the turn driver passes data between them
//! - Tool output reaches the upper tiers only as claims
//! - All per-turn mutable state lives in [`TurnContext`]

pub mod context;
pub mod leaf;
pub mod orchestrator;
pub mod types;

pub use context::TurnContext;
pub use orchestrator::{TurnRunner, TurnState};
pub use types::{
    BlockKind, BlockedReason, CoordinatorOutcome, ExecutionRecord, ExecutorDecision, Instruction,
    LogEntry, TurnOutcome, TurnReport, WorkflowStepInfo,
};
