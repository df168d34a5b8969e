//! # goalrunner
//!
//! Agent execution loop over an append-only turn document.
//!
//! This library provides:
//! - A three-tier loop (planner, executor, coordinator) driven by a turn
//!   state machine
//! - A tool registry whose dispatch never panics and never throws
//! - An execution guard that bounds calls, time and cost and refuses to
//!   repeat a call when nothing new was learned
//! - A validation gate that checks the final answer against the evidence
//!
//! ## Architecture
//!
//! ```text
//!            ┌───────────────────────────────┐
//!            │          TurnRunner           │
//!            │  (Planning → ... → Done)      │
//!            └───────┬───────────────┬───────┘
//!                    │               │
//!                    ▼               ▼
//!              ┌──────────┐   ┌────────────────┐
//!              │ Planner  │   │ ValidationGate │
//!              └──────────┘   └────────────────┘
//!                    │
//!                    ▼
//!              ┌──────────┐    ┌─────────────┐    ┌──────────────┐
//!              │ Executor │ ─► │ Coordinator │ ─► │ ToolRegistry │
//!              └──────────┘    └──────┬──────┘    └──────────────┘
//!                                     │
//!                          ExecutionGuard + WorkflowLibrary
//! ```
//!
//! Every phase writes its result as a section of the [`state::StateDocument`],
//! journaled through a [`store::TurnStore`].
//!
//! ## Modules
//! - `agents`: the tiers and the turn driver
//! - `decision`: the seam to the natural-language decision service
//! - `state`: the shared state document and claims
//! - `tools`: tool trait, registry and dispatch
//! - `guard`: per-turn budget and loop detection
//! - `workflow`: predefined tool sequences matched by trigger patterns
//! - `store`: turn persistence

pub mod agents;
pub mod config;
pub mod decision;
pub mod error;
pub mod goal;
pub mod guard;
pub mod state;
pub mod store;
pub mod tools;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use agents::{TurnReport, TurnRunner};
pub use config::Config;
pub use error::TurnError;
