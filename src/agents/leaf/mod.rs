//! Leaf components - the tiers that touch tools and evidence.
//!
//! - `Executor`: picks the next step for the active goal
//! - `Coordinator`: turns an instruction into one guarded tool call
//! - `ValidationGate`: judges a synthesis against the claims

mod coordinator;
mod executor;
mod verifier;

pub use coordinator::Coordinator;
pub use executor::Executor;
pub use verifier::ValidationGate;
