//! Shared state document - the append-only substrate of a turn.
//!
//! # Key Concepts
//! - Section: a named slice written once by the phase that owns it
//! - Entry: a record appended inside an open section (the execution log)
//! - Claim: an atomic, evidence-linked fact extracted from tool output
//!
//! # Invariants
//! - A finalized section is never mutated
//! - Entries are totally ordered by append time and never rewritten
//! - A section name is written at most once per turn

mod document;
pub mod evidence;

pub use document::{
    sections, Section, SectionEntry, SectionHandle, StateDocument, StateError, TurnDocument,
};
pub use evidence::{extract_references, Claim, ClaimExtractor, PayloadClaimExtractor};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    /// Create a new unique turn ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for TurnId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
