//! Core Goal type.
//!
//! # Invariants
//! - `id` is unique within a goal set
//! - Status only moves forward: `Pending -> InProgress -> {Achieved, Blocked}`

use serde::{Deserialize, Serialize};

/// Identifier of a goal within a goal set (`g1`, `g2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(String);

impl GoalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GoalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GoalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of a goal in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> InProgress -> Achieved
///                      \-> Blocked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    #[default]
    Pending,
    InProgress,
    Achieved,
    Blocked,
}

impl GoalStatus {
    /// # Property
    /// `is_terminal() => allowed_next().is_empty()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Achieved | GoalStatus::Blocked)
    }

    pub fn allowed_next(&self) -> &'static [GoalStatus] {
        match self {
            GoalStatus::Pending => &[GoalStatus::InProgress],
            GoalStatus::InProgress => &[GoalStatus::Achieved, GoalStatus::Blocked],
            GoalStatus::Achieved | GoalStatus::Blocked => &[],
        }
    }
}

/// A unit of work the executor drives to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub description: String,
    #[serde(default)]
    pub status: GoalStatus,
    #[serde(default)]
    pub depends_on: Vec<GoalId>,
    /// Tools whose successful result is the evidence this goal needs; empty
    /// means any successful result issued for the goal
    #[serde(default)]
    pub evidence_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl Goal {
    pub fn new(id: impl Into<GoalId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: GoalStatus::Pending,
            depends_on: Vec::new(),
            evidence_tools: Vec::new(),
            blocked_reason: None,
        }
    }

    pub fn with_evidence_tool(mut self, tool: impl Into<String>) -> Self {
        self.evidence_tools.push(tool.into());
        self
    }

    /// Whether a successful result from `tool` counts as this goal's evidence.
    pub fn accepts_evidence_from(&self, tool: &str) -> bool {
        self.evidence_tools.is_empty() || self.evidence_tools.iter().any(|t| t == tool)
    }

    fn transition(&mut self, to: GoalStatus) -> Result<(), GoalError> {
        if self.status.allowed_next().contains(&to) {
            self.status = to;
            Ok(())
        } else {
            Err(GoalError::InvalidTransition {
                goal: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }

    /// # Precondition
    /// `self.status == Pending`
    pub fn start(&mut self) -> Result<(), GoalError> {
        self.transition(GoalStatus::InProgress)
    }

    /// # Precondition
    /// `self.status == InProgress`
    pub fn achieve(&mut self) -> Result<(), GoalError> {
        self.transition(GoalStatus::Achieved)
    }

    /// # Precondition
    /// `self.status == InProgress`
    pub fn block(&mut self, reason: impl Into<String>) -> Result<(), GoalError> {
        self.transition(GoalStatus::Blocked)?;
        self.blocked_reason = Some(reason.into());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GoalError {
    #[error("Goal {goal}: invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        goal: GoalId,
        from: GoalStatus,
        to: GoalStatus,
    },

    #[error("Goal {0} not found")]
    NotFound(GoalId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut goal = Goal::new("g1", "fetch the file");
        goal.start().unwrap();
        goal.achieve().unwrap();
        assert_eq!(goal.status, GoalStatus::Achieved);
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        let mut goal = Goal::new("g1", "fetch the file");
        assert!(goal.achieve().is_err());
        assert!(goal.block("nope").is_err());
        assert_eq!(goal.status, GoalStatus::Pending);

        goal.start().unwrap();
        goal.block("permission denied").unwrap();
        assert!(goal.start().is_err());
        assert!(goal.achieve().is_err());
        assert_eq!(goal.status, GoalStatus::Blocked);
        assert_eq!(goal.blocked_reason.as_deref(), Some("permission denied"));
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        for status in [
            GoalStatus::Pending,
            GoalStatus::InProgress,
            GoalStatus::Achieved,
            GoalStatus::Blocked,
        ] {
            assert_eq!(status.is_terminal(), status.allowed_next().is_empty());
        }
    }

    #[test]
    fn test_evidence_tools() {
        let any = Goal::new("g1", "look around");
        assert!(any.accepts_evidence_from("read_file"));

        let specific = Goal::new("g2", "edit").with_evidence_tool("write_file");
        assert!(specific.accepts_evidence_from("write_file"));
        assert!(!specific.accepts_evidence_from("read_file"));
    }
}
