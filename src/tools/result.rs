//! Calls, results and the execution modes that gate them.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::goal::GoalId;

/// One request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    pub issued_by_goal_id: GoalId,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, args: Value, goal: GoalId) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            issued_by_goal_id: goal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    RequiresApproval,
    /// Never dispatched (guard denial)
    Skipped,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::RequiresApproval => "requires_approval",
            ToolStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ToolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ToolStatus::Success),
            "error" => Ok(ToolStatus::Error),
            "requires_approval" => Ok(ToolStatus::RequiresApproval),
            "skipped" => Ok(ToolStatus::Skipped),
            other => Err(format!("unknown tool status '{}'", other)),
        }
    }
}

/// Error taxonomy for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnknownArgument,
    UnknownTool,
    PermissionDenied,
    Timeout,
    Execution,
    Cancelled,
    LoopDetected,
    BudgetExceeded,
}

impl ErrorKind {
    /// The call itself was malformed; the tool never ran.
    pub fn is_malformed_call(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::UnknownArgument | ErrorKind::UnknownTool
        )
    }

    /// Denied by the execution guard before dispatch.
    pub fn is_guard_denial(&self) -> bool {
        matches!(self, ErrorKind::LoopDetected | ErrorKind::BudgetExceeded)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::UnknownArgument => "unknown_argument",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Execution => "execution",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::LoopDetected => "loop_detected",
            ErrorKind::BudgetExceeded => "budget_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one call. Read-only once appended to the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(tool_name: impl Into<String>, payload: Value, duration_ms: u64) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Success,
            payload,
            error_kind: None,
            error: None,
            duration_ms,
        }
    }

    pub fn error(
        tool_name: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Error,
            payload: Value::Null,
            error_kind: Some(kind),
            error: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn requires_approval(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::RequiresApproval,
            ..Self::error(tool_name, ErrorKind::PermissionDenied, message)
        }
    }

    pub fn skipped(
        tool_name: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: ToolStatus::Skipped,
            ..Self::error(tool_name, kind, message)
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

/// Permission tier declared by a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTier {
    #[default]
    Open,
    RequiresApproval,
}

/// What the caller is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Only `open` tools.
    #[default]
    ReadOnly,
    /// `open` tools plus approval-tier tools matching a pre-approved pattern
    /// (`*` matches any run of characters).
    Supervised { approved: BTreeSet<String> },
    Autonomous,
}

impl ExecutionMode {
    pub fn supervised<I, S>(approved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecutionMode::Supervised {
            approved: approved.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, tool_name: &str, tier: PermissionTier) -> bool {
        if tier == PermissionTier::Open {
            return true;
        }
        match self {
            ExecutionMode::ReadOnly => false,
            ExecutionMode::Supervised { approved } => {
                approved.iter().any(|p| matches_wildcard(p, tool_name))
            }
            ExecutionMode::Autonomous => true,
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    /// `read_only`, `autonomous`, or `supervised:<pattern>,<pattern>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "read_only" => Ok(ExecutionMode::ReadOnly),
            None if s == "autonomous" => Ok(ExecutionMode::Autonomous),
            None if s == "supervised" => Ok(ExecutionMode::supervised(Vec::<String>::new())),
            Some(("supervised", list)) => Ok(ExecutionMode::supervised(
                list.split(',').map(str::trim).filter(|p| !p.is_empty()),
            )),
            _ => Err(format!("unknown execution mode '{}'", s)),
        }
    }
}

/// Match a tool name against a pattern where `*` matches any character run.
pub fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }
    let mut remaining = &name[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// Per-dispatch execution context.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub mode: ExecutionMode,
    /// Turn deadline; bounds every tool timeout
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub working_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_gate_approval_tier() {
        let supervised = ExecutionMode::supervised(["write_*"]);
        for mode in [
            ExecutionMode::ReadOnly,
            supervised.clone(),
            ExecutionMode::Autonomous,
        ] {
            assert!(mode.allows("read_file", PermissionTier::Open));
        }

        assert!(!ExecutionMode::ReadOnly.allows("write_file", PermissionTier::RequiresApproval));
        assert!(supervised.allows("write_file", PermissionTier::RequiresApproval));
        assert!(!supervised.allows("delete_file", PermissionTier::RequiresApproval));
        assert!(ExecutionMode::Autonomous.allows("delete_file", PermissionTier::RequiresApproval));
    }

    #[test]
    fn test_wildcard() {
        assert!(matches_wildcard("git_*", "git_commit"));
        assert!(matches_wildcard("*_file", "write_file"));
        assert!(matches_wildcard("a*b*c", "axxbyyc"));
        assert!(!matches_wildcard("ab*ba", "aba"));
        assert!(!matches_wildcard("git_*", "github"));
        assert!(matches_wildcard("exact", "exact"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("read_only".parse::<ExecutionMode>(), Ok(ExecutionMode::ReadOnly));
        assert_eq!(
            "supervised:write_file, git_*".parse::<ExecutionMode>(),
            Ok(ExecutionMode::supervised(["write_file", "git_*"]))
        );
        assert!("yolo".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_result_builders() {
        let denied = ToolResult::requires_approval("write_file", "needs approval");
        assert_eq!(denied.status, ToolStatus::RequiresApproval);
        assert_eq!(denied.error_kind, Some(ErrorKind::PermissionDenied));

        let skipped = ToolResult::skipped("search", ErrorKind::LoopDetected, "seen");
        assert_eq!(skipped.status, ToolStatus::Skipped);
        assert!(skipped.error_kind.unwrap().is_guard_denial());
    }
}
