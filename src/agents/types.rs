//! Core types for the agent loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::goal::GoalId;
use crate::guard::GuardState;
use crate::state::{TurnDocument, TurnId};
use crate::store::TurnStatus;
use crate::tools::{ErrorKind, ToolCall, ToolResult};

/// One instruction for the coordinator, issued on behalf of one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub goal_id: GoalId,
    pub text: String,
    /// Explicitly requested tool; translation is skipped when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Instruction {
    pub fn new(goal_id: GoalId, text: impl Into<String>) -> Self {
        Self {
            goal_id,
            text: text.into(),
            tool: None,
            args: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>, args: Value) -> Self {
        self.tool = Some(tool.into());
        self.args = Some(args);
        self
    }

    /// Normalized intent: two instructions with equal keys ask for the same thing.
    pub fn intent_key(&self) -> String {
        let text = self
            .text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        match (&self.tool, &self.args) {
            (Some(tool), Some(args)) => format!("{}|{}|{}", text, tool, args),
            (Some(tool), None) => format!("{}|{}", text, tool),
            _ => text,
        }
    }
}

/// Progress of a workflow step attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepInfo {
    pub workflow: String,
    pub step: usize,
    /// The run left `Running` with this step
    pub finished: bool,
    pub succeeded: bool,
}

/// One coordinator invocation as it appears in the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub generation: u32,
    pub goal_id: GoalId,
    pub instruction: String,
    pub intent: String,
    /// Absent when no tool could be selected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<ToolCall>,
    pub result: ToolResult,
    #[serde(default)]
    pub claim_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowStepInfo>,
}

impl ExecutionRecord {
    /// Malformed calls never reached a handler and do not count as attempts.
    pub fn is_malformed(&self) -> bool {
        self.result
            .error_kind
            .map(|k| k.is_malformed_call())
            .unwrap_or(false)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.result.error_kind == Some(ErrorKind::PermissionDenied)
    }

    /// A step in the middle of a workflow run (the run as a whole is one attempt).
    pub fn is_intermediate_step(&self) -> bool {
        self.workflow.as_ref().map(|w| !w.finished).unwrap_or(false)
    }
}

/// Entries of the `execution_log` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LogEntry {
    ToolCall(ExecutionRecord),
    GoalAchieved {
        generation: u32,
        goal_id: GoalId,
        summary: String,
    },
}

/// Why the executor cannot make progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    /// A tool needs approval the current mode does not grant
    PermissionDenied { tool: String },
    /// The execution guard denied the last call
    GuardDenied { error_kind: ErrorKind },
    AttemptsExhausted,
    MalformedCalls,
    /// The only proposed instruction repeats an earlier one
    NoAlternative,
    /// A pending goal depends on a blocked one
    DependencyBlocked,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedReason {
    pub goal_id: GoalId,
    #[serde(flatten)]
    pub kind: BlockKind,
    pub message: String,
}

/// The executor's decision for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorDecision {
    Command(Instruction),
    /// Evidence for the goal is present; the goal has been marked achieved
    Analyze { goal_id: GoalId, summary: String },
    Complete,
    Blocked(BlockedReason),
}

/// Result of one coordinator invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorOutcome {
    Executed {
        call: Option<ToolCall>,
        result: ToolResult,
        workflow: Option<WorkflowStepInfo>,
    },
    /// The call needs an approval the execution mode does not grant
    ClarificationNeeded {
        call: ToolCall,
        reason: String,
        result: ToolResult,
    },
}

impl CoordinatorOutcome {
    pub fn result(&self) -> &ToolResult {
        match self {
            CoordinatorOutcome::Executed { result, .. } => result,
            CoordinatorOutcome::ClarificationNeeded { result, .. } => result,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Approved { text: String, confidence: f64 },
    Failed { reason: String },
    NeedsClarification { question: String },
    Cancelled,
}

impl TurnOutcome {
    pub fn status(&self) -> TurnStatus {
        match self {
            TurnOutcome::Approved { .. } => TurnStatus::Approved,
            TurnOutcome::Failed { .. } => TurnStatus::Failed,
            TurnOutcome::NeedsClarification { .. } => TurnStatus::NeedsClarification,
            TurnOutcome::Cancelled => TurnStatus::Cancelled,
        }
    }

    /// The message shown to the user.
    pub fn message(&self) -> String {
        match self {
            TurnOutcome::Approved { text, .. } => text.clone(),
            TurnOutcome::Failed { reason } => reason.clone(),
            TurnOutcome::NeedsClarification { question } => question.clone(),
            TurnOutcome::Cancelled => "The request was cancelled".to_string(),
        }
    }
}

/// Everything a caller gets back from a turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub outcome: TurnOutcome,
    pub document: TurnDocument,
    pub guard: GuardState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_intent_key_normalizes_text() {
        let a = Instruction::new(GoalId::new("g1"), "Read   the File")
            .with_tool("read_file", json!({"path": "a"}));
        let b = Instruction::new(GoalId::new("g1"), "read the file")
            .with_tool("read_file", json!({"path": "a"}));
        let c = Instruction::new(GoalId::new("g1"), "read the file")
            .with_tool("read_file", json!({"path": "b"}));
        assert_eq!(a.intent_key(), b.intent_key());
        assert_ne!(b.intent_key(), c.intent_key());
    }

    #[test]
    fn test_blocked_reason_serializes_flat() {
        let reason = BlockedReason {
            goal_id: GoalId::new("g2"),
            kind: BlockKind::GuardDenied {
                error_kind: ErrorKind::LoopDetected,
            },
            message: "repeat".to_string(),
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["kind"], "guard_denied");
        assert_eq!(value["error_kind"], "loop_detected");
        assert_eq!(value["goal_id"], "g2");
    }
}
