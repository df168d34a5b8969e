//! Decision service seam.
//!
//! Every natural-language choice the engine needs (planning, instructing,
//! translating an instruction into a tool call, synthesizing an answer) goes
//! through one typed call: [`DecisionService::decide`]. The engine never
//! inspects how a decision was reached; it only validates what comes back.

mod error;

pub use error::{with_retry, DecisionError, DecisionErrorKind, RetryConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::goal::{Goal, GoalDraft, GoalId, GoalSet, Strategy};
use crate::state::Claim;
use crate::tools::{ErrorKind, ToolInfo, ToolStatus};

/// Proposed goal set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub goals: Vec<GoalDraft>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub rationale: String,
}

/// Proposed next instruction for the active goal.
///
/// `tool` names a tool explicitly; when absent the coordinator translates
/// `text` into a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionDraft {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl InstructionDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
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
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChoice {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// One factual assertion in a synthesis, with the claim ids backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub statement: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub text: String,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub addressed_goals: Vec<GoalId>,
}

/// What happened on an earlier attempt at the same goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub instruction: String,
    pub tool_name: Option<String>,
    pub status: ToolStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionInput {
    Plan {
        request: String,
        context: Vec<Claim>,
        tools: Vec<ToolInfo>,
        max_goals: usize,
        /// Issues with the previous attempt (validation feedback or a
        /// rejected plan)
        feedback: Vec<String>,
    },
    Replan {
        request: String,
        previous: GoalSet,
        blocked_reason: String,
        context: Vec<Claim>,
        tools: Vec<ToolInfo>,
        max_goals: usize,
    },
    Instruct {
        goal: Goal,
        claims: Vec<Claim>,
        attempts: Vec<AttemptSummary>,
        tools: Vec<ToolInfo>,
    },
    Translate {
        instruction: String,
        goal: Goal,
        tools: Vec<ToolInfo>,
    },
    Synthesize {
        request: String,
        goals: Vec<Goal>,
        claims: Vec<Claim>,
        feedback: Vec<String>,
    },
}

impl DecisionInput {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionInput::Plan { .. } => "plan",
            DecisionInput::Replan { .. } => "replan",
            DecisionInput::Instruct { .. } => "instruct",
            DecisionInput::Translate { .. } => "translate",
            DecisionInput::Synthesize { .. } => "synthesize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Plan(PlanDraft),
    /// The request cannot be planned without more information from the user.
    Clarify { question: String },
    Instruction(InstructionDraft),
    /// `None` when no available tool fits the instruction.
    ToolChoice(Option<ToolChoice>),
    Synthesis(Synthesis),
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Plan(_) => "plan",
            Decision::Clarify { .. } => "clarify",
            Decision::Instruction(_) => "instruction",
            Decision::ToolChoice(_) => "tool_choice",
            Decision::Synthesis(_) => "synthesis",
        }
    }

    /// Error for a decision that does not answer `input`.
    pub fn mismatch(&self, input_kind: &str) -> DecisionError {
        DecisionError::malformed(format!(
            "expected an answer to '{}', got '{}'",
            input_kind,
            self.kind()
        ))
    }
}

/// Opaque source of natural-language choices.
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn decide(&self, input: DecisionInput) -> Result<Decision, DecisionError>;
}

/// `decide` with transient-error retries.
pub async fn decide_with_retry(
    service: &dyn DecisionService,
    config: &RetryConfig,
    input: DecisionInput,
) -> Result<Decision, DecisionError> {
    tracing::debug!(kind = input.kind(), "Requesting decision");
    with_retry(config, || service.decide(input.clone())).await
}
