//! Shared fixtures for unit tests: fake tools, a scripted decision service
//! and a ready-made turn context.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agents::TurnContext;
use crate::config::GuardConfig;
use crate::decision::{
    Assertion, Decision, DecisionError, DecisionInput, DecisionService, InstructionDraft,
    PlanDraft, Synthesis,
};
use crate::goal::{GoalDraft, GoalId, GoalSet, Strategy};
use crate::guard::ExecutionGuard;
use crate::state::{sections, StateDocument, TurnId};
use crate::tools::{handler_fn, ExecutionMode, FnTool, PermissionTier, Tool};

fn text_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"text": {"type": "string"}},
        "required": ["text"]
    })
}

fn no_args() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Returns its `text` argument as the payload.
pub fn echo_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(
        FnTool::new(
            name,
            text_schema(),
            PermissionTier::Open,
            handler_fn(|args: Value, _dir| async move { Ok(args["text"].clone()) }),
        )
        .with_description("Echo the text argument"),
    )
}

/// Like [`echo_tool`], counting every execution.
pub fn counting_tool(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        text_schema(),
        PermissionTier::Open,
        handler_fn(move |args: Value, _dir| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args["text"].clone())
            }
        }),
    ))
}

/// Approval-tier tool that counts executions.
pub fn approval_tool(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        no_args(),
        PermissionTier::RequiresApproval,
        handler_fn(move |_args, _dir| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("done"))
            }
        }),
    ))
}

pub fn slow_tool(name: &str, delay: Duration) -> Arc<dyn Tool> {
    Arc::new(
        FnTool::new(
            name,
            no_args(),
            PermissionTier::Open,
            handler_fn(move |_args, _dir| async move {
                tokio::time::sleep(delay).await;
                Ok(json!("finally"))
            }),
        )
        .with_timeout(Duration::from_secs(120)),
    )
}

pub fn failing_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        no_args(),
        PermissionTier::Open,
        handler_fn(|_args, _dir| async move { Err(anyhow::anyhow!("backend unavailable")) }),
    ))
}

pub fn panicking_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        no_args(),
        PermissionTier::Open,
        handler_fn(|_args, _dir| async move {
            if true {
                panic!("handler bug");
            }
            Ok(Value::Null)
        }),
    ))
}

/// Decision service answering from per-kind queues, recording every input.
#[derive(Default)]
pub struct ScriptedDecisionService {
    queues: Mutex<HashMap<&'static str, VecDeque<Result<Decision, DecisionError>>>>,
    inputs: Mutex<Vec<DecisionInput>>,
}

impl ScriptedDecisionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for inputs of `kind` (`plan`, `replan`, `instruct`,
    /// `translate`, `synthesize`).
    pub fn push(&self, kind: &'static str, decision: Decision) -> &Self {
        self.push_result(kind, Ok(decision))
    }

    pub fn push_err(&self, kind: &'static str, error: DecisionError) -> &Self {
        self.push_result(kind, Err(error))
    }

    fn push_result(&self, kind: &'static str, answer: Result<Decision, DecisionError>) -> &Self {
        self.queues
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(answer);
        self
    }

    pub fn inputs_of(&self, kind: &str) -> Vec<DecisionInput> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DecisionService for ScriptedDecisionService {
    async fn decide(&self, input: DecisionInput) -> Result<Decision, DecisionError> {
        let kind = input.kind();
        self.inputs.lock().unwrap().push(input);
        self.queues
            .lock()
            .unwrap()
            .get_mut(kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(DecisionError::refused(format!(
                    "no scripted '{}' decision",
                    kind
                )))
            })
    }
}

pub fn plan(drafts: Vec<GoalDraft>) -> Decision {
    Decision::Plan(PlanDraft {
        goals: drafts,
        strategy: Strategy::Sequential,
        rationale: "scripted".to_string(),
    })
}

pub fn instruct(text: &str, tool: &str, args: Value) -> Decision {
    Decision::Instruction(InstructionDraft::text(text).with_tool(tool, args))
}

pub fn synthesis(text: &str, assertions: &[(&str, &[&str])], goals: &[&str]) -> Decision {
    Decision::Synthesis(Synthesis {
        text: text.to_string(),
        assertions: assertions
            .iter()
            .map(|(statement, evidence)| Assertion {
                statement: statement.to_string(),
                evidence: evidence.iter().map(|e| e.to_string()).collect(),
            })
            .collect(),
        addressed_goals: goals.iter().map(|g| GoalId::new(*g)).collect(),
    })
}

/// A context with an open execution log and `drafts` installed as generation 1.
pub async fn context_with(drafts: Vec<GoalDraft>) -> TurnContext {
    let mut document = StateDocument::new(TurnId::new());
    document
        .open_section(sections::EXECUTION_LOG, json!({}))
        .await
        .unwrap();
    let mut ctx = TurnContext::new(
        "request",
        document,
        ExecutionGuard::new(GuardConfig::default(), CancellationToken::new()),
        ExecutionMode::ReadOnly,
        std::env::temp_dir(),
    );
    let set = GoalSet::from_drafts(1, drafts, Strategy::Sequential, "", 6).unwrap();
    ctx.install_goals(set);
    ctx
}
