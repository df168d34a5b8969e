//! Progress of one workflow on behalf of one goal.
//!
//! # Invariants
//! - Steps run strictly in declaration order; `next_step` only increases
//!   within one workflow
//! - A fallback workflow is entered at most once per run; a cycle of
//!   fallbacks ends the run instead of looping
//! - Once a run leaves `Running` it never returns to it

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Fallback, WorkflowLibrary};
use crate::tools::ToolResult;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Template placeholder '{{{{{0}}}}}' has no value")]
    Unresolved(String),

    #[error("Workflow '{0}' is not in the library")]
    UnknownWorkflow(String),
}

/// Values available to `{{...}}` placeholders in step arguments.
///
/// `{{goal}}` and `{{instruction}}` are always bound; any other name is
/// looked up in the instruction's own arguments.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub goal: String,
    pub instruction: String,
    pub args: Map<String, Value>,
}

impl Bindings {
    fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "goal" => Some(Value::String(self.goal.clone())),
            "instruction" => Some(Value::String(self.instruction.clone())),
            other => self.args.get(other).cloned(),
        }
    }
}

/// Substitute placeholders throughout a JSON template.
///
/// A string that is exactly one placeholder takes the bound value as-is
/// (numbers stay numbers); placeholders inside longer strings are rendered
/// as text.
pub fn render_template(template: &Value, bindings: &Bindings) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => render_string(s, bindings),
        Value::Array(items) => items
            .iter()
            .map(|v| render_template(v, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.clone(), render_template(v, bindings)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, bindings: &Bindings) -> Result<Value, TemplateError> {
    if let Some(caps) = PLACEHOLDER_RE.captures(s) {
        if caps.get(0).map(|m| m.len()) == Some(s.len()) {
            let name = &caps[1];
            return bindings
                .lookup(name)
                .ok_or_else(|| TemplateError::Unresolved(name.to_string()));
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(s) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = bindings
            .lookup(name.as_str())
            .ok_or_else(|| TemplateError::Unresolved(name.as_str().to_string()))?;
        out.push_str(&s[last..whole.start()]);
        match value {
            Value::String(v) => out.push_str(&v),
            v => out.push_str(&v.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded,
    /// Criteria failed and no fallback remained
    Abandoned { message: String },
}

/// What one observed step result did to the run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunProgress {
    /// More steps remain in the current workflow
    Continue,
    Succeeded,
    /// Switched to a fallback workflow, starting at its first step
    FellBack { to: String },
    Abandoned { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    workflow: String,
    next_step: usize,
    state: RunState,
    /// Every workflow entered by this run, in order
    visited: Vec<String>,
}

impl WorkflowRun {
    pub fn start(workflow: impl Into<String>) -> Self {
        let workflow = workflow.into();
        Self {
            visited: vec![workflow.clone()],
            workflow,
            next_step: 0,
            state: RunState::Running,
        }
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Index of the step the next call will run.
    pub fn next_step(&self) -> usize {
        self.next_step
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Tool name and rendered arguments for the next step.
    pub fn next_call(
        &self,
        library: &WorkflowLibrary,
        bindings: &Bindings,
    ) -> Result<Option<(String, Value)>, TemplateError> {
        if !self.is_running() {
            return Ok(None);
        }
        let workflow = library
            .get(&self.workflow)
            .ok_or_else(|| TemplateError::UnknownWorkflow(self.workflow.clone()))?;
        let Some(step) = workflow.steps.get(self.next_step) else {
            return Ok(None);
        };
        let args = render_template(&step.args_template, bindings)?;
        Ok(Some((step.tool.clone(), args)))
    }

    /// Record the result of the step returned by [`Self::next_call`].
    ///
    /// A failed step ends the current workflow early. After the last step,
    /// the success criteria are checked against its result.
    pub fn observe(&mut self, library: &WorkflowLibrary, result: &ToolResult) -> RunProgress {
        if !self.is_running() {
            return match &self.state {
                RunState::Succeeded => RunProgress::Succeeded,
                RunState::Abandoned { message } => RunProgress::Abandoned {
                    message: message.clone(),
                },
                RunState::Running => RunProgress::Continue,
            };
        }

        let Some(workflow) = library.get(&self.workflow) else {
            return self.abandon(format!("Workflow '{}' is not in the library", self.workflow));
        };

        self.next_step += 1;
        let is_last = self.next_step >= workflow.steps.len();

        if result.is_success() && !is_last {
            return RunProgress::Continue;
        }

        let met = result.is_success()
            && (workflow.criteria.is_empty() || workflow.criteria.iter().all(|c| c.holds(result)));
        if met {
            self.state = RunState::Succeeded;
            return RunProgress::Succeeded;
        }

        tracing::info!(
            workflow = %self.workflow,
            step = self.next_step - 1,
            "Workflow did not meet its success criteria"
        );

        match workflow.fallback.clone() {
            Some(Fallback::Workflow(next)) if !self.visited.contains(&next) => {
                self.visited.push(next.clone());
                self.workflow = next.clone();
                self.next_step = 0;
                RunProgress::FellBack { to: next }
            }
            Some(Fallback::Terminal(message)) => self.abandon(message),
            _ => {
                let message = format!("Workflow '{}' did not succeed", self.workflow);
                self.abandon(message)
            }
        }
    }

    /// End the run without success.
    pub fn abandon(&mut self, message: String) -> RunProgress {
        self.state = RunState::Abandoned {
            message: message.clone(),
        };
        RunProgress::Abandoned { message }
    }
}
