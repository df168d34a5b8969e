//! Per-turn execution context.
//!
//! Owned by exactly one turn and never shared: the document, the guard and
//! every counter the loop consults live here. Shared, read-only services
//! (registry, workflows, decision service) are borrowed by the components
//! instead.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use super::types::{CoordinatorOutcome, ExecutionRecord, Instruction, LogEntry};
use crate::decision::AttemptSummary;
use crate::goal::{GoalId, GoalSet};
use crate::guard::ExecutionGuard;
use crate::state::{sections, Claim, ClaimExtractor, StateDocument, StateError};
use crate::tools::ExecutionMode;
use crate::workflow::WorkflowRun;

fn log_value(entry: &LogEntry) -> Result<Value, StateError> {
    serde_json::to_value(entry).map_err(|e| StateError::Persistence {
        name: sections::EXECUTION_LOG.to_string(),
        reason: e.to_string(),
    })
}

pub struct TurnContext {
    pub request: String,
    pub document: StateDocument,
    pub guard: ExecutionGuard,
    pub mode: ExecutionMode,
    pub working_dir: PathBuf,
    goals: Option<GoalSet>,
    generation: u32,
    records: Vec<ExecutionRecord>,
    claims: Vec<Claim>,
    /// Workflow runs of the current generation, by goal
    pub workflow_runs: HashMap<GoalId, WorkflowRun>,
}

impl TurnContext {
    pub fn new(
        request: impl Into<String>,
        document: StateDocument,
        guard: ExecutionGuard,
        mode: ExecutionMode,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            request: request.into(),
            document,
            guard,
            mode,
            working_dir,
            goals: None,
            generation: 0,
            records: Vec::new(),
            claims: Vec::new(),
            workflow_runs: HashMap::new(),
        }
    }

    /// Generation number the next goal set must carry.
    pub fn next_generation(&self) -> u32 {
        self.generation + 1
    }

    /// Replace the current goal set. Workflow runs do not carry over.
    pub fn install_goals(&mut self, goals: GoalSet) {
        self.generation = goals.generation();
        self.goals = Some(goals);
        self.workflow_runs.clear();
    }

    pub fn goals(&self) -> Option<&GoalSet> {
        self.goals.as_ref()
    }

    pub fn goals_mut(&mut self) -> Option<&mut GoalSet> {
        self.goals.as_mut()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    /// Records issued for `goal` in the current generation, oldest first.
    pub fn records_for<'a>(
        &'a self,
        goal: &'a GoalId,
    ) -> impl Iterator<Item = &'a ExecutionRecord> + 'a {
        let generation = self.generation;
        self.records
            .iter()
            .filter(move |r| r.generation == generation && &r.goal_id == goal)
    }

    pub fn attempts_for(&self, goal: &GoalId) -> Vec<AttemptSummary> {
        self.records_for(goal)
            .map(|r| AttemptSummary {
                instruction: r.instruction.clone(),
                tool_name: r.call.as_ref().map(|c| c.tool_name.clone()),
                status: r.result.status,
                error_kind: r.result.error_kind,
                error: r.result.error.clone(),
            })
            .collect()
    }

    /// Append a coordinator outcome to the execution log.
    ///
    /// Successful payloads are turned into claims pointing at the new entry;
    /// the raw payload itself only lives in the log.
    pub async fn log_call(
        &mut self,
        instruction: &Instruction,
        outcome: CoordinatorOutcome,
        extractor: &dyn ClaimExtractor,
    ) -> Result<&ExecutionRecord, StateError> {
        let (call, result, workflow) = match outcome {
            CoordinatorOutcome::Executed {
                call,
                result,
                workflow,
            } => (call, result, workflow),
            CoordinatorOutcome::ClarificationNeeded { call, result, .. } => {
                (Some(call), result, None)
            }
        };

        let index = self.document.read_section(sections::EXECUTION_LOG)?.entries.len();
        let claims = if result.is_success() {
            extractor.extract(
                &result.tool_name,
                &result.payload,
                &format!("{}#{}", sections::EXECUTION_LOG, index),
                self.claims.len(),
            )
        } else {
            Vec::new()
        };

        let record = ExecutionRecord {
            generation: self.generation,
            goal_id: instruction.goal_id.clone(),
            instruction: instruction.text.clone(),
            intent: instruction.intent_key(),
            call,
            result,
            claim_ids: claims.iter().map(|c| c.id.clone()).collect(),
            workflow,
        };

        let entry = log_value(&LogEntry::ToolCall(record.clone()))?;
        self.document
            .append_entry(sections::EXECUTION_LOG, entry)
            .await?;

        tracing::debug!(
            goal = %record.goal_id,
            tool = %record.result.tool_name,
            status = %record.result.status,
            claims = claims.len(),
            "Logged tool call"
        );
        self.claims.extend(claims);
        self.records.push(record);
        Ok(&self.records[self.records.len() - 1])
    }

    pub async fn log_achieved(&mut self, goal: &GoalId, summary: &str) -> Result<(), StateError> {
        let entry = log_value(&LogEntry::GoalAchieved {
            generation: self.generation,
            goal_id: goal.clone(),
            summary: summary.to_string(),
        })?;
        self.document
            .append_entry(sections::EXECUTION_LOG, entry)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalDraft;
    use crate::state::PayloadClaimExtractor;
    use crate::test_support::context_with;
    use crate::tools::{ErrorKind, ToolCall, ToolResult};
    use serde_json::json;

    #[tokio::test]
    async fn test_log_call_extracts_claims_for_successes_only() {
        let mut ctx = context_with(vec![GoalDraft::new("g1", "look")]).await;
        let extractor = PayloadClaimExtractor::default();
        let instruction = Instruction::new(GoalId::new("g1"), "look");

        let ok = ToolResult::success("echo", json!("first line\nsecond line"), 1);
        let record = ctx
            .log_call(
                &instruction,
                CoordinatorOutcome::Executed {
                    call: Some(ToolCall::new("echo", json!({}), GoalId::new("g1"))),
                    result: ok,
                    workflow: None,
                },
                &extractor,
            )
            .await
            .unwrap();
        assert_eq!(record.claim_ids, vec!["c0", "c1"]);

        let failed = ToolResult::error("echo", ErrorKind::Timeout, "slow");
        ctx.log_call(
            &instruction,
            CoordinatorOutcome::Executed {
                call: None,
                result: failed,
                workflow: None,
            },
            &extractor,
        )
        .await
        .unwrap();

        assert_eq!(ctx.claims().len(), 2);
        assert_eq!(ctx.claims()[1].evidence_ref, "execution_log#0");
        assert_eq!(ctx.records_for(&GoalId::new("g1")).count(), 2);
        let log = ctx.document.read_section(sections::EXECUTION_LOG).unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.entries[1].value["entry"], "tool_call");
    }
}
