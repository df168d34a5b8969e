//! Executor - drives goals of the current set to completion, one at a time.
//!
//! # Algorithm
//! With an active goal, in priority order:
//! 1. No record yet for the goal: COMMAND (ask for an instruction)
//! 2. Required evidence present: ANALYZE and mark the goal achieved
//! 3. Last call denied by the guard or cancelled: BLOCKED
//! 4. Too many permission denials, malformed calls or attempts: BLOCKED
//! 5. A workflow run is in progress: COMMAND continuing it
//! 6. Otherwise COMMAND an alternative instruction
//!
//! Without an active goal: COMPLETE when every goal is achieved, else start
//! the next eligible goal, else BLOCKED on the unreachable one.
//!
//! # Invariants
//! - At most one goal is `InProgress`
//! - A goal starts only when all of its dependencies are achieved
//! - An instruction with the same intent as an earlier one for the same goal
//!   is never commanded again

use serde_json::{Map, Value};

use crate::agents::context::TurnContext;
use crate::agents::types::{
    BlockKind, BlockedReason, ExecutionRecord, ExecutorDecision, Instruction,
};
use crate::config::ExecutorConfig;
use crate::decision::{decide_with_retry, Decision, DecisionInput, DecisionService, RetryConfig};
use crate::error::TurnError;
use crate::goal::Goal;
use crate::tools::{ErrorKind, ToolInfo};

pub struct Executor<'a> {
    config: &'a ExecutorConfig,
    decisions: &'a dyn DecisionService,
    retry: &'a RetryConfig,
    tools: &'a [ToolInfo],
}

impl<'a> Executor<'a> {
    pub fn new(
        config: &'a ExecutorConfig,
        decisions: &'a dyn DecisionService,
        retry: &'a RetryConfig,
        tools: &'a [ToolInfo],
    ) -> Self {
        Self {
            config,
            decisions,
            retry,
            tools,
        }
    }

    /// Decide the next step for the current goal set.
    ///
    /// # Postconditions
    /// - `Analyze`: the goal is `Achieved`
    /// - `Blocked` for the active goal: the goal is `Blocked`
    ///
    /// # Errors
    /// Decision-service failures and answers of the wrong kind.
    pub async fn decide(&self, ctx: &mut TurnContext) -> Result<ExecutorDecision, TurnError> {
        let goals = ctx.goals().ok_or(TurnError::NoGoalSet)?;

        let active = match goals.active() {
            Some(goal) => goal.clone(),
            None => {
                if goals.all_achieved() {
                    return Ok(ExecutorDecision::Complete);
                }
                if let Some(unreachable) = goals.first_unreachable() {
                    return Ok(dependency_blocked(unreachable));
                }
                let Some(next) = goals.next_eligible().map(|g| g.id.clone()) else {
                    let pending = goals
                        .goals()
                        .iter()
                        .find(|g| !g.status.is_terminal())
                        .ok_or(TurnError::NoGoalSet)?;
                    return Ok(dependency_blocked(pending));
                };
                let goal = ctx
                    .goals_mut()
                    .ok_or(TurnError::NoGoalSet)?
                    .goal_mut(&next)?;
                goal.start()?;
                tracing::info!(goal = %goal.id, "Goal started: {}", goal.description);
                goal.clone()
            }
        };

        let records: Vec<ExecutionRecord> = ctx.records_for(&active.id).cloned().collect();
        let Some(last) = records.last() else {
            return self.command(ctx, &active, &records).await;
        };

        if let Some(evidence) = records.iter().find(|r| is_evidence(&active, r)) {
            let summary = summarize(ctx, &active, evidence);
            ctx.goals_mut()
                .ok_or(TurnError::NoGoalSet)?
                .goal_mut(&active.id)?
                .achieve()?;
            tracing::info!(goal = %active.id, "Goal achieved");
            return Ok(ExecutorDecision::Analyze {
                goal_id: active.id,
                summary,
            });
        }

        match last.result.error_kind {
            Some(kind) if kind.is_guard_denial() => {
                let message = last
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Execution guard denied the call ({})", kind));
                let denied = BlockKind::GuardDenied { error_kind: kind };
                return self.block(ctx, &active, denied, message);
            }
            Some(ErrorKind::Cancelled) => {
                return self.block(
                    ctx,
                    &active,
                    BlockKind::Cancelled,
                    "Turn was cancelled".to_string(),
                );
            }
            _ => {}
        }

        let denials = records.iter().filter(|r| r.is_permission_denied()).count() as u32;
        if denials >= self.config.max_permission_denials {
            return self.block_on_permission(ctx, &active, &records);
        }

        let malformed = records.iter().filter(|r| r.is_malformed()).count() as u32;
        if malformed >= self.config.max_malformed_calls {
            let message = format!("{} malformed tool calls for goal '{}'", malformed, active.id);
            return self.block(ctx, &active, BlockKind::MalformedCalls, message);
        }

        let attempts = records
            .iter()
            .filter(|r| !r.is_malformed() && !r.is_intermediate_step())
            .count() as u32;
        if attempts >= self.config.max_attempts_per_goal {
            let message = format!(
                "No evidence for goal '{}' after {} attempts",
                active.id, attempts
            );
            return self.block(ctx, &active, BlockKind::AttemptsExhausted, message);
        }

        if ctx
            .workflow_runs
            .get(&active.id)
            .is_some_and(|run| run.is_running())
        {
            tracing::debug!(goal = %active.id, "Continuing workflow");
            return Ok(ExecutorDecision::Command(Instruction::new(
                active.id.clone(),
                last.instruction.clone(),
            )));
        }

        self.command(ctx, &active, &records).await
    }

    async fn command(
        &self,
        ctx: &mut TurnContext,
        goal: &Goal,
        records: &[ExecutionRecord],
    ) -> Result<ExecutorDecision, TurnError> {
        let input = DecisionInput::Instruct {
            goal: goal.clone(),
            claims: ctx.claims().to_vec(),
            attempts: ctx.attempts_for(&goal.id),
            tools: self.tools.to_vec(),
        };
        let decision = decide_with_retry(self.decisions, self.retry, input).await?;
        let Decision::Instruction(draft) = decision else {
            return Err(decision.mismatch("instruct").into());
        };

        let mut instruction = Instruction::new(goal.id.clone(), draft.text);
        if let Some(tool) = draft.tool {
            let args = draft.args.unwrap_or_else(|| Value::Object(Map::new()));
            instruction = instruction.with_tool(tool, args);
        }

        let intent = instruction.intent_key();
        if records.iter().any(|r| r.intent == intent) {
            if records.last().is_some_and(|r| r.is_permission_denied()) {
                return self.block_on_permission(ctx, goal, records);
            }
            let message = format!(
                "Only alternative for goal '{}' repeats an earlier instruction: {}",
                goal.id, instruction.text
            );
            return self.block(ctx, goal, BlockKind::NoAlternative, message);
        }

        tracing::debug!(goal = %goal.id, "Commanding: {}", instruction.text);
        Ok(ExecutorDecision::Command(instruction))
    }

    fn block_on_permission(
        &self,
        ctx: &mut TurnContext,
        goal: &Goal,
        records: &[ExecutionRecord],
    ) -> Result<ExecutorDecision, TurnError> {
        let tool = records
            .iter()
            .rev()
            .find(|r| r.is_permission_denied())
            .map(|r| r.result.tool_name.clone())
            .unwrap_or_default();
        let message = format!(
            "Tool '{}' requires approval that the current execution mode does not grant",
            tool
        );
        self.block(ctx, goal, BlockKind::PermissionDenied { tool }, message)
    }

    fn block(
        &self,
        ctx: &mut TurnContext,
        goal: &Goal,
        kind: BlockKind,
        message: String,
    ) -> Result<ExecutorDecision, TurnError> {
        ctx.goals_mut()
            .ok_or(TurnError::NoGoalSet)?
            .goal_mut(&goal.id)?
            .block(message.clone())?;
        tracing::warn!(goal = %goal.id, "Goal blocked: {}", message);
        Ok(ExecutorDecision::Blocked(BlockedReason {
            goal_id: goal.id.clone(),
            kind,
            message,
        }))
    }
}

fn dependency_blocked(goal: &Goal) -> ExecutorDecision {
    ExecutorDecision::Blocked(BlockedReason {
        goal_id: goal.id.clone(),
        kind: BlockKind::DependencyBlocked,
        message: format!("Goal '{}' depends on a goal that is blocked", goal.id),
    })
}

/// A successful result from an accepted tool, and any workflow behind it finished successfully.
fn is_evidence(goal: &Goal, record: &ExecutionRecord) -> bool {
    record.result.is_success()
        && goal.accepts_evidence_from(&record.result.tool_name)
        && record
            .workflow
            .as_ref()
            .map(|w| w.finished && w.succeeded)
            .unwrap_or(true)
}

fn summarize(ctx: &TurnContext, goal: &Goal, evidence: &ExecutionRecord) -> String {
    let statements: Vec<&str> = ctx
        .claims()
        .iter()
        .filter(|c| evidence.claim_ids.contains(&c.id))
        .take(3)
        .map(|c| c.statement.as_str())
        .collect();
    if statements.is_empty() {
        format!("{} (via {})", goal.description, evidence.result.tool_name)
    } else {
        format!(
            "{} (via {}): {}",
            goal.description,
            evidence.result.tool_name,
            statements.join("; ")
        )
    }
}
