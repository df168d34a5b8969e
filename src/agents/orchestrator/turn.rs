//! Turn driver - one request, end to end, as an explicit state machine.
//!
//! ```text
//! Planning --> Executing --> Synthesizing --> Validating --> Done
//!    ^            |  ^                          |  |
//!    |            +--+ (next step)              |  +--> Synthesizing (REVISE)
//!    +------------+ (blocked: replan)           +-----> Planning (RETRY)
//! ```
//!
//! Any non-terminal state may also move to `Failed`, `Cancelled` or (from
//! planning and execution) `AwaitingClarification`.
//!
//! # Invariants
//! - Every state change goes through [`TurnState::allowed_transitions`]
//! - The turn ends with exactly one `complete_turn` on the store
//! - Replans and validation retries are bounded by configuration

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::planner::{PlanOutcome, Planner};
use crate::agents::context::TurnContext;
use crate::agents::leaf::{Coordinator, Executor, ValidationGate};
use crate::agents::types::{
    BlockKind, CoordinatorOutcome, ExecutorDecision, TurnOutcome, TurnReport,
};
use crate::config::Config;
use crate::decision::{decide_with_retry, Decision, DecisionInput, DecisionService, Synthesis};
use crate::error::TurnError;
use crate::goal::{GoalId, ValidationDecision};
use crate::guard::ExecutionGuard;
use crate::state::{
    sections, ClaimExtractor, PayloadClaimExtractor, StateDocument, StateError, TurnId,
};
use crate::store::{TurnStatus, TurnStore};
use crate::tools::{ErrorKind, ExecutionMode, ToolInfo, ToolRegistry};
use crate::workflow::WorkflowLibrary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Planning,
    Executing,
    Synthesizing,
    Validating,
    Done,
    Failed,
    AwaitingClarification,
    Cancelled,
}

impl TurnState {
    pub fn allowed_transitions(&self) -> &'static [TurnState] {
        use TurnState::*;
        match self {
            Planning => &[Executing, Failed, AwaitingClarification, Cancelled],
            Executing => &[
                Executing,
                Planning,
                Synthesizing,
                Failed,
                AwaitingClarification,
                Cancelled,
            ],
            Synthesizing => &[Validating, Failed, Cancelled],
            Validating => &[Done, Synthesizing, Planning, Failed, Cancelled],
            Done | Failed | AwaitingClarification | Cancelled => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Validated transition.
    pub fn advance(self, to: TurnState) -> Result<TurnState, TurnError> {
        if self.allowed_transitions().contains(&to) {
            if self != to {
                tracing::debug!("Turn state {:?} -> {:?}", self, to);
            }
            Ok(to)
        } else {
            Err(TurnError::InvalidTransition { from: self, to })
        }
    }
}

/// Why the planner runs.
enum PlanRequest {
    Initial,
    Replan { reason: String },
    /// Validation asked for another pass
    Retry { issues: Vec<String> },
}

fn section_value<T: Serialize>(name: &str, value: &T) -> Result<Value, StateError> {
    serde_json::to_value(value).map_err(|e| StateError::Persistence {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Decision-service failures end the turn; everything else is a bug.
fn decision_failure(phase: &str, error: TurnError) -> Result<String, TurnError> {
    match error {
        TurnError::Decision(e) => Ok(format!("{} failed: {}", phase, e)),
        other => Err(other),
    }
}

fn end(from: TurnState, to: TurnState, outcome: TurnOutcome) -> Result<TurnOutcome, TurnError> {
    from.advance(to)?;
    if let TurnOutcome::Failed { reason } = &outcome {
        tracing::warn!("Turn failed: {}", reason);
    }
    Ok(outcome)
}

fn failed(from: TurnState, reason: String) -> Result<TurnOutcome, TurnError> {
    end(from, TurnState::Failed, TurnOutcome::Failed { reason })
}

/// Runs turns against shared, read-only services.
///
/// Cheap to clone; independent turns may run concurrently.
#[derive(Clone)]
pub struct TurnRunner {
    registry: Arc<ToolRegistry>,
    workflows: Arc<WorkflowLibrary>,
    decisions: Arc<dyn DecisionService>,
    store: Arc<dyn TurnStore>,
    extractor: Arc<dyn ClaimExtractor>,
    config: Arc<Config>,
}

impl TurnRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        workflows: Arc<WorkflowLibrary>,
        decisions: Arc<dyn DecisionService>,
        store: Arc<dyn TurnStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            workflows,
            decisions,
            store,
            extractor: Arc::new(PayloadClaimExtractor::default()),
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ClaimExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Run one turn in the configured execution mode.
    pub async fn run(
        &self,
        request: &str,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        self.run_with_mode(request, self.config.execution_mode.clone(), cancel)
            .await
    }

    /// Run one turn.
    ///
    /// # Postconditions
    /// - `Ok`: the store holds the turn with the report's terminal status
    /// - `Err`: the turn is marked `Failed` in the store (best effort)
    pub async fn run_with_mode(
        &self,
        request: &str,
        mode: ExecutionMode,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let turn_id = TurnId::new();
        self.store
            .create_turn(turn_id, request)
            .await
            .map_err(TurnError::Store)?;
        tracing::info!(turn = %turn_id, "Turn started");

        match self.drive(turn_id, request, mode, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::error!(turn = %turn_id, "Turn aborted: {}", e);
                let message = format!("Turn aborted: {}", e);
                if let Err(store_err) = self
                    .store
                    .complete_turn(turn_id, TurnStatus::Failed, Some(&message))
                    .await
                {
                        tracing::warn!(
                        turn = %turn_id,
                        "Failed to record aborted turn: {}",
                        store_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        turn_id: TurnId,
        request: &str,
        mode: ExecutionMode,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let document = StateDocument::with_journal(turn_id, Arc::clone(&self.store));
        let guard = ExecutionGuard::new(self.config.guard.clone(), cancel);
        let mut ctx = TurnContext::new(
            request,
            document,
            guard,
            mode,
            self.config.working_dir.clone(),
        );
        let tools = self.registry.list_tools();

        let analysis = json!({
            "request": request,
            "execution_mode": section_value(sections::REQUEST_ANALYSIS, &ctx.mode)?,
        });
        ctx.document
            .append_section(sections::REQUEST_ANALYSIS, analysis)
            .await?;

        let candidates: Vec<Value> = self
            .workflows
            .rank(request)
            .into_iter()
            .map(|m| json!({"name": m.name, "confidence": m.confidence}))
            .collect();
        let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        ctx.document
            .append_section(
                sections::GATHERED_CONTEXT,
                json!({"tools": tool_names, "workflow_candidates": candidates}),
            )
            .await?;
        ctx.document
            .open_section(sections::EXECUTION_LOG, json!({}))
            .await?;

        let outcome = self.run_loop(&mut ctx, &tools).await?;

        ctx.document.finalize_section(sections::EXECUTION_LOG).await?;
        ctx.document
            .append_section(sections::OUTCOME, section_value(sections::OUTCOME, &outcome)?)
            .await?;
        let message = outcome.message();
        self.store
            .complete_turn(turn_id, outcome.status(), Some(&message))
            .await
            .map_err(TurnError::Store)?;

        let guard = ctx.guard.state();
        tracing::info!(
            turn = %turn_id,
            status = %outcome.status(),
            calls = guard.calls_made,
            "Turn finished"
        );
        Ok(TurnReport {
            turn_id,
            outcome,
            document: ctx.document.to_turn_document(),
            guard,
        })
    }

    async fn run_loop(
        &self,
        ctx: &mut TurnContext,
        tools: &[ToolInfo],
    ) -> Result<TurnOutcome, TurnError> {
        let decisions = self.decisions.as_ref();
        let retry = &self.config.retry;
        let planner = Planner::new(&self.config.planner, decisions, retry);
        let executor = Executor::new(&self.config.executor, decisions, retry, tools);
        let coordinator = Coordinator::new(
            &self.registry,
            &self.workflows,
            decisions,
            retry,
            self.config.workflow.threshold,
        );
        let gate = ValidationGate::new(self.config.validation.clone());

        let mut state = TurnState::Planning;
        let mut plan_request = PlanRequest::Initial;
        let mut replans = 0u32;
        let mut blocked = 0u32;
        let mut attempt = 0u32;
        let mut retries_done = 0u32;
        let mut revisions_done = 0u32;
        let mut feedback: Vec<String> = Vec::new();
        let mut pending: Option<Synthesis> = None;
        let mut steps = 0u32;

        loop {
            if ctx.guard.cancel_token().is_cancelled() {
                tracing::info!("Turn cancelled in state {:?}", state);
                return end(state, TurnState::Cancelled, TurnOutcome::Cancelled);
            }
            steps += 1;
            if steps > self.config.max_steps {
                return failed(
                    state,
                    format!("Turn did not finish within {} steps", self.config.max_steps),
                );
            }

            match state {
                TurnState::Planning => {
                    let generation = ctx.next_generation();
                    let request = std::mem::replace(&mut plan_request, PlanRequest::Initial);
                    let planned = match request {
                        PlanRequest::Initial => {
                            planner
                                .plan(&ctx.request, ctx.claims(), tools, generation)
                                .await
                        }
                        PlanRequest::Retry { issues } => {
                            let previous = ctx.goals().cloned().ok_or(TurnError::NoGoalSet)?;
                            planner
                                .retry(
                                    &ctx.request,
                                    &previous,
                                    issues,
                                    ctx.claims(),
                                    tools,
                                    generation,
                                )
                                .await
                        }
                        PlanRequest::Replan { reason } => {
                            let previous = ctx.goals().cloned().ok_or(TurnError::NoGoalSet)?;
                            planner
                                .replan(
                                    &ctx.request,
                                    &previous,
                                    &reason,
                                    ctx.claims(),
                                    tools,
                                    generation,
                                )
                                .await
                        }
                    };
                    let planned = match planned {
                        Ok(p) => p,
                        Err(e) => return failed(state, decision_failure("Planning", e)?),
                    };

                    match planned {
                        PlanOutcome::Planned(set) => {
                            let name = sections::plan(generation);
                            let content = section_value(&name, &set)?;
                            ctx.document.append_section(name, content).await?;
                            ctx.install_goals(set);
                            state = state.advance(TurnState::Executing)?;
                        }
                        PlanOutcome::Clarify(question) => {
                            return end(
                                state,
                                TurnState::AwaitingClarification,
                                TurnOutcome::NeedsClarification { question },
                            );
                        }
                        PlanOutcome::Rejected(reason) => {
                            return failed(state, format!("No usable plan: {}", reason));
                        }
                    }
                }

                TurnState::Executing => {
                    let decision = match executor.decide(ctx).await {
                        Ok(d) => d,
                        Err(e) => return failed(state, decision_failure("Execution", e)?),
                    };

                    match decision {
                        ExecutorDecision::Command(instruction) => {
                            let executed = coordinator.translate_and_execute(&instruction, ctx);
                            let outcome = match executed.await {
                                Ok(o) => o,
                                Err(e) => {
                                    let reason = decision_failure("Tool selection", e)?;
                                    return failed(state, reason);
                                }
                            };
                            if let CoordinatorOutcome::ClarificationNeeded { reason, .. } =
                                &outcome
                            {
                                tracing::info!(
                                    goal = %instruction.goal_id,
                                    "Clarification needed: {}",
                                    reason
                                );
                            }
                            ctx.log_call(&instruction, outcome, self.extractor.as_ref())
                                .await?;
                            state = state.advance(TurnState::Executing)?;
                        }
                        ExecutorDecision::Analyze { goal_id, summary } => {
                            ctx.log_achieved(&goal_id, &summary).await?;
                            state = state.advance(TurnState::Executing)?;
                        }
                        ExecutorDecision::Complete => {
                            tracing::info!(generation = ctx.generation(), "All goals achieved");
                            state = state.advance(TurnState::Synthesizing)?;
                        }
                        ExecutorDecision::Blocked(reason) => match &reason.kind {
                            BlockKind::PermissionDenied { tool } => {
                                let question = format!(
                                    "Running '{}' needs your approval: {}",
                                    tool, reason.message
                                );
                                return end(
                                    state,
                                    TurnState::AwaitingClarification,
                                    TurnOutcome::NeedsClarification { question },
                                );
                            }
                            BlockKind::Cancelled => {
                                return end(state, TurnState::Cancelled, TurnOutcome::Cancelled);
                            }
                            BlockKind::GuardDenied {
                                error_kind: ErrorKind::BudgetExceeded,
                            } => {
                                return failed(state, reason.message.clone());
                            }
                            _ => {
                                blocked += 1;
                                let name = sections::blocked(blocked);
                                let content = section_value(&name, &reason)?;
                                ctx.document.append_section(name, content).await?;

                                if replans >= self.config.planner.max_replans {
                                    return failed(
                                        state,
                                        format!(
                                            "Goal '{}' is blocked and no replans remain: {}",
                                            reason.goal_id, reason.message
                                        ),
                                    );
                                }
                                replans += 1;
                                tracing::info!(replans, "Replanning: {}", reason.message);
                                plan_request = PlanRequest::Replan {
                                    reason: reason.message,
                                };
                                state = state.advance(TurnState::Planning)?;
                            }
                        },
                    }
                }

                TurnState::Synthesizing => {
                    attempt += 1;
                    let goals = ctx.goals().ok_or(TurnError::NoGoalSet)?.goals().to_vec();
                    let input = DecisionInput::Synthesize {
                        request: ctx.request.clone(),
                        goals,
                        claims: ctx.claims().to_vec(),
                        feedback: feedback.clone(),
                    };
                    let synthesis = match decide_with_retry(decisions, retry, input).await {
                        Ok(Decision::Synthesis(s)) => s,
                        Ok(other) => {
                            return failed(
                                state,
                                format!("Synthesis failed: {}", other.mismatch("synthesize")),
                            );
                        }
                        Err(e) => return failed(state, format!("Synthesis failed: {}", e)),
                    };
                    let name = sections::synthesis(attempt);
                    let content = section_value(&name, &synthesis)?;
                    ctx.document.append_section(name, content).await?;
                    pending = Some(synthesis);
                    state = state.advance(TurnState::Validating)?;
                }

                TurnState::Validating => {
                    let Some(synthesis) = pending.take() else {
                        state = state.advance(TurnState::Synthesizing)?;
                        continue;
                    };
                    let achieved: Vec<GoalId> = ctx
                        .goals()
                        .ok_or(TurnError::NoGoalSet)?
                        .achieved()
                        .map(|g| g.id.clone())
                        .collect();
                    let result = gate.validate(
                        &synthesis,
                        ctx.claims(),
                        &achieved,
                        retries_done,
                        revisions_done,
                    );
                    let name = sections::validation(attempt);
                    let content = section_value(&name, &result)?;
                    ctx.document.append_section(name, content).await?;

                    match result.decision {
                        ValidationDecision::Approve => {
                            return end(
                                state,
                                TurnState::Done,
                                TurnOutcome::Approved {
                                    text: synthesis.text,
                                    confidence: result.confidence,
                                },
                            );
                        }
                        ValidationDecision::Revise => {
                            revisions_done += 1;
                            feedback = result.issues;
                            state = state.advance(TurnState::Synthesizing)?;
                        }
                        ValidationDecision::Retry => {
                            retries_done += 1;
                            revisions_done = 0;
                            feedback.clear();
                            plan_request = PlanRequest::Retry {
                                issues: result.issues,
                            };
                            state = state.advance(TurnState::Planning)?;
                        }
                        ValidationDecision::Fail => {
                            return failed(
                                state,
                                format!(
                                    "Answer failed validation: {}",
                                    result.issues.join("; ")
                                ),
                            );
                        }
                    }
                }

                terminal => {
                    return Err(TurnError::InvalidTransition {
                        from: terminal,
                        to: terminal,
                    });
                }
            }
        }
    }
}
