//! Coordinator - turns one instruction into exactly one guarded tool call.
//!
//! # Selection order
//! 1. The next step of the goal's running workflow
//! 2. A newly matched workflow (unless the strategy is `direct_only`)
//! 3. The tool named by the instruction
//! 4. A tool chosen by the decision service
//!
//! Every call goes through the execution guard first. A denied call is
//! reported as a skipped result and never reaches the registry.

use serde_json::{json, Map, Value};

use crate::agents::context::TurnContext;
use crate::agents::types::{CoordinatorOutcome, Instruction, WorkflowStepInfo};
use crate::decision::{decide_with_retry, Decision, DecisionInput, DecisionService, RetryConfig};
use crate::error::TurnError;
use crate::goal::{Goal, GoalError, Strategy};
use crate::guard::GuardDecision;
use crate::tools::{DispatchContext, ErrorKind, ToolCall, ToolRegistry, ToolResult};
use crate::workflow::{Bindings, RunProgress, WorkflowLibrary, WorkflowRun};

/// A workflow step picked for this call.
struct StepRef {
    workflow: String,
    step: usize,
}

pub struct Coordinator<'a> {
    registry: &'a ToolRegistry,
    workflows: &'a WorkflowLibrary,
    decisions: &'a dyn DecisionService,
    retry: &'a RetryConfig,
    /// Minimum trigger confidence for starting a workflow
    threshold: f64,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        workflows: &'a WorkflowLibrary,
        decisions: &'a dyn DecisionService,
        retry: &'a RetryConfig,
        threshold: f64,
    ) -> Self {
        Self {
            registry,
            workflows,
            decisions,
            retry,
            threshold,
        }
    }

    /// Select, check and dispatch one call for `instruction`.
    ///
    /// # Errors
    /// Only decision-service failures and unknown goals. Tool failures of
    /// every kind come back inside the outcome.
    pub async fn translate_and_execute(
        &self,
        instruction: &Instruction,
        ctx: &mut TurnContext,
    ) -> Result<CoordinatorOutcome, TurnError> {
        let goals = ctx.goals().ok_or(TurnError::NoGoalSet)?;
        let strategy = goals.strategy();
        let goal = goals
            .goal(&instruction.goal_id)
            .cloned()
            .ok_or_else(|| GoalError::NotFound(instruction.goal_id.clone()))?;

        let (tool, args, step) = match self.workflow_step(instruction, &goal, strategy, ctx) {
            Some((tool, args, step)) => (tool, args, Some(step)),
            None => match &instruction.tool {
                Some(tool) => (
                    tool.clone(),
                    instruction.args.clone().unwrap_or_else(|| json!({})),
                    None,
                ),
                None => match self.translate(instruction, &goal).await? {
                    Some((tool, args)) => (tool, args, None),
                    None => {
                        tracing::info!(
                            goal = %goal.id,
                            "No tool fits instruction: {}",
                            instruction.text
                        );
                        return Ok(CoordinatorOutcome::Executed {
                            call: None,
                            result: ToolResult::error(
                                "",
                                ErrorKind::UnknownTool,
                                format!("No tool fits instruction '{}'", instruction.text),
                            ),
                            workflow: None,
                        });
                    }
                },
            },
        };

        let call = ToolCall::new(tool, args, goal.id.clone());
        let cost = self.registry.estimated_cost_cents(&call.tool_name);
        let epoch = ctx.document.epoch();

        if let GuardDecision::Deny(reason) =
            ctx.guard
                .check_before_call(&call.tool_name, &call.args, cost, epoch)
        {
            tracing::info!(tool = %call.tool_name, "Call denied: {}", reason);
            let result = reason.into_result(&call.tool_name);
            let workflow = step.map(|s| {
                if let Some(run) = ctx.workflow_runs.get_mut(&goal.id) {
                    run.abandon(result.error.clone().unwrap_or_default());
                }
                WorkflowStepInfo {
                    workflow: s.workflow,
                    step: s.step,
                    finished: true,
                    succeeded: false,
                }
            });
            return Ok(CoordinatorOutcome::Executed {
                call: Some(call),
                result,
                workflow,
            });
        }

        let dispatch = DispatchContext {
            mode: ctx.mode.clone(),
            deadline: ctx.guard.deadline(),
            cancel: ctx.guard.cancel_token().clone(),
            working_dir: ctx.working_dir.clone(),
        };
        tracing::debug!(tool = %call.tool_name, goal = %goal.id, "Dispatching");
        let result = self.registry.dispatch(&call, &dispatch).await;
        ctx.guard.record(&call, &result, cost, epoch);

        let workflow = match (step, ctx.workflow_runs.get_mut(&goal.id)) {
            (Some(s), Some(run)) => {
                let progress = run.observe(self.workflows, &result);
                if let RunProgress::FellBack { to } = &progress {
                    tracing::info!(
                        goal = %goal.id,
                        "Workflow '{}' fell back to '{}'",
                        s.workflow,
                        to
                    );
                }
                Some(WorkflowStepInfo {
                    workflow: s.workflow,
                    step: s.step,
                    finished: matches!(
                        progress,
                        RunProgress::Succeeded | RunProgress::Abandoned { .. }
                    ),
                    succeeded: progress == RunProgress::Succeeded,
                })
            }
            _ => None,
        };

        if result.error_kind == Some(ErrorKind::PermissionDenied) {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| format!("Tool '{}' requires approval", call.tool_name));
            return Ok(CoordinatorOutcome::ClarificationNeeded {
                call,
                reason,
                result,
            });
        }

        Ok(CoordinatorOutcome::Executed {
            call: Some(call),
            result,
            workflow,
        })
    }

    /// Next workflow step for the goal, starting a run if one matches.
    ///
    /// A finished run is not restarted within the same generation.
    fn workflow_step(
        &self,
        instruction: &Instruction,
        goal: &Goal,
        strategy: Strategy,
        ctx: &mut TurnContext,
    ) -> Option<(String, Value, StepRef)> {
        let bindings = Bindings {
            goal: goal.description.clone(),
            instruction: instruction.text.clone(),
            args: match &instruction.args {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            },
        };

        if let Some(run) = ctx.workflow_runs.get_mut(&goal.id) {
            if !run.is_running() {
                return None;
            }
            return match run.next_call(self.workflows, &bindings) {
                Ok(Some((tool, args))) => Some((
                    tool,
                    args,
                    StepRef {
                        workflow: run.workflow().to_string(),
                        step: run.next_step(),
                    },
                )),
                Ok(None) => {
                    run.abandon(format!("Workflow '{}' has no further steps", run.workflow()));
                    None
                }
                Err(e) => {
                    tracing::warn!(
                        goal = %goal.id,
                        "Abandoning workflow '{}': {}",
                        run.workflow(),
                        e
                    );
                    run.abandon(e.to_string());
                    None
                }
            };
        }

        let threshold = match strategy {
            Strategy::DirectOnly => return None,
            Strategy::WorkflowFirst => self.threshold / 2.0,
            Strategy::Sequential => self.threshold,
        };
        let matched = self.workflows.find_match(&instruction.text, threshold)?;
        let run = WorkflowRun::start(&matched.name);
        match run.next_call(self.workflows, &bindings) {
            Ok(Some((tool, args))) => {
                tracing::info!(
                    goal = %goal.id,
                    confidence = matched.confidence,
                    "Starting workflow '{}'",
                    matched.name
                );
                ctx.workflow_runs.insert(goal.id.clone(), run);
                Some((
                    tool,
                    args,
                    StepRef {
                        workflow: matched.name,
                        step: 0,
                    },
                ))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Workflow '{}' matched but cannot run: {}", matched.name, e);
                None
            }
        }
    }

    async fn translate(
        &self,
        instruction: &Instruction,
        goal: &Goal,
    ) -> Result<Option<(String, Value)>, TurnError> {
        let input = DecisionInput::Translate {
            instruction: instruction.text.clone(),
            goal: goal.clone(),
            tools: self.registry.list_tools(),
        };
        match decide_with_retry(self.decisions, self.retry, input).await? {
            Decision::ToolChoice(choice) => Ok(choice.map(|c| (c.tool_name, c.args))),
            other => Err(other.mismatch("translate").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ToolChoice;
    use crate::goal::{GoalDraft, GoalId, GoalSet};
    use crate::test_support::{
        approval_tool, context_with, counting_tool, echo_tool, ScriptedDecisionService,
    };
    use crate::tools::ToolStatus;
    use crate::workflow::{WorkflowDefinition, WorkflowStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry(counter: &Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::empty();
        registry.register(echo_tool("echo")).unwrap();
        registry.register(counting_tool("search", Arc::clone(counter))).unwrap();
        registry.register(approval_tool("deploy", Arc::clone(counter))).unwrap();
        registry
    }

    fn inspect_workflow() -> WorkflowLibrary {
        WorkflowLibrary::from_definitions(vec![WorkflowDefinition {
            name: "inspect".to_string(),
            description: String::new(),
            trigger_patterns: vec!["inspect the config".to_string()],
            steps: vec![
                WorkflowStep {
                    tool: "echo".to_string(),
                    args_template: json!({"text": "{{instruction}}"}),
                },
                WorkflowStep {
                    tool: "search".to_string(),
                    args_template: json!({"text": "{{goal}}"}),
                },
            ],
            success_criteria: vec!["status == success".to_string()],
            fallback: None,
        }])
        .unwrap()
    }

    fn instruction(text: &str) -> Instruction {
        Instruction::new(GoalId::new("g1"), text)
    }

    #[tokio::test]
    async fn test_explicit_tool_is_dispatched() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry(&counter);
        let workflows = WorkflowLibrary::empty();
        let decisions = ScriptedDecisionService::new();
        let retry = RetryConfig::default();
        let coordinator = Coordinator::new(&registry, &workflows, &decisions, &retry, 0.6);
        let mut ctx = context_with(vec![GoalDraft::new("g1", "find it")]).await;

        let outcome = coordinator
            .translate_and_execute(
                &instruction("search").with_tool("search", json!({"text": "rust"})),
                &mut ctx,
            )
            .await
            .unwrap();
        assert_eq!(outcome.result().status, ToolStatus::Success);
        assert_eq!(outcome.result().payload, json!("rust"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.guard.state().calls_made, 1);
        assert!(decisions.inputs_of("translate").is_empty());
    }

    #[tokio::test]
    async fn test_translation_without_a_fitting_tool() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry(&counter);
        let workflows = WorkflowLibrary::empty();
        let decisions = ScriptedDecisionService::new();
        decisions.push("translate", Decision::ToolChoice(None));
        decisions.push(
            "translate",
            Decision::ToolChoice(Some(ToolChoice {
                tool_name: "echo".to_string(),
                args: json!({"text": "hi"}),
            })),
        );
        let retry = RetryConfig::default();
        let coordinator = Coordinator::new(&registry, &workflows, &decisions, &retry, 0.6);
        let mut ctx = context_with(vec![GoalDraft::new("g1", "greet")]).await;

        let outcome = coordinator
            .translate_and_execute(&instruction("say hi"), &mut ctx)
            .await
            .unwrap();
        match outcome {
            CoordinatorOutcome::Executed { call, result, .. } => {
                assert!(call.is_none());
                assert_eq!(result.error_kind, Some(ErrorKind::UnknownTool));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ctx.guard.state().calls_made, 0);

        let outcome = coordinator
            .translate_and_execute(&instruction("say hi"), &mut ctx)
            .await
            .unwrap();
        assert_eq!(outcome.result().payload, json!("hi"));
    }

    #[tokio::test]
    async fn test_repeated_call_is_denied_without_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry(&counter);
        let workflows = WorkflowLibrary::empty();
        let decisions = ScriptedDecisionService::new();
        let retry = RetryConfig::default();
        let coordinator = Coordinator::new(&registry, &workflows, &decisions, &retry, 0.6);
        let mut ctx = context_with(vec![GoalDraft::new("g1", "find it")]).await;
        let search = instruction("search").with_tool("search", json!({"text": "rust"}));

        coordinator.translate_and_execute(&search, &mut ctx).await.unwrap();
        let outcome = coordinator.translate_and_execute(&search, &mut ctx).await.unwrap();

        assert_eq!(outcome.result().status, ToolStatus::Skipped);
        assert_eq!(outcome.result().error_kind, Some(ErrorKind::LoopDetected));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_approval_tool_needs_clarification() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry(&counter);
        let workflows = WorkflowLibrary::empty();
        let decisions = ScriptedDecisionService::new();
        let retry = RetryConfig::default();
        let coordinator = Coordinator::new(&registry, &workflows, &decisions, &retry, 0.6);
        let mut ctx = context_with(vec![GoalDraft::new("g1", "ship")]).await;

        let outcome = coordinator
            .translate_and_execute(&instruction("deploy").with_tool("deploy", json!({})), &mut ctx)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CoordinatorOutcome::ClarificationNeeded { ref call, .. } if call.tool_name == "deploy"
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_workflow_steps_run_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry(&counter);
        let workflows = inspect_workflow();
        let decisions = ScriptedDecisionService::new();
        let retry = RetryConfig::default();
        let coordinator = Coordinator::new(&registry, &workflows, &decisions, &retry, 0.6);
        let mut ctx = context_with(vec![GoalDraft::new("g1", "config is readable")]).await;

        let first = coordinator
            .translate_and_execute(&instruction("Inspect the config"), &mut ctx)
            .await
            .unwrap();
        match first {
            CoordinatorOutcome::Executed { call, result, workflow } => {
                assert_eq!(call.unwrap().tool_name, "echo");
                assert_eq!(result.payload, json!("Inspect the config"));
                let info = workflow.unwrap();
                assert_eq!((info.step, info.finished), (0, false));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let second = coordinator
            .translate_and_execute(&instruction("Inspect the config"), &mut ctx)
            .await
            .unwrap();
        match second {
            CoordinatorOutcome::Executed { call, result, workflow } => {
                assert_eq!(call.unwrap().tool_name, "search");
                assert_eq!(result.payload, json!("config is readable"));
                let info = workflow.unwrap();
                assert_eq!((info.step, info.finished, info.succeeded), (1, true, true));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!ctx.workflow_runs[&GoalId::new("g1")].is_running());
    }

    #[tokio::test]
    async fn test_direct_only_strategy_skips_workflows() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = registry(&counter);
        let workflows = inspect_workflow();
        let decisions = ScriptedDecisionService::new();
        let retry = RetryConfig::default();
        let coordinator = Coordinator::new(&registry, &workflows, &decisions, &retry, 0.6);
        let mut ctx = context_with(vec![GoalDraft::new("g1", "x")]).await;
        let set = GoalSet::from_drafts(
            2,
            vec![GoalDraft::new("g1", "config is readable")],
            Strategy::DirectOnly,
            "",
            6,
        )
        .unwrap();
        ctx.install_goals(set);

        let outcome = coordinator
            .translate_and_execute(
                &instruction("Inspect the config").with_tool("search", json!({"text": "config"})),
                &mut ctx,
            )
            .await
            .unwrap();
        match outcome {
            CoordinatorOutcome::Executed { call, workflow, .. } => {
                assert_eq!(call.unwrap().tool_name, "search");
                assert!(workflow.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(ctx.workflow_runs.is_empty());
    }
}
