//! Planner - turns the request (or a blocked goal set) into a new goal set.
//!
//! # Invariants
//! - Every goal set it returns passes `GoalSet::from_drafts` validation
//! - A replan or retry never returns a set identical to the one it replaces

use crate::config::PlannerConfig;
use crate::decision::{decide_with_retry, Decision, DecisionInput, DecisionService, RetryConfig};
use crate::error::TurnError;
use crate::goal::GoalSet;
use crate::state::Claim;
use crate::tools::ToolInfo;

/// Attempts per plan request; a rejected draft is sent back once with the reason.
const PLAN_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Planned(GoalSet),
    /// The request is too ambiguous to plan
    Clarify(String),
    /// No acceptable goal set was produced
    Rejected(String),
}

pub struct Planner<'a> {
    config: &'a PlannerConfig,
    decisions: &'a dyn DecisionService,
    retry: &'a RetryConfig,
}

impl<'a> Planner<'a> {
    pub fn new(
        config: &'a PlannerConfig,
        decisions: &'a dyn DecisionService,
        retry: &'a RetryConfig,
    ) -> Self {
        Self {
            config,
            decisions,
            retry,
        }
    }

    /// Plan from the request and what is known so far.
    pub async fn plan(
        &self,
        request: &str,
        claims: &[Claim],
        tools: &[ToolInfo],
        generation: u32,
    ) -> Result<PlanOutcome, TurnError> {
        self.plan_with(request, None, Vec::new(), claims, tools, generation)
            .await
    }

    /// Plan again after `previous` failed validation.
    ///
    /// `issues` go back to the planner as feedback. A set identical to
    /// `previous` counts as a rejected draft.
    pub async fn retry(
        &self,
        request: &str,
        previous: &GoalSet,
        issues: Vec<String>,
        claims: &[Claim],
        tools: &[ToolInfo],
        generation: u32,
    ) -> Result<PlanOutcome, TurnError> {
        self.plan_with(request, Some(previous), issues, claims, tools, generation)
            .await
    }

    async fn plan_with(
        &self,
        request: &str,
        previous: Option<&GoalSet>,
        feedback: Vec<String>,
        claims: &[Claim],
        tools: &[ToolInfo],
        generation: u32,
    ) -> Result<PlanOutcome, TurnError> {
        let mut feedback = feedback;
        let mut last_error = String::new();

        for attempt in 1..=PLAN_ATTEMPTS {
            let input = DecisionInput::Plan {
                request: request.to_string(),
                context: claims.to_vec(),
                tools: tools.to_vec(),
                max_goals: self.config.max_goals,
                feedback: feedback.clone(),
            };
            let rejected = match self.accept(input, "plan", generation).await? {
                Ok(PlanOutcome::Planned(set))
                    if previous.is_some_and(|p| set.is_identical_to(p)) =>
                {
                    "Plan repeats the goal set that failed validation".to_string()
                }
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            tracing::warn!(attempt, "Rejected plan: {}", rejected);
            feedback.push(format!("Rejected plan: {}", rejected));
            last_error = rejected;
        }
        Ok(PlanOutcome::Rejected(last_error))
    }

    /// Plan again after `previous` got stuck.
    pub async fn replan(
        &self,
        request: &str,
        previous: &GoalSet,
        blocked_reason: &str,
        claims: &[Claim],
        tools: &[ToolInfo],
        generation: u32,
    ) -> Result<PlanOutcome, TurnError> {
        let input = DecisionInput::Replan {
            request: request.to_string(),
            previous: previous.clone(),
            blocked_reason: blocked_reason.to_string(),
            context: claims.to_vec(),
            tools: tools.to_vec(),
            max_goals: self.config.max_goals,
        };
        match self.accept(input, "replan", generation).await? {
            Ok(PlanOutcome::Planned(set)) if set.is_identical_to(previous) => {
                tracing::warn!(generation, "Replan repeated the previous goal set");
                Ok(PlanOutcome::Rejected(
                    "Replan produced the same goal set as before".to_string(),
                ))
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(PlanOutcome::Rejected(e)),
        }
    }

    /// Ask once and validate. The inner `Err` is a draft the planner refused.
    async fn accept(
        &self,
        input: DecisionInput,
        kind: &str,
        generation: u32,
    ) -> Result<Result<PlanOutcome, String>, TurnError> {
        let decision = decide_with_retry(self.decisions, self.retry, input).await?;
        let draft = match decision {
            Decision::Plan(draft) => draft,
            Decision::Clarify { question } => return Ok(Ok(PlanOutcome::Clarify(question))),
            other => return Err(other.mismatch(kind).into()),
        };

        match GoalSet::from_drafts(
            generation,
            draft.goals,
            draft.strategy,
            draft.rationale,
            self.config.max_goals,
        ) {
            Ok(set) => {
                tracing::info!(
                    generation,
                    goals = set.goals().len(),
                    strategy = ?set.strategy(),
                    "Goal set planned"
                );
                Ok(Ok(PlanOutcome::Planned(set)))
            }
            Err(e) => Ok(Err(e.to_string())),
        }
    }
}
