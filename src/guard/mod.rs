//! Execution guard: per-turn anti-runaway limits.
//!
//! Consulted before every dispatch, informed after every dispatch. The guard
//! is owned by exactly one turn and never shared.
//!
//! # Invariants
//! - `calls_made <= max_calls`; the call after the last allowed one is denied
//!   before it is dispatched
//! - Two materially identical calls never both succeed without a new document
//!   section between them

mod budget;
mod signature;

pub use budget::{BudgetError, CallBudget};
pub use signature::CallSignature;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GuardConfig;
use crate::tools::{ErrorKind, ToolCall, ToolResult};

/// Why a call was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    BudgetExceeded(String),
    LoopDetected { tool_name: String, epoch: u64 },
    Cancelled,
}

impl DenyReason {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            DenyReason::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            DenyReason::LoopDetected { .. } => ErrorKind::LoopDetected,
            DenyReason::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The skipped result the coordinator reports in place of a dispatch.
    pub fn into_result(self, tool_name: &str) -> ToolResult {
        ToolResult::skipped(tool_name, self.error_kind(), self.to_string())
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::BudgetExceeded(what) => write!(f, "Budget exceeded: {}", what),
            DenyReason::LoopDetected { tool_name, epoch } => write!(
                f,
                concat!(
                    "Loop detected: '{}' already succeeded with the same arguments ",
                    "and nothing new was learned since (epoch {})"
                ),
                tool_name, epoch
            ),
            DenyReason::Cancelled => write!(f, "Turn was cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Deny(DenyReason),
}

/// Read-only snapshot of the guard's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    pub calls_made: u32,
    pub wall_clock_elapsed_ms: u64,
    pub distinct_call_signatures_seen: usize,
    pub spent_cents: u64,
    pub max_calls: u32,
    pub max_duration_ms: u64,
    pub max_cost_cents: u64,
}

struct SuccessRecord {
    signature: CallSignature,
    epoch: u64,
}

pub struct ExecutionGuard {
    config: GuardConfig,
    budget: CallBudget,
    started: Instant,
    cancel: CancellationToken,
    successes: Vec<SuccessRecord>,
    seen: HashSet<String>,
}

impl ExecutionGuard {
    /// Start the clock for a new turn.
    pub fn new(config: GuardConfig, cancel: CancellationToken) -> Self {
        let budget = CallBudget::new(config.max_calls, config.max_duration, config.max_cost_cents);
        Self {
            config,
            budget,
            started: Instant::now(),
            cancel,
            successes: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Instant at which the turn's wall-clock budget runs out.
    pub fn deadline(&self) -> Instant {
        self.started + self.config.max_duration
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Decide whether a call may be dispatched.
    ///
    /// Checks, in order: cancellation, call count, wall clock, cost, loop.
    /// `epoch` is the document's current section count.
    pub fn check_before_call(
        &self,
        tool_name: &str,
        args: &Value,
        cost_cents: u64,
        epoch: u64,
    ) -> GuardDecision {
        if self.cancel.is_cancelled() {
            return GuardDecision::Deny(DenyReason::Cancelled);
        }
        if self.budget.calls_exhausted() {
            return GuardDecision::Deny(DenyReason::BudgetExceeded(format!(
                "{} of {} tool calls used",
                self.budget.calls_made(),
                self.budget.max_calls()
            )));
        }
        let elapsed = self.elapsed();
        if self.budget.duration_exhausted(elapsed) {
            return GuardDecision::Deny(DenyReason::BudgetExceeded(format!(
                "{}s of {}s wall clock used",
                elapsed.as_secs(),
                self.budget.max_duration().as_secs()
            )));
        }
        if !self.budget.can_afford(cost_cents) {
            return GuardDecision::Deny(DenyReason::BudgetExceeded(format!(
                "call costs {} cents, {} of {} cents already spent",
                cost_cents,
                self.budget.spent_cents(),
                self.budget.max_cost_cents()
            )));
        }

        let signature = CallSignature::new(tool_name, args, self.config.value_truncate_chars);
        let repeated = self.successes.iter().any(|s| {
            s.epoch == epoch
                && s.signature
                    .materially_identical(&signature, self.config.similarity_threshold)
        });
        if repeated {
            tracing::warn!(tool = tool_name, epoch, "Denying repeated call without new context");
            return GuardDecision::Deny(DenyReason::LoopDetected {
                tool_name: tool_name.to_string(),
                epoch,
            });
        }

        GuardDecision::Allow
    }

    /// Record a dispatched call, successful or not.
    pub fn record(&mut self, call: &ToolCall, result: &ToolResult, cost_cents: u64, epoch: u64) {
        if let Err(e) = self.budget.charge(cost_cents) {
            // Only reachable when a caller skipped check_before_call.
            tracing::warn!("Recording call past budget: {}", e);
        }

        let signature =
            CallSignature::new(&call.tool_name, &call.args, self.config.value_truncate_chars);
        self.seen.insert(signature.digest().to_string());
        if result.is_success() {
            self.successes.push(SuccessRecord { signature, epoch });
        }
    }

    pub fn state(&self) -> GuardState {
        GuardState {
            calls_made: self.budget.calls_made(),
            wall_clock_elapsed_ms: self.elapsed().as_millis() as u64,
            distinct_call_signatures_seen: self.seen.len(),
            spent_cents: self.budget.spent_cents(),
            max_calls: self.budget.max_calls(),
            max_duration_ms: self.budget.max_duration().as_millis() as u64,
            max_cost_cents: self.budget.max_cost_cents(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalId;
    use serde_json::json;

    fn guard(config: GuardConfig) -> ExecutionGuard {
        ExecutionGuard::new(config, CancellationToken::new())
    }

    fn allow_and_record(
        g: &mut ExecutionGuard,
        tool: &str,
        args: Value,
        epoch: u64,
        ok: bool,
    ) -> GuardDecision {
        let decision = g.check_before_call(tool, &args, 0, epoch);
        if decision == GuardDecision::Allow {
            let call = ToolCall::new(tool, args, GoalId::new("g1"));
            let result = if ok {
                ToolResult::success(tool, json!("done"), 1)
            } else {
                ToolResult::error(tool, ErrorKind::Execution, "boom")
            };
            g.record(&call, &result, 0, epoch);
        }
        decision
    }

    #[test]
    fn test_call_budget_denies_the_next_call() {
        let mut g = guard(GuardConfig {
            max_calls: 3,
            ..GuardConfig::default()
        });
        for i in 0..3 {
            assert_eq!(
                allow_and_record(&mut g, "search", json!({"q": i}), 0, true),
                GuardDecision::Allow
            );
        }
        assert!(matches!(
            g.check_before_call("search", &json!({"q": 99}), 0, 0),
            GuardDecision::Deny(DenyReason::BudgetExceeded(_))
        ));
        assert_eq!(g.state().calls_made, 3);
    }

    #[test]
    fn test_repeat_success_without_new_section_is_a_loop() {
        let mut g = guard(GuardConfig::default());
        let args = json!({"q": "tokio shutdown"});
        assert_eq!(allow_and_record(&mut g, "search", args.clone(), 2, true), GuardDecision::Allow);

        let denied = g.check_before_call("search", &args, 0, 2);
        assert_eq!(
            denied,
            GuardDecision::Deny(DenyReason::LoopDetected {
                tool_name: "search".to_string(),
                epoch: 2
            })
        );

        // New section arrived: same call is allowed again.
        assert_eq!(g.check_before_call("search", &args, 0, 3), GuardDecision::Allow);
        // Different arguments are always allowed.
        assert_eq!(
            g.check_before_call("search", &json!({"q": "tokio select"}), 0, 2),
            GuardDecision::Allow
        );
    }

    #[test]
    fn test_failed_calls_do_not_arm_loop_detection() {
        let mut g = guard(GuardConfig::default());
        let args = json!({"path": "a.txt"});
        allow_and_record(&mut g, "read_file", args.clone(), 1, false);
        assert_eq!(g.check_before_call("read_file", &args, 0, 1), GuardDecision::Allow);
        assert_eq!(g.state().calls_made, 1);
        assert_eq!(g.state().distinct_call_signatures_seen, 1);
    }

    #[test]
    fn test_cost_budget() {
        let g = guard(GuardConfig {
            max_cost_cents: 10,
            ..GuardConfig::default()
        });
        assert_eq!(g.check_before_call("paid", &json!({}), 10, 0), GuardDecision::Allow);
        assert!(matches!(
            g.check_before_call("paid", &json!({}), 11, 0),
            GuardDecision::Deny(DenyReason::BudgetExceeded(_))
        ));
    }

    #[test]
    fn test_cancelled_turn_denies_everything() {
        let cancel = CancellationToken::new();
        let g = ExecutionGuard::new(GuardConfig::default(), cancel.clone());
        cancel.cancel();
        assert_eq!(
            g.check_before_call("read_file", &json!({}), 0, 0),
            GuardDecision::Deny(DenyReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_budget() {
        let g = guard(GuardConfig {
            max_duration: Duration::from_secs(10),
            ..GuardConfig::default()
        });
        assert_eq!(g.check_before_call("x", &json!({}), 0, 0), GuardDecision::Allow);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            g.check_before_call("x", &json!({}), 0, 0),
            GuardDecision::Deny(DenyReason::BudgetExceeded(_))
        ));
    }
}
