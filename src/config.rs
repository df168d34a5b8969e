//! Configuration management for goalrunner.
//!
//! Everything is read once at startup from `GOALRUNNER_*` environment
//! variables and then passed by value into the components that need it.
//! Nothing is mutated at runtime.
//!
//! - `GOALRUNNER_MAX_CALLS` - Tool calls per turn. Defaults to `20`.
//! - `GOALRUNNER_MAX_DURATION_SECS` - Wall-clock budget per turn. Defaults to `300`.
//! - `GOALRUNNER_MAX_COST_CENTS` - Estimated tool cost per turn. Defaults to `100`.
//! - `GOALRUNNER_SIGNATURE_VALUE_CHARS` - Argument value truncation for loop detection.
//!   Defaults to `64`.
//! - `GOALRUNNER_SIMILARITY_THRESHOLD` - Token similarity treated as "same call".
//!   Defaults to `1.0`.
//! - `GOALRUNNER_MAX_GOALS` - Goals per plan. Defaults to `6`.
//! - `GOALRUNNER_MAX_REPLANS` - Replans per turn. Defaults to `3`.
//! - `GOALRUNNER_MAX_ATTEMPTS_PER_GOAL` - Failed tool attempts per goal. Defaults to `3`.
//! - `GOALRUNNER_MAX_MALFORMED_CALLS` - Malformed calls per goal. Defaults to `3`.
//! - `GOALRUNNER_MAX_PERMISSION_DENIALS` - Approval denials per goal before blocking.
//!   Defaults to `2`.
//! - `GOALRUNNER_MAX_STEPS` - Loop iterations per turn. Defaults to `100`.
//! - `GOALRUNNER_MAX_RETRIES` - Validation RETRY decisions before FAIL. Defaults to `2`.
//! - `GOALRUNNER_MAX_REVISIONS` - Validation REVISE decisions before escalating. Defaults to `2`.
//! - `GOALRUNNER_WORKFLOW_DIR` - Optional. Directory of workflow YAML files.
//! - `GOALRUNNER_WORKFLOW_THRESHOLD` - Minimum match confidence. Defaults to `0.6`.
//! - `GOALRUNNER_EXECUTION_MODE` - `read_only`, `autonomous` or `supervised:<tools>`.
//!   Defaults to `read_only`.
//! - `GOALRUNNER_STORE` - `sqlite`, `file` or `memory`. Defaults to `sqlite`.
//! - `GOALRUNNER_DATA_DIR` - Turn store location. Defaults to `./.goalrunner`.
//! - `GOALRUNNER_WORKING_DIR` - Base directory for tool paths. Defaults to current directory.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::decision::RetryConfig;
use crate::store::StoreBackend;
use crate::tools::ExecutionMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Execution guard limits.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    pub max_calls: u32,
    pub max_duration: Duration,
    pub max_cost_cents: u64,
    /// Argument values are truncated to this many characters before signing
    pub value_truncate_chars: usize,
    /// Token similarity in `[0.0, 1.0]` at which two calls count as the same;
    /// `1.0` means identical after normalization
    pub similarity_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_calls: 20,
            max_duration: Duration::from_secs(300),
            max_cost_cents: 100,
            value_truncate_chars: 64,
            similarity_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    pub max_goals: usize,
    pub max_replans: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_goals: 6,
            max_replans: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub max_attempts_per_goal: u32,
    pub max_malformed_calls: u32,
    pub max_permission_denials: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_goal: 3,
            max_malformed_calls: 3,
            max_permission_denials: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    pub max_retries: u32,
    pub max_revisions: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_revisions: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub dir: Option<PathBuf>,
    /// Minimum match confidence for a workflow to be used
    pub threshold: f64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            dir: None,
            threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            data_dir: PathBuf::from("./.goalrunner"),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub guard: GuardConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub validation: ValidationConfig,
    pub workflow: WorkflowConfig,
    pub store: StoreConfig,
    /// Decision-service retries on transient errors
    pub retry: RetryConfig,
    pub execution_mode: ExecutionMode,
    /// Base directory for relative tool paths
    pub working_dir: PathBuf,
    /// Upper bound on loop iterations in one turn
    pub max_steps: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            validation: ValidationConfig::default(),
            workflow: WorkflowConfig::default(),
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            execution_mode: ExecutionMode::ReadOnly,
            working_dir: PathBuf::from("."),
            max_steps: 100,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn unit_interval(name: &str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("{} is outside [0.0, 1.0]", value),
        ))
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let guard = GuardConfig {
            max_calls: env_or("GOALRUNNER_MAX_CALLS", defaults.guard.max_calls)?,
            max_duration: Duration::from_secs(env_or(
                "GOALRUNNER_MAX_DURATION_SECS",
                defaults.guard.max_duration.as_secs(),
            )?),
            max_cost_cents: env_or("GOALRUNNER_MAX_COST_CENTS", defaults.guard.max_cost_cents)?,
            value_truncate_chars: env_or(
                "GOALRUNNER_SIGNATURE_VALUE_CHARS",
                defaults.guard.value_truncate_chars,
            )?,
            similarity_threshold: unit_interval(
                "GOALRUNNER_SIMILARITY_THRESHOLD",
                env_or(
                    "GOALRUNNER_SIMILARITY_THRESHOLD",
                    defaults.guard.similarity_threshold,
                )?,
            )?,
        };

        let planner = PlannerConfig {
            max_goals: env_or("GOALRUNNER_MAX_GOALS", defaults.planner.max_goals)?,
            max_replans: env_or("GOALRUNNER_MAX_REPLANS", defaults.planner.max_replans)?,
        };

        let executor = ExecutorConfig {
            max_attempts_per_goal: env_or(
                "GOALRUNNER_MAX_ATTEMPTS_PER_GOAL",
                defaults.executor.max_attempts_per_goal,
            )?,
            max_malformed_calls: env_or(
                "GOALRUNNER_MAX_MALFORMED_CALLS",
                defaults.executor.max_malformed_calls,
            )?,
            max_permission_denials: env_or(
                "GOALRUNNER_MAX_PERMISSION_DENIALS",
                defaults.executor.max_permission_denials,
            )?,
        };

        let validation = ValidationConfig {
            max_retries: env_or("GOALRUNNER_MAX_RETRIES", defaults.validation.max_retries)?,
            max_revisions: env_or("GOALRUNNER_MAX_REVISIONS", defaults.validation.max_revisions)?,
        };

        let workflow = WorkflowConfig {
            dir: std::env::var("GOALRUNNER_WORKFLOW_DIR").ok().map(PathBuf::from),
            threshold: unit_interval(
                "GOALRUNNER_WORKFLOW_THRESHOLD",
                env_or("GOALRUNNER_WORKFLOW_THRESHOLD", defaults.workflow.threshold)?,
            )?,
        };

        let store = StoreConfig {
            backend: env_or("GOALRUNNER_STORE", defaults.store.backend)?,
            data_dir: std::env::var("GOALRUNNER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store.data_dir),
        };

        let execution_mode = env_or("GOALRUNNER_EXECUTION_MODE", defaults.execution_mode)?;

        let working_dir = std::env::var("GOALRUNNER_WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let max_steps = env_or("GOALRUNNER_MAX_STEPS", defaults.max_steps)?;

        Ok(Self {
            guard,
            planner,
            executor,
            validation,
            workflow,
            store,
            retry: defaults.retry,
            execution_mode,
            working_dir,
            max_steps,
        })
    }
}
