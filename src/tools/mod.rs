//! Tool registry and dispatcher.
//!
//! Tools are the only way a turn touches the outside world. The registry is
//! built once at startup and shared read-only between concurrent turns.
//!
//! ## Workspace-First Design
//!
//! File tools work **relative to the working directory** by default:
//! - Relative paths (e.g., `output/report.md`) resolve from the working directory
//! - Absolute paths (e.g., `/etc/hosts`) are used as-is
//!
//! # Dispatch contract
//! 1. Unknown tool names fail with `UnknownTool`
//! 2. Arguments are validated against the tool's schema before anything runs
//! 3. Approval-tier tools must be allowed by the caller's [`ExecutionMode`]
//! 4. The handler runs in its own task under a timeout bounded by the turn
//!    deadline; errors, panics, timeouts and cancellation all come back as a
//!    typed [`ToolResult`]

mod file_ops;
mod result;
pub mod schema;

pub use file_ops::{ReadFile, WriteFile};
pub use result::{
    matches_wildcard, DispatchContext, ErrorKind, ExecutionMode, PermissionTier, ToolCall,
    ToolResult, ToolStatus,
};
pub use schema::{ArgError, ArgSchema};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

// ============================================================================
// Path Resolution Utilities
// ============================================================================

/// Result of resolving a path relative to the working directory.
#[derive(Debug, Clone)]
pub struct PathResolution {
    /// The original path string provided by the caller.
    pub original: String,
    /// The fully resolved path.
    pub resolved: PathBuf,
    /// Whether the resolved path is outside the working directory.
    pub is_outside_workspace: bool,
    /// Whether the original path was absolute.
    pub was_absolute: bool,
}

/// Resolve a path relative to the working directory.
///
/// - Relative paths are joined with `workspace`
/// - Absolute paths are used as-is
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathResolution {
    let path = Path::new(path_str);
    let was_absolute = path.is_absolute();

    let resolved = if was_absolute {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    // Canonicalize for accurate comparison (handles .., symlinks, etc.)
    let canonical_resolved = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
    let canonical_workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let is_outside_workspace = !canonical_resolved.starts_with(&canonical_workspace);

    PathResolution {
        original: path_str.to_string(),
        resolved,
        is_outside_workspace,
        was_absolute,
    }
}

// ============================================================================
// Tool Trait and Registry
// ============================================================================

/// Information about a tool, as offered to the decision service.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub permission_tier: PermissionTier,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    fn permission_tier(&self) -> PermissionTier {
        PermissionTier::Open
    }

    /// Upper bound on one execution. The turn deadline may cut it shorter.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Estimated cost of one call, charged against the turn's cost budget.
    fn estimated_cost_cents(&self) -> u64 {
        0
    }

    /// Execute the tool with validated arguments.
    ///
    /// The `working_dir` is the default directory for relative paths.
    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<Value>;
}

/// Boxed async handler for closure-backed tools.
pub type ToolHandler =
    Arc<dyn Fn(Value, PathBuf) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value, PathBuf) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args, dir| -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(f(args, dir))
    })
}

/// A tool defined by a schema and a closure.
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    tier: PermissionTier,
    timeout: Duration,
    handler: ToolHandler,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        schema: Value,
        tier: PermissionTier,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            tier,
            timeout: Duration::from_secs(30),
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn permission_tier(&self) -> PermissionTier {
        self.tier
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<Value> {
        (self.handler)(args, working_dir.to_path_buf()).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: ArgSchema,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry with the built-in file tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let builtins: [Arc<dyn Tool>; 2] = [Arc::new(ReadFile), Arc::new(WriteFile)];
        for tool in builtins {
            // Names are distinct constants.
            let _ = registry.register(tool);
        }
        tracing::debug!("Registry created with {} built-in tools", registry.tools.len());
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        let schema = ArgSchema::from_json_schema(&tool.parameters_schema());
        self.tools.insert(name, RegisteredTool { tool, schema });
        Ok(())
    }

    /// Register a closure-backed tool.
    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        tier: PermissionTier,
        handler: ToolHandler,
    ) -> Result<(), RegistryError> {
        self.register(Arc::new(FnTool::new(name, schema, tier, handler)))
    }

    /// List all available tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|r| ToolInfo {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                parameters: r.tool.parameters_schema(),
                permission_tier: r.tool.permission_tier(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn permission_tier(&self, name: &str) -> Option<PermissionTier> {
        self.tools.get(name).map(|r| r.tool.permission_tier())
    }

    pub fn estimated_cost_cents(&self, name: &str) -> u64 {
        self.tools
            .get(name)
            .map(|r| r.tool.estimated_cost_cents())
            .unwrap_or(0)
    }

    /// Dispatch one call. Never panics and never returns an error: every
    /// failure mode is a typed [`ToolResult`].
    pub async fn dispatch(&self, call: &ToolCall, ctx: &DispatchContext) -> ToolResult {
        let name = call.tool_name.as_str();
        let Some(entry) = self.tools.get(name) else {
            return ToolResult::error(
                name,
                ErrorKind::UnknownTool,
                format!("Unknown tool: {}", name),
            );
        };

        if let Err(e) = entry.schema.validate(&call.args) {
            let kind = match e {
                ArgError::UnknownField(_) => ErrorKind::UnknownArgument,
                _ => ErrorKind::Validation,
            };
            return ToolResult::error(name, kind, e.to_string());
        }

        let tier = entry.tool.permission_tier();
        if !ctx.mode.allows(name, tier) {
            tracing::warn!(tool = name, "Tool requires approval in the current execution mode");
            return ToolResult::requires_approval(
                name,
                format!("Tool '{}' requires approval", name),
            );
        }

        if ctx.cancel.is_cancelled() {
            return ToolResult::error(name, ErrorKind::Cancelled, "Turn was cancelled");
        }

        let started = tokio::time::Instant::now();
        let remaining = ctx.deadline.saturating_duration_since(started);
        let limit = entry.tool.timeout().min(remaining);
        if limit.is_zero() {
            return ToolResult::error(name, ErrorKind::Timeout, "Turn deadline already passed");
        }

        let tool = Arc::clone(&entry.tool);
        let args = call.args.clone();
        let working_dir = ctx.working_dir.clone();
        let mut handle = tokio::spawn(async move { tool.execute(args, &working_dir).await });
        let abort = handle.abort_handle();

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                abort.abort();
                ToolResult::error(name, ErrorKind::Cancelled, "Cancelled during execution")
            }
            joined = tokio::time::timeout(limit, &mut handle) => match joined {
                Err(_) => {
                    abort.abort();
                    tracing::warn!(tool = name, "Tool timed out after {:?}", limit);
                    ToolResult::error(
                        name,
                        ErrorKind::Timeout,
                        format!("Timed out after {} ms", limit.as_millis()),
                    )
                }
                Ok(Err(join_err)) => {
                    let message = if join_err.is_panic() {
                        "Tool handler panicked".to_string()
                    } else {
                        format!("Tool task failed: {}", join_err)
                    };
                    tracing::warn!(tool = name, "{}", message);
                    ToolResult::error(name, ErrorKind::Execution, message)
                }
                Ok(Ok(Err(e))) => ToolResult::error(name, ErrorKind::Execution, e.to_string()),
                Ok(Ok(Ok(payload))) => ToolResult::success(name, payload, 0),
            }
        };

        result.with_duration(started.elapsed().as_millis() as u64)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalId;
    use crate::test_support::{echo_tool, failing_tool, panicking_tool, slow_tool};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx(mode: ExecutionMode) -> DispatchContext {
        DispatchContext {
            mode,
            deadline: tokio::time::Instant::now() + Duration::from_secs(300),
            cancel: CancellationToken::new(),
            working_dir: std::env::temp_dir(),
        }
    }

    fn call(tool: &str, args: Value) -> ToolCall {
        ToolCall::new(tool, args, GoalId::new("g1"))
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::empty();
        registry.register(echo_tool("echo")).unwrap();
        registry.register(slow_tool("slow", Duration::from_secs(60))).unwrap();
        registry.register(failing_tool("fails")).unwrap();
        registry.register(panicking_tool("panics")).unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        assert_eq!(
            registry.register(echo_tool("echo")),
            Err(RegistryError::DuplicateTool("echo".to_string()))
        );
    }

    #[tokio::test]
    async fn test_success() {
        let result = registry()
            .dispatch(&call("echo", json!({"text": "hi"})), &ctx(ExecutionMode::ReadOnly))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.payload, json!("hi"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args() {
        let registry = registry();
        let c = ctx(ExecutionMode::Autonomous);

        let r = registry.dispatch(&call("nope", json!({})), &c).await;
        assert_eq!(r.error_kind, Some(ErrorKind::UnknownTool));

        let r = registry.dispatch(&call("echo", json!({})), &c).await;
        assert_eq!(r.error_kind, Some(ErrorKind::Validation));

        let r = registry
            .dispatch(&call("echo", json!({"text": "x", "loud": true})), &c)
            .await;
        assert_eq!(r.error_kind, Some(ErrorKind::UnknownArgument));
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_are_contained() {
        let registry = registry();
        let c = ctx(ExecutionMode::ReadOnly);

        let r = registry.dispatch(&call("fails", json!({})), &c).await;
        assert_eq!(r.status, ToolStatus::Error);
        assert_eq!(r.error_kind, Some(ErrorKind::Execution));

        let r = registry.dispatch(&call("panics", json!({})), &c).await;
        assert_eq!(r.status, ToolStatus::Error);
        assert_eq!(r.error_kind, Some(ErrorKind::Execution));
        assert_eq!(r.error.as_deref(), Some("Tool handler panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounded_by_deadline() {
        let registry = registry();
        let mut c = ctx(ExecutionMode::ReadOnly);
        c.deadline = tokio::time::Instant::now() + Duration::from_secs(5);

        let r = registry.dispatch(&call("slow", json!({})), &c).await;
        assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
        assert!(r.duration_ms >= 5_000 && r.duration_ms < 6_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_call() {
        let registry = registry();
        let c = ctx(ExecutionMode::ReadOnly);
        let cancel = c.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let r = registry.dispatch(&call("slow", json!({})), &c).await;
        assert_eq!(r.error_kind, Some(ErrorKind::Cancelled));
        assert!(r.payload.is_null());
    }

    #[tokio::test]
    async fn test_approval_gate_runs_before_handler() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut registry = ToolRegistry::empty();
        registry
            .register_fn(
                "deploy",
                json!({"type": "object", "properties": {}}),
                PermissionTier::RequiresApproval,
                handler_fn(move |_args, _dir| {
                    let flag = Arc::clone(&flag);
                    async move {
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        Ok(json!("deployed"))
                    }
                }),
            )
            .unwrap();

        let r = registry
            .dispatch(&call("deploy", json!({})), &ctx(ExecutionMode::ReadOnly))
            .await;
        assert_eq!(r.status, ToolStatus::RequiresApproval);
        assert_eq!(r.error_kind, Some(ErrorKind::PermissionDenied));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));

        let r = registry
            .dispatch(
                &call("deploy", json!({})),
                &ctx(ExecutionMode::supervised(["deploy"])),
            )
            .await;
        assert_eq!(r.status, ToolStatus::Success);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["read_file", "write_file"]);
        assert_eq!(
            registry.permission_tier("write_file"),
            Some(PermissionTier::RequiresApproval)
        );
    }
}
