//! Workflow definitions as loaded from YAML.
//!
//! ```yaml
//! name: inspect-config
//! trigger_patterns:
//!   - "read (the )?config"
//!   - inspect configuration
//! steps:
//!   - tool: read_file
//!     args_template:
//!       path: "{{path}}"
//! success_criteria:
//!   - status == success
//!   - payload.content exists
//! fallback:
//!   terminal_message: "Configuration could not be read"
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ToolResult, ToolStatus};

static CRITERION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"^\s*(?:status\s*==\s*(?P<status>[a-z_]+)"#,
        r#"|payload\s+contains\s+"(?P<text>[^"]*)""#,
        r#"|payload\.(?P<path>[A-Za-z0-9_.]+)\s+exists)\s*$"#,
    ))
    .expect("criterion regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub tool: String,
    #[serde(default)]
    pub args_template: Value,
}

/// Exactly one of the two fields is expected; `workflow_name` wins if both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_message: Option<String>,
}

/// What happens when a workflow's success criteria do not hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    Workflow(String),
    Terminal(String),
}

impl FallbackSpec {
    pub fn resolve(&self) -> Option<Fallback> {
        match (&self.workflow_name, &self.terminal_message) {
            (Some(name), _) => Some(Fallback::Workflow(name.clone())),
            (None, Some(message)) => Some(Fallback::Terminal(message.clone())),
            (None, None) => None,
        }
    }
}

/// Raw workflow file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_patterns: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub fallback: Option<FallbackSpec>,
}

/// A parsed success criterion.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    StatusEquals(ToolStatus),
    PayloadContains(String),
    FieldExists(Vec<String>),
}

impl Criterion {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let caps = CRITERION_RE
            .captures(expr)
            .ok_or_else(|| format!("unrecognized criterion '{}'", expr))?;

        if let Some(status) = caps.name("status") {
            return status.as_str().parse().map(Criterion::StatusEquals);
        }
        if let Some(text) = caps.name("text") {
            return Ok(Criterion::PayloadContains(text.as_str().to_string()));
        }
        if let Some(path) = caps.name("path") {
            return Ok(Criterion::FieldExists(
                path.as_str().split('.').map(str::to_string).collect(),
            ));
        }
        Err(format!("unrecognized criterion '{}'", expr))
    }

    pub fn holds(&self, result: &ToolResult) -> bool {
        match self {
            Criterion::StatusEquals(status) => result.status == *status,
            Criterion::PayloadContains(text) => match &result.payload {
                Value::String(s) => s.contains(text.as_str()),
                Value::Null => false,
                other => other.to_string().contains(text.as_str()),
            },
            Criterion::FieldExists(path) => {
                let mut current = &result.payload;
                for key in path {
                    match current.get(key) {
                        Some(next) => current = next,
                        None => return false,
                    }
                }
                !current.is_null()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_yaml_definition() {
        let yaml = r#"
name: inspect-config
trigger_patterns:
  - "read (the )?config"
steps:
  - tool: read_file
    args_template:
      path: "{{path}}"
success_criteria:
  - status == success
fallback:
  workflow_name: search-config
"#;
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.name, "inspect-config");
        assert_eq!(def.steps[0].args_template, json!({"path": "{{path}}"}));
        assert_eq!(
            def.fallback.and_then(|f| f.resolve()),
            Some(Fallback::Workflow("search-config".to_string()))
        );
    }

    #[test]
    fn test_criteria() {
        let payload = json!({"content": "port = 80", "meta": {"lines": 1}});
        let ok = ToolResult::success("read_file", payload, 1);

        assert!(Criterion::parse("status == success").unwrap().holds(&ok));
        assert!(Criterion::parse(r#"payload contains "port""#).unwrap().holds(&ok));
        assert!(Criterion::parse("payload.meta.lines exists").unwrap().holds(&ok));
        assert!(!Criterion::parse("payload.meta.size exists").unwrap().holds(&ok));

        let failed = ToolResult::error("read_file", crate::tools::ErrorKind::Execution, "no");
        assert!(!Criterion::parse("status == success").unwrap().holds(&failed));
        assert!(Criterion::parse("status == error").unwrap().holds(&failed));
    }

    #[test]
    fn test_bad_criteria_rejected() {
        assert!(Criterion::parse("status == fine").is_err());
        assert!(Criterion::parse("payload is big").is_err());
    }
}
