//! Workflow library: declared multi-step shortcuts for recurring instructions.
//!
//! A workflow is matched against instruction text by its trigger patterns.
//! Each pattern is tried as a case-insensitive regex (a hit is confidence
//! 1.0) and as a plain phrase (confidence is the share of the phrase's words
//! present in the text). The best pattern decides the workflow's confidence.

mod definition;
mod run;

pub use definition::{Criterion, Fallback, FallbackSpec, WorkflowDefinition, WorkflowStep};
pub use run::{Bindings, RunProgress, RunState, TemplateError, WorkflowRun};

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use regex::{Regex, RegexBuilder};

const STOP_WORDS: &[&str] = &["a", "an", "and", "for", "in", "of", "on", "or", "the", "to", "with"];

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct Trigger {
    regex: Option<Regex>,
    tokens: HashSet<String>,
}

impl Trigger {
    fn new(pattern: &str) -> Self {
        Self {
            regex: RegexBuilder::new(pattern).case_insensitive(true).build().ok(),
            tokens: tokenize(pattern),
        }
    }

    fn confidence(&self, text: &str, text_tokens: &HashSet<String>) -> f64 {
        if self.regex.as_ref().is_some_and(|r| r.is_match(text)) {
            return 1.0;
        }
        if self.tokens.is_empty() {
            return 0.0;
        }
        self.tokens.intersection(text_tokens).count() as f64 / self.tokens.len() as f64
    }
}

/// A validated workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    /// Empty means "the last step succeeded"
    pub criteria: Vec<Criterion>,
    pub fallback: Option<Fallback>,
    triggers: Vec<Trigger>,
}

impl Workflow {
    fn compile(def: WorkflowDefinition) -> Result<Self, WorkflowError> {
        if def.steps.is_empty() {
            return Err(WorkflowError::NoSteps(def.name));
        }
        let criteria = def
            .success_criteria
            .iter()
            .map(|c| Criterion::parse(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| WorkflowError::InvalidCriterion {
                workflow: def.name.clone(),
                reason,
            })?;

        Ok(Self {
            triggers: def.trigger_patterns.iter().map(|p| Trigger::new(p)).collect(),
            fallback: def.fallback.as_ref().and_then(FallbackSpec::resolve),
            name: def.name,
            description: def.description,
            steps: def.steps,
            criteria,
        })
    }

    /// Best trigger confidence for `text`, in `[0.0, 1.0]`.
    pub fn confidence(&self, text: &str) -> f64 {
        let tokens = tokenize(text);
        self.triggers
            .iter()
            .map(|t| t.confidence(text, &tokens))
            .fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowMatch {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow directory {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse workflow file {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("Workflow '{0}' is defined more than once")]
    DuplicateName(String),

    #[error("Workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("Workflow '{workflow}': {reason}")]
    InvalidCriterion { workflow: String, reason: String },

    #[error("Workflow '{workflow}' falls back to unknown workflow '{target}'")]
    UnknownFallback { workflow: String, target: String },
}

/// Read-only set of workflows, shared between turns.
#[derive(Debug, Clone, Default)]
pub struct WorkflowLibrary {
    workflows: BTreeMap<String, Workflow>,
}

impl WorkflowLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<Self, WorkflowError> {
        let mut workflows = BTreeMap::new();
        for def in definitions {
            if workflows.contains_key(&def.name) {
                return Err(WorkflowError::DuplicateName(def.name));
            }
            let workflow = Workflow::compile(def)?;
            workflows.insert(workflow.name.clone(), workflow);
        }

        for workflow in workflows.values() {
            if let Some(Fallback::Workflow(target)) = &workflow.fallback {
                if !workflows.contains_key(target) {
                    return Err(WorkflowError::UnknownFallback {
                        workflow: workflow.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        Ok(Self { workflows })
    }

    /// Load every `*.yaml` / `*.yml` file in `dir` (one workflow per file).
    pub async fn load_dir(dir: &Path) -> Result<Self, WorkflowError> {
        let io_err = |e: std::io::Error| WorkflowError::Io {
            path: dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path
                .extension()
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
        files.sort();

        let mut definitions = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read_to_string(&file).await.map_err(io_err)?;
            let def: WorkflowDefinition =
                serde_yaml::from_str(&content).map_err(|e| WorkflowError::Parse {
                    file: file.display().to_string(),
                    reason: e.to_string(),
                })?;
            definitions.push(def);
        }

        let library = Self::from_definitions(definitions)?;
        tracing::info!("Loaded {} workflows from {}", library.len(), dir.display());
        Ok(library)
    }

    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Workflow names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    /// Confidence of every workflow for `text`, best first (ties by name).
    pub fn rank(&self, text: &str) -> Vec<WorkflowMatch> {
        let mut matches: Vec<WorkflowMatch> = self
            .workflows
            .values()
            .map(|w| WorkflowMatch {
                name: w.name.clone(),
                confidence: w.confidence(text),
            })
            .filter(|m| m.confidence > 0.0)
            .collect();
        // BTreeMap order is by name; a stable sort keeps it among equals.
        matches.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        matches
    }

    /// Best workflow for `text` at or above `threshold`.
    pub fn find_match(&self, text: &str, threshold: f64) -> Option<WorkflowMatch> {
        self.rank(text)
            .into_iter()
            .next()
            .filter(|m| m.confidence >= threshold)
    }
}
