//! Goal sets: the planner's output for one generation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{Goal, GoalError, GoalId, GoalStatus};

/// How the coordinator should approach instructions for this goal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Consult the workflow library, then fall back to direct translation.
    #[default]
    Sequential,
    /// Prefer a matching workflow even below the usual confidence threshold
    /// (half of it).
    WorkflowFirst,
    /// Never use workflows.
    DirectOnly,
}

/// A goal as proposed by the decision service, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalDraft {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub evidence_tools: Vec<String>,
}

impl GoalDraft {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: Vec::new(),
            evidence_tools: Vec::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn evidence(mut self, tool: impl Into<String>) -> Self {
        self.evidence_tools.push(tool.into());
        self
    }
}

/// A validated set of goals.
///
/// # Invariants
/// - `1 <= goals.len() <= max_goals` at construction
/// - Goal ids are unique
/// - Every dependency names a goal in the set, never the goal itself
/// - The dependency graph is acyclic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSet {
    generation: u32,
    goals: Vec<Goal>,
    strategy: Strategy,
    rationale: String,
}

impl GoalSet {
    /// Validate drafts into a goal set. Every goal starts `Pending`.
    ///
    /// # Errors
    /// Returns `Err` if any invariant would be violated.
    pub fn from_drafts(
        generation: u32,
        drafts: Vec<GoalDraft>,
        strategy: Strategy,
        rationale: impl Into<String>,
        max_goals: usize,
    ) -> Result<Self, PlanError> {
        if drafts.is_empty() {
            return Err(PlanError::Empty);
        }
        if drafts.len() > max_goals {
            return Err(PlanError::TooManyGoals {
                count: drafts.len(),
                max: max_goals,
            });
        }

        let mut seen = HashSet::new();
        for draft in &drafts {
            if draft.description.trim().is_empty() {
                return Err(PlanError::EmptyDescription(draft.id.clone()));
            }
            if !seen.insert(draft.id.as_str()) {
                return Err(PlanError::DuplicateId(draft.id.clone()));
            }
        }
        for draft in &drafts {
            for dep in &draft.depends_on {
                if dep == &draft.id {
                    return Err(PlanError::SelfDependency(draft.id.clone()));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        goal: draft.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let goals: Vec<Goal> = drafts
            .into_iter()
            .map(|d| Goal {
                id: GoalId::new(d.id),
                description: d.description,
                status: GoalStatus::Pending,
                depends_on: d.depends_on.into_iter().map(GoalId::new).collect(),
                evidence_tools: d.evidence_tools,
                blocked_reason: None,
            })
            .collect();

        let set = Self {
            generation,
            goals,
            strategy,
            rationale: rationale.into(),
        };
        set.execution_order()?;
        Ok(set)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn goal(&self, id: &GoalId) -> Option<&Goal> {
        self.goals.iter().find(|g| &g.id == id)
    }

    pub fn goal_mut(&mut self, id: &GoalId) -> Result<&mut Goal, GoalError> {
        self.goals
            .iter_mut()
            .find(|g| &g.id == id)
            .ok_or_else(|| GoalError::NotFound(id.clone()))
    }

    /// The goal currently in progress, if any.
    pub fn active(&self) -> Option<&Goal> {
        self.goals.iter().find(|g| g.status == GoalStatus::InProgress)
    }

    /// First pending goal (in declaration order) whose dependencies are all achieved.
    pub fn next_eligible(&self) -> Option<&Goal> {
        self.goals
            .iter()
            .find(|g| g.status == GoalStatus::Pending && self.dependencies_achieved(g))
    }

    pub fn dependencies_achieved(&self, goal: &Goal) -> bool {
        goal.depends_on.iter().all(|dep| {
            self.goal(dep)
                .map(|d| d.status == GoalStatus::Achieved)
                .unwrap_or(false)
        })
    }

    /// A pending goal that can never start because something it depends on
    /// (directly or transitively) is blocked.
    pub fn first_unreachable(&self) -> Option<&Goal> {
        self.goals.iter().find(|g| {
            g.status == GoalStatus::Pending && self.depends_on_blocked(g, &mut HashSet::new())
        })
    }

    fn depends_on_blocked<'a>(&'a self, goal: &'a Goal, visited: &mut HashSet<&'a GoalId>) -> bool {
        goal.depends_on.iter().any(|dep| {
            if !visited.insert(dep) {
                return false;
            }
            match self.goal(dep) {
                Some(d) if d.status == GoalStatus::Blocked => true,
                Some(d) => self.depends_on_blocked(d, visited),
                None => false,
            }
        })
    }

    pub fn all_achieved(&self) -> bool {
        self.goals.iter().all(|g| g.status == GoalStatus::Achieved)
    }

    pub fn achieved(&self) -> impl Iterator<Item = &Goal> {
        self.goals.iter().filter(|g| g.status == GoalStatus::Achieved)
    }

    /// Structural identity: same ordered (normalized) descriptions with the
    /// same dependency edges, regardless of goal ids.
    pub fn is_identical_to(&self, other: &GoalSet) -> bool {
        self.fingerprint() == other.fingerprint()
    }

    fn fingerprint(&self) -> Vec<(String, Vec<usize>)> {
        let position: HashMap<&GoalId, usize> =
            self.goals.iter().enumerate().map(|(i, g)| (&g.id, i)).collect();
        self.goals
            .iter()
            .map(|g| {
                let description = g
                    .description
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase();
                let mut edges: Vec<usize> = g
                    .depends_on
                    .iter()
                    .filter_map(|d| position.get(d).copied())
                    .collect();
                edges.sort_unstable();
                (description, edges)
            })
            .collect()
    }

    /// Goal indices in a valid execution order (Kahn's algorithm).
    ///
    /// # Errors
    /// `CircularDependency` if the graph has a cycle.
    pub fn execution_order(&self) -> Result<Vec<usize>, PlanError> {
        let n = self.goals.len();
        let position: HashMap<&GoalId, usize> =
            self.goals.iter().enumerate().map(|(i, g)| (&g.id, i)).collect();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, goal) in self.goals.iter().enumerate() {
            for dep in &goal.depends_on {
                if let Some(&d) = position.get(dep) {
                    adj[d].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        // Reverse so that pop() yields goals in declaration order among equals.
        let mut queue: Vec<usize> = (0..n).rev().filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop() {
            order.push(node);
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if order.len() != n {
            Err(PlanError::CircularDependency)
        } else {
            Ok(order)
        }
    }
}

/// Errors in goal set construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Goal set cannot be empty")]
    Empty,

    #[error("Goal set has {count} goals, at most {max} allowed")]
    TooManyGoals { count: usize, max: usize },

    #[error("Goal '{0}' has an empty description")]
    EmptyDescription(String),

    #[error("Goal id '{0}' is used more than once")]
    DuplicateId(String),

    #[error("Goal '{goal}' depends on unknown goal '{dependency}'")]
    UnknownDependency { goal: String, dependency: String },

    #[error("Goal '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Circular dependency detected in goal set")]
    CircularDependency,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(drafts: Vec<GoalDraft>) -> Result<GoalSet, PlanError> {
        GoalSet::from_drafts(1, drafts, Strategy::Sequential, "", 6)
    }

    #[test]
    fn test_valid_set_and_order() {
        let goals = set(vec![
            GoalDraft::new("g2", "edit the file").depends_on("g1"),
            GoalDraft::new("g1", "fetch the file"),
        ])
        .unwrap();
        assert_eq!(goals.execution_order().unwrap(), vec![1, 0]);
        assert_eq!(goals.next_eligible().unwrap().id, GoalId::new("g1"));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert_eq!(set(vec![]), Err(PlanError::Empty));
        assert!(matches!(
            set((0..7).map(|i| GoalDraft::new(format!("g{}", i), "x")).collect()),
            Err(PlanError::TooManyGoals { count: 7, max: 6 })
        ));
        assert_eq!(
            set(vec![GoalDraft::new("g1", "a"), GoalDraft::new("g1", "b")]),
            Err(PlanError::DuplicateId("g1".to_string()))
        );
        assert_eq!(
            set(vec![GoalDraft::new("g1", "a").depends_on("g1")]),
            Err(PlanError::SelfDependency("g1".to_string()))
        );
        assert!(matches!(
            set(vec![GoalDraft::new("g1", "a").depends_on("g9")]),
            Err(PlanError::UnknownDependency { .. })
        ));
        assert_eq!(
            set(vec![
                GoalDraft::new("g1", "a").depends_on("g2"),
                GoalDraft::new("g2", "b").depends_on("g1"),
            ]),
            Err(PlanError::CircularDependency)
        );
    }

    #[test]
    fn test_identity_ignores_ids_and_whitespace() {
        let a = set(vec![
            GoalDraft::new("g1", "Fetch the file"),
            GoalDraft::new("g2", "edit it").depends_on("g1"),
        ])
        .unwrap();
        let b = set(vec![
            GoalDraft::new("x", "fetch  the file"),
            GoalDraft::new("y", "edit it").depends_on("x"),
        ])
        .unwrap();
        let c = set(vec![
            GoalDraft::new("g1", "Fetch the file"),
            GoalDraft::new("g2", "edit it"),
        ])
        .unwrap();
        assert!(a.is_identical_to(&b));
        assert!(!a.is_identical_to(&c));
    }

    #[test]
    fn test_blocked_dependency_makes_goal_unreachable() {
        let mut goals = set(vec![
            GoalDraft::new("g1", "fetch"),
            GoalDraft::new("g2", "edit").depends_on("g1"),
            GoalDraft::new("g3", "report").depends_on("g2"),
        ])
        .unwrap();
        let g1 = goals.goal_mut(&GoalId::new("g1")).unwrap();
        g1.start().unwrap();
        g1.block("denied").unwrap();

        assert!(goals.next_eligible().is_none());
        assert_eq!(goals.first_unreachable().unwrap().id, GoalId::new("g2"));
    }
}
