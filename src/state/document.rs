//! The per-turn state document.
//!
//! Sections are written through to the turn store *before* they are committed
//! in memory, so a failed write leaves the document exactly as it was and a
//! crashed turn can be inspected from storage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TurnId;
use crate::store::TurnStore;

/// Well-known section names.
pub mod sections {
    pub const REQUEST_ANALYSIS: &str = "request_analysis";
    pub const GATHERED_CONTEXT: &str = "gathered_context";
    pub const EXECUTION_LOG: &str = "execution_log";
    pub const OUTCOME: &str = "outcome";

    /// Name of the plan section for a goal-set generation.
    pub fn plan(generation: u32) -> String {
        format!("plan.{}", generation)
    }

    /// Name of the section recording the n-th blocked report.
    pub fn blocked(n: u32) -> String {
        format!("blocked.{}", n)
    }

    /// Name of the synthesis section for an attempt.
    pub fn synthesis(attempt: u32) -> String {
        format!("synthesis.{}", attempt)
    }

    /// Name of the validation section for an attempt.
    pub fn validation(attempt: u32) -> String {
        format!("validation.{}", attempt)
    }
}

/// Receipt for an appended section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHandle {
    pub name: String,
    pub sequence: u64,
    pub written_at: DateTime<Utc>,
}

/// A record appended inside an open section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionEntry {
    /// Position within the section, starting at 0
    pub index: u64,
    pub written_at: DateTime<Utc>,
    pub value: Value,
}

/// A named slice of the document.
///
/// # Invariants
/// - `content` never changes after the section is appended
/// - `entries` only grow, and only while `finalized == false`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    /// Append order within the turn, starting at 0
    pub sequence: u64,
    pub written_at: DateTime<Utc>,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<SectionEntry>,
    pub finalized: bool,
}

/// Serialized form of a whole document (the persistence boundary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDocument {
    pub turn_id: TurnId,
    pub sections: Vec<Section>,
}

/// Errors from document operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("Section '{0}' was already written in this turn")]
    DuplicateSection(String),

    #[error("Section '{0}' not found")]
    NotFound(String),

    #[error("Section '{0}' is finalized and accepts no entries")]
    SectionClosed(String),

    #[error("Failed to persist section '{name}': {reason}")]
    Persistence { name: String, reason: String },
}

/// Ordered, append-only collection of sections for one turn.
pub struct StateDocument {
    turn_id: TurnId,
    sections: Vec<Section>,
    index: HashMap<String, usize>,
    journal: Option<Arc<dyn TurnStore>>,
}

impl StateDocument {
    /// Create an in-memory document.
    pub fn new(turn_id: TurnId) -> Self {
        Self {
            turn_id,
            sections: Vec::new(),
            index: HashMap::new(),
            journal: None,
        }
    }

    /// Create a document that writes every append through to `store`.
    pub fn with_journal(turn_id: TurnId, store: Arc<dyn TurnStore>) -> Self {
        Self {
            journal: Some(store),
            ..Self::new(turn_id)
        }
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Append a finalized section.
    ///
    /// # Errors
    /// `DuplicateSection` if `name` was already written in this turn.
    pub async fn append_section(
        &mut self,
        name: impl Into<String>,
        content: Value,
    ) -> Result<SectionHandle, StateError> {
        self.insert(name.into(), content, true).await
    }

    /// Append a section that keeps accepting entries until finalized.
    pub async fn open_section(
        &mut self,
        name: impl Into<String>,
        content: Value,
    ) -> Result<SectionHandle, StateError> {
        self.insert(name.into(), content, false).await
    }

    async fn insert(
        &mut self,
        name: String,
        content: Value,
        finalized: bool,
    ) -> Result<SectionHandle, StateError> {
        if self.index.contains_key(&name) {
            return Err(StateError::DuplicateSection(name));
        }

        let section = Section {
            name: name.clone(),
            sequence: self.sections.len() as u64,
            written_at: Utc::now(),
            content,
            entries: Vec::new(),
            finalized,
        };

        if let Some(store) = &self.journal {
            store
                .append_section(self.turn_id, &section)
                .await
                .map_err(|reason| StateError::Persistence {
                    name: name.clone(),
                    reason,
                })?;
        }

        let handle = SectionHandle {
            name: name.clone(),
            sequence: section.sequence,
            written_at: section.written_at,
        };
        self.index.insert(name, self.sections.len());
        self.sections.push(section);
        Ok(handle)
    }

    /// Append an entry to an open section. Returns the entry index.
    pub async fn append_entry(&mut self, name: &str, value: Value) -> Result<u64, StateError> {
        let position = *self
            .index
            .get(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        let section = &self.sections[position];
        if section.finalized {
            return Err(StateError::SectionClosed(name.to_string()));
        }

        let entry = SectionEntry {
            index: section.entries.len() as u64,
            written_at: Utc::now(),
            value,
        };

        if let Some(store) = &self.journal {
            store
                .append_entry(self.turn_id, name, &entry)
                .await
                .map_err(|reason| StateError::Persistence {
                    name: name.to_string(),
                    reason,
                })?;
        }

        let index = entry.index;
        self.sections[position].entries.push(entry);
        Ok(index)
    }

    /// Close an open section. Finalizing twice is a no-op.
    pub async fn finalize_section(&mut self, name: &str) -> Result<(), StateError> {
        let position = *self
            .index
            .get(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if self.sections[position].finalized {
            return Ok(());
        }

        if let Some(store) = &self.journal {
            store
                .finalize_section(self.turn_id, name)
                .await
                .map_err(|reason| StateError::Persistence {
                    name: name.to_string(),
                    reason,
                })?;
        }

        self.sections[position].finalized = true;
        Ok(())
    }

    pub fn read_section(&self, name: &str) -> Result<&Section, StateError> {
        self.index
            .get(name)
            .map(|&i| &self.sections[i])
            .ok_or_else(|| StateError::NotFound(name.to_string()))
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All sections in append order.
    pub fn read_all(&self) -> &[Section] {
        &self.sections
    }

    /// Number of sections appended so far.
    ///
    /// Entries do not advance the epoch: only a new section counts as new
    /// information entering the turn.
    pub fn epoch(&self) -> u64 {
        self.sections.len() as u64
    }

    pub fn to_turn_document(&self) -> TurnDocument {
        TurnDocument {
            turn_id: self.turn_id,
            sections: self.sections.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryTurnStore, TurnStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_section_rejected() {
        let mut doc = StateDocument::new(TurnId::new());
        doc.append_section("plan.1", json!({"goals": []}))
            .await
            .unwrap();

        let err = doc
            .append_section("plan.1", json!({"goals": ["again"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicateSection(name) if name == "plan.1"));
        assert_eq!(doc.read_all().len(), 1);
    }

    #[tokio::test]
    async fn test_finalized_section_reads_are_stable() {
        let mut doc = StateDocument::new(TurnId::new());
        doc.append_section(sections::REQUEST_ANALYSIS, json!({"request": "fix it"}))
            .await
            .unwrap();
        let first = doc.read_section(sections::REQUEST_ANALYSIS).unwrap().clone();

        doc.append_section("plan.1", json!({})).await.unwrap();
        doc.open_section(sections::EXECUTION_LOG, json!({})).await.unwrap();
        doc.append_entry(sections::EXECUTION_LOG, json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(doc.read_section(sections::REQUEST_ANALYSIS).unwrap(), &first);
        assert!(matches!(
            doc.append_entry(sections::REQUEST_ANALYSIS, json!({})).await,
            Err(StateError::SectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_entries_keep_order_and_close() {
        let mut doc = StateDocument::new(TurnId::new());
        doc.open_section(sections::EXECUTION_LOG, json!({})).await.unwrap();
        for n in 0..3 {
            let index = doc
                .append_entry(sections::EXECUTION_LOG, json!({ "n": n }))
                .await
                .unwrap();
            assert_eq!(index, n);
        }
        doc.finalize_section(sections::EXECUTION_LOG).await.unwrap();

        let log = doc.read_section(sections::EXECUTION_LOG).unwrap();
        let ns: Vec<u64> = log
            .entries
            .iter()
            .map(|e| e.value["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2]);
        assert!(doc
            .append_entry(sections::EXECUTION_LOG, json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_epoch_counts_sections_only() {
        let mut doc = StateDocument::new(TurnId::new());
        doc.open_section(sections::EXECUTION_LOG, json!({})).await.unwrap();
        assert_eq!(doc.epoch(), 1);
        doc.append_entry(sections::EXECUTION_LOG, json!({})).await.unwrap();
        assert_eq!(doc.epoch(), 1);
        doc.append_section("plan.2", json!({})).await.unwrap();
        assert_eq!(doc.epoch(), 2);
    }

    #[tokio::test]
    async fn test_appends_are_written_through() {
        let store = Arc::new(InMemoryTurnStore::new());
        let turn_id = TurnId::new();
        store.create_turn(turn_id, "request").await.unwrap();

        let mut doc = StateDocument::with_journal(turn_id, store.clone());
        doc.append_section(sections::REQUEST_ANALYSIS, json!({"request": "request"}))
            .await
            .unwrap();
        doc.open_section(sections::EXECUTION_LOG, json!({})).await.unwrap();
        doc.append_entry(sections::EXECUTION_LOG, json!({"tool": "read_file"}))
            .await
            .unwrap();

        let record = store.get_turn(turn_id).await.unwrap().unwrap();
        assert_eq!(record.sections, doc.read_all().to_vec());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_document_unchanged() {
        // The turn was never created, so the store rejects the append.
        let store = Arc::new(InMemoryTurnStore::new());
        let mut doc = StateDocument::with_journal(TurnId::new(), store);

        let err = doc
            .append_section(sections::REQUEST_ANALYSIS, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Persistence { .. }));
        assert!(doc.read_all().is_empty());
        assert!(!doc.has_section(sections::REQUEST_ANALYSIS));
    }
}
