//! Turn storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: One JSON file per turn
//! - `sqlite`: SQLite database with one row per section and entry
//!
//! Every backend rejects writes for turns it has not seen `create_turn` for,
//! and rejects a second section with the same name in one turn.

mod file;
mod memory;
mod sqlite;

pub use file::FileTurnStore;
pub use memory::InMemoryTurnStore;
pub use sqlite::SqliteTurnStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::state::{Section, SectionEntry, TurnId};

/// Lifecycle of a stored turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    Approved,
    Failed,
    NeedsClarification,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnStatus::Running)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnStatus::Running => "running",
            TurnStatus::Approved => "approved",
            TurnStatus::Failed => "failed",
            TurnStatus::NeedsClarification => "needs_clarification",
            TurnStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TurnStatus::Running),
            "approved" => Ok(TurnStatus::Approved),
            "failed" => Ok(TurnStatus::Failed),
            "needs_clarification" => Ok(TurnStatus::NeedsClarification),
            "cancelled" => Ok(TurnStatus::Cancelled),
            other => Err(format!("unknown turn status '{}'", other)),
        }
    }
}

/// A stored turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: TurnId,
    pub request: String,
    pub status: TurnStatus,
    /// Final message for the user (answer, failure reason, or question)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Empty in listings; populated by `get_turn`
    #[serde(default)]
    pub sections: Vec<Section>,
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    File,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "file" => Ok(StoreBackend::File),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Turn store trait - implemented by all storage backends.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Register a new turn in `Running` state.
    async fn create_turn(&self, id: TurnId, request: &str) -> Result<(), String>;

    async fn append_section(&self, id: TurnId, section: &Section) -> Result<(), String>;

    async fn append_entry(
        &self,
        id: TurnId,
        section: &str,
        entry: &SectionEntry,
    ) -> Result<(), String>;

    async fn finalize_section(&self, id: TurnId, section: &str) -> Result<(), String>;

    /// Record the terminal status of a turn.
    async fn complete_turn(
        &self,
        id: TurnId,
        status: TurnStatus,
        message: Option<&str>,
    ) -> Result<(), String>;

    /// Get a single turn with all of its sections.
    async fn get_turn(&self, id: TurnId) -> Result<Option<TurnRecord>, String>;

    /// List turns, ordered by updated_at descending. Sections are not loaded.
    async fn list_turns(&self, limit: usize, offset: usize) -> Result<Vec<TurnRecord>, String>;

    /// Turns still marked `Running` (interrupted by a crash or shutdown).
    async fn get_incomplete_turns(&self) -> Result<Vec<TurnRecord>, String>;
}

/// Open the configured backend.
pub async fn create_turn_store(config: &StoreConfig) -> Result<Arc<dyn TurnStore>, String> {
    let store: Arc<dyn TurnStore> = match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryTurnStore::new()),
        StoreBackend::File => Arc::new(FileTurnStore::new(config.data_dir.join("turns")).await?),
        StoreBackend::Sqlite => Arc::new(SqliteTurnStore::new(config.data_dir.clone()).await?),
    };
    tracing::info!(
        "Turn store ready: {:?} (persistent: {})",
        config.backend,
        store.is_persistent()
    );
    Ok(store)
}

/// Shared checks applied by every backend before appending a section.
fn check_new_section(record: &TurnRecord, section: &Section) -> Result<(), String> {
    if record.sections.iter().any(|s| s.name == section.name) {
        return Err(format!(
            "Section '{}' already exists in turn {}",
            section.name, record.id
        ));
    }
    Ok(())
}

/// The named section, if it still accepts entries.
fn open_section_mut<'r>(
    record: &'r mut TurnRecord,
    section: &str,
) -> Result<&'r mut Section, String> {
    let id = record.id;
    let target = record
        .sections
        .iter_mut()
        .find(|s| s.name == section)
        .ok_or_else(|| format!("Section '{}' not found in turn {}", section, id))?;
    if target.finalized {
        return Err(format!("Section '{}' is finalized", section));
    }
    Ok(target)
}

fn push_entry(record: &mut TurnRecord, section: &str, entry: &SectionEntry) -> Result<(), String> {
    open_section_mut(record, section)?.entries.push(entry.clone());
    Ok(())
}

fn mark_finalized(record: &mut TurnRecord, section: &str) -> Result<(), String> {
    let target = record
        .sections
        .iter_mut()
        .find(|s| s.name == section)
        .ok_or_else(|| format!("Section '{}' not found in turn {}", section, record.id))?;
    target.finalized = true;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            TurnStatus::Running,
            TurnStatus::Approved,
            TurnStatus::Failed,
            TurnStatus::NeedsClarification,
            TurnStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TurnStatus>(), Ok(status));
        }
        assert!(TurnStatus::Approved.is_terminal());
        assert!(!TurnStatus::Running.is_terminal());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("SQLite".parse::<StoreBackend>(), Ok(StoreBackend::Sqlite));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[tokio::test]
    async fn test_create_turn_store_memory() {
        let store = create_turn_store(&StoreConfig {
            backend: StoreBackend::Memory,
            data_dir: std::env::temp_dir(),
        })
        .await
        .unwrap();
        assert!(!store.is_persistent());
    }
}
