//! JSON file-based turn store.
//!
//! Each turn is two files in the store directory:
//! - `<turn id>.json`: the turn and its sections without entries, rewritten
//!   through a temporary file and a rename
//! - `<turn id>.entries.jsonl`: one line per section entry, append-only
//!
//! Appending an entry never rewrites the snapshot. Each turn has its own
//! lock, so concurrent turns only meet on the map lookup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::{
    check_new_section, mark_finalized, now_string, open_section_mut, TurnRecord, TurnStatus,
    TurnStore,
};
use crate::state::{Section, SectionEntry, TurnId};

type TurnSlot = Arc<Mutex<TurnRecord>>;

/// One line of an entry journal.
#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    section: String,
    entry: SectionEntry,
}

#[derive(Clone)]
pub struct FileTurnStore {
    dir: PathBuf,
    turns: Arc<RwLock<HashMap<TurnId, TurnSlot>>>,
}

impl FileTurnStore {
    /// Open (or create) the store directory and load existing turns.
    ///
    /// Unreadable files are skipped with a warning rather than failing startup.
    pub async fn new(dir: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("Failed to create turn store dir: {}", e))?;

        let mut turns = HashMap::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| format!("Failed to read turn store dir: {}", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("Failed to read turn store dir: {}", e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let mut record = match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<TurnRecord>(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!("Failed to parse turn file {}: {}", path.display(), e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read turn file {}: {}", path.display(), e);
                    continue;
                }
            };
            let journal = journal_path(&dir, record.id);
            replay_journal(&mut record, &journal).await;
            turns.insert(record.id, Arc::new(Mutex::new(record)));
        }

        Ok(Self {
            dir,
            turns: Arc::new(RwLock::new(turns)),
        })
    }

    fn snapshot_path(&self, id: TurnId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn slot(&self, id: TurnId) -> Result<TurnSlot, String> {
        self.turns
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| format!("Turn {} not found", id))
    }

    /// Current turn slots; the map lock is released before any slot is locked.
    async fn snapshot_slots(&self) -> Vec<TurnSlot> {
        self.turns.read().await.values().cloned().collect()
    }

    /// Write the turn without its entries; those live in the journal.
    async fn write_snapshot(&self, record: &TurnRecord) -> Result<(), String> {
        let snapshot = TurnRecord {
            id: record.id,
            request: record.request.clone(),
            status: record.status,
            terminal_message: record.terminal_message.clone(),
            created_at: record.created_at.clone(),
            updated_at: record.updated_at.clone(),
            sections: record
                .sections
                .iter()
                .map(|s| Section {
                    name: s.name.clone(),
                    sequence: s.sequence,
                    written_at: s.written_at,
                    content: s.content.clone(),
                    entries: Vec::new(),
                    finalized: s.finalized,
                })
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| format!("Failed to serialize turn: {}", e))?;
        let path = self.snapshot_path(record.id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| format!("Failed to write turn: {}", e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| format!("Failed to finalize turn file: {}", e))?;
        Ok(())
    }

    async fn append_journal(
        &self,
        id: TurnId,
        section: &str,
        entry: &SectionEntry,
    ) -> Result<(), String> {
        let line = JournalLine {
            section: section.to_string(),
            entry: entry.clone(),
        };
        let mut data = serde_json::to_vec(&line)
            .map_err(|e| format!("Failed to serialize entry: {}", e))?;
        data.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path(&self.dir, id))
            .await
            .map_err(|e| format!("Failed to open entry journal: {}", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| format!("Failed to append entry: {}", e))?;
        file.flush()
            .await
            .map_err(|e| format!("Failed to append entry: {}", e))?;
        Ok(())
    }

    /// Apply `mutate` to a copy of the turn, write the snapshot, then commit
    /// in memory. Only this turn's lock is held across the write.
    async fn update<F>(&self, id: TurnId, mutate: F) -> Result<(), String>
    where
        F: FnOnce(&mut TurnRecord) -> Result<(), String>,
    {
        let slot = self.slot(id).await?;
        let mut current = slot.lock().await;
        let mut updated = current.clone();
        mutate(&mut updated)?;
        updated.updated_at = now_string();
        self.write_snapshot(&updated).await?;
        *current = updated;
        Ok(())
    }
}

fn journal_path(dir: &std::path::Path, id: TurnId) -> PathBuf {
    dir.join(format!("{}.entries.jsonl", id))
}

/// Re-attach journaled entries. A torn last line (crash mid-append) ends the
/// replay.
async fn replay_journal(record: &mut TurnRecord, path: &std::path::Path) {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            tracing::warn!("Failed to read entry journal {}: {}", path.display(), e);
            return;
        }
    };

    for raw in content.lines().filter(|l| !l.trim().is_empty()) {
        let line: JournalLine = match serde_json::from_str(raw) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Stopping replay of {} at a bad line: {}", path.display(), e);
                break;
            }
        };
        match record.sections.iter_mut().find(|s| s.name == line.section) {
            Some(section) => section.entries.push(line.entry),
            None => tracing::warn!(
                "Journal {} has an entry for unknown section '{}'",
                path.display(),
                line.section
            ),
        }
    }
}

#[async_trait]
impl TurnStore for FileTurnStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_turn(&self, id: TurnId, request: &str) -> Result<(), String> {
        let mut turns = self.turns.write().await;
        if turns.contains_key(&id) {
            return Err(format!("Turn {} already exists", id));
        }
        let now = now_string();
        let record = TurnRecord {
            id,
            request: request.to_string(),
            status: TurnStatus::Running,
            terminal_message: None,
            created_at: now.clone(),
            updated_at: now,
            sections: Vec::new(),
        };
        self.write_snapshot(&record).await?;
        turns.insert(id, Arc::new(Mutex::new(record)));
        Ok(())
    }

    async fn append_section(&self, id: TurnId, section: &Section) -> Result<(), String> {
        self.update(id, |record| {
            check_new_section(record, section)?;
            record.sections.push(section.clone());
            Ok(())
        })
        .await
    }

    async fn append_entry(
        &self,
        id: TurnId,
        section: &str,
        entry: &SectionEntry,
    ) -> Result<(), String> {
        let slot = self.slot(id).await?;
        let mut record = slot.lock().await;
        open_section_mut(&mut record, section)?;
        self.append_journal(id, section, entry).await?;
        open_section_mut(&mut record, section)?
            .entries
            .push(entry.clone());
        record.updated_at = now_string();
        Ok(())
    }

    async fn finalize_section(&self, id: TurnId, section: &str) -> Result<(), String> {
        self.update(id, |record| mark_finalized(record, section))
            .await
    }

    async fn complete_turn(
        &self,
        id: TurnId,
        status: TurnStatus,
        message: Option<&str>,
    ) -> Result<(), String> {
        self.update(id, |record| {
            record.status = status;
            record.terminal_message = message.map(|s| s.to_string());
            Ok(())
        })
        .await
    }

    async fn get_turn(&self, id: TurnId) -> Result<Option<TurnRecord>, String> {
        let slot = self.turns.read().await.get(&id).cloned();
        match slot {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list_turns(&self, limit: usize, offset: usize) -> Result<Vec<TurnRecord>, String> {
        let mut turns = Vec::new();
        for slot in self.snapshot_slots().await {
            let record = slot.lock().await;
            turns.push(TurnRecord {
                id: record.id,
                request: record.request.clone(),
                status: record.status,
                terminal_message: record.terminal_message.clone(),
                created_at: record.created_at.clone(),
                updated_at: record.updated_at.clone(),
                sections: Vec::new(),
            });
        }
        turns.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(turns.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_incomplete_turns(&self) -> Result<Vec<TurnRecord>, String> {
        let mut turns = Vec::new();
        for slot in self.snapshot_slots().await {
            let record = slot.lock().await;
            if record.status == TurnStatus::Running {
                turns.push(record.clone());
            }
        }
        turns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(turns)
    }
}
