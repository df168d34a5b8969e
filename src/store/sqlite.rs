//! SQLite-based turn store.
//!
//! Sections and execution-log entries are stored as individual rows so a
//! long-running turn is inspectable while it runs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{now_string, TurnRecord, TurnStatus, TurnStore};
use crate::state::{Section, SectionEntry, TurnId};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY NOT NULL,
    request TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    terminal_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_turns_updated_at ON turns(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_turns_status ON turns(status);

CREATE TABLE IF NOT EXISTS turn_sections (
    turn_id TEXT NOT NULL,
    name TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    written_at TEXT NOT NULL,
    content TEXT NOT NULL,
    finalized INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (turn_id, name),
    FOREIGN KEY (turn_id) REFERENCES turns(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS section_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    turn_id TEXT NOT NULL,
    section TEXT NOT NULL,
    entry_index INTEGER NOT NULL,
    written_at TEXT NOT NULL,
    value TEXT NOT NULL,
    FOREIGN KEY (turn_id, section) REFERENCES turn_sections(turn_id, name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_section ON section_entries(turn_id, section, entry_index);
"#;

pub struct SqliteTurnStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTurnStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create turn store dir: {}", e))?;
        let db_path = base_dir.join("turns.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{}': {}", raw, e))
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("Invalid stored JSON: {}", e))
}

type TurnRow = (String, String, String, Option<String>, String, String);

fn select_turns(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<TurnRecord>, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let rows: Vec<TurnRow> = stmt
        .query_map(args, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    rows.into_iter().map(turn_from_row).collect()
}

fn turn_from_row(row: TurnRow) -> Result<TurnRecord, String> {
    let (id, request, status, terminal_message, created_at, updated_at) = row;
    Ok(TurnRecord {
        id: id.parse().map_err(|e| format!("Invalid turn id '{}': {}", id, e))?,
        request,
        status: status.parse()?,
        terminal_message,
        created_at,
        updated_at,
        sections: Vec::new(),
    })
}

fn load_sections(conn: &Connection, turn_id: &str) -> Result<Vec<Section>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT name, sequence, written_at, content, finalized
             FROM turn_sections WHERE turn_id = ?1 ORDER BY sequence",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![turn_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)? != 0,
            ))
        })
        .map_err(|e| e.to_string())?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    let mut entry_stmt = conn
        .prepare(
            "SELECT entry_index, written_at, value FROM section_entries
             WHERE turn_id = ?1 AND section = ?2 ORDER BY entry_index",
        )
        .map_err(|e| e.to_string())?;

    let mut sections = Vec::with_capacity(rows.len());
    for (name, sequence, written_at, content, finalized) in rows {
        let entries = entry_stmt
            .query_map(params![turn_id, &name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?
            .into_iter()
            .map(|(index, written_at, value)| {
                Ok(SectionEntry {
                    index: index as u64,
                    written_at: parse_time(&written_at)?,
                    value: parse_json(&value)?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        sections.push(Section {
            name,
            sequence: sequence as u64,
            written_at: parse_time(&written_at)?,
            content: parse_json(&content)?,
            entries,
            finalized,
        });
    }
    Ok(sections)
}

fn touch(conn: &Connection, turn_id: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE turns SET updated_at = ?1 WHERE id = ?2",
        params![now_string(), turn_id],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

#[async_trait]
impl TurnStore for SqliteTurnStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_turn(&self, id: TurnId, request: &str) -> Result<(), String> {
        let id = id.to_string();
        let request = request.to_string();
        let now = now_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO turns (id, request, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, request, TurnStatus::Running.to_string(), now, now],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn append_section(&self, id: TurnId, section: &Section) -> Result<(), String> {
        let id = id.to_string();
        let section = section.clone();
        let content = serde_json::to_string(&section.content).map_err(|e| e.to_string())?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO turn_sections (turn_id, name, sequence, written_at, content, finalized)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &id,
                    section.name,
                    section.sequence as i64,
                    section.written_at.to_rfc3339(),
                    content,
                    section.finalized as i64,
                ],
            )
            .map_err(|e| format!("Failed to append section '{}': {}", section.name, e))?;
            touch(conn, &id)
        })
        .await
    }

    async fn append_entry(
        &self,
        id: TurnId,
        section: &str,
        entry: &SectionEntry,
    ) -> Result<(), String> {
        let id = id.to_string();
        let section = section.to_string();
        let entry = entry.clone();
        let value = serde_json::to_string(&entry.value).map_err(|e| e.to_string())?;
        self.with_conn(move |conn| {
            let finalized: Option<i64> = conn
                .query_row(
                    "SELECT finalized FROM turn_sections WHERE turn_id = ?1 AND name = ?2",
                    params![&id, &section],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| e.to_string())?;
            match finalized {
                None => return Err(format!("Section '{}' not found in turn {}", section, id)),
                Some(f) if f != 0 => return Err(format!("Section '{}' is finalized", section)),
                Some(_) => {}
            }

            conn.execute(
                "INSERT INTO section_entries (turn_id, section, entry_index, written_at, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &id,
                    &section,
                    entry.index as i64,
                    entry.written_at.to_rfc3339(),
                    value
                ],
            )
            .map_err(|e| e.to_string())?;
            touch(conn, &id)
        })
        .await
    }

    async fn finalize_section(&self, id: TurnId, section: &str) -> Result<(), String> {
        let id = id.to_string();
        let section = section.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE turn_sections SET finalized = 1 WHERE turn_id = ?1 AND name = ?2",
                    params![&id, &section],
                )
                .map_err(|e| e.to_string())?;
            if updated == 0 {
                return Err(format!("Section '{}' not found in turn {}", section, id));
            }
            touch(conn, &id)
        })
        .await
    }

    async fn complete_turn(
        &self,
        id: TurnId,
        status: TurnStatus,
        message: Option<&str>,
    ) -> Result<(), String> {
        let id = id.to_string();
        let message = message.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE turns SET status = ?1, terminal_message = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![status.to_string(), message, now_string(), &id],
                )
                .map_err(|e| e.to_string())?;
            if updated == 0 {
                return Err(format!("Turn {} not found", id));
            }
            Ok(())
        })
        .await
    }

    async fn get_turn(&self, id: TurnId) -> Result<Option<TurnRecord>, String> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut turns = select_turns(
                conn,
                "SELECT id, request, status, terminal_message, created_at, updated_at
                 FROM turns WHERE id = ?1",
                &[&id],
            )?;
            let Some(mut turn) = turns.pop() else {
                return Ok(None);
            };
            turn.sections = load_sections(conn, &id)?;
            Ok(Some(turn))
        })
        .await
    }

    async fn list_turns(&self, limit: usize, offset: usize) -> Result<Vec<TurnRecord>, String> {
        self.with_conn(move |conn| {
            select_turns(
                conn,
                "SELECT id, request, status, terminal_message, created_at, updated_at
                 FROM turns ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                &[&(limit as i64), &(offset as i64)],
            )
        })
        .await
    }

    async fn get_incomplete_turns(&self) -> Result<Vec<TurnRecord>, String> {
        self.with_conn(move |conn| {
            select_turns(
                conn,
                "SELECT id, request, status, terminal_message, created_at, updated_at
                 FROM turns WHERE status = 'running' ORDER BY created_at",
                &[],
            )
        })
        .await
    }
}
