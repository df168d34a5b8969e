//! In-memory turn store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    check_new_section, mark_finalized, now_string, push_entry, TurnRecord, TurnStatus, TurnStore,
};
use crate::state::{Section, SectionEntry, TurnId};

#[derive(Clone)]
pub struct InMemoryTurnStore {
    turns: Arc<RwLock<HashMap<TurnId, TurnRecord>>>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self {
            turns: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTurnStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: TurnId) -> String {
    format!("Turn {} not found", id)
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_turn(&self, id: TurnId, request: &str) -> Result<(), String> {
        let mut turns = self.turns.write().await;
        if turns.contains_key(&id) {
            return Err(format!("Turn {} already exists", id));
        }
        let now = now_string();
        turns.insert(
            id,
            TurnRecord {
                id,
                request: request.to_string(),
                status: TurnStatus::Running,
                terminal_message: None,
                created_at: now.clone(),
                updated_at: now,
                sections: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append_section(&self, id: TurnId, section: &Section) -> Result<(), String> {
        let mut turns = self.turns.write().await;
        let record = turns.get_mut(&id).ok_or_else(|| not_found(id))?;
        check_new_section(record, section)?;
        record.sections.push(section.clone());
        record.updated_at = now_string();
        Ok(())
    }

    async fn append_entry(
        &self,
        id: TurnId,
        section: &str,
        entry: &SectionEntry,
    ) -> Result<(), String> {
        let mut turns = self.turns.write().await;
        let record = turns.get_mut(&id).ok_or_else(|| not_found(id))?;
        push_entry(record, section, entry)?;
        record.updated_at = now_string();
        Ok(())
    }

    async fn finalize_section(&self, id: TurnId, section: &str) -> Result<(), String> {
        let mut turns = self.turns.write().await;
        let record = turns.get_mut(&id).ok_or_else(|| not_found(id))?;
        mark_finalized(record, section)?;
        record.updated_at = now_string();
        Ok(())
    }

    async fn complete_turn(
        &self,
        id: TurnId,
        status: TurnStatus,
        message: Option<&str>,
    ) -> Result<(), String> {
        let mut turns = self.turns.write().await;
        let record = turns.get_mut(&id).ok_or_else(|| not_found(id))?;
        record.status = status;
        record.terminal_message = message.map(|s| s.to_string());
        record.updated_at = now_string();
        Ok(())
    }

    async fn get_turn(&self, id: TurnId) -> Result<Option<TurnRecord>, String> {
        Ok(self.turns.read().await.get(&id).cloned())
    }

    async fn list_turns(&self, limit: usize, offset: usize) -> Result<Vec<TurnRecord>, String> {
        let mut turns: Vec<TurnRecord> = self
            .turns
            .read()
            .await
            .values()
            .map(|t| TurnRecord {
                sections: Vec::new(),
                ..t.clone()
            })
            .collect();
        turns.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(turns.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_incomplete_turns(&self) -> Result<Vec<TurnRecord>, String> {
        let mut turns: Vec<TurnRecord> = self
            .turns
            .read()
            .await
            .values()
            .filter(|t| t.status == TurnStatus::Running)
            .cloned()
            .collect();
        turns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(turns)
    }
}
