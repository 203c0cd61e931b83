use crate::{
    storage::{StorageAdapter, OUTBOX_PREFIX},
    utils::now_millis,
    Result, SessionId,
};
use nostr::UnsignedEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub session_id: SessionId,
    pub rumor: UnsignedEvent,
    pub created_at: u64,
    /// Queue position within the session; entries queued in the same
    /// millisecond keep their order.
    #[serde(default)]
    pub seq: u64,
}

/// Rumors waiting for a session that cannot send yet.
#[derive(Clone)]
pub struct Outbox {
    storage: Arc<dyn StorageAdapter>,
}

impl Outbox {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    fn key(id: &str) -> String {
        format!("{}{}", OUTBOX_PREFIX, id)
    }

    fn rumor_id_or_random(rumor: &UnsignedEvent) -> String {
        rumor
            .id
            .as_ref()
            .map(|id| id.to_hex())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn add(&self, session_id: &SessionId, rumor: &UnsignedEvent) -> Result<String> {
        let id = format!("{}/{}", Self::rumor_id_or_random(rumor), session_id);
        let seq = self
            .pending(session_id)?
            .iter()
            .map(|entry| entry.seq + 1)
            .max()
            .unwrap_or_default();
        let entry = OutboxEntry {
            id: id.clone(),
            session_id: session_id.clone(),
            rumor: rumor.clone(),
            created_at: now_millis(),
            seq,
        };
        self.storage
            .put(&Self::key(&id), serde_json::to_string(&entry)?)?;
        tracing::debug!(session = %session_id, entry = %id, "queued rumor");
        Ok(id)
    }

    /// Queued entries for `session_id`, oldest first.
    pub fn pending(&self, session_id: &SessionId) -> Result<Vec<OutboxEntry>> {
        let mut out = Vec::new();
        for key in self.storage.list(OUTBOX_PREFIX)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let entry = match serde_json::from_str::<OutboxEntry>(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping unreadable outbox entry");
                    continue;
                }
            };
            if &entry.session_id == session_id {
                out.push(entry);
            }
        }
        out.sort_by_key(|entry| (entry.seq, entry.created_at));
        Ok(out)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.storage.del(&Self::key(id))
    }

    pub fn remove_session(&self, session_id: &SessionId) -> Result<()> {
        for entry in self.pending(session_id)? {
            self.remove(&entry.id)?;
        }
        Ok(())
    }
}
