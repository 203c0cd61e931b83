use crate::{
    storage::{StorageAdapter, CHAT_SETTINGS_KEY, EVENTS_PREFIX},
    Error, Result, Rumor, SessionId, REACTION_KIND,
};
use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// A decrypted chat message as shown in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: SessionId,
    /// Hex identity key of the author.
    pub sender: String,
    pub content: String,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
    /// Sender hex to emoji, latest reaction per sender.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, String>,
    /// Sender hex to the sort time in ms of the reaction kept in
    /// `reactions`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reacted_at: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Message {
    pub fn from_rumor(session_id: SessionId, rumor: &Rumor, sender: &PublicKey) -> Self {
        Self {
            id: rumor.id.clone(),
            session_id,
            sender: sender.to_hex(),
            content: rumor.content.clone(),
            kind: rumor.kind,
            tags: rumor.tags.clone(),
            created_at: rumor.created_at,
            ms: rumor.ms(),
            reactions: BTreeMap::new(),
            reacted_at: BTreeMap::new(),
            expires_at: rumor.expires_at(),
        }
    }

    pub fn sort_key(&self) -> (u64, String) {
        (self.sort_time(), self.id.clone())
    }

    fn sort_time(&self) -> u64 {
        self.ms.unwrap_or(self.created_at.saturating_mul(1000))
    }

    /// Keeps `emoji` unless `sender` already has a reaction from a later
    /// time. Returns whether it was kept.
    pub fn fold_reaction(&mut self, sender: &str, emoji: &str, at: u64) -> bool {
        if self.reacted_at.get(sender).is_some_and(|current| *current > at) {
            return false;
        }
        self.reactions.insert(sender.to_string(), emoji.to_string());
        self.reacted_at.insert(sender.to_string(), at);
        true
    }

    pub fn reaction_target(&self) -> Option<&str> {
        if self.kind != REACTION_KIND {
            return None;
        }
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("e"))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Per-chat preferences, persisted as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    /// Session id to disappearing-message timer in seconds.
    #[serde(default)]
    pub message_expiry: BTreeMap<String, u64>,
}

impl ChatSettings {
    pub fn expiry(&self, session_id: &SessionId) -> Option<u64> {
        self.message_expiry.get(&session_id.to_string()).copied()
    }

    pub fn set_expiry(&mut self, session_id: &SessionId, seconds: Option<u64>) {
        match seconds {
            Some(seconds) if seconds > 0 => {
                self.message_expiry.insert(session_id.to_string(), seconds);
            }
            _ => {
                self.message_expiry.remove(&session_id.to_string());
            }
        }
    }
}

#[derive(Default)]
struct SessionLog {
    by_order: BTreeMap<(u64, String), Message>,
    index: HashMap<String, (u64, String)>,
}

impl SessionLog {
    fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).and_then(|key| self.by_order.get(key))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let key = self.index.get(id)?;
        self.by_order.get_mut(key)
    }

    fn remove(&mut self, id: &str) -> Option<Message> {
        let key = self.index.remove(id)?;
        self.by_order.remove(&key)
    }

    fn insert(&mut self, message: Message) {
        self.remove(&message.id);
        let key = message.sort_key();
        self.index.insert(message.id.clone(), key.clone());
        self.by_order.insert(key, message);
    }

    fn ordered(&self) -> Vec<Message> {
        self.by_order.values().cloned().collect()
    }

    /// Standalone reactions waiting for `target`, oldest first.
    fn take_orphans(&mut self, target: &str) -> Vec<Message> {
        let ids: Vec<String> = self
            .by_order
            .values()
            .filter(|m| m.reaction_target() == Some(target))
            .map(|m| m.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    fn purge(&mut self, now: u64) -> usize {
        let expired: Vec<String> = self
            .by_order
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired.len()
    }
}

struct Inner {
    logs: HashMap<SessionId, SessionLog>,
    settings: ChatSettings,
}

/// Messages per chat with reactions folded into their targets.
pub struct EventStore {
    storage: Arc<dyn StorageAdapter>,
    inner: Mutex<Inner>,
}

impl EventStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            inner: Mutex::new(Inner {
                logs: HashMap::new(),
                settings: ChatSettings::default(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("Event store poisoned".to_string()))
    }

    fn storage_key(session_id: &SessionId) -> String {
        format!("{}{}", EVENTS_PREFIX, session_id)
    }

    fn persist_log(&self, session_id: &SessionId, log: &SessionLog) -> Result<()> {
        let key = Self::storage_key(session_id);
        if log.by_order.is_empty() {
            return self.storage.del(&key);
        }
        self.storage.put(&key, serde_json::to_string(&log.ordered())?)
    }

    /// Reads persisted messages and chat settings, replacing what is in
    /// memory.
    pub fn load(&self) -> Result<usize> {
        let settings = match self.storage.get(CHAT_SETTINGS_KEY)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring unreadable chat settings");
                ChatSettings::default()
            }),
            None => ChatSettings::default(),
        };

        let mut logs = HashMap::new();
        let mut count = 0;
        for key in self.storage.list(EVENTS_PREFIX)? {
            let session_id: SessionId = match key[EVENTS_PREFIX.len()..].parse() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping events with malformed session id");
                    continue;
                }
            };
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let messages: Vec<Message> = match serde_json::from_str(&raw) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "skipping unreadable events");
                    continue;
                }
            };
            let mut log = SessionLog::default();
            for message in messages {
                log.insert(message);
                count += 1;
            }
            logs.insert(session_id, log);
        }

        let mut inner = self.lock()?;
        inner.logs = logs;
        inner.settings = settings;
        Ok(count)
    }

    /// Stores `message` and returns what a conversation view should update:
    /// the message itself, or the target a reaction was folded into.
    /// Returns `None` when the message has already expired at `now` or its
    /// id belongs to a message from another sender.
    pub fn upsert(&self, mut message: Message, now: u64) -> Result<Option<Message>> {
        let session_id = message.session_id.clone();
        let mut inner = self.lock()?;

        if message.expires_at.is_none() {
            if let Some(seconds) = inner.settings.expiry(&session_id) {
                message.expires_at = Some(message.created_at.saturating_add(seconds));
            }
        }
        if message.is_expired(now) {
            tracing::debug!(message = %message.id, "skipping expired message");
            return Ok(None);
        }

        let log = inner.logs.entry(session_id.clone()).or_default();

        if let Some(existing) = log.get(&message.id) {
            if existing.sender != message.sender {
                tracing::warn!(
                    session = %session_id,
                    message = %message.id,
                    "ignoring message reusing the id of another sender's message"
                );
                return Ok(None);
            }
        }

        if let Some(target) = message.reaction_target().map(str::to_string) {
            if let Some(target_message) = log.get_mut(&target) {
                target_message.fold_reaction(&message.sender, &message.content, message.sort_time());
                let updated = target_message.clone();
                self.persist_log(&session_id, log)?;
                return Ok(Some(updated));
            }
        }

        if let Some(existing) = log.get(&message.id) {
            for (sender, emoji) in &existing.reactions {
                let at = existing.reacted_at.get(sender).copied().unwrap_or_default();
                message.fold_reaction(sender, emoji, at);
            }
        }
        for orphan in log.take_orphans(&message.id) {
            message.fold_reaction(&orphan.sender, &orphan.content, orphan.sort_time());
        }

        log.insert(message.clone());
        self.persist_log(&session_id, log)?;
        Ok(Some(message))
    }

    pub fn get(&self, session_id: &SessionId, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .lock()?
            .logs
            .get(session_id)
            .and_then(|log| log.get(message_id))
            .cloned())
    }

    /// Messages of one chat, oldest first.
    pub fn messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        Ok(self
            .lock()?
            .logs
            .get(session_id)
            .map(SessionLog::ordered)
            .unwrap_or_default())
    }

    /// Evicts messages whose expiry is at or before `now`. Returns how many
    /// were removed.
    pub fn purge_expired(&self, now: u64) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut removed = 0;
        for (session_id, log) in inner.logs.iter_mut() {
            let purged = log.purge(now);
            if purged > 0 {
                self.persist_log(session_id, log)?;
                removed += purged;
            }
        }
        inner.logs.retain(|_, log| !log.by_order.is_empty());
        if removed > 0 {
            tracing::debug!(count = removed, "purged expired messages");
        }
        Ok(removed)
    }

    pub fn remove_message(&self, session_id: &SessionId, message_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(log) = inner.logs.get_mut(session_id) else {
            return Ok(false);
        };
        if log.remove(message_id).is_none() {
            return Ok(false);
        }
        self.persist_log(session_id, log)?;
        Ok(true)
    }

    pub fn remove_session(&self, session_id: &SessionId) -> Result<()> {
        self.lock()?.logs.remove(session_id);
        self.storage.del(&Self::storage_key(session_id))
    }

    /// Drops every message. Chat settings are kept.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        for session_id in inner.logs.keys() {
            self.storage.del(&Self::storage_key(session_id))?;
        }
        inner.logs.clear();
        Ok(())
    }

    pub fn settings(&self) -> Result<ChatSettings> {
        Ok(self.lock()?.settings.clone())
    }

    pub fn expiry(&self, session_id: &SessionId) -> Result<Option<u64>> {
        Ok(self.lock()?.settings.expiry(session_id))
    }

    /// Sets or clears (`None` or `0`) the disappearing-message timer of a
    /// chat. Only messages stored afterwards are stamped.
    pub fn set_expiry(&self, session_id: &SessionId, seconds: Option<u64>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.settings.set_expiry(session_id, seconds);
        self.storage
            .put(CHAT_SETTINGS_KEY, serde_json::to_string(&inner.settings)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStorage, CHAT_MESSAGE_KIND};
    use nostr::Keys;

    fn session() -> SessionId {
        SessionId::new(Keys::generate().public_key(), "chat")
    }

    fn text(session_id: &SessionId, id: &str, sender: &PublicKey, created_at: u64) -> Message {
        Message::from_rumor(
            session_id.clone(),
            &Rumor {
                id: id.to_string(),
                pubkey: sender.to_hex(),
                created_at,
                kind: CHAT_MESSAGE_KIND,
                tags: vec![],
                content: format!("message {}", id),
            },
            sender,
        )
    }

    fn reaction(session_id: &SessionId, id: &str, target: &str, sender: &PublicKey, emoji: &str) -> Message {
        Message::from_rumor(
            session_id.clone(),
            &Rumor {
                id: id.to_string(),
                pubkey: sender.to_hex(),
                created_at: 10,
                kind: REACTION_KIND,
                tags: vec![vec!["e".to_string(), target.to_string()]],
                content: emoji.to_string(),
            },
            sender,
        )
    }

    #[test]
    fn messages_are_ordered_by_ms_then_id() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let sender = Keys::generate().public_key();

        let mut late = text(&chat, "b", &sender, 5);
        late.ms = Some(5_500);
        store.upsert(late, 0).unwrap();
        store.upsert(text(&chat, "c", &sender, 5), 0).unwrap();
        store.upsert(text(&chat, "a", &sender, 1), 0).unwrap();

        let ids: Vec<String> = store.messages(&chat).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn reaction_folds_into_target_latest_wins() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap();
        store.upsert(reaction(&chat, "r1", "m1", &bob, "👍"), 0).unwrap();
        let updated = store
            .upsert(reaction(&chat, "r2", "m1", &bob, "❤️"), 0)
            .unwrap()
            .unwrap();

        assert_eq!(updated.id, "m1");
        assert_eq!(updated.reactions.get(&bob.to_hex()).map(String::as_str), Some("❤️"));
        assert_eq!(store.messages(&chat).unwrap().len(), 1);
    }

    fn reaction_at(chat: &SessionId, id: &str, target: &str, sender: &PublicKey, emoji: &str, ms: u64) -> Message {
        let mut message = reaction(chat, id, target, sender, emoji);
        message.ms = Some(ms);
        message
    }

    #[test]
    fn late_arriving_older_reaction_does_not_win() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();
        store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap();

        store
            .upsert(reaction_at(&chat, "r2", "m1", &bob, "B-latest", 10_005), 0)
            .unwrap();
        let updated = store
            .upsert(reaction_at(&chat, "r1", "m1", &bob, "A-first", 10_000), 0)
            .unwrap()
            .unwrap();

        assert_eq!(updated.reactions.get(&bob.to_hex()).map(String::as_str), Some("B-latest"));
        assert_eq!(updated.reacted_at.get(&bob.to_hex()), Some(&10_005));
    }

    #[test]
    fn orphan_reactions_keep_latest_regardless_of_arrival() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        store
            .upsert(reaction_at(&chat, "a", "m1", &bob, "newer", 20_000), 0)
            .unwrap();
        store
            .upsert(reaction_at(&chat, "z", "m1", &bob, "older", 10_000), 0)
            .unwrap();
        let target = store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap().unwrap();

        assert_eq!(target.reactions.get(&bob.to_hex()).map(String::as_str), Some("newer"));
        assert_eq!(store.messages(&chat).unwrap().len(), 1);
    }

    #[test]
    fn message_id_of_another_sender_is_not_replaced() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        let mut original = text(&chat, "m1", &alice, 1);
        original.content = "alice original".to_string();
        store.upsert(original, 0).unwrap();

        let mut forged = text(&chat, "m1", &bob, 1);
        forged.content = "FORGED".to_string();
        assert!(store.upsert(forged, 0).unwrap().is_none());

        let kept = store.get(&chat, "m1").unwrap().unwrap();
        assert_eq!(kept.content, "alice original");
        assert_eq!(kept.sender, alice.to_hex());
    }

    #[test]
    fn orphan_reaction_folds_when_target_arrives() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        let stored = store
            .upsert(reaction(&chat, "r1", "m1", &bob, "🔥"), 0)
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, "r1");
        assert_eq!(store.messages(&chat).unwrap().len(), 1);

        let target = store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap().unwrap();
        assert_eq!(target.reactions.get(&bob.to_hex()).map(String::as_str), Some("🔥"));
        let messages = store.messages(&chat).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
    }

    #[test]
    fn reupsert_keeps_reactions() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();

        store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap();
        store.upsert(reaction(&chat, "r1", "m1", &bob, "👍"), 0).unwrap();
        let again = store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap().unwrap();

        assert_eq!(again.reactions.len(), 1);
        assert_eq!(store.messages(&chat).unwrap().len(), 1);
    }

    #[test]
    fn expiry_settings_stamp_and_purge() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let store = EventStore::new(storage.clone());
        let chat = session();
        let alice = Keys::generate().public_key();

        store.set_expiry(&chat, Some(60)).unwrap();
        let stored = store.upsert(text(&chat, "m1", &alice, 100), 100).unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(160));

        assert!(store.upsert(text(&chat, "old", &alice, 10), 100).unwrap().is_none());

        assert_eq!(store.purge_expired(159).unwrap(), 0);
        assert_eq!(store.purge_expired(160).unwrap(), 1);
        assert!(store.messages(&chat).unwrap().is_empty());
        assert!(storage.list(EVENTS_PREFIX).unwrap().is_empty());

        store.set_expiry(&chat, None).unwrap();
        let kept = store.upsert(text(&chat, "m2", &alice, 100), 1000).unwrap().unwrap();
        assert_eq!(kept.expires_at, None);
    }

    #[test]
    fn explicit_expiration_tag_wins() {
        let store = EventStore::new(Arc::new(InMemoryStorage::new()));
        let chat = session();
        let alice = Keys::generate().public_key();
        store.set_expiry(&chat, Some(60)).unwrap();

        let mut message = text(&chat, "m1", &alice, 100);
        message.expires_at = Some(500);
        let stored = store.upsert(message, 100).unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(500));
    }

    #[test]
    fn load_restores_messages_and_settings() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let chat = session();
        let alice = Keys::generate().public_key();
        {
            let store = EventStore::new(storage.clone());
            store.set_expiry(&chat, Some(3600)).unwrap();
            store.upsert(text(&chat, "m1", &alice, 1), 0).unwrap();
            store.upsert(reaction(&chat, "r1", "m1", &alice, "👍"), 0).unwrap();
        }

        let store = EventStore::new(storage);
        assert_eq!(store.load().unwrap(), 1);
        assert_eq!(store.expiry(&chat).unwrap(), Some(3600));
        let message = store.get(&chat, "m1").unwrap().unwrap();
        assert_eq!(message.reactions.len(), 1);
    }

    #[test]
    fn remove_session_and_clear() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let store = EventStore::new(storage.clone());
        let one = session();
        let two = session();
        let alice = Keys::generate().public_key();
        store.upsert(text(&one, "a", &alice, 1), 0).unwrap();
        store.upsert(text(&two, "b", &alice, 1), 0).unwrap();

        store.remove_session(&one).unwrap();
        assert!(store.messages(&one).unwrap().is_empty());
        assert_eq!(storage.list(EVENTS_PREFIX).unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.messages(&two).unwrap().is_empty());
        assert!(storage.list(EVENTS_PREFIX).unwrap().is_empty());
    }
}
