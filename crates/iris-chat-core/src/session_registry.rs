use crate::{
    pubsub::NostrPubSub,
    storage::{StorageAdapter, SESSIONS_PREFIX},
    types::{deserialize_session_state, serialize_session_state},
    Error, Result, Rumor, Session, SessionId, SessionState, MESSAGE_EVENT_KIND,
};
use nostr::{Event, EventId, PublicKey, UnsignedEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Insertion-ordered set that forgets its oldest ids past `capacity`.
struct SeenEvents {
    capacity: usize,
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: EventId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
    seen: SeenEvents,
    loaded: bool,
}

/// Live sessions keyed by [`SessionId`], mirrored to storage after every
/// state change.
pub struct SessionRegistry {
    pubsub: Arc<dyn NostrPubSub>,
    storage: Arc<dyn StorageAdapter>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(
        pubsub: Arc<dyn NostrPubSub>,
        storage: Arc<dyn StorageAdapter>,
        max_seen_events: usize,
    ) -> Self {
        Self {
            pubsub,
            storage,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                seen: SeenEvents::new(max_seen_events),
                loaded: false,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("Session registry poisoned".to_string()))
    }

    fn storage_key(id: &SessionId) -> String {
        format!("{}{}", SESSIONS_PREFIX, id)
    }

    fn persist(&self, id: &SessionId, state: &SessionState) -> Result<()> {
        self.storage
            .put(&Self::storage_key(id), serialize_session_state(state)?)
    }

    fn rehydrate(&self, id: &SessionId, raw: &str) -> Result<Session> {
        let state = deserialize_session_state(raw)?;
        let mut session = Session::from_state(state, id.name().to_string(), self.pubsub.clone());
        session.subscribe()?;
        Ok(session)
    }

    /// Rehydrates persisted sessions. Only the first call reads storage.
    pub fn load(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        if inner.loaded {
            return Ok(0);
        }
        inner.loaded = true;

        let mut loaded = 0;
        for key in self.storage.list(SESSIONS_PREFIX)? {
            let id: SessionId = match key[SESSIONS_PREFIX.len()..].parse() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping session with malformed id");
                    continue;
                }
            };
            if inner.sessions.contains_key(&id) {
                continue;
            }
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match self.rehydrate(&id, &raw) {
                Ok(session) => {
                    inner.sessions.insert(id, session);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(session = %id, error = %e, "failed to load session"),
            }
        }
        tracing::debug!(count = loaded, "loaded sessions");
        Ok(loaded)
    }

    /// Registers a session under `<peer>:<session name>`. Returns the id and
    /// whether the session is new. An id that is live or persisted keeps
    /// its existing session and `session` is dropped.
    pub fn add_session(&self, peer: PublicKey, mut session: Session) -> Result<(SessionId, bool)> {
        let id = SessionId::new(peer, session.name.clone());
        let mut inner = self.lock()?;
        if inner.sessions.contains_key(&id) {
            tracing::debug!(session = %id, "session already registered");
            return Ok((id, false));
        }

        if let Some(raw) = self.storage.get(&Self::storage_key(&id))? {
            tracing::debug!(session = %id, "session already persisted");
            let existing = self.rehydrate(&id, &raw)?;
            inner.sessions.insert(id.clone(), existing);
            return Ok((id, false));
        }

        session.set_pubsub(self.pubsub.clone());
        session.subscribe()?;
        self.persist(&id, &session.state)?;
        inner.sessions.insert(id.clone(), session);
        tracing::info!(session = %id, "session added");
        Ok((id, true))
    }

    /// Closes the session and forgets it, including the persisted state.
    pub fn remove(&self, id: &SessionId) -> Result<bool> {
        let removed = self.lock()?.sessions.remove(id);
        self.storage.del(&Self::storage_key(id))?;
        match removed {
            Some(mut session) => {
                session.close();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn contains(&self, id: &SessionId) -> Result<bool> {
        Ok(self.lock()?.sessions.contains_key(id))
    }

    pub fn can_send(&self, id: &SessionId) -> Result<bool> {
        let inner = self.lock()?;
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        Ok(session.can_send())
    }

    pub fn state(&self, id: &SessionId) -> Result<Option<SessionState>> {
        Ok(self.lock()?.sessions.get(id).map(|s| s.state.clone()))
    }

    /// Session ids in a stable order.
    pub fn ids(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.lock()?.sessions.keys().cloned().collect();
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }

    /// Decrypts a kind 1060 event with whichever session it belongs to.
    /// Sessions whose peer keys authored the event are tried first, then
    /// every other session. Events seen before return `Ok(None)`, as do
    /// events no session can decrypt.
    pub fn handle_event(&self, event: &Event) -> Result<Option<(SessionId, Rumor)>> {
        if event.kind.as_u16() != MESSAGE_EVENT_KIND {
            return Ok(None);
        }

        let mut inner = self.lock()?;
        if inner.seen.contains(&event.id) {
            tracing::debug!(event = %event.id, "duplicate event skipped");
            return Ok(None);
        }

        let mut candidates: Vec<SessionId> = Vec::with_capacity(inner.sessions.len());
        let mut rest = Vec::new();
        for (id, session) in &inner.sessions {
            if session.state.is_their_key(&event.pubkey) {
                candidates.push(id.clone());
            } else {
                rest.push(id.clone());
            }
        }
        candidates.extend(rest);

        for id in candidates {
            let Some(session) = inner.sessions.get_mut(&id) else {
                continue;
            };
            match session.handle_event(event) {
                Ok(rumor) => {
                    let state = session.state.clone();
                    inner.seen.insert(event.id);
                    self.persist(&id, &state)?;
                    return Ok(Some((id, rumor)));
                }
                Err(e) => tracing::debug!(session = %id, error = %e, "session could not decrypt event"),
            }
        }

        tracing::debug!(event = %event.id, "no session decrypted event");
        Ok(None)
    }

    /// Encrypts `rumor` on the session's sending chain and persists the
    /// advanced state. Returns the outer event to publish and the rumor as
    /// the peer will see it.
    pub fn send_rumor(&self, id: &SessionId, rumor: UnsignedEvent) -> Result<(Event, Rumor)> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        let sent = session.send_rumor(rumor)?;
        self.persist(id, &session.state)?;
        Ok(sent)
    }

    pub fn send_text(&self, id: &SessionId, text: &str) -> Result<(Event, Rumor)> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        let sent = session.send_text(text)?;
        self.persist(id, &session.state)?;
        Ok(sent)
    }

    pub fn send_reaction(&self, id: &SessionId, message_id: &str, emoji: &str) -> Result<(Event, Rumor)> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        let sent = session.send_reaction(message_id, emoji)?;
        self.persist(id, &session.state)?;
        Ok(sent)
    }

    /// `{"sessions": [[id, state], ...]}` for decrypt-only consumers.
    pub fn snapshot_json(&self) -> Result<String> {
        let inner = self.lock()?;
        let mut entries: Vec<(String, &SessionState)> = inner
            .sessions
            .iter()
            .map(|(id, session)| (id.to_string(), &session.state))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(serde_json::to_string(&serde_json::json!({ "sessions": entries }))?)
    }

    pub fn close_all(&self) -> Result<()> {
        let mut inner = self.lock()?;
        for session in inner.sessions.values_mut() {
            session.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pubsub::{drain, ChannelPubSub, PubSubEvent},
        InMemoryStorage, Invite, LocalKey,
    };

    struct Pair {
        alice_session: Session,
        bob_session: Session,
        alice: PublicKey,
        bob: PublicKey,
    }

    fn handshake() -> Pair {
        let alice = LocalKey::generate();
        let bob = LocalKey::generate();
        let mut invite = Invite::create_new(alice.keys().public_key(), "test");
        let (bob_session, envelope) = invite.accept(&bob).unwrap();
        let response = invite.process_response(&envelope, &alice).unwrap().unwrap();
        Pair {
            alice_session: response.session,
            bob_session,
            alice: alice.keys().public_key(),
            bob: bob.keys().public_key(),
        }
    }

    fn registry(
        storage: Arc<dyn StorageAdapter>,
    ) -> (SessionRegistry, crossbeam_channel::Receiver<PubSubEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            SessionRegistry::new(Arc::new(ChannelPubSub::new(tx)), storage, 100),
            rx,
        )
    }

    fn subscribe_count(events: &[PubSubEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, PubSubEvent::Subscribe { .. }))
            .count()
    }

    #[test]
    fn add_session_is_idempotent() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let (reg, rx) = registry(storage);
        let pair = handshake();
        let name = pair.bob_session.name.clone();

        let (id, added) = reg.add_session(pair.alice, pair.bob_session).unwrap();
        assert!(added);
        assert_eq!(id.name(), name);
        let duplicate = Session::from_state(
            reg.state(&id).unwrap().unwrap(),
            name,
            Arc::new(crate::NoopPubSub),
        );
        let (_, added_again) = reg.add_session(pair.alice, duplicate).unwrap();
        assert!(!added_again);
        assert_eq!(subscribe_count(&drain(&rx)), 1);
        assert_eq!(reg.ids().unwrap().len(), 1);
    }

    #[test]
    fn load_runs_once_and_skips_persisted_duplicates() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let pair = handshake();
        {
            let (reg, _rx) = registry(storage.clone());
            reg.add_session(pair.alice, pair.bob_session).unwrap();
        }

        let (reg, rx) = registry(storage);
        assert_eq!(reg.load().unwrap(), 1);
        assert_eq!(reg.load().unwrap(), 0);
        let id = reg.ids().unwrap().remove(0);
        assert!(reg.can_send(&id).unwrap());
        assert_eq!(subscribe_count(&drain(&rx)), 1);
    }

    #[test]
    fn handle_event_routes_dedupes_and_persists() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let (reg, _rx) = registry(storage.clone());
        let mut pair = handshake();

        let (alice_id, _) = reg.add_session(pair.bob, pair.alice_session).unwrap();
        let before = storage
            .get(&SessionRegistry::storage_key(&alice_id))
            .unwrap()
            .unwrap();

        let (event, sent) = pair.bob_session.send_text("hi alice").unwrap();
        let (id, rumor) = reg.handle_event(&event).unwrap().unwrap();
        assert_eq!(id, alice_id);
        assert_eq!(rumor.content, "hi alice");
        assert_eq!(rumor.id, sent.id);
        assert!(reg.handle_event(&event).unwrap().is_none());

        let after = storage
            .get(&SessionRegistry::storage_key(&alice_id))
            .unwrap()
            .unwrap();
        assert_ne!(before, after);
        assert!(reg.can_send(&alice_id).unwrap());
    }

    #[test]
    fn send_on_unknown_session_fails() {
        let (reg, _rx) = registry(Arc::new(InMemoryStorage::new()));
        let id = SessionId::new(LocalKey::generate().keys().public_key(), "nope");
        assert!(matches!(
            reg.send_text(&id, "hi"),
            Err(Error::UnknownSession(_))
        ));
    }

    #[test]
    fn remove_closes_and_deletes() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let (reg, rx) = registry(storage.clone());
        let pair = handshake();
        let (id, _) = reg.add_session(pair.alice, pair.bob_session).unwrap();
        drain(&rx);

        assert!(reg.remove(&id).unwrap());
        assert!(matches!(drain(&rx).as_slice(), [PubSubEvent::Unsubscribe(_)]));
        assert!(storage.list(SESSIONS_PREFIX).unwrap().is_empty());
        assert!(!reg.remove(&id).unwrap());
    }

    #[test]
    fn snapshot_lists_sessions() {
        let (reg, _rx) = registry(Arc::new(InMemoryStorage::new()));
        let pair = handshake();
        let (id, _) = reg.add_session(pair.alice, pair.bob_session).unwrap();

        let snapshot: serde_json::Value =
            serde_json::from_str(&reg.snapshot_json().unwrap()).unwrap();
        let sessions = snapshot["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0][0], id.to_string());
        assert!(sessions[0][1]["root_key"].is_string());
    }

    #[test]
    fn seen_events_forget_oldest() {
        let mut seen = SeenEvents::new(2);
        let ids: Vec<EventId> = (0u8..3).map(|i| EventId::from_byte_array([i; 32])).collect();
        for id in &ids {
            seen.insert(*id);
        }
        assert!(!seen.contains(&ids[0]));
        assert!(seen.contains(&ids[1]));
        assert!(seen.contains(&ids[2]));
    }
}
