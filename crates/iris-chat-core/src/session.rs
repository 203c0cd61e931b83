use crate::{
    pubsub::{NoopPubSub, NostrPubSub},
    utils::{find_tag_value, now_millis, tag, verified_rumor},
    Error, Result, Rumor, SessionState, CHAT_MESSAGE_KIND, MESSAGE_EVENT_KIND, MS_TAG,
    REACTION_KIND,
};
use nostr::{Event, EventBuilder, Filter, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use std::sync::Arc;

pub type EventListener = Box<dyn Fn(&Rumor, &Event) + Send>;

/// One double ratchet conversation with a single peer.
pub struct Session {
    pub state: SessionState,
    pub name: String,
    pubsub: Arc<dyn NostrPubSub>,
    subscriptions: Vec<String>,
    listeners: Vec<(u64, EventListener)>,
    next_listener_id: u64,
}

impl Session {
    /// Rebuilds a session from persisted state. Pass [`NoopPubSub`] for a
    /// decrypt-only session that never touches relays.
    pub fn from_state(state: SessionState, name: String, pubsub: Arc<dyn NostrPubSub>) -> Self {
        Self {
            state,
            name,
            pubsub,
            subscriptions: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    pub fn init(
        their_ephemeral_nostr_public_key: PublicKey,
        our_ephemeral_nostr_private_key: [u8; 32],
        is_initiator: bool,
        shared_secret: [u8; 32],
        name: String,
    ) -> Result<Self> {
        let state = if is_initiator {
            SessionState::new_initiator(
                their_ephemeral_nostr_public_key,
                our_ephemeral_nostr_private_key,
                shared_secret,
            )?
        } else {
            SessionState::new_responder(
                their_ephemeral_nostr_public_key,
                our_ephemeral_nostr_private_key,
                shared_secret,
            )?
        };
        Ok(Self::from_state(state, name, Arc::new(NoopPubSub)))
    }

    pub fn set_pubsub(&mut self, pubsub: Arc<dyn NostrPubSub>) {
        self.pubsub = pubsub;
    }

    pub fn can_send(&self) -> bool {
        self.state.can_send()
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Subscribes to kind 1060 events authored by the peer's current and
    /// next ratchet keys. Existing subscriptions are kept.
    pub fn subscribe(&mut self) -> Result<()> {
        if self.is_subscribed() {
            return Ok(());
        }
        let authors: Vec<PublicKey> = self
            .state
            .their_current_nostr_public_key
            .into_iter()
            .chain(self.state.their_next_nostr_public_key)
            .collect();
        if authors.is_empty() {
            return Ok(());
        }
        let filter = Filter::new()
            .kind(Kind::from(MESSAGE_EVENT_KIND))
            .authors(authors);
        let subid = self.pubsub.subscribe(filter)?;
        self.subscriptions.push(subid);
        Ok(())
    }

    fn their_keys(&self) -> (Option<PublicKey>, Option<PublicKey>) {
        (
            self.state.their_current_nostr_public_key,
            self.state.their_next_nostr_public_key,
        )
    }

    fn resubscribe(&mut self) -> Result<()> {
        self.unsubscribe_all();
        self.subscribe()
    }

    fn unsubscribe_all(&mut self) {
        for subid in self.subscriptions.drain(..) {
            if let Err(e) = self.pubsub.unsubscribe(&subid) {
                tracing::warn!(session = %self.name, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Registers a callback for every decrypted rumor. Returns an id for
    /// [`Session::remove_listener`].
    pub fn on_event(&mut self, listener: EventListener) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: u64) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> Result<(Event, Rumor)> {
        let rumor = EventBuilder::new(Kind::from(CHAT_MESSAGE_KIND), text.into())
            .build(Keys::generate().public_key());
        self.send_rumor(rumor)
    }

    pub fn send_reaction(&mut self, message_id: &str, emoji: &str) -> Result<(Event, Rumor)> {
        let rumor = EventBuilder::new(Kind::from(REACTION_KIND), emoji)
            .tag(tag("e", message_id)?)
            .build(Keys::generate().public_key());
        self.send_rumor(rumor)
    }

    /// Encrypts `rumor` as the next message on the sending chain and returns
    /// the signed outer event together with the rumor as the peer will see
    /// it. The rumor gets a fresh timestamp, an `ms` tag unless it has one,
    /// and a recomputed id.
    pub fn send_rumor(&mut self, rumor: UnsignedEvent) -> Result<(Event, Rumor)> {
        if !self.can_send() {
            return Err(Error::NotInitiator);
        }

        let now_ms = now_millis();
        let created_at = Timestamp::from(now_ms / 1000);
        let has_ms = find_tag_value(&rumor.tags, MS_TAG).is_some();
        let mut tags: Vec<Tag> = rumor.tags.iter().cloned().collect();
        if !has_ms {
            tags.push(tag(MS_TAG, now_ms.to_string())?);
        }
        let mut inner = EventBuilder::new(rumor.kind, rumor.content.clone())
            .tags(tags)
            .custom_created_at(created_at)
            .build(rumor.pubkey);
        inner.ensure_id();

        let rumor_json = serde_json::to_string(&inner)?;
        let sent: Rumor = serde_json::from_str(&rumor_json)?;

        let mut state = self.state.clone();
        let (encrypted_header, ciphertext, author) = state.encrypt(&rumor_json)?;
        let author_keys = Keys::new(author.secret_key()?);

        let event = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND), ciphertext)
            .tag(tag("header", encrypted_header)?)
            .custom_created_at(created_at)
            .build(author.public_key)
            .sign_with_keys(&author_keys)
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;

        self.state = state;
        Ok((event, sent))
    }

    /// Decrypts a kind 1060 event addressed to this session. The state only
    /// changes when decryption succeeds and the rumor's id matches its
    /// content. Listeners registered with
    /// [`Session::on_event`] see every successfully decrypted rumor.
    pub fn handle_event(&mut self, event: &Event) -> Result<Rumor> {
        if event.kind.as_u16() != MESSAGE_EVENT_KIND {
            return Err(Error::InvalidEvent(format!(
                "Unexpected kind {}",
                event.kind.as_u16()
            )));
        }
        let encrypted_header = find_tag_value(&event.tags, "header").ok_or(Error::InvalidHeader)?;

        let authors_before = self.their_keys();
        let mut state = self.state.clone();
        let decrypted = state.decrypt(&encrypted_header, &event.pubkey, &event.content)?;
        let rumor = verified_rumor(&decrypted.plaintext)?;
        self.state = state;

        if self.is_subscribed() && self.their_keys() != authors_before {
            tracing::debug!(session = %self.name, ratcheted = decrypted.ratcheted, "peer keys rotated");
            if let Err(e) = self.resubscribe() {
                tracing::warn!(session = %self.name, error = %e, "resubscribe after ratchet failed");
            }
        }

        for (_, listener) in &self.listeners {
            listener(&rumor, event);
        }
        Ok(rumor)
    }

    /// Drops relay subscriptions and listeners. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.unsubscribe_all();
        self.listeners.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
