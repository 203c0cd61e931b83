use crate::{
    config::ChatConfig,
    event_store::{EventStore, Message},
    identity::SharedIdentity,
    invite_registry::InviteRegistry,
    outbox::Outbox,
    pubsub::NostrPubSub,
    push::PushDecryptor,
    session_registry::SessionRegistry,
    storage::StorageAdapter,
    utils::{now_seconds, rumor_from_unsigned, tag},
    Error, Invite, Result, Rumor, SessionId, CHAT_MESSAGE_KIND, EXPIRATION_TAG,
    INVITE_RESPONSE_KIND, MESSAGE_EVENT_KIND, REACTION_KIND,
};
use nostr::{Event, EventBuilder, Kind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What changed after [`ChatManager::process_received_event`].
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    /// An invite response created a new session.
    SessionCreated { session_id: SessionId },
    /// A message was decrypted. `message` is what the conversation should
    /// show, which for a reaction is the message it was folded into, and
    /// `None` when the message had already expired. `flushed` holds queued
    /// events that became sendable and were published.
    Message {
        session_id: SessionId,
        message: Option<Message>,
        flushed: Vec<Event>,
    },
    Ignored,
}

/// Result of sending. `event` is `None` when the rumor was queued because
/// the session cannot send yet.
#[derive(Debug, Clone)]
pub struct Sent {
    pub message: Option<Message>,
    pub event: Option<Event>,
}

/// Ties invites, sessions, stored messages and the outbox to one identity.
pub struct ChatManager {
    identity: SharedIdentity,
    pubsub: Arc<dyn NostrPubSub>,
    storage: Arc<dyn StorageAdapter>,
    config: ChatConfig,
    invites: InviteRegistry,
    sessions: SessionRegistry,
    events: EventStore,
    outbox: Outbox,
    initialized: AtomicBool,
}

impl ChatManager {
    pub fn new(
        identity: SharedIdentity,
        pubsub: Arc<dyn NostrPubSub>,
        storage: Arc<dyn StorageAdapter>,
        config: ChatConfig,
    ) -> Self {
        Self {
            invites: InviteRegistry::new(identity.clone(), pubsub.clone(), storage.clone()),
            sessions: SessionRegistry::new(pubsub.clone(), storage.clone(), config.max_seen_events),
            events: EventStore::new(storage.clone()),
            outbox: Outbox::new(storage.clone()),
            identity,
            pubsub,
            storage,
            config,
            initialized: AtomicBool::new(false),
        }
    }

    /// Loads persisted state, creates the default invites and starts
    /// listening. Later calls do nothing.
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sessions = self.sessions.load()?;
        let messages = self.events.load()?;
        let invites = self.invites.load()?;
        if self.config.default_invites {
            self.invites
                .ensure_default_invites(self.config.publish_public_invite)?;
        }
        self.invites.listen_all()?;
        tracing::info!(sessions, messages, invites, "chat manager initialized");
        Ok(())
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn invites(&self) -> &InviteRegistry {
        &self.invites
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn create_invite(&self, label: &str) -> Result<Invite> {
        self.invites.create_invite(label)
    }

    pub fn invite_url(&self, invite: &Invite) -> Result<String> {
        invite.get_url(&self.config.invite_url_root)
    }

    pub fn accept_invite_url(&self, url: &str) -> Result<SessionId> {
        self.accept_invite(&Invite::from_url(url)?)
    }

    /// Invitee side of the handshake: publishes the response envelope and
    /// registers the new session, which can send right away.
    pub fn accept_invite(&self, invite: &Invite) -> Result<SessionId> {
        let (session, envelope) = invite.accept(self.identity.as_ref())?;
        self.pubsub.publish_signed(envelope)?;
        let (session_id, _) = self.sessions.add_session(invite.inviter, session)?;
        tracing::info!(session = %session_id, "accepted invite");
        Ok(session_id)
    }

    pub fn process_received_event(&self, event: &Event) -> Result<ChatUpdate> {
        match event.kind.as_u16() {
            INVITE_RESPONSE_KIND => {
                let Some((peer, session)) = self.invites.handle_response(event)? else {
                    return Ok(ChatUpdate::Ignored);
                };
                let (session_id, added) = self.sessions.add_session(peer, session)?;
                if !added {
                    return Ok(ChatUpdate::Ignored);
                }
                Ok(ChatUpdate::SessionCreated { session_id })
            }
            MESSAGE_EVENT_KIND => {
                let Some((session_id, rumor)) = self.sessions.handle_event(event)? else {
                    return Ok(ChatUpdate::Ignored);
                };
                let message = Message::from_rumor(session_id.clone(), &rumor, session_id.peer());
                let message = self.events.upsert(message, now_seconds())?;
                let flushed = self.flush_outbox(&session_id)?;
                Ok(ChatUpdate::Message {
                    session_id,
                    message,
                    flushed,
                })
            }
            kind => {
                tracing::debug!(kind, "ignoring event kind");
                Ok(ChatUpdate::Ignored)
            }
        }
    }

    pub fn send_text(&self, session_id: &SessionId, text: &str) -> Result<Sent> {
        let builder = EventBuilder::new(Kind::from(CHAT_MESSAGE_KIND), text);
        self.send(session_id, builder)
    }

    pub fn send_reaction(&self, session_id: &SessionId, message_id: &str, emoji: &str) -> Result<Sent> {
        let builder = EventBuilder::new(Kind::from(REACTION_KIND), emoji).tag(tag("e", message_id)?);
        self.send(session_id, builder)
    }

    fn send(&self, session_id: &SessionId, mut builder: EventBuilder) -> Result<Sent> {
        if !self.sessions.contains(session_id)? {
            return Err(Error::UnknownSession(session_id.to_string()));
        }
        if let Some(seconds) = self.events.expiry(session_id)? {
            let expires_at = now_seconds().saturating_add(seconds);
            builder = builder.tag(tag(EXPIRATION_TAG, expires_at.to_string())?);
        }
        let mut rumor = builder.build(self.identity.public_key());

        if !self.sessions.can_send(session_id)? {
            rumor.ensure_id();
            self.outbox.add(session_id, &rumor)?;
            let message = self.record_own(session_id, &rumor_from_unsigned(&rumor)?)?;
            return Ok(Sent {
                message,
                event: None,
            });
        }

        let (event, sent) = self.sessions.send_rumor(session_id, rumor)?;
        self.pubsub.publish_signed(event.clone())?;
        let message = self.record_own(session_id, &sent)?;
        Ok(Sent {
            message,
            event: Some(event),
        })
    }

    fn record_own(&self, session_id: &SessionId, rumor: &Rumor) -> Result<Option<Message>> {
        let message = Message::from_rumor(session_id.clone(), rumor, &self.identity.public_key());
        self.events.upsert(message, now_seconds())
    }

    /// Sends queued rumors once the session can send. Sending assigns a
    /// new id, so the queued copy in the event store is replaced.
    fn flush_outbox(&self, session_id: &SessionId) -> Result<Vec<Event>> {
        if !self.sessions.can_send(session_id)? {
            return Ok(Vec::new());
        }
        let mut published = Vec::new();
        for entry in self.outbox.pending(session_id)? {
            let queued_id = entry.rumor.id.map(|id| id.to_hex());
            let (event, sent) = self.sessions.send_rumor(session_id, entry.rumor)?;
            self.pubsub.publish_signed(event.clone())?;
            self.outbox.remove(&entry.id)?;
            if let Some(queued_id) = queued_id.filter(|id| *id != sent.id) {
                self.events.remove_message(session_id, &queued_id)?;
            }
            self.record_own(session_id, &sent)?;
            published.push(event);
        }
        if !published.is_empty() {
            tracing::info!(session = %session_id, count = published.len(), "flushed outbox");
        }
        Ok(published)
    }

    /// Closes the session and forgets its messages and queued sends.
    pub fn delete_chat(&self, session_id: &SessionId) -> Result<bool> {
        let removed = self.sessions.remove(session_id)?;
        self.events.remove_session(session_id)?;
        self.outbox.remove_session(session_id)?;
        Ok(removed)
    }

    pub fn set_expiry(&self, session_id: &SessionId, seconds: Option<u64>) -> Result<()> {
        self.events.set_expiry(session_id, seconds)
    }

    pub fn purge_expired(&self, now: u64) -> Result<usize> {
        self.events.purge_expired(now)
    }

    pub fn messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        self.events.messages(session_id)
    }

    pub fn session_ids(&self) -> Result<Vec<SessionId>> {
        self.sessions.ids()
    }

    pub fn snapshot_json(&self) -> Result<String> {
        self.sessions.snapshot_json()
    }

    /// Decrypt-only view over the persisted sessions.
    pub fn push_decryptor(&self) -> Result<PushDecryptor> {
        PushDecryptor::from_storage(self.storage.as_ref())
    }
}
