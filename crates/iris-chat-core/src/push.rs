//! Decrypt-only path for push payloads.
//!
//! Sessions are rebuilt from persisted state with [`NoopPubSub`] and every
//! decryption attempt runs on a scratch copy, so showing a notification
//! never advances the ratchet the live client depends on.

use crate::{
    pubsub::NoopPubSub,
    storage::{StorageAdapter, SESSIONS_PREFIX},
    types::deserialize_session_state,
    Error, Result, Rumor, Session, SessionId, SessionState, INVITE_EVENT_KIND, INVITE_RESPONSE_KIND,
    MESSAGE_EVENT_KIND,
};
use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_ICON: &str = "/favicon.png";
pub const DEFAULT_TITLE: &str = "New notification";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

struct KindNotification {
    title: &'static str,
    url: &'static str,
    icon: &'static str,
}

fn kind_notification(kind: u16) -> Option<KindNotification> {
    let title = match kind {
        MESSAGE_EVENT_KIND => "New private message",
        INVITE_EVENT_KIND => "New message request",
        INVITE_RESPONSE_KIND => "New chat via invite",
        _ => return None,
    };
    Some(KindNotification {
        title,
        url: "/chats",
        icon: DEFAULT_ICON,
    })
}

pub struct PushDecryptor {
    sessions: Vec<(SessionId, SessionState)>,
}

impl PushDecryptor {
    pub fn new(sessions: Vec<(SessionId, SessionState)>) -> Self {
        Self { sessions }
    }

    /// Reads every persisted session. Unreadable entries are skipped.
    pub fn from_storage(storage: &dyn StorageAdapter) -> Result<Self> {
        let mut sessions = Vec::new();
        for key in storage.list(SESSIONS_PREFIX)? {
            let Some(raw) = storage.get(&key)? else {
                continue;
            };
            let parsed = key[SESSIONS_PREFIX.len()..]
                .parse::<SessionId>()
                .and_then(|id| Ok((id, deserialize_session_state(&raw)?)));
            match parsed {
                Ok(entry) => sessions.push(entry),
                Err(e) => tracing::warn!(key, error = %e, "skipping persisted session"),
            }
        }
        Ok(Self::new(sessions))
    }

    /// Accepts `{"state":{"sessions":[...]}}` or `{"sessions":[...]}`, where
    /// each entry is `[id, state]` or `{"id": .., "state": ..}` and a state
    /// is either a JSON string or an object.
    pub fn from_snapshot_json(json: &str) -> Result<Self> {
        let wrapper = match serde_json::from_str::<Value>(json)? {
            // Some stores keep the snapshot double-encoded.
            Value::String(inner) => serde_json::from_str(&inner)?,
            other => other,
        };

        let entries = wrapper
            .get("state")
            .and_then(|state| state.get("sessions"))
            .or_else(|| wrapper.get("sessions"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut sessions = Vec::new();
        for entry in entries {
            match parse_snapshot_entry(&entry) {
                Ok(parsed) => sessions.push(parsed),
                Err(e) => tracing::warn!(error = %e, "skipping snapshot entry"),
            }
        }
        Ok(Self::new(sessions))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tries every session against `event` on a scratch copy.
    pub fn decrypt(&self, event: &Event) -> Option<(SessionId, Rumor)> {
        if event.kind.as_u16() != MESSAGE_EVENT_KIND {
            return None;
        }
        for (id, state) in &self.sessions {
            let mut scratch =
                Session::from_state(state.clone(), id.name().to_string(), Arc::new(NoopPubSub));
            match scratch.handle_event(event) {
                Ok(rumor) => return Some((id.clone(), rumor)),
                Err(e) => tracing::debug!(session = %id, error = %e, "push decrypt attempt failed"),
            }
        }
        None
    }

    pub fn notification_for(&self, payload: &PushPayload) -> Notification {
        let kind = payload.event.kind.as_u16();

        if let Some((id, rumor)) = self.decrypt(&payload.event) {
            return Notification {
                title: format!("{}: {}", id.name(), rumor.content),
                body: None,
                icon: kind_notification(kind)
                    .map(|config| config.icon)
                    .unwrap_or(DEFAULT_ICON)
                    .to_string(),
                url: Some(format!("/chats/{}", id.url_encoded())),
                session_id: Some(id),
            };
        }

        if let Some(config) = kind_notification(kind) {
            return Notification {
                title: config.title.to_string(),
                body: None,
                icon: config.icon.to_string(),
                url: Some(config.url.to_string()),
                session_id: None,
            };
        }

        Notification {
            title: payload
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            body: payload.body.clone(),
            icon: payload
                .icon
                .clone()
                .filter(|icon| !icon.is_empty())
                .unwrap_or_else(|| DEFAULT_ICON.to_string()),
            url: payload.url.clone(),
            session_id: None,
        }
    }
}

fn parse_snapshot_entry(entry: &Value) -> Result<(SessionId, SessionState)> {
    let (id, state) = match entry {
        Value::Array(pair) if pair.len() == 2 => (Some(&pair[0]), Some(&pair[1])),
        Value::Object(map) => (map.get("id"), map.get("state")),
        _ => (None, None),
    };
    let (Some(id), Some(state)) = (id.and_then(Value::as_str), state) else {
        return Err(Error::Serialization("Unexpected snapshot entry".to_string()));
    };
    let id: SessionId = id.parse()?;
    let state = match state {
        Value::String(raw) => deserialize_session_state(raw)?,
        other => serde_json::from_value(other.clone())?,
    };
    Ok((id, state))
}

/// Absolute navigation target for a clicked notification. The path comes
/// from `url` or `event.url`; absolute URLs are reduced to their path.
pub fn click_target(origin: &str, data: &Value) -> Option<String> {
    let path = data
        .get("url")
        .and_then(Value::as_str)
        .or_else(|| data.get("event")?.get("url")?.as_str())
        .filter(|path| !path.is_empty())?;

    let pathname = if path.starts_with("http") {
        url_path(path)
    } else {
        path
    };
    Some(format!("{}{}", origin.trim_end_matches('/'), pathname))
}

fn url_path(url: &str) -> &str {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = after_scheme
        .find('/')
        .map(|i| &after_scheme[i..])
        .unwrap_or("/");
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{serialize_session_state, InMemoryStorage, Invite, LocalKey};
    use nostr::{EventBuilder, Keys, Kind};
    use serde_json::json;

    fn sessions() -> (Session, Session, nostr::PublicKey) {
        let alice = LocalKey::generate();
        let bob = LocalKey::generate();
        let mut invite = Invite::create_new(alice.keys().public_key(), "push");
        let (bob_session, envelope) = invite.accept(&bob).unwrap();
        let alice_session = invite
            .process_response(&envelope, &alice)
            .unwrap()
            .unwrap()
            .session;
        (alice_session, bob_session, bob.keys().public_key())
    }

    fn payload(event: Event) -> PushPayload {
        PushPayload {
            event,
            title: None,
            body: None,
            icon: None,
            url: None,
        }
    }

    #[test]
    fn decrypts_without_advancing_persisted_state() {
        let (alice_session, mut bob_session, bob) = sessions();
        let id = SessionId::new(bob, alice_session.name.clone());
        let persisted = serialize_session_state(&alice_session.state).unwrap();

        let storage = InMemoryStorage::new();
        storage
            .put(&format!("{}{}", SESSIONS_PREFIX, id), persisted.clone())
            .unwrap();

        let (event, _) = bob_session.send_text("hello from push").unwrap();
        let decryptor = PushDecryptor::from_storage(&storage).unwrap();
        let notification = decryptor.notification_for(&payload(event.clone()));

        assert_eq!(
            notification.title,
            format!("{}: hello from push", id.name())
        );
        assert_eq!(notification.url, Some(format!("/chats/{}", id.url_encoded())));
        assert_eq!(notification.session_id, Some(id.clone()));
        assert_eq!(
            storage.get(&format!("{}{}", SESSIONS_PREFIX, id)).unwrap(),
            Some(persisted)
        );

        // Same event decrypts again because nothing was committed.
        assert!(decryptor.decrypt(&event).is_some());
    }

    #[test]
    fn snapshot_formats_are_accepted() {
        let (alice_session, mut bob_session, bob) = sessions();
        let id = SessionId::new(bob, alice_session.name.clone()).to_string();
        let state_string = serialize_session_state(&alice_session.state).unwrap();
        let state_object: Value = serde_json::from_str(&state_string).unwrap();
        let (event, _) = bob_session.send_text("hi").unwrap();

        let snapshots = [
            json!({ "state": { "sessions": [[id, state_string]] } }).to_string(),
            json!({ "sessions": [[id, state_object]] }).to_string(),
            json!({ "sessions": [{ "id": id, "state": state_string }] }).to_string(),
            serde_json::to_string(&json!({ "sessions": [[id, state_string]] }).to_string())
                .unwrap(),
        ];
        for snapshot in snapshots {
            let decryptor = PushDecryptor::from_snapshot_json(&snapshot).unwrap();
            assert_eq!(decryptor.len(), 1);
            let (_, rumor) = decryptor.decrypt(&event).unwrap();
            assert_eq!(rumor.content, "hi");
        }
    }

    #[test]
    fn broken_entries_are_skipped() {
        let snapshot = json!({ "sessions": [["not-an-id", "{}"], ["a:b"], 42] }).to_string();
        let decryptor = PushDecryptor::from_snapshot_json(&snapshot).unwrap();
        assert!(decryptor.is_empty());
    }

    #[test]
    fn undecryptable_message_falls_back_to_kind_table() {
        let (_, mut bob_session, _) = sessions();
        let (event, _) = bob_session.send_text("secret").unwrap();

        let notification = PushDecryptor::new(Vec::new()).notification_for(&payload(event));
        assert_eq!(notification.title, "New private message");
        assert_eq!(notification.url.as_deref(), Some("/chats"));
        assert_eq!(notification.icon, DEFAULT_ICON);
        assert_eq!(notification.session_id, None);
    }

    #[test]
    fn invite_kinds_use_table() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(INVITE_RESPONSE_KIND), "x")
            .sign_with_keys(&keys)
            .unwrap();
        let notification = PushDecryptor::new(Vec::new()).notification_for(&payload(event));
        assert_eq!(notification.title, "New chat via invite");
    }

    #[test]
    fn custom_notification_uses_payload() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("zap").sign_with_keys(&keys).unwrap();
        let decryptor = PushDecryptor::new(Vec::new());

        let mut custom = payload(event.clone());
        custom.title = Some("Zapped".to_string());
        custom.body = Some("21 sats".to_string());
        custom.icon = Some("https://example.com/a.png".to_string());
        let notification = decryptor.notification_for(&custom);
        assert_eq!(notification.title, "Zapped");
        assert_eq!(notification.body.as_deref(), Some("21 sats"));
        assert_eq!(notification.icon, "https://example.com/a.png");

        let bare = decryptor.notification_for(&payload(event));
        assert_eq!(bare.title, DEFAULT_TITLE);
        assert_eq!(bare.icon, DEFAULT_ICON);
    }

    #[test]
    fn click_target_resolves_paths() {
        let origin = "https://iris.to";
        assert_eq!(
            click_target(origin, &json!({ "url": "/chats/abc" })).as_deref(),
            Some("https://iris.to/chats/abc")
        );
        assert_eq!(
            click_target(origin, &json!({ "url": "https://other.host/chats/x?y=1#z" })).as_deref(),
            Some("https://iris.to/chats/x")
        );
        assert_eq!(
            click_target(origin, &json!({ "event": { "url": "/settings" } })).as_deref(),
            Some("https://iris.to/settings")
        );
        assert_eq!(click_target(origin, &json!({ "url": "https://bare.host" })).as_deref(), Some("https://iris.to/"));
        assert!(click_target(origin, &json!({})).is_none());
    }
}
