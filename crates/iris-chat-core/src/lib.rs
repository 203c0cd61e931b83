//! Invite, session and message lifecycle for end-to-end encrypted Nostr
//! chat built on a double ratchet over NIP-44.

pub mod chat_manager;
pub mod config;
pub mod error;
pub mod event_store;
pub mod identity;
pub mod invite;
pub mod invite_registry;
pub mod outbox;
pub mod pubsub;
pub mod push;
mod ratchet;
pub mod session;
pub mod session_id;
pub mod session_registry;
pub mod storage;
pub mod types;
pub mod utils;

pub use chat_manager::{ChatManager, ChatUpdate, Sent};
pub use config::ChatConfig;
pub use error::{Error, Result};
pub use event_store::{ChatSettings, EventStore, Message};
pub use identity::{IdentityCipher, LocalKey, SharedIdentity};
pub use invite::{Invite, InviteResponse};
pub use invite_registry::InviteRegistry;
pub use outbox::{Outbox, OutboxEntry};
pub use pubsub::{ChannelPubSub, NoopPubSub, NostrPubSub, PubSubEvent};
pub use push::{click_target, Notification, PushDecryptor, PushPayload};
pub use ratchet::Decrypted;
pub use session::Session;
pub use session_id::SessionId;
pub use session_registry::SessionRegistry;
pub use storage::{FileStorageAdapter, InMemoryStorage, StorageAdapter};
pub use types::*;
