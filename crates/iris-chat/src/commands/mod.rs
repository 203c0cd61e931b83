use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use iris_chat_core::{
    ChannelPubSub, ChatManager, FileStorageAdapter, PubSubEvent, SessionId, StorageAdapter,
};
use nostr::Event;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;

pub mod chat;
pub mod identity;
pub mod invite;
pub mod message;
pub mod push;

pub fn state_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("state")
}

/// Chat state opened for one command. Relay traffic is not performed here:
/// events the manager wants published are collected and printed instead.
pub struct App {
    pub manager: ChatManager,
    rx: Receiver<PubSubEvent>,
}

impl App {
    pub fn open(data_dir: &Path, config: &Config) -> Result<Self> {
        let identity = config.identity()?;
        let storage: Arc<dyn StorageAdapter> = Arc::new(
            FileStorageAdapter::new(state_dir(data_dir)).context("Failed to open chat state")?,
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        let manager = ChatManager::new(
            Arc::new(identity),
            Arc::new(ChannelPubSub::new(tx)),
            storage,
            config.chat_config(),
        );
        manager.init().context("Failed to load chat state")?;
        Ok(Self { manager, rx })
    }

    /// Events handed to the relay layer since the last call.
    pub fn outgoing(&self) -> Vec<Event> {
        iris_chat_core::pubsub::drain(&self.rx)
            .into_iter()
            .filter_map(|event| match event {
                PubSubEvent::PublishSigned(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

pub fn parse_chat_id(chat_id: &str) -> Result<SessionId> {
    chat_id
        .parse()
        .with_context(|| format!("Invalid chat id: {}", chat_id))
}
