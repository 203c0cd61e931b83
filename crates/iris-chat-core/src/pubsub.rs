use crate::{Error, Result};
use nostr::Filter;

/// Relay access for invites and sessions, which manage their own
/// subscriptions through it.
pub trait NostrPubSub: Send + Sync {
    /// Subscribe to events matching the filter. Returns the subscription id.
    fn subscribe(&self, filter: Filter) -> Result<String>;

    fn unsubscribe(&self, sub_id: &str) -> Result<()>;

    /// Publish an already-signed event.
    fn publish_signed(&self, event: nostr::Event) -> Result<()>;
}

/// What [`ChannelPubSub`] hands to the host that talks to relays.
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    Subscribe { subid: String, filter: Filter },
    Unsubscribe(String),
    PublishSigned(nostr::Event),
}

pub struct ChannelPubSub {
    event_tx: crossbeam_channel::Sender<PubSubEvent>,
}

impl ChannelPubSub {
    pub fn new(event_tx: crossbeam_channel::Sender<PubSubEvent>) -> Self {
        Self { event_tx }
    }

    fn send(&self, event: PubSubEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .map_err(|_| Error::PubSub("Receiver dropped".to_string()))
    }
}

impl NostrPubSub for ChannelPubSub {
    fn subscribe(&self, filter: Filter) -> Result<String> {
        let subid = format!("sub-{}", uuid::Uuid::new_v4());
        self.send(PubSubEvent::Subscribe {
            subid: subid.clone(),
            filter,
        })?;
        Ok(subid)
    }

    fn unsubscribe(&self, sub_id: &str) -> Result<()> {
        self.send(PubSubEvent::Unsubscribe(sub_id.to_string()))
    }

    fn publish_signed(&self, event: nostr::Event) -> Result<()> {
        self.send(PubSubEvent::PublishSigned(event))
    }
}

/// Accepts every call and does nothing. Sessions rebuilt for one-off
/// decryption use this so they never open relay subscriptions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPubSub;

impl NostrPubSub for NoopPubSub {
    fn subscribe(&self, _filter: Filter) -> Result<String> {
        Ok(String::new())
    }

    fn unsubscribe(&self, _sub_id: &str) -> Result<()> {
        Ok(())
    }

    fn publish_signed(&self, _event: nostr::Event) -> Result<()> {
        Ok(())
    }
}

/// Drains a [`ChannelPubSub`] receiver. Handy in tests and in hosts that
/// batch relay work.
pub fn drain(rx: &crossbeam_channel::Receiver<PubSubEvent>) -> Vec<PubSubEvent> {
    rx.try_iter().collect()
}
