use crate::{
    identity::SharedIdentity,
    pubsub::NostrPubSub,
    storage::{StorageAdapter, INVITES_PREFIX},
    utils::find_tag_value,
    Error, Invite, Result, Session,
};
use nostr::{Event, EventId, PublicKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub const PUBLIC_INVITE_ID: &str = "public";
pub const PRIVATE_INVITE_ID: &str = "private";

struct InviteEntry {
    invite: Invite,
    subscription: Option<String>,
}

/// Our own invites, their persistence and their response listeners.
pub struct InviteRegistry {
    identity: SharedIdentity,
    pubsub: Arc<dyn NostrPubSub>,
    storage: Arc<dyn StorageAdapter>,
    invites: Mutex<HashMap<String, InviteEntry>>,
    processed_responses: Mutex<HashSet<EventId>>,
}

impl InviteRegistry {
    pub fn new(
        identity: SharedIdentity,
        pubsub: Arc<dyn NostrPubSub>,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        Self {
            identity,
            pubsub,
            storage,
            invites: Mutex::new(HashMap::new()),
            processed_responses: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, InviteEntry>>> {
        self.invites
            .lock()
            .map_err(|_| Error::Storage("Invite registry poisoned".to_string()))
    }

    fn storage_key(id: &str) -> String {
        format!("{}{}", INVITES_PREFIX, id)
    }

    fn persist(&self, invite: &Invite) -> Result<()> {
        self.storage
            .put(&Self::storage_key(&invite.id), invite.serialize()?)
    }

    /// Reads persisted invites. Ids already in memory are left alone, so
    /// repeated loads neither replace invites nor drop their listeners.
    pub fn load(&self) -> Result<usize> {
        let keys = self.storage.list(INVITES_PREFIX)?;
        let mut invites = self.lock()?;
        let mut loaded = 0;
        for key in keys {
            let id = &key[INVITES_PREFIX.len()..];
            if invites.contains_key(id) {
                continue;
            }
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match Invite::deserialize(&raw) {
                Ok(invite) => {
                    invites.insert(
                        id.to_string(),
                        InviteEntry {
                            invite: invite.with_id(id),
                            subscription: None,
                        },
                    );
                    loaded += 1;
                }
                Err(e) => tracing::warn!(invite = id, error = %e, "failed to deserialize invite"),
            }
        }
        Ok(loaded)
    }

    pub fn create_invite(&self, label: &str) -> Result<Invite> {
        let invite = Invite::create_new(self.identity.public_key(), label);
        self.insert_and_listen(invite.clone())?;
        tracing::info!(invite = %invite.id, label, "created invite");
        Ok(invite)
    }

    /// Returns the invite stored under `id`, creating it if it is missing or
    /// unusable. When `publish` is set the invite event is signed and
    /// published either way.
    pub fn ensure_invite(&self, id: &str, label: &str, publish: bool) -> Result<Invite> {
        let existing = self
            .lock()?
            .get(id)
            .map(|entry| entry.invite.clone())
            .filter(|invite| invite.is_ours() && invite.inviter == self.identity.public_key());

        let invite = match existing {
            Some(invite) => {
                tracing::debug!(invite = id, "found existing invite");
                invite
            }
            None => {
                let invite = Invite::create_new(self.identity.public_key(), label).with_id(id);
                self.delete_invite(id)?;
                self.insert_and_listen(invite.clone())?;
                tracing::info!(invite = id, label, "created invite");
                invite
            }
        };

        if publish {
            self.publish(&invite)?;
        }
        Ok(invite)
    }

    /// The public invite (published) and the private one (link only).
    pub fn ensure_default_invites(&self, publish_public: bool) -> Result<()> {
        self.ensure_invite(PUBLIC_INVITE_ID, "Public Invite", publish_public)?;
        self.ensure_invite(PRIVATE_INVITE_ID, "Private Invite", false)?;
        Ok(())
    }

    fn publish(&self, invite: &Invite) -> Result<()> {
        let signed = self.identity.sign(invite.get_event()?)?;
        self.pubsub.publish_signed(signed)
    }

    fn insert_and_listen(&self, invite: Invite) -> Result<()> {
        self.persist(&invite)?;
        let subscription = Some(invite.listen(self.pubsub.as_ref())?);
        self.lock()?.insert(
            invite.id.clone(),
            InviteEntry {
                invite,
                subscription,
            },
        );
        Ok(())
    }

    /// Attaches a response listener to every invite that lacks one.
    /// Returns how many were attached.
    pub fn listen_all(&self) -> Result<usize> {
        let mut invites = self.lock()?;
        let mut attached = 0;
        for (id, entry) in invites.iter_mut() {
            if entry.subscription.is_some() || !entry.invite.is_ours() {
                continue;
            }
            entry.subscription = Some(entry.invite.listen(self.pubsub.as_ref())?);
            tracing::debug!(invite = %id, "listening for invite responses");
            attached += 1;
        }
        Ok(attached)
    }

    pub fn delete_invite(&self, id: &str) -> Result<bool> {
        let removed = self.lock()?.remove(id);
        self.storage.del(&Self::storage_key(id))?;
        match removed {
            Some(entry) => {
                if let Some(subid) = entry.subscription {
                    self.pubsub.unsubscribe(&subid)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Invite>> {
        Ok(self.lock()?.get(id).map(|entry| entry.invite.clone()))
    }

    /// All invites, oldest first.
    pub fn list(&self) -> Result<Vec<Invite>> {
        let mut invites: Vec<Invite> = self
            .lock()?
            .values()
            .map(|entry| entry.invite.clone())
            .collect();
        invites.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(invites)
    }

    pub fn listener_count(&self) -> Result<usize> {
        Ok(self
            .lock()?
            .values()
            .filter(|entry| entry.subscription.is_some())
            .count())
    }

    /// Runs a kind 1059 envelope against our invites. Each envelope is
    /// handled once; replays return `Ok(None)`.
    pub fn handle_response(&self, event: &Event) -> Result<Option<(PublicKey, Session)>> {
        {
            let processed = self
                .processed_responses
                .lock()
                .map_err(|_| Error::Storage("Invite registry poisoned".to_string()))?;
            if processed.contains(&event.id) {
                tracing::debug!(event = %event.id, "invite response already processed");
                return Ok(None);
            }
        }

        let Some(addressed_to) = find_tag_value(&event.tags, "p") else {
            return Ok(None);
        };

        let mut invites = self.lock()?;
        let Some(entry) = invites
            .values_mut()
            .find(|entry| entry.invite.inviter_ephemeral_public_key.to_hex() == addressed_to)
        else {
            return Ok(None);
        };

        let Some(response) = entry
            .invite
            .process_response(event, self.identity.as_ref())?
        else {
            return Ok(None);
        };
        let updated = entry.invite.clone();
        drop(invites);

        self.persist(&updated)?;
        self.processed_responses
            .lock()
            .map_err(|_| Error::Storage("Invite registry poisoned".to_string()))?
            .insert(event.id);

        tracing::info!(
            invite = %updated.id,
            invitee = %response.invitee_identity.to_hex(),
            "invite accepted"
        );
        Ok(Some((response.invitee_identity, response.session)))
    }
}
