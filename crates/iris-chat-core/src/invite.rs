use crate::{
    identity::{decrypt_checked, IdentityCipher},
    pubsub::NostrPubSub,
    utils::{bytes32_from_hex, find_tag_value, now_seconds, pubkey_from_hex, tag},
    Error, Result, Session, INVITE_EVENT_KIND, INVITE_LIST_LABEL, INVITE_RESPONSE_KIND,
};
use base64::Engine;
use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, Filter, Keys, Kind, PublicKey, SecretKey, Timestamp, UnsignedEvent};
use serde::{Deserialize, Serialize};

/// Envelope timestamps are pushed back by up to this many seconds so the
/// response time does not leak.
const RESPONSE_TIMESTAMP_JITTER: u64 = 2 * 24 * 60 * 60;

/// A shareable capability to open a session with `inviter`.
///
/// The inviter keeps the ephemeral private key and listens for responses
/// addressed to the ephemeral public key. Whoever holds the URL can accept.
#[derive(Clone)]
pub struct Invite {
    pub id: String,
    pub label: String,
    pub inviter: PublicKey,
    pub inviter_ephemeral_public_key: PublicKey,
    pub inviter_ephemeral_private_key: Option<[u8; 32]>,
    pub shared_secret: [u8; 32],
    pub created_at: u64,
    pub max_uses: Option<usize>,
    pub used_by: Vec<PublicKey>,
}

pub struct InviteResponse {
    pub session: Session,
    pub invitee_identity: PublicKey,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializedInvite {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label: String,
    inviter: String,
    inviter_ephemeral_public_key: String,
    #[serde(default)]
    inviter_ephemeral_private_key: Option<String>,
    shared_secret: String,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    max_uses: Option<usize>,
    #[serde(default)]
    used_by: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct UrlPayload {
    inviter: String,
    #[serde(rename = "ephemeralKey", alias = "inviterEphemeralPublicKey")]
    ephemeral_key: String,
    #[serde(rename = "sharedSecret")]
    shared_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct InnerResponse {
    pubkey: String,
    content: String,
    created_at: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePayload {
    session_key: String,
}

impl Invite {
    pub fn create_new(inviter: PublicKey, label: impl Into<String>) -> Self {
        let ephemeral = Keys::generate();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            inviter,
            inviter_ephemeral_public_key: ephemeral.public_key(),
            inviter_ephemeral_private_key: Some(ephemeral.secret_key().to_secret_bytes()),
            shared_secret: Keys::generate().secret_key().to_secret_bytes(),
            created_at: now_seconds(),
            max_uses: None,
            used_by: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_uses(mut self, max_uses: usize) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    /// Whether we hold the ephemeral secret and can therefore process
    /// responses to this invite.
    pub fn is_ours(&self) -> bool {
        self.inviter_ephemeral_private_key.is_some()
    }

    pub fn get_url(&self, root: &str) -> Result<String> {
        let payload = UrlPayload {
            inviter: self.inviter.to_hex(),
            ephemeral_key: self.inviter_ephemeral_public_key.to_hex(),
            shared_secret: hex::encode(self.shared_secret),
            label: (!self.label.is_empty()).then(|| self.label.clone()),
        };
        Ok(format!(
            "{}#{}",
            root,
            urlencoding::encode(&serde_json::to_string(&payload)?)
        ))
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let (_, fragment) = url
            .split_once('#')
            .ok_or_else(|| Error::Invite("No hash in URL".to_string()))?;
        let decoded = urlencoding::decode(fragment).map_err(|e| Error::Invite(e.to_string()))?;
        let payload: UrlPayload = serde_json::from_str(&decoded)
            .map_err(|e| Error::Invite(format!("Malformed invite link: {}", e)))?;

        let inviter_ephemeral_public_key = pubkey_from_hex(&payload.ephemeral_key)?;
        Ok(Self {
            id: inviter_ephemeral_public_key.to_hex(),
            label: payload.label.unwrap_or_default(),
            inviter: pubkey_from_hex(&payload.inviter)?,
            inviter_ephemeral_public_key,
            inviter_ephemeral_private_key: None,
            shared_secret: bytes32_from_hex(&payload.shared_secret)?,
            created_at: 0,
            max_uses: None,
            used_by: Vec::new(),
        })
    }

    /// Replaceable event advertising this invite, to be signed by the
    /// inviter's identity.
    pub fn get_event(&self) -> Result<UnsignedEvent> {
        let tags = vec![
            tag("ephemeralKey", self.inviter_ephemeral_public_key.to_hex())?,
            tag("sharedSecret", hex::encode(self.shared_secret))?,
            tag("d", format!("{}/{}", INVITE_LIST_LABEL, self.id))?,
            tag("l", INVITE_LIST_LABEL)?,
        ];
        Ok(EventBuilder::new(Kind::from(INVITE_EVENT_KIND), "")
            .tags(tags)
            .custom_created_at(Timestamp::from(self.created_at))
            .build(self.inviter))
    }

    pub fn from_event(event: &Event) -> Result<Self> {
        if event.kind.as_u16() != INVITE_EVENT_KIND {
            return Err(Error::Invite("Not an invite event".to_string()));
        }
        let ephemeral_key = find_tag_value(&event.tags, "ephemeralKey")
            .ok_or_else(|| Error::Invite("Missing ephemeralKey tag".to_string()))?;
        let shared_secret = find_tag_value(&event.tags, "sharedSecret")
            .ok_or_else(|| Error::Invite("Missing sharedSecret tag".to_string()))?;
        let id = find_tag_value(&event.tags, "d")
            .and_then(|d| d.rsplit('/').next().map(String::from))
            .unwrap_or_else(|| ephemeral_key.clone());

        Ok(Self {
            id,
            label: String::new(),
            inviter: event.pubkey,
            inviter_ephemeral_public_key: pubkey_from_hex(&ephemeral_key)?,
            inviter_ephemeral_private_key: None,
            shared_secret: bytes32_from_hex(&shared_secret)?,
            created_at: event.created_at.as_u64(),
            max_uses: None,
            used_by: Vec::new(),
        })
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(&SerializedInvite {
            id: self.id.clone(),
            label: self.label.clone(),
            inviter: self.inviter.to_hex(),
            inviter_ephemeral_public_key: self.inviter_ephemeral_public_key.to_hex(),
            inviter_ephemeral_private_key: self.inviter_ephemeral_private_key.map(hex::encode),
            shared_secret: hex::encode(self.shared_secret),
            created_at: self.created_at,
            max_uses: self.max_uses,
            used_by: self.used_by.iter().map(|pk| pk.to_hex()).collect(),
        })?)
    }

    pub fn deserialize(json: &str) -> Result<Self> {
        let data: SerializedInvite =
            serde_json::from_str(json).map_err(|e| Error::Invite(format!("Malformed invite: {}", e)))?;
        let inviter_ephemeral_public_key = pubkey_from_hex(&data.inviter_ephemeral_public_key)?;
        let inviter_ephemeral_private_key = data
            .inviter_ephemeral_private_key
            .as_deref()
            .map(bytes32_from_hex)
            .transpose()?;
        let used_by = data
            .used_by
            .iter()
            .map(|s| pubkey_from_hex(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: if data.id.is_empty() {
                inviter_ephemeral_public_key.to_hex()
            } else {
                data.id
            },
            label: data.label,
            inviter: pubkey_from_hex(&data.inviter)?,
            inviter_ephemeral_public_key,
            inviter_ephemeral_private_key,
            shared_secret: bytes32_from_hex(&data.shared_secret)?,
            created_at: data.created_at,
            max_uses: data.max_uses,
            used_by,
        })
    }

    /// Invitee side of the handshake. Returns the new session, which can
    /// send immediately, and the response envelope that must be published.
    pub fn accept(&self, identity: &dyn IdentityCipher) -> Result<(Session, Event)> {
        if identity.public_key() == self.inviter {
            return Err(Error::Invite("Cannot accept your own invite".to_string()));
        }

        let session_keys = Keys::generate();
        let payload = serde_json::to_string(&ResponsePayload {
            session_key: session_keys.public_key().to_hex(),
        })?;
        let dh_encrypted = identity.nip44_encrypt(&payload, &self.inviter)?;

        let conversation_key = nip44::v2::ConversationKey::new(self.shared_secret);
        let wrapped = nip44::v2::encrypt_to_bytes(&conversation_key, dh_encrypted.as_bytes())?;
        let inner = InnerResponse {
            pubkey: identity.public_key().to_hex(),
            content: base64::engine::general_purpose::STANDARD.encode(wrapped),
            created_at: now_seconds(),
        };

        let envelope_keys = Keys::generate();
        let envelope_content = nip44::encrypt(
            envelope_keys.secret_key(),
            &self.inviter_ephemeral_public_key,
            serde_json::to_string(&inner)?,
            Version::V2,
        )?;
        let created_at = now_seconds().saturating_sub(rand::random::<u64>() % RESPONSE_TIMESTAMP_JITTER);

        let envelope = EventBuilder::new(Kind::from(INVITE_RESPONSE_KIND), envelope_content)
            .tag(tag("p", self.inviter_ephemeral_public_key.to_hex())?)
            .custom_created_at(Timestamp::from(created_at))
            .build(envelope_keys.public_key())
            .sign_with_keys(&envelope_keys)
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;

        let session = Session::init(
            self.inviter_ephemeral_public_key,
            session_keys.secret_key().to_secret_bytes(),
            true,
            self.shared_secret,
            envelope.id.to_hex(),
        )?;

        Ok((session, envelope))
    }

    /// Filter matching responses to this invite.
    pub fn response_filter(&self) -> Filter {
        Filter::new()
            .kind(Kind::from(INVITE_RESPONSE_KIND))
            .pubkeys(vec![self.inviter_ephemeral_public_key])
    }

    /// Subscribes to responses. Returns the subscription id.
    pub fn listen(&self, pubsub: &dyn NostrPubSub) -> Result<String> {
        pubsub.subscribe(self.response_filter())
    }

    /// Inviter side of the handshake. `Ok(None)` means the event is not a
    /// response to this invite.
    pub fn process_response(
        &mut self,
        event: &Event,
        identity: &dyn IdentityCipher,
    ) -> Result<Option<InviteResponse>> {
        if event.kind.as_u16() != INVITE_RESPONSE_KIND {
            return Ok(None);
        }
        let addressed_to = find_tag_value(&event.tags, "p");
        if addressed_to.as_deref() != Some(self.inviter_ephemeral_public_key.to_hex().as_str()) {
            return Ok(None);
        }

        let ephemeral_secret = self
            .inviter_ephemeral_private_key
            .ok_or_else(|| Error::Invite("Ephemeral key not available".to_string()))?;
        let ephemeral_sk = SecretKey::from_slice(&ephemeral_secret)?;

        let inner_json = nip44::decrypt(&ephemeral_sk, &event.pubkey, &event.content)?;
        let inner: InnerResponse = serde_json::from_str(&inner_json)?;
        let invitee_identity = pubkey_from_hex(&inner.pubkey)?;

        let conversation_key = nip44::v2::ConversationKey::new(self.shared_secret);
        let wrapped = base64::engine::general_purpose::STANDARD
            .decode(&inner.content)
            .map_err(|e| Error::Decryption(e.to_string()))?;
        let dh_encrypted = String::from_utf8(nip44::v2::decrypt_to_bytes(&conversation_key, &wrapped)?)
            .map_err(|e| Error::Decryption(e.to_string()))?;
        let payload = decrypt_checked(identity, &dh_encrypted, &invitee_identity)?;

        // Older clients send the bare session key instead of a JSON payload.
        let session_key_hex = match serde_json::from_str::<ResponsePayload>(&payload) {
            Ok(p) => p.session_key,
            Err(_) => payload,
        };
        let invitee_session_key = pubkey_from_hex(&session_key_hex)?;

        if !self.used_by.contains(&invitee_identity) {
            if let Some(max_uses) = self.max_uses {
                if self.used_by.len() >= max_uses {
                    return Err(Error::InviteExhausted);
                }
            }
            self.used_by.push(invitee_identity);
        }

        let session = Session::init(
            invitee_session_key,
            ephemeral_secret,
            false,
            self.shared_secret,
            event.id.to_hex(),
        )?;

        Ok(Some(InviteResponse {
            session,
            invitee_identity,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalKey;

    #[test]
    fn url_roundtrip_keeps_public_parts_only() {
        let alice = LocalKey::generate();
        let invite = Invite::create_new(alice.public_key(), "Public Invite");

        let url = invite.get_url("https://iris.to/").unwrap();
        assert!(url.starts_with("https://iris.to/#"));

        let parsed = Invite::from_url(&url).unwrap();
        assert_eq!(parsed.inviter, invite.inviter);
        assert_eq!(
            parsed.inviter_ephemeral_public_key,
            invite.inviter_ephemeral_public_key
        );
        assert_eq!(parsed.shared_secret, invite.shared_secret);
        assert_eq!(parsed.label, "Public Invite");
        assert!(!parsed.is_ours());
    }

    #[test]
    fn from_url_accepts_legacy_field_name() {
        let alice = LocalKey::generate();
        let invite = Invite::create_new(alice.public_key(), "");
        let json = serde_json::json!({
            "inviter": invite.inviter.to_hex(),
            "inviterEphemeralPublicKey": invite.inviter_ephemeral_public_key.to_hex(),
            "sharedSecret": hex::encode(invite.shared_secret),
        });
        let url = format!("https://iris.to/#{}", urlencoding::encode(&json.to_string()));
        let parsed = Invite::from_url(&url).unwrap();
        assert_eq!(
            parsed.inviter_ephemeral_public_key,
            invite.inviter_ephemeral_public_key
        );
    }

    #[test]
    fn from_url_rejects_garbage() {
        assert!(Invite::from_url("https://iris.to/").is_err());
        assert!(Invite::from_url("https://iris.to/#%7Bnope").is_err());
    }

    #[test]
    fn serialize_keeps_private_key() {
        let alice = LocalKey::generate();
        let invite = Invite::create_new(alice.public_key(), "Private Invite")
            .with_id("private")
            .with_max_uses(3);
        let restored = Invite::deserialize(&invite.serialize().unwrap()).unwrap();
        assert_eq!(restored.id, "private");
        assert_eq!(restored.label, "Private Invite");
        assert_eq!(
            restored.inviter_ephemeral_private_key,
            invite.inviter_ephemeral_private_key
        );
        assert_eq!(restored.max_uses, Some(3));
    }

    #[test]
    fn invite_event_roundtrip() {
        let alice = LocalKey::generate();
        let invite = Invite::create_new(alice.public_key(), "Public Invite").with_id("public");
        let signed = alice.sign(invite.get_event().unwrap()).unwrap();
        let parsed = Invite::from_event(&signed).unwrap();
        assert_eq!(parsed.id, "public");
        assert_eq!(parsed.inviter, alice.public_key());
        assert_eq!(parsed.shared_secret, invite.shared_secret);
    }

    #[test]
    fn cannot_accept_own_invite() {
        let alice = LocalKey::generate();
        let invite = Invite::create_new(alice.public_key(), "");
        assert!(invite.accept(&alice).is_err());
    }

    #[test]
    fn max_uses_is_enforced_per_identity() {
        let alice = LocalKey::generate();
        let mut invite = Invite::create_new(alice.public_key(), "").with_max_uses(1);
        let public = Invite::from_url(&invite.get_url("https://iris.to/").unwrap()).unwrap();

        let bob = LocalKey::generate();
        let (_, bob_envelope) = public.accept(&bob).unwrap();
        assert!(invite.process_response(&bob_envelope, &alice).unwrap().is_some());
        let (_, bob_again) = public.accept(&bob).unwrap();
        assert!(invite.process_response(&bob_again, &alice).unwrap().is_some());

        let carol = LocalKey::generate();
        let (_, carol_envelope) = public.accept(&carol).unwrap();
        assert!(matches!(
            invite.process_response(&carol_envelope, &alice),
            Err(Error::InviteExhausted)
        ));
    }

    #[test]
    fn response_for_other_invite_is_ignored() {
        let alice = LocalKey::generate();
        let mut first = Invite::create_new(alice.public_key(), "");
        let second = Invite::create_new(alice.public_key(), "");
        let bob = LocalKey::generate();
        let (_, envelope) = second.accept(&bob).unwrap();
        assert!(first.process_response(&envelope, &alice).unwrap().is_none());
    }
}
