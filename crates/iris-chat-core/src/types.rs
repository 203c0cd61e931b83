use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MESSAGE_EVENT_KIND: u16 = 1060;
pub const INVITE_EVENT_KIND: u16 = 30078;
pub const INVITE_RESPONSE_KIND: u16 = 1059;
pub const CHAT_MESSAGE_KIND: u16 = 14;
pub const REACTION_KIND: u16 = 7;
pub const MAX_SKIP: u32 = 1000;

/// NIP-40 style expiration tag carried by the inner rumor:
/// `["expiration", "<unix seconds>"]`.
pub const EXPIRATION_TAG: &str = "expiration";

/// Millisecond timestamp tag added to outgoing rumors.
pub const MS_TAG: &str = "ms";

pub const INVITE_LIST_LABEL: &str = "double-ratchet/invites";

/// 32 bytes of key material, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bytes32(#[serde(with = "hex::serde")] pub [u8; 32]);

impl Bytes32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Bytes32(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub number: u32,
    pub previous_chain_length: u32,
    pub next_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: Bytes32,
}

impl KeyPair {
    pub fn generate() -> Self {
        let keys = nostr::Keys::generate();
        Self {
            public_key: keys.public_key(),
            private_key: Bytes32(keys.secret_key().to_secret_bytes()),
        }
    }

    pub fn secret_key(&self) -> crate::Result<nostr::SecretKey> {
        Ok(nostr::SecretKey::from_slice(self.private_key.as_bytes())?)
    }
}

/// Message keys we derived ahead of time for one sender chain, together
/// with the secret that opens that chain's headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeys {
    #[serde(default)]
    pub header_key: Option<Bytes32>,
    #[serde(default)]
    pub message_keys: BTreeMap<u32, Bytes32>,
}

/// Complete ratchet state of one session. This is what gets persisted and
/// what the push path reconstructs sessions from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub root_key: Bytes32,

    #[serde(default)]
    pub their_current_nostr_public_key: Option<PublicKey>,
    #[serde(default)]
    pub their_next_nostr_public_key: Option<PublicKey>,

    #[serde(default)]
    pub our_current_nostr_key: Option<KeyPair>,
    pub our_next_nostr_key: KeyPair,

    #[serde(default)]
    pub receiving_chain_key: Option<Bytes32>,
    #[serde(default)]
    pub sending_chain_key: Option<Bytes32>,

    #[serde(default)]
    pub sending_chain_message_number: u32,
    #[serde(default)]
    pub receiving_chain_message_number: u32,
    #[serde(default)]
    pub previous_sending_chain_message_count: u32,

    /// Keyed by the hex public key of the sender chain.
    #[serde(default)]
    pub skipped_keys: BTreeMap<String, SkippedKeys>,
}

pub fn serialize_session_state(state: &SessionState) -> crate::Result<String> {
    serde_json::to_string(state).map_err(|e| crate::Error::Serialization(e.to_string()))
}

pub fn deserialize_session_state(data: &str) -> crate::Result<SessionState> {
    serde_json::from_str(data).map_err(|e| crate::Error::Serialization(e.to_string()))
}

/// Decrypted inner event of a session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl Rumor {
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn ms(&self) -> Option<u64> {
        self.tag_value(MS_TAG).and_then(|v| v.parse().ok())
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.tag_value(EXPIRATION_TAG).and_then(|v| v.parse().ok())
    }

    /// Target message id when this rumor is a reaction.
    pub fn reaction_target(&self) -> Option<&str> {
        if self.kind != REACTION_KIND {
            return None;
        }
        self.tag_value("e")
    }
}
