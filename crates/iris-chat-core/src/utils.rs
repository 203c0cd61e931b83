use crate::{Error, Result, Rumor};
use hkdf::Hkdf;
use nostr::{JsonUtil, PublicKey, Tag, UnsignedEvent};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

/// HKDF-SHA256 with `input2` as salt, expanding one 32-byte output per
/// single-byte info counter starting at 1.
pub fn kdf(input1: &[u8], input2: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(input2), input1);
    (1..=num_outputs)
        .map(|i| {
            let mut okm = [0u8; 32];
            // 32 bytes is always a valid HKDF-SHA256 output length
            let _ = hk.expand(&[i as u8], &mut okm);
            okm
        })
        .collect()
}

pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidEvent("Invalid pubkey length".to_string()));
    }
    PublicKey::from_slice(&bytes).map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub fn bytes32_from_hex(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidEvent("Expected 32 bytes".to_string()))
}

pub fn tag(name: &str, value: impl Into<String>) -> Result<Tag> {
    Tag::parse(&[name.to_string(), value.into()]).map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub fn find_tag_value(tags: &nostr::Tags, name: &str) -> Option<String> {
    tags.iter()
        .find(|t| t.as_slice().first().map(|s| s.as_str()) == Some(name))
        .and_then(|t| t.as_slice().get(1).cloned())
}

pub fn rumor_from_unsigned(rumor: &UnsignedEvent) -> Result<Rumor> {
    Ok(serde_json::from_value(serde_json::to_value(rumor)?)?)
}

/// Parses decrypted rumor JSON. A carried id must hash to the rumor's
/// content; a missing one is computed.
pub fn verified_rumor(plaintext: &str) -> Result<Rumor> {
    let mut rumor = UnsignedEvent::from_json(plaintext)
        .map_err(|e| Error::InvalidEvent(format!("Invalid rumor: {}", e)))?;
    rumor
        .verify_id()
        .map_err(|_| Error::InvalidEvent("Rumor id does not match its content".to_string()))?;
    rumor.ensure_id();
    rumor_from_unsigned(&rumor)
}
