//! Access to the user's identity key.
//!
//! The handshake needs NIP-44 encryption between identity keys and the
//! published invite needs a signature. Either the key lives in process
//! ([`LocalKey`]) or an external signer performs the operations on our
//! behalf, in which case the secret never reaches this crate.

use crate::{Error, Result};
use nostr::nips::nip44::{self, Version};
use nostr::{Event, Keys, PublicKey, SecretKey, UnsignedEvent};
use std::sync::Arc;

pub trait IdentityCipher: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn nip44_encrypt(&self, plaintext: &str, peer: &PublicKey) -> Result<String>;

    fn nip44_decrypt(&self, ciphertext: &str, peer: &PublicKey) -> Result<String>;

    fn sign(&self, event: UnsignedEvent) -> Result<Event>;
}

pub type SharedIdentity = Arc<dyn IdentityCipher>;

#[derive(Clone)]
pub struct LocalKey {
    keys: Keys,
}

impl LocalKey {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        Ok(Self::new(Keys::new(SecretKey::from_slice(secret)?)))
    }

    pub fn generate() -> Self {
        Self::new(Keys::generate())
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}

impl IdentityCipher for LocalKey {
    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    fn nip44_encrypt(&self, plaintext: &str, peer: &PublicKey) -> Result<String> {
        Ok(nip44::encrypt(
            self.keys.secret_key(),
            peer,
            plaintext,
            Version::V2,
        )?)
    }

    fn nip44_decrypt(&self, ciphertext: &str, peer: &PublicKey) -> Result<String> {
        Ok(nip44::decrypt(self.keys.secret_key(), peer, ciphertext)?)
    }

    fn sign(&self, event: UnsignedEvent) -> Result<Event> {
        event
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Signer(e.to_string()))
    }
}

/// Runs a decryption through an external signer and rejects empty results,
/// which some signers return instead of an error.
pub fn decrypt_checked(
    identity: &dyn IdentityCipher,
    ciphertext: &str,
    peer: &PublicKey,
) -> Result<String> {
    let plaintext = identity.nip44_decrypt(ciphertext, peer)?;
    if plaintext.is_empty() {
        return Err(Error::Signer("Signer returned an empty plaintext".to_string()));
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_key_roundtrips_between_two_identities() {
        let alice = LocalKey::generate();
        let bob = LocalKey::generate();

        let ciphertext = alice.nip44_encrypt("hi bob", &bob.public_key()).unwrap();
        let plaintext = decrypt_checked(&bob, &ciphertext, &alice.public_key()).unwrap();
        assert_eq!(plaintext, "hi bob");
    }

    #[test]
    fn local_key_signs_with_identity() {
        let alice = LocalKey::generate();
        let unsigned = nostr::EventBuilder::new(nostr::Kind::from(1u16), "x")
            .build(alice.public_key());
        let signed = alice.sign(unsigned).unwrap();
        assert_eq!(signed.pubkey, alice.public_key());
        assert!(signed.verify().is_ok());
    }
}
