//! Double ratchet state transitions over NIP-44.
//!
//! Every ratchet key is a Nostr key pair. Chain keys advance through
//! [`kdf`]; the DH step uses the NIP-44 v2 conversation key between our
//! next key and their next key. Message bodies are NIP-44 v2 payloads
//! under the per-message key, headers are NIP-44 between the two current
//! ratchet keys so only the recipient can tell which chain a message is on.

use crate::{
    utils::{kdf, pubkey_from_hex},
    Bytes32, Error, Header, KeyPair, Result, SessionState, SkippedKeys, MAX_SKIP,
};
use base64::Engine;
use nostr::nips::nip44::{self, Version};
use nostr::{PublicKey, SecretKey};
use std::collections::BTreeMap;

/// Result of opening an encrypted header.
enum HeaderSource {
    Current,
    Next,
    Skipped,
}

pub struct Decrypted {
    pub plaintext: String,
    pub ratcheted: bool,
}

impl SessionState {
    /// State of the side that accepts an invite and speaks first.
    pub fn new_initiator(
        their_ephemeral: PublicKey,
        our_ephemeral_secret: [u8; 32],
        shared_secret: [u8; 32],
    ) -> Result<Self> {
        let our_current = keypair_from_secret(our_ephemeral_secret)?;
        let our_next = KeyPair::generate();
        let conversation_key =
            nip44::v2::ConversationKey::derive(&our_next.secret_key()?, &their_ephemeral)?;
        let outputs = kdf(&shared_secret, conversation_key.as_bytes(), 2);

        Ok(Self {
            root_key: Bytes32(outputs[0]),
            their_current_nostr_public_key: None,
            their_next_nostr_public_key: Some(their_ephemeral),
            our_current_nostr_key: Some(our_current),
            our_next_nostr_key: our_next,
            receiving_chain_key: None,
            sending_chain_key: Some(Bytes32(outputs[1])),
            sending_chain_message_number: 0,
            receiving_chain_message_number: 0,
            previous_sending_chain_message_count: 0,
            skipped_keys: BTreeMap::new(),
        })
    }

    /// State of the inviter. It can only send after the first message
    /// from the initiator has arrived.
    pub fn new_responder(
        their_ephemeral: PublicKey,
        our_ephemeral_secret: [u8; 32],
        shared_secret: [u8; 32],
    ) -> Result<Self> {
        Ok(Self {
            root_key: Bytes32(shared_secret),
            their_current_nostr_public_key: None,
            their_next_nostr_public_key: Some(their_ephemeral),
            our_current_nostr_key: None,
            our_next_nostr_key: keypair_from_secret(our_ephemeral_secret)?,
            receiving_chain_key: None,
            sending_chain_key: None,
            sending_chain_message_number: 0,
            receiving_chain_message_number: 0,
            previous_sending_chain_message_count: 0,
            skipped_keys: BTreeMap::new(),
        })
    }

    pub fn can_send(&self) -> bool {
        self.their_next_nostr_public_key.is_some()
            && self.our_current_nostr_key.is_some()
            && self.sending_chain_key.is_some()
    }

    /// Whether `pubkey` is one of the peer's ratchet keys we accept
    /// messages from.
    pub fn is_their_key(&self, pubkey: &PublicKey) -> bool {
        self.their_current_nostr_public_key.as_ref() == Some(pubkey)
            || self.their_next_nostr_public_key.as_ref() == Some(pubkey)
            || self.skipped_keys.contains_key(&pubkey.to_hex())
    }

    /// Advances the sending chain. Returns the encrypted header, the
    /// ciphertext and the key pair that must author the outer event.
    pub fn encrypt(&mut self, plaintext: &str) -> Result<(String, String, KeyPair)> {
        let chain_key = self.sending_chain_key.ok_or(Error::SessionNotReady)?;
        let our_current = self
            .our_current_nostr_key
            .clone()
            .ok_or(Error::NotInitiator)?;
        let their_next = self
            .their_next_nostr_public_key
            .ok_or(Error::SessionNotReady)?;

        let outputs = kdf(chain_key.as_bytes(), &[1u8], 2);
        self.sending_chain_key = Some(Bytes32(outputs[0]));

        let header = Header {
            number: self.sending_chain_message_number,
            previous_chain_length: self.previous_sending_chain_message_count,
            next_public_key: self.our_next_nostr_key.public_key.to_hex(),
        };
        self.sending_chain_message_number += 1;

        let ciphertext = encrypt_with_message_key(outputs[1], plaintext)?;
        let encrypted_header = nip44::encrypt(
            &our_current.secret_key()?,
            &their_next,
            serde_json::to_string(&header)?,
            Version::V2,
        )
        .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok((encrypted_header, ciphertext, our_current))
    }

    /// Opens one message. On error the state may be partially advanced, so
    /// callers work on a copy and keep it only on success.
    pub fn decrypt(
        &mut self,
        encrypted_header: &str,
        sender: &PublicKey,
        ciphertext: &str,
    ) -> Result<Decrypted> {
        let (header, source) = self.open_header(encrypted_header, sender)?;
        let sender_hex = sender.to_hex();

        if let Some(plaintext) = self.try_skipped_message_key(&sender_hex, header.number, ciphertext)? {
            return Ok(Decrypted {
                plaintext,
                ratcheted: false,
            });
        }

        let ratcheted = match source {
            HeaderSource::Skipped => {
                return Err(Error::Decryption(
                    "Message key for old chain already used".to_string(),
                ))
            }
            HeaderSource::Current => false,
            HeaderSource::Next => true,
        };

        if self.their_current_nostr_public_key.as_ref() != Some(sender)
            && self.their_next_nostr_public_key.as_ref() != Some(sender)
        {
            return Err(Error::InvalidEvent("Unexpected sender".to_string()));
        }

        if ratcheted {
            let old_chain_sender = self.their_current_nostr_public_key;
            if let (Some(old_sender), Some(_)) = (old_chain_sender, self.receiving_chain_key) {
                let header_key = self.our_current_nostr_key.as_ref().map(|k| k.private_key);
                self.skip_message_keys(
                    header.previous_chain_length,
                    &old_sender.to_hex(),
                    header_key,
                )?;
            }
        }

        let their_next_hex = self
            .their_next_nostr_public_key
            .map(|pk| pk.to_hex())
            .unwrap_or_default();
        if header.next_public_key != their_next_hex {
            self.their_current_nostr_public_key = self.their_next_nostr_public_key;
            self.their_next_nostr_public_key = Some(pubkey_from_hex(&header.next_public_key)?);
        }

        if ratcheted {
            self.ratchet_step()?;
        }

        let header_key = self.our_current_nostr_key.as_ref().map(|k| k.private_key);
        self.skip_message_keys(header.number, &sender_hex, header_key)?;

        let chain_key = self.receiving_chain_key.ok_or(Error::SessionNotReady)?;
        let outputs = kdf(chain_key.as_bytes(), &[1u8], 2);
        self.receiving_chain_key = Some(Bytes32(outputs[0]));
        self.receiving_chain_message_number += 1;

        let plaintext = decrypt_with_message_key(outputs[1], ciphertext)?;
        Ok(Decrypted {
            plaintext,
            ratcheted,
        })
    }

    fn open_header(&self, encrypted_header: &str, sender: &PublicKey) -> Result<(Header, HeaderSource)> {
        if let Some(current) = &self.our_current_nostr_key {
            if let Ok(json) = nip44::decrypt(&current.secret_key()?, sender, encrypted_header) {
                return Ok((parse_header(&json)?, HeaderSource::Current));
            }
        }

        if let Ok(json) = nip44::decrypt(
            &self.our_next_nostr_key.secret_key()?,
            sender,
            encrypted_header,
        ) {
            return Ok((parse_header(&json)?, HeaderSource::Next));
        }

        if let Some(header_key) = self
            .skipped_keys
            .get(&sender.to_hex())
            .and_then(|entry| entry.header_key)
        {
            let sk = SecretKey::from_slice(header_key.as_bytes())?;
            if let Ok(json) = nip44::decrypt(&sk, sender, encrypted_header) {
                return Ok((parse_header(&json)?, HeaderSource::Skipped));
            }
        }

        Err(Error::InvalidHeader)
    }

    fn ratchet_step(&mut self) -> Result<()> {
        self.previous_sending_chain_message_count = self.sending_chain_message_number;
        self.sending_chain_message_number = 0;
        self.receiving_chain_message_number = 0;

        let their_next = self
            .their_next_nostr_public_key
            .ok_or(Error::SessionNotReady)?;

        let receive_dh =
            nip44::v2::ConversationKey::derive(&self.our_next_nostr_key.secret_key()?, &their_next)?;
        let receive_outputs = kdf(self.root_key.as_bytes(), receive_dh.as_bytes(), 2);
        self.receiving_chain_key = Some(Bytes32(receive_outputs[1]));

        let our_new_next = KeyPair::generate();
        self.our_current_nostr_key = Some(std::mem::replace(
            &mut self.our_next_nostr_key,
            our_new_next,
        ));

        let send_dh =
            nip44::v2::ConversationKey::derive(&self.our_next_nostr_key.secret_key()?, &their_next)?;
        let send_outputs = kdf(&receive_outputs[0], send_dh.as_bytes(), 2);
        self.root_key = Bytes32(send_outputs[0]);
        self.sending_chain_key = Some(Bytes32(send_outputs[1]));

        Ok(())
    }

    fn skip_message_keys(
        &mut self,
        until: u32,
        sender_hex: &str,
        header_key: Option<Bytes32>,
    ) -> Result<()> {
        if until <= self.receiving_chain_message_number {
            return Ok(());
        }
        if until - self.receiving_chain_message_number > MAX_SKIP {
            return Err(Error::TooManySkippedMessages);
        }

        let mut chain_key = self.receiving_chain_key.ok_or(Error::SessionNotReady)?;
        let entry = self
            .skipped_keys
            .entry(sender_hex.to_string())
            .or_insert_with(SkippedKeys::default);
        if header_key.is_some() {
            entry.header_key = header_key;
        }

        while self.receiving_chain_message_number < until {
            let outputs = kdf(chain_key.as_bytes(), &[1u8], 2);
            chain_key = Bytes32(outputs[0]);
            entry
                .message_keys
                .insert(self.receiving_chain_message_number, Bytes32(outputs[1]));
            self.receiving_chain_message_number += 1;
        }
        self.receiving_chain_key = Some(chain_key);

        Ok(())
    }

    fn try_skipped_message_key(
        &mut self,
        sender_hex: &str,
        number: u32,
        ciphertext: &str,
    ) -> Result<Option<String>> {
        let Some(entry) = self.skipped_keys.get_mut(sender_hex) else {
            return Ok(None);
        };
        let Some(message_key) = entry.message_keys.remove(&number) else {
            return Ok(None);
        };
        if entry.message_keys.is_empty() {
            self.skipped_keys.remove(sender_hex);
        }
        decrypt_with_message_key(message_key.0, ciphertext).map(Some)
    }
}

fn keypair_from_secret(secret: [u8; 32]) -> Result<KeyPair> {
    let keys = nostr::Keys::new(SecretKey::from_slice(&secret)?);
    Ok(KeyPair {
        public_key: keys.public_key(),
        private_key: Bytes32(secret),
    })
}

fn parse_header(json: &str) -> Result<Header> {
    serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
}

fn encrypt_with_message_key(message_key: [u8; 32], plaintext: &str) -> Result<String> {
    let conversation_key = nip44::v2::ConversationKey::new(message_key);
    let bytes = nip44::v2::encrypt_to_bytes(&conversation_key, plaintext.as_bytes())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn decrypt_with_message_key(message_key: [u8; 32], ciphertext: &str) -> Result<String> {
    let conversation_key = nip44::v2::ConversationKey::new(message_key);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(ciphertext)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    let plaintext = nip44::v2::decrypt_to_bytes(&conversation_key, &bytes)?;
    String::from_utf8(plaintext).map_err(|e| Error::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    fn pair() -> (SessionState, SessionState) {
        let initiator_keys = Keys::generate();
        let responder_keys = Keys::generate();
        let shared_secret = [7u8; 32];
        let initiator = SessionState::new_initiator(
            responder_keys.public_key(),
            initiator_keys.secret_key().to_secret_bytes(),
            shared_secret,
        )
        .unwrap();
        let responder = SessionState::new_responder(
            initiator_keys.public_key(),
            responder_keys.secret_key().to_secret_bytes(),
            shared_secret,
        )
        .unwrap();
        (initiator, responder)
    }

    fn deliver(to: &mut SessionState, packet: &(String, String, KeyPair)) -> Decrypted {
        to.decrypt(&packet.0, &packet.2.public_key, &packet.1).unwrap()
    }

    #[test]
    fn responder_cannot_send_first() {
        let (initiator, responder) = pair();
        assert!(initiator.can_send());
        assert!(!responder.can_send());
    }

    #[test]
    fn ping_pong_ratchets_both_ways() {
        let (mut alice, mut bob) = pair();

        let m1 = alice.encrypt("one").unwrap();
        let d1 = deliver(&mut bob, &m1);
        assert_eq!(d1.plaintext, "one");
        assert!(d1.ratcheted);
        assert!(bob.can_send());

        let m2 = bob.encrypt("two").unwrap();
        assert_eq!(deliver(&mut alice, &m2).plaintext, "two");

        let m3 = alice.encrypt("three").unwrap();
        let d3 = deliver(&mut bob, &m3);
        assert_eq!(d3.plaintext, "three");
        assert!(d3.ratcheted);
    }

    #[test]
    fn late_message_from_previous_chain_still_opens() {
        let (mut alice, mut bob) = pair();

        let first = alice.encrypt("first").unwrap();
        let late = alice.encrypt("late").unwrap();
        deliver(&mut bob, &first);

        let reply = bob.encrypt("reply").unwrap();
        deliver(&mut alice, &reply);

        let next_chain = alice.encrypt("new chain").unwrap();
        assert_eq!(deliver(&mut bob, &next_chain).plaintext, "new chain");
        assert_eq!(deliver(&mut bob, &late).plaintext, "late");
    }

    #[test]
    fn replay_is_rejected() {
        let (mut alice, mut bob) = pair();
        let m = alice.encrypt("once").unwrap();
        deliver(&mut bob, &m);
        assert!(bob.decrypt(&m.0, &m.2.public_key, &m.1).is_err());
    }

    #[test]
    fn too_many_skipped_messages() {
        let (mut alice, mut bob) = pair();
        let first = alice.encrypt("0").unwrap();
        deliver(&mut bob, &first);
        let mut last = None;
        for i in 0..=(MAX_SKIP + 1) {
            last = Some(alice.encrypt(&i.to_string()).unwrap());
        }
        let last = last.unwrap();
        assert!(matches!(
            bob.decrypt(&last.0, &last.2.public_key, &last.1),
            Err(Error::TooManySkippedMessages)
        ));
    }
}
