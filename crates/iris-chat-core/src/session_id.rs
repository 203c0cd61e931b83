use crate::{Error, Result};
use nostr::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// `<peer identity hex>:<session name>`.
///
/// Both sides of a handshake name the session after the invite response
/// envelope, so one peer never ends up with two ids for the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    peer: PublicKey,
    name: String,
}

impl SessionId {
    pub fn new(peer: PublicKey, name: impl Into<String>) -> Self {
        Self {
            peer,
            name: name.into(),
        }
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Percent-encoded form for use as a URL path segment.
    pub fn url_encoded(&self) -> String {
        urlencoding::encode(&self.to_string()).into_owned()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer.to_hex(), self.name)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (peer, name) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidSessionId(s.to_string()))?;
        if name.is_empty() {
            return Err(Error::InvalidSessionId(s.to_string()));
        }
        let peer = crate::utils::pubkey_from_hex(peer)
            .map_err(|_| Error::InvalidSessionId(s.to_string()))?;
        Ok(Self::new(peer, name))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
