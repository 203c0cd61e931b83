use serde::{Deserialize, Serialize};

pub const DEFAULT_INVITE_URL_ROOT: &str = "https://iris.to/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    /// Prefix for invite links, e.g. `https://iris.to/`.
    pub invite_url_root: String,
    /// Publish the `public` invite event on init.
    pub publish_public_invite: bool,
    /// Create the `public` and `private` invites on init.
    pub default_invites: bool,
    /// How many decrypted outer event ids to remember for dedupe.
    pub max_seen_events: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            invite_url_root: DEFAULT_INVITE_URL_ROOT.to_string(),
            publish_public_invite: true,
            default_invites: true,
            max_seen_events: 10_000,
        }
    }
}
