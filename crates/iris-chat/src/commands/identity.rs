use anyhow::{Context, Result};
use nostr::ToBech32;
use serde::Serialize;
use std::path::Path;

use crate::commands::state_dir;
use crate::config::Config;
use crate::output::Output;

#[derive(Debug, Serialize)]
pub struct IdentityResult {
    pub pubkey: String,
    pub npub: String,
    pub logged_in: bool,
}

fn identity_result(pubkey: &nostr::PublicKey) -> IdentityResult {
    IdentityResult {
        pubkey: pubkey.to_hex(),
        npub: pubkey.to_bech32().unwrap_or_default(),
        logged_in: true,
    }
}

/// Login with a private key (nsec or hex)
pub fn login(key: &str, config: &mut Config, output: &Output) -> Result<IdentityResult> {
    let secret = if key.starts_with("nsec1") {
        use nostr::nips::nip19::FromBech32;
        nostr::SecretKey::from_bech32(key).context("Invalid nsec key")?
    } else {
        if key.len() != 64 {
            anyhow::bail!("Invalid key length. Expected 64 hex characters or nsec.");
        }
        nostr::SecretKey::from_slice(&hex::decode(key).context("Invalid hex key")?)
            .context("Invalid secret key")?
    };
    let keys = nostr::Keys::new(secret);
    config.set_private_key(&hex::encode(keys.secret_key().to_secret_bytes()))?;

    let result = identity_result(&keys.public_key());
    output.success("login", &result);
    Ok(result)
}

/// Clear the key and all chat state
pub fn logout(data_dir: &Path, config: &mut Config, output: &Output) -> Result<()> {
    config.clear_private_key()?;
    let state = state_dir(data_dir);
    if state.exists() {
        std::fs::remove_dir_all(&state).context("Failed to remove chat state")?;
    }
    output.success_message("logout", "Logged out and cleared all data");
    Ok(())
}

pub fn whoami(config: &Config, output: &Output) -> Result<IdentityResult> {
    let result = if config.is_logged_in() {
        let keys = nostr::Keys::new(nostr::SecretKey::from_slice(&config.private_key_bytes()?)?);
        identity_result(&keys.public_key())
    } else {
        IdentityResult {
            pubkey: String::new(),
            npub: String::new(),
            logged_in: false,
        }
    };
    output.success("whoami", &result);
    Ok(result)
}
