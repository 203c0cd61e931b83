use anyhow::{Context, Result};
use iris_chat_core::{config::DEFAULT_INVITE_URL_ROOT, ChatConfig, LocalKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// User's private key (hex encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Prefix for invite links
    #[serde(default = "default_invite_url_root")]
    pub invite_url_root: String,

    /// Publish the public invite every time the chat state is opened
    #[serde(default)]
    pub publish_public_invite: bool,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_invite_url_root() -> String {
    DEFAULT_INVITE_URL_ROOT.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: None,
            invite_url_root: default_invite_url_root(),
            publish_public_invite: false,
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_private_key(&mut self, key: &str) -> Result<()> {
        self.private_key = Some(key.to_string());
        self.save()
    }

    pub fn clear_private_key(&mut self) -> Result<()> {
        self.private_key = None;
        self.save()
    }

    pub fn is_logged_in(&self) -> bool {
        self.private_key.is_some()
    }

    /// Generates and saves a key when none is configured. Returns whether a
    /// new key was generated.
    pub fn ensure_identity(&mut self) -> Result<bool> {
        if self.is_logged_in() {
            return Ok(false);
        }
        let keys = nostr::Keys::generate();
        self.set_private_key(&hex::encode(keys.secret_key().to_secret_bytes()))?;
        Ok(true)
    }

    pub fn private_key_bytes(&self) -> Result<[u8; 32]> {
        let key = self.private_key.as_ref().context("Not logged in")?;
        let bytes = hex::decode(key).context("Invalid private key format")?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Private key must be 32 bytes"))
    }

    pub fn identity(&self) -> Result<LocalKey> {
        LocalKey::from_secret_bytes(&self.private_key_bytes()?).context("Invalid private key")
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            invite_url_root: self.invite_url_root.clone(),
            publish_public_invite: self.publish_public_invite,
            ..ChatConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_chat_core::IdentityCipher;
    use tempfile::TempDir;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.private_key.is_none());
        assert_eq!(config.invite_url_root, DEFAULT_INVITE_URL_ROOT);
        assert!(!config.publish_public_invite);
        assert!(!config.is_logged_in());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.invite_url_root = "https://chat.example/".to_string();
        config.set_private_key(TEST_KEY).unwrap();

        let loaded = Config::load(temp.path()).unwrap();
        assert_eq!(loaded.private_key, Some(TEST_KEY.to_string()));
        assert_eq!(loaded.invite_url_root, "https://chat.example/");
        assert_eq!(loaded.chat_config().invite_url_root, "https://chat.example/");
    }

    #[test]
    fn test_ensure_identity_generates_once() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        assert!(config.ensure_identity().unwrap());
        let key = config.private_key.clone();
        assert!(!config.ensure_identity().unwrap());
        assert_eq!(config.private_key, key);
        assert_eq!(Config::load(temp.path()).unwrap().private_key, key);
    }

    #[test]
    fn test_identity_from_key() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        assert!(config.identity().is_err());
        config.set_private_key(TEST_KEY).unwrap();
        assert_eq!(config.identity().unwrap().public_key().to_hex().len(), 64);
    }
}
