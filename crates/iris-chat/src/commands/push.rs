use anyhow::{Context, Result};
use iris_chat_core::{
    click_target, FileStorageAdapter, NoopPubSub, Notification, PushDecryptor, PushPayload,
    SessionRegistry,
};
use std::path::Path;
use std::sync::Arc;

use crate::commands::state_dir;
use crate::output::Output;

/// Builds the notification for a push payload without touching the live
/// session state. Sessions come from `snapshot` when given, otherwise from
/// the data directory.
pub fn decrypt(payload_json: &str, snapshot: Option<&Path>, data_dir: &Path, output: &Output) -> Result<Notification> {
    let payload: PushPayload = serde_json::from_str(payload_json).context("Invalid push payload")?;

    let decryptor = match snapshot {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
            PushDecryptor::from_snapshot_json(&json)?
        }
        None => PushDecryptor::from_storage(&FileStorageAdapter::new(state_dir(data_dir))?)?,
    };
    tracing::debug!(sessions = decryptor.len(), "push decryptor ready");

    let notification = decryptor.notification_for(&payload);
    output.success("push.decrypt", &notification);
    Ok(notification)
}

/// Session states as `{"sessions": [[id, state], ...]}`, the format
/// `decrypt --snapshot` reads.
pub fn snapshot(data_dir: &Path, output: &Output) -> Result<serde_json::Value> {
    let registry = SessionRegistry::new(
        Arc::new(NoopPubSub),
        Arc::new(FileStorageAdapter::new(state_dir(data_dir))?),
        1,
    );
    registry.load()?;
    let snapshot: serde_json::Value = serde_json::from_str(&registry.snapshot_json()?)?;
    output.success("push.snapshot", &snapshot);
    Ok(snapshot)
}

pub fn click(origin: &str, data_json: &str, output: &Output) -> Result<String> {
    let data: serde_json::Value = serde_json::from_str(data_json).context("Invalid notification data")?;
    let target = click_target(origin, &data).context("Notification data has no url")?;
    output.success("push.click", serde_json::json!({ "url": target }));
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{chat, invite, message, test_support::setup};

    #[test]
    fn test_decrypt_from_state_and_snapshot() {
        let (alice_dir, alice) = setup();
        let (bob_dir, bob) = setup();
        let output = Output::new(true);

        let url = invite::url("private", alice_dir.path(), &alice, &output).unwrap();
        let accepted = chat::accept(&url, bob_dir.path(), &bob, &output).unwrap();
        message::receive(
            &serde_json::to_string(&accepted.outgoing[0]).unwrap(),
            alice_dir.path(),
            &alice,
            &output,
        )
        .unwrap();

        let sent = message::send(&accepted.chat_id.to_string(), "push me", bob_dir.path(), &bob, &output).unwrap();
        let payload = serde_json::json!({ "event": sent.outgoing[0] }).to_string();

        let from_state = decrypt(&payload, None, alice_dir.path(), &output).unwrap();
        assert!(from_state.title.ends_with(": push me"));

        let snapshot_path = alice_dir.path().join("snapshot.json");
        let exported = snapshot(alice_dir.path(), &output).unwrap();
        assert_eq!(exported["sessions"].as_array().unwrap().len(), 1);
        std::fs::write(&snapshot_path, exported.to_string()).unwrap();
        let from_snapshot = decrypt(&payload, Some(&snapshot_path), alice_dir.path(), &output).unwrap();
        assert_eq!(from_snapshot, from_state);
    }

    #[test]
    fn test_click_target() {
        let output = Output::new(true);
        let url = click("https://iris.to", r#"{"url":"/chats/x"}"#, &output).unwrap();
        assert_eq!(url, "https://iris.to/chats/x");
        assert!(click("https://iris.to", "{}", &output).is_err());
    }
}
