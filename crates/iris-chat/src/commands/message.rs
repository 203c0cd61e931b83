use anyhow::{Context, Result};
use iris_chat_core::{utils::now_seconds, ChatUpdate, Message, SessionId};
use nostr::Event;
use serde::Serialize;
use std::path::Path;

use crate::commands::{parse_chat_id, App};
use crate::config::Config;
use crate::output::Output;

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub chat_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// True when the chat cannot send yet and the message waits in the
    /// outbox until the peer writes first.
    pub queued: bool,
    pub outgoing: Vec<Event>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiveResult {
    ChatCreated {
        chat_id: SessionId,
    },
    Message {
        chat_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        outgoing: Vec<Event>,
    },
    Ignored,
}

pub fn send(chat_id: &str, text: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<SendResult> {
    let app = App::open(data_dir, config)?;
    let id = parse_chat_id(chat_id)?;
    let sent = app.manager.send_text(&id, text)?;
    let result = SendResult {
        chat_id: id,
        message: sent.message,
        queued: sent.event.is_none(),
        outgoing: app.outgoing(),
    };
    output.success("send", &result);
    Ok(result)
}

pub fn react(
    chat_id: &str,
    message_id: &str,
    emoji: &str,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<SendResult> {
    let app = App::open(data_dir, config)?;
    let id = parse_chat_id(chat_id)?;
    let sent = app.manager.send_reaction(&id, message_id, emoji)?;
    let result = SendResult {
        chat_id: id,
        message: sent.message,
        queued: sent.event.is_none(),
        outgoing: app.outgoing(),
    };
    output.success("react", &result);
    Ok(result)
}

/// Feeds one relay event (invite response or chat message) to the chat
/// state.
pub fn receive(event_json: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<ReceiveResult> {
    let event: Event = serde_json::from_str(event_json).context("Invalid event JSON")?;
    event.verify().context("Invalid event signature")?;

    let app = App::open(data_dir, config)?;
    let result = match app.manager.process_received_event(&event)? {
        ChatUpdate::SessionCreated { session_id } => ReceiveResult::ChatCreated {
            chat_id: session_id,
        },
        ChatUpdate::Message {
            session_id,
            message,
            ..
        } => ReceiveResult::Message {
            chat_id: session_id,
            message,
            outgoing: app.outgoing(),
        },
        ChatUpdate::Ignored => ReceiveResult::Ignored,
    };
    output.success("receive", &result);
    Ok(result)
}

pub fn purge(data_dir: &Path, config: &Config, output: &Output) -> Result<usize> {
    let app = App::open(data_dir, config)?;
    let removed = app.manager.purge_expired(now_seconds())?;
    output.success("purge", serde_json::json!({ "removed": removed }));
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{chat, invite, test_support::setup};

    fn to_json(event: &Event) -> String {
        serde_json::to_string(event).unwrap()
    }

    #[test]
    fn test_full_conversation_through_commands() {
        let (alice_dir, alice) = setup();
        let (bob_dir, bob) = setup();
        let output = Output::new(true);

        let url = invite::url("public", alice_dir.path(), &alice, &output).unwrap();
        let accepted = chat::accept(&url, bob_dir.path(), &bob, &output).unwrap();
        let bob_chat = accepted.chat_id.to_string();

        let ReceiveResult::ChatCreated { chat_id: alice_chat } =
            receive(&to_json(&accepted.outgoing[0]), alice_dir.path(), &alice, &output).unwrap()
        else {
            panic!("expected new chat");
        };
        let alice_chat = alice_chat.to_string();

        // Inviter cannot send before the invitee's first message.
        let early = send(&alice_chat, "queued hello", alice_dir.path(), &alice, &output).unwrap();
        assert!(early.queued);
        assert!(early.outgoing.is_empty());

        let hi = send(&bob_chat, "hi alice", bob_dir.path(), &bob, &output).unwrap();
        assert!(!hi.queued);
        let ReceiveResult::Message { message, outgoing, .. } =
            receive(&to_json(&hi.outgoing[0]), alice_dir.path(), &alice, &output).unwrap()
        else {
            panic!("expected message");
        };
        let received = message.unwrap();
        assert_eq!(received.content, "hi alice");
        assert_eq!(outgoing.len(), 1);

        let ReceiveResult::Message { message, .. } =
            receive(&to_json(&outgoing[0]), bob_dir.path(), &bob, &output).unwrap()
        else {
            panic!("expected flushed message");
        };
        assert_eq!(message.unwrap().content, "queued hello");

        let reaction = react(&alice_chat, &received.id, "❤️", alice_dir.path(), &alice, &output).unwrap();
        receive(&to_json(&reaction.outgoing[0]), bob_dir.path(), &bob, &output).unwrap();
        let bob_messages = chat::read(&bob_chat, 10, bob_dir.path(), &bob, &output).unwrap();
        let hi_on_bob = bob_messages.iter().find(|m| m.id == received.id).unwrap();
        assert_eq!(hi_on_bob.reactions.values().next().map(String::as_str), Some("❤️"));

        // Replays are ignored across runs since the ratchet moved on.
        assert!(matches!(
            receive(&to_json(&hi.outgoing[0]), alice_dir.path(), &alice, &output).unwrap(),
            ReceiveResult::Ignored
        ));
    }

    #[test]
    fn test_receive_rejects_garbage() {
        let (dir, config) = setup();
        let output = Output::new(true);
        assert!(receive("{}", dir.path(), &config, &output).is_err());
    }

    #[test]
    fn test_send_to_unknown_chat_fails() {
        let (dir, config) = setup();
        let output = Output::new(true);
        let chat_id = format!("{}:nope", nostr::Keys::generate().public_key().to_hex());
        assert!(send(&chat_id, "hi", dir.path(), &config, &output).is_err());
        assert!(send("bad", "hi", dir.path(), &config, &output).is_err());
    }
}
