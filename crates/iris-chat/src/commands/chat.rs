use anyhow::Result;
use iris_chat_core::{Message, SessionId};
use nostr::Event;
use serde::Serialize;
use std::path::Path;

use crate::commands::{parse_chat_id, App};
use crate::config::Config;
use crate::output::Output;

#[derive(Debug, Serialize)]
pub struct ChatInfo {
    pub id: SessionId,
    pub peer: String,
    pub can_send: bool,
    pub messages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub chat_id: SessionId,
    /// Response envelope for the inviter, to be published.
    pub outgoing: Vec<Event>,
}

pub fn list(data_dir: &Path, config: &Config, output: &Output) -> Result<Vec<ChatInfo>> {
    let app = App::open(data_dir, config)?;
    let mut chats = Vec::new();
    for id in app.manager.session_ids()? {
        let messages = app.manager.messages(&id)?;
        chats.push(ChatInfo {
            peer: id.peer().to_hex(),
            can_send: app.manager.sessions().can_send(&id)?,
            messages: messages.len(),
            expiry_seconds: app.manager.events().expiry(&id)?,
            last_message: messages.last().map(|m| m.content.clone()),
            id,
        });
    }
    output.success("chat.list", &chats);
    Ok(chats)
}

/// Accepts an invite link and registers the new chat.
pub fn accept(url: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<Accepted> {
    let app = App::open(data_dir, config)?;
    let chat_id = app.manager.accept_invite_url(url)?;
    let result = Accepted {
        chat_id,
        outgoing: app.outgoing(),
    };
    output.success("chat.accept", &result);
    Ok(result)
}

pub fn read(chat_id: &str, limit: usize, data_dir: &Path, config: &Config, output: &Output) -> Result<Vec<Message>> {
    let app = App::open(data_dir, config)?;
    let id = parse_chat_id(chat_id)?;
    let messages = app.manager.messages(&id)?;
    let skip = messages.len().saturating_sub(limit);
    let result: Vec<Message> = messages.into_iter().skip(skip).collect();
    output.success("chat.read", &result);
    Ok(result)
}

/// Sets the disappearing-message timer. `None` or `0` turns it off.
pub fn expiry(chat_id: &str, seconds: Option<u64>, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let app = App::open(data_dir, config)?;
    let id = parse_chat_id(chat_id)?;
    if !app.manager.sessions().contains(&id)? {
        anyhow::bail!("Chat not found: {}", chat_id);
    }
    app.manager.set_expiry(&id, seconds)?;
    output.success(
        "chat.expiry",
        serde_json::json!({ "chat_id": id, "expiry_seconds": app.manager.events().expiry(&id)? }),
    );
    Ok(())
}

pub fn delete(chat_id: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let app = App::open(data_dir, config)?;
    let id = parse_chat_id(chat_id)?;
    if !app.manager.delete_chat(&id)? {
        anyhow::bail!("Chat not found: {}", chat_id);
    }
    output.success_message("chat.delete", &format!("Deleted chat {}", id));
    Ok(())
}
