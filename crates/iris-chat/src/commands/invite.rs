use anyhow::{Context, Result};
use iris_chat_core::{IdentityCipher, Invite};
use nostr::Event;
use serde::Serialize;
use std::path::Path;

use crate::commands::App;
use crate::config::Config;
use crate::output::Output;

#[derive(Debug, Serialize)]
pub struct InviteInfo {
    pub id: String,
    pub label: String,
    pub url: String,
    pub created_at: u64,
    pub used_by: Vec<String>,
}

fn info(app: &App, invite: &Invite) -> Result<InviteInfo> {
    Ok(InviteInfo {
        id: invite.id.clone(),
        label: invite.label.clone(),
        url: app.manager.invite_url(invite)?,
        created_at: invite.created_at,
        used_by: invite.used_by.iter().map(|pk| pk.to_hex()).collect(),
    })
}

fn find(app: &App, id: &str) -> Result<Invite> {
    app.manager
        .invites()
        .get(id)?
        .with_context(|| format!("Invite not found: {}", id))
}

pub fn create(label: Option<String>, data_dir: &Path, config: &Config, output: &Output) -> Result<InviteInfo> {
    let app = App::open(data_dir, config)?;
    let invite = app.manager.create_invite(label.as_deref().unwrap_or(""))?;
    let result = info(&app, &invite)?;
    output.success("invite.create", &result);
    Ok(result)
}

pub fn list(data_dir: &Path, config: &Config, output: &Output) -> Result<Vec<InviteInfo>> {
    let app = App::open(data_dir, config)?;
    let result = app
        .manager
        .invites()
        .list()?
        .iter()
        .map(|invite| info(&app, invite))
        .collect::<Result<Vec<_>>>()?;
    output.success("invite.list", &result);
    Ok(result)
}

pub fn url(id: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<String> {
    let app = App::open(data_dir, config)?;
    let url = app.manager.invite_url(&find(&app, id)?)?;
    output.success("invite.url", serde_json::json!({ "url": url }));
    Ok(url)
}

/// Signs the invite event so it can be published to relays.
pub fn publish(id: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<Event> {
    let app = App::open(data_dir, config)?;
    let invite = find(&app, id)?;
    let identity = config.identity()?;
    let event = identity.sign(invite.get_event()?)?;
    output.success("invite.publish", &event);
    Ok(event)
}

pub fn delete(id: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let app = App::open(data_dir, config)?;
    if !app.manager.invites().delete_invite(id)? {
        anyhow::bail!("Invite not found: {}", id);
    }
    output.success_message("invite.delete", &format!("Deleted invite {}", id));
    Ok(())
}
