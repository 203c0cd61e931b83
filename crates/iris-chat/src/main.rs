use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod output;

use output::Output;

#[derive(Parser)]
#[command(name = "iris-chat")]
#[command(version)]
#[command(about = "Encrypted Nostr chat invites, sessions and push decryption")]
#[command(long_about = "Manages invite links, double ratchet chat sessions and stored messages.\n\nRelay I/O is left to the caller: events that need publishing are printed in the `outgoing` field, and events from relays are fed back with `receive`.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/iris-chat)
    #[arg(long, global = true, env = "IRIS_CHAT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Login with a private key
    Login {
        /// Private key (nsec or hex)
        key: String,
    },

    /// Logout and clear all data
    Logout,

    /// Show current identity
    Whoami,

    /// Invite management
    #[command(subcommand)]
    Invite(InviteCommands),

    /// Chat management
    #[command(subcommand)]
    Chat(ChatCommands),

    /// Send a message
    Send {
        /// Chat ID
        chat_id: String,
        /// Message content
        message: String,
    },

    /// React to a message
    React {
        /// Chat ID
        chat_id: String,
        /// Message ID to react to
        message_id: String,
        /// Emoji reaction
        emoji: String,
    },

    /// Read messages from a chat
    Read {
        /// Chat ID
        chat_id: String,
        /// Maximum number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Receive a nostr event (invite response or chat message)
    Receive {
        /// The nostr event JSON
        event: String,
    },

    /// Remove messages whose disappearing timer has run out
    Purge,

    /// Push notification helpers
    #[command(subcommand)]
    Push(PushCommands),
}

#[derive(Subcommand)]
enum InviteCommands {
    /// Create a new invite
    Create {
        /// Label for the invite
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List all invites
    List,

    /// Show the link for an invite
    Url {
        /// Invite ID
        id: String,
    },

    /// Sign an invite event for publishing
    Publish {
        /// Invite ID
        id: String,
    },

    /// Delete an invite
    Delete {
        /// Invite ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// List all chats
    List,

    /// Join a chat via invite URL
    Accept {
        /// Invite URL
        url: String,
    },

    /// Set or clear the disappearing-message timer
    Expiry {
        /// Chat ID
        id: String,
        /// Seconds until messages disappear (omit or 0 to disable)
        seconds: Option<u64>,
    },

    /// Delete a chat
    Delete {
        /// Chat ID
        id: String,
    },
}

#[derive(Subcommand)]
enum PushCommands {
    /// Build the notification for a push payload
    Decrypt {
        /// Push payload JSON: {"event": {...}, "title"?, "body"?, "icon"?, "url"?}
        payload: String,
        /// Session snapshot file to decrypt with instead of the data directory
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Resolve where a clicked notification should navigate
    Click {
        /// Origin of the app, e.g. https://iris.to
        origin: String,
        /// Notification data JSON
        data: String,
    },

    /// Print a session snapshot for push decryption
    Snapshot,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output::new(cli.json);

    if let Err(e) = run(cli, &output) {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?
            .join("iris-chat"),
    };
    std::fs::create_dir_all(&data_dir)?;

    let mut config = config::Config::load(&data_dir)?;

    let needs_identity = !matches!(
        &cli.command,
        Commands::Login { .. } | Commands::Logout | Commands::Whoami | Commands::Push(_)
    );
    if needs_identity && config.ensure_identity()? {
        let keys = nostr::Keys::new(nostr::SecretKey::from_slice(&config.private_key_bytes()?)?);
        let npub = nostr::ToBech32::to_bech32(&keys.public_key())?;
        eprintln!("Generated new identity: {}", npub);
    }

    let dir = data_dir.as_path();
    match cli.command {
        Commands::Login { key } => commands::identity::login(&key, &mut config, output).map(drop),
        Commands::Logout => commands::identity::logout(dir, &mut config, output),
        Commands::Whoami => commands::identity::whoami(&config, output).map(drop),
        Commands::Invite(cmd) => match cmd {
            InviteCommands::Create { label } => {
                commands::invite::create(label, dir, &config, output).map(drop)
            }
            InviteCommands::List => commands::invite::list(dir, &config, output).map(drop),
            InviteCommands::Url { id } => commands::invite::url(&id, dir, &config, output).map(drop),
            InviteCommands::Publish { id } => {
                commands::invite::publish(&id, dir, &config, output).map(drop)
            }
            InviteCommands::Delete { id } => commands::invite::delete(&id, dir, &config, output),
        },
        Commands::Chat(cmd) => match cmd {
            ChatCommands::List => commands::chat::list(dir, &config, output).map(drop),
            ChatCommands::Accept { url } => commands::chat::accept(&url, dir, &config, output).map(drop),
            ChatCommands::Expiry { id, seconds } => {
                commands::chat::expiry(&id, seconds, dir, &config, output)
            }
            ChatCommands::Delete { id } => commands::chat::delete(&id, dir, &config, output),
        },
        Commands::Send { chat_id, message } => {
            commands::message::send(&chat_id, &message, dir, &config, output).map(drop)
        }
        Commands::React {
            chat_id,
            message_id,
            emoji,
        } => commands::message::react(&chat_id, &message_id, &emoji, dir, &config, output).map(drop),
        Commands::Read { chat_id, limit } => {
            commands::chat::read(&chat_id, limit, dir, &config, output).map(drop)
        }
        Commands::Receive { event } => {
            commands::message::receive(&event, dir, &config, output).map(drop)
        }
        Commands::Purge => commands::message::purge(dir, &config, output).map(drop),
        Commands::Push(cmd) => match cmd {
            PushCommands::Decrypt { payload, snapshot } => {
                commands::push::decrypt(&payload, snapshot.as_deref(), dir, output).map(drop)
            }
            PushCommands::Click { origin, data } => {
                commands::push::click(&origin, &data, output).map(drop)
            }
            PushCommands::Snapshot => commands::push::snapshot(dir, output).map(drop),
        },
    }
}
