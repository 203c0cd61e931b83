use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid header")]
    InvalidHeader,

    #[error("Too many skipped messages")]
    TooManySkippedMessages,

    #[error("Session cannot send yet, waiting for the first message from the peer")]
    NotInitiator,

    #[error("Session not ready")]
    SessionNotReady,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Invite error: {0}")]
    Invite(String),

    #[error("Invite has reached its maximum number of uses")]
    InviteExhausted,

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Pubsub error: {0}")]
    PubSub(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    Nostr(#[from] nostr::event::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
