/// Error types, one enum per concern.
use std::path::PathBuf;

use crate::irc::connection::DisconnectReason;
use crate::irc::reply::ErrorReply;
use crate::util::queue::QueueError;

/// Why a connection attempt (or a whole `create` loop) gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("connection closed before registration ({0})")]
    Disconnected(DisconnectReason),
    #[error("scheduler: {0}")]
    Queue(#[from] QueueError),
}

impl ConnectError {
    /// The disconnect reason behind a failed attempt, if there was one.
    pub fn reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::Disconnected(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("cannot join {channel}: {reply}")]
    Rejected { channel: String, reply: ErrorReply },
    #[error("failed to join {channel} after {attempts} attempts")]
    AttemptsExhausted { channel: String, attempts: u32 },
    #[error("connection lost while joining {channel}")]
    ConnectionLost { channel: String },
    #[error("client is not connected")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NickError {
    #[error("nick '{0}' contains illegal characters")]
    IllegalCharacters(String),
    #[error("nick '{0}' must start with a letter or special character")]
    BadFirstCharacter(String),
    #[error("nick '{nick}' is too long (max {max})")]
    TooLong { nick: String, max: usize },
    #[error("your nick is already '{0}'")]
    Unchanged(String),
    #[error("nick '{0}' is not valid")]
    NotCanonical(String),
    #[error("the nickname {nick} is taken on {domain}, please pick a different nick")]
    Taken { nick: String, domain: String },
    #[error("failed to change nick: {0}")]
    Rejected(ErrorReply),
    #[error("timed out waiting for a response to change nick")]
    Timeout,
    #[error("client is not connected")]
    NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is dead")]
    Dead,
    #[error("client was killed")]
    Killed,
    #[error("client is disabled")]
    Disabled,
    #[error("client is not connecting or connected")]
    NotConnecting,
    #[error("no network configured for '{0}'")]
    UnknownNetwork(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Nick(#[from] NickError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
}
