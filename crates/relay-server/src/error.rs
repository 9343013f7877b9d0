//! Server error taxonomy.

use relay_protocol::{MessageKind, ProtocolError};
use relay_transport::TransportError;
use thiserror::Error;

/// Coarse classification used as the `category` field when a worker logs
/// the error that ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Contract violations by the caller (start twice, stop while stopped).
    Usage,
    /// Socket failures and unreachable peers. Recoverable.
    Connectivity,
    /// Fatal to the session or connection it happened on.
    Protocol,
    /// Undecodable document. The message is dropped.
    Decode,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Connectivity => "connectivity",
            Self::Protocol => "protocol",
            Self::Decode => "decode",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} isn't running")]
    NotRunning(&'static str),

    #[error("client session has already been started")]
    AlreadyStarted,

    #[error("client session has already been destroyed")]
    AlreadyDestroyed,

    #[error("client session hasn't been started yet")]
    NotStarted,

    #[error("the WAS reconnect process is currently running")]
    ReconnectInProgress,

    #[error("WAS at {host} can't be pinged")]
    WasUnreachable { host: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no response-message after {retries} retries")]
    NoClientResponse { retries: u32 },

    #[error("message type '{0}' isn't defined")]
    UnknownMessageKind(MessageKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("upload failed: {0}")]
    Upload(#[from] reqwest::Error),
}

impl ServerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyRunning(_)
            | Self::NotRunning(_)
            | Self::AlreadyStarted
            | Self::AlreadyDestroyed
            | Self::NotStarted
            | Self::ReconnectInProgress
            | Self::Config(_) => ErrorCategory::Usage,
            Self::WasUnreachable { .. } | Self::Transport(_) | Self::Upload(_) => {
                ErrorCategory::Connectivity
            }
            Self::NoClientResponse { .. } | Self::UnknownMessageKind(_) => ErrorCategory::Protocol,
            Self::Protocol(ProtocolError::UnknownMessageKind(_)) => ErrorCategory::Protocol,
            Self::Protocol(ProtocolError::Io(_)) => ErrorCategory::Connectivity,
            Self::Protocol(_) => ErrorCategory::Decode,
        }
    }
}
