//! Transport error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream or the connection was closed locally.
    #[error("connection closed")]
    Disconnected,

    #[error("invalid address '{0}'")]
    Address(String),

    #[error("connecting to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// The peer sent more than the frame limit without a delimiter.
    #[error("frame exceeds {limit} bytes without a delimiter")]
    FrameTooLarge { limit: usize },
}

impl TransportError {
    /// Whether the error means the connection is gone (as opposed to a
    /// local usage problem such as a bad address).
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected | Self::ConnectTimeout { .. } | Self::FrameTooLarge { .. } => true,
            Self::Io(_) => true,
            Self::Address(_) => false,
        }
    }
}
