//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding relay documents.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The document is not well-formed XML or does not match the schema.
    #[error("malformed {document} document: {message}")]
    Malformed {
        document: &'static str,
        message: String,
    },

    /// Serializing a document failed.
    #[error("failed to encode {document} document: {message}")]
    Encode {
        document: &'static str,
        message: String,
    },

    /// The raw bytes are not valid in the expected text encoding.
    #[error("document is not valid {encoding} text")]
    Encoding { encoding: &'static str },

    /// The envelope carries a message type this protocol does not define.
    #[error("unknown message type '{0}'")]
    UnknownMessageKind(String),

    /// Reading or writing an envelope file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(document: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            document,
            message: err.to_string(),
        }
    }

    pub(crate) fn encode(document: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Encode {
            document,
            message: err.to_string(),
        }
    }

    /// Whether this error came from the decode path (as opposed to I/O or encoding).
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. } | Self::Encoding { .. } | Self::UnknownMessageKind(_)
        )
    }
}
