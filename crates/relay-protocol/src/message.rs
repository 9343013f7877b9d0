//! Client-protocol envelope (`AIC`).
//!
//! Every message between the relay and a display client is one `AIC`
//! document: a kind, the WAS connectivity flag and the incident list.

use std::path::Path;

use crate::alarm::Alarm;
use crate::codec;
use crate::error::ProtocolError;

/// Envelope kind.
///
/// `Undefined` exists on the wire (it is the zero value of the original
/// schema) but is never a valid message; receivers treat it as a protocol
/// violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    #[default]
    Undefined,
    /// Server → client push; demands an acknowledgement.
    Request,
    /// Client → server acknowledgement of a request.
    Response,
    /// Either direction; no payload semantics.
    KeepAlive,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Request => "Request",
            Self::Response => "Response",
            Self::KeepAlive => "KeepAlive",
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        match text.trim() {
            "" | "Undefined" => Ok(Self::Undefined),
            "Request" => Ok(Self::Request),
            "Response" => Ok(Self::Response),
            "KeepAlive" => Ok(Self::KeepAlive),
            other => Err(ProtocolError::UnknownMessageKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The downstream envelope. Equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AicMessage {
    pub kind: MessageKind,
    /// Whether the relay currently holds a live WAS connection.
    pub was_connected: bool,
    pub alarms: Vec<Alarm>,
}

impl AicMessage {
    pub fn new(kind: MessageKind, was_connected: bool, alarms: Vec<Alarm>) -> Self {
        Self {
            kind,
            was_connected,
            alarms,
        }
    }

    pub fn request(was_connected: bool, alarms: Vec<Alarm>) -> Self {
        Self::new(MessageKind::Request, was_connected, alarms)
    }

    pub fn response(was_connected: bool, alarms: Vec<Alarm>) -> Self {
        Self::new(MessageKind::Response, was_connected, alarms)
    }

    /// Keep-alives always carry an empty list and a positive flag.
    pub fn keep_alive() -> Self {
        Self::new(MessageKind::KeepAlive, true, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        codec::encode_aic(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        codec::decode_aic(bytes)
    }

    pub fn from_file(path: &Path) -> Result<Self, ProtocolError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    /// Like [`AicMessage::from_file`], but a missing or broken file yields `None`.
    pub fn try_from_file(path: &Path) -> Option<Self> {
        Self::from_file(path).ok()
    }

    pub fn to_file(&self, path: &Path) -> Result<(), ProtocolError> {
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }
}
