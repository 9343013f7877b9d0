//! Alarm relay: wire types
//!
//! Data model and codecs for the two XML documents the relay speaks:
//! the `pdu` payload pushed by the WAS dispatch backend and the `AIC`
//! envelope exchanged with display clients. This crate is the single
//! source of truth for message boundaries, text encodings and the
//! equality rules that gate change notifications. It performs no I/O
//! beyond the envelope file helpers.

pub mod alarm;
pub mod codec;
pub mod error;
pub mod message;
pub mod was;
pub mod wire;

pub use alarm::Alarm;
pub use error::ProtocolError;
pub use message::{AicMessage, MessageKind};
pub use was::{WasAlarm, WasObject};
pub use wire::Wire;
