//! Alarm relay core.
//!
//! The [`ListeningManager`] owns one [`WasListener`] (upstream) and one
//! [`ClientListener`] (downstream). Changed WAS payloads become the new
//! incident list, which every [`ClientSession`] pushes to its display
//! client until the client acknowledges it.

pub mod client_listener;
pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod state;
pub mod upload;
pub mod was_listener;

pub use client_listener::ClientListener;
pub use config::{ClientConfig, ProbeKind, RelayConfig, UploadConfig, WasConfig};
pub use error::{ErrorCategory, ServerError};
pub use manager::{ListeningManager, ManagerEvent, ManagerStatus};
pub use session::{ClientSession, SessionPhase};
pub use state::{AlarmState, StateAccessors};
pub use upload::{HttpUploader, Uploader, check_upload_url};
pub use was_listener::{ConnectionChange, WasEvent, WasListener};
