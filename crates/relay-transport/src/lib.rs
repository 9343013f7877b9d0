//! Alarm relay transport layer
//!
//! Plain TCP plumbing shared by the upstream client and the downstream
//! server:
//! - `Connection`: connect, read-until-delimiter, write, liveness, close
//! - `Acceptor`: bind and accept inbound connections
//! - `Probe`: reachability checks (ICMP echo or TCP connect)
//!
//! Neither protocol carries a length prefix; a frame ends where the root
//! end-tag pattern of the document matches, so the reader is handed the
//! delimiter regex for the protocol it speaks.

pub mod connection;
pub mod error;
pub mod listener;
pub mod probe;

pub use connection::{Connection, FrameReader, FrameWriter};
pub use error::TransportError;
pub use listener::Acceptor;
pub use probe::{IcmpProbe, Probe, TcpProbe};
