//! Per-client push/acknowledge state machine.
//!
//! A session pushes the current state as a `Request` and expects a
//! `Response`. Until it arrives the push counts as pending: the worker
//! repeats the `Request` every network timeout and gives up after the
//! configured number of retries. A second `push_new_state` waits until the
//! pending push is acknowledged or the session dies, so a client never has
//! two uncoordinated requests in flight.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_protocol::wire::aic_delimiter;
use relay_protocol::{AicMessage, MessageKind, ProtocolError};
use relay_transport::{Connection, FrameReader, FrameWriter, TransportError};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::ServerError;
use crate::state::StateAccessors;

/// Lifecycle of a session. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NotStarted,
    Running,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState {
    Idle,
    AwaitingAck,
    Destroyed,
}

/// What the worker learned from one inbound envelope. A `Response` restarts
/// the retry budget at once, before any queued push can claim the ack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatched {
    Handled,
    Acknowledged,
}

/// Invoked once, with the session id, when a session destroys itself.
pub type DestroyedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle to one client session. Clones share the session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    peer: SocketAddr,
    config: ClientConfig,
    accessors: StateAccessors,
    writer: FrameWriter,
    reader: Mutex<Option<FrameReader>>,
    phase: Mutex<SessionPhase>,
    ack: watch::Sender<AckState>,
    push_gate: tokio::sync::Mutex<()>,
    push_queued: AtomicBool,
    cancel: CancellationToken,
    on_destroyed: Mutex<Option<DestroyedCallback>>,
}

impl ClientSession {
    pub fn new(connection: Connection, accessors: StateAccessors, config: ClientConfig) -> Self {
        let peer = connection.peer_addr();
        let (reader, writer) = connection.into_split();
        let (ack, _) = watch::channel(AckState::Idle);
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                peer,
                config,
                accessors,
                writer,
                reader: Mutex::new(Some(reader)),
                phase: Mutex::new(SessionPhase::NotStarted),
                ack,
                push_gate: tokio::sync::Mutex::new(()),
                push_queued: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                on_destroyed: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == SessionPhase::Destroyed
    }

    /// Whether a pushed `Request` is still waiting for its `Response`.
    pub fn is_awaiting_ack(&self) -> bool {
        *self.inner.ack.borrow() == AckState::AwaitingAck
    }

    /// Register the destruction callback. Replaces any earlier one.
    pub fn on_destroyed(&self, callback: DestroyedCallback) {
        *self.inner.on_destroyed.lock() = Some(callback);
    }

    /// Launch the worker, which immediately pushes the current state.
    pub fn start_session(&self) -> Result<(), ServerError> {
        let reader = {
            let mut phase = self.inner.phase.lock();
            match *phase {
                SessionPhase::Destroyed => {
                    error!(peer = %self.inner.peer, "StartSession called after the session got destroyed");
                    return Err(ServerError::AlreadyDestroyed);
                }
                SessionPhase::Running => {
                    error!(peer = %self.inner.peer, "Client session has already been started");
                    return Err(ServerError::AlreadyStarted);
                }
                SessionPhase::NotStarted => {}
            }
            let reader = self.inner.reader.lock().take().ok_or(ServerError::AlreadyStarted)?;
            *phase = SessionPhase::Running;
            reader
        };

        tokio::spawn(self.inner.clone().run(reader));
        info!(peer = %self.inner.peer, session = %self.inner.id, "Started session with client");
        Ok(())
    }

    /// Close the connection and mark the session destroyed. With
    /// `raise_event` the destruction callback fires.
    pub async fn destroy_session(&self, raise_event: bool) -> Result<(), ServerError> {
        self.inner.destroy(raise_event, true).await
    }

    /// Push the current state as a `Request`, first waiting for any pending
    /// push to be acknowledged.
    pub async fn push_new_state(&self) -> Result<(), ServerError> {
        self.inner.push_new_state(None).await
    }

    /// Claim the session's single queued-push slot. Returns `None` while an
    /// earlier queued push still waits for its turn; that push reads the
    /// state when it is sent, so it already carries the latest change.
    pub fn queue_push(&self) -> Option<impl Future<Output = Result<(), ServerError>> + Send + 'static> {
        if self.inner.push_queued.swap(true, Ordering::AcqRel) {
            return None;
        }
        let claim = QueuedPush(self.inner.clone());
        Some(async move {
            let inner = claim.0.clone();
            inner.push_new_state(Some(claim)).await
        })
    }

    /// Whether a queued push is still waiting to be sent.
    pub fn has_queued_push(&self) -> bool {
        self.inner.push_queued.load(Ordering::Acquire)
    }

    /// Resolves once the session is destroyed.
    pub async fn wait_destroyed(&self) {
        let mut rx = self.inner.ack.subscribe();
        let _ = rx.wait_for(|state| *state == AckState::Destroyed).await;
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Releases the queued-push slot once the push leaves the queue.
struct QueuedPush(Arc<Inner>);

impl Drop for QueuedPush {
    fn drop(&mut self) {
        self.0.push_queued.store(false, Ordering::Release);
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut reader: FrameReader) {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            outcome = self.serve(&mut reader) => outcome,
        };

        match outcome {
            Ok(()) => {
                info!(peer = %self.peer, "Thread handling connection with client canceled");
            }
            Err(ServerError::Transport(TransportError::Disconnected)) => {
                info!(peer = %self.peer, "Stopped listening to client");
            }
            Err(e) => {
                error!(peer = %self.peer, category = %e.category(), "Client session failed: {e}");
            }
        }

        match self.destroy(true, false).await {
            Ok(()) | Err(ServerError::AlreadyDestroyed) => {}
            Err(e) => warn!(peer = %self.peer, "Session cleanup failed: {e}"),
        }
    }

    async fn serve(&self, reader: &mut FrameReader) -> Result<(), ServerError> {
        self.push_new_state(None).await?;

        let interval = self.config.keep_alive_interval;
        let mut keep_alive = tokio::time::interval_at(Instant::now() + interval, interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cycle = self.config.cycle_interval;
        let mut elapsed = Duration::ZERO;
        let mut retries = 0u32;

        loop {
            tokio::select! {
                _ = keep_alive.tick() => self.send_keep_alive().await,
                frame = reader.poll_frame(aic_delimiter(), cycle) => match frame? {
                    Some(bytes) => {
                        if self.dispatch(&bytes).await? == Dispatched::Acknowledged {
                            elapsed = Duration::ZERO;
                            retries = 0;
                        }
                    }
                    None => {
                        if !self.writer.is_connected() {
                            return Err(TransportError::Disconnected.into());
                        }
                        if *self.ack.borrow() != AckState::AwaitingAck {
                            elapsed = Duration::ZERO;
                            retries = 0;
                            continue;
                        }

                        elapsed += cycle;
                        if elapsed < self.config.network_timeout {
                            continue;
                        }

                        self.push(MessageKind::Request).await;
                        elapsed = Duration::ZERO;
                        retries += 1;
                        warn!(
                            peer = %self.peer,
                            "No response from client yet. Retry {retries} from {}",
                            self.config.max_push_retries
                        );
                        if retries >= self.config.max_push_retries {
                            return Err(ServerError::NoClientResponse { retries });
                        }
                    }
                },
            }
        }
    }

    async fn dispatch(&self, bytes: &[u8]) -> Result<Dispatched, ServerError> {
        let message = match AicMessage::decode(bytes) {
            Ok(message) => message,
            Err(e @ ProtocolError::UnknownMessageKind(_)) => return Err(e.into()),
            Err(e) => {
                warn!(peer = %self.peer, category = "decode", "Dropping undecodable envelope: {e}");
                return Ok(Dispatched::Handled);
            }
        };

        match message.kind {
            MessageKind::Request => {
                info!(peer = %self.peer, "Request from client");
                self.push(MessageKind::Response).await;
            }
            MessageKind::Response => {
                info!(peer = %self.peer, "Response from client");
                self.ack.send_if_modified(|state| {
                    if *state == AckState::AwaitingAck {
                        *state = AckState::Idle;
                        true
                    } else {
                        false
                    }
                });
                return Ok(Dispatched::Acknowledged);
            }
            MessageKind::KeepAlive => {
                info!(peer = %self.peer, "Keep-alive from client");
            }
            MessageKind::Undefined => {
                return Err(ServerError::UnknownMessageKind(message.kind));
            }
        }
        Ok(Dispatched::Handled)
    }

    async fn push_new_state(&self, queued: Option<QueuedPush>) -> Result<(), ServerError> {
        let _gate = self.push_gate.lock().await;

        let mut rx = self.ack.subscribe();
        let state = rx
            .wait_for(|state| *state != AckState::AwaitingAck)
            .await
            .map(|state| *state)
            .unwrap_or(AckState::Destroyed);
        if state == AckState::Destroyed {
            return Err(ServerError::AlreadyDestroyed);
        }

        // Mark pending before writing so a fast Response can't be lost.
        let marked = self.ack.send_if_modified(|state| {
            if *state == AckState::Idle {
                *state = AckState::AwaitingAck;
                true
            } else {
                false
            }
        });
        if !marked {
            return Err(ServerError::AlreadyDestroyed);
        }
        drop(queued);

        self.push(MessageKind::Request).await;
        Ok(())
    }

    /// Send the current state as `kind`. A vanished client is only logged;
    /// the worker notices the dead connection on its next cycle.
    async fn push(&self, kind: MessageKind) {
        if !self.writer.is_connected() {
            warn!(peer = %self.peer, "Can't push message because the client has already gone");
            return;
        }

        let message = self.accessors.envelope(kind);
        match message.encode() {
            Ok(bytes) => match self.writer.write_all(&bytes).await {
                Ok(()) => {
                    info!(peer = %self.peer, alarms = message.alarms.len(), "New {kind}-push to client performed");
                }
                Err(e) => warn!(peer = %self.peer, "Push to client failed: {e}"),
            },
            Err(e) => error!(peer = %self.peer, "Failed to encode {kind} envelope: {e}"),
        }
    }

    async fn send_keep_alive(&self) {
        match AicMessage::keep_alive().encode() {
            Ok(bytes) => match self.writer.write_all(&bytes).await {
                Ok(()) => debug!(peer = %self.peer, "Sent keep-alive to client"),
                Err(e) => warn!(peer = %self.peer, "Keep-alive to client failed: {e}"),
            },
            Err(e) => error!("Failed to encode keep-alive envelope: {e}"),
        }
    }

    async fn destroy(&self, raise_event: bool, cancel_worker: bool) -> Result<(), ServerError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                SessionPhase::Destroyed => {
                    debug!(peer = %self.peer, "DestroySession called on a destroyed session");
                    return Err(ServerError::AlreadyDestroyed);
                }
                SessionPhase::NotStarted => {
                    error!(peer = %self.peer, "Client session hasn't been started yet");
                    return Err(ServerError::NotStarted);
                }
                SessionPhase::Running => *phase = SessionPhase::Destroyed,
            }
        }

        self.writer.close().await;
        self.ack.send_replace(AckState::Destroyed);
        info!(peer = %self.peer, session = %self.id, "Closed TCP connection with client");

        if raise_event {
            let callback = self.on_destroyed.lock().clone();
            if let Some(callback) = callback {
                callback(&self.id);
                debug!(peer = %self.peer, "Session destroyed event raised");
            }
        }
        if cancel_worker {
            self.cancel.cancel();
        }
        Ok(())
    }
}
