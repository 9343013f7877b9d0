//! Coordinator over the upstream listener and the client listener.
//!
//! The manager turns WAS events into incident-list updates and client
//! pushes, and owns the reconnect loop that is the only path back from an
//! unexpected upstream disconnect. Every flag transition happens under one
//! lock, so start/stop calls and event-driven transitions never interleave.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use relay_protocol::{AicMessage, Alarm, MessageKind, WasObject};
use relay_transport::Probe;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client_listener::ClientListener;
use crate::config::RelayConfig;
use crate::error::ServerError;
use crate::state::{AlarmState, StateAccessors};
use crate::upload::{HttpUploader, Uploader};
use crate::was_listener::{ConnectionChange, WasEvent, WasListener};

const EVENT_CAPACITY: usize = 256;

/// What the manager publishes to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A synthesized envelope carrying the current incidents and upstream
    /// connectivity.
    MessageReceived(AicMessage),
    AlarmsChanged(Vec<Alarm>),
    WasConnectionChanged(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStatus {
    pub was_running: bool,
    pub was_connected: bool,
    pub client_running: bool,
    pub reconnecting: bool,
    pub sessions: usize,
}

struct Reconnect {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Flags {
    was_running: bool,
    client_running: bool,
    reconnect: Option<Reconnect>,
}

pub struct ListeningManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: RelayConfig,
    state: Arc<AlarmState>,
    was: Arc<WasListener>,
    clients: ClientListener,
    probe: Arc<dyn Probe>,
    uploader: Option<Arc<dyn Uploader>>,
    flags: tokio::sync::Mutex<Flags>,
    events: broadcast::Sender<ManagerEvent>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reconnect_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl ListeningManager {
    /// Build the manager with the probe and uploader the configuration
    /// asks for.
    pub fn new(config: RelayConfig) -> Self {
        let probe = config.was.build_probe();
        let uploader = config
            .upload
            .enabled
            .then(|| Arc::new(HttpUploader::new(config.upload.url.clone())) as Arc<dyn Uploader>);
        Self::with_parts(config, probe, uploader)
    }

    pub fn with_parts(
        config: RelayConfig,
        probe: Arc<dyn Probe>,
        uploader: Option<Arc<dyn Uploader>>,
    ) -> Self {
        let state = Arc::new(AlarmState::new());
        let was = Arc::new(WasListener::new(config.was.clone()));

        let accessors = {
            let state = state.clone();
            let was = was.clone();
            StateAccessors::new(move || state.alarms(), move || was.is_connected())
        };
        let clients = ClientListener::new(config.clients.clone(), accessors);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                state,
                was,
                clients,
                probe,
                uploader,
                flags: tokio::sync::Mutex::new(Flags::default()),
                events,
                pump: parking_lot::Mutex::new(None),
                reconnect_generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.inner.state.alarms()
    }

    pub fn client_listener(&self) -> &ClientListener {
        &self.inner.clients
    }

    pub async fn status(&self) -> ManagerStatus {
        let flags = self.inner.flags.lock().await;
        ManagerStatus {
            was_running: flags.was_running,
            was_connected: self.inner.was.is_connected(),
            client_running: flags.client_running,
            reconnecting: flags.reconnect.is_some(),
            sessions: self.inner.clients.session_count(),
        }
    }

    /// Probe the WAS and start listening to it.
    pub async fn start_was_listening(&self) -> Result<(), ServerError> {
        let mut flags = self.inner.flags.lock().await;
        if flags.was_running || self.inner.was.is_running() {
            error!("The WAS listener is already running");
            return Err(ServerError::AlreadyRunning("WAS listener"));
        }
        if flags.reconnect.is_some() {
            error!("The WAS reconnect process is currently running");
            return Err(ServerError::ReconnectInProgress);
        }

        let host = &self.inner.config.was.host;
        if !self.inner.probe.probe().await {
            error!(%host, category = "connectivity", "WAS can't be pinged");
            return Err(ServerError::WasUnreachable { host: host.clone() });
        }

        self.inner.ensure_pump();
        self.inner.was.start()?;
        flags.was_running = true;
        info!(%host, "WAS listening started");
        Ok(())
    }

    /// Stop the WAS listener, cancelling a reconnect loop if one is active.
    pub async fn stop_was_listening(&self) -> Result<(), ServerError> {
        let mut flags = self.inner.flags.lock().await;
        let reconnect = flags.reconnect.take();
        let running = self.inner.was.is_running();
        if !running && reconnect.is_none() {
            error!("The WAS listener isn't running");
            return Err(ServerError::NotRunning("WAS listener"));
        }

        flags.was_running = false;
        if let Some(reconnect) = reconnect {
            reconnect.cancel.cancel();
            info!("WAS reconnect process canceled");
        }
        if running {
            match self.inner.was.stop().await {
                Ok(()) | Err(ServerError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("WAS listening stopped");
        Ok(())
    }

    /// Start accepting display clients. Returns the bound address.
    pub async fn start_client_listening(&self) -> Result<SocketAddr, ServerError> {
        let mut flags = self.inner.flags.lock().await;
        if flags.client_running {
            error!("The client listener is already running");
            return Err(ServerError::AlreadyRunning("client listener"));
        }
        let addr = self.inner.clients.start().await?;
        flags.client_running = true;
        Ok(addr)
    }

    pub async fn stop_client_listening(&self) -> Result<(), ServerError> {
        let mut flags = self.inner.flags.lock().await;
        if !flags.client_running {
            error!("The client listener isn't running");
            return Err(ServerError::NotRunning("client listener"));
        }
        self.inner.clients.stop().await?;
        flags.client_running = false;
        Ok(())
    }

    /// Stop whatever is running. Errors are logged, not returned.
    pub async fn shutdown(&self) {
        let (was_active, client_running) = {
            let flags = self.inner.flags.lock().await;
            (
                flags.was_running || flags.reconnect.is_some() || self.inner.was.is_running(),
                flags.client_running,
            )
        };
        if was_active {
            if let Err(e) = self.stop_was_listening().await {
                warn!("Stopping the WAS listener failed: {e}");
            }
        }
        if client_running {
            if let Err(e) = self.stop_client_listening().await {
                warn!("Stopping the client listener failed: {e}");
            }
        }
        info!("Listening manager shut down");
    }
}

impl Drop for ListeningManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Subscribe to the WAS listener once. The subscription is taken before
    /// the listener starts so no event is missed.
    fn ensure_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let events = self.was.subscribe();
        *pump = Some(tokio::spawn(Self::pump(
            Arc::downgrade(self),
            events,
            self.shutdown.clone(),
        )));
    }

    async fn pump(inner: Weak<Self>, mut events: broadcast::Receiver<WasEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Manager fell behind the WAS listener events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = inner.upgrade() else { break };
            match event {
                WasEvent::ConnectionChanged(change) => inner.on_connection_changed(change).await,
                WasEvent::PayloadChanged(payload) => inner.on_payload_changed(&payload),
            }
        }
        debug!("Manager event pump finished");
    }

    async fn on_connection_changed(self: &Arc<Self>, change: ConnectionChange) {
        let connected = change.is_connected();
        {
            let mut flags = self.flags.lock().await;
            let was_active = flags.was_running;
            flags.was_running = connected;
            if change == ConnectionChange::Lost && was_active {
                self.begin_reconnect(&mut flags);
            }
        }
        info!(connected, ?change, "WAS connection changed");

        self.publish(ManagerEvent::WasConnectionChanged(connected));
        self.publish(ManagerEvent::MessageReceived(AicMessage::new(
            MessageKind::Undefined,
            connected,
            self.state.alarms(),
        )));
        self.clients.push_new_state();
    }

    fn on_payload_changed(&self, payload: &WasObject) {
        let alarms = self.state.update(payload);
        info!(count = alarms.len(), "Alarms changed");

        self.publish(ManagerEvent::AlarmsChanged(alarms.to_vec()));
        self.publish(ManagerEvent::MessageReceived(AicMessage::new(
            MessageKind::Undefined,
            true,
            alarms.to_vec(),
        )));
        if let Some(uploader) = &self.uploader {
            for alarm in alarms.iter() {
                uploader.upload(alarm.clone());
            }
        }
        self.clients.push_new_state();
    }

    fn publish(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn begin_reconnect(self: &Arc<Self>, flags: &mut Flags) {
        if flags.reconnect.is_some() {
            info!("The WAS reconnect process is already running");
            return;
        }
        let generation = self.reconnect_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.shutdown.child_token();
        flags.reconnect = Some(Reconnect {
            generation,
            cancel: cancel.clone(),
        });
        tokio::spawn(self.clone().reconnect(generation, cancel));
    }

    async fn reconnect(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let interval = self.config.was.reconnect_interval;
        info!(?interval, "WAS reconnect process started");

        let reachable = loop {
            if cancel.is_cancelled() {
                break false;
            }
            tokio::select! {
                _ = cancel.cancelled() => break false,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.probe.probe().await {
                break true;
            }
            debug!(host = %self.config.was.host, "WAS still unreachable");
        };

        let mut flags = self.flags.lock().await;
        if flags.reconnect.as_ref().is_some_and(|r| r.generation == generation) {
            flags.reconnect = None;
        }
        if !reachable || cancel.is_cancelled() {
            info!("WAS reconnect process ended without reconnecting");
            return;
        }

        info!(host = %self.config.was.host, "WAS reachable again");
        match self.was.start() {
            Ok(()) => flags.was_running = true,
            Err(e) => error!(category = %e.category(), "Restarting the WAS listener failed: {e}"),
        }
    }
}
