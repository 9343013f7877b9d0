//! Downstream acceptor and session registry.
//!
//! Every accepted display client gets its own [`ClientSession`]. A session
//! that destroys itself removes itself from the registry through its
//! destruction callback; `stop` tears the rest down without raising it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use relay_transport::{Acceptor, Connection};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::ServerError;
use crate::session::ClientSession;
use crate::state::StateAccessors;

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ClientListener {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    accessors: StateAccessors,
    sessions: DashMap<String, ClientSession>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl ClientListener {
    pub fn new(config: ClientConfig, accessors: StateAccessors) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                accessors,
                sessions: DashMap::new(),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            error!("The client listener has already been started");
            return Err(ServerError::AlreadyRunning("client listener"));
        }

        let acceptor = Acceptor::bind(&self.inner.config.bind, self.inner.config.port).await?;
        let local_addr = acceptor.local_addr();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Inner::accept_loop(
            Arc::downgrade(&self.inner),
            acceptor,
            cancel.clone(),
        ));

        *lifecycle = Some(Running {
            cancel,
            local_addr,
            task,
        });
        self.inner.running.store(true, Ordering::Release);
        info!(%local_addr, "Started listening to clients");
        Ok(local_addr)
    }

    /// Stop accepting and destroy every session without raising their
    /// destruction events.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(running) = self.inner.lifecycle.lock().await.take() else {
            error!("The client listener isn't running");
            return Err(ServerError::NotRunning("client listener"));
        };
        self.inner.running.store(false, Ordering::Release);

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("Client accept loop ended abnormally: {e}");
        }

        let sessions: Vec<ClientSession> = self.inner.sessions.iter().map(|e| e.value().clone()).collect();
        self.inner.sessions.clear();
        for session in sessions {
            match session.destroy_session(false).await {
                Ok(()) | Err(ServerError::AlreadyDestroyed) => {}
                Err(e) => warn!(peer = %session.peer_addr(), "Failed to destroy session: {e}"),
            }
        }

        info!("Stopped listening to clients");
        Ok(())
    }

    /// Push the current state to every connected client. Each push runs on
    /// its own task so one slow client never delays the others. A client
    /// that still has a push queued is skipped.
    pub fn push_new_state(&self) {
        if !self.is_running() {
            warn!("Can't push the new state while the client listener isn't running");
            return;
        }

        for entry in self.inner.sessions.iter() {
            let session = entry.value().clone();
            let Some(push) = session.queue_push() else {
                debug!(peer = %session.peer_addr(), "Push already queued for client");
                continue;
            };
            tokio::spawn(async move {
                match push.await {
                    Ok(()) => {}
                    Err(ServerError::AlreadyDestroyed) => {
                        debug!(peer = %session.peer_addr(), "Skipped push to destroyed session");
                    }
                    Err(e) => warn!(peer = %session.peer_addr(), "Push to client failed: {e}"),
                }
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lifecycle.lock().await.as_ref().map(|r| r.local_addr)
    }
}

impl Inner {
    async fn accept_loop(inner: Weak<Self>, acceptor: Acceptor, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };
            let Some(listener) = inner.upgrade() else { break };
            match accepted {
                Ok(connection) => listener.register(connection),
                Err(e) => error!(category = "connectivity", "Failed to accept client: {e}"),
            }
        }
        debug!("Client accept loop finished");
    }

    fn register(self: &Arc<Self>, connection: Connection) {
        let session = ClientSession::new(connection, self.accessors.clone(), self.config.clone());
        let id = session.id().to_string();
        let peer = session.peer_addr();

        let registry = Arc::downgrade(self);
        session.on_destroyed(Arc::new(move |id: &str| {
            if let Some(inner) = registry.upgrade() {
                if inner.sessions.remove(id).is_some() {
                    info!(session = %id, "Client session removed");
                }
            }
        }));

        self.sessions.insert(id.clone(), session.clone());
        info!(%peer, session = %id, total = self.sessions.len(), "New client connected");

        if let Err(e) = session.start_session() {
            error!(%peer, "Failed to start client session: {e}");
            self.sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::wire::aic_delimiter;
    use relay_protocol::{AicMessage, Alarm, MessageKind};
    use relay_transport::FrameReader;
    use std::time::Duration;

    fn listener() -> ClientListener {
        let config = ClientConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            cycle_interval: Duration::from_millis(10),
            network_timeout: Duration::from_millis(40),
            max_push_retries: 2,
            keep_alive_interval: Duration::from_secs(3600),
        };
        let accessors = StateAccessors::new(
            || {
                vec![Alarm {
                    id: "A".into(),
                    ..Default::default()
                }]
            },
            || false,
        );
        ClientListener::new(config, accessors)
    }

    async fn recv(reader: &mut FrameReader) -> AicMessage {
        let bytes = tokio::time::timeout(Duration::from_secs(2), reader.read_frame(aic_delimiter()))
            .await
            .expect("envelope in time")
            .unwrap();
        AicMessage::decode(&bytes).unwrap()
    }

    async fn wait_for_count(listener: &ClientListener, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while listener.session_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count reached");
    }

    #[tokio::test]
    async fn accepted_client_gets_initial_push() {
        let listener = listener();
        let addr = listener.start().await.unwrap();

        let client = Connection::connect("127.0.0.1", addr.port(), Duration::from_secs(1)).await.unwrap();
        let (mut reader, _writer) = client.into_split();
        let first = recv(&mut reader).await;
        assert_eq!(first.kind, MessageKind::Request);
        assert!(!first.was_connected);
        assert_eq!(first.alarms.len(), 1);

        listener.stop().await.unwrap();
        assert_eq!(listener.session_count(), 0);
    }

    #[tokio::test]
    async fn silent_client_is_removed_from_registry() {
        let listener = listener();
        let addr = listener.start().await.unwrap();

        let client = Connection::connect("127.0.0.1", addr.port(), Duration::from_secs(1)).await.unwrap();
        wait_for_count(&listener, 1).await;
        wait_for_count(&listener, 0).await;
        drop(client);

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn push_reaches_every_client() {
        let listener = listener();
        let addr = listener.start().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..2 {
            let client = Connection::connect("127.0.0.1", addr.port(), Duration::from_secs(1)).await.unwrap();
            clients.push(client.into_split());
        }
        wait_for_count(&listener, 2).await;

        for (reader, writer) in clients.iter_mut() {
            assert_eq!(recv(reader).await.kind, MessageKind::Request);
            let ack = AicMessage::response(false, Vec::new()).encode().unwrap();
            writer.write_all(&ack).await.unwrap();
        }

        listener.push_new_state();
        for (reader, _) in clients.iter_mut() {
            assert_eq!(recv(reader).await.kind, MessageKind::Request);
        }

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_closes_client_sockets() {
        let listener = listener();
        let addr = listener.start().await.unwrap();
        let client = Connection::connect("127.0.0.1", addr.port(), Duration::from_secs(1)).await.unwrap();
        let (mut reader, _writer) = client.into_split();
        recv(&mut reader).await;

        listener.stop().await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(2), reader.read_frame(aic_delimiter())).await;
        assert!(matches!(closed, Ok(Err(_))));
    }

    #[tokio::test]
    async fn usage_errors() {
        let listener = listener();
        assert!(matches!(listener.stop().await, Err(ServerError::NotRunning(_))));
        listener.push_new_state();

        listener.start().await.unwrap();
        assert!(listener.local_addr().await.is_some());
        assert!(matches!(listener.start().await, Err(ServerError::AlreadyRunning(_))));
        listener.stop().await.unwrap();
        assert!(!listener.is_running());
    }
}
