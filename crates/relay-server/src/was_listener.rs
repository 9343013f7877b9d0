//! Upstream client for the WAS dispatch backend.
//!
//! One worker task owns the connection: it sends `get-alarms` once after
//! connecting and again on every keep-alive tick, and otherwise polls for
//! the next `pdu` document. Only payloads that differ from the last one
//! produce a `PayloadChanged` event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use relay_protocol::WasObject;
use relay_protocol::wire::{Wire, was_delimiter};
use relay_transport::{Connection, FrameReader, FrameWriter, TransportError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WasConfig;
use crate::error::ServerError;

const EVENT_CAPACITY: usize = 64;

/// Connection-state transitions of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChange {
    Established,
    /// The link failed. The owner is expected to reconnect.
    Lost,
    /// The listener was stopped or hit a non-socket fault. No reconnect.
    Shutdown,
}

impl ConnectionChange {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Established)
    }
}

#[derive(Debug, Clone)]
pub enum WasEvent {
    ConnectionChanged(ConnectionChange),
    PayloadChanged(Arc<WasObject>),
}

struct Worker {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct WasListener {
    inner: Arc<Inner>,
}

struct Inner {
    config: WasConfig,
    events: broadcast::Sender<WasEvent>,
    last_payload: Mutex<Option<Arc<WasObject>>>,
    worker: Mutex<Option<Worker>>,
    generation: AtomicU64,
    connected: AtomicBool,
}

impl WasListener {
    pub fn new(config: WasConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                last_payload: Mutex::new(None),
                worker: Mutex::new(None),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WasEvent> {
        self.inner.events.subscribe()
    }

    /// Launch the worker. Connecting happens inside it; a failed connect
    /// surfaces as `ConnectionChange::Lost`.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            error!("The WAS listener worker has already been started");
            return Err(ServerError::AlreadyRunning("WAS listener"));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(generation, cancel.clone()));
        *worker = Some(Worker {
            generation,
            cancel,
            handle,
        });

        info!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            "Listening to the WAS started"
        );
        Ok(())
    }

    /// Cancel the worker and wait for it to close the connection.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(worker) = self.inner.worker.lock().take() else {
            error!("The WAS listener worker isn't running");
            return Err(ServerError::NotRunning("WAS listener"));
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!("WAS listener worker ended abnormally: {e}");
        }
        info!("Listening to the WAS stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    /// Whether the worker currently holds an established connection.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn last_payload(&self) -> Option<Arc<WasObject>> {
        self.inner.last_payload.lock().clone()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let outcome = self.listen(&cancel).await;

        {
            let mut worker = self.worker.lock();
            if worker.as_ref().is_some_and(|w| w.generation == generation) {
                *worker = None;
            }
        }
        self.connected.store(false, Ordering::Release);

        let change = match outcome {
            Ok(()) => ConnectionChange::Shutdown,
            Err(ServerError::Transport(e)) => {
                error!(category = "connectivity", "WAS listener stopped due to socket error: {e}");
                ConnectionChange::Lost
            }
            Err(e) => {
                error!(category = %e.category(), "WAS listener stopped due to unknown error: {e}");
                ConnectionChange::Shutdown
            }
        };
        let _ = self.events.send(WasEvent::ConnectionChanged(change));
    }

    async fn listen(&self, cancel: &CancellationToken) -> Result<(), ServerError> {
        let connect = Connection::connect(&self.config.host, self.config.port, self.config.connect_timeout);
        let connection = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connection = connect => connection?,
        };
        info!(peer = %connection.peer_addr(), "Connected to WAS");

        let (mut reader, writer) = connection.into_split();
        let result = self.serve(&mut reader, &writer, cancel).await;
        writer.close().await;
        result
    }

    async fn serve(
        &self,
        reader: &mut FrameReader,
        writer: &FrameWriter,
        cancel: &CancellationToken,
    ) -> Result<(), ServerError> {
        let interval = self.config.keep_alive_interval;
        let mut keep_alive = tokio::time::interval_at(Instant::now() + interval, interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        writer.write_all(Wire::GET_ALARMS_COMMAND.as_bytes()).await?;
        self.connected.store(true, Ordering::Release);
        let _ = self
            .events
            .send(WasEvent::ConnectionChanged(ConnectionChange::Established));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = keep_alive.tick() => {
                    writer.write_all(Wire::GET_ALARMS_COMMAND.as_bytes()).await?;
                    debug!("Sent keep-alive command to WAS");
                }
                frame = reader.poll_frame(was_delimiter(), self.config.poll_interval) => {
                    match frame? {
                        Some(bytes) => self.handle_payload(&bytes),
                        None if !reader.is_connected() => {
                            error!("WAS disconnected while waiting for new data");
                            return Err(TransportError::Disconnected.into());
                        }
                        None => {}
                    }
                }
            }
        }
    }

    fn handle_payload(&self, bytes: &[u8]) {
        let payload = match WasObject::decode(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(category = "decode", len = bytes.len(), "Dropping undecodable WAS payload: {e}");
                return;
            }
        };
        debug!(records = payload.alarms.len(), "WAS payload decoded");

        let payload = {
            let mut last = self.last_payload.lock();
            if last.as_deref() == Some(&payload) {
                debug!("WAS payload unchanged");
                return;
            }
            let payload = Arc::new(payload);
            *last = Some(payload.clone());
            payload
        };

        info!(records = payload.alarms.len(), "New WAS data available");
        let _ = self.events.send(WasEvent::PayloadChanged(payload));
    }
}

impl Drop for WasListener {
    fn drop(&mut self) {
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::WasAlarm;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config(port: u16) -> WasConfig {
        WasConfig {
            host: "127.0.0.1".into(),
            port,
            keep_alive_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn payload(ids: &[&str]) -> Vec<u8> {
        let alarms = ids
            .iter()
            .map(|id| WasAlarm {
                id: id.to_string(),
                location: "WELS & UMGEBUNG".into(),
                status_text: "Alarmiert".into(),
                ..Default::default()
            })
            .collect();
        let mut object = WasObject::new(alarms);
        object.set_indexes();
        object.encode(true).unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<WasEvent>) -> WasEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .unwrap()
    }

    async fn accept_and_expect_command(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"get-alarms");
        stream
    }

    #[tokio::test]
    async fn emits_changes_only() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = WasListener::new(config(upstream.local_addr().unwrap().port()));
        let mut rx = listener.subscribe();
        listener.start().unwrap();

        let mut was = accept_and_expect_command(&upstream).await;
        assert!(matches!(
            next_event(&mut rx).await,
            WasEvent::ConnectionChanged(ConnectionChange::Established)
        ));
        assert!(listener.is_connected());

        was.write_all(&payload(&["A"])).await.unwrap();
        let WasEvent::PayloadChanged(first) = next_event(&mut rx).await else {
            panic!("expected payload");
        };
        assert_eq!(first.alarms[0].location, "WELS & UMGEBUNG");

        // Unchanged payload, then a grown one: only the second is reported.
        was.write_all(&payload(&["A"])).await.unwrap();
        was.write_all(&payload(&["A", "B"])).await.unwrap();
        let WasEvent::PayloadChanged(second) = next_event(&mut rx).await else {
            panic!("expected payload");
        };
        assert_eq!(second.alarms.len(), 2);
        assert_eq!(listener.last_payload().as_deref(), Some(second.as_ref()));
    }

    #[tokio::test]
    async fn garbage_is_dropped_and_loop_continues() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = WasListener::new(config(upstream.local_addr().unwrap().port()));
        let mut rx = listener.subscribe();
        listener.start().unwrap();

        let mut was = accept_and_expect_command(&upstream).await;
        next_event(&mut rx).await;

        was.write_all(b"<pdu><order-list><order><level>x</level></order></order-list></pdu>")
            .await
            .unwrap();
        was.write_all(&payload(&["A"])).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, WasEvent::PayloadChanged(_)));
        assert!(listener.is_running());
    }

    #[tokio::test]
    async fn keep_alive_repeats_command() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = WasListener::new(config(upstream.local_addr().unwrap().port()));
        listener.start().unwrap();

        let mut was = accept_and_expect_command(&upstream).await;
        let mut buf = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(1), was.read_exact(&mut buf))
            .await
            .expect("keep-alive in time")
            .unwrap();
        assert_eq!(&buf, b"get-alarms");
    }

    #[tokio::test]
    async fn socket_reset_is_lost_and_stop_is_shutdown() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = WasListener::new(config(upstream.local_addr().unwrap().port()));
        let mut rx = listener.subscribe();

        listener.start().unwrap();
        let was = accept_and_expect_command(&upstream).await;
        next_event(&mut rx).await;
        drop(was);
        assert!(matches!(
            next_event(&mut rx).await,
            WasEvent::ConnectionChanged(ConnectionChange::Lost)
        ));
        assert!(!listener.is_running());
        assert!(!listener.is_connected());

        listener.start().unwrap();
        let _was = accept_and_expect_command(&upstream).await;
        next_event(&mut rx).await;
        listener.stop().await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            WasEvent::ConnectionChanged(ConnectionChange::Shutdown)
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_lost() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let listener = WasListener::new(config(port));
        let mut rx = listener.subscribe();
        listener.start().unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            WasEvent::ConnectionChanged(ConnectionChange::Lost)
        ));
    }

    #[tokio::test]
    async fn usage_errors() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = WasListener::new(config(upstream.local_addr().unwrap().port()));
        assert!(matches!(listener.stop().await, Err(ServerError::NotRunning(_))));

        listener.start().unwrap();
        assert!(matches!(listener.start(), Err(ServerError::AlreadyRunning(_))));
        listener.stop().await.unwrap();
        assert!(!listener.is_running());
    }
}
