//! End-to-end tests: a fake WAS and real display clients over loopback TCP,
//! driving the full relay through the listening manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use relay_protocol::wire::aic_delimiter;
use relay_protocol::{AicMessage, Alarm, MessageKind, WasAlarm, WasObject};
use relay_server::{ListeningManager, ManagerEvent, RelayConfig, ServerError, Uploader};
use relay_transport::{Connection, Probe};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

struct SwitchProbe(AtomicBool);

impl SwitchProbe {
    fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(reachable)))
    }

    fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

impl Probe for SwitchProbe {
    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.0.load(Ordering::SeqCst) })
    }
}

#[derive(Default)]
struct RecordingUploader(Mutex<Vec<String>>);

impl Uploader for RecordingUploader {
    fn upload(&self, alarm: Alarm) {
        self.0.lock().push(alarm.id);
    }
}

/// Loopback stand-in for the WAS. Every accepted socket is handed out.
async fn start_fake_was() -> (u16, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });
    (port, rx)
}

fn test_config(was_port: u16) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.was.host = "127.0.0.1".into();
    config.was.port = was_port;
    config.was.poll_interval = Duration::from_millis(20);
    config.was.reconnect_interval = Duration::from_millis(50);
    config.was.connect_timeout = Duration::from_secs(1);
    config.clients.bind = "127.0.0.1".into();
    config.clients.port = 0;
    config.clients.cycle_interval = Duration::from_millis(20);
    config.clients.network_timeout = Duration::from_millis(60);
    config.clients.max_push_retries = 5;
    config
}

/// A `pdu` document as the WAS sends it, ampersand fault included.
fn was_payload(ids: &[&str]) -> Vec<u8> {
    let alarms = ids
        .iter()
        .map(|id| WasAlarm {
            id: id.to_string(),
            subject: "BRANDMELDEALARM".into(),
            location: format!("M & MÜLLER STRASSE {id} #BMA 12"),
            status_text: "Alarmiert".into(),
            ..Default::default()
        })
        .collect();
    let mut payload = WasObject::new(alarms);
    payload.set_indexes();
    payload.encode(true).unwrap()
}

/// Display client that acknowledges every Request and forwards whatever it
/// receives.
async fn responsive_client(port: u16) -> mpsc::UnboundedReceiver<AicMessage> {
    let connection = Connection::connect("127.0.0.1", port, WAIT).await.unwrap();
    let (mut reader, writer) = connection.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(frame) = reader.read_frame(aic_delimiter()).await {
            let Ok(message) = AicMessage::decode(&frame) else { continue };
            if message.kind == MessageKind::Request {
                let ack = AicMessage::response(true, Vec::new()).encode().unwrap();
                if writer.write_all(&ack).await.is_err() {
                    break;
                }
            }
            if tx.send(message).is_err() {
                break;
            }
        }
    });
    rx
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<AicMessage>) -> AicMessage {
    timeout(WAIT, async {
        loop {
            let message = rx.recv().await.expect("client still connected");
            if message.kind == MessageKind::Request {
                return message;
            }
        }
    })
    .await
    .expect("request in time")
}

async fn wait_for_event(events: &mut broadcast::Receiver<ManagerEvent>, wanted: ManagerEvent) {
    timeout(WAIT, async {
        while events.recv().await.unwrap() != wanted {}
    })
    .await
    .expect("manager event in time")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time")
}

fn ids(message: &AicMessage) -> Vec<&str> {
    message.alarms.iter().map(|a| a.id.as_str()).collect()
}

#[tokio::test]
async fn relay_end_to_end() {
    let (was_port, mut was) = start_fake_was().await;
    let probe = SwitchProbe::new(true);
    let uploader = Arc::new(RecordingUploader::default());
    let manager = ListeningManager::with_parts(
        test_config(was_port),
        probe.clone(),
        Some(uploader.clone() as Arc<dyn Uploader>),
    );
    let mut events = manager.subscribe();

    let client_addr = manager.start_client_listening().await.unwrap();
    manager.start_was_listening().await.unwrap();
    let mut upstream = timeout(WAIT, was.recv()).await.unwrap().unwrap();
    wait_for_event(&mut events, ManagerEvent::WasConnectionChanged(true)).await;

    let mut display = responsive_client(client_addr.port()).await;
    let _silent = Connection::connect("127.0.0.1", client_addr.port(), WAIT).await.unwrap();

    let initial = next_request(&mut display).await;
    assert!(initial.was_connected);
    assert!(initial.alarms.is_empty());

    // {A}: pushed, with the fire-alarm location cut at '#'.
    upstream.write_all(&was_payload(&["A"])).await.unwrap();
    let first = next_request(&mut display).await;
    assert_eq!(ids(&first), vec!["A"]);
    assert_eq!(first.alarms[0].location, "M & MÜLLER STRASSE A");
    assert_eq!(first.alarms[0].status, 0);

    // Unchanged {A}: nothing is pushed.
    upstream.write_all(&was_payload(&["A"])).await.unwrap();
    let quiet = timeout(Duration::from_millis(300), next_request(&mut display)).await;
    assert!(quiet.is_err(), "unchanged payload must not be pushed");

    // {A, B}: pushed in id order.
    upstream.write_all(&was_payload(&["B", "A"])).await.unwrap();
    let second = next_request(&mut display).await;
    assert_eq!(ids(&second), vec!["A", "B"]);
    assert_eq!(manager.alarms().len(), 2);
    assert_eq!(*uploader.0.lock(), vec!["A", "A", "B"]);

    // The silent client exhausts its retries and leaves the registry.
    let clients = manager.client_listener().clone();
    wait_until(|| clients.session_count() == 1).await;

    // Upstream reset: clients learn the WAS is gone and the reconnect loop starts.
    probe.set(false);
    drop(upstream);
    let lost = next_request(&mut display).await;
    assert!(!lost.was_connected);
    assert_eq!(ids(&lost), vec!["A", "B"]);
    assert!(manager.status().await.reconnecting);
    assert!(matches!(
        manager.start_was_listening().await,
        Err(ServerError::ReconnectInProgress)
    ));

    // First successful probe restarts the listener.
    probe.set(true);
    let _upstream = timeout(WAIT, was.recv()).await.unwrap().unwrap();
    let back = next_request(&mut display).await;
    assert!(back.was_connected);
    let status = manager.status().await;
    assert!(status.was_running);
    assert!(!status.reconnecting);
    assert_eq!(status.sessions, 1);
    assert!(matches!(
        manager.start_was_listening().await,
        Err(ServerError::AlreadyRunning(_))
    ));

    manager.shutdown().await;
    assert_eq!(manager.client_listener().session_count(), 0);
}

#[tokio::test]
async fn garbage_from_was_keeps_last_state() {
    let (was_port, mut was) = start_fake_was().await;
    let manager = ListeningManager::with_parts(test_config(was_port), SwitchProbe::new(true), None);
    let mut events = manager.subscribe();

    manager.start_was_listening().await.unwrap();
    let mut upstream = timeout(WAIT, was.recv()).await.unwrap().unwrap();
    upstream.write_all(&was_payload(&["A"])).await.unwrap();
    timeout(WAIT, async {
        loop {
            if let ManagerEvent::AlarmsChanged(_) = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .unwrap();

    upstream.write_all(b"<pdu><broken></pdu>").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = manager.status().await;
    assert!(status.was_running);
    assert!(status.was_connected);
    assert_eq!(manager.alarms()[0].id, "A");
    manager.shutdown().await;
}

#[tokio::test]
async fn config_file_drives_manager() {
    let (was_port, mut was) = start_fake_was().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "was": {{ "host": "127.0.0.1", "port": {was_port}, "probe": "tcp", "poll_interval_ms": 20 }},
                "clients": {{ "bind": "127.0.0.1", "port": 0 }}
            }}"#
        ),
    )
    .unwrap();

    let config = RelayConfig::load(&path).unwrap();
    let manager = ListeningManager::new(config);
    manager.start_was_listening().await.unwrap();
    // The TCP probe's own connection shows up first.
    timeout(WAIT, was.recv()).await.unwrap().unwrap();
    timeout(WAIT, was.recv()).await.unwrap().unwrap();

    let addr = manager.start_client_listening().await.unwrap();
    assert_ne!(addr.port(), 0);
    let mut display = responsive_client(addr.port()).await;
    next_request(&mut display).await;

    manager.shutdown().await;
}
