use std::{net::SocketAddr, path::PathBuf, time::Duration};

use futures_util::{SinkExt, StreamExt};
use picochat_core::{encode, Packet};
use picochat_server::{
    server::{self, AppState},
    Liveness, Relay, RelayConfig,
};
use tokio::{net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    relay: Relay,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        let relay = Relay::new(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, signal) = oneshot::channel::<()>();
        let state = AppState {
            relay: relay.clone(),
            metrics: None,
        };
        tokio::spawn(async move {
            server::serve(listener, state, async {
                let _ = signal.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            relay,
            shutdown: Some(shutdown),
        }
    }

    fn connection_count(&self) -> usize {
        self.relay.connection_count()
    }

    async fn connect(&self) -> Socket {
        let expected = self.connection_count() + 1;
        let (socket, _) = connect_async(format!("ws://{}/", self.addr)).await.unwrap();
        self.wait_for_connections(expected).await;
        socket
    }

    async fn wait_for_connections(&self, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while self.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never reached the expected connection count");
    }

    async fn wait_for_joined(&self, expected: usize) {
        timeout(Duration::from_secs(5), async {
            loop {
                let joined = self
                    .relay
                    .snapshot()
                    .iter()
                    .filter(|conn| conn.liveness == Liveness::Active)
                    .count();
                if joined == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never saw the expected handshakes");
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn send(socket: &mut Socket, text: &str) {
    socket
        .send(Message::Text(encode(text).unwrap().to_json()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> String {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no broadcast received")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return Packet::from_json(&text).unwrap().body();
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let next = timeout(Duration::from_millis(200), socket.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

#[test_timeout::tokio_timeout_test]
async fn join_and_chat_reach_the_other_clients() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut c1 = relay.connect().await;
    let mut c2 = relay.connect().await;
    let mut c3 = relay.connect().await;

    send(&mut c1, "Bob").await;
    assert_eq!(recv(&mut c2).await, "\n++ Bob joined");
    assert_eq!(recv(&mut c3).await, "\n++ Bob joined");

    send(&mut c2, "Amy").await;
    assert_eq!(recv(&mut c1).await, "\n++ Amy joined");
    assert_eq!(recv(&mut c3).await, "\n++ Amy joined");

    send(&mut c1, "hi there").await;
    assert_eq!(recv(&mut c2).await, "Bob:\n  hi there");
    // C3 is still unnamed and receives every broadcast.
    assert_eq!(recv(&mut c3).await, "Bob:\n  hi there");

    assert_silent(&mut c1).await;
    assert_silent(&mut c2).await;
    assert_silent(&mut c3).await;
}

#[test_timeout::tokio_timeout_test]
async fn late_joiner_sees_no_history() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut c1 = relay.connect().await;
    send(&mut c1, "C1").await;
    relay.wait_for_joined(1).await;
    let mut c2 = relay.connect().await;
    send(&mut c2, "C2").await;
    assert_eq!(recv(&mut c1).await, "\n++ C2 joined");

    let mut c3 = relay.connect().await;
    send(&mut c3, "C3").await;
    assert_eq!(recv(&mut c1).await, "\n++ C3 joined");
    assert_eq!(recv(&mut c2).await, "\n++ C3 joined");
    assert_silent(&mut c3).await;
}

#[test_timeout::tokio_timeout_test]
async fn departed_client_is_announced_once() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut c1 = relay.connect().await;
    let mut c2 = relay.connect().await;
    send(&mut c1, "Bob").await;
    assert_eq!(recv(&mut c2).await, "\n++ Bob joined");
    send(&mut c2, "Amy").await;
    assert_eq!(recv(&mut c1).await, "\n++ Amy joined");

    c2.close(None).await.unwrap();
    relay.wait_for_connections(1).await;
    assert_eq!(recv(&mut c1).await, "\n-- Amy left");

    send(&mut c1, "anyone?").await;
    assert_silent(&mut c1).await;
}

#[test_timeout::tokio_timeout_test]
async fn graceful_close_is_acknowledged() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut c1 = relay.connect().await;
    send(&mut c1, "Bob").await;
    relay.wait_for_joined(1).await;

    c1.close(None).await.unwrap();
    let reply = timeout(Duration::from_secs(5), c1.next())
        .await
        .expect("server never answered the close");
    assert!(
        matches!(reply, Some(Ok(Message::Close(_)))),
        "expected a close reply, got {reply:?}"
    );
    relay.wait_for_connections(0).await;
}

#[test_timeout::tokio_timeout_test]
async fn malformed_packet_drops_only_the_sender() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut c1 = relay.connect().await;
    let mut c2 = relay.connect().await;
    send(&mut c1, "Bob").await;
    assert_eq!(recv(&mut c2).await, "\n++ Bob joined");

    c2.send(Message::Text("{\"not\":\"a packet\"}".into()))
        .await
        .unwrap();
    relay.wait_for_connections(1).await;

    send(&mut c1, "still here").await;
    assert_silent(&mut c1).await;
    assert_eq!(relay.connection_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn chat_messages_are_audited() {
    let path: PathBuf =
        std::env::temp_dir().join(format!("picochat-it-{}.log", uuid::Uuid::new_v4()));
    let relay = TestRelay::start(RelayConfig {
        audit_log: Some(path.clone()),
        ..RelayConfig::default()
    })
    .await;
    let mut c1 = relay.connect().await;
    let mut c2 = relay.connect().await;

    send(&mut c1, "Bob").await;
    assert_eq!(recv(&mut c2).await, "\n++ Bob joined");
    send(&mut c1, "logged").await;
    assert_eq!(recv(&mut c2).await, "Bob:\n  logged");

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(&lines[1..], &["127.0.0.1", "Bob", "logged", ""]);

    let _ = tokio::fs::remove_file(&path).await;
}

#[test_timeout::tokio_timeout_test]
async fn audit_failure_does_not_block_relay() {
    let path = std::env::temp_dir()
        .join(format!("picochat-absent-{}", uuid::Uuid::new_v4()))
        .join("log.txt");
    let relay = TestRelay::start(RelayConfig {
        audit_log: Some(path),
        ..RelayConfig::default()
    })
    .await;
    let mut c1 = relay.connect().await;
    let mut c2 = relay.connect().await;

    send(&mut c1, "Bob").await;
    assert_eq!(recv(&mut c2).await, "\n++ Bob joined");
    send(&mut c1, "unlogged").await;
    assert_eq!(recv(&mut c2).await, "Bob:\n  unlogged");
}
