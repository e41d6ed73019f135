//! End-to-end tests for the signaling relay
//!
//! Each test starts a real relay on an ephemeral loopback port and drives it
//! with WebSocket clients:
//! - id assignment and uniqueness
//! - offer/answer forwarding between two clients
//! - silent drop for unknown targets
//! - disconnect broadcast
//! - HTTP liveness and health endpoints

use std::net::SocketAddr;
use std::time::Duration;

use decent_common::{
    protocol, CallAnswer, CallRequest, ClientEvent, IncomingCall, PeerUnavailable, ServerEvent,
    SessionId,
};
use decent_relay::{AppState, RelayConfig};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const QUIET_PERIOD: Duration = Duration::from_millis(200);

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        decent_relay::serve(listener, AppState::new(config))
            .await
            .expect("relay server");
    });
    addr
}

struct TestClient {
    id: SessionId,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}/ws", addr))
            .await
            .expect("websocket connect");
        let mut client = Self {
            id: SessionId::from(""),
            ws,
        };
        match client.next_event().await {
            ServerEvent::AssignedId(id) => client.id = id,
            other => panic!("expected assigned-id, got {:?}", other),
        }
        client
    }

    async fn send(&mut self, event: &ClientEvent) {
        let text = protocol::encode(event).expect("encode");
        self.ws.send(Message::Text(text)).await.expect("send frame");
    }

    async fn next_event(&mut self) -> ServerEvent {
        let next = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return protocol::decode(&text).expect("decode"),
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {:?}", other),
                }
            }
        })
        .await;
        next.expect("timed out waiting for relay event")
    }

    async fn assert_quiet(&mut self) {
        let waited = tokio::time::timeout(QUIET_PERIOD, self.ws.next()).await;
        assert!(waited.is_err(), "unexpected frame: {:?}", waited);
    }

    async fn close(mut self) {
        self.ws.close(None).await.expect("close");
    }
}

fn offer(target: &SessionId, from: &SessionId) -> ClientEvent {
    ClientEvent::InitiateCall(CallRequest {
        target_id: target.clone(),
        signal: json!({"type": "offer", "sdp": "X"}),
        from_id: from.clone(),
    })
}

#[tokio::test]
async fn test_clients_get_distinct_ids() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(TestClient::connect(addr).await);
    }

    let mut ids: Vec<_> = clients.iter().map(|c| c.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn test_offer_and_answer_round_trip() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(&offer(&b.id, &a.id)).await;
    assert_eq!(
        b.next_event().await,
        ServerEvent::IncomingCall(IncomingCall {
            signal: json!({"type": "offer", "sdp": "X"}),
            from_id: a.id.clone(),
        })
    );

    b.send(&ClientEvent::AcceptCall(CallAnswer {
        signal: json!({"type": "answer", "sdp": "Y"}),
        target_id: a.id.clone(),
    }))
    .await;
    assert_eq!(
        a.next_event().await,
        ServerEvent::CallAccepted(json!({"type": "answer", "sdp": "Y"}))
    );

    a.assert_quiet().await;
    b.assert_quiet().await;
}

#[tokio::test]
async fn test_unknown_target_is_dropped_without_reply() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(&offer(&SessionId::from("not-a-client"), &a.id)).await;

    a.assert_quiet().await;
    b.assert_quiet().await;
}

#[tokio::test]
async fn test_unknown_target_reported_when_enabled() {
    let addr = spawn_relay(RelayConfig {
        notify_unreachable: true,
        ..RelayConfig::default()
    })
    .await;
    let mut a = TestClient::connect(addr).await;

    a.send(&offer(&SessionId::from("not-a-client"), &a.id)).await;

    assert_eq!(
        a.next_event().await,
        ServerEvent::PeerUnavailable(PeerUnavailable {
            target_id: SessionId::from("not-a-client"),
        })
    );
}

#[tokio::test]
async fn test_disconnect_notifies_every_other_client_once() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    let mut c = TestClient::connect(addr).await;
    let a_id = a.id.clone();

    a.close().await;

    assert_eq!(b.next_event().await, ServerEvent::CallEnded);
    assert_eq!(c.next_event().await, ServerEvent::CallEnded);
    b.assert_quiet().await;
    c.assert_quiet().await;

    // The old id is gone for good.
    b.send(&offer(&a_id, &b.id)).await;
    b.assert_quiet().await;
    c.assert_quiet().await;
}

#[tokio::test]
async fn test_duplicate_envelope_forwarded_twice() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    let envelope = offer(&b.id, &a.id);
    a.send(&envelope).await;
    a.send(&envelope).await;

    let first = b.next_event().await;
    let second = b.next_event().await;
    assert_eq!(first, second);
    b.assert_quiet().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.ws
        .send(Message::Text("{\"event\":\"bogus\"}".to_string()))
        .await
        .expect("send garbage");
    a.assert_quiet().await;

    a.send(&offer(&b.id, &a.id)).await;
    assert!(matches!(b.next_event().await, ServerEvent::IncomingCall(_)));
}

#[tokio::test]
async fn test_liveness_and_health_endpoints() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let _a = TestClient::connect(addr).await;
    let _b = TestClient::connect(addr).await;

    let body = reqwest::get(format!("http://{}/", addr))
        .await
        .expect("GET /")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "Server is running.");

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .expect("GET /health")
        .json()
        .await
        .expect("json");
    assert_eq!(health, json!({"connected_clients": 2}));
}
