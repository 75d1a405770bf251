//! Integration tests for WebSocket connection, auth, ping/pong, presence and
//! REST-triggered fan-out against a real server.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use shoplist_server::auth::jwt;
use shoplist_server::config::HubConfig;
use shoplist_server::hub::Hub;

const SECRET: &[u8] = b"integration-test-shared-secret!!";

struct TestServer {
    base_url: String,
    addr: SocketAddr,
    hub: Arc<Hub>,
}

impl TestServer {
    fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }
}

/// Helper: start the server on a random port.
async fn start_test_server() -> TestServer {
    start_test_server_with(HubConfig::default()).await
}

/// Helper: start the server on a random port with custom hub tuning.
async fn start_test_server_with(config: HubConfig) -> TestServer {
    let hub = Hub::start(config);
    let state = shoplist_server::state::AppState {
        hub: hub.clone(),
        jwt_secret: SECRET.to_vec(),
    };

    let app = shoplist_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        hub,
    }
}

fn token_for(user_id: i64) -> String {
    jwt::issue_token(
        SECRET,
        user_id,
        &format!("user{user_id}"),
        &format!("user{user_id}@example.com"),
        chrono::Duration::hours(1),
    )
    .unwrap()
}

/// WebSocket client that splits coalesced frames into individual messages.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Value>,
}

impl TestClient {
    async fn connect(server: &TestServer, user_id: i64) -> Self {
        let (ws, _) = connect_async(server.ws_url(&token_for(user_id)))
            .await
            .expect("WebSocket connect failed");
        let mut client = Self {
            ws,
            pending: VecDeque::new(),
        };
        client.sync().await;
        client
    }

    async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("Send failed");
    }

    /// Next JSON message from the server, skipping transport pings.
    async fn recv(&mut self) -> Value {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return value;
            }
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("Timed out waiting for message")
                .expect("Stream ended")
                .expect("WebSocket error");
            match msg {
                Message::Text(text) => {
                    for line in text.as_str().split('\n') {
                        self.pending
                            .push_back(serde_json::from_str(line).expect("Invalid JSON line"));
                    }
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Unexpected frame: {:?}", other),
            }
        }
    }

    async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["type"] == kind {
                return message;
            }
        }
    }

    /// Round-trip an application ping so the server has registered us.
    async fn sync(&mut self) {
        self.send_json(json!({"type": "ping"})).await;
        self.recv_type("pong").await;
    }

    async fn subscribe(&mut self, list_id: i64) {
        self.send_json(json!({"type": "subscribe", "list_id": list_id}))
            .await;
        let reply = self.recv_type("subscribed").await;
        assert_eq!(reply["list_id"], list_id);
    }
}

/// Wait for the server to close the socket and return the close code.
async fn expect_close_code(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Option<u16> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => panic!("Timed out waiting for close"),
        }
    }
}

#[tokio::test]
async fn test_ws_ping_pong() {
    let server = start_test_server().await;
    let mut client = TestClient::connect(&server, 1).await;

    client.send_json(json!({"type": "ping"})).await;
    let pong = client.recv().await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["data"]["timestamp"].is_i64());
    assert!(pong["time"].is_i64());
}

#[tokio::test]
async fn test_ws_transport_ping_answered() {
    let server = start_test_server().await;
    let mut client = TestClient::connect(&server, 1).await;

    client
        .ws
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), client.ws.next())
        .await
        .expect("Timed out waiting for pong")
        .unwrap()
        .unwrap();
    assert_eq!(response, Message::Pong(vec![42, 43, 44].into()));
}

#[tokio::test]
async fn test_ws_subscribe_then_rest_broadcast() {
    let server = start_test_server().await;
    let mut client = TestClient::connect(&server, 1).await;
    client.subscribe(9).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/ws/broadcast/list/9", server.base_url))
        .bearer_auth(token_for(2))
        .json(&json!({"type": "item_update", "data": {"id": 42, "completed": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let update = client.recv().await;
    assert_eq!(update["type"], "item_update");
    assert_eq!(update["list_id"], 9);
    assert_eq!(update["data"]["id"], 42);
    assert_eq!(update["data"]["completed"], true);
}

#[tokio::test]
async fn test_ws_rest_payload_forwarded_unchanged() {
    let server = start_test_server().await;
    let mut client = TestClient::connect(&server, 1).await;
    client.subscribe(6).await;

    let http = reqwest::Client::new();
    let payloads = [
        json!([{"id": 1, "name": "milk"}, {"id": 2, "name": "eggs"}]),
        json!({"id": 42, "completed": true}),
    ];
    for data in &payloads {
        let resp = http
            .post(format!("{}/api/ws/broadcast/list/6", server.base_url))
            .bearer_auth(token_for(1))
            .json(&json!({"type": "item_update", "data": data}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    for data in &payloads {
        let update = client.recv_type("item_update").await;
        assert_eq!(&update["data"], data);
        assert!(update["data"].get("action").is_none());
    }
}

#[tokio::test]
async fn test_server_sends_keepalive_pings() {
    let server = start_test_server_with(HubConfig {
        ping_interval_secs: 1,
        idle_timeout_secs: 3,
        ..HubConfig::default()
    })
    .await;
    let mut client = TestClient::connect(&server, 1).await;

    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.ws.next())
            .await
            .expect("No ping within the ping interval")
            .expect("Stream ended")
            .expect("WebSocket error");
        if matches!(msg, Message::Ping(_)) {
            break;
        }
    }
}

#[tokio::test]
async fn test_silent_client_dropped_after_idle_timeout() {
    let server = start_test_server_with(HubConfig {
        ping_interval_secs: 1,
        idle_timeout_secs: 2,
        ..HubConfig::default()
    })
    .await;
    // Never read again, so server pings go unanswered.
    let _client = TestClient::connect(&server, 1).await;
    assert_eq!(server.hub.registry().connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut remaining = server.hub.registry().connection_count();
    for _ in 0..50 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        remaining = server.hub.registry().connection_count();
    }
    assert_eq!(remaining, 0);
    assert!(!server.hub.registry().is_online(1));
}

#[tokio::test]
async fn test_ws_unsubscribed_list_not_delivered() {
    let server = start_test_server().await;
    let mut client = TestClient::connect(&server, 1).await;
    client.subscribe(4).await;

    client
        .send_json(json!({"type": "unsubscribe", "list_id": 4}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "unsubscribed");

    let http = reqwest::Client::new();
    for list_id in [4, 5] {
        let resp = http
            .post(format!("{}/api/ws/broadcast/list/{}", server.base_url, list_id))
            .bearer_auth(token_for(1))
            .json(&json!({"type": "list_update", "data": {"name": "Groceries"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    // Nothing from either list arrives before the next pong.
    client.send_json(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await["type"], "pong");
}

#[tokio::test]
async fn test_ws_invalid_token_closes_4002() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(server.ws_url("not-a-jwt")).await.unwrap();
    assert_eq!(expect_close_code(&mut ws).await, Some(4002));
}

#[tokio::test]
async fn test_ws_expired_token_closes_4001() {
    let server = start_test_server().await;
    let token = jwt::issue_token(SECRET, 1, "user1", "", chrono::Duration::hours(-1)).unwrap();
    let (mut ws, _) = connect_async(server.ws_url(&token)).await.unwrap();
    assert_eq!(expect_close_code(&mut ws).await, Some(4001));
}

#[tokio::test]
async fn test_ws_missing_token_rejected() {
    let server = start_test_server().await;
    let result = connect_async(format!("ws://{}/ws", server.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("Expected HTTP 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_ws_presence_between_users() {
    let server = start_test_server().await;
    let mut watcher = TestClient::connect(&server, 1).await;
    let mut other = TestClient::connect(&server, 2).await;

    let online = watcher.recv_type("user_online").await;
    assert_eq!(online["data"]["user_id"], 2);

    other.ws.close(None).await.unwrap();

    let offline = watcher.recv_type("user_offline").await;
    assert_eq!(offline["user_id"], 2);
}

#[tokio::test]
async fn test_online_users_endpoint() {
    let server = start_test_server().await;
    let _a = TestClient::connect(&server, 3).await;
    let _b = TestClient::connect(&server, 1).await;
    let _c = TestClient::connect(&server, 1).await;

    let body: Value = reqwest::Client::new()
        .get(format!("{}/api/ws/online-users", server.base_url))
        .bearer_auth(token_for(1))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["online_users"], json!([1, 3]));
    assert_eq!(body["count"], 2);
}

#[tokio::test]
async fn test_rest_endpoints_require_token() {
    let server = start_test_server().await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("{}/api/ws/online-users", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .post(format!("{}/api/ws/notify/1", server.base_url))
        .bearer_auth("garbage")
        .json(&json!({"data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_broadcast_rejects_unknown_type() {
    let server = start_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/ws/broadcast/list/1", server.base_url))
        .bearer_auth(token_for(1))
        .json(&json!({"type": "share_update", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_notify_reaches_every_connection_of_user() {
    let server = start_test_server().await;
    let mut phone = TestClient::connect(&server, 7).await;
    let mut laptop = TestClient::connect(&server, 7).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/ws/notify/7", server.base_url))
        .bearer_auth(token_for(1))
        .json(&json!({"data": {"title": "List shared", "message": "Groceries"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    for client in [&mut phone, &mut laptop] {
        let note = client.recv_type("notification").await;
        assert_eq!(note["user_id"], 7);
        assert_eq!(note["data"]["title"], "List shared");
    }
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let server = start_test_server().await;
    let mut client = TestClient::connect(&server, 1).await;

    let padding = "x".repeat(2048);
    let _ = client
        .ws
        .send(Message::Text(
            json!({"type": "ping", "data": padding}).to_string().into(),
        ))
        .await;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                assert!(!text.as_str().contains("pong"), "Oversized ping was answered");
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("Connection stayed open after oversized frame"),
        }
    }
}

#[tokio::test]
async fn test_reconnect_cycles_leave_no_entries() {
    let server = start_test_server().await;
    let http = reqwest::Client::new();

    for _ in 0..5 {
        let mut client = TestClient::connect(&server, 11).await;
        client.ws.close(None).await.unwrap();
        let _ = expect_close_code(&mut client.ws).await;
    }

    // Disconnect runs after the close handshake; poll until it lands.
    let mut count = None;
    for _ in 0..50 {
        let body: Value = http
            .get(format!("{}/api/ws/online-users", server.base_url))
            .bearer_auth(token_for(1))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        count = body["count"].as_u64();
        if count == Some(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(count, Some(0));
}

#[tokio::test]
async fn test_health() {
    let server = start_test_server().await;
    let body = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}
