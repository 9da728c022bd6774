#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use traffic_api::config::Config;
use traffic_api::db::kv::{KeyValueStore, MemoryStore};
use traffic_api::AppState;

pub type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub const COLLECTION: &str = "test:watermarks";

pub fn test_config() -> Config {
    Config {
        watermark_collection: COLLECTION.to_string(),
        ..Config::default()
    }
}

/// Build a test AppState backed by a fresh in-memory store.
pub fn test_state() -> (AppState, Arc<MemoryStore>) {
    test_state_with(test_config())
}

pub fn test_state_with(config: Config) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = store.clone();
    (AppState::new(config, kv), store)
}

/// Build a test AppState whose store already holds `records` as
/// `(domain, raw record)` pairs, as if a previous process had written them.
pub async fn seeded_state(records: &[(&str, &str)]) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for (domain, raw) in records {
        store.set_field(COLLECTION, domain, raw).await.expect("seed store");
    }
    let kv: Arc<dyn KeyValueStore> = store.clone();
    (AppState::new(test_config(), kv), store)
}

/// Build the full application router wired to `state`.
pub fn test_app(state: &AppState) -> Router {
    traffic_api::routes::router().with_state(state.clone())
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_ws_server(state: &AppState) -> SocketAddr {
    let app = test_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Open a gateway WebSocket, optionally sending an `Origin` header.
pub async fn connect_ws(addr: SocketAddr, origin: Option<&str>) -> Ws {
    let mut request = format!("ws://{addr}/gateway")
        .into_client_request()
        .expect("client request");
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("origin", origin.parse().expect("origin header"));
    }

    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws_stream
}

/// Read the next JSON text frame. Panics on close or timeout.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Text(text) => return serde_json::from_str(&text).expect("parse"),
            tungstenite::Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Read the connection's opening `traffic` frames and return the `connected`
/// acknowledgement that follows them.
pub async fn expect_connected(ws: &mut Ws) -> Value {
    loop {
        let msg = next_json(ws).await;
        match msg["t"].as_str() {
            Some("connected") => return msg,
            Some("traffic") => continue,
            _ => panic!("unexpected frame before connected: {msg}"),
        }
    }
}

/// Read frames until a close frame arrives and return its code.
pub async fn expect_close(ws: &mut Ws) -> Option<u16> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");

        match msg {
            Some(Ok(tungstenite::Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Send a JSON text frame.
pub async fn send_json(ws: &mut Ws, value: Value) {
    use futures_util::SinkExt;
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Poll until `domain` reports `expected` live users. Disconnects are
/// processed by the server after the socket closes, so this can lag a little.
pub async fn wait_for_current_users(state: &AppState, domain: &str, expected: u64) {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = state
            .presence
            .stats(domain)
            .map(|s| s.current_users)
            .unwrap_or(0);
        if current == expected {
            return;
        }
        assert!(
            time::Instant::now() < deadline,
            "{domain}: expected {expected} live users, still {current}"
        );
        time::sleep(Duration::from_millis(20)).await;
    }
}
