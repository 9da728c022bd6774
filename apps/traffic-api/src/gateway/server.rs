//! WebSocket upgrade handler and per-connection event loop.
//!
//! The loop is the transport side of the presence state machine: the upgrade
//! is the connect event, `setDomain` dispatches are rebinds, and whatever ends
//! the loop becomes exactly one disconnect event.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::MAX_HEARTBEAT_INTERVAL_MS;
use crate::AppState;

use super::events::{
    ClientMessage, ConnectedPayload, EventName, GatewayMessage, HeartbeatPayload, OP_DISPATCH,
    OP_HEARTBEAT,
};
use super::fanout::BroadcastPayload;
use super::presence::PresenceService;
use super::session::GatewaySession;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Why a gateway connection ended. Passed to the presence service as an
/// opaque reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a close frame or the stream ended.
    ClientDisconnect,
    /// A write to the socket failed.
    TransportClose,
    TransportError,
    PingTimeout,
    ParseError,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientDisconnect => "client namespace disconnect",
            Self::TransportClose => "transport close",
            Self::TransportError => "transport error",
            Self::PingTimeout => "ping timeout",
            Self::ParseError => "parse error",
        }
    }
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;
type BroadcastRx = broadcast::Receiver<Arc<BroadcastPayload>>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, headers, state))
}

async fn handle_connection(socket: WebSocket, headers: HeaderMap, state: AppState) {
    let (mut ws_tx, ws_rx) = socket.split();

    // Subscribe before the connect event so the first snapshot isn't missed.
    let mut broadcast_rx = state.presence.subscribe();
    let connected = state.presence.connect(&headers).await;
    let mut session = GatewaySession::new(connected.connection_id, connected.domain);

    tracing::info!(
        connection_id = %session.connection_id,
        domain = %session.domain(),
        "gateway connection established"
    );

    let reason = match greet(&state, &session, &mut ws_tx, &mut broadcast_rx).await {
        Ok(()) => run_session(&state, &mut session, ws_tx, ws_rx, broadcast_rx).await,
        Err(reason) => reason,
    };

    state
        .presence
        .disconnect(&session.connection_id, reason.as_str());

    tracing::info!(
        connection_id = %session.connection_id,
        domain = %session.domain(),
        reason = reason.as_str(),
        "gateway connection ended"
    );
}

/// Deliver the snapshot produced by this connection's own connect event,
/// then the `connected` acknowledgement.
async fn greet(
    state: &AppState,
    session: &GatewaySession,
    ws_tx: &mut WsSink,
    broadcast_rx: &mut BroadcastRx,
) -> Result<(), DisconnectReason> {
    loop {
        let result = broadcast_rx.recv().await;
        // After a lag the resync snapshot already includes our own connect.
        let done = match &result {
            Ok(payload) => payload.connection_id == session.connection_id,
            Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        };

        match forward_traffic(&state.presence, session, result) {
            Forward::Send(msg) => {
                if send_message(ws_tx, &msg).await.is_err() {
                    return Err(DisconnectReason::TransportClose);
                }
            }
            Forward::Skip => {}
            Forward::Closed => return Err(DisconnectReason::TransportClose),
        }

        if done {
            break;
        }
    }

    let payload = ConnectedPayload {
        domain: session.domain().to_string(),
        connection_id: session.connection_id.clone(),
        heartbeat_interval: state.config.heartbeat_interval_ms,
    };
    let ack = GatewayMessage::dispatch(
        EventName::CONNECTED,
        serde_json::to_value(&payload).unwrap_or_default(),
    );
    send_message(ws_tx, &ack)
        .await
        .map_err(|_| DisconnectReason::TransportClose)
}

/// Main session event loop: read client messages, forward `traffic` for the
/// joined domain, enforce heartbeat. Returns why the connection ended.
async fn run_session(
    state: &AppState,
    session: &mut GatewaySession,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut broadcast_rx: BroadcastRx,
) -> DisconnectReason {
    // The client must heartbeat within 1.5x the interval of the previous one.
    let heartbeat_timeout = heartbeat_deadline(state.config.heartbeat_interval_ms);
    let heartbeat_expiry = time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_expiry);

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                return DisconnectReason::ParseError;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                heartbeat_expiry
                                    .as_mut()
                                    .reset(time::Instant::now() + heartbeat_timeout);
                                let payload: HeartbeatPayload = serde_json::from_value(client_msg.d)
                                    .unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                if send_message(&mut ws_tx, &ack).await.is_err() {
                                    return DisconnectReason::TransportClose;
                                }
                            }
                            OP_DISPATCH => {
                                // Unknown events are ignored.
                                if client_msg.t.as_deref() == Some(EventName::SET_DOMAIN) {
                                    let rebound = state
                                        .presence
                                        .set_domain(&session.connection_id, client_msg.domain_arg())
                                        .await;
                                    if let Some(rebound) = rebound {
                                        tracing::debug!(
                                            connection_id = %session.connection_id,
                                            from = %rebound.from,
                                            to = %rebound.to,
                                            "session switched domain channel"
                                        );
                                        session.join(rebound.to);
                                    }
                                }
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                return DisconnectReason::ParseError;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return DisconnectReason::ClientDisconnect,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        state.presence.transport_error(&session.connection_id, &e);
                        return DisconnectReason::TransportError;
                    }
                }
            }

            // Snapshot from the broadcast hub.
            result = broadcast_rx.recv() => {
                match forward_traffic(&state.presence, session, result) {
                    Forward::Send(msg) => {
                        if send_message(&mut ws_tx, &msg).await.is_err() {
                            return DisconnectReason::TransportClose;
                        }
                    }
                    Forward::Skip => {}
                    Forward::Closed => return DisconnectReason::TransportClose,
                }
            }

            () = &mut heartbeat_expiry => {
                tracing::debug!(
                    connection_id = %session.connection_id,
                    "heartbeat timeout, closing connection"
                );
                let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                return DisconnectReason::PingTimeout;
            }
        }
    }
}

/// How long a session may go without a heartbeat.
fn heartbeat_deadline(interval_ms: u64) -> Duration {
    let interval_ms = interval_ms.min(MAX_HEARTBEAT_INTERVAL_MS);
    Duration::from_millis(interval_ms.saturating_mul(3) / 2)
}

/// What a session does with one broadcast receive.
#[derive(Debug)]
enum Forward {
    Send(GatewayMessage),
    Skip,
    Closed,
}

/// Turn a broadcast receive into a `traffic` dispatch for the session's
/// joined domain. A lagged receiver may have lost that domain's latest
/// snapshot, so it is re-read from the table.
fn forward_traffic(
    presence: &PresenceService,
    session: &GatewaySession,
    result: Result<Arc<BroadcastPayload>, broadcast::error::RecvError>,
) -> Forward {
    let stats = match result {
        Ok(payload) if session.is_subscribed(&payload.domain) => payload.stats.clone(),
        Ok(_) => return Forward::Skip,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(
                connection_id = %session.connection_id,
                skipped,
                "gateway session lagged behind broadcast, resyncing"
            );
            match presence.stats(session.domain()) {
                Some(stats) => stats,
                None => return Forward::Skip,
            }
        }
        Err(broadcast::error::RecvError::Closed) => return Forward::Closed,
    };

    Forward::Send(GatewayMessage::dispatch(
        EventName::TRAFFIC,
        serde_json::to_value(&stats).unwrap_or_default(),
    ))
}

/// Serialize and send one gateway message.
async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    match msg.encode() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(err) => {
            tracing::error!(%err, "failed to encode gateway message");
            Ok(())
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    fn traffic_users(forward: Forward) -> u64 {
        match forward {
            Forward::Send(msg) => {
                assert_eq!(msg.t.as_deref(), Some(EventName::TRAFFIC));
                msg.d["currentUsers"].as_u64().unwrap()
            }
            other => panic!("expected a traffic dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagged_session_resyncs_its_domain() {
        let presence = PresenceService::new(Arc::new(MemoryStore::new()), "test:watermarks");
        let session = GatewaySession::new("a1".into(), "a.com".into());
        let mut rx = presence.subscribe();

        presence.connect_to("a1".into(), "a.com".into()).await;
        presence.connect_to("a2".into(), "a.com".into()).await;
        // Enough traffic elsewhere to push both a.com snapshots out of the
        // channel before this receiver reads anything.
        for i in 0..4096 {
            presence
                .connect_to(format!("o{i}"), format!("other{}.com", i % 8))
                .await;
        }

        let result = rx.recv().await;
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(traffic_users(forward_traffic(&presence, &session, result)), 2);
    }

    #[tokio::test]
    async fn other_domains_are_skipped() {
        let presence = PresenceService::new(Arc::new(MemoryStore::new()), "test:watermarks");
        let session = GatewaySession::new("a1".into(), "a.com".into());
        let mut rx = presence.subscribe();

        presence.connect_to("b1".into(), "b.com".into()).await;
        presence.connect_to("a1".into(), "a.com".into()).await;

        assert!(matches!(
            forward_traffic(&presence, &session, rx.recv().await),
            Forward::Skip
        ));
        assert_eq!(
            traffic_users(forward_traffic(&presence, &session, rx.recv().await)),
            1
        );
    }

    #[test]
    fn heartbeat_deadline_is_one_and_a_half_intervals() {
        assert_eq!(heartbeat_deadline(200), Duration::from_millis(300));
        assert_eq!(heartbeat_deadline(25_000), Duration::from_millis(37_500));
    }

    #[test]
    fn heartbeat_deadline_clamps_huge_intervals() {
        assert_eq!(
            heartbeat_deadline(u64::MAX),
            Duration::from_millis(MAX_HEARTBEAT_INTERVAL_MS * 3 / 2)
        );
    }

    #[test]
    fn disconnect_reasons_are_distinct() {
        let reasons = [
            DisconnectReason::ClientDisconnect,
            DisconnectReason::TransportClose,
            DisconnectReason::TransportError,
            DisconnectReason::PingTimeout,
            DisconnectReason::ParseError,
        ];
        let mut names: Vec<_> = reasons.iter().map(|r| r.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), reasons.len());
    }
}
