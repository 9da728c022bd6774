//! Broadcast hub delivering `traffic` snapshots to gateway sessions.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each session subscribes
//! once and filters payloads locally by the domain channel it has joined.
//! Publishing is a non-blocking send, so it can run inside the per-domain
//! critical section and keep each domain's snapshots in mutation order.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::stats::DomainStats;

/// Capacity of the broadcast channel. Slow receivers that fall behind skip
/// messages (RecvError::Lagged) and must re-read the table to resync.
const BROADCAST_CAPACITY: usize = 4096;

/// A domain snapshot broadcast to all connected sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    /// The domain channel this snapshot belongs to.
    pub domain: String,
    pub stats: DomainStats,
    /// The connection whose event produced this snapshot.
    pub connection_id: String,
}

/// The process-wide broadcast hub.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the broadcast channel. Each gateway session should call
    /// this once, before its connect event is processed, so it sees its own
    /// first snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Publish `stats` to every subscriber of its domain, tagged with the
    /// connection that caused the change.
    pub fn publish(&self, stats: &DomainStats, connection_id: &str) {
        // Err only means nobody is subscribed.
        let _ = self.sender.send(Arc::new(BroadcastPayload {
            domain: stats.domain.clone(),
            stats: stats.clone(),
            connection_id: connection_id.to_string(),
        }));
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
