//! Domain presence: turns connect / setDomain / disconnect events into counter
//! mutations, watermark writes and `traffic` broadcasts.
//!
//! Each connection moves `Unbound -> BoundToDomain(D) -> Disconnected`. Every
//! mutation publishes the affected domain's post-mutation snapshot; a raised
//! watermark is queued for persistence before that publish, but the write
//! itself happens in the background.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tokio::sync::broadcast;
use traffic_common::{ConnectionId, PrefixedId};

use crate::db::kv::KeyValueStore;

use super::fanout::{BroadcastPayload, GatewayBroadcast};
use super::registry::ConnectionRegistry;
use super::resolver::resolve_domain;
use super::stats::{local_clock, Clock, Delta, DomainStats, DomainStatsTable, StatsEntry};
use super::watermark::WatermarkWriter;

/// Acknowledgement for a processed connect event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub domain: String,
    pub connection_id: String,
}

/// Result of a rebind that actually moved the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebound {
    pub from: String,
    pub to: String,
}

pub struct PresenceService {
    table: DomainStatsTable,
    registry: ConnectionRegistry,
    broadcast: GatewayBroadcast,
    writer: WatermarkWriter,
}

impl PresenceService {
    /// Build a service backed by `store`, with watermark records kept under
    /// the `collection` hash key. Spawns the watermark writer, so this must be
    /// called from within a tokio runtime.
    pub fn new(store: Arc<dyn KeyValueStore>, collection: &str) -> Self {
        Self::with_clock(store, collection, local_clock())
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, collection: &str, clock: Clock) -> Self {
        Self {
            table: DomainStatsTable::new(store.clone(), collection, clock),
            registry: ConnectionRegistry::new(),
            broadcast: GatewayBroadcast::new(),
            writer: WatermarkWriter::spawn(store, collection),
        }
    }

    /// Receiver for every domain's `traffic` snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.broadcast.subscribe()
    }

    /// Process a new connection: resolve its domain from the handshake headers
    /// and bind it under a freshly generated identity.
    pub async fn connect(&self, headers: &HeaderMap) -> Connected {
        let domain = resolve_domain(headers);
        self.connect_to(ConnectionId::generate(), domain).await
    }

    /// Process a new connection whose identity and domain are already known.
    pub async fn connect_to(&self, connection_id: String, domain: String) -> Connected {
        self.table.get_or_create(&domain).await;

        self.registry.bind(&connection_id, &domain);
        let stats = self.mutate(&domain, Delta::Increment, &connection_id);

        tracing::debug!(
            %connection_id,
            %domain,
            current_users = stats.current_users,
            "connection bound"
        );

        Connected {
            domain,
            connection_id,
        }
    }

    /// Move a connection to `new_domain`.
    ///
    /// No-op (no counter change, no broadcast) when `new_domain` is absent or
    /// empty, equals the current domain, or the connection is not bound.
    pub async fn set_domain(&self, connection_id: &str, new_domain: Option<&str>) -> Option<Rebound> {
        let new_domain = new_domain.filter(|d| !d.is_empty())?;
        let current = self.registry.domain_of(connection_id)?;
        if current == new_domain {
            return None;
        }

        self.table.get_or_create(new_domain).await;

        let old_domain = self.registry.rebind(connection_id, new_domain)?;
        self.mutate(&old_domain, Delta::Decrement, connection_id);
        self.mutate(new_domain, Delta::Increment, connection_id);

        tracing::debug!(%connection_id, from = %old_domain, to = %new_domain, "connection rebound");

        Some(Rebound {
            from: old_domain,
            to: new_domain.to_string(),
        })
    }

    /// Process a disconnect. The reason is logged only. Returns the domain's
    /// new stats, or `None` if the connection was not bound (duplicate or late
    /// disconnect), in which case nothing changes.
    pub fn disconnect(&self, connection_id: &str, reason: &str) -> Option<DomainStats> {
        let domain = self.registry.unbind(connection_id)?;
        let stats = self.mutate(&domain, Delta::Decrement, connection_id);

        tracing::debug!(
            %connection_id,
            %domain,
            %reason,
            current_users = stats.current_users,
            "connection unbound"
        );

        Some(stats)
    }

    /// Record a transport-level error. Counters are left to the disconnect
    /// that follows.
    pub fn transport_error(&self, connection_id: &str, err: &dyn Display) {
        tracing::warn!(%connection_id, %err, "gateway transport error");
    }

    /// Copy of the whole stats table.
    pub fn snapshot(&self) -> BTreeMap<String, StatsEntry> {
        self.table.snapshot()
    }

    pub fn stats(&self, domain: &str) -> Option<DomainStats> {
        self.table.get(domain)
    }

    pub fn domain_of(&self, connection_id: &str) -> Option<String> {
        self.registry.domain_of(connection_id)
    }

    /// Number of live connections bound in this process.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Wait for every watermark write queued so far.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Apply `delta` to `domain`; inside the same critical section queue a
    /// raised watermark for persistence and publish the snapshot.
    fn mutate(&self, domain: &str, delta: Delta, connection_id: &str) -> DomainStats {
        let (stats, _) = self.table.apply_delta(domain, delta, |stats, raised| {
            if raised {
                self.writer.persist(&stats.domain, stats.watermark());
            }
            self.broadcast.publish(stats, connection_id);
        });
        stats
    }
}
