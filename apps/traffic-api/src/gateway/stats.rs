//! Per-domain traffic counters and the durable peak watermark.
//!
//! `current_users` is ephemeral and starts at zero on every process start.
//! The watermark (`max_current_users` + `max_reached_at`) is seeded from the
//! key-value store the first time a domain is referenced.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

/// Layout of `max_reached_at`: local wall-clock time, day first.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Produces the timestamp recorded when a watermark is raised.
pub type Clock = Arc<dyn Fn() -> String + Send + Sync>;

/// The default clock: local time formatted with [`TIMESTAMP_FORMAT`].
pub fn local_clock() -> Clock {
    Arc::new(|| chrono::Local::now().format(TIMESTAMP_FORMAT).to_string())
}

/// The durable part of a domain's stats. This is the only thing ever written
/// to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub max_current_users: u64,
    #[serde(default)]
    pub max_reached_at: Option<String>,
}

impl Watermark {
    /// Parse a stored record. Unknown fields (such as a stale live count) are
    /// ignored; anything that does not fit the shape yields `None`.
    ///
    /// A positive peak must carry its timestamp, and a zero peak never does.
    pub fn decode(raw: &str) -> Option<Self> {
        let mut watermark: Watermark = serde_json::from_str(raw).ok()?;
        if watermark.max_current_users == 0 {
            watermark.max_reached_at = None;
        } else if watermark.max_reached_at.is_none() {
            return None;
        }
        Some(watermark)
    }

    pub fn encode(&self) -> Result<String, ApiError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Counter direction for [`DomainStatsTable::apply_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Increment,
    Decrement,
}

/// Live stats for one domain. Serializes as the `traffic` event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainStats {
    pub domain: String,
    pub current_users: u64,
    pub max_current_users: u64,
    pub max_reached_at: Option<String>,
}

/// One value of the `/stats` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsEntry {
    pub current_users: u64,
    pub max_current_users: u64,
    pub max_reached_at: Option<String>,
}

impl DomainStats {
    /// Build a fresh entry from whatever watermark the store held. The live
    /// count always starts at zero.
    pub fn seeded(domain: &str, watermark: Option<Watermark>) -> Self {
        let watermark = watermark.unwrap_or_default();
        Self {
            domain: domain.to_string(),
            current_users: 0,
            max_current_users: watermark.max_current_users,
            max_reached_at: watermark.max_reached_at,
        }
    }

    /// The durable fields only.
    pub fn watermark(&self) -> Watermark {
        Watermark {
            max_current_users: self.max_current_users,
            max_reached_at: self.max_reached_at.clone(),
        }
    }

    pub fn entry(&self) -> StatsEntry {
        StatsEntry {
            current_users: self.current_users,
            max_current_users: self.max_current_users,
            max_reached_at: self.max_reached_at.clone(),
        }
    }

    /// Returns `true` when the watermark was raised.
    fn apply(&mut self, delta: Delta, clock: &Clock) -> bool {
        match delta {
            Delta::Increment => self.current_users += 1,
            Delta::Decrement => self.current_users = self.current_users.saturating_sub(1),
        }

        if self.current_users > self.max_current_users {
            self.max_current_users = self.current_users;
            self.max_reached_at = Some(clock());
            true
        } else {
            false
        }
    }
}

/// In-memory table of every domain seen by this process.
///
/// Entries are created lazily and never removed. Mutations of one domain run
/// under that entry's shard lock, so concurrent increments never lose updates.
pub struct DomainStatsTable {
    entries: DashMap<String, DomainStats>,
    store: Arc<dyn KeyValueStore>,
    collection: String,
    clock: Clock,
}

impl DomainStatsTable {
    pub fn new(store: Arc<dyn KeyValueStore>, collection: impl Into<String>, clock: Clock) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            collection: collection.into(),
            clock,
        }
    }

    /// Return the entry for `domain`, seeding it from the store first if this
    /// is the first reference.
    ///
    /// The store read happens without holding any lock. If two callers race
    /// on the same new domain, the first insert wins and the other seed is
    /// discarded.
    pub async fn get_or_create(&self, domain: &str) -> DomainStats {
        if let Some(existing) = self.entries.get(domain) {
            return existing.value().clone();
        }

        let seed = self.load_watermark(domain).await;
        self.entries
            .entry(domain.to_string())
            .or_insert_with(|| DomainStats::seeded(domain, seed))
            .value()
            .clone()
    }

    /// Apply a +1/-1 change to `domain` and report whether the watermark rose.
    ///
    /// `on_commit` runs while the entry is still locked, with the post-mutation
    /// stats. Anything that must observe mutations in order (broadcast,
    /// persistence queue) belongs there. It must not touch the table.
    ///
    /// Callers are expected to have called [`get_or_create`](Self::get_or_create)
    /// first; an unseeded domain is created zero-valued.
    pub fn apply_delta<F>(&self, domain: &str, delta: Delta, on_commit: F) -> (DomainStats, bool)
    where
        F: FnOnce(&DomainStats, bool),
    {
        let mut entry = self
            .entries
            .entry(domain.to_string())
            .or_insert_with(|| DomainStats::seeded(domain, None));

        let raised = entry.apply(delta, &self.clock);
        if raised {
            tracing::debug!(
                domain = %entry.domain,
                max_current_users = entry.max_current_users,
                "watermark raised"
            );
        }
        on_commit(entry.value(), raised);

        (entry.value().clone(), raised)
    }

    pub fn get(&self, domain: &str) -> Option<DomainStats> {
        self.entries.get(domain).map(|e| e.value().clone())
    }

    /// Copy of every known domain at call time, keyed by domain.
    pub fn snapshot(&self) -> BTreeMap<String, StatsEntry> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().entry()))
            .collect()
    }

    async fn load_watermark(&self, domain: &str) -> Option<Watermark> {
        match self.store.get_field(&self.collection, domain).await {
            Ok(Some(raw)) => {
                let watermark = Watermark::decode(&raw);
                if watermark.is_none() {
                    tracing::warn!(%domain, "malformed watermark record, seeding from zero");
                }
                watermark
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%domain, %err, "watermark read failed, seeding from zero");
                None
            }
        }
    }
}
