pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::presence::PresenceService;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub presence: Arc<PresenceService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the presence service to `store`. Must run inside a tokio runtime.
    pub fn new(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        let presence = PresenceService::new(store, &config.watermark_collection);
        Self {
            presence: Arc::new(presence),
            config: Arc::new(config),
        }
    }
}
