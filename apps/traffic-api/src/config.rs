use std::time::Duration;

/// Traffic API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis connection string. When unset, watermarks live in process memory
    /// and do not survive a restart.
    pub redis_url: Option<String>,
    /// Hash key under which per-domain watermark records are stored.
    pub watermark_collection: String,
    /// Upper bound for a single storage round-trip.
    pub store_timeout: Duration,
    /// Interval clients are told to heartbeat at.
    pub heartbeat_interval_ms: u64,
}

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_WATERMARK_COLLECTION: &str = "traffic:watermarks";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;
/// Larger heartbeat intervals are clamped to one day.
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 86_400_000;

impl Config {
    /// Load configuration from environment variables. Every variable is
    /// optional; unparseable values fall back to their defaults.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT").unwrap_or(DEFAULT_PORT),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            watermark_collection: std::env::var("WATERMARK_COLLECTION")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_WATERMARK_COLLECTION.to_string()),
            store_timeout: Duration::from_millis(
                parsed_var("STORE_TIMEOUT_MS").unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
            heartbeat_interval_ms: parsed_var("HEARTBEAT_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(|ms: u64| ms.min(MAX_HEARTBEAT_INTERVAL_MS))
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            redis_url: None,
            watermark_collection: DEFAULT_WATERMARK_COLLECTION.to_string(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
