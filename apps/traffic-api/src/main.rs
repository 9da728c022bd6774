use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::http::Method;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use traffic_api::config::Config;
use traffic_api::db::kv::{KeyValueStore, MemoryStore, RedisStore};
use traffic_api::AppState;

#[tokio::main]
async fn main() {
    // .env is optional; fall back to the one next to the manifest.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let kv = watermark_store(&config).await;

    tracing::info!(
        collection = %config.watermark_collection,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        "traffic-api configured"
    );

    let state = AppState::new(config, kv);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    let app = Router::new()
        .merge(traffic_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "traffic-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Give queued watermark writes a chance to land before exiting.
    state.presence.flush().await;
    tracing::info!("traffic-api stopped");
}

/// Redis when `REDIS_URL` is set and reachable, otherwise process memory.
async fn watermark_store(config: &Config) -> Arc<dyn KeyValueStore> {
    let Some(redis_url) = config.redis_url.as_deref() else {
        tracing::warn!("REDIS_URL not set, watermarks will not survive a restart");
        return Arc::new(MemoryStore::new());
    };

    match RedisStore::connect(redis_url, config.store_timeout).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::warn!(%err, "redis unavailable, falling back to in-memory watermarks");
            Arc::new(MemoryStore::new())
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
