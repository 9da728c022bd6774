pub mod health;
pub mod stats;

use axum::http::Uri;
use axum::Router;
use utoipa::OpenApi;

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(stats::router())
        .merge(crate::gateway::server::router())
        .fallback(not_found)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        stats::get_stats,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::gateway::stats::StatsEntry,
            crate::gateway::stats::DomainStats,
            health::HealthResponse,
            stats::StatsResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Stats", description = "Per-domain traffic statistics"),
    )
)]
pub struct ApiDoc;
