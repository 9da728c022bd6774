use std::collections::BTreeMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::gateway::stats::StatsEntry;
use crate::AppState;

/// Every domain this process has seen, keyed by domain.
#[derive(Debug, Serialize, ToSchema)]
#[serde(transparent)]
pub struct StatsResponse(pub BTreeMap<String, StatsEntry>);

pub fn router() -> Router<AppState> {
    Router::new().route("/stats", get(get_stats))
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "Stats",
    responses(
        (status = 200, description = "Per-domain live and peak counts", body = StatsResponse),
    )
)]
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse(state.presence.snapshot()))
}
