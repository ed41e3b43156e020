use axum::{extract::State, Json};
use chrono::Utc;

use crate::api::{state::AppState, types::HealthResponse};

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
    })
}
