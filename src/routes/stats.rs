//! Store-wide counters
//!
//! - GET /api/v1/stats

use axum::{extract::State, routing::get, Json, Router};

use crate::service::ServiceStats;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_stats))
}

async fn get_stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.service().stats())
}
