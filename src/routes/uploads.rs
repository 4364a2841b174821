//! In-flight upload listing
//!
//! - GET /api/v1/uploads - Snapshot of every live upload session

use axum::{extract::State, routing::get, Json, Router};

use crate::state::AppState;
use crate::upload::SessionSnapshot;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_uploads))
}

async fn list_uploads(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.service().active_uploads())
}
