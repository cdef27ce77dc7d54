//! Live session listing.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::server::SessionInfo;

/// `GET /sessions`: Currently connected rovers.
#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "Sessions",
    summary = "List live sessions",
    responses(
        (status = 200, description = "Live sessions ordered by rover identity", body = Vec<SessionInfo>),
    )
)]
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.active_sessions().await)
}

/// Session routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sessions", get(list_sessions))
}
