//! Axum WebSocket upgrade handler for rover links.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::Extensions;
use axum::response::IntoResponse;

use super::connection::run_link;
use crate::app_state::AppState;

/// `GET /ws`: Upgrade to a rover link.
///
/// The peer address is recorded when the server was started with connect
/// info; otherwise the rover's address stays unknown.
#[utoipa::path(
    get,
    path = "/ws",
    tag = "Links",
    summary = "Open a rover link",
    description = "WebSocket upgrade. Each text frame carries one `{type, payload}` envelope; the first frame from a rover should be `registration`.",
    responses(
        (status = 101, description = "Switching protocols"),
        (status = 400, description = "Not a WebSocket upgrade request"),
    )
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    extensions: Extensions,
) -> impl IntoResponse {
    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let registry = Arc::clone(&state.registry);
    let capacity = state.outbound_queue_capacity;

    ws.on_upgrade(move |socket| run_link(socket, registry, remote_addr, capacity))
}
