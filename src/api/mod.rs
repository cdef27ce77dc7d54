//! REST API layer: route handlers, DTOs, OpenAPI document and router
//! composition.
//!
//! Resource endpoints are mounted under `/api/v1`; `/health` and the
//! rover link upgrade `/ws` sit at the root.

pub mod dto;
pub mod handlers;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::server::handler::ws_handler;

/// OpenAPI document for the REST surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "rover-link",
        description = "Relays telemetry and commands between rovers and a central server."
    ),
    paths(
        handlers::system::health_handler,
        handlers::rovers::list_rovers,
        handlers::rovers::get_rover,
        handlers::rovers::get_telemetry,
        handlers::rovers::dispatch_command,
        handlers::rovers::command_history,
        handlers::rovers::forget_session,
        handlers::sessions::list_sessions,
        crate::server::handler::ws_handler,
    ),
    components(schemas(
        crate::error::ErrorResponse,
        crate::error::ErrorBody,
        dto::DispatchCommandRequest,
        dto::RoverDetail,
        crate::server::PendingCommand,
        crate::server::SessionInfo,
    )),
    tags(
        (name = "System", description = "Service health"),
        (name = "Rovers", description = "Rover records, telemetry and commands"),
        (name = "Sessions", description = "Live rover sessions"),
        (name = "Links", description = "Rover WebSocket links"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );
    #[cfg(not(feature = "swagger-ui"))]
    let router = router.route(
        "/api-docs/openapi.json",
        get(|| async { axum::Json(ApiDoc::openapi()) }),
    );

    router
}

/// Builds the full application: REST routes, the `/ws` link endpoint and
/// the HTTP middleware stack.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(build_router())
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::protocol::{Envelope, MessageType};
    use crate::server::{LinkHandle, LinkReceiver};
    use crate::storage::{MemoryStorage, Storage};

    fn state() -> AppState {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        AppState::new(storage, 16)
    }

    async fn connect(state: &AppState, rover_id: &str) -> LinkReceiver {
        let (handle, mut rx) = LinkHandle::channel(None, 16);
        let link = handle.id();
        state.registry.on_link_open(handle).await;
        let frame = crate::protocol::encode(&Envelope::registration(rover_id));
        let Ok(()) = state.registry.handle_frame(link, &frame).await else {
            panic!("registration should succeed");
        };
        let Ok(ack) = rx.outbound.try_recv() else {
            panic!("ack expected");
        };
        assert_eq!(ack.msg_type, MessageType::RegistrationAck);
        rx
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let Ok(response) = app.oneshot(request).await else {
            panic!("router is infallible");
        };
        let status = response.status();
        let Ok(bytes) = axum::body::to_bytes(response.into_body(), usize::MAX).await else {
            panic!("body should be readable");
        };
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        let Ok(request) = Request::get(uri).body(Body::empty()) else {
            panic!("valid request");
        };
        request
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        let Ok(request) = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
        else {
            panic!("valid request");
        };
        request
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (status, body) = call(build_app(state()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn unknown_rover_is_404() {
        let (status, body) = call(build_app(state()), get("/api/v1/rovers/R-404")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], 2001);
    }

    #[tokio::test]
    async fn dispatch_to_disconnected_rover_is_409() {
        let request = post_json(
            "/api/v1/rovers/R-001/commands",
            &serde_json::json!({"command": "move_forward"}),
        );
        let (status, body) = call(build_app(state()), request).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], 2002);
    }

    #[tokio::test]
    async fn dispatch_to_connected_rover_is_accepted() {
        let state = state();
        let mut rx = connect(&state, "R-001").await;

        let request = post_json(
            "/api/v1/rovers/R-001/commands",
            &serde_json::json!({"command": "move_forward"}),
        );
        let (status, body) = call(build_app(state.clone()), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["command_id"], 1);

        let Ok(sent) = rx.outbound.try_recv() else {
            panic!("command frame expected");
        };
        assert_eq!(sent.msg_type, MessageType::Command);

        let (status, body) = call(build_app(state.clone()), get("/api/v1/rovers/R-001")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["identifier"], "R-001");
        assert_eq!(body["is_connected"], true);
        assert_eq!(body["pending_commands"].as_array().map(Vec::len), Some(1));

        let (status, body) =
            call(build_app(state), get("/api/v1/rovers/R-001/commands?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["command"], "move_forward");
        assert_eq!(body[0]["origin"], "server");
    }

    #[tokio::test]
    async fn sessions_and_rovers_are_listed() {
        let state = state();
        let _rx = connect(&state, "R-002").await;

        let (status, body) = call(build_app(state.clone()), get("/api/v1/sessions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["identifier"], "R-002");

        let (status, body) = call(build_app(state.clone()), get("/api/v1/rovers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, body) =
            call(build_app(state), get("/api/v1/rovers/R-002/telemetry")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn forgetting_a_live_session_is_409() {
        let state = state();
        let _rx = connect(&state, "R-003").await;
        let Ok(request) = Request::delete("/api/v1/rovers/R-003/session").body(Body::empty())
        else {
            panic!("valid request");
        };
        let (status, body) = call(build_app(state), request).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], 2003);
    }

    #[test]
    fn openapi_lists_rover_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v1/rovers/{identifier}/commands"));
        assert!(doc.paths.paths.contains_key("/health"));
    }
}
