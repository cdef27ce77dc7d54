//! Rover handlers: records, telemetry, command dispatch and history.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};

use crate::api::dto::{DispatchCommandRequest, LimitParams, RoverDetail};
use crate::app_state::AppState;
use crate::error::{ErrorResponse, ServerError};
use crate::server::PendingCommand;
use crate::storage::{CommandLog, Rover, RoverSession, TelemetrySample};

async fn find_rover(state: &AppState, identifier: &str) -> Result<Rover, ServerError> {
    state
        .storage
        .get_rover_by_identifier(identifier)
        .await?
        .ok_or_else(|| ServerError::RoverNotFound(identifier.to_string()))
}

/// `GET /rovers`: List every known rover.
///
/// # Errors
///
/// Returns [`ServerError::Storage`] on persistence failure.
#[utoipa::path(
    get,
    path = "/api/v1/rovers",
    tag = "Rovers",
    summary = "List rovers",
    description = "Returns every rover that has ever registered, ordered by id.",
    responses(
        (status = 200, description = "Rover list", body = Vec<Rover>),
        (status = 500, description = "Storage failure", body = ErrorResponse),
    )
)]
pub async fn list_rovers(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    let rovers = state.storage.list_rovers().await?;
    Ok(Json(rovers))
}

/// `GET /rovers/{identifier}`: One rover with its live session.
///
/// # Errors
///
/// Returns [`ServerError::RoverNotFound`] for an unknown identifier.
#[utoipa::path(
    get,
    path = "/api/v1/rovers/{identifier}",
    tag = "Rovers",
    summary = "Get rover",
    params(("identifier" = String, Path, description = "Rover identity, e.g. `R-001`")),
    responses(
        (status = 200, description = "Rover detail", body = RoverDetail),
        (status = 404, description = "Unknown rover", body = ErrorResponse),
    )
)]
pub async fn get_rover(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let rover = find_rover(&state, &identifier).await?;
    let session = state
        .registry
        .active_sessions()
        .await
        .into_iter()
        .find(|session| session.identifier == identifier);
    let pending_commands = state.registry.pending_commands(&identifier).await;

    Ok(Json(RoverDetail {
        rover,
        session,
        pending_commands,
    }))
}

/// `GET /rovers/{identifier}/telemetry`: Recent telemetry, newest first.
///
/// # Errors
///
/// Returns [`ServerError::RoverNotFound`] for an unknown identifier.
#[utoipa::path(
    get,
    path = "/api/v1/rovers/{identifier}/telemetry",
    tag = "Rovers",
    summary = "Telemetry history",
    params(
        ("identifier" = String, Path, description = "Rover identity"),
        LimitParams,
    ),
    responses(
        (status = 200, description = "Telemetry samples, newest first", body = Vec<TelemetrySample>),
        (status = 404, description = "Unknown rover", body = ErrorResponse),
    )
)]
pub async fn get_telemetry(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ServerError> {
    let rover = find_rover(&state, &identifier).await?;
    let samples = state
        .storage
        .get_telemetry_by_rover(rover.id, params.clamped())
        .await?;
    Ok(Json(samples))
}

/// `POST /rovers/{identifier}/commands`: Send a command to a live rover.
///
/// Returns as soon as the command is queued; poll the command history for
/// its outcome.
///
/// # Errors
///
/// Returns [`ServerError::NoActiveSession`] if the rover is not connected
/// and [`ServerError::InvalidRequest`] for empty command text.
#[utoipa::path(
    post,
    path = "/api/v1/rovers/{identifier}/commands",
    tag = "Rovers",
    summary = "Dispatch command",
    params(("identifier" = String, Path, description = "Rover identity")),
    request_body = DispatchCommandRequest,
    responses(
        (status = 202, description = "Command sent, awaiting response", body = PendingCommand),
        (status = 400, description = "Empty command", body = ErrorResponse),
        (status = 409, description = "Rover not connected", body = ErrorResponse),
    )
)]
pub async fn dispatch_command(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Json(req): Json<DispatchCommandRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let pending = state
        .registry
        .dispatch_command(&identifier, &req.command)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(pending)))
}

/// `GET /rovers/{identifier}/commands`: Command history, newest first.
///
/// # Errors
///
/// Returns [`ServerError::RoverNotFound`] for an unknown identifier.
#[utoipa::path(
    get,
    path = "/api/v1/rovers/{identifier}/commands",
    tag = "Rovers",
    summary = "Command history",
    params(
        ("identifier" = String, Path, description = "Rover identity"),
        LimitParams,
    ),
    responses(
        (status = 200, description = "Command log rows, newest first", body = Vec<CommandLog>),
        (status = 404, description = "Unknown rover", body = ErrorResponse),
    )
)]
pub async fn command_history(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ServerError> {
    let rover = find_rover(&state, &identifier).await?;
    let logs = state
        .storage
        .get_command_logs_by_rover(rover.id, params.clamped())
        .await?;
    Ok(Json(logs))
}

/// `DELETE /rovers/{identifier}/session`: Delete a disconnected rover's
/// session record.
///
/// # Errors
///
/// Returns [`ServerError::SessionStillActive`] while the rover is connected
/// and [`ServerError::RoverNotFound`] if there is no record.
#[utoipa::path(
    delete,
    path = "/api/v1/rovers/{identifier}/session",
    tag = "Rovers",
    summary = "Forget session record",
    params(("identifier" = String, Path, description = "Rover identity")),
    responses(
        (status = 200, description = "Deleted session record", body = RoverSession),
        (status = 404, description = "No session record", body = ErrorResponse),
        (status = 409, description = "Rover still connected", body = ErrorResponse),
    )
)]
pub async fn forget_session(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.registry.forget_session(&identifier).await?;
    Ok(Json(session))
}

/// Rover routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/rovers", get(list_rovers))
        .route("/rovers/{identifier}", get(get_rover))
        .route("/rovers/{identifier}/telemetry", get(get_telemetry))
        .route(
            "/rovers/{identifier}/commands",
            get(command_history).post(dispatch_command),
        )
        .route("/rovers/{identifier}/session", delete(forget_session))
}
