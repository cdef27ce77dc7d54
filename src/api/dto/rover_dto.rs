//! Rover and command request/response bodies.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::server::{PendingCommand, SessionInfo};
use crate::storage::Rover;

/// Body of `POST /rovers/{identifier}/commands`.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct DispatchCommandRequest {
    /// Command text forwarded to the rover (e.g. `"move_forward"`).
    pub command: String,
}

/// A rover record with its live session, if any.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoverDetail {
    /// Stored rover record.
    #[serde(flatten)]
    pub rover: Rover,
    /// Live session, when the rover is connected.
    pub session: Option<SessionInfo>,
    /// Commands awaiting a response on the live session.
    pub pending_commands: Vec<PendingCommand>,
}
