//! Stored records and their create/update inputs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::protocol::{CommandStatus, TelemetryReading};

/// A registered rover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Rover {
    /// Auto-assigned row id.
    pub id: i64,
    /// Identity string supplied by the rover at registration.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// Last-known network address of the rover's link.
    pub address: Option<String>,
    /// Whether the rover currently has an active session.
    pub is_connected: bool,
    /// Last reported battery level, percent.
    pub battery_level: Option<f64>,
    /// Time of the last frame received from the rover.
    pub last_seen: Option<DateTime<Utc>>,
    /// Free-form metadata.
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Input for [`super::Storage::create_rover`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewRover {
    /// Identity string.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// Network address of the registering link.
    pub address: Option<String>,
    /// Initial connectivity flag.
    pub is_connected: bool,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
}

/// Partial update for [`super::Storage::update_rover`]. `None` leaves a
/// column unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoverUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New network address.
    pub address: Option<String>,
    /// New connectivity flag.
    pub is_connected: Option<bool>,
    /// New battery level.
    pub battery_level: Option<f64>,
    /// New last-seen time.
    pub last_seen: Option<DateTime<Utc>>,
    /// Replacement metadata.
    pub metadata: Option<serde_json::Value>,
}

/// An append-only sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TelemetrySample {
    /// Auto-assigned row id.
    pub id: i64,
    /// Owning rover row id.
    pub rover_id: i64,
    /// Sensor readings.
    #[serde(flatten)]
    pub reading: TelemetryReading,
    /// Server receipt time.
    pub recorded_at: DateTime<Utc>,
}

/// Input for [`super::Storage::create_telemetry`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTelemetrySample {
    /// Owning rover row id.
    pub rover_id: i64,
    /// Sensor readings.
    pub reading: TelemetryReading,
    /// Server receipt time.
    pub recorded_at: DateTime<Utc>,
}

/// Where a logged command was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    /// Dispatched by the server through the session registry.
    Server,
    /// Issued on the rover and reported after execution.
    Local,
}

impl CommandOrigin {
    /// Returns the stored representation of this origin.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for CommandOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown command origin: {other}")),
        }
    }
}

/// A logged command and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CommandLog {
    /// Auto-assigned row id.
    pub id: i64,
    /// Owning rover row id.
    pub rover_id: i64,
    /// Session-scoped command id, absent for local commands.
    pub command_id: Option<i64>,
    /// Command text.
    pub command: String,
    /// Who issued the command.
    pub origin: CommandOrigin,
    /// Current status.
    pub status: CommandStatus,
    /// Result text reported by the rover, or the failure reason.
    pub response: Option<String>,
    /// Dispatch time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Input for [`super::Storage::create_command_log`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommandLog {
    /// Owning rover row id.
    pub rover_id: i64,
    /// Session-scoped command id.
    pub command_id: Option<i64>,
    /// Command text.
    pub command: String,
    /// Who issued the command.
    pub origin: CommandOrigin,
    /// Initial status.
    pub status: CommandStatus,
    /// Initial response text.
    pub response: Option<String>,
}

/// Status change for [`super::Storage::update_command_log`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLogUpdate {
    /// New status.
    pub status: CommandStatus,
    /// Result text or failure reason.
    pub response: Option<String>,
}

/// Persisted rover-client session. Its `id` is the numeric rover-client id
/// sent back in `registration_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RoverSession {
    /// Rover-client id.
    pub id: i64,
    /// Owning rover row id.
    pub rover_id: i64,
    /// Rover identity string.
    pub identifier: String,
    /// Whether a link is currently bound.
    pub is_connected: bool,
    /// Last ping or pong observed on the link.
    pub last_ping: DateTime<Utc>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Input for [`super::Storage::create_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoverSession {
    /// Owning rover row id.
    pub rover_id: i64,
    /// Rover identity string.
    pub identifier: String,
    /// Initial connectivity flag.
    pub is_connected: bool,
    /// Initial liveness timestamp.
    pub last_ping: DateTime<Utc>,
}

/// Partial update for [`super::Storage::update_session`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    /// New connectivity flag.
    pub is_connected: Option<bool>,
    /// New liveness timestamp.
    pub last_ping: Option<DateTime<Utc>>,
}
