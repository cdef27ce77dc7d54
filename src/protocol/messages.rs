//! Link message types: the tagged envelope and its per-type payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use super::codec::DecodeError;

/// Discriminator carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Rover → Server: bind this link to a rover identity.
    Registration,
    /// Server → Rover: registration accepted, carries the rover-client id.
    RegistrationAck,
    /// Either direction: liveness probe.
    Ping,
    /// Either direction: reply to a [`MessageType::Ping`].
    Pong,
    /// Rover → Server: one sensor sample.
    Telemetry,
    /// Server → Rover: command to execute.
    Command,
    /// Rover → Server: outcome of a [`MessageType::Command`].
    CommandResponse,
    /// Rover → Server: command issued and executed on the rover itself.
    LocalCommand,
    /// Either direction: courtesy notice before closing the link.
    Disconnect,
}

impl MessageType {
    /// Returns the wire name of this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::RegistrationAck => "registration_ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Telemetry => "telemetry",
            Self::Command => "command",
            Self::CommandResponse => "command_response",
            Self::LocalCommand => "local_command",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(Self::Registration),
            "registration_ack" => Ok(Self::RegistrationAck),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "telemetry" => Ok(Self::Telemetry),
            "command" => Ok(Self::Command),
            "command_response" => Ok(Self::CommandResponse),
            "local_command" => Ok(Self::LocalCommand),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

/// One message unit exchanged over a link.
///
/// The payload is always a JSON object; typed views are obtained with
/// [`Envelope::payload_as`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Variant-specific payload.
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Builds an envelope from a typed payload.
    ///
    /// Payload types in this module always serialize to JSON objects; any
    /// other shape is replaced by an empty object.
    #[must_use]
    pub fn new<P: Serialize>(msg_type: MessageType, payload: &P) -> Self {
        let payload = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(%msg_type, "payload did not serialize to an object");
                Map::new()
            }
        };
        Self { msg_type, payload }
    }

    /// Deserializes the payload into the typed view `T`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidPayload`] if required fields are
    /// missing or have the wrong type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|source| {
            DecodeError::InvalidPayload {
                msg_type: self.msg_type,
                source,
            }
        })
    }

    /// `registration` carrying the rover identity.
    #[must_use]
    pub fn registration(rover_id: &str) -> Self {
        Self::new(
            MessageType::Registration,
            &RegistrationPayload {
                rover_id: rover_id.to_string(),
                timestamp: Utc::now(),
            },
        )
    }

    /// `registration_ack` carrying the assigned rover-client id.
    #[must_use]
    pub fn registration_ack(rover_client_id: i64) -> Self {
        Self::new(
            MessageType::RegistrationAck,
            &RegistrationAckPayload {
                rover_client_id,
                timestamp: Utc::now(),
            },
        )
    }

    /// `ping` stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(MessageType::Ping, &HeartbeatPayload::now())
    }

    /// `pong` stamped with the current time.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(MessageType::Pong, &HeartbeatPayload::now())
    }

    /// `disconnect` with a human-readable reason.
    #[must_use]
    pub fn disconnect(reason: &str) -> Self {
        Self::new(
            MessageType::Disconnect,
            &DisconnectPayload {
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        )
    }
}

/// Lifecycle status of a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Dispatched, awaiting a response.
    Pending,
    /// The rover executed the command.
    Completed,
    /// The rover rejected the command or the session ended first.
    Failed,
}

impl CommandStatus {
    /// Returns the stored representation of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `true` for `completed` and `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// Payload of `registration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    /// Rover identity string.
    pub rover_id: String,
    /// Client clock at send time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `registration_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationAckPayload {
    /// Server-assigned numeric rover-client id.
    pub rover_client_id: i64,
    /// Server clock at send time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `ping` and `pong`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Sender clock at send time.
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatPayload {
    fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

/// One set of sensor readings. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TelemetryReading {
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    /// Hectopascal.
    pub pressure: Option<f64>,
    /// Metres.
    pub altitude: Option<f64>,
    /// Degrees from north.
    pub heading: Option<f64>,
    /// Metres per second.
    pub speed: Option<f64>,
    /// Degrees from level.
    pub tilt: Option<f64>,
    /// Decimal degrees.
    pub latitude: Option<f64>,
    /// Decimal degrees.
    pub longitude: Option<f64>,
    /// Percent.
    pub battery_level: Option<f64>,
    /// dBm.
    pub signal_strength: Option<f64>,
}

/// Payload of `telemetry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Sensor readings.
    #[serde(flatten)]
    pub reading: TelemetryReading,
    /// Client clock at sampling time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Identifier unique within the issuing session.
    pub command_id: u64,
    /// Command text forwarded to the onboard bridge.
    pub command: String,
    /// Server clock at dispatch time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `command_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponsePayload {
    /// Echo of [`CommandPayload::command_id`].
    pub command_id: u64,
    /// `completed` or `failed`.
    pub status: CommandStatus,
    /// Human-readable result.
    pub result: String,
    /// Client clock at completion time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `local_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCommandPayload {
    /// Command text issued on the rover.
    pub command: String,
    /// `completed` or `failed`.
    pub status: CommandStatus,
    /// Human-readable result.
    pub result: String,
    /// Client clock at completion time.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `disconnect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    /// Why the sender is closing the link.
    pub reason: String,
    /// Sender clock at send time.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn message_type_names_match_serde() {
        let all = [
            MessageType::Registration,
            MessageType::RegistrationAck,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Telemetry,
            MessageType::Command,
            MessageType::CommandResponse,
            MessageType::LocalCommand,
            MessageType::Disconnect,
        ];
        for ty in all {
            let Ok(json) = serde_json::to_string(&ty) else {
                panic!("serialize {ty}");
            };
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
            assert_eq!(ty.as_str().parse::<MessageType>().ok(), Some(ty));
        }
    }

    #[test]
    fn payload_as_reports_missing_fields() {
        let env = Envelope {
            msg_type: MessageType::Command,
            payload: Map::new(),
        };
        let result = env.payload_as::<CommandPayload>();
        assert!(matches!(
            result,
            Err(DecodeError::InvalidPayload {
                msg_type: MessageType::Command,
                ..
            })
        ));
    }

    #[test]
    fn telemetry_fields_are_flattened_and_optional() {
        let payload = TelemetryPayload {
            reading: TelemetryReading {
                temperature: Some(21.5),
                battery_level: Some(88.0),
                ..TelemetryReading::default()
            },
            timestamp: None,
        };
        let env = Envelope::new(MessageType::Telemetry, &payload);
        assert_eq!(env.payload.get("temperature"), Some(&Value::from(21.5)));
        assert!(env.payload.get("reading").is_none());

        let Ok(back) = env.payload_as::<TelemetryPayload>() else {
            panic!("telemetry payload should parse");
        };
        assert_eq!(back.reading.battery_level, Some(88.0));
        assert_eq!(back.reading.humidity, None);
    }

    #[test]
    fn command_status_terminality() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert_eq!("failed".parse::<CommandStatus>(), Ok(CommandStatus::Failed));
        assert!("done".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn registration_builder_carries_identity() {
        let env = Envelope::registration("R-001");
        assert_eq!(env.msg_type, MessageType::Registration);
        let Ok(payload) = env.payload_as::<RegistrationPayload>() else {
            panic!("registration payload should parse");
        };
        assert_eq!(payload.rover_id, "R-001");
    }
}
