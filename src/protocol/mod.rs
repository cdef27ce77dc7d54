//! Wire protocol shared by the rover agent and the server.
//!
//! A link carries one [`Envelope`] per WebSocket text frame. The
//! [`codec`] turns envelopes into frames and back; [`messages`] holds the
//! typed payload of every message type.

pub mod codec;
pub mod messages;

pub use codec::{DecodeError, decode, encode};
pub use messages::{
    CommandPayload, CommandResponsePayload, CommandStatus, DisconnectPayload, Envelope,
    HeartbeatPayload, LocalCommandPayload, MessageType, RegistrationAckPayload,
    RegistrationPayload, TelemetryPayload, TelemetryReading,
};
