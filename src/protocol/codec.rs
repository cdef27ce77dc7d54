//! JSON text framing for link envelopes.
//!
//! Every frame is one WebSocket text message holding a single JSON object:
//!
//! ```text
//! {"type": "<message type>", "payload": { ... }}
//! ```
//!
//! There is no length prefix and no multiplexing. `serde_json` escapes
//! control characters, so encoded frames never contain a raw newline.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::messages::{Envelope, MessageType};

/// Reasons a frame could not be turned into an [`Envelope`].
///
/// None of these is fatal to the link: the caller logs and drops the frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or not shaped as `{"type": string, "payload": object}`.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Well-formed envelope with a `type` this protocol does not define.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Known type whose payload is missing required fields.
    #[error("invalid {msg_type} payload: {source}")]
    InvalidPayload {
        /// Type of the offending envelope.
        msg_type: MessageType,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Shape check performed before the type is resolved.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    payload: Map<String, Value>,
}

/// Encodes an envelope into a text frame.
#[must_use]
pub fn encode(envelope: &Envelope) -> String {
    // A string key and an object payload always serialize.
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Decodes a text frame into an envelope.
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] if the frame is not a tagged
/// envelope and [`DecodeError::UnknownType`] if the tag is not recognized.
pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_str(frame)?;
    let msg_type = raw.msg_type.parse::<MessageType>()?;
    Ok(Envelope {
        msg_type,
        payload: raw.payload,
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::messages::{CommandPayload, CommandResponsePayload, CommandStatus};

    #[test]
    fn decode_command_frame() {
        let frame = r#"{"type":"command","payload":{"command_id":3,"command":"move_forward","timestamp":"2024-05-01T12:00:00Z"}}"#;
        let Ok(env) = decode(frame) else {
            panic!("frame should decode");
        };
        assert_eq!(env.msg_type, MessageType::Command);
        let Ok(cmd) = env.payload_as::<CommandPayload>() else {
            panic!("payload should parse");
        };
        assert_eq!(cmd.command_id, 3);
        assert_eq!(cmd.command, "move_forward");
    }

    #[test]
    fn encoded_frame_is_single_line_and_decodes() {
        let env = Envelope::new(
            MessageType::CommandResponse,
            &CommandResponsePayload {
                command_id: 9,
                status: CommandStatus::Failed,
                result: "line one\nline two".to_string(),
                timestamp: chrono::Utc::now(),
            },
        );
        let frame = encode(&env);
        assert!(!frame.contains('\n'));
        assert!(frame.starts_with(r#"{"type":"command_response""#));

        let Ok(back) = decode(&frame) else {
            panic!("encoded frame should decode");
        };
        assert_eq!(back, env);
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        for frame in [
            "[]",
            r#"{"payload":{}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"ping","payload":[]}"#,
            r#"{"type":42,"payload":{}}"#,
        ] {
            assert!(
                matches!(decode(frame), Err(DecodeError::Malformed(_))),
                "{frame} should be malformed"
            );
        }
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        let result = decode(r#"{"type":"teleport","payload":{}}"#);
        let Err(DecodeError::UnknownType(name)) = result else {
            panic!("expected unknown type");
        };
        assert_eq!(name, "teleport");
    }
}
