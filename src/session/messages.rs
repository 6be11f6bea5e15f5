//! WebSocket control messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{StageTimings, TokenUsage};
use crate::{Error, Result};

/// Control messages from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session on this connection
    StartSession,
    /// Clear the processing guard unconditionally
    ResetProcessing,
    /// Finish the utterance being captured now
    EndUtterance,
    /// Close the session and the connection
    EndSession,
    /// Keepalive
    Ping,
}

/// A parsed client message plus the session it claims to address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEnvelope {
    pub message: ClientMessage,
    pub session_id: Option<String>,
}

impl ClientEnvelope {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for malformed JSON, an unknown `type`,
    /// or a non-string `session_id`
    pub fn parse(text: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| Error::ProtocolViolation(format!("malformed message: {e}")))?;

        let session_id = match value.as_object_mut().and_then(|o| o.remove("session_id")) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(other) => {
                return Err(Error::ProtocolViolation(format!(
                    "session_id must be a string, got {other}"
                )));
            }
        };

        let message = serde_json::from_value(value)
            .map_err(|e| Error::ProtocolViolation(format!("unsupported message: {e}")))?;

        Ok(Self {
            message,
            session_id,
        })
    }
}

/// Events sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the transport handshake
    Connected {
        models: Vec<String>,
        threshold: f32,
        sample_rate: u32,
        frame_samples: usize,
    },
    /// A new session was opened
    SessionStarted { session_id: String },
    /// Gate fired for a wake phrase
    WakeWordDetected {
        label: String,
        detected: bool,
        confidence: f32,
    },
    /// Transcription stage finished
    Transcription { text: String },
    /// Full response; PCM16LE audio follows as one binary message if `audio_bytes > 0`
    Response {
        text: String,
        audio_bytes: usize,
        sample_rate: u32,
        usage: TokenUsage,
        timings: StageTimings,
    },
    /// Acknowledges `reset_processing`
    ProcessingReset,
    /// Something failed
    Error {
        stage: String,
        code: String,
        message: String,
    },
    /// Keepalive reply
    Pong,
}

impl ServerMessage {
    /// Error event for `error` at `stage`
    #[must_use]
    pub fn error(stage: impl Into<String>, error: &Error) -> Self {
        Self::Error {
            stage: stage.into(),
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// Serialize as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_message() {
        let env = ClientEnvelope::parse(r#"{"type":"start_session"}"#).unwrap();
        assert_eq!(env.message, ClientMessage::StartSession);
        assert_eq!(env.session_id, None);
    }

    #[test]
    fn test_parse_with_session_id() {
        let env =
            ClientEnvelope::parse(r#"{"type":"reset_processing","session_id":"abc"}"#).unwrap();
        assert_eq!(env.message, ClientMessage::ResetProcessing);
        assert_eq!(env.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for text in [
            "not json",
            r#"{"type":"launch_missiles"}"#,
            r#"{"no_type":true}"#,
            r#"{"type":"ping","session_id":5}"#,
            "[1,2]",
        ] {
            assert!(
                matches!(ClientEnvelope::parse(text), Err(Error::ProtocolViolation(_))),
                "accepted {text}"
            );
        }
    }

    #[test]
    fn test_server_message_wire_format() {
        let json = ServerMessage::WakeWordDetected {
            label: "alexa".to_string(),
            detected: true,
            confidence: 0.75,
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "wake_word_detected");
        assert_eq!(value["label"], "alexa");
        assert_eq!(value["confidence"], 0.75);

        let json = ServerMessage::ProcessingReset.to_json().unwrap();
        assert_eq!(json, r#"{"type":"processing_reset"}"#);
    }

    #[test]
    fn test_error_event_carries_code() {
        let err = Error::SessionNotFound("nope".to_string());
        match ServerMessage::error("session", &err) {
            ServerMessage::Error { stage, code, message } => {
                assert_eq!(stage, "session");
                assert_eq!(code, "session_not_found");
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
