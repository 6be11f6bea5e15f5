//! Error types for the wake-word engine

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Stage;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the wake-word engine
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Detector backend or model assets could not be loaded
    #[error("wake word model unavailable: {0}")]
    ModelUnavailable(String),

    /// Audio frame does not match the expected PCM format
    #[error("invalid audio format: {0}")]
    InvalidAudioFormat(String),

    /// Unexpected message type or order on a connection
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A collaborator stage exceeded its deadline
    #[error("{stage} timed out after {}ms", timeout.as_millis())]
    PipelineTimeout { stage: Stage, timeout: Duration },

    /// A collaborator stage failed
    #[error("{stage} failed: {message}")]
    DownstreamServiceError { stage: Stage, message: String },

    /// Message referenced a session that does not exist on this connection
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio encoding/decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Reasoning (LLM) error
    #[error("agent error: {0}")]
    Agent(String),

    /// IO error
    #[error("io error: {0}")]
    Io(String),

    /// HTTP error
    #[error("http error: {0}")]
    Http(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(String),
}

impl Error {
    /// Stable machine-readable code sent to clients in `error` events
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::InvalidAudioFormat(_) => "invalid_audio_format",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::PipelineTimeout { .. } => "pipeline_timeout",
            Self::DownstreamServiceError { .. } => "downstream_service_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Config(_) => "config",
            Self::Audio(_) => "audio",
            Self::Stt(_) => "stt",
            Self::Tts(_) => "tts",
            Self::Agent(_) => "agent",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Serialization(_) => "serialization",
            Self::Toml(_) => "toml",
        }
    }

    /// Pipeline stage this error is attributed to, if any
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::PipelineTimeout { stage, .. } | Self::DownstreamServiceError { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }

    /// Wrap any error as a failure of the given pipeline stage
    ///
    /// Timeouts and stage failures pass through unchanged.
    #[must_use]
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            Self::PipelineTimeout { .. } | Self::DownstreamServiceError { .. } => self,
            other => Self::DownstreamServiceError {
                stage,
                message: other.to_string(),
            },
        }
    }
}

// Sticky detector failures are cloned out to every caller, so the
// foreign errors are flattened to strings on conversion.

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e.to_string())
    }
}

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Self::Audio(e.to_string())
    }
}
