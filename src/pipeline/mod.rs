//! Downstream request/response pipeline
//!
//! An activated session hands its utterance to the
//! [`StreamingPipelineDispatcher`], which runs transcription, reasoning
//! and synthesis in order. Each stage is a [`ProviderChain`] of external
//! collaborators tried in priority order.

mod chain;
mod dispatcher;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;

pub use chain::ProviderChain;
pub use dispatcher::{
    DispatchEvent, DispatchHandle, DispatcherBuilder, StageTimeouts, StreamingPipelineDispatcher,
};

/// Pipeline stage, reported in `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Dispatcher could not start
    Dispatch,
    /// Audio to text
    Transcription,
    /// Text to response text
    Reasoning,
    /// Response text to audio
    Synthesis,
}

impl Stage {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Transcription => "transcription",
            Self::Reasoning => "reasoning",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of every collaborator
pub trait Provider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;
}

/// Speech-to-text collaborator
#[async_trait]
pub trait Transcriber: Provider {
    /// Transcribe a WAV-wrapped PCM16 mono 16kHz utterance
    ///
    /// # Errors
    ///
    /// Returns error if the service fails
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Reasoning collaborator
#[async_trait]
pub trait Responder: Provider {
    /// Produce a reply to `transcript` within the session context
    ///
    /// # Errors
    ///
    /// Returns error if the service fails
    async fn respond(&self, transcript: &str, context: &SessionContext) -> Result<Reply>;
}

/// Text-to-speech collaborator
#[async_trait]
pub trait Synthesizer: Provider {
    /// Synthesize `text` as PCM16 mono 16kHz samples
    ///
    /// # Errors
    ///
    /// Returns error if the service fails
    async fn synthesize(&self, text: &str) -> Result<Vec<i16>>;
}

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior exchange in this session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// What the reasoning stage knows about the session
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_id: String,
    pub history: Vec<Turn>,
}

/// Token accounting reported by the reasoning stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Reasoning output
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Wall-clock time per stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub transcription_ms: u64,
    pub reasoning_ms: u64,
    pub synthesis_ms: u64,
}

/// Everything one dispatch produced
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub transcript: String,
    pub response_text: String,
    /// PCM16 mono samples at `sample_rate`
    pub audio: Vec<i16>,
    pub sample_rate: u32,
    pub usage: TokenUsage,
    pub timings: StageTimings,
}

/// Progress reported by a running dispatch
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Transcription stage finished
    Transcription { text: String },
    /// All stages finished
    Response(PipelineResult),
    /// A stage failed or timed out; no further events follow
    Failed(crate::Error),
}
