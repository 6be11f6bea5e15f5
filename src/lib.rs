//! Beacon Wake - wake word activation front end for voice assistants
//!
//! Clients stream 16 kHz mono PCM over a WebSocket. Every connection gets
//! its own session: frames are scored by a shared wake word detector,
//! debounced, and after an activation the following utterance is handed to
//! a streaming pipeline (transcription, reasoning, synthesis) whose results
//! are sent back on the same connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              WebSocket clients (/ws/*)               │
//! └────────────────────┬────────────────────────────────┘
//!                      │ PCM16 frames / control JSON
//! ┌────────────────────▼────────────────────────────────┐
//! │   Session  │  Activation gate  │  Processing guard   │
//! └───────┬────────────────────────────────┬────────────┘
//!         │                                │ utterance
//! ┌───────▼─────────────┐      ┌───────────▼────────────┐
//! │  WakeWordDetector   │      │  Pipeline dispatcher   │
//! │  (shared, lazy)     │      │  STT │ LLM │ TTS       │
//! └─────────────────────┘      └────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod voice;

pub use api::{ApiServer, ApiServerBuilder, ApiState};
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{PipelineResult, Stage, StreamingPipelineDispatcher};
pub use session::{SessionProtocol, SessionState, WakeWordListener};
pub use voice::{AudioFrame, DetectionResult, WakeWordDetector};
