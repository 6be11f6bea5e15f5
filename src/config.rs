//! Configuration management for the wake-word engine
//!
//! Values are resolved in order: defaults, TOML file, environment,
//! then CLI overrides applied by the binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::voice::{DEFAULT_FRAME_SAMPLES, SAMPLE_RATE};
use crate::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// Wake word detector configuration
    pub detector: DetectorConfig,

    /// Per-session protocol configuration
    pub session: SessionConfig,

    /// Downstream pipeline configuration
    pub pipeline: PipelineConfig,

    /// API keys for collaborator services
    pub api_keys: ApiKeys,
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

/// Wake word detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Pretrained model names and/or paths to custom model files
    pub models: Vec<String>,

    /// Inference backend identifier (only "template" is built in)
    pub backend: String,

    /// Default confidence threshold (0.0, 1.0]
    pub threshold: f32,

    /// Per-label threshold overrides
    pub model_thresholds: HashMap<String, f32>,

    /// Expected input sample rate
    pub sample_rate: u32,

    /// Samples per detector frame
    pub frame_samples: usize,

    /// Load models at startup instead of on first use
    pub preload: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            models: vec!["alexa".to_string()],
            backend: "template".to_string(),
            threshold: 0.5,
            model_thresholds: HashMap::new(),
            sample_rate: SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            preload: true,
        }
    }
}

impl DetectorConfig {
    /// Threshold for a label, falling back to the default
    #[must_use]
    pub fn threshold_for(&self, label: &str) -> Option<f32> {
        self.model_thresholds.get(label).copied()
    }
}

/// Per-session protocol configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum time between two activations in one session
    pub debounce: Duration,

    /// Maximum queued audio frames per connection before dropping oldest
    pub frame_queue_depth: usize,

    /// Close connections with no inbound traffic for this long
    pub idle_timeout: Duration,

    /// Trailing silence that ends an utterance
    pub utterance_silence: Duration,

    /// Hard cap on utterance length
    pub max_utterance: Duration,

    /// Abandon an utterance if no speech is heard within this window
    pub no_speech_timeout: Duration,

    /// RMS (normalized) above which a frame counts as speech
    pub speech_rms: f32,

    /// Prior turns kept as reasoning context
    pub max_history_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            frame_queue_depth: 64,
            idle_timeout: Duration::from_secs(300),
            utterance_silence: Duration::from_millis(800),
            max_utterance: Duration::from_secs(10),
            no_speech_timeout: Duration::from_secs(3),
            speech_rms: 0.03,
            max_history_turns: 8,
        }
    }
}

/// Downstream pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Transcription stage deadline
    pub transcription_timeout: Duration,

    /// Reasoning stage deadline
    pub reasoning_timeout: Duration,

    /// Synthesis stage deadline
    pub synthesis_timeout: Duration,

    /// Process-wide cap on in-flight dispatches
    pub max_concurrent_dispatches: usize,

    /// Whisper model
    pub stt_model: String,

    /// Deepgram model
    pub deepgram_model: String,

    /// Chat completions model
    pub llm_model: String,

    /// Chat completions model used through `OpenRouter`
    pub openrouter_model: String,

    /// Max tokens per response
    pub llm_max_tokens: u32,

    /// System prompt for the reasoning stage
    pub system_prompt: String,

    /// `OpenAI` TTS model
    pub tts_model: String,

    /// `OpenAI` TTS voice
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,

    /// `ElevenLabs` voice id
    pub elevenlabs_voice: String,

    /// `ElevenLabs` model id
    pub elevenlabs_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transcription_timeout: Duration::from_secs(15),
            reasoning_timeout: Duration::from_secs(30),
            synthesis_timeout: Duration::from_secs(30),
            max_concurrent_dispatches: 32,
            stt_model: "whisper-1".to_string(),
            deepgram_model: "nova-2".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            llm_max_tokens: 512,
            system_prompt: "You are a helpful voice assistant. Answer briefly, in plain spoken language."
                .to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
            elevenlabs_voice: "21m00Tcm4TlvDq8ikWAM".to_string(),
            elevenlabs_model: "eleven_turbo_v2".to_string(),
        }
    }
}

/// API keys for external services
#[derive(Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, chat completions, TTS)
    pub openai: Option<String>,

    /// `OpenRouter` API key (fallback chat completions)
    pub openrouter: Option<String>,

    /// `Deepgram` API key (fallback STT)
    pub deepgram: Option<String>,

    /// `ElevenLabs` API key (fallback TTS)
    pub elevenlabs: Option<String>,
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(key: Option<&String>) -> &'static str {
            if key.is_some() { "<set>" } else { "<unset>" }
        }

        f.debug_struct("ApiKeys")
            .field("openai", &mask(self.openai.as_ref()))
            .field("openrouter", &mask(self.openrouter.as_ref()))
            .field("deepgram", &mask(self.deepgram.as_ref()))
            .field("elevenlabs", &mask(self.elevenlabs.as_ref()))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 18800,
            },
            detector: DetectorConfig::default(),
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            api_keys: ApiKeys::default(),
        }
    }
}

/// On-disk configuration file (`wake.toml`); every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: FileServer,
    pub detector: FileDetector,
    pub session: FileSession,
    pub pipeline: FilePipeline,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileServer {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDetector {
    pub models: Option<Vec<String>>,
    pub backend: Option<String>,
    pub threshold: Option<f32>,
    pub thresholds: HashMap<String, f32>,
    pub frame_samples: Option<usize>,
    pub preload: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSession {
    pub debounce_ms: Option<u64>,
    pub frame_queue_depth: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub utterance_silence_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
    pub no_speech_timeout_ms: Option<u64>,
    pub speech_rms: Option<f32>,
    pub max_history_turns: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilePipeline {
    pub transcription_timeout_ms: Option<u64>,
    pub reasoning_timeout_ms: Option<u64>,
    pub synthesis_timeout_ms: Option<u64>,
    pub max_concurrent_dispatches: Option<usize>,
    pub stt_model: Option<String>,
    pub deepgram_model: Option<String>,
    pub llm_model: Option<String>,
    pub openrouter_model: Option<String>,
    pub llm_max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
    pub elevenlabs_voice: Option<String>,
    pub elevenlabs_model: Option<String>,
}

/// Default config file location (`~/.config/omni/beacon/wake.toml` on Linux)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "omni")
        .map(|d| d.config_dir().join("beacon").join("wake.toml"))
}

impl Config {
    /// Load configuration from an optional file plus the environment
    ///
    /// An explicit `path` must exist; the default location is used only if present.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or the result is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(Self::read_file(path)?),
            None => match default_config_path() {
                Some(path) if path.exists() => Some(Self::read_file(&path)?),
                _ => None,
            },
        };

        let mut config = Self::default();
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML config file
    fn read_file(path: &Path) -> Result<FileConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(file)
    }

    /// Overlay values from a parsed config file
    pub fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            server,
            detector,
            session,
            pipeline,
        } = file;

        if let Some(host) = server.host {
            self.server.host = host;
        }
        if let Some(port) = server.port {
            self.server.port = port;
        }

        if let Some(models) = detector.models {
            self.detector.models = models;
        }
        if let Some(backend) = detector.backend {
            self.detector.backend = backend;
        }
        if let Some(threshold) = detector.threshold {
            self.detector.threshold = threshold;
        }
        self.detector.model_thresholds.extend(detector.thresholds);
        if let Some(frame_samples) = detector.frame_samples {
            self.detector.frame_samples = frame_samples;
        }
        if let Some(preload) = detector.preload {
            self.detector.preload = preload;
        }

        let s = &mut self.session;
        if let Some(ms) = session.debounce_ms {
            s.debounce = Duration::from_millis(ms);
        }
        if let Some(depth) = session.frame_queue_depth {
            s.frame_queue_depth = depth;
        }
        if let Some(secs) = session.idle_timeout_secs {
            s.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = session.utterance_silence_ms {
            s.utterance_silence = Duration::from_millis(ms);
        }
        if let Some(ms) = session.max_utterance_ms {
            s.max_utterance = Duration::from_millis(ms);
        }
        if let Some(ms) = session.no_speech_timeout_ms {
            s.no_speech_timeout = Duration::from_millis(ms);
        }
        if let Some(rms) = session.speech_rms {
            s.speech_rms = rms;
        }
        if let Some(turns) = session.max_history_turns {
            s.max_history_turns = turns;
        }

        let p = &mut self.pipeline;
        if let Some(ms) = pipeline.transcription_timeout_ms {
            p.transcription_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = pipeline.reasoning_timeout_ms {
            p.reasoning_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = pipeline.synthesis_timeout_ms {
            p.synthesis_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = pipeline.max_concurrent_dispatches {
            p.max_concurrent_dispatches = n;
        }
        replace(&mut p.stt_model, pipeline.stt_model);
        replace(&mut p.deepgram_model, pipeline.deepgram_model);
        replace(&mut p.llm_model, pipeline.llm_model);
        replace(&mut p.openrouter_model, pipeline.openrouter_model);
        if let Some(tokens) = pipeline.llm_max_tokens {
            p.llm_max_tokens = tokens;
        }
        replace(&mut p.system_prompt, pipeline.system_prompt);
        replace(&mut p.tts_model, pipeline.tts_model);
        replace(&mut p.tts_voice, pipeline.tts_voice);
        if let Some(speed) = pipeline.tts_speed {
            p.tts_speed = speed;
        }
        replace(&mut p.elevenlabs_voice, pipeline.elevenlabs_voice);
        replace(&mut p.elevenlabs_model, pipeline.elevenlabs_model);
    }

    /// Overlay values from environment variables
    pub fn apply_env(&mut self) {
        self.api_keys = ApiKeys {
            openai: non_empty_env("OPENAI_API_KEY"),
            openrouter: non_empty_env("OPENROUTER_API_KEY"),
            deepgram: non_empty_env("DEEPGRAM_API_KEY"),
            elevenlabs: non_empty_env("ELEVENLABS_API_KEY"),
        };

        if let Some(host) = non_empty_env("BEACON_WAKE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_env("BEACON_WAKE_PORT") {
            self.server.port = port;
        }
        if let Some(models) = non_empty_env("BEACON_WAKE_MODELS") {
            self.detector.models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(backend) = non_empty_env("BEACON_WAKE_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(threshold) = parse_env("BEACON_WAKE_THRESHOLD") {
            self.detector.threshold = threshold;
        }
        if let Some(ms) = parse_env("BEACON_WAKE_DEBOUNCE_MS") {
            self.session.debounce = Duration::from_millis(ms);
        }
        if let Some(depth) = parse_env("BEACON_WAKE_QUEUE_DEPTH") {
            self.session.frame_queue_depth = depth;
        }
        if let Some(secs) = parse_env("BEACON_WAKE_IDLE_TIMEOUT_SECS") {
            self.session.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(model) = non_empty_env("BEACON_WAKE_STT_MODEL") {
            self.pipeline.stt_model = model;
        }
        if let Some(model) = non_empty_env("BEACON_WAKE_LLM_MODEL") {
            self.pipeline.llm_model = model;
        }
        if let Some(model) = non_empty_env("BEACON_WAKE_TTS_MODEL") {
            self.pipeline.tts_model = model;
        }
        if let Some(voice) = non_empty_env("BEACON_WAKE_TTS_VOICE") {
            self.pipeline.tts_voice = voice;
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if d.models.is_empty() {
            return Err(Error::Config("at least one wake word model is required".to_string()));
        }
        validate_threshold("detector.threshold", d.threshold)?;
        for (label, threshold) in &d.model_thresholds {
            validate_threshold(&format!("detector.thresholds.{label}"), *threshold)?;
        }
        if d.frame_samples == 0 {
            return Err(Error::Config("detector.frame_samples must be positive".to_string()));
        }
        if d.sample_rate != SAMPLE_RATE {
            return Err(Error::Config(format!(
                "detector.sample_rate must be {SAMPLE_RATE} Hz"
            )));
        }

        let s = &self.session;
        if s.frame_queue_depth == 0 {
            return Err(Error::Config("session.frame_queue_depth must be positive".to_string()));
        }
        if s.idle_timeout.is_zero() || s.max_utterance.is_zero() {
            return Err(Error::Config("session timeouts must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&s.speech_rms) {
            return Err(Error::Config("session.speech_rms must be within [0, 1)".to_string()));
        }

        let p = &self.pipeline;
        if p.transcription_timeout.is_zero()
            || p.reasoning_timeout.is_zero()
            || p.synthesis_timeout.is_zero()
        {
            return Err(Error::Config("pipeline stage timeouts must be positive".to_string()));
        }
        if p.max_concurrent_dispatches == 0 {
            return Err(Error::Config(
                "pipeline.max_concurrent_dispatches must be positive".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&p.tts_speed) {
            return Err(Error::Config("pipeline.tts_speed must be within 0.25..=4.0".to_string()));
        }

        Ok(())
    }
}

fn validate_threshold(name: &str, threshold: f32) -> Result<()> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be within (0, 1], got {threshold}")))
    }
}

fn replace(target: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
