//! Streaming pipeline dispatcher
//!
//! Each dispatch runs on its own task and reports back over the owning
//! connection's channel. Events carry the ticket they were started with so
//! the session can discard results it no longer wants.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use super::{
    PipelineEvent, PipelineResult, ProviderChain, Responder, SessionContext, Stage, StageTimings,
    Synthesizer, Transcriber,
};
use crate::agent::ChatResponder;
use crate::config::{Config, PipelineConfig};
use crate::voice::{SAMPLE_RATE, SpeechToText, TextToSpeech, pcm_to_wav};
use crate::{Error, Result};

/// Default process-wide dispatch limit
pub const DEFAULT_MAX_CONCURRENT: usize = 32;

/// Deadline for each collaborator stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub transcription: Duration,
    pub reasoning: Duration,
    pub synthesis: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            transcription: Duration::from_secs(15),
            reasoning: Duration::from_secs(30),
            synthesis: Duration::from_secs(30),
        }
    }
}

impl From<&PipelineConfig> for StageTimeouts {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            transcription: config.transcription_timeout,
            reasoning: config.reasoning_timeout,
            synthesis: config.synthesis_timeout,
        }
    }
}

/// Pipeline progress tagged with the dispatch that produced it
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub ticket: u64,
    pub event: PipelineEvent,
}

/// Running dispatch; aborted when dropped
#[derive(Debug)]
pub struct DispatchHandle {
    ticket: u64,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    /// Ticket the dispatch was started with
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Stop forwarding events; in-flight HTTP calls are dropped
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs transcription, reasoning and synthesis for activated sessions
pub struct StreamingPipelineDispatcher {
    transcribers: ProviderChain<dyn Transcriber>,
    responders: ProviderChain<dyn Responder>,
    synthesizers: ProviderChain<dyn Synthesizer>,
    timeouts: StageTimeouts,
    capacity: Arc<Semaphore>,
    max_concurrent: usize,
    sample_rate: u32,
}

impl std::fmt::Debug for StreamingPipelineDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingPipelineDispatcher")
            .field("transcribers", &self.transcribers.names())
            .field("responders", &self.responders.names())
            .field("synthesizers", &self.synthesizers.names())
            .field("timeouts", &self.timeouts)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl StreamingPipelineDispatcher {
    /// Start building a dispatcher with empty provider chains
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Build provider chains from the configured API keys
    ///
    /// Providers without a key are skipped. A stage with no provider still
    /// builds; its dispatches fail with `DownstreamServiceError`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let p = &config.pipeline;
        let keys = &config.api_keys;
        let mut builder = Self::builder()
            .timeouts(StageTimeouts::from(p))
            .max_concurrent(p.max_concurrent_dispatches);

        if let Some(key) = &keys.openai {
            match SpeechToText::new_whisper(key.clone(), p.stt_model.clone()) {
                Ok(stt) => builder = builder.transcriber(Arc::new(stt)),
                Err(e) => tracing::warn!(provider = "whisper", error = %e, "transcriber unavailable"),
            }
        }
        if let Some(key) = &keys.deepgram {
            match SpeechToText::new_deepgram(key.clone(), p.deepgram_model.clone()) {
                Ok(stt) => builder = builder.transcriber(Arc::new(stt)),
                Err(e) => tracing::warn!(provider = "deepgram", error = %e, "transcriber unavailable"),
            }
        }

        if let Some(key) = &keys.openai {
            match ChatResponder::new_openai(key.clone(), p.llm_model.clone()) {
                Ok(llm) => {
                    builder = builder.responder(Arc::new(
                        llm.with_max_tokens(p.llm_max_tokens)
                            .with_system_prompt(p.system_prompt.clone()),
                    ));
                }
                Err(e) => tracing::warn!(provider = "openai", error = %e, "responder unavailable"),
            }
        }
        if let Some(key) = &keys.openrouter {
            match ChatResponder::new_openrouter(key.clone(), p.openrouter_model.clone()) {
                Ok(llm) => {
                    builder = builder.responder(Arc::new(
                        llm.with_max_tokens(p.llm_max_tokens)
                            .with_system_prompt(p.system_prompt.clone()),
                    ));
                }
                Err(e) => tracing::warn!(provider = "openrouter", error = %e, "responder unavailable"),
            }
        }

        if let Some(key) = &keys.openai {
            match TextToSpeech::new_openai(
                key.clone(),
                p.tts_model.clone(),
                p.tts_voice.clone(),
                p.tts_speed,
            ) {
                Ok(tts) => builder = builder.synthesizer(Arc::new(tts)),
                Err(e) => tracing::warn!(provider = "openai", error = %e, "synthesizer unavailable"),
            }
        }
        if let Some(key) = &keys.elevenlabs {
            match TextToSpeech::new_elevenlabs(
                key.clone(),
                p.elevenlabs_model.clone(),
                p.elevenlabs_voice.clone(),
            ) {
                Ok(tts) => builder = builder.synthesizer(Arc::new(tts)),
                Err(e) => tracing::warn!(provider = "elevenlabs", error = %e, "synthesizer unavailable"),
            }
        }

        let dispatcher = builder.build();
        dispatcher.log_providers();
        dispatcher
    }

    fn log_providers(&self) {
        for (stage, names) in [
            (Stage::Transcription, self.transcribers.names()),
            (Stage::Reasoning, self.responders.names()),
            (Stage::Synthesis, self.synthesizers.names()),
        ] {
            if names.is_empty() {
                tracing::warn!(stage = %stage, "no provider configured, dispatches will fail");
            } else {
                tracing::info!(stage = %stage, providers = ?names, "pipeline providers");
            }
        }
    }

    /// Stage deadlines
    #[must_use]
    pub const fn timeouts(&self) -> StageTimeouts {
        self.timeouts
    }

    /// Whether every stage has at least one provider
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.transcribers.is_empty() && !self.responders.is_empty() && !self.synthesizers.is_empty()
    }

    /// Dispatches that could start right now
    #[must_use]
    pub fn available_capacity(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Start a dispatch for `utterance` on its own task
    ///
    /// Events are sent to `events` tagged with `ticket`. The task stops
    /// as soon as the receiver is gone.
    ///
    /// # Errors
    ///
    /// Returns `DownstreamServiceError` at the dispatch stage if the
    /// process-wide dispatch limit is reached
    pub fn start(
        self: &Arc<Self>,
        ticket: u64,
        utterance: Vec<i16>,
        context: SessionContext,
        events: mpsc::Sender<DispatchEvent>,
    ) -> Result<DispatchHandle> {
        let permit = Arc::clone(&self.capacity)
            .try_acquire_owned()
            .map_err(|_| {
                tracing::warn!(
                    session_id = %context.session_id,
                    max = self.max_concurrent,
                    "dispatch capacity exhausted"
                );
                Error::DownstreamServiceError {
                    stage: Stage::Dispatch,
                    message: format!("dispatch capacity exhausted ({} in flight)", self.max_concurrent),
                }
            })?;

        tracing::info!(
            session_id = %context.session_id,
            ticket,
            samples = utterance.len(),
            "dispatching utterance"
        );

        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _permit = permit;
            dispatcher.run(ticket, &utterance, &context, &events).await;
        });

        Ok(DispatchHandle { ticket, task })
    }

    async fn run(
        &self,
        ticket: u64,
        utterance: &[i16],
        context: &SessionContext,
        events: &mpsc::Sender<DispatchEvent>,
    ) {
        let event = match self.execute(ticket, utterance, context, events).await {
            Ok(Some(result)) => PipelineEvent::Response(result),
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(session_id = %context.session_id, ticket, error = %e, "dispatch failed");
                PipelineEvent::Failed(e)
            }
        };

        if events.send(DispatchEvent { ticket, event }).await.is_err() {
            tracing::debug!(session_id = %context.session_id, ticket, "session gone, result dropped");
        }
    }

    /// Run every stage; `Ok(None)` means the session went away mid-dispatch
    async fn execute(
        &self,
        ticket: u64,
        utterance: &[i16],
        context: &SessionContext,
        events: &mpsc::Sender<DispatchEvent>,
    ) -> Result<Option<PipelineResult>> {
        let mut timings = StageTimings::default();

        let wav = pcm_to_wav(utterance, self.sample_rate)
            .map_err(|e| e.at_stage(Stage::Transcription))?;
        let (transcript, ms) = timed(
            Stage::Transcription,
            self.timeouts.transcription,
            self.transcribers.call(|p| {
                let wav = wav.as_slice();
                async move { p.transcribe(wav).await }
            }),
        )
        .await?;
        timings.transcription_ms = ms;

        if transcript.trim().is_empty() {
            return Err(Error::DownstreamServiceError {
                stage: Stage::Transcription,
                message: "no speech recognized".to_string(),
            });
        }

        let event = PipelineEvent::Transcription {
            text: transcript.clone(),
        };
        if events.send(DispatchEvent { ticket, event }).await.is_err() {
            return Ok(None);
        }

        let (reply, ms) = timed(
            Stage::Reasoning,
            self.timeouts.reasoning,
            self.responders.call(|p| {
                let transcript = transcript.as_str();
                async move { p.respond(transcript, context).await }
            }),
        )
        .await?;
        timings.reasoning_ms = ms;

        let (audio, ms) = timed(
            Stage::Synthesis,
            self.timeouts.synthesis,
            self.synthesizers.call(|p| {
                let text = reply.text.as_str();
                async move { p.synthesize(text).await }
            }),
        )
        .await?;
        timings.synthesis_ms = ms;

        tracing::info!(
            session_id = %context.session_id,
            ticket,
            transcription_ms = timings.transcription_ms,
            reasoning_ms = timings.reasoning_ms,
            synthesis_ms = timings.synthesis_ms,
            "dispatch complete"
        );

        Ok(Some(PipelineResult {
            transcript,
            response_text: reply.text,
            audio,
            sample_rate: self.sample_rate,
            usage: reply.usage,
            timings,
        }))
    }
}

/// Bound a stage by its deadline, returning the value and elapsed ms
async fn timed<T>(
    stage: Stage,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<(T, u64)> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => {
            let ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            Ok((value, ms))
        }
        Ok(Err(e)) => Err(e.at_stage(stage)),
        Err(_) => {
            tracing::warn!(stage = %stage, timeout_ms = timeout.as_millis(), "stage timed out");
            Err(Error::PipelineTimeout { stage, timeout })
        }
    }
}

/// Assembles a [`StreamingPipelineDispatcher`]
pub struct DispatcherBuilder {
    transcribers: ProviderChain<dyn Transcriber>,
    responders: ProviderChain<dyn Responder>,
    synthesizers: ProviderChain<dyn Synthesizer>,
    timeouts: StageTimeouts,
    max_concurrent: usize,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            transcribers: ProviderChain::new(Stage::Transcription),
            responders: ProviderChain::new(Stage::Reasoning),
            synthesizers: ProviderChain::new(Stage::Synthesis),
            timeouts: StageTimeouts::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl DispatcherBuilder {
    /// Append a transcription provider
    #[must_use]
    pub fn transcriber(mut self, provider: Arc<dyn Transcriber>) -> Self {
        self.transcribers.push(provider);
        self
    }

    /// Append a reasoning provider
    #[must_use]
    pub fn responder(mut self, provider: Arc<dyn Responder>) -> Self {
        self.responders.push(provider);
        self
    }

    /// Append a synthesis provider
    #[must_use]
    pub fn synthesizer(mut self, provider: Arc<dyn Synthesizer>) -> Self {
        self.synthesizers.push(provider);
        self
    }

    /// Set stage deadlines
    #[must_use]
    pub const fn timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the process-wide dispatch limit (at least 1)
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Build the dispatcher
    #[must_use]
    pub fn build(self) -> StreamingPipelineDispatcher {
        StreamingPipelineDispatcher {
            transcribers: self.transcribers,
            responders: self.responders,
            synthesizers: self.synthesizers,
            timeouts: self.timeouts,
            capacity: Arc::new(Semaphore::new(self.max_concurrent)),
            max_concurrent: self.max_concurrent,
            sample_rate: SAMPLE_RATE,
        }
    }
}
