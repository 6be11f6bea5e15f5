//! Per-connection session protocol
//!
//! [`SessionProtocol`] is a sans-IO state machine. The connection handler
//! feeds it one [`Input`] at a time and executes the returned [`Action`]s
//! in order, so all session state is mutated from a single flow.
//!
//! ```text
//! CONNECTED --start_session--> LISTENING --activation--> ACTIVATED
//!     ACTIVATED --utterance complete--> PROCESSING --response--> RESPONDING --> LISTENING
//!     PROCESSING --failure/timeout--> LISTENING
//!     any --reset_processing--> LISTENING
//!     any --disconnect / end_session / idle--> CLOSED
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::gate::ActivationGate;
use super::guard::ProcessingGuard;
use super::messages::{ClientEnvelope, ClientMessage, ServerMessage};
use super::utterance::{CaptureStatus, UtteranceCapture};
use crate::config::SessionConfig;
use crate::pipeline::{
    DispatchEvent, PipelineEvent, PipelineResult, Role, SessionContext, Stage, Turn,
};
use crate::voice::{
    AudioFrame, DetectionResult, FrameAssembler, WakeWordDetector, decode_payload, pcm_to_bytes,
};
use crate::Error;

/// Protocol state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake done, no session yet
    Connected,
    /// Waiting for a wake phrase
    Listening,
    /// Capturing the utterance after a wake phrase
    Activated,
    /// Utterance handed to the pipeline
    Processing,
    /// Emitting the pipeline's response
    Responding,
    /// Terminal
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Activated => "activated",
            Self::Processing => "processing",
            Self::Responding => "responding",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened on the connection
#[derive(Debug)]
pub enum Input {
    /// Text frame from the client
    Text(String),
    /// Binary frame from the client
    Audio(Vec<u8>),
    /// Progress from a dispatch this session started
    Pipeline(DispatchEvent),
    /// No client traffic for the idle window
    IdleTimeout,
    /// Transport closed by the client
    Disconnect,
    /// Client sent more control messages than the queue holds
    Flooded,
}

/// Something the connection handler must do
#[derive(Debug)]
pub enum Action {
    /// Send a control message
    Send(ServerMessage),
    /// Send PCM16LE audio as a binary message
    SendAudio(Vec<u8>),
    /// Start the pipeline for a captured utterance
    Dispatch {
        ticket: u64,
        utterance: Vec<i16>,
        context: SessionContext,
    },
    /// Abort the in-flight dispatch, if any
    CancelDispatch,
    /// Close the transport
    Close,
}

/// Server-side state of one session
///
/// Gate clock, guard and capture buffer live here together so the
/// protocol state is the only source of truth.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: SessionState,
    gate: ActivationGate,
    guard: ProcessingGuard,
    capture: Option<UtteranceCapture>,
    history: VecDeque<Turn>,
}

impl Session {
    fn new(config: &SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Listening,
            gate: ActivationGate::new(config.debounce),
            guard: ProcessingGuard::new(),
            capture: None,
            history: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a dispatch (or the capture leading to one) is in flight
    #[must_use]
    pub const fn is_processing(&self) -> bool {
        self.guard.is_held()
    }

    /// Prior turns, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Turn> {
        self.history.iter().cloned().collect()
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            history: self.history(),
        }
    }

    fn remember(&mut self, result: &PipelineResult, max_turns: usize) {
        if max_turns == 0 {
            return;
        }
        self.history.push_back(Turn {
            role: Role::User,
            content: result.transcript.clone(),
        });
        self.history.push_back(Turn {
            role: Role::Assistant,
            content: result.response_text.clone(),
        });
        while self.history.len() > max_turns * 2 {
            self.history.pop_front();
        }
    }
}

/// Shared detector front end: payload decoding, framing, and one-time
/// reporting of an unavailable detector
#[derive(Debug)]
pub(crate) struct DetectorFeed {
    detector: Arc<WakeWordDetector>,
    assembler: FrameAssembler,
    unavailable_reported: bool,
}

impl DetectorFeed {
    pub(crate) fn new(detector: Arc<WakeWordDetector>) -> Self {
        let assembler = FrameAssembler::new(detector.frame_samples());
        Self {
            detector,
            assembler,
            unavailable_reported: false,
        }
    }

    pub(crate) const fn detector(&self) -> &Arc<WakeWordDetector> {
        &self.detector
    }

    /// `connected` event, plus an error if the models cannot be loaded
    pub(crate) fn greeting(&mut self) -> Vec<Action> {
        let (models, error) = match self.detector.labels() {
            Ok(labels) => (labels, None),
            Err(e) => (Vec::new(), Some(e)),
        };

        let config = self.detector.config();
        let mut out = vec![Action::Send(ServerMessage::Connected {
            models,
            threshold: config.threshold,
            sample_rate: config.sample_rate,
            frame_samples: config.frame_samples,
        })];
        if let Some(e) = error {
            self.report_unavailable(&e, &mut out);
        }
        out
    }

    /// Decode a binary payload into complete frames
    pub(crate) fn frames(&mut self, payload: &[u8], out: &mut Vec<Action>) -> Vec<AudioFrame> {
        match decode_payload(payload) {
            Ok(samples) => self.assembler.push(&samples),
            Err(e) => {
                tracing::debug!(error = %e, "rejected audio payload");
                out.push(Action::Send(ServerMessage::error("audio", &e)));
                Vec::new()
            }
        }
    }

    /// Run the detector on one frame, reporting failures
    pub(crate) fn detect(
        &mut self,
        frame: &AudioFrame,
        out: &mut Vec<Action>,
    ) -> Option<DetectionResult> {
        match self.detector.detect(frame) {
            Ok(result) => Some(result),
            Err(e @ Error::ModelUnavailable(_)) => {
                self.report_unavailable(&e, out);
                None
            }
            Err(e) => {
                out.push(Action::Send(ServerMessage::error("audio", &e)));
                None
            }
        }
    }

    fn report_unavailable(&mut self, error: &Error, out: &mut Vec<Action>) {
        if self.unavailable_reported {
            return;
        }
        self.unavailable_reported = true;
        out.push(Action::Send(ServerMessage::error("detector", error)));
    }
}

/// Session protocol state machine for one connection
#[derive(Debug)]
pub struct SessionProtocol {
    feed: DetectorFeed,
    config: SessionConfig,
    session: Option<Session>,
    closed: bool,
}

impl SessionProtocol {
    #[must_use]
    pub fn new(detector: Arc<WakeWordDetector>, config: SessionConfig) -> Self {
        Self {
            feed: DetectorFeed::new(detector),
            config,
            session: None,
            closed: false,
        }
    }

    /// Actions to run right after the transport handshake
    pub fn greeting(&mut self) -> Vec<Action> {
        self.feed.greeting()
    }

    /// Current protocol state
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.closed {
            return SessionState::Closed;
        }
        self.session
            .as_ref()
            .map_or(SessionState::Connected, Session::state)
    }

    /// The live session, once started
    #[must_use]
    pub const fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Id of the live session, once started
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(Session::id)
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Advance the state machine; `now` drives the debounce clock
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }

        match input {
            Input::Text(text) => self.on_text(&text, &mut out),
            Input::Audio(payload) => self.on_audio(&payload, now, &mut out),
            Input::Pipeline(event) => self.on_pipeline(event, &mut out),
            Input::IdleTimeout => {
                tracing::info!(session_id = ?self.session_id(), "idle timeout");
                out.push(Action::Send(ServerMessage::Error {
                    stage: "session".to_string(),
                    code: "idle_timeout".to_string(),
                    message: format!(
                        "no activity for {}s",
                        self.config.idle_timeout.as_secs()
                    ),
                }));
                self.close(&mut out);
            }
            Input::Disconnect => {
                self.teardown(&mut out);
            }
            Input::Flooded => {
                let e = Error::ProtocolViolation("too many queued control messages".to_string());
                self.violation(&e, &mut out);
            }
        }

        out
    }

    fn on_text(&mut self, text: &str, out: &mut Vec<Action>) {
        let envelope = match ClientEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => return self.violation(&e, out),
        };

        if let Some(claimed) = &envelope.session_id {
            if self.session_id() != Some(claimed.as_str()) {
                let e = Error::SessionNotFound(claimed.clone());
                tracing::warn!(session_id = %claimed, "message for unknown session");
                out.push(Action::Send(ServerMessage::error("session", &e)));
                return;
            }
        }

        match envelope.message {
            ClientMessage::StartSession => self.start_session(out),
            ClientMessage::ResetProcessing => self.reset_processing(out),
            ClientMessage::EndUtterance => self.end_utterance(out),
            ClientMessage::EndSession => {
                tracing::info!(session_id = ?self.session_id(), "session ended by client");
                self.close(out);
            }
            ClientMessage::Ping => out.push(Action::Send(ServerMessage::Pong)),
        }
    }

    fn start_session(&mut self, out: &mut Vec<Action>) {
        if self.session.is_some() {
            let e = Error::ProtocolViolation("session already started".to_string());
            return self.violation(&e, out);
        }

        let session = Session::new(&self.config);
        tracing::info!(session_id = %session.id, "session started");
        out.push(Action::Send(ServerMessage::SessionStarted {
            session_id: session.id.clone(),
        }));
        self.session = Some(session);
    }

    fn reset_processing(&mut self, out: &mut Vec<Action>) {
        if let Some(session) = self.session.as_mut() {
            let cleared = session.guard.clear();
            session.capture = None;
            if cleared.is_some() {
                out.push(Action::CancelDispatch);
            }
            tracing::info!(
                session_id = %session.id,
                from = %session.state,
                cleared = cleared.is_some(),
                "processing reset"
            );
            session.state = SessionState::Listening;
        }
        out.push(Action::Send(ServerMessage::ProcessingReset));
    }

    fn end_utterance(&mut self, out: &mut Vec<Action>) {
        let Some(session) = self.session.as_ref() else {
            let e = Error::ProtocolViolation("end_utterance before start_session".to_string());
            return self.violation(&e, out);
        };

        match session.capture.as_ref() {
            Some(capture) => {
                let status = capture.end();
                self.finish_capture(status, out);
            }
            None => {
                tracing::debug!(session_id = %session.id, "end_utterance with nothing captured");
            }
        }
    }

    fn on_audio(&mut self, payload: &[u8], now: Instant, out: &mut Vec<Action>) {
        if self.session.is_none() {
            let e = Error::ProtocolViolation("audio before start_session".to_string());
            return self.violation(&e, out);
        }

        for frame in self.feed.frames(payload, out) {
            self.on_frame(&frame, now, out);
        }
    }

    fn on_frame(&mut self, frame: &AudioFrame, now: Instant, out: &mut Vec<Action>) {
        let captured = self
            .session
            .as_mut()
            .and_then(|s| s.capture.as_mut())
            .map(|capture| capture.push(frame));

        if let Some(status) = captured {
            if status != CaptureStatus::Continue {
                self.finish_capture(status, out);
            }
            return;
        }

        if let Some(result) = self.feed.detect(frame, out) {
            self.on_detection(&result, now, out);
        }
    }

    fn on_detection(&mut self, result: &DetectionResult, now: Instant, out: &mut Vec<Action>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(activation) = session.gate.evaluate(result, now) else {
            return;
        };
        let Some(ticket) = session.guard.try_acquire() else {
            tracing::debug!(
                session_id = %session.id,
                label = %activation.label,
                state = %session.state,
                "activation ignored, processing in flight"
            );
            return;
        };

        tracing::info!(
            session_id = %session.id,
            label = %activation.label,
            confidence = activation.confidence,
            ticket,
            "session activated"
        );

        session.state = SessionState::Activated;
        session.capture = Some(UtteranceCapture::new(
            &self.config,
            self.feed.detector().config().sample_rate,
        ));
        out.push(Action::Send(ServerMessage::WakeWordDetected {
            label: activation.label,
            detected: true,
            confidence: activation.confidence,
        }));
    }

    fn finish_capture(&mut self, status: CaptureStatus, out: &mut Vec<Action>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let (Some(capture), Some(ticket)) = (session.capture.take(), session.guard.ticket()) else {
            return;
        };

        match status {
            CaptureStatus::Continue => session.capture = Some(capture),
            CaptureStatus::Complete(reason) => {
                tracing::info!(
                    session_id = %session.id,
                    ?reason,
                    duration_ms = capture.duration().as_millis(),
                    "utterance captured"
                );
                session.state = SessionState::Processing;
                let context = session.context();
                out.push(Action::Dispatch {
                    ticket,
                    utterance: capture.into_samples(),
                    context,
                });
            }
            CaptureStatus::NoSpeech => {
                tracing::info!(session_id = %session.id, "no speech after activation");
                session.guard.release(ticket);
                session.state = SessionState::Listening;
                out.push(Action::Send(ServerMessage::Error {
                    stage: "utterance".to_string(),
                    code: "no_speech".to_string(),
                    message: "no speech heard after wake word".to_string(),
                }));
            }
        }
    }

    fn on_pipeline(&mut self, dispatch: DispatchEvent, out: &mut Vec<Action>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let ticket = dispatch.ticket;
        if !session.guard.is_current(ticket) || session.state != SessionState::Processing {
            tracing::debug!(session_id = %session.id, ticket, "discarding stale pipeline event");
            return;
        }

        match dispatch.event {
            PipelineEvent::Transcription { text } => {
                out.push(Action::Send(ServerMessage::Transcription { text }));
            }
            PipelineEvent::Response(result) => {
                session.state = SessionState::Responding;

                let audio = pcm_to_bytes(&result.audio);
                out.push(Action::Send(ServerMessage::Response {
                    text: result.response_text.clone(),
                    audio_bytes: audio.len(),
                    sample_rate: result.sample_rate,
                    usage: result.usage,
                    timings: result.timings,
                }));
                if !audio.is_empty() {
                    out.push(Action::SendAudio(audio));
                }

                session.remember(&result, self.config.max_history_turns);
                session.guard.release(ticket);
                session.state = SessionState::Listening;
                tracing::info!(session_id = %session.id, ticket, "response delivered");
            }
            PipelineEvent::Failed(e) => {
                let stage = e.stage().map_or("pipeline", Stage::as_str);
                tracing::warn!(session_id = %session.id, ticket, stage, error = %e, "pipeline failed");
                out.push(Action::Send(ServerMessage::error(stage, &e)));
                session.guard.release(ticket);
                session.state = SessionState::Listening;
            }
        }
    }

    fn violation(&mut self, error: &Error, out: &mut Vec<Action>) {
        tracing::warn!(session_id = ?self.session_id(), error = %error, "protocol violation");
        out.push(Action::Send(ServerMessage::error("protocol", error)));
        self.close(out);
    }

    fn close(&mut self, out: &mut Vec<Action>) {
        self.teardown(out);
        out.push(Action::Close);
    }

    fn teardown(&mut self, out: &mut Vec<Action>) {
        if let Some(session) = self.session.as_mut() {
            if session.guard.clear().is_some() {
                out.push(Action::CancelDispatch);
            }
            session.capture = None;
            session.state = SessionState::Closed;
            tracing::info!(session_id = %session.id, "session closed");
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::DetectorConfig;
    use crate::pipeline::{StageTimings, TokenUsage};
    use crate::voice::{Classifier, ModelLoader, WakeWordModel};

    const FRAME: usize = 1600;

    struct PeakClassifier;

    impl Classifier for PeakClassifier {
        fn score(&self, samples: &[i16]) -> f32 {
            let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
            f32::from(peak) / f32::from(i16::MAX.unsigned_abs())
        }
    }

    struct PeakLoader {
        fail: bool,
    }

    impl ModelLoader for PeakLoader {
        fn load(&self, config: &DetectorConfig) -> crate::Result<Vec<WakeWordModel>> {
            if self.fail {
                return Err(Error::ModelUnavailable("no assets".to_string()));
            }
            Ok(config
                .models
                .iter()
                .map(|m| WakeWordModel::new(m.clone(), config.threshold, "test", Box::new(PeakClassifier)))
                .collect())
        }
    }

    fn detector(fail: bool) -> Arc<WakeWordDetector> {
        let config = DetectorConfig {
            frame_samples: FRAME,
            ..DetectorConfig::default()
        };
        Arc::new(WakeWordDetector::with_loader(config, PeakLoader { fail }))
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            debounce: Duration::from_millis(500),
            utterance_silence: Duration::from_millis(200),
            max_utterance: Duration::from_secs(2),
            no_speech_timeout: Duration::from_millis(500),
            speech_rms: 0.03,
            ..SessionConfig::default()
        }
    }

    fn protocol() -> SessionProtocol {
        SessionProtocol::new(detector(false), session_config())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn audio(amplitude: f32, frames: usize) -> Vec<u8> {
        let value = (amplitude * f32::from(i16::MAX)).round() as i16;
        pcm_to_bytes(&vec![value; FRAME * frames])
    }

    fn sent(actions: &[Action]) -> Vec<&ServerMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn dispatch_ticket(actions: &[Action]) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            Action::Dispatch { ticket, .. } => Some(*ticket),
            _ => None,
        })
    }

    fn wake_events(actions: &[Action]) -> usize {
        sent(actions)
            .iter()
            .filter(|m| matches!(m, ServerMessage::WakeWordDetected { .. }))
            .count()
    }

    fn started(t0: Instant) -> SessionProtocol {
        let mut p = protocol();
        p.greeting();
        p.handle(Input::Text(r#"{"type":"start_session"}"#.to_string()), t0);
        p
    }

    /// Wake frame, speech, then enough silence to end the utterance
    fn activate_and_dispatch(p: &mut SessionProtocol, now: Instant) -> u64 {
        let mut actions = p.handle(Input::Audio(audio(0.8, 1)), now);
        actions.extend(p.handle(Input::Audio(audio(0.2, 2)), now));
        actions.extend(p.handle(Input::Audio(audio(0.0, 2)), now));
        assert_eq!(p.state(), SessionState::Processing);
        dispatch_ticket(&actions).unwrap()
    }

    fn response(ticket: u64) -> Input {
        Input::Pipeline(DispatchEvent {
            ticket,
            event: PipelineEvent::Response(PipelineResult {
                transcript: "what time is it".to_string(),
                response_text: "noon".to_string(),
                audio: vec![1, 2, 3],
                sample_rate: 16_000,
                usage: TokenUsage::default(),
                timings: StageTimings::default(),
            }),
        })
    }

    #[test]
    fn test_greeting_lists_models_and_threshold() {
        let mut p = protocol();
        let actions = p.greeting();

        match sent(&actions)[..] {
            [ServerMessage::Connected { models, threshold, .. }] => {
                assert_eq!(models, &vec!["alexa".to_string()]);
                assert!((threshold - 0.5).abs() < f32::EPSILON);
            }
            ref other => panic!("unexpected greeting: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Connected);
    }

    #[test]
    fn test_start_session_assigns_id() {
        let mut p = protocol();
        let actions = p.handle(Input::Text(r#"{"type":"start_session"}"#.to_string()), Instant::now());

        match sent(&actions)[..] {
            [ServerMessage::SessionStarted { session_id }] => {
                assert!(!session_id.is_empty());
                assert_eq!(p.session_id(), Some(session_id.as_str()));
            }
            ref other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Listening);
    }

    #[test]
    fn test_fresh_id_per_connection() {
        let t0 = Instant::now();
        let first = started(t0);
        let second = started(t0);
        assert_ne!(first.session_id(), second.session_id());
    }

    #[test]
    fn test_silence_never_activates() {
        let mut p = started(Instant::now());
        let actions = p.handle(Input::Audio(audio(0.0, 10)), Instant::now());

        assert_eq!(wake_events(&actions), 0);
        assert!(actions.is_empty());
        assert_eq!(p.state(), SessionState::Listening);
    }

    #[test]
    fn test_activation_then_dispatch() {
        let t0 = Instant::now();
        let mut p = started(t0);

        let actions = p.handle(Input::Audio(audio(0.8, 1)), t0);
        match sent(&actions)[..] {
            [ServerMessage::WakeWordDetected { label, detected, confidence }] => {
                assert_eq!(label, "alexa");
                assert!(*detected);
                assert!((confidence - 0.8).abs() < 0.001);
            }
            ref other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Activated);

        let actions = p.handle(Input::Audio(audio(0.2, 3)), t0);
        assert!(dispatch_ticket(&actions).is_none());

        let actions = p.handle(Input::Audio(audio(0.0, 2)), t0);
        match &actions[..] {
            [Action::Dispatch { utterance, context, .. }] => {
                assert_eq!(utterance.len(), 5 * FRAME);
                assert_eq!(Some(context.session_id.as_str()), p.session_id());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Processing);
    }

    #[test]
    fn test_debounce_suppresses_second_detection() {
        let t0 = Instant::now();
        let mut p = started(t0);

        assert_eq!(wake_events(&p.handle(Input::Audio(audio(0.8, 1)), t0)), 1);

        // Reset frees the guard, so only the gate can suppress
        p.handle(Input::Text(r#"{"type":"reset_processing"}"#.to_string()), t0);
        let actions = p.handle(Input::Audio(audio(0.8, 1)), t0 + Duration::from_millis(300));
        assert_eq!(wake_events(&actions), 0);
        assert_eq!(p.state(), SessionState::Listening);

        let actions = p.handle(Input::Audio(audio(0.8, 1)), t0 + Duration::from_millis(600));
        assert_eq!(wake_events(&actions), 1);
    }

    #[test]
    fn test_single_flight_while_processing() {
        let t0 = Instant::now();
        let mut p = started(t0);
        activate_and_dispatch(&mut p, t0);

        let later = t0 + Duration::from_secs(2);
        let actions = p.handle(Input::Audio(audio(0.9, 3)), later);
        assert_eq!(wake_events(&actions), 0);
        assert!(dispatch_ticket(&actions).is_none());
        assert_eq!(p.state(), SessionState::Processing);
    }

    #[test]
    fn test_response_releases_guard_and_records_history() {
        let t0 = Instant::now();
        let mut p = started(t0);
        let ticket = activate_and_dispatch(&mut p, t0);

        let actions = p.handle(
            Input::Pipeline(DispatchEvent {
                ticket,
                event: PipelineEvent::Transcription {
                    text: "what time is it".to_string(),
                },
            }),
            t0,
        );
        assert!(matches!(sent(&actions)[..], [ServerMessage::Transcription { .. }]));

        let actions = p.handle(response(ticket), t0);
        match &actions[..] {
            [Action::Send(ServerMessage::Response { text, audio_bytes, .. }), Action::SendAudio(bytes)] => {
                assert_eq!(text, "noon");
                assert_eq!(*audio_bytes, 6);
                assert_eq!(bytes.len(), 6);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Listening);
        assert!(!p.session().unwrap().is_processing());

        // Next dispatch carries the previous exchange
        let later = t0 + Duration::from_secs(1);
        let mut actions = p.handle(Input::Audio(audio(0.8, 1)), later);
        actions.extend(p.handle(Input::Audio(audio(0.2, 1)), later));
        actions.extend(p.handle(Input::Audio(audio(0.0, 2)), later));
        match actions.iter().find(|a| matches!(a, Action::Dispatch { .. })) {
            Some(Action::Dispatch { context, ticket: next, .. }) => {
                assert_ne!(*next, ticket);
                assert_eq!(context.history.len(), 2);
                assert_eq!(context.history[0].role, Role::User);
                assert_eq!(context.history[1].content, "noon");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_failure_reports_stage() {
        let t0 = Instant::now();
        let mut p = started(t0);
        let ticket = activate_and_dispatch(&mut p, t0);

        let actions = p.handle(
            Input::Pipeline(DispatchEvent {
                ticket,
                event: PipelineEvent::Failed(Error::PipelineTimeout {
                    stage: Stage::Reasoning,
                    timeout: Duration::from_secs(30),
                }),
            }),
            t0,
        );

        match sent(&actions)[..] {
            [ServerMessage::Error { stage, code, .. }] => {
                assert_eq!(stage, "reasoning");
                assert_eq!(code, "pipeline_timeout");
            }
            ref other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Listening);
        assert!(!p.session().unwrap().is_processing());
    }

    #[test]
    fn test_dispatch_rejection_discards_utterance() {
        let t0 = Instant::now();
        let mut p = started(t0);
        let ticket = activate_and_dispatch(&mut p, t0);

        let actions = p.handle(
            Input::Pipeline(DispatchEvent {
                ticket,
                event: PipelineEvent::Failed(Error::DownstreamServiceError {
                    stage: Stage::Dispatch,
                    message: "dispatch capacity exhausted".to_string(),
                }),
            }),
            t0,
        );
        assert!(matches!(
            sent(&actions)[..],
            [ServerMessage::Error { stage, .. }] if stage == "dispatch"
        ));
        assert_eq!(p.state(), SessionState::Listening);
    }

    #[test]
    fn test_reset_during_processing() {
        let t0 = Instant::now();
        let mut p = started(t0);
        let stale = activate_and_dispatch(&mut p, t0);

        let actions = p.handle(Input::Text(r#"{"type":"reset_processing"}"#.to_string()), t0);
        assert!(matches!(actions[0], Action::CancelDispatch));
        assert_eq!(sent(&actions), vec![&ServerMessage::ProcessingReset]);
        assert_eq!(p.state(), SessionState::Listening);

        // Old dispatch result is discarded
        assert!(p.handle(response(stale), t0).is_empty());

        let fresh = activate_and_dispatch(&mut p, t0 + Duration::from_secs(1));
        assert_ne!(fresh, stale);
    }

    #[test]
    fn test_reset_in_any_state_acknowledged_once() {
        let mut p = protocol();
        let actions = p.handle(Input::Text(r#"{"type":"reset_processing"}"#.to_string()), Instant::now());
        assert_eq!(sent(&actions), vec![&ServerMessage::ProcessingReset]);
        assert!(!p.is_closed());

        let mut p = started(Instant::now());
        let actions = p.handle(Input::Text(r#"{"type":"reset_processing"}"#.to_string()), Instant::now());
        assert_eq!(actions.len(), 1);
        assert_eq!(sent(&actions), vec![&ServerMessage::ProcessingReset]);
    }

    #[test]
    fn test_no_speech_abandons_utterance() {
        let t0 = Instant::now();
        let mut p = started(t0);
        p.handle(Input::Audio(audio(0.8, 1)), t0);

        let actions = p.handle(Input::Audio(audio(0.0, 5)), t0);
        match sent(&actions)[..] {
            [ServerMessage::Error { stage, code, .. }] => {
                assert_eq!(stage, "utterance");
                assert_eq!(code, "no_speech");
            }
            ref other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(p.state(), SessionState::Listening);
        assert!(!p.session().unwrap().is_processing());
    }

    #[test]
    fn test_end_utterance_dispatches_immediately() {
        let t0 = Instant::now();
        let mut p = started(t0);
        p.handle(Input::Audio(audio(0.8, 1)), t0);
        p.handle(Input::Audio(audio(0.2, 1)), t0);

        let actions = p.handle(Input::Text(r#"{"type":"end_utterance"}"#.to_string()), t0);
        assert!(dispatch_ticket(&actions).is_some());
        assert_eq!(p.state(), SessionState::Processing);
    }

    #[test]
    fn test_protocol_violations_close() {
        let t0 = Instant::now();

        let mut p = protocol();
        let actions = p.handle(Input::Audio(audio(0.8, 1)), t0);
        assert!(matches!(actions.last(), Some(Action::Close)));
        assert!(matches!(
            sent(&actions)[..],
            [ServerMessage::Error { code, .. }] if code == "protocol_violation"
        ));
        assert!(p.is_closed());
        assert!(p.handle(Input::Text(r#"{"type":"ping"}"#.to_string()), t0).is_empty());

        let mut p = started(t0);
        let actions = p.handle(Input::Text(r#"{"type":"start_session"}"#.to_string()), t0);
        assert!(matches!(actions.last(), Some(Action::Close)));
        assert_eq!(p.state(), SessionState::Closed);

        let mut p = started(t0);
        let actions = p.handle(Input::Text("{nope".to_string()), t0);
        assert!(matches!(actions.last(), Some(Action::Close)));
    }

    #[test]
    fn test_unknown_session_id_rejected_without_side_effects() {
        let t0 = Instant::now();
        let mut p = started(t0);
        p.handle(Input::Audio(audio(0.8, 1)), t0);

        let actions = p.handle(
            Input::Text(r#"{"type":"reset_processing","session_id":"someone-else"}"#.to_string()),
            t0,
        );
        assert!(matches!(
            sent(&actions)[..],
            [ServerMessage::Error { code, .. }] if code == "session_not_found"
        ));
        assert!(!p.is_closed());
        assert_eq!(p.state(), SessionState::Activated);

        let id = p.session_id().unwrap().to_string();
        let text = format!(r#"{{"type":"ping","session_id":"{id}"}}"#);
        assert_eq!(sent(&p.handle(Input::Text(text), t0)), vec![&ServerMessage::Pong]);
    }

    #[test]
    fn test_invalid_audio_keeps_session() {
        let t0 = Instant::now();
        let mut p = started(t0);

        let actions = p.handle(Input::Audio(vec![1, 2, 3]), t0);
        assert!(matches!(
            sent(&actions)[..],
            [ServerMessage::Error { stage, code, .. }]
                if stage == "audio" && code == "invalid_audio_format"
        ));
        assert_eq!(p.state(), SessionState::Listening);

        assert_eq!(wake_events(&p.handle(Input::Audio(audio(0.8, 1)), t0)), 1);
    }

    #[test]
    fn test_model_unavailable_reported_once() {
        let t0 = Instant::now();
        let mut p = SessionProtocol::new(detector(true), session_config());

        let greeting = p.greeting();
        match sent(&greeting)[..] {
            [ServerMessage::Connected { models, .. }, ServerMessage::Error { stage, code, .. }] => {
                assert!(models.is_empty());
                assert_eq!(stage, "detector");
                assert_eq!(code, "model_unavailable");
            }
            ref other => panic!("unexpected: {other:?}"),
        }

        p.handle(Input::Text(r#"{"type":"start_session"}"#.to_string()), t0);
        assert!(p.handle(Input::Audio(audio(0.8, 3)), t0).is_empty());
        assert_eq!(p.state(), SessionState::Listening);
    }

    #[test]
    fn test_disconnect_cancels_in_flight_dispatch() {
        let t0 = Instant::now();
        let mut p = started(t0);
        let ticket = activate_and_dispatch(&mut p, t0);

        let actions = p.handle(Input::Disconnect, t0);
        assert!(matches!(actions[..], [Action::CancelDispatch]));
        assert_eq!(p.state(), SessionState::Closed);
        assert!(p.handle(response(ticket), t0).is_empty());
    }

    #[test]
    fn test_idle_timeout_closes() {
        let mut p = started(Instant::now());
        let actions = p.handle(Input::IdleTimeout, Instant::now());

        assert!(matches!(
            sent(&actions)[..],
            [ServerMessage::Error { code, .. }] if code == "idle_timeout"
        ));
        assert!(matches!(actions.last(), Some(Action::Close)));
        assert!(p.is_closed());
    }

    #[test]
    fn test_control_flood_is_a_violation() {
        let t0 = Instant::now();
        let mut p = started(t0);
        let ticket = activate_and_dispatch(&mut p, t0);

        let actions = p.handle(Input::Flooded, t0);
        assert!(actions.iter().any(|a| matches!(a, Action::CancelDispatch)));
        assert!(matches!(
            sent(&actions)[..],
            [ServerMessage::Error { code, .. }] if code == "protocol_violation"
        ));
        assert!(matches!(actions.last(), Some(Action::Close)));
        assert!(p.is_closed());
        assert!(p.handle(response(ticket), t0).is_empty());
    }

    #[test]
    fn test_end_session_closes() {
        let mut p = started(Instant::now());
        let actions = p.handle(Input::Text(r#"{"type":"end_session"}"#.to_string()), Instant::now());
        assert!(matches!(actions[..], [Action::Close]));
    }
}
