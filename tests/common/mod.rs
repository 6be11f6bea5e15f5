//! Shared test utilities
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_wake::config::{DetectorConfig, SessionConfig};
use beacon_wake::pipeline::{
    Provider, Reply, Responder, SessionContext, StageTimeouts, Synthesizer, TokenUsage,
    Transcriber,
};
use beacon_wake::voice::{Classifier, ModelLoader, WakeWordModel, pcm_to_bytes};
use beacon_wake::{ApiServerBuilder, Error, StreamingPipelineDispatcher, WakeWordDetector};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// 100ms frames keep the tests readable
pub const FRAME: usize = 1600;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Confidence equals peak amplitude as a fraction of full scale
pub struct PeakClassifier;

impl Classifier for PeakClassifier {
    fn score(&self, samples: &[i16]) -> f32 {
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        f32::from(peak) / f32::from(i16::MAX.unsigned_abs())
    }
}

/// One [`PeakClassifier`] per configured model name
pub struct PeakLoader;

impl ModelLoader for PeakLoader {
    fn load(&self, config: &DetectorConfig) -> beacon_wake::Result<Vec<WakeWordModel>> {
        Ok(config
            .models
            .iter()
            .map(|name| {
                let threshold = config.threshold_for(name).unwrap_or(config.threshold);
                WakeWordModel::new(name.clone(), threshold, "peak", Box::new(PeakClassifier))
            })
            .collect())
    }
}

/// Loader that blocks before handing out peak classifiers
pub struct SlowLoader(pub Duration);

impl ModelLoader for SlowLoader {
    fn load(&self, config: &DetectorConfig) -> beacon_wake::Result<Vec<WakeWordModel>> {
        std::thread::sleep(self.0);
        PeakLoader.load(config)
    }
}

/// Loader whose assets are always missing
pub struct MissingLoader;

impl ModelLoader for MissingLoader {
    fn load(&self, _config: &DetectorConfig) -> beacon_wake::Result<Vec<WakeWordModel>> {
        Err(Error::ModelUnavailable("model file not found".to_string()))
    }
}

pub fn detector_config() -> DetectorConfig {
    DetectorConfig {
        models: vec!["alexa".to_string()],
        frame_samples: FRAME,
        ..DetectorConfig::default()
    }
}

pub fn peak_detector() -> Arc<WakeWordDetector> {
    Arc::new(WakeWordDetector::with_loader(detector_config(), PeakLoader))
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        debounce: Duration::ZERO,
        ..SessionConfig::default()
    }
}

/// Transcriber that always hears the same words
pub struct FixedStt(pub &'static str);

impl Provider for FixedStt {
    fn name(&self) -> &str {
        "fixed"
    }
}

#[async_trait]
impl Transcriber for FixedStt {
    async fn transcribe(&self, _wav: &[u8]) -> beacon_wake::Result<String> {
        Ok(self.0.to_string())
    }
}

/// Responder that echoes after a delay and records every context it sees
#[derive(Default)]
pub struct EchoResponder {
    pub delay: Duration,
    pub contexts: Mutex<Vec<SessionContext>>,
}

impl EchoResponder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SessionContext> {
        self.contexts.lock().unwrap().clone()
    }
}

impl Provider for EchoResponder {
    fn name(&self) -> &str {
        "echo"
    }
}

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(
        &self,
        transcript: &str,
        context: &SessionContext,
    ) -> beacon_wake::Result<Reply> {
        self.contexts.lock().unwrap().push(context.clone());
        tokio::time::sleep(self.delay).await;
        Ok(Reply {
            text: format!("you said: {transcript}"),
            usage: TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 3,
            },
        })
    }
}

/// Synthesizer producing a fixed number of samples
pub struct ToneTts(pub usize);

impl Provider for ToneTts {
    fn name(&self) -> &str {
        "tone"
    }
}

#[async_trait]
impl Synthesizer for ToneTts {
    async fn synthesize(&self, _text: &str) -> beacon_wake::Result<Vec<i16>> {
        Ok(vec![500; self.0])
    }
}

pub fn dispatcher(
    responder: Arc<EchoResponder>,
    timeouts: StageTimeouts,
    max_concurrent: usize,
) -> Arc<StreamingPipelineDispatcher> {
    Arc::new(
        StreamingPipelineDispatcher::builder()
            .transcriber(Arc::new(FixedStt("what time is it")))
            .responder(responder)
            .synthesizer(Arc::new(ToneTts(320)))
            .timeouts(timeouts)
            .max_concurrent(max_concurrent)
            .build(),
    )
}

pub fn quick_dispatcher() -> Arc<StreamingPipelineDispatcher> {
    dispatcher(Arc::new(EchoResponder::default()), StageTimeouts::default(), 8)
}

/// Serve on an ephemeral port and return its address
pub async fn spawn_server(
    detector: Arc<WakeWordDetector>,
    dispatcher: Arc<StreamingPipelineDispatcher>,
    session: SessionConfig,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ApiServerBuilder::new(detector, dispatcher)
        .session_config(session)
        .build();
    tokio::spawn(server.serve(listener));
    addr
}

pub async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket handshake failed");
    ws
}

/// Next frame from the server, failing the test after a few seconds
pub async fn recv(ws: &mut Ws) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for server message")
        .expect("stream ended")
        .expect("websocket error")
}

/// Next frame, which must be a JSON control message
pub async fn recv_json(ws: &mut Ws) -> Value {
    let msg = recv(ws).await;
    let text = msg.to_text().expect("expected a text frame");
    serde_json::from_str(text).expect("server sent invalid JSON")
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_pcm(ws: &mut Ws, samples: &[i16]) {
    ws.send(Message::Binary(pcm_to_bytes(samples).into()))
        .await
        .unwrap();
}

/// One frame that scores well above the default threshold
pub fn wake_frame() -> Vec<i16> {
    vec![30_000; FRAME]
}

/// One frame of speech-level audio that does not trigger detection
pub fn speech_frame() -> Vec<i16> {
    vec![8_000; FRAME]
}

/// Connect, consume `connected`, start a session and return its id
pub async fn start_session(addr: SocketAddr) -> (Ws, String) {
    let mut ws = connect(addr, "/ws/listen").await;
    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["type"], "connected");

    send_json(&mut ws, serde_json::json!({"type": "start_session"})).await;
    let started = recv_json(&mut ws).await;
    assert_eq!(started["type"], "session_started");
    let id = started["session_id"].as_str().unwrap().to_string();
    (ws, id)
}

/// Wake the session and submit one utterance
pub async fn activate_and_speak(ws: &mut Ws) {
    send_pcm(ws, &wake_frame()).await;
    let detected = recv_json(ws).await;
    assert_eq!(detected["type"], "wake_word_detected");

    send_pcm(ws, &speech_frame()).await;
    send_json(ws, serde_json::json!({"type": "end_utterance"})).await;
}
