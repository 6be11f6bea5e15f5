//! Wake-word-only stream
//!
//! Same framing, detection and gating as a session, without sessions or
//! dispatch. Only `ping` is accepted as a control message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::gate::ActivationGate;
use super::messages::{ClientEnvelope, ClientMessage, ServerMessage};
use super::protocol::{Action, DetectorFeed, Input};
use crate::Error;
use crate::voice::WakeWordDetector;

/// Sans-IO handler for one `/ws/wakeword` connection
#[derive(Debug)]
pub struct WakeWordListener {
    feed: DetectorFeed,
    gate: ActivationGate,
    activations: u64,
    closed: bool,
}

impl WakeWordListener {
    #[must_use]
    pub fn new(detector: Arc<WakeWordDetector>, debounce: Duration) -> Self {
        Self {
            feed: DetectorFeed::new(detector),
            gate: ActivationGate::new(debounce),
            activations: 0,
            closed: false,
        }
    }

    /// Actions to run right after the transport handshake
    pub fn greeting(&mut self) -> Vec<Action> {
        self.feed.greeting()
    }

    /// Activations emitted so far
    #[must_use]
    pub const fn activations(&self) -> u64 {
        self.activations
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Advance the listener; `now` drives the debounce clock
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }

        match input {
            Input::Text(text) => match ClientEnvelope::parse(&text) {
                Ok(ClientEnvelope {
                    message: ClientMessage::Ping,
                    ..
                }) => out.push(Action::Send(ServerMessage::Pong)),
                Ok(envelope) => {
                    let e = Error::ProtocolViolation(format!(
                        "{:?} is not supported on the wake word stream",
                        envelope.message
                    ));
                    self.violation(&e, &mut out);
                }
                Err(e) => self.violation(&e, &mut out),
            },
            Input::Audio(payload) => {
                for frame in self.feed.frames(&payload, &mut out) {
                    let Some(result) = self.feed.detect(&frame, &mut out) else {
                        continue;
                    };
                    if let Some(activation) = self.gate.evaluate(&result, now) {
                        self.activations += 1;
                        out.push(Action::Send(ServerMessage::WakeWordDetected {
                            label: activation.label,
                            detected: true,
                            confidence: activation.confidence,
                        }));
                    }
                }
            }
            Input::Pipeline(_) => {}
            Input::IdleTimeout => {
                out.push(Action::Send(ServerMessage::Error {
                    stage: "session".to_string(),
                    code: "idle_timeout".to_string(),
                    message: "wake word stream idle".to_string(),
                }));
                out.push(Action::Close);
                self.closed = true;
            }
            Input::Disconnect => self.closed = true,
            Input::Flooded => {
                let e = Error::ProtocolViolation("too many queued control messages".to_string());
                self.violation(&e, &mut out);
            }
        }

        out
    }

    fn violation(&mut self, error: &Error, out: &mut Vec<Action>) {
        tracing::warn!(error = %error, "protocol violation on wake word stream");
        out.push(Action::Send(ServerMessage::error("protocol", error)));
        out.push(Action::Close);
        self.closed = true;
    }
}
