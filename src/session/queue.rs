//! Bounded per-connection inbound queue
//!
//! The socket reader pushes; the session loop pops in arrival order. Audio
//! is bounded in bytes: once the budget is reached the oldest audio is
//! dropped. Control messages are bounded in count and overflowing them
//! closes the queue.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// A message received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// JSON control message
    Control(String),
    /// Binary audio payload
    Audio(Vec<u8>),
    /// The client sent control messages faster than they were handled
    Flooded,
}

/// Outcome of [`InboundQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// Queued without loss
    Queued,
    /// Queued after dropping this many bytes of older audio
    DroppedAudio(usize),
    /// Control bound exceeded; the queue is now closed
    Overflow,
    /// The queue was already closed
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Inbound>,
    audio_bytes: usize,
    control: usize,
    dropped_bytes: u64,
    flooded: bool,
    closed: bool,
}

/// Ordered inbound queue with drop-oldest audio backpressure
#[derive(Debug)]
pub struct InboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    audio_budget: usize,
    control_depth: usize,
}

impl InboundQueue {
    /// Queue holding at most `depth` frames of PCM16 audio and `depth`
    /// control messages
    #[must_use]
    pub fn new(depth: usize, frame_samples: usize) -> Self {
        let depth = depth.max(1);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            audio_budget: depth * frame_samples.max(1) * 2,
            control_depth: depth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message
    pub fn push(&self, item: Inbound) -> Pushed {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return Pushed::Closed;
            }

            match item {
                Inbound::Audio(payload) => self.push_audio(&mut state, payload),
                Inbound::Control(text) => {
                    if state.control >= self.control_depth {
                        tracing::warn!(depth = self.control_depth, "control queue overflow, closing");
                        state.flooded = true;
                        state.closed = true;
                        Pushed::Overflow
                    } else {
                        state.control += 1;
                        state.items.push_back(Inbound::Control(text));
                        Pushed::Queued
                    }
                }
                Inbound::Flooded => {
                    state.flooded = true;
                    state.closed = true;
                    Pushed::Overflow
                }
            }
        };

        self.notify.notify_one();
        outcome
    }

    fn push_audio(&self, state: &mut QueueState, mut payload: Vec<u8>) -> Pushed {
        let mut dropped = 0;

        if payload.len() > self.audio_budget {
            if payload.starts_with(b"RIFF") {
                // A WAV container cannot be cut without breaking it
                dropped += payload.len();
                payload.clear();
            } else {
                // Keep the newest samples of an oversized raw payload
                let excess = payload.len() - self.audio_budget;
                let excess = excess + excess % 2;
                payload.drain(..excess);
                dropped += excess;
            }
        }

        while state.audio_bytes + payload.len() > self.audio_budget {
            let Some(pos) = state.items.iter().position(|i| matches!(i, Inbound::Audio(_))) else {
                break;
            };
            if let Some(Inbound::Audio(old)) = state.items.remove(pos) {
                state.audio_bytes -= old.len();
                dropped += old.len();
            }
        }

        if !payload.is_empty() {
            state.audio_bytes += payload.len();
            state.items.push_back(Inbound::Audio(payload));
        }

        if dropped == 0 {
            return Pushed::Queued;
        }
        state.dropped_bytes += dropped as u64;
        tracing::warn!(
            budget_bytes = self.audio_budget,
            dropped_bytes = dropped,
            total_dropped_bytes = state.dropped_bytes,
            "audio queue full, dropping oldest audio"
        );
        Pushed::DroppedAudio(dropped)
    }

    /// Next message in arrival order; `None` once closed and drained
    ///
    /// A flooded queue yields [`Inbound::Flooded`] once after draining.
    pub async fn pop(&self) -> Option<Inbound> {
        loop {
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    match &item {
                        Inbound::Audio(bytes) => state.audio_bytes -= bytes.len(),
                        Inbound::Control(_) => state.control -= 1,
                        Inbound::Flooded => {}
                    }
                    return Some(item);
                }
                if state.closed {
                    if std::mem::take(&mut state.flooded) {
                        return Some(Inbound::Flooded);
                    }
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting messages; queued ones can still be popped
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Queued messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Queued audio bytes
    #[must_use]
    pub fn audio_bytes(&self) -> usize {
        self.lock().audio_bytes
    }

    /// Audio bytes dropped so far
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.lock().dropped_bytes
    }
}
