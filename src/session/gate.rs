//! Threshold + debounce gate over raw detections

use std::time::{Duration, Instant};

use crate::voice::DetectionResult;

/// A gated, debounced wake phrase
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    /// Highest-confidence label in the triggering frame
    pub label: String,
    pub confidence: f32,
    /// Sequence number of the triggering frame
    pub seq: u64,
}

/// Turns per-frame detections into at most one activation per utterance
///
/// A single session-wide clock is used for every label.
#[derive(Debug, Clone)]
pub struct ActivationGate {
    debounce: Duration,
    last_activation: Option<Instant>,
}

impl ActivationGate {
    #[must_use]
    pub const fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last_activation: None,
        }
    }

    /// When the gate last fired
    #[must_use]
    pub const fn last_activation(&self) -> Option<Instant> {
        self.last_activation
    }

    /// Emit an activation if any label fired and the window has elapsed
    pub fn evaluate(&mut self, result: &DetectionResult, now: Instant) -> Option<Activation> {
        let (label, confidence) = result.best_detection()?;

        if let Some(last) = self.last_activation {
            let since = now.saturating_duration_since(last);
            if since < self.debounce {
                tracing::trace!(
                    label,
                    since_ms = since.as_millis(),
                    "detection suppressed by debounce"
                );
                return None;
            }
        }

        self.last_activation = Some(now);
        Some(Activation {
            label: label.to_string(),
            confidence,
            seq: result.seq(),
        })
    }
}
