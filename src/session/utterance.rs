//! Utterance capture after an activation
//!
//! Durations are measured in captured audio, not wall-clock time, so a
//! client streaming faster than real time gets the same segmentation.

use std::time::Duration;

use crate::config::SessionConfig;
use crate::voice::{AudioFrame, samples_duration};

/// Why a capture finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Trailing silence after speech
    Silence,
    /// Reached the maximum utterance length
    MaxDuration,
    /// Client sent `end_utterance`
    ClientRequest,
}

/// Capture progress after one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Keep feeding frames
    Continue,
    /// Utterance is ready to dispatch
    Complete(EndReason),
    /// No speech was heard in time; abandon the utterance
    NoSpeech,
}

/// Accumulates utterance audio and detects its end
#[derive(Debug)]
pub struct UtteranceCapture {
    samples: Vec<i16>,
    sample_rate: u32,
    speech_rms: f32,
    silence_limit: Duration,
    max_duration: Duration,
    no_speech_timeout: Duration,
    heard_speech: bool,
    trailing_silence: Duration,
}

impl UtteranceCapture {
    /// Start capturing with the session's thresholds
    #[must_use]
    pub fn new(config: &SessionConfig, sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            speech_rms: config.speech_rms,
            silence_limit: config.utterance_silence,
            max_duration: config.max_utterance,
            no_speech_timeout: config.no_speech_timeout,
            heard_speech: false,
            trailing_silence: Duration::ZERO,
        }
    }

    /// Append one frame and report whether the utterance has ended
    pub fn push(&mut self, frame: &AudioFrame) -> CaptureStatus {
        self.samples.extend_from_slice(frame.samples());

        if frame.rms() >= self.speech_rms {
            self.heard_speech = true;
            self.trailing_silence = Duration::ZERO;
        } else if self.heard_speech {
            self.trailing_silence += frame.duration();
        }

        let captured = self.duration();
        if !self.heard_speech {
            if captured >= self.no_speech_timeout {
                return CaptureStatus::NoSpeech;
            }
            return CaptureStatus::Continue;
        }
        if captured >= self.max_duration {
            return CaptureStatus::Complete(EndReason::MaxDuration);
        }
        if self.trailing_silence >= self.silence_limit {
            return CaptureStatus::Complete(EndReason::Silence);
        }
        CaptureStatus::Continue
    }

    /// Finish on client request
    ///
    /// Returns `NoSpeech` if nothing has been captured yet.
    #[must_use]
    pub fn end(&self) -> CaptureStatus {
        if self.samples.is_empty() {
            CaptureStatus::NoSpeech
        } else {
            CaptureStatus::Complete(EndReason::ClientRequest)
        }
    }

    /// Whether any frame reached the speech level
    #[must_use]
    pub const fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    /// Audio captured so far
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }

    /// Take the captured samples
    #[must_use]
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}
