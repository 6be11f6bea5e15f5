//! Wake word detection
//!
//! One [`WakeWordDetector`] is shared by every connection. Models are
//! loaded lazily on first use under a one-time initializer; concurrent
//! first callers block until that load finishes. A failed load is kept
//! and returned to every later caller instead of being retried.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use serde::Serialize;

use super::audio::AudioFrame;
use super::model::{ModelLoader, TemplateLoader, WakeWordModel};
use crate::config::DetectorConfig;
use crate::{Error, Result};

/// Per-label outcome for one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LabelScore {
    /// Confidence reached the label's threshold
    pub detected: bool,
    /// Raw confidence in [0, 1]
    pub confidence: f32,
}

/// Scores for every configured label, in model order
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    seq: u64,
    scores: IndexMap<String, LabelScore>,
}

impl DetectionResult {
    /// Build a result from ordered label scores
    #[must_use]
    pub fn new(seq: u64, scores: IndexMap<String, LabelScore>) -> Self {
        Self { seq, scores }
    }

    /// Sequence number of the frame this result describes
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// All label scores
    #[must_use]
    pub const fn scores(&self) -> &IndexMap<String, LabelScore> {
        &self.scores
    }

    /// Score for one label
    #[must_use]
    pub fn get(&self, label: &str) -> Option<LabelScore> {
        self.scores.get(label).copied()
    }

    /// Whether any label crossed its threshold
    #[must_use]
    pub fn any_detected(&self) -> bool {
        self.scores.values().any(|s| s.detected)
    }

    /// Highest-confidence detected label (first in model order on ties)
    #[must_use]
    pub fn best_detection(&self) -> Option<(&str, f32)> {
        self.scores
            .iter()
            .filter(|(_, s)| s.detected)
            .fold(None, |best: Option<(&str, f32)>, (label, s)| match best {
                Some((_, c)) if c >= s.confidence => best,
                _ => Some((label.as_str(), s.confidence)),
            })
    }
}

type LoadOutcome = std::result::Result<Arc<[WakeWordModel]>, Error>;

/// Shared, lazily loaded wake word detector
pub struct WakeWordDetector {
    config: DetectorConfig,
    loader: Box<dyn ModelLoader>,
    models: OnceLock<LoadOutcome>,
    load_attempts: AtomicUsize,
}

impl std::fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("models", &self.config.models)
            .field("backend", &self.config.backend)
            .field("loaded", &self.models.get().map(Result::is_ok))
            .finish_non_exhaustive()
    }
}

impl WakeWordDetector {
    /// Create a detector using the built-in template backend
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_loader(config, TemplateLoader)
    }

    /// Create a detector with a custom model loader
    #[must_use]
    pub fn with_loader(config: DetectorConfig, loader: impl ModelLoader + 'static) -> Self {
        Self {
            config,
            loader: Box::new(loader),
            models: OnceLock::new(),
            load_attempts: AtomicUsize::new(0),
        }
    }

    /// Load the configured models (idempotent, thread-safe)
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` if loading failed, now or on an earlier call
    pub fn load(&self) -> Result<&[WakeWordModel]> {
        let outcome = self.models.get_or_init(|| {
            self.load_attempts.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                models = ?self.config.models,
                backend = %self.config.backend,
                "loading wake word models"
            );

            match self.loader.load(&self.config) {
                Ok(models) if models.is_empty() => {
                    tracing::error!("wake word loader returned no models");
                    Err(Error::ModelUnavailable("no wake word models loaded".to_string()))
                }
                Ok(models) => {
                    tracing::info!(count = models.len(), "wake word models ready");
                    Ok(Arc::from(models))
                }
                Err(e) => {
                    let e = match e {
                        Error::ModelUnavailable(_) => e,
                        other => Error::ModelUnavailable(other.to_string()),
                    };
                    tracing::error!(error = %e, "wake word models unavailable");
                    Err(e)
                }
            }
        });

        match outcome {
            Ok(models) => Ok(models),
            Err(e) => Err(e.clone()),
        }
    }

    /// Non-blocking readiness probe
    ///
    /// Triggers the lazy load but reports failure as `false`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.load().is_ok()
    }

    /// Score one frame against every model
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` if models cannot be loaded, or
    /// `InvalidAudioFormat` if the frame does not match the expected input
    pub fn detect(&self, frame: &AudioFrame) -> Result<DetectionResult> {
        let models = self.load()?;
        self.validate_frame(frame)?;

        let mut scores = IndexMap::with_capacity(models.len());
        for model in models {
            let confidence = model.score(frame.samples());
            let detected = confidence > 0.0 && confidence >= model.threshold();

            if detected {
                tracing::info!(
                    label = model.label(),
                    confidence,
                    threshold = model.threshold(),
                    seq = frame.seq(),
                    "wake word detected"
                );
            }

            scores.insert(model.label().to_string(), LabelScore { detected, confidence });
        }

        Ok(DetectionResult::new(frame.seq(), scores))
    }

    fn validate_frame(&self, frame: &AudioFrame) -> Result<()> {
        if frame.channels() != 1 {
            return Err(Error::InvalidAudioFormat(format!(
                "expected mono audio, got {} channels",
                frame.channels()
            )));
        }
        if frame.sample_rate() != self.config.sample_rate {
            return Err(Error::InvalidAudioFormat(format!(
                "expected {} Hz, got {} Hz",
                self.config.sample_rate,
                frame.sample_rate()
            )));
        }
        if frame.samples().len() != self.config.frame_samples {
            return Err(Error::InvalidAudioFormat(format!(
                "expected {} samples per frame, got {}",
                self.config.frame_samples,
                frame.samples().len()
            )));
        }
        Ok(())
    }

    /// Labels of the loaded models
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` if models cannot be loaded
    pub fn labels(&self) -> Result<Vec<String>> {
        Ok(self.load()?.iter().map(|m| m.label().to_string()).collect())
    }

    /// Default configured threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Detector configuration
    #[must_use]
    pub const fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Samples per frame expected by [`detect`](Self::detect)
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        self.config.frame_samples
    }

    /// How many times the loader has actually run (0 or 1)
    #[must_use]
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::Classifier;
    use std::time::Duration;

    /// Confidence equals peak amplitude as a fraction of full scale
    struct PeakClassifier;

    impl Classifier for PeakClassifier {
        fn score(&self, samples: &[i16]) -> f32 {
            let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
            f32::from(peak) / f32::from(i16::MAX.unsigned_abs())
        }
    }

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, config: &DetectorConfig) -> Result<Vec<WakeWordModel>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            if self.fail {
                return Err(Error::ModelUnavailable("assets missing".to_string()));
            }
            Ok(config
                .models
                .iter()
                .map(|m| WakeWordModel::new(m.clone(), config.threshold, "test", Box::new(PeakClassifier)))
                .collect())
        }
    }

    fn config(models: &[&str]) -> DetectorConfig {
        DetectorConfig {
            models: models.iter().map(ToString::to_string).collect(),
            frame_samples: 4,
            ..DetectorConfig::default()
        }
    }

    fn detector(models: &[&str], fail: bool) -> (Arc<WakeWordDetector>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = CountingLoader {
            calls: Arc::clone(&calls),
            fail,
        };
        (Arc::new(WakeWordDetector::with_loader(config(models), loader)), calls)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn frame(seq: u64, amplitude: f32) -> AudioFrame {
        let peak = (amplitude * f32::from(i16::MAX)) as i16;
        AudioFrame::new(seq, vec![peak, -peak, peak, -peak])
    }

    #[test]
    fn test_concurrent_load_runs_once() {
        let (detector, calls) = detector(&["alexa"], false);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || detector.load().map(<[_]>::len))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(detector.load_attempts(), 1);
    }

    #[test]
    fn test_load_failure_is_sticky() {
        let (detector, calls) = detector(&["alexa"], true);

        assert!(matches!(detector.load(), Err(Error::ModelUnavailable(_))));
        assert!(matches!(detector.detect(&frame(0, 0.9)), Err(Error::ModelUnavailable(_))));
        assert!(!detector.is_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_silence_never_detected() {
        let (detector, _) = detector(&["alexa", "hey_jarvis"], false);

        let result = detector.detect(&AudioFrame::new(0, vec![0; 4])).unwrap();
        assert!(!result.any_detected());
        assert_eq!(result.scores().len(), 2);
        assert_eq!(result.get("alexa").unwrap().confidence, 0.0);
    }

    #[test]
    fn test_detection_above_threshold() {
        let (detector, _) = detector(&["alexa"], false);

        let result = detector.detect(&frame(7, 0.8)).unwrap();
        let score = result.get("alexa").unwrap();
        assert!(score.detected);
        assert!((score.confidence - 0.8).abs() < 0.01);
        assert_eq!(result.seq(), 7);

        let result = detector.detect(&frame(8, 0.3)).unwrap();
        assert!(!result.any_detected());
    }

    #[test]
    fn test_invalid_frame_rejected() {
        let (detector, _) = detector(&["alexa"], false);

        let wrong_len = AudioFrame::new(0, vec![1; 3]);
        assert!(matches!(detector.detect(&wrong_len), Err(Error::InvalidAudioFormat(_))));

        let wrong_rate = AudioFrame::with_format(0, vec![1; 4], 8000, 1);
        assert!(matches!(detector.detect(&wrong_rate), Err(Error::InvalidAudioFormat(_))));

        let stereo = AudioFrame::with_format(0, vec![1; 4], 16000, 2);
        assert!(matches!(detector.detect(&stereo), Err(Error::InvalidAudioFormat(_))));

        // Detector keeps working after a bad frame
        assert!(detector.detect(&frame(1, 0.9)).unwrap().any_detected());
    }

    #[test]
    fn test_best_detection_picks_highest_confidence() {
        let mut scores = IndexMap::new();
        scores.insert("alexa".to_string(), LabelScore { detected: true, confidence: 0.6 });
        scores.insert("hey_jarvis".to_string(), LabelScore { detected: true, confidence: 0.9 });
        scores.insert("hey_mycroft".to_string(), LabelScore { detected: false, confidence: 0.95 });

        let result = DetectionResult::new(0, scores);
        assert_eq!(result.best_detection(), Some(("hey_jarvis", 0.9)));
    }

    #[test]
    fn test_builtin_backend_ignores_silence() {
        let detector = WakeWordDetector::new(DetectorConfig::default());
        assert!(detector.is_ready());

        let silence = AudioFrame::new(0, vec![0; detector.frame_samples()]);
        assert!(!detector.detect(&silence).unwrap().any_detected());
    }
}
