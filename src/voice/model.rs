//! Wake word models and inference backends
//!
//! A model pairs a label with a classifier and a confidence threshold.
//! The built-in `template` backend scores frames by comparing their
//! log-mel band profile against a reference profile.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use super::audio::rms;
use super::features::{BandEnergies, BandExtractor, MEL_BANDS, cosine_similarity, remove_mean};
use crate::config::DetectorConfig;
use crate::{Error, Result};

/// Identifier of the built-in backend
pub const BACKEND_TEMPLATE: &str = "template";

/// Backends known elsewhere but not compiled into this build
const UNSUPPORTED_BACKENDS: &[&str] = &["onnx", "tflite"];

/// Frames quieter than this (normalized RMS) always score zero
pub const SILENCE_RMS: f32 = 0.005;

/// Frames at or above this RMS get the full similarity score
pub const FULL_SCALE_RMS: f32 = 0.03;

/// Pretrained templates compiled into the binary
const EMBEDDED_MODELS: &[(&str, &str)] = &[
    ("alexa", include_str!("../../models/alexa.json")),
    ("hey_jarvis", include_str!("../../models/hey_jarvis.json")),
    ("hey_mycroft", include_str!("../../models/hey_mycroft.json")),
];

/// Names of the pretrained models available without a file path
#[must_use]
pub fn pretrained_names() -> Vec<&'static str> {
    EMBEDDED_MODELS.iter().map(|(name, _)| *name).collect()
}

/// Scores one frame for a single label
///
/// Implementations must be read-only after construction; one instance
/// serves every session concurrently.
pub trait Classifier: Send + Sync {
    /// Confidence in [0, 1] that the frame belongs to the wake phrase
    fn score(&self, samples: &[i16]) -> f32;
}

/// A loaded, named classifier with its threshold
pub struct WakeWordModel {
    label: String,
    threshold: f32,
    backend: String,
    classifier: Box<dyn Classifier>,
}

impl fmt::Debug for WakeWordModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeWordModel")
            .field("label", &self.label)
            .field("threshold", &self.threshold)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl WakeWordModel {
    /// Wrap a classifier
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        threshold: f32,
        backend: impl Into<String>,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        Self {
            label: label.into(),
            threshold,
            backend: backend.into(),
            classifier,
        }
    }

    /// Label reported in detection results
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Confidence threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Inference backend identifier
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Score a frame, clamped to [0, 1]
    #[must_use]
    pub fn score(&self, samples: &[i16]) -> f32 {
        let confidence = self.classifier.score(samples);
        if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Produces the model set for a detector
///
/// Called at most once per detector; a failure is permanent.
pub trait ModelLoader: Send + Sync {
    /// Load every configured model
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` if the backend or any model cannot be loaded
    fn load(&self, config: &DetectorConfig) -> Result<Vec<WakeWordModel>>;
}

/// Model file / embedded template format
#[derive(Debug, Deserialize)]
struct TemplateSpec {
    label: String,
    bands: Vec<f32>,
    #[serde(default)]
    threshold: Option<f32>,
}

/// Template-matching classifier
pub struct TemplateClassifier {
    reference: BandEnergies,
    extractor: Arc<BandExtractor>,
}

impl TemplateClassifier {
    /// Build a classifier from a reference band profile
    ///
    /// # Errors
    ///
    /// Returns `ModelUnavailable` if the profile has the wrong length or non-finite values
    pub fn new(reference: &[f32], extractor: Arc<BandExtractor>) -> Result<Self> {
        let mut bands: BandEnergies = reference.try_into().map_err(|_| {
            Error::ModelUnavailable(format!(
                "template has {} bands, expected {MEL_BANDS}",
                reference.len()
            ))
        })?;
        if bands.iter().any(|b| !b.is_finite()) {
            return Err(Error::ModelUnavailable("template contains non-finite values".to_string()));
        }
        remove_mean(&mut bands);

        Ok(Self {
            reference: bands,
            extractor,
        })
    }
}

impl Classifier for TemplateClassifier {
    fn score(&self, samples: &[i16]) -> f32 {
        let level = rms(samples);
        if level < SILENCE_RMS {
            return 0.0;
        }

        let gate = ((level - SILENCE_RMS) / (FULL_SCALE_RMS - SILENCE_RMS)).min(1.0);
        let features = self.extractor.extract(samples);
        let similarity = cosine_similarity(&features, &self.reference).max(0.0);

        similarity * gate
    }
}

/// Loads pretrained names and JSON model files for the `template` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateLoader;

impl ModelLoader for TemplateLoader {
    fn load(&self, config: &DetectorConfig) -> Result<Vec<WakeWordModel>> {
        check_backend(&config.backend)?;

        let extractor = Arc::new(BandExtractor::new(config.sample_rate, config.frame_samples));
        let mut seen = HashSet::new();
        let mut models = Vec::with_capacity(config.models.len());

        for entry in &config.models {
            let spec = read_template(entry)?;
            if spec.label.trim().is_empty() {
                return Err(Error::ModelUnavailable(format!("model '{entry}' has an empty label")));
            }
            if !seen.insert(spec.label.clone()) {
                return Err(Error::ModelUnavailable(format!(
                    "duplicate wake word label '{}'",
                    spec.label
                )));
            }

            let threshold = config
                .threshold_for(&spec.label)
                .or(spec.threshold)
                .unwrap_or(config.threshold);
            let classifier = TemplateClassifier::new(&spec.bands, Arc::clone(&extractor))?;

            tracing::debug!(label = %spec.label, threshold, source = %entry, "loaded wake word model");
            models.push(WakeWordModel::new(
                spec.label,
                threshold,
                BACKEND_TEMPLATE,
                Box::new(classifier),
            ));
        }

        Ok(models)
    }
}

/// Reject backends this build cannot run
fn check_backend(backend: &str) -> Result<()> {
    if backend == BACKEND_TEMPLATE {
        return Ok(());
    }
    if UNSUPPORTED_BACKENDS.contains(&backend) {
        return Err(Error::ModelUnavailable(format!(
            "inference backend '{backend}' is not available in this build"
        )));
    }
    Err(Error::ModelUnavailable(format!("unknown inference backend '{backend}'")))
}

/// Resolve a model entry: embedded pretrained name first, then file path
fn read_template(entry: &str) -> Result<TemplateSpec> {
    if let Some((_, json)) = EMBEDDED_MODELS.iter().find(|(name, _)| *name == entry) {
        return serde_json::from_str(json)
            .map_err(|e| Error::ModelUnavailable(format!("embedded model '{entry}' is corrupt: {e}")));
    }

    let path = Path::new(entry);
    if !path.exists() {
        return Err(Error::ModelUnavailable(format!(
            "'{entry}' is neither a pretrained model ({}) nor an existing file",
            pretrained_names().join(", ")
        )));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelUnavailable(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ModelUnavailable(format!("failed to parse {}: {e}", path.display())))
}
