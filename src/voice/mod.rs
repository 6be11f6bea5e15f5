//! Voice processing module
//!
//! Audio framing, wake word detection, and the STT/TTS collaborators used
//! by the pipeline.

mod audio;
mod detector;
mod features;
mod model;
mod stt;
mod tts;

pub use audio::{
    AudioFrame, CHANNELS, DEFAULT_FRAME_SAMPLES, FrameAssembler, SAMPLE_RATE, bytes_to_pcm,
    decode_payload, pcm_to_bytes, pcm_to_wav, resample, rms, samples_duration,
};
pub use detector::{DetectionResult, LabelScore, WakeWordDetector};
pub use features::{BandEnergies, BandExtractor, MEL_BANDS, cosine_similarity};
pub use model::{
    BACKEND_TEMPLATE, Classifier, ModelLoader, TemplateClassifier, TemplateLoader, WakeWordModel,
    pretrained_names,
};
pub use stt::SpeechToText;
pub use tts::TextToSpeech;
