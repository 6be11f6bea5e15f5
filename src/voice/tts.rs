//! Text-to-speech (TTS) collaborators
//!
//! Both providers are asked for raw PCM16LE so the result can be sent to
//! the client without a decoder. `OpenAI` only offers 24kHz PCM, which is
//! resampled to the protocol rate.

use async_trait::async_trait;

use super::audio::{SAMPLE_RATE, bytes_to_pcm, resample};
use crate::pipeline::{Provider, Synthesizer};
use crate::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";

/// Sample rate of `OpenAI`'s `pcm` response format
const OPENAI_PCM_RATE: u32 = 24_000;

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

/// Synthesizes response text to PCM16 mono audio
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    base_url: String,
    provider: TtsProvider,
}

impl std::fmt::Debug for TextToSpeech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextToSpeech")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

impl TextToSpeech {
    /// Create a synthesizer using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, model: String, voice: String, speed: f32) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            base_url: OPENAI_BASE_URL.to_string(),
            provider: TtsProvider::OpenAI,
        })
    }

    /// Create a synthesizer using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: String, model: String, voice_id: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0,
            model,
            base_url: ELEVENLABS_BASE_URL.to_string(),
            provider: TtsProvider::ElevenLabs,
        })
    }

    /// Point requests at a different API root (proxies, tests)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<i16>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "pcm",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        let samples = decode_pcm(&audio)?;
        resample(&samples, OPENAI_PCM_RATE, SAMPLE_RATE)
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<i16>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/text-to-speech/{}", self.base_url, self.voice))
            .query(&[("output_format", "pcm_16000")])
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        decode_pcm(&audio)
    }
}

/// Raw PCM16LE body to samples
fn decode_pcm(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Tts(format!(
            "synthesized audio has odd byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes_to_pcm(bytes))
}

impl Provider for TextToSpeech {
    fn name(&self) -> &str {
        match self.provider {
            TtsProvider::OpenAI => "openai",
            TtsProvider::ElevenLabs => "elevenlabs",
        }
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<i16>> {
        let samples = match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await?,
        };

        tracing::info!(
            provider = self.name(),
            samples = samples.len(),
            "synthesis complete"
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_rejected() {
        assert!(matches!(
            TextToSpeech::new_openai(String::new(), "tts-1".into(), "alloy".into(), 1.0),
            Err(Error::Config(_))
        ));
        assert!(TextToSpeech::new_elevenlabs(String::new(), "m".into(), "v".into()).is_err());
    }

    #[test]
    fn test_decode_pcm() {
        assert_eq!(decode_pcm(&[0x01, 0x00, 0xff, 0xff]).unwrap(), vec![1, -1]);
        assert!(matches!(decode_pcm(&[0x01]), Err(Error::Tts(_))));
    }

    #[test]
    fn test_provider_names() {
        let openai =
            TextToSpeech::new_openai("k".into(), "tts-1".into(), "alloy".into(), 1.0).unwrap();
        let eleven = TextToSpeech::new_elevenlabs("k".into(), "m".into(), "v".into()).unwrap();
        assert_eq!(openai.name(), "openai");
        assert_eq!(eleven.name(), "elevenlabs");
    }
}
