//! PCM audio frames and payload codecs
//!
//! Everything on the wire is 16-bit little-endian PCM, mono, 16 kHz.
//! Binary payloads may be raw or WAV-wrapped.

use std::io::Cursor;

use crate::{Error, Result};

/// Sample rate for all session audio (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Channel count for all session audio
pub const CHANNELS: u16 = 1;

/// Default detector frame size (80ms at 16kHz)
pub const DEFAULT_FRAME_SAMPLES: usize = 1280;

/// A fixed-size chunk of mono 16-bit PCM
///
/// Immutable once assembled; sequence numbers increase monotonically per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    seq: u64,
    samples: Box<[i16]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Create a mono 16kHz frame
    #[must_use]
    pub fn new(seq: u64, samples: Vec<i16>) -> Self {
        Self::with_format(seq, samples, SAMPLE_RATE, CHANNELS)
    }

    /// Create a frame with an explicit format (validated later by the detector)
    #[must_use]
    pub fn with_format(seq: u64, samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            seq,
            samples: samples.into_boxed_slice(),
            sample_rate,
            channels,
        }
    }

    /// Sequence number within the connection
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// PCM samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Frame duration
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }

    /// Normalized RMS energy of the frame
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Decode a binary payload (raw PCM16LE or WAV) into mono 16kHz samples
///
/// # Errors
///
/// Returns `InvalidAudioFormat` for odd-length raw payloads, empty payloads,
/// or WAV data that is not 16-bit mono 16kHz
pub fn decode_payload(payload: &[u8]) -> Result<Vec<i16>> {
    if payload.starts_with(b"RIFF") {
        return decode_wav(payload);
    }

    if payload.is_empty() {
        return Err(Error::InvalidAudioFormat("empty audio payload".to_string()));
    }
    if payload.len() % 2 != 0 {
        return Err(Error::InvalidAudioFormat(format!(
            "raw PCM16 payload has odd length {}",
            payload.len()
        )));
    }

    Ok(bytes_to_pcm(payload))
}

/// Decode a strict 16-bit mono 16kHz WAV payload
fn decode_wav(payload: &[u8]) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::new(Cursor::new(payload))
        .map_err(|e| Error::InvalidAudioFormat(format!("malformed WAV: {e}")))?;

    let spec = reader.spec();
    if spec.channels != CHANNELS {
        return Err(Error::InvalidAudioFormat(format!(
            "expected mono audio, got {} channels",
            spec.channels
        )));
    }
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::InvalidAudioFormat(format!(
            "expected 16-bit integer PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    if spec.sample_rate != SAMPLE_RATE {
        return Err(Error::InvalidAudioFormat(format!(
            "expected {SAMPLE_RATE} Hz, got {} Hz",
            spec.sample_rate
        )));
    }

    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidAudioFormat(format!("truncated WAV data: {e}")))?;

    if samples.is_empty() {
        return Err(Error::InvalidAudioFormat("WAV payload has no samples".to_string()));
    }

    Ok(samples)
}

/// Interpret little-endian bytes as PCM16 (a trailing odd byte is ignored)
#[must_use]
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize PCM16 samples as little-endian bytes
#[must_use]
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Re-chunks arbitrary-length sample runs into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
    next_seq: u64,
}

impl FrameAssembler {
    /// Create an assembler producing frames of `frame_samples`
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
            next_seq: 0,
        }
    }

    /// Append samples and return every complete frame
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        let mut rest = std::mem::take(&mut self.pending);

        for chunk in rest.chunks_exact(self.frame_samples) {
            frames.push(AudioFrame::new(self.next_seq, chunk.to_vec()));
            self.next_seq += 1;
        }

        let consumed = complete * self.frame_samples;
        rest.drain(..consumed);
        self.pending = rest;

        frames
    }

    /// Samples waiting for a full frame
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Convert PCM16 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Resample mono PCM16 using rubato
///
/// # Errors
///
/// Returns error if the resampler cannot be constructed or fails
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s) / 32768.0).collect();
    let expected = (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + chunk_size);
    let mut padded = Vec::with_capacity(chunk_size);

    // Feed whole chunks, zero-padding the tail and flushing the filter delay
    let mut offset = 0;
    while output.len() < expected + delay {
        padded.clear();
        if offset < input.len() {
            let end = (offset + chunk_size).min(input.len());
            padded.extend_from_slice(&input[offset..end]);
            offset = end;
        }
        padded.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[padded.as_slice()], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output
        .iter()
        .skip(delay)
        .take(expected)
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect())
}

/// Duration of `len` samples at `sample_rate`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn samples_duration(len: usize, sample_rate: u32) -> std::time::Duration {
    if sample_rate == 0 {
        return std::time::Duration::ZERO;
    }
    let nanos = (len as u128 * 1_000_000_000) / u128::from(sample_rate);
    std::time::Duration::from_nanos(nanos as u64)
}

/// Calculate normalized RMS energy of PCM16 samples
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = f64::from(s) / 32768.0;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}
