//! Log-mel band energies for the template classifier
//!
//! The FFT plan and filter bank are computed once; `extract` only reads
//! them, so one extractor can be shared by every session.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex32};

/// Number of mel bands in a feature vector
pub const MEL_BANDS: usize = 16;

/// Lowest band edge in Hz
const MIN_FREQ: f32 = 60.0;

/// Absolute floor added before taking the log
const LOG_FLOOR: f32 = 1e-10;

/// Floor relative to the loudest band, so the vector shifts uniformly with level
const RELATIVE_FLOOR: f32 = 1e-6;

/// One feature vector per frame
pub type BandEnergies = [f32; MEL_BANDS];

/// Computes mean-removed log-mel band energies for fixed-size frames
pub struct BandExtractor {
    frame_samples: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    filter_bank: Vec<Vec<f32>>,
}

impl std::fmt::Debug for BandExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandExtractor")
            .field("frame_samples", &self.frame_samples)
            .field("bands", &self.filter_bank.len())
            .finish_non_exhaustive()
    }
}

impl BandExtractor {
    /// Create an extractor for `frame_samples`-long frames at `sample_rate`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(sample_rate: u32, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(frame_samples);

        // Hann window
        let window = (0..frame_samples)
            .map(|n| 0.5 - 0.5 * ((2.0 * PI * n as f32) / (frame_samples - 1) as f32).cos())
            .collect();

        let filter_bank = mel_filter_bank(sample_rate, frame_samples / 2 + 1, MEL_BANDS);

        Self {
            frame_samples,
            fft,
            window,
            filter_bank,
        }
    }

    /// Samples per frame expected by [`extract`](Self::extract)
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Extract mean-removed log band energies from one frame
    ///
    /// Frames shorter than the configured size are zero-padded; longer ones truncated.
    #[must_use]
    pub fn extract(&self, samples: &[i16]) -> BandEnergies {
        let mut buffer: Vec<Complex32> = self
            .window
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let x = samples.get(i).map_or(0.0, |&s| f32::from(s) / 32768.0);
                Complex32::new(x * w, 0.0)
            })
            .collect();
        self.fft.process(&mut buffer);

        let power: Vec<f32> = buffer[..=self.frame_samples / 2]
            .iter()
            .map(Complex32::norm_sqr)
            .collect();

        let mut bands = [0.0f32; MEL_BANDS];
        for (band, filter) in bands.iter_mut().zip(&self.filter_bank) {
            *band = filter.iter().zip(&power).map(|(w, p)| w * p).sum();
        }

        let peak = bands.iter().copied().fold(0.0f32, f32::max);
        let floor = (peak * RELATIVE_FLOOR).max(LOG_FLOOR);
        for band in &mut bands {
            *band = (*band).max(floor).ln();
        }

        remove_mean(&mut bands);
        bands
    }
}

/// Subtract the mean so vectors compare by spectral shape, not level
#[allow(clippy::cast_precision_loss)]
pub fn remove_mean(bands: &mut [f32]) {
    if bands.is_empty() {
        return;
    }
    let mean = bands.iter().sum::<f32>() / bands.len() as f32;
    for b in bands.iter_mut() {
        *b -= mean;
    }
}

/// Cosine similarity in [-1, 1]; zero vectors score 0
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filters over `bins` power-spectrum bins
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn mel_filter_bank(sample_rate: u32, bins: usize, bands: usize) -> Vec<Vec<f32>> {
    let nyquist = sample_rate as f32 / 2.0;
    let max_freq = nyquist * 0.95;
    let (mel_lo, mel_hi) = (hz_to_mel(MIN_FREQ), hz_to_mel(max_freq));

    // bands + 2 edge points, mapped to fractional bin positions
    let edges: Vec<f32> = (0..bands + 2)
        .map(|i| {
            let mel = mel_lo + (mel_hi - mel_lo) * i as f32 / (bands + 1) as f32;
            mel_to_hz(mel) / nyquist * (bins - 1) as f32
        })
        .collect();

    (0..bands)
        .map(|b| {
            let (lo, mid, hi) = (edges[b], edges[b + 1], edges[b + 2]);
            (0..bins)
                .map(|k| {
                    let k = k as f32;
                    if k <= lo || k >= hi {
                        0.0
                    } else if k <= mid {
                        (k - lo) / (mid - lo).max(f32::EPSILON)
                    } else {
                        (hi - k) / (hi - mid).max(f32::EPSILON)
                    }
                })
                .collect()
        })
        .collect()
}
