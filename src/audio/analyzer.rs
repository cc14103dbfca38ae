//! Level analyzer tap for captured audio.
//!
//! Publishes per-block amplitude and frequency buckets for level meters and
//! visualizers. Purely observational: nothing downstream depends on it.

use crate::audio::vad::calculate_rms;
use crate::defaults;
use rustfft::{Fft, FftPlanner, num_complex::Complex};
use serde::Serialize;
use std::sync::Arc;

/// Levels computed for one captured block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Levels {
    /// RMS of the block, 0.0 to 1.0.
    pub rms: f32,
    /// Peak absolute sample, 0.0 to 1.0.
    pub peak: f32,
    /// Mean absolute amplitude of equal-length time slices.
    pub amplitude: Vec<f32>,
    /// Mean FFT magnitude of equal-width frequency slices.
    pub spectrum: Vec<f32>,
}

pub struct LevelAnalyzer {
    bands: usize,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl LevelAnalyzer {
    pub fn new(bands: usize) -> Self {
        Self::with_fft_size(bands, defaults::ANALYZER_FFT_SIZE)
    }

    pub fn with_fft_size(bands: usize, fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();
        Self {
            bands: bands.max(1),
            fft_size,
            fft,
            window,
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn analyze(&self, samples: &[i16]) -> Levels {
        let peak = samples
            .iter()
            .map(|&s| (s as f32 / i16::MAX as f32).abs())
            .fold(0.0f32, f32::max)
            .min(1.0);

        Levels {
            rms: calculate_rms(samples),
            peak,
            amplitude: self.amplitude_buckets(samples),
            spectrum: self.spectrum_buckets(samples),
        }
    }

    fn amplitude_buckets(&self, samples: &[i16]) -> Vec<f32> {
        if samples.is_empty() {
            return vec![0.0; self.bands];
        }
        (0..self.bands)
            .map(|band| {
                let start = band * samples.len() / self.bands;
                let end = ((band + 1) * samples.len() / self.bands).max(start + 1);
                let slice = &samples[start.min(samples.len() - 1)..end.min(samples.len())];
                slice
                    .iter()
                    .map(|&s| (s as f32 / i16::MAX as f32).abs())
                    .sum::<f32>()
                    / slice.len() as f32
            })
            .collect()
    }

    /// FFT over the most recent `fft_size` samples, zero-padded when short.
    fn spectrum_buckets(&self, samples: &[i16]) -> Vec<f32> {
        let tail = &samples[samples.len().saturating_sub(self.fft_size)..];
        let mut buffer: Vec<Complex<f32>> = tail
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s as f32 / i16::MAX as f32 * w, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex::new(0.0, 0.0));
        self.fft.process(&mut buffer);

        let bins = self.fft_size / 2;
        let magnitudes: Vec<f32> = buffer[..bins]
            .iter()
            .map(|c| (c.re * c.re + c.im * c.im).sqrt() / self.fft_size as f32)
            .collect();

        (0..self.bands)
            .map(|band| {
                let start = band * bins / self.bands;
                let end = ((band + 1) * bins / self.bands).max(start + 1).min(bins);
                let slice = &magnitudes[start.min(bins - 1)..end];
                slice.iter().sum::<f32>() / slice.len() as f32
            })
            .collect()
    }
}

impl Default for LevelAnalyzer {
    fn default() -> Self {
        Self::new(defaults::ANALYZER_BANDS)
    }
}
