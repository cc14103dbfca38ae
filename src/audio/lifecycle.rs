//! Capture device lifecycle.
//!
//! A [`CaptureLease`] owns a started capture device together with its level
//! analyzer. Releasing the lease, explicitly or by dropping it, stops the
//! device, so no capture path can leave the microphone open.

use crate::audio::analyzer::{LevelAnalyzer, Levels};
use crate::audio::source::AudioSource;
use crate::defaults;
use crate::error::{Result, VoxturnError};
use tracing::{debug, warn};

/// Opens a fresh, not yet started, capture device.
pub type DeviceOpener = Box<dyn Fn() -> Result<Box<dyn AudioSource>> + Send>;

/// Acquires capture leases.
pub struct DeviceManager {
    opener: DeviceOpener,
    bands: usize,
    fft_size: usize,
}

impl DeviceManager {
    pub fn new(opener: DeviceOpener) -> Self {
        Self {
            opener,
            bands: defaults::ANALYZER_BANDS,
            fft_size: defaults::ANALYZER_FFT_SIZE,
        }
    }

    /// Analyzer buckets published per block and the FFT window behind the
    /// frequency buckets.
    pub fn with_analyzer(mut self, bands: usize, fft_size: usize) -> Self {
        self.bands = bands;
        self.fft_size = fft_size;
        self
    }

    /// Opens and starts the device.
    ///
    /// Any failure, whether opening or starting, is reported as
    /// `DeviceUnavailable`; nothing is left running.
    pub fn acquire(&self) -> Result<CaptureLease> {
        let mut source = (self.opener)().map_err(into_unavailable)?;
        if let Err(e) = source.start() {
            if let Err(stop_err) = source.stop() {
                debug!(error = %stop_err, "stop after failed start");
            }
            return Err(into_unavailable(e));
        }
        debug!(rate = source.sample_rate(), "capture device acquired");
        Ok(CaptureLease {
            source: Some(source),
            analyzer: LevelAnalyzer::with_fft_size(self.bands, self.fft_size),
        })
    }
}

fn into_unavailable(error: VoxturnError) -> VoxturnError {
    match error {
        VoxturnError::DeviceUnavailable { .. } => error,
        other => VoxturnError::DeviceUnavailable {
            message: other.to_string(),
        },
    }
}

/// One block of captured audio with its analyzer levels.
#[derive(Debug, Clone)]
pub struct CaptureBlock {
    pub samples: Vec<i16>,
    pub levels: Levels,
}

/// A started capture device.
pub struct CaptureLease {
    source: Option<Box<dyn AudioSource>>,
    analyzer: LevelAnalyzer,
}

impl CaptureLease {
    pub fn sample_rate(&self) -> u32 {
        self.source
            .as_ref()
            .map_or(defaults::SAMPLE_RATE, |s| s.sample_rate())
    }

    /// Reads whatever was captured since the last call.
    ///
    /// Returns `Ok(None)` when nothing new is available or the lease was released.
    pub fn read_block(&mut self) -> Result<Option<CaptureBlock>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let samples = source.read_samples()?;
        if samples.is_empty() {
            return Ok(None);
        }
        let levels = self.analyzer.analyze(&samples);
        Ok(Some(CaptureBlock { samples, levels }))
    }

    /// Stops the device. Safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        match self.source.take() {
            Some(mut source) => {
                debug!("capture device released");
                source.stop()
            }
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.source.is_none()
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to stop capture device");
        }
    }
}
