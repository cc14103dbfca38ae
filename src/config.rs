use crate::defaults;
use crate::error::VoxturnError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub recognition: RecognitionConfig,
}

/// Capture and endpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    /// Silence after speech (ms) before the utterance is finalized.
    pub silence_threshold_ms: u64,
    /// Recordings shorter than this (ms) are discarded as too short.
    pub min_clip_ms: u64,
    pub countdown_tick_ms: u64,
    pub poll_interval_ms: u64,
    /// RMS threshold for the built-in energy detector.
    pub speech_threshold: f32,
    pub detector_hangover_ms: u32,
    pub analyzer_bands: usize,
    /// FFT window (samples) behind the analyzer's frequency buckets.
    pub analyzer_fft_size: usize,
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub channel_settle_ms: u64,
    /// Hold all output until the first user gesture unlocks it.
    pub require_unlock: bool,
}

/// Recognition transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Stream raw PCM while recording instead of sending one clip per utterance.
    pub streaming: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            silence_threshold_ms: defaults::SILENCE_THRESHOLD_MS,
            min_clip_ms: defaults::MIN_CLIP_MS,
            countdown_tick_ms: defaults::COUNTDOWN_TICK_MS,
            poll_interval_ms: defaults::CAPTURE_POLL_MS,
            speech_threshold: defaults::SPEECH_THRESHOLD,
            detector_hangover_ms: defaults::DETECTOR_HANGOVER_MS,
            analyzer_bands: defaults::ANALYZER_BANDS,
            analyzer_fft_size: defaults::ANALYZER_FFT_SIZE,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            channel_settle_ms: defaults::CHANNEL_SETTLE_MS,
            require_unlock: false,
        }
    }
}

impl CaptureConfig {
    pub fn min_clip(&self) -> Duration {
        Duration::from_millis(self.min_clip_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PlaybackConfig {
    pub fn channel_settle(&self) -> Duration {
        Duration::from_millis(self.channel_settle_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXTURN_AUDIO_DEVICE → capture.device
    /// - VOXTURN_SILENCE_MS → capture.silence_threshold_ms
    /// - VOXTURN_STREAMING → recognition.streaming ("1"/"true")
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("VOXTURN_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.capture.device = Some(device);
        }

        if let Ok(silence) = std::env::var("VOXTURN_SILENCE_MS")
            && let Ok(ms) = silence.trim().parse::<u64>()
        {
            self.capture.silence_threshold_ms = ms;
        }

        if let Ok(streaming) = std::env::var("VOXTURN_STREAMING")
            && !streaming.is_empty()
        {
            self.recognition.streaming = matches!(
                streaming.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }

        self
    }

    /// Check values that would make the pipeline misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |key: &str, message: &str| VoxturnError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.capture.sample_rate == 0 {
            return Err(invalid("capture.sample_rate", "must be positive"));
        }
        if self.capture.silence_threshold_ms == 0 {
            return Err(invalid("capture.silence_threshold_ms", "must be positive"));
        }
        if self.capture.countdown_tick_ms == 0 {
            return Err(invalid("capture.countdown_tick_ms", "must be positive"));
        }
        if self.capture.poll_interval_ms == 0 {
            return Err(invalid("capture.poll_interval_ms", "must be positive"));
        }
        if !(self.capture.speech_threshold > 0.0 && self.capture.speech_threshold <= 1.0) {
            return Err(invalid(
                "capture.speech_threshold",
                "must be in the range (0.0, 1.0]",
            ));
        }
        if self.capture.analyzer_bands == 0 {
            return Err(invalid("capture.analyzer_bands", "must be positive"));
        }
        if self.capture.analyzer_fft_size < 2 * self.capture.analyzer_bands {
            return Err(invalid(
                "capture.analyzer_fft_size",
                "must be at least twice capture.analyzer_bands",
            ));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxturn/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxturn")
            .join("config.toml")
    }

    /// Creates the live silence threshold handle seeded from this config.
    pub fn silence_threshold(&self) -> SilenceThreshold {
        SilenceThreshold::new(Duration::from_millis(self.capture.silence_threshold_ms))
    }
}

/// Live-updatable silence threshold.
///
/// Clones share one value. The endpointing countdown re-reads it on every
/// tick, so a change lands on the next tick of a countdown already running.
#[derive(Debug, Clone)]
pub struct SilenceThreshold {
    inner: Arc<RwLock<Duration>>,
}

impl SilenceThreshold {
    pub fn new(threshold: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(threshold)),
        }
    }

    pub fn get(&self) -> Duration {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, threshold: Duration) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = threshold;
    }
}

impl Default for SilenceThreshold {
    fn default() -> Self {
        Self::new(Duration::from_millis(defaults::SILENCE_THRESHOLD_MS))
    }
}
