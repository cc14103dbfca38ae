//! Default configuration constants for voxturn.
//!
//! Shared by the config types and the components that fall back to them
//! when constructed without a config.

/// Default capture sample rate in Hz.
///
/// 16kHz mono is what speech recognizers expect.
pub const SAMPLE_RATE: u32 = 16000;

/// Default silence duration (ms) after speech ends before the utterance is finalized.
pub const SILENCE_THRESHOLD_MS: u64 = 1500;

/// Recordings shorter than this (ms) are discarded with a "too short" notice.
pub const MIN_CLIP_MS: u64 = 500;

/// Interval (ms) at which the silence countdown re-reads the threshold.
pub const COUNTDOWN_TICK_MS: u64 = 100;

/// Delay (ms) between stopping interrupted channel audio and starting its replacement.
pub const CHANNEL_SETTLE_MS: u64 = 120;

/// Interval (ms) at which the capture device is polled for new samples.
pub const CAPTURE_POLL_MS: u64 = 20;

/// Default RMS threshold (0.0 to 1.0) for the built-in energy detector.
pub const SPEECH_THRESHOLD: f32 = 0.02;

/// Quiet time (ms) the built-in detector waits before raising speech-end.
///
/// Kept short: the endpointing countdown owns the real end-of-utterance decision.
pub const DETECTOR_HANGOVER_MS: u32 = 250;

/// Number of amplitude and frequency buckets the analyzer tap publishes.
pub const ANALYZER_BANDS: usize = 16;

/// FFT window size used for the analyzer's frequency buckets.
pub const ANALYZER_FFT_SIZE: usize = 512;

/// MIME type tag attached to encoded clips.
pub const CLIP_MIME_TYPE: &str = "audio/wav";
