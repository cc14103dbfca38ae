//! Speech detection feeding the endpointing state machine.
//!
//! A detector only raises edges. Deciding when an utterance is over belongs
//! to the silence countdown, so the built-in detector keeps its hangover short.

use crate::clock::{Clock, SystemClock};
use crate::defaults;
use std::time::{Duration, Instant};

/// Edge raised by a speech detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechSignal {
    Start,
    End,
}

/// Turns blocks of captured samples into speech start/end edges.
pub trait SpeechDetector: Send {
    /// Processes one block and returns an edge if one occurred.
    fn process(&mut self, samples: &[i16]) -> Option<SpeechSignal>;

    /// Forgets any speech in progress.
    fn reset(&mut self);
}

/// Detector that never fires. Used when speech events come from outside,
/// e.g. a server-side voice activity detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDetector;

impl SpeechDetector for NullDetector {
    fn process(&mut self, _samples: &[i16]) -> Option<SpeechSignal> {
        None
    }

    fn reset(&mut self) {}
}

/// Configuration for the energy detector.
#[derive(Debug, Clone, Copy)]
pub struct EnergyDetectorConfig {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub speech_threshold: f32,
    /// Quiet time before speech-end is raised.
    pub hangover_ms: u32,
}

impl Default for EnergyDetectorConfig {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::SPEECH_THRESHOLD,
            hangover_ms: defaults::DETECTOR_HANGOVER_MS,
        }
    }
}

/// RMS threshold detector with a hangover before speech-end.
pub struct EnergyDetector<C: Clock = SystemClock> {
    config: EnergyDetectorConfig,
    speaking: bool,
    quiet_since: Option<Instant>,
    clock: C,
}

impl<C: Clock> EnergyDetector<C> {
    pub fn with_clock(config: EnergyDetectorConfig, clock: C) -> Self {
        Self {
            config,
            speaking: false,
            quiet_since: None,
            clock,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Updates the speech threshold without resetting state.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.speech_threshold = threshold;
    }
}

impl EnergyDetector<SystemClock> {
    pub fn new(config: EnergyDetectorConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> SpeechDetector for EnergyDetector<C> {
    fn process(&mut self, samples: &[i16]) -> Option<SpeechSignal> {
        if samples.is_empty() {
            return None;
        }
        let loud = calculate_rms(samples) > self.config.speech_threshold;
        let now = self.clock.now();

        match (self.speaking, loud) {
            (false, true) => {
                self.speaking = true;
                self.quiet_since = None;
                Some(SpeechSignal::Start)
            }
            (true, true) => {
                self.quiet_since = None;
                None
            }
            (true, false) => {
                let since = *self.quiet_since.get_or_insert(now);
                if now.duration_since(since) >= Duration::from_millis(self.config.hangover_ms as u64)
                {
                    self.speaking = false;
                    self.quiet_since = None;
                    Some(SpeechSignal::End)
                } else {
                    None
                }
            }
            (false, false) => None,
        }
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.quiet_since = None;
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// Normalized to 0.0 (silence) through 1.0 (full scale).
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn make_silence(count: usize) -> Vec<i16> {
        vec![0i16; count]
    }

    fn make_speech(count: usize, amplitude: i16) -> Vec<i16> {
        vec![amplitude; count]
    }

    fn detector() -> (EnergyDetector<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let config = EnergyDetectorConfig {
            speech_threshold: 0.02,
            hangover_ms: 200,
        };
        (EnergyDetector::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_rms_silence_is_zero() {
        assert_eq!(calculate_rms(&make_silence(1000)), 0.0);
        assert_eq!(calculate_rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_max_amplitude() {
        let rms = calculate_rms(&make_speech(1000, i16::MAX));
        assert!((rms - 1.0).abs() < 0.001, "RMS should be ~1.0, got {}", rms);
    }

    #[test]
    fn test_rms_mixed_positive_negative() {
        let mut mixed = make_speech(500, 1000);
        mixed.extend(make_speech(500, -1000));
        let rms = calculate_rms(&mixed);
        // ±1000 is about 1000/32767
        assert!(rms > 0.025 && rms < 0.035, "RMS should be ~0.0305, got {}", rms);
    }

    #[test]
    fn test_detects_speech_start_once() {
        let (mut vad, _clock) = detector();
        assert_eq!(vad.process(&make_silence(320)), None);
        assert_eq!(vad.process(&make_speech(320, 3000)), Some(SpeechSignal::Start));
        assert_eq!(vad.process(&make_speech(320, 3000)), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_speech_end_waits_for_hangover() {
        let (mut vad, clock) = detector();
        vad.process(&make_speech(320, 3000));

        assert_eq!(vad.process(&make_silence(320)), None);
        clock.advance_ms(150);
        assert_eq!(vad.process(&make_silence(320)), None);
        clock.advance_ms(60);
        assert_eq!(vad.process(&make_silence(320)), Some(SpeechSignal::End));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_speech_resuming_cancels_hangover() {
        let (mut vad, clock) = detector();
        vad.process(&make_speech(320, 3000));
        vad.process(&make_silence(320));
        clock.advance_ms(150);
        assert_eq!(vad.process(&make_speech(320, 3000)), None);
        clock.advance_ms(150);
        // Quiet period restarts from here.
        assert_eq!(vad.process(&make_silence(320)), None);
        clock.advance_ms(100);
        assert_eq!(vad.process(&make_silence(320)), None);
    }

    #[test]
    fn test_empty_block_is_ignored() {
        let (mut vad, _clock) = detector();
        vad.process(&make_speech(320, 3000));
        assert_eq!(vad.process(&[]), None);
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_reset_and_threshold() {
        let (mut vad, _clock) = detector();
        vad.process(&make_speech(320, 3000));
        vad.reset();
        assert!(!vad.is_speaking());

        vad.set_threshold(0.5);
        assert_eq!(vad.process(&make_speech(320, 3000)), None);
    }

    #[test]
    fn test_null_detector_never_fires() {
        let mut vad = NullDetector;
        assert_eq!(vad.process(&make_speech(320, i16::MAX)), None);
    }
}
