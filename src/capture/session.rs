//! Capture session data: state, timestamps and the utterance buffer.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Endpointing state visible to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Idle,
    Listening,
    Recording,
    SilenceCountdown,
}

impl CaptureState {
    /// Recording or counting down: an utterance is being buffered.
    pub fn is_recording(self) -> bool {
        matches!(self, CaptureState::Recording | CaptureState::SilenceCountdown)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Listening => "listening",
            CaptureState::Recording => "recording",
            CaptureState::SilenceCountdown => "silence countdown",
        };
        f.write_str(name)
    }
}

/// One armed capture. Exists from `arm` until `disarm`.
#[derive(Debug)]
pub struct CaptureSession {
    pub(crate) state: CaptureState,
    pub(crate) recording_started_at: Option<Instant>,
    pub(crate) silence_started_at: Option<Instant>,
    pub(crate) buffered: Vec<i16>,
}

impl CaptureSession {
    pub(crate) fn listening() -> Self {
        Self {
            state: CaptureState::Listening,
            recording_started_at: None,
            silence_started_at: None,
            buffered: Vec::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn recording_started_at(&self) -> Option<Instant> {
        self.recording_started_at
    }

    pub fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffered.len()
    }

    /// Drops the utterance and returns to `Listening`.
    pub(crate) fn reset_to_listening(&mut self) -> Vec<i16> {
        self.state = CaptureState::Listening;
        self.recording_started_at = None;
        self.silence_started_at = None;
        std::mem::take(&mut self.buffered)
    }
}

/// Why a recording was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinalizeReason {
    /// The silence countdown ran out.
    Silence,
    /// The transport went away mid-utterance.
    TransportDropped,
}

/// A finished, encoded utterance.
#[derive(Clone, PartialEq)]
pub struct CapturedClip {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    /// Audio length derived from the sample count.
    pub duration: Duration,
    pub sample_rate: u32,
    pub reason: FinalizeReason,
}

impl fmt::Debug for CapturedClip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedClip")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("duration", &self.duration)
            .field("sample_rate", &self.sample_rate)
            .field("reason", &self.reason)
            .finish()
    }
}
