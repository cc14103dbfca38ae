use crate::error::{Result, VoxturnError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Trait for capture devices.
///
/// This trait allows swapping implementations (real microphone vs mock).
/// Sources are polled: `read_samples` drains whatever the device captured
/// since the previous call and returns an empty vector when nothing is ready.
pub trait AudioSource: Send {
    /// Start capturing audio from the device.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and release the device.
    fn stop(&mut self) -> Result<()>;

    /// Read captured 16-bit PCM mono samples.
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Sample rate of the samples returned by `read_samples`.
    fn sample_rate(&self) -> u32 {
        crate::defaults::SAMPLE_RATE
    }
}

/// Observable state shared between a [`MockAudioSource`] and its probe.
#[derive(Debug, Default)]
struct MockDeviceState {
    started: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

/// Handle for inspecting a [`MockAudioSource`] after it was boxed and moved.
#[derive(Debug, Clone)]
pub struct MockDeviceProbe {
    state: Arc<MockDeviceState>,
}

impl MockDeviceProbe {
    /// True while the device is started and not yet stopped.
    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    /// Number of successful `start` calls.
    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    /// Number of successful `stop` calls.
    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

/// Mock capture device for testing
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    state: Arc<MockDeviceState>,
    frames: Arc<Mutex<VecDeque<Vec<i16>>>>,
    idle_samples: Vec<i16>,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockAudioSource {
    /// Create a new mock source that returns 160 zero samples per read
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockDeviceState::default()),
            frames: Arc::new(Mutex::new(VecDeque::new())),
            idle_samples: vec![0i16; 160],
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Samples returned by every read once queued frames are exhausted
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.idle_samples = samples;
        self
    }

    /// Frames returned one per read, in order, before falling back to `with_samples`
    pub fn with_frames(self, frames: Vec<Vec<i16>>) -> Self {
        if let Ok(mut queue) = self.frames.lock() {
            queue.extend(frames);
        }
        self
    }

    /// Configure the mock to fail on start, as a denied or missing device would
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Probe that keeps observing this source after it is moved
    pub fn probe(&self) -> MockDeviceProbe {
        MockDeviceProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(VoxturnError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        self.state.started.store(true, Ordering::SeqCst);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state.started.swap(false, Ordering::SeqCst) {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(VoxturnError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        let queued = self.frames.lock().ok().and_then(|mut q| q.pop_front());
        Ok(queued.unwrap_or_else(|| self.idle_samples.clone()))
    }
}
