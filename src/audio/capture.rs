//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::source::AudioSource;
use crate::defaults;
use crate::error::{Result, VoxturnError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL probing of ALSA/JACK backends prints harmless but confusing noise.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2.
/// Safe as long as no other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Device name patterns that are never useful for voice input.
const FILTERED_PATTERNS: &[&str] = &["surround", "front:", "rear:", "HDMI", "S/PDIF"];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// List input devices usable for voice capture.
pub fn list_devices() -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| cpal::default_host().input_devices()).map_err(|e| {
        VoxturnError::DeviceUnavailable {
            message: format!("Failed to enumerate input devices: {}", e),
        }
    })?;

    Ok(devices
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .collect())
}

fn find_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        match device_name {
            Some(name) => {
                let devices = host
                    .input_devices()
                    .map_err(|e| VoxturnError::DeviceUnavailable {
                        message: format!("Failed to enumerate input devices: {}", e),
                    })?;
                for device in devices {
                    if let Ok(dev_name) = device.name()
                        && dev_name == name
                    {
                        return Ok(device);
                    }
                }
                Err(VoxturnError::DeviceUnavailable {
                    message: format!("input device '{}' not found", name),
                })
            }
            None => host
                .default_input_device()
                .ok_or_else(|| VoxturnError::DeviceUnavailable {
                    message: "no default input device".to_string(),
                }),
        }
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched by the owning `CpalAudioSource`,
/// which is driven from one event loop at a time.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone source capturing 16-bit PCM mono at the configured rate.
///
/// Tries i16 then f32 at the target format, and falls back to the device's
/// native config with software down-mixing and resampling.
pub struct CpalAudioSource {
    device_name: Option<String>,
    stream: Option<SendableStream>,
    buffer: Arc<Mutex<Vec<i16>>>,
    sample_rate: u32,
}

impl CpalAudioSource {
    /// Create a source for the named device, or the default input device.
    ///
    /// The device is resolved lazily in `start`, so a missing or denied
    /// device surfaces as `DeviceUnavailable` when capture is armed.
    pub fn new(device_name: Option<&str>) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
            stream: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            sample_rate: defaults::SAMPLE_RATE,
        }
    }

    /// Capture at a different target sample rate.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    fn build_stream(&self, device: &cpal::Device) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| warn!(error = %err, "audio input stream error"),
            None,
        ) {
            return Ok(stream);
        }

        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().map(|&s| f32_to_i16(s)));
                }
            },
            |err| warn!(error = %err, "audio input stream error"),
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native(device)
    }

    /// Capture at the device's native config and convert in software.
    fn build_stream_native(&self, device: &cpal::Device) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            device
                .default_input_config()
                .map_err(|e| VoxturnError::DeviceUnavailable {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        info!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native capture format, converting in software"
        );

        let buffer = Arc::clone(&self.buffer);
        let built = match default_config.sample_format() {
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted = to_mono_at_rate(data, native_channels, native_rate, target_rate);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&converted);
                    }
                },
                |err| warn!(error = %err, "audio input stream error"),
                None,
            ),
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let as_i16: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                    let converted =
                        to_mono_at_rate(&as_i16, native_channels, native_rate, target_rate);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&converted);
                    }
                },
                |err| warn!(error = %err, "audio input stream error"),
                None,
            ),
            fmt => {
                return Err(VoxturnError::DeviceUnavailable {
                    message: format!("Unsupported native sample format: {:?}", fmt),
                });
            }
        };

        built.map_err(|e| VoxturnError::DeviceUnavailable {
            message: format!("Failed to build input stream: {}", e),
        })
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Mix multi-channel audio to mono and resample to the target rate.
fn to_mono_at_rate(samples: &[i16], channels: usize, source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels <= 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    crate::audio::wav::resample(&mono, source_rate, target_rate)
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = find_device(self.device_name.as_deref())?;
        let stream = self.build_stream(&device)?;
        stream.play().map_err(|e| VoxturnError::DeviceUnavailable {
            message: format!("Failed to start input stream: {}", e),
        })?;

        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
        debug!(device = ?self.device_name, "capture stream started");
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(SendableStream(stream)) = self.stream.take() {
            // Dropping the stream releases the device even if pause fails.
            if let Err(e) = stream.pause() {
                warn!(error = %e, "failed to pause input stream before release");
            }
            debug!("capture stream released");
        }
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buf = self.buffer.lock().map_err(|e| VoxturnError::AudioCapture {
            message: format!("Failed to lock capture buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buf))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
