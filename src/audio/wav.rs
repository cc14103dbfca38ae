//! WAV helpers: clip encoding, fragment duration probing, and a file-backed
//! capture source.

use crate::audio::source::AudioSource;
use crate::error::{Result, VoxturnError};
use std::io::{Cursor, Read};

/// Encode 16-bit mono PCM as a WAV byte blob.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| VoxturnError::ClipEncode {
                message: e.to_string(),
            })?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| VoxturnError::ClipEncode {
                    message: e.to_string(),
                })?;
        }
        writer.finalize().map_err(|e| VoxturnError::ClipEncode {
            message: e.to_string(),
        })?;
    }
    Ok(cursor.into_inner())
}

/// Duration in seconds of a WAV payload, read from its header.
///
/// Returns `None` for payloads that are not WAV (e.g. MP3 fragments).
pub fn probe_duration_secs(payload: &[u8]) -> Option<f64> {
    let reader = hound::WavReader::new(Cursor::new(payload)).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Little-endian byte view of PCM samples, as streamed to realtime recognizers.
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

/// Capture source that replays a WAV recording as if it were a microphone.
///
/// Converted to mono at the requested rate and handed out in 20ms blocks.
pub struct WavAudioSource {
    samples: Vec<i16>,
    position: usize,
    block_size: usize,
    sample_rate: u32,
}

impl WavAudioSource {
    pub fn from_reader(reader: Box<dyn Read + Send>, target_rate: u32) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| VoxturnError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            })?;
        let spec = wav_reader.spec();

        let raw: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VoxturnError::AudioCapture {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        let channels = spec.channels.max(1) as usize;
        let mono: Vec<i16> = raw
            .chunks_exact(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
            .collect();

        Ok(Self {
            samples: resample(&mono, spec.sample_rate, target_rate),
            position: 0,
            block_size: (target_rate as usize / 50).max(1),
            sample_rate: target_rate,
        })
    }

    /// True once every sample has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.position >= self.samples.len()
    }
}

impl AudioSource for WavAudioSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let end = (self.position + self.block_size).min(self.samples.len());
        let block = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(block)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
