//! Audio module: microphone capture and voice activity detection
//!
//! Device samples are downmixed to mono, resampled to 16kHz and cut into
//! 20ms frames of PCM16 with their RMS energy attached.

mod microphone;
mod vad;

use std::time::Instant;

use rubato::{
    Resampler, ResamplerConstructionError, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::warn;

use crate::capture::AudioFrame;

pub use microphone::Microphone;
pub use vad::{VadEvent, VoiceActivityDetector};

/// Sample rate of every frame handed to the transport
pub const TARGET_RATE: u32 = 16_000;
/// Samples per 20ms frame at [`TARGET_RATE`]
pub const FRAME_SAMPLES: usize = (TARGET_RATE as usize) / 50;

/// Root mean square of a block of samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy = samples.iter().map(|s| s * s).sum::<f32>();
    (energy / samples.len() as f32).sqrt()
}

/// Encode [-1, 1] floats as little-endian PCM16
pub fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Accumulates interleaved device samples into fixed 20ms frames
///
/// One resampler lives for the whole stream, so its filter state carries
/// across callback boundaries.
pub struct FrameAssembler {
    channels: usize,
    /// Absent when the device already runs at [`TARGET_RATE`]
    resampler: Option<SincFixedIn<f32>>,
    /// Mono samples at the device rate, short of one resampler chunk
    pending: Vec<f32>,
    /// Mono samples at [`TARGET_RATE`], short of one frame
    resampled: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(device_rate: u32, channels: u16) -> Result<Self, ResamplerConstructionError> {
        let device_rate = device_rate.max(1);
        let resampler = if device_rate == TARGET_RATE {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            // One chunk is 20ms at the device rate
            let chunk = (device_rate as usize / 50).max(1);
            Some(SincFixedIn::new(
                TARGET_RATE as f64 / device_rate as f64,
                2.0,
                params,
                chunk,
                1,
            )?)
        };
        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler,
            pending: Vec::new(),
            resampled: Vec::new(),
        })
    }

    /// Push interleaved samples, returning every completed frame
    pub fn push<T: Copy>(
        &mut self,
        interleaved: &[T],
        to_f32: impl Fn(T) -> f32,
        now: Instant,
    ) -> Vec<AudioFrame> {
        for chunk in interleaved.chunks(self.channels) {
            let sum: f32 = chunk.iter().map(|s| to_f32(*s)).sum();
            self.pending.push(sum / chunk.len() as f32);
        }

        match self.resampler.as_mut() {
            None => self.resampled.append(&mut self.pending),
            Some(resampler) => loop {
                let needed = resampler.input_frames_next();
                if self.pending.len() < needed {
                    break;
                }
                let block: Vec<f32> = self.pending.drain(..needed).collect();
                match resampler.process(&[block], None) {
                    Ok(mut out) => {
                        if let Some(mono) = out.pop() {
                            self.resampled.extend(mono);
                        }
                    }
                    Err(e) => warn!(%e, "resampling failed, dropping block"),
                }
            },
        }

        let mut frames = Vec::new();
        while self.resampled.len() >= FRAME_SAMPLES {
            let mono: Vec<f32> = self.resampled.drain(..FRAME_SAMPLES).collect();
            frames.push(AudioFrame {
                rms: rms(&mono),
                pcm: to_pcm16(&mono),
                captured_at: now,
            });
        }
        frames
    }
}
