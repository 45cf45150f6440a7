//! Capture pipeline processing: device audio in, fixed-size wire frames out.
//!
//! The audio engine calls back with whatever block size it likes; the backend
//! wants frames of exactly [`FRAME_SIZE`] mono samples at
//! [`CAPTURE_SAMPLE_RATE`](crate::audio_utils::CAPTURE_SAMPLE_RATE). This module
//! bridges the two without ever blocking, so it is safe to run on the audio
//! callback thread.

use crate::audio_utils::{self, CAPTURE_SAMPLE_RATE, StreamResampler};
use crate::error::AudioError;

/// Samples per outbound frame.
pub const FRAME_SIZE: usize = 2048;

/// Buffers samples until a whole frame is available.
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_size: usize,
    buffer: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame size must be positive");
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of samples waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Appends samples and returns every frame completed by them, in order.
    pub fn push(&mut self, mut samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        while !samples.is_empty() {
            let room = self.frame_size - self.buffer.len();
            let take = room.min(samples.len());
            self.buffer.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.buffer.len() == self.frame_size {
                let frame =
                    std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_size));
                frames.push(frame);
            }
        }
        frames
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new(FRAME_SIZE)
    }
}

/// Turns raw interleaved device blocks into wire-rate mono frames.
pub struct CaptureProcessor {
    channels: usize,
    resampler: StreamResampler,
    accumulator: FrameAccumulator,
}

impl CaptureProcessor {
    pub fn new(device_sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        Ok(Self {
            channels: channels.max(1) as usize,
            resampler: StreamResampler::new(device_sample_rate, CAPTURE_SAMPLE_RATE)?,
            accumulator: FrameAccumulator::default(),
        })
    }

    /// Processes one device block.
    ///
    /// Returns the mono samples at the device rate (for the analyser tap) and any
    /// frames that became complete.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<(Vec<f32>, Vec<Vec<f32>>), AudioError> {
        let mono = audio_utils::downmix_to_mono(interleaved, self.channels);
        let resampled = self.resampler.push(&mono)?;
        let frames = self.accumulator.push(&resampled);
        Ok((mono, frames))
    }
}
