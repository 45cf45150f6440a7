//! Activity/visualization feed.
//!
//! Lightweight amplitude metrics for UI feedback, computed from the capture
//! and playback taps once per animation tick. Nothing here feeds back into the
//! audio path; a missing or failing analyser only means an idle visual.

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

pub const ANALYSER_FFT_SIZE: usize = 64;
pub const MIC_SMOOTHING: f32 = 0.8;
pub const AI_SMOOTHING: f32 = 0.6;
pub const MIC_BAR_COUNT: usize = 32;
/// Mean byte magnitude below which the AI glow stays off.
pub const AI_ACTIVITY_THRESHOLD: f32 = 10.0;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Frequency analyser producing byte magnitudes per bin.
///
/// Keeps the most recent `fft_size` samples, applies a Blackman window and
/// smooths magnitudes over time before mapping the decibel range onto 0..=255.
pub struct Analyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    smoothing: f32,
    smoothed: Vec<f32>,
}

impl Analyser {
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = std::f32::consts::TAU * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        Self {
            fft_size,
            fft,
            window,
            history: VecDeque::from(vec![0.0; fft_size]),
            smoothing: smoothing.clamp(0.0, 1.0),
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &sample in &samples[skip..] {
            self.history.pop_front();
            self.history.push_back(sample);
        }
    }

    /// Snapshot of the current spectrum, one byte per frequency bin.
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        let mut buffer: Vec<Complex<f32>> = self
            .history
            .iter()
            .zip(&self.window)
            .map(|(sample, w)| Complex::new(sample * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        self.smoothed
            .iter_mut()
            .zip(buffer.iter())
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() * scale;
                *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
                if *smoothed <= 0.0 {
                    return 0;
                }
                let db = 20.0 * smoothed.log10();
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

/// Normalized microphone bar heights.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MicLevels {
    pub bars: Vec<f32>,
    /// `false` while muted: the UI draws a flat, disabled style.
    pub active: bool,
}

impl Default for MicLevels {
    fn default() -> Self {
        Self {
            bars: vec![0.0; MIC_BAR_COUNT],
            active: false,
        }
    }
}

/// Partitions a spectrum into `bar_count` bands and averages each one.
pub fn mic_levels(spectrum: &[u8], bar_count: usize, muted: bool) -> MicLevels {
    if muted || bar_count == 0 {
        return MicLevels {
            bars: vec![0.0; bar_count],
            active: !muted,
        };
    }
    let step = (spectrum.len() / bar_count).max(1);
    let bars = (0..bar_count)
        .map(|i| {
            let sum: u32 = spectrum
                .iter()
                .skip(i * step)
                .take(step)
                .map(|v| *v as u32)
                .sum();
            sum as f32 / step as f32 / 255.0
        })
        .collect();
    MicLevels { bars, active: true }
}

/// Glow/ripple parameters for the AI speaking visual.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AiGlow {
    /// Mean byte magnitude of the playback spectrum.
    pub level: f32,
    pub active: bool,
    pub scale: f32,
    pub opacity: f32,
    pub ring_scale: f32,
    pub ring_opacity: f32,
}

impl Default for AiGlow {
    fn default() -> Self {
        ai_glow(&[])
    }
}

pub fn ai_glow(spectrum: &[u8]) -> AiGlow {
    let level = if spectrum.is_empty() {
        0.0
    } else {
        spectrum.iter().map(|v| *v as f32).sum::<f32>() / spectrum.len() as f32
    };
    let active = level > AI_ACTIVITY_THRESHOLD;
    let norm = level / 255.0;
    if !active {
        return AiGlow {
            level,
            active,
            scale: 1.0,
            opacity: 0.0,
            ring_scale: 1.0,
            ring_opacity: 0.0,
        };
    }
    AiGlow {
        level,
        active,
        scale: 1.0 + norm * 0.5,
        opacity: 0.4 + norm * 0.6,
        ring_scale: 1.0 + norm * 1.2,
        ring_opacity: norm * 0.4,
    }
}

/// One animation tick's worth of visualization data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityFrame {
    pub mic: MicLevels,
    pub ai: AiGlow,
}
