use crate::error::AudioError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Wire sample rates for the live backend.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Input chunk size used for streaming resamplers.
pub const RESAMPLER_CHUNK_SIZE: usize = 256;

/// Creates a mono resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: u32,
    out_sampling_rate: u32,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, AudioError> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate as f64 / in_sampling_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Converts float samples to 16-bit PCM.
///
/// Samples are clamped to [-1, 1] first. Negative values scale by 32768 and
/// positive values by 32767 so both ends of the range are reachable.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
            scaled.round() as i16
        })
        .collect()
}

/// Converts 16-bit PCM back to floats in [-1, 1], mirroring [`convert_f32_to_i16`].
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| {
            if sample < 0 {
                sample as f32 / 32768.0
            } else {
                sample as f32 / 32767.0
            }
        })
        .collect()
}

/// Encodes a frame of float samples as base64 little-endian PCM16.
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    let bytes: Vec<u8> = convert_f32_to_i16(pcm32)
        .into_iter()
        .flat_map(i16::to_le_bytes)
        .collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decodes a base64 little-endian PCM16 payload into normalized float samples.
///
/// Unlike a lenient decoder this rejects payloads with a dangling byte, since
/// that means the chunk was truncated or corrupted in transit.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Result<Vec<f32>, AudioError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    if bytes.len() % 2 != 0 {
        return Err(AudioError::OddLength(bytes.len()));
    }
    let pcm16: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();
    Ok(convert_i16_to_f32(&pcm16))
}

/// Averages interleaved multi-channel audio down to mono.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Number of samples `len` input samples become at the output rate.
pub fn resampled_len(len: usize, in_sampling_rate: u32, out_sampling_rate: u32) -> usize {
    (len as f64 * out_sampling_rate as f64 / in_sampling_rate as f64).round() as usize
}

/// Resamples one self-contained chunk.
///
/// Unlike [`StreamResampler`] nothing is carried over between calls: the
/// resampler delay is skipped, the tail is flushed, and the result is exactly
/// [`resampled_len`] samples long.
pub fn resample_chunk(
    samples: &[f32],
    in_sampling_rate: u32,
    out_sampling_rate: u32,
) -> Result<Vec<f32>, AudioError> {
    if in_sampling_rate == out_sampling_rate {
        return Ok(samples.to_vec());
    }
    let target = resampled_len(samples.len(), in_sampling_rate, out_sampling_rate);
    let mut resampler = create_resampler(in_sampling_rate, out_sampling_rate, RESAMPLER_CHUNK_SIZE)?;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(target + delay);

    let mut rest = samples;
    while rest.len() >= resampler.input_frames_next() {
        let (chunk, tail) = rest.split_at(resampler.input_frames_next());
        out.extend_from_slice(&resampler.process(&[chunk], None)?[0]);
        rest = tail;
    }
    if !rest.is_empty() {
        out.extend_from_slice(&resampler.process_partial(Some(&[rest][..]), None)?[0]);
    }
    while out.len() < target + delay {
        let flushed = resampler.process_partial(None::<&[&[f32]]>, None)?;
        if flushed[0].is_empty() {
            break;
        }
        out.extend_from_slice(&flushed[0]);
    }

    let mut out = out.split_off(delay.min(out.len()));
    out.resize(target, 0.0);
    Ok(out)
}

/// A resampler for continuous streams with arbitrary block sizes.
///
/// The underlying resampler wants fixed-size input chunks, so leftover samples
/// are carried over to the next call. When both rates match the samples pass
/// through untouched.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_sampling_rate: u32, out_sampling_rate: u32) -> Result<Self, AudioError> {
        let inner = if in_sampling_rate == out_sampling_rate {
            None
        } else {
            Some(create_resampler(
                in_sampling_rate,
                out_sampling_rate,
                RESAMPLER_CHUNK_SIZE,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feeds samples in and returns whatever full chunks could be resampled.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if needed == 0 || self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let processed = resampler.process(&[chunk], None)?;
            out.extend_from_slice(&processed[0]);
        }
        Ok(out)
    }
}
