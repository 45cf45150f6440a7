//! Microphone and speaker access.
//!
//! The session manager only sees the [`AudioDevices`], [`PlaybackOutput`] and
//! [`CaptureStream`] traits. [`CpalDevices`] implements them with cpal: each
//! stream is built, played and finally dropped on a dedicated thread, because
//! cpal streams are not `Send`. Audio callbacks never block on the manager;
//! they feed lock-free ring buffers that the analysers drain once per tick.

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig,
    SupportedStreamConfig, SupportedStreamConfigRange,
};
use ringbuf::{
    HeapCons, HeapRb,
    traits::{Consumer, Producer, Split},
};
use samvad_core::activity::{AI_SMOOTHING, ANALYSER_FFT_SIZE, Analyser, MIC_SMOOTHING};
use samvad_core::audio_utils::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE, resample_chunk};
use samvad_core::capture::CaptureProcessor;
use samvad_core::playback::{Cue, PlaybackRenderer, ScheduledChunk, UnitId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Receives each captured frame, on the audio thread.
pub type FrameSink = Box<dyn FnMut(Vec<f32>) + Send>;
/// Receives each playback unit that finished naturally, on the audio thread.
pub type FinishedSink = Box<dyn FnMut(UnitId) + Send>;

/// Samples buffered between an audio callback and its analyser.
const TAP_CAPACITY: usize = 8192;

#[cfg_attr(test, mockall::automock)]
pub trait AudioDevices: Send + Sync {
    /// Opens the speaker output. The returned output's clock starts at zero.
    fn open_output(&self, on_finished: FinishedSink) -> Result<Box<dyn PlaybackOutput>>;

    /// Opens the microphone and starts capturing. May block while the platform
    /// asks the user for permission, so call it off the async runtime.
    fn open_capture(&self, on_frame: FrameSink) -> Result<Box<dyn CaptureStream>>;
}

/// One session's audio output.
pub trait PlaybackOutput: Send {
    /// Output clock in seconds.
    fn now(&self) -> f64;
    fn play(&mut self, chunk: &ScheduledChunk, samples: Vec<f32>);
    fn play_cue(&mut self, cue: Cue);
    /// Silences everything queued. Stopped units are not reported as finished.
    fn stop_all(&mut self);
    fn spectrum(&mut self) -> Vec<u8>;
    /// Releases the device. Returns once no further audio will be played.
    fn close(&mut self);
}

/// One session's microphone.
pub trait CaptureStream: Send {
    fn spectrum(&mut self) -> Vec<u8>;
    /// Releases the device. Returns once no further frames will be delivered.
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamFormat {
    sample_rate: u32,
    channels: u16,
}

/// A cpal stream parked on its own thread until stopped.
struct StreamThread {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<R, F>(name: &str, build: F) -> Result<(Self, R)>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<(cpal::Stream, R)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, ready)) => {
                        let _ = ready_tx.send(Ok(ready));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Resolves on an explicit stop or when the owner is dropped.
                let _ = stop_rx.blocking_recv();
                drop(stream);
            })
            .context("Failed to spawn audio thread")?;

        let ready = ready_rx
            .recv()
            .map_err(|_| anyhow!("Audio thread exited during setup"))??;
        Ok((
            Self {
                stop: Some(stop_tx),
                thread: Some(thread),
            },
            ready,
        ))
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Picks a config at `preferred_rate` if the device has one, preferring f32
/// and fewer channels. Falls back to the device default otherwise.
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    preferred_rate: u32,
    fallback: SupportedStreamConfig,
) -> SupportedStreamConfig {
    let rate = SampleRate(preferred_rate);
    let mut candidates: Vec<SupportedStreamConfigRange> = ranges
        .filter(|r| r.min_sample_rate() <= rate && r.max_sample_rate() >= rate)
        .filter(|r| is_supported_format(r.sample_format()))
        .collect();
    candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
    candidates
        .into_iter()
        .next()
        .map(|r| r.with_sample_rate(rate))
        .unwrap_or(fallback)
}

fn is_supported_format(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
    )
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut on_block: impl FnMut(&[f32]) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
            on_block(&scratch);
        },
        |err| error!(error = %err, "Input stream error"),
        None,
    )?;
    Ok(stream)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut fill: impl FnMut(&mut [f32]) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            fill(&mut scratch);
            for (out, sample) in data.iter_mut().zip(&scratch) {
                *out = T::from_sample(*sample);
            }
        },
        |err| error!(error = %err, "Output stream error"),
        None,
    )?;
    Ok(stream)
}

fn lock(renderer: &Mutex<PlaybackRenderer>) -> MutexGuard<'_, PlaybackRenderer> {
    renderer.lock().unwrap_or_else(|e| e.into_inner())
}

/// Default host devices through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl AudioDevices for CpalDevices {
    fn open_output(&self, mut on_finished: FinishedSink) -> Result<Box<dyn PlaybackOutput>> {
        let (producer, consumer) = HeapRb::<f32>::new(TAP_CAPACITY).split();
        let (thread, (format, renderer)) = StreamThread::spawn("samvad-output", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .context("No audio output device available")?;
            let fallback = device
                .default_output_config()
                .context("Output device has no usable configuration")?;
            let supported = pick_config(
                device.supported_output_configs()?,
                PLAYBACK_SAMPLE_RATE,
                fallback,
            );
            let config: StreamConfig = supported.config();
            let format = StreamFormat {
                sample_rate: config.sample_rate.0,
                channels: config.channels,
            };

            let renderer = Arc::new(Mutex::new(PlaybackRenderer::new(format.sample_rate)));
            let shared = renderer.clone();
            let channels = format.channels.max(1) as usize;
            let mut tap = producer;
            let fill = move |out: &mut [f32]| {
                let finished = lock(&shared).render(out, channels);
                tap.push_iter(out.iter().step_by(channels).copied());
                for unit in finished {
                    on_finished(unit);
                }
            };
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, fill)?,
                SampleFormat::I16 => build_output::<i16>(&device, &config, fill)?,
                SampleFormat::U16 => build_output::<u16>(&device, &config, fill)?,
                other => bail!("Unsupported output sample format {other:?}"),
            };
            stream.play().context("Failed to start audio output")?;
            Ok((stream, (format, renderer)))
        })?;

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "Audio output open"
        );
        Ok(Box::new(CpalOutput {
            thread,
            renderer,
            device_rate: format.sample_rate,
            tap: consumer,
            analyser: Analyser::new(ANALYSER_FFT_SIZE, AI_SMOOTHING),
            scratch: vec![0.0; TAP_CAPACITY],
        }))
    }

    fn open_capture(&self, mut on_frame: FrameSink) -> Result<Box<dyn CaptureStream>> {
        let (producer, consumer) = HeapRb::<f32>::new(TAP_CAPACITY).split();
        let (thread, format) = StreamThread::spawn("samvad-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .context("No microphone available")?;
            let fallback = device
                .default_input_config()
                .context("Microphone has no usable configuration")?;
            let supported = pick_config(
                device.supported_input_configs()?,
                CAPTURE_SAMPLE_RATE,
                fallback,
            );
            let config: StreamConfig = supported.config();
            let format = StreamFormat {
                sample_rate: config.sample_rate.0,
                channels: config.channels,
            };

            let mut processor = CaptureProcessor::new(format.sample_rate, format.channels)?;
            let mut tap = producer;
            let on_block = move |block: &[f32]| match processor.process(block) {
                Ok((mono, frames)) => {
                    tap.push_slice(&mono);
                    for frame in frames {
                        on_frame(frame);
                    }
                }
                Err(e) => warn!(error = %e, "Dropping capture block"),
            };
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &config, on_block)?,
                SampleFormat::I16 => build_input::<i16>(&device, &config, on_block)?,
                SampleFormat::U16 => build_input::<u16>(&device, &config, on_block)?,
                other => bail!("Unsupported microphone sample format {other:?}"),
            };
            stream.play().context("Failed to start microphone")?;
            Ok((stream, format))
        })?;

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "Microphone open"
        );
        Ok(Box::new(CpalCapture {
            thread,
            tap: consumer,
            analyser: Analyser::new(ANALYSER_FFT_SIZE, MIC_SMOOTHING),
            scratch: vec![0.0; TAP_CAPACITY],
        }))
    }
}

/// Moves everything buffered in `tap` into `analyser`.
fn drain_into(tap: &mut HeapCons<f32>, scratch: &mut [f32], analyser: &mut Analyser) {
    loop {
        let n = tap.pop_slice(scratch);
        if n == 0 {
            break;
        }
        analyser.push_samples(&scratch[..n]);
    }
}

struct CpalOutput {
    thread: StreamThread,
    renderer: Arc<Mutex<PlaybackRenderer>>,
    // Model audio arrives at the playback wire rate; the device may differ.
    device_rate: u32,
    tap: HeapCons<f32>,
    analyser: Analyser,
    scratch: Vec<f32>,
}

impl PlaybackOutput for CpalOutput {
    fn now(&self) -> f64 {
        lock(&self.renderer).now()
    }

    fn play(&mut self, chunk: &ScheduledChunk, samples: Vec<f32>) {
        // Chunks are resampled whole so each one keeps its scheduled length.
        let samples = match resample_chunk(&samples, PLAYBACK_SAMPLE_RATE, self.device_rate) {
            Ok(resampled) => resampled,
            Err(e) => {
                warn!(unit = %chunk.unit, error = %e, "Dropping chunk that failed to resample");
                return;
            }
        };
        lock(&self.renderer).enqueue(chunk, samples);
    }

    fn play_cue(&mut self, cue: Cue) {
        lock(&self.renderer).play_cue(cue);
    }

    fn stop_all(&mut self) {
        lock(&self.renderer).stop_all();
    }

    fn spectrum(&mut self) -> Vec<u8> {
        drain_into(&mut self.tap, &mut self.scratch, &mut self.analyser);
        self.analyser.byte_frequency_data()
    }

    fn close(&mut self) {
        self.thread.stop();
        debug!("Audio output closed");
    }
}

struct CpalCapture {
    thread: StreamThread,
    tap: HeapCons<f32>,
    analyser: Analyser,
    scratch: Vec<f32>,
}

impl CaptureStream for CpalCapture {
    fn spectrum(&mut self) -> Vec<u8> {
        drain_into(&mut self.tap, &mut self.scratch, &mut self.analyser);
        self.analyser.byte_frequency_data()
    }

    fn stop(&mut self) {
        self.thread.stop();
        debug!("Microphone released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    fn fallback() -> SupportedStreamConfig {
        SupportedStreamConfig::new(
            2,
            SampleRate(48_000),
            SupportedBufferSize::Unknown,
            SampleFormat::F32,
        )
    }

    #[test]
    fn test_pick_config_prefers_native_rate_f32_mono() {
        let ranges = vec![
            range(2, 8_000, 48_000, SampleFormat::F32),
            range(1, 8_000, 48_000, SampleFormat::I16),
            range(1, 8_000, 48_000, SampleFormat::F32),
        ];
        let picked = pick_config(ranges.into_iter(), CAPTURE_SAMPLE_RATE, fallback());
        assert_eq!(picked.sample_rate(), SampleRate(CAPTURE_SAMPLE_RATE));
        assert_eq!(picked.channels(), 1);
        assert_eq!(picked.sample_format(), SampleFormat::F32);
    }

    #[test]
    fn test_pick_config_falls_back_to_default() {
        let ranges = vec![
            range(2, 44_100, 48_000, SampleFormat::F32),
            range(1, 8_000, 48_000, SampleFormat::I32),
        ];
        let picked = pick_config(ranges.into_iter(), PLAYBACK_SAMPLE_RATE, fallback());
        assert_eq!(picked.sample_rate(), SampleRate(48_000));
        assert_eq!(picked.channels(), 2);
    }

    #[test]
    fn test_drain_into_feeds_analyser() {
        let (mut producer, mut consumer) = HeapRb::<f32>::new(TAP_CAPACITY).split();
        let tone: Vec<f32> = (0..256)
            .map(|n| (std::f32::consts::TAU * n as f32 / 8.0).sin())
            .collect();
        producer.push_slice(&tone);

        let mut analyser = Analyser::new(ANALYSER_FFT_SIZE, 0.0);
        let mut scratch = vec![0.0; 100];
        drain_into(&mut consumer, &mut scratch, &mut analyser);
        assert_eq!(consumer.pop_slice(&mut scratch), 0);
        assert!(analyser.byte_frequency_data().iter().any(|v| *v > 0));
    }
}
