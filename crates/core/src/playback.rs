//! Playback scheduling for streamed model audio.
//!
//! Chunks arrive with network jitter and carry no semantic boundaries. The
//! [`PlaybackScheduler`] lays them end to end on a single timeline cursor; the
//! [`PlaybackRenderer`] is the output side that turns scheduled units into
//! device samples and reports when each unit has finished.

use std::collections::BTreeMap;
use std::fmt;

/// Fixed amplification for decoded model speech, which is characteristically quiet.
pub const PLAYBACK_GAIN: f32 = 2.5;

/// Identity of one scheduled playback unit within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Where a chunk landed on the playback timeline, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub unit: UnitId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Owns the "next available start time" cursor and the in-flight set.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    next_unit: u64,
    in_flight: BTreeMap<UnitId, ScheduledChunk>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a chunk of `duration` seconds on the timeline.
    ///
    /// A chunk that arrives before the previous one finishes starts exactly when
    /// it ends; a late chunk starts at `now`. Either way the cursor advances by
    /// exactly the chunk's duration.
    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledChunk {
        let start_at = now.max(self.next_start_time);
        self.next_start_time = start_at + duration;
        let unit = UnitId(self.next_unit);
        self.next_unit += 1;
        let chunk = ScheduledChunk {
            unit,
            start_at,
            duration,
        };
        self.in_flight.insert(unit, chunk);
        chunk
    }

    /// Deregisters a unit that finished naturally.
    ///
    /// Returns `true` when this emptied the in-flight set.
    pub fn finished(&mut self, unit: UnitId) -> bool {
        self.in_flight.remove(&unit).is_some() && self.in_flight.is_empty()
    }

    /// Force-stops everything: clears the in-flight set and resets the cursor.
    pub fn stop_all(&mut self) -> Vec<UnitId> {
        self.next_start_time = 0.0;
        std::mem::take(&mut self.in_flight).into_keys().collect()
    }

    pub fn cursor(&self) -> f64 {
        self.next_start_time
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Short synthesized interface sounds mixed into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Connect,
    Click,
}

impl Cue {
    /// Renders the cue as mono samples at `sample_rate`.
    pub fn synthesize(self, sample_rate: u32) -> Vec<f32> {
        let rate = sample_rate as f32;
        let (length, f_start, f_end) = match self {
            Cue::Connect => (0.3, 440.0, 880.0),
            Cue::Click => (0.05, 800.0, 300.0),
        };
        let total = (length * rate) as usize;
        let mut phase = 0.0f32;
        (0..total)
            .map(|n| {
                let t = n as f32 / rate;
                let progress = t / length;
                let freq = match self {
                    // The connect sweep finishes at 0.15s and holds.
                    Cue::Connect => f_start + (f_end - f_start) * (t / 0.15).min(1.0),
                    Cue::Click => f_start * (f_end / f_start).powf(progress),
                };
                let gain = match self {
                    Cue::Connect if t < 0.1 => 0.05 + 0.05 * (t / 0.1),
                    Cue::Connect => 0.1 * (1.0 - (t - 0.1) / 0.2).max(0.0),
                    Cue::Click => 0.15 * (1.0 - progress),
                };
                phase += std::f32::consts::TAU * freq / rate;
                phase.sin() * gain
            })
            .collect()
    }
}

#[derive(Debug)]
struct ActiveUnit {
    unit: UnitId,
    start_sample: u64,
    samples: Vec<f32>,
    position: usize,
}

/// Sample-clock driven mixer for scheduled units and cues.
///
/// The owner of the output device calls [`PlaybackRenderer::render`] from its
/// callback; the renderer's clock is the number of frames rendered so far.
#[derive(Debug)]
pub struct PlaybackRenderer {
    sample_rate: u32,
    clock: u64,
    gain: f32,
    units: Vec<ActiveUnit>,
    cues: Vec<(Vec<f32>, usize)>,
}

impl PlaybackRenderer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            clock: 0,
            gain: PLAYBACK_GAIN,
            units: Vec::new(),
            cues: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current playback time in seconds.
    pub fn now(&self) -> f64 {
        self.clock as f64 / self.sample_rate as f64
    }

    /// Queues samples (already at the renderer's rate) to start at `start_at` seconds.
    ///
    /// The unit occupies exactly its scheduled span on the sample clock: short
    /// input is padded with silence and long input is trimmed, so consecutive
    /// units never leave a gap or overlap.
    pub fn enqueue(&mut self, chunk: &ScheduledChunk, mut samples: Vec<f32>) {
        let rate = self.sample_rate as f64;
        let start_sample = (chunk.start_at * rate).round() as u64;
        let end_sample = (chunk.end_at() * rate).round() as u64;
        samples.resize(end_sample.saturating_sub(start_sample) as usize, 0.0);
        self.units.push(ActiveUnit {
            unit: chunk.unit,
            start_sample,
            samples,
            position: 0,
        });
    }

    pub fn play_cue(&mut self, cue: Cue) {
        self.cues.push((cue.synthesize(self.sample_rate), 0));
    }

    /// Drops every queued unit and cue without reporting them as finished.
    pub fn stop_all(&mut self) {
        self.units.clear();
        self.cues.clear();
    }

    pub fn pending_units(&self) -> usize {
        self.units.len()
    }

    /// Fills `out` (interleaved, `channels` wide) and returns units that finished.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<UnitId> {
        let channels = channels.max(1);
        let mut finished = Vec::new();
        for frame in out.chunks_mut(channels) {
            let mut mixed = 0.0f32;
            for unit in self.units.iter_mut() {
                // A unit whose start already passed plays from its beginning now.
                if unit.start_sample <= self.clock && unit.position < unit.samples.len() {
                    mixed += unit.samples[unit.position] * self.gain;
                    unit.position += 1;
                }
            }
            for (samples, position) in self.cues.iter_mut() {
                if let Some(sample) = samples.get(*position) {
                    mixed += sample;
                    *position += 1;
                }
            }
            let value = mixed.clamp(-1.0, 1.0);
            frame.iter_mut().for_each(|s| *s = value);
            self.clock += 1;

            self.units.retain(|unit| {
                let done = unit.position >= unit.samples.len();
                if done {
                    finished.push(unit.unit);
                }
                !done
            });
        }
        self.cues.retain(|(samples, position)| *position < samples.len());
        finished
    }
}
