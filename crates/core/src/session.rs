//! Connection Lifecycle Controller.
//!
//! [`SessionController`] owns the identity of the current attempt to talk and is
//! a pure state machine: UI operations and backend/device callbacks go in, a
//! list of [`Effect`]s for the driver to carry out comes back. Every callback is
//! tagged with the [`ConnectionId`] of the attempt that produced it and is
//! checked against the current attempt before anything else happens, so a
//! callback from a superseded or aborted attempt can never touch the state of
//! a newer one.
//!
//! Each `open` builds a fresh `Session` value holding that attempt's playback
//! cursor and turn state. Nothing carries over between attempts.

use crate::audio_utils::{self, PLAYBACK_SAMPLE_RATE};
use crate::backend::LiveSessionConfig;
use crate::content::FigureProfile;
use crate::error::SessionError;
use crate::persona::build_persona_prompt;
use crate::playback::{Cue, PlaybackScheduler, ScheduledChunk, UnitId};
use crate::turn::{QUIET_DELAY, TurnTracker};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identity of one session attempt. Strictly increasing across the
/// controller's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceProfile {
    #[default]
    Male,
    Female,
}

impl VoiceProfile {
    /// Prebuilt backend voice for this profile.
    pub fn voice_name(self) -> &'static str {
        match self {
            VoiceProfile::Male => "Fenrir",
            VoiceProfile::Female => "Kore",
        }
    }
}

impl fmt::Display for VoiceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceProfile::Male => f.write_str("male"),
            VoiceProfile::Female => f.write_str("female"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown voice profile '{0}' (expected 'male' or 'female')")]
pub struct UnknownVoiceProfile(pub String);

impl FromStr for VoiceProfile {
    type Err = UnknownVoiceProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => Ok(VoiceProfile::Male),
            "female" => Ok(VoiceProfile::Female),
            _ => Err(UnknownVoiceProfile(s.to_string())),
        }
    }
}

/// The figure a session talks as.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTarget {
    pub figure_id: String,
    pub profile: FigureProfile,
}

/// Observable state for the UI shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub speaking: bool,
    pub muted: bool,
    pub voice: VoiceProfile,
    pub figure_id: Option<String>,
}

/// Callbacks delivered to the controller, each tagged with a [`ConnectionId`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport for this attempt is up. The driver holds on to it only if
    /// this dispatch is applied.
    TransportReady,
    /// Connecting failed before a transport existed.
    HandshakeFailed(SessionError),
    /// The audio output for this attempt could not be opened.
    OutputFailed(String),
    /// The backend accepted the session.
    Opened,
    /// The microphone is live. The driver keeps the stream only if applied.
    MicrophoneGranted,
    MicrophoneDenied(String),
    /// One captured frame of wire-rate mono samples.
    Frame(Vec<f32>),
    SendFailed(SessionError),
    /// An inbound audio chunk; `now` is the output clock at arrival, in seconds.
    Audio { data: String, now: f64 },
    Text(String),
    TurnComplete,
    QuietElapsed { generation: u64 },
    PlaybackFinished(UnitId),
    Closed { code: Option<u16> },
    Errored(String),
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::TransportReady => "transport_ready",
            SessionEvent::HandshakeFailed(_) => "handshake_failed",
            SessionEvent::OutputFailed(_) => "output_failed",
            SessionEvent::Opened => "opened",
            SessionEvent::MicrophoneGranted => "microphone_granted",
            SessionEvent::MicrophoneDenied(_) => "microphone_denied",
            SessionEvent::Frame(_) => "frame",
            SessionEvent::SendFailed(_) => "send_failed",
            SessionEvent::Audio { .. } => "audio",
            SessionEvent::Text(_) => "text",
            SessionEvent::TurnComplete => "turn_complete",
            SessionEvent::QuietElapsed { .. } => "quiet_elapsed",
            SessionEvent::PlaybackFinished(_) => "playback_finished",
            SessionEvent::Closed { .. } => "closed",
            SessionEvent::Errored(_) => "errored",
        }
    }
}

/// Side effects the driver must carry out, in order.
///
/// Effects without a [`ConnectionId`] apply to the resources of the attempt
/// that is current when they are emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AcquireOutput { id: ConnectionId },
    Connect { id: ConnectionId, config: LiveSessionConfig },
    RequestMicrophone { id: ConnectionId },
    SendAudio(String),
    Play { chunk: ScheduledChunk, samples: Vec<f32> },
    ArmQuietTimer { generation: u64, after: Duration },
    Cue(Cue),
    ReleaseMicrophone,
    StopPlayback,
    CloseTransport,
    ReleaseOutput,
}

/// Outcome of [`SessionController::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The event belongs to a superseded attempt and was ignored. Any resource
    /// it carried is an orphan the driver must release.
    Stale,
    Applied(Vec<Effect>),
}

impl Dispatch {
    pub fn is_stale(&self) -> bool {
        matches!(self, Dispatch::Stale)
    }

    pub fn into_effects(self) -> Vec<Effect> {
        match self {
            Dispatch::Stale => Vec::new(),
            Dispatch::Applied(effects) => effects,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Microphone {
    Idle,
    Requested,
    Live,
}

/// State owned by exactly one attempt.
#[derive(Debug)]
struct Session {
    id: ConnectionId,
    scheduler: PlaybackScheduler,
    turn: TurnTracker,
    transport: bool,
    microphone: Microphone,
}

impl Session {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            scheduler: PlaybackScheduler::new(),
            turn: TurnTracker::new(),
            transport: false,
            microphone: Microphone::Idle,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionController {
    epoch: u64,
    status: SessionStatus,
    error: Option<SessionError>,
    session: Option<Session>,
    target: Option<SessionTarget>,
    voice: VoiceProfile,
    muted: bool,
}

impl SessionController {
    pub fn new(voice: VoiceProfile) -> Self {
        Self {
            voice,
            ..Self::default()
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn target(&self) -> Option<&SessionTarget> {
        self.target.as_ref()
    }

    pub fn voice(&self) -> VoiceProfile {
        self.voice
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_speaking(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.turn.is_speaking())
    }

    /// Units scheduled but not yet finished in the current attempt.
    pub fn in_flight(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.scheduler.in_flight())
    }

    /// The current attempt's playback cursor, in seconds.
    pub fn playback_cursor(&self) -> Option<f64> {
        self.session.as_ref().map(|s| s.scheduler.cursor())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: ConnectionId(self.epoch),
            status: self.status,
            error_message: self.error.as_ref().map(ToString::to_string),
            speaking: self.is_speaking(),
            muted: self.muted,
            voice: self.voice,
            figure_id: self.target.as_ref().map(|t| t.figure_id.clone()),
        }
    }

    /// Starts a new attempt for `figure_id`, tearing down any current one.
    pub fn open(&mut self, figure_id: &str, profile: &FigureProfile) -> Vec<Effect> {
        self.target = Some(SessionTarget {
            figure_id: figure_id.to_string(),
            profile: profile.clone(),
        });
        self.start()
    }

    /// Ends the current attempt. A no-op when nothing is open.
    pub fn close(&mut self) -> Vec<Effect> {
        let effects = self.teardown();
        if self.status != SessionStatus::Disconnected {
            info!(connection_id = self.epoch, "session closed");
        }
        self.status = SessionStatus::Disconnected;
        self.error = None;
        effects
    }

    /// Closes and reopens with the same target and voice as a brand new attempt.
    ///
    /// Returns no effects when there has never been a target.
    pub fn retry(&mut self) -> Vec<Effect> {
        if self.target.is_none() {
            debug!("retry requested without a target");
            return Vec::new();
        }
        self.start()
    }

    /// Switches the voice. An open attempt is replaced by a fresh one using the
    /// new voice; the click cue plays on the new attempt's output.
    pub fn set_voice(&mut self, voice: VoiceProfile) -> Vec<Effect> {
        if voice == self.voice {
            return Vec::new();
        }
        self.voice = voice;
        info!(%voice, "voice profile changed");
        if self.session.is_none() || self.target.is_none() {
            return Vec::new();
        }
        let mut effects = self.start();
        let at = effects
            .iter()
            .position(|e| matches!(e, Effect::AcquireOutput { .. }))
            .map_or(0, |i| i + 1);
        effects.insert(at, Effect::Cue(Cue::Click));
        effects
    }

    /// Flips the mute flag. Capture keeps running either way.
    pub fn toggle_mute(&mut self) -> Vec<Effect> {
        self.muted = !self.muted;
        debug!(muted = self.muted, "mute toggled");
        if self.session.is_some() {
            vec![Effect::Cue(Cue::Click)]
        } else {
            Vec::new()
        }
    }

    /// Applies a callback from attempt `id`.
    pub fn handle(&mut self, id: ConnectionId, event: SessionEvent) -> Dispatch {
        if self.current_id() != Some(id) {
            debug!(
                connection_id = %id,
                current = self.epoch,
                event = event.kind(),
                "ignoring event from a superseded session"
            );
            return Dispatch::Stale;
        }
        let Some(session) = self.session.as_mut() else {
            return Dispatch::Stale;
        };

        let effects = match event {
            SessionEvent::TransportReady => {
                session.transport = true;
                Vec::new()
            }
            SessionEvent::HandshakeFailed(err) => self.fail(err),
            SessionEvent::OutputFailed(detail) => self.fail(SessionError::OutputUnavailable(detail)),
            SessionEvent::Opened => {
                info!(connection_id = %id, "session opened");
                self.status = SessionStatus::Connected;
                session.microphone = Microphone::Requested;
                vec![Effect::Cue(Cue::Connect), Effect::RequestMicrophone { id }]
            }
            SessionEvent::MicrophoneGranted => {
                debug!(connection_id = %id, "microphone live");
                session.microphone = Microphone::Live;
                Vec::new()
            }
            SessionEvent::MicrophoneDenied(detail) => self.fail(SessionError::PermissionDenied(detail)),
            SessionEvent::Frame(samples) => {
                let sendable = self.status == SessionStatus::Connected
                    && !self.muted
                    && session.transport
                    && session.microphone == Microphone::Live;
                if sendable {
                    vec![Effect::SendAudio(audio_utils::encode_f32_to_base64_i16(
                        &samples,
                    ))]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::SendFailed(err) => {
                match &err {
                    SessionError::StaleSession => debug!(connection_id = %id, "dropped frame for a closed transport"),
                    other => warn!(connection_id = %id, error = %other, detail = ?other.detail(), "failed to send audio frame"),
                }
                Vec::new()
            }
            SessionEvent::Audio { data, now } => {
                if self.status != SessionStatus::Connected {
                    return Dispatch::Applied(Vec::new());
                }
                match audio_utils::decode_f32_from_base64_i16(&data) {
                    Ok(samples) if samples.is_empty() => Vec::new(),
                    Ok(samples) => {
                        let duration = samples.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;
                        let chunk = session.scheduler.schedule(now, duration);
                        if session.turn.on_chunk() {
                            debug!(connection_id = %id, "model started speaking");
                        }
                        vec![Effect::Play { chunk, samples }]
                    }
                    Err(err) => {
                        warn!(connection_id = %id, error = %err, "dropping malformed audio chunk");
                        Vec::new()
                    }
                }
            }
            SessionEvent::Text(text) => {
                debug!(connection_id = %id, %text, "model text");
                Vec::new()
            }
            SessionEvent::TurnComplete => match session.turn.on_turn_complete() {
                Some(generation) => vec![Effect::ArmQuietTimer {
                    generation,
                    after: QUIET_DELAY,
                }],
                None => Vec::new(),
            },
            SessionEvent::QuietElapsed { generation } => {
                if session.turn.on_quiet_elapsed(generation) {
                    debug!(connection_id = %id, "model stopped speaking");
                }
                Vec::new()
            }
            SessionEvent::PlaybackFinished(unit) => {
                if session.scheduler.finished(unit) {
                    debug!(connection_id = %id, "playback queue drained");
                }
                Vec::new()
            }
            SessionEvent::Closed { code } => match SessionError::from_close_code(code) {
                None => {
                    info!(connection_id = %id, ?code, "backend closed the session");
                    let effects = self.teardown();
                    self.status = SessionStatus::Disconnected;
                    self.error = None;
                    effects
                }
                Some(err) => self.fail(err),
            },
            SessionEvent::Errored(detail) => self.fail(SessionError::Connection(detail)),
        };
        Dispatch::Applied(effects)
    }

    fn start(&mut self) -> Vec<Effect> {
        let mut effects = self.teardown();
        let Some(target) = self.target.as_ref() else {
            return effects;
        };
        self.epoch += 1;
        let id = ConnectionId(self.epoch);
        self.session = Some(Session::new(id));
        self.status = SessionStatus::Connecting;
        self.error = None;

        let config = LiveSessionConfig {
            system_instruction: build_persona_prompt(&target.profile),
            voice_name: self.voice.voice_name().to_string(),
        };
        info!(
            connection_id = %id,
            figure = %target.figure_id,
            voice = %self.voice,
            "opening session"
        );
        effects.push(Effect::AcquireOutput { id });
        effects.push(Effect::Connect { id, config });
        effects
    }

    /// Drops the current attempt and invalidates its id.
    fn teardown(&mut self) -> Vec<Effect> {
        let Some(mut session) = self.session.take() else {
            return Vec::new();
        };
        self.epoch += 1;
        let stopped = session.scheduler.stop_all();
        session.turn.reset();
        debug!(
            connection_id = %session.id,
            stopped = stopped.len(),
            "tearing down session"
        );
        vec![
            Effect::ReleaseMicrophone,
            Effect::StopPlayback,
            Effect::CloseTransport,
            Effect::ReleaseOutput,
        ]
    }

    fn fail(&mut self, err: SessionError) -> Vec<Effect> {
        warn!(
            connection_id = self.current_id().map(|id| id.0),
            error = %err,
            detail = ?err.detail(),
            "session failed"
        );
        let effects = self.teardown();
        self.status = SessionStatus::Error;
        self.error = Some(err);
        effects
    }
}
