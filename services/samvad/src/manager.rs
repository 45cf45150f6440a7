//! Drives the session controller against real resources.
//!
//! [`LiveVoiceManager`] runs on a single task and is the only owner of the
//! [`SessionController`] and of the current attempt's audio output, microphone
//! and transport. Everything that completes later (the backend handshake, the
//! backend event stream, the microphone prompt, the quiet timer and both
//! audio callbacks) reports back through one inbound channel, tagged with the
//! [`ConnectionId`] it was started for. The controller decides whether a report
//! still matters; when it does not, any resource the report carries is
//! released on the spot.

use crate::devices::{AudioDevices, CaptureStream, FinishedSink, FrameSink, PlaybackOutput};
use anyhow::{Context, anyhow};
use samvad_core::activity::{ActivityFrame, MIC_BAR_COUNT, ai_glow, mic_levels};
use samvad_core::content::ContentProvider;
use samvad_core::playback::UnitId;
use samvad_core::{
    AudioSender, BackendConnection, BackendEvent, ConnectionId, Dispatch, Effect,
    LiveSessionConfig, SessionController, SessionError, SessionEvent, SessionSnapshot,
    SessionStatus, VoiceBackend, VoiceProfile,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// How often the activity feed is refreshed, roughly once per display frame.
pub const ACTIVITY_INTERVAL: Duration = Duration::from_millis(16);

/// Requests from the user interface.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    Open { figure_id: String },
    Close,
    ToggleMute,
    SetVoice(VoiceProfile),
    Retry,
    Shutdown,
}

enum Inbound {
    Transport {
        id: ConnectionId,
        result: Result<Box<dyn AudioSender>, SessionError>,
    },
    Backend {
        id: ConnectionId,
        event: BackendEvent,
    },
    Microphone {
        id: ConnectionId,
        result: Result<Box<dyn CaptureStream>, String>,
    },
    Frame {
        id: ConnectionId,
        samples: Vec<f32>,
    },
    PlaybackFinished {
        id: ConnectionId,
        unit: UnitId,
    },
    QuietElapsed {
        id: ConnectionId,
        generation: u64,
    },
}

/// Everything held on behalf of one attempt.
struct SessionResources {
    id: ConnectionId,
    output: Box<dyn PlaybackOutput>,
    transport: Option<Box<dyn AudioSender>>,
    capture: Option<Box<dyn CaptureStream>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionResources {
    /// Stops network work at once and hands device teardown to the blocking pool.
    fn release(mut self) -> JoinHandle<()> {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tokio::task::spawn_blocking(move || {
            if let Some(mut capture) = self.capture.take() {
                capture.stop();
            }
            self.output.close();
            debug!(connection_id = %self.id, "session resources released");
        })
    }
}

pub struct LiveVoiceManager {
    controller: SessionController,
    backend: Arc<dyn VoiceBackend>,
    devices: Arc<dyn AudioDevices>,
    content: Arc<dyn ContentProvider>,
    resources: Option<SessionResources>,
    // Device teardowns still running on the blocking pool.
    teardowns: Vec<JoinHandle<()>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    activity_tx: watch::Sender<ActivityFrame>,
}

/// Handle to a running [`LiveVoiceManager`].
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<UiCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    activity: watch::Receiver<ActivityFrame>,
    task: JoinHandle<()>,
}

impl ManagerHandle {
    pub fn send(&self, command: UiCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Session manager has stopped"))
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn activity(&self) -> watch::Receiver<ActivityFrame> {
        self.activity.clone()
    }

    /// Closes any open session and waits for the manager to stop.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.commands.send(UiCommand::Shutdown);
        self.task.await.context("Session manager task failed")
    }
}

impl LiveVoiceManager {
    pub fn new(
        backend: Arc<dyn VoiceBackend>,
        devices: Arc<dyn AudioDevices>,
        content: Arc<dyn ContentProvider>,
        voice: VoiceProfile,
    ) -> Self {
        let controller = SessionController::new(voice);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(controller.snapshot());
        let (activity_tx, _) = watch::channel(ActivityFrame::default());
        Self {
            controller,
            backend,
            devices,
            content,
            resources: None,
            teardowns: Vec::new(),
            inbound_tx,
            inbound_rx,
            snapshot_tx,
            activity_tx,
        }
    }

    pub fn spawn(self) -> ManagerHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let snapshots = self.snapshot_tx.subscribe();
        let activity = self.activity_tx.subscribe();
        let task = tokio::spawn(self.run(command_rx));
        ManagerHandle {
            commands,
            snapshots,
            activity,
            task,
        }
    }

    #[instrument(name = "session_manager", skip_all)]
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<UiCommand>) {
        let mut ticker = tokio::time::interval(ACTIVITY_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(UiCommand::Shutdown) | None => {
                        self.handle_command(UiCommand::Shutdown).await;
                        self.publish_activity();
                        self.publish_snapshot();
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound).await,
                _ = ticker.tick() => self.publish_activity(),
            }
            self.publish_snapshot();
        }
        for teardown in self.teardowns.drain(..) {
            if let Err(e) = teardown.await {
                warn!(error = %e, "Device teardown failed");
            }
        }
        info!("Session manager stopped");
    }

    async fn handle_command(&mut self, command: UiCommand) {
        debug!(?command, "ui command");
        let effects = match command {
            UiCommand::Open { figure_id } => match self.content.figure(&figure_id) {
                Some(profile) => self.controller.open(&figure_id, &profile),
                None => {
                    warn!(figure = %figure_id, "Unknown figure, ignoring open request");
                    return;
                }
            },
            UiCommand::Close | UiCommand::Shutdown => self.controller.close(),
            UiCommand::ToggleMute => self.controller.toggle_mute(),
            UiCommand::SetVoice(voice) => self.controller.set_voice(voice),
            UiCommand::Retry => self.controller.retry(),
        };
        self.apply(effects).await;
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Transport {
                id,
                result: Ok(sender),
            } => match self.controller.handle(id, SessionEvent::TransportReady) {
                Dispatch::Stale => {
                    debug!(connection_id = %id, "closing transport of a superseded session");
                    sender.close();
                }
                Dispatch::Applied(effects) => {
                    match self.resources.as_mut().filter(|r| r.id == id) {
                        Some(resources) => resources.transport = Some(sender),
                        None => sender.close(),
                    }
                    self.apply(effects).await;
                }
            },
            Inbound::Transport {
                id,
                result: Err(err),
            } => self.dispatch(id, SessionEvent::HandshakeFailed(err)).await,
            Inbound::Backend { id, event } => {
                let event = self.session_event(id, event);
                self.dispatch(id, event).await;
            }
            Inbound::Microphone {
                id,
                result: Ok(mut capture),
            } => match self.controller.handle(id, SessionEvent::MicrophoneGranted) {
                Dispatch::Stale => {
                    debug!(connection_id = %id, "releasing microphone granted to a superseded session");
                    self.stop_capture(capture);
                }
                Dispatch::Applied(effects) => {
                    let orphan = match self.resources.as_mut().filter(|r| r.id == id) {
                        Some(resources) => {
                            resources.capture = Some(capture);
                            None
                        }
                        None => Some(capture),
                    };
                    if let Some(capture) = orphan {
                        self.stop_capture(capture);
                    }
                    self.apply(effects).await;
                }
            },
            Inbound::Microphone {
                id,
                result: Err(detail),
            } => self.dispatch(id, SessionEvent::MicrophoneDenied(detail)).await,
            Inbound::Frame { id, samples } => {
                self.dispatch(id, SessionEvent::Frame(samples)).await
            }
            Inbound::PlaybackFinished { id, unit } => {
                self.dispatch(id, SessionEvent::PlaybackFinished(unit)).await
            }
            Inbound::QuietElapsed { id, generation } => {
                self.dispatch(id, SessionEvent::QuietElapsed { generation }).await
            }
        }
    }

    fn session_event(&self, id: ConnectionId, event: BackendEvent) -> SessionEvent {
        match event {
            BackendEvent::Opened => SessionEvent::Opened,
            BackendEvent::Text(text) => SessionEvent::Text(text),
            BackendEvent::Audio(data) => SessionEvent::Audio {
                data,
                now: self.output_clock(id),
            },
            BackendEvent::TurnComplete => SessionEvent::TurnComplete,
            BackendEvent::Closed { code, reason } => {
                debug!(connection_id = %id, ?code, %reason, "backend closed");
                SessionEvent::Closed { code }
            }
            BackendEvent::Error(detail) => SessionEvent::Errored(detail),
        }
    }

    fn output_clock(&self, id: ConnectionId) -> f64 {
        self.resources
            .as_ref()
            .filter(|r| r.id == id)
            .map_or(0.0, |r| r.output.now())
    }

    async fn dispatch(&mut self, id: ConnectionId, event: SessionEvent) {
        let effects = self.controller.handle(id, event).into_effects();
        self.apply(effects).await;
    }

    /// Applies effects in order; effects caused by a dispatch run before the
    /// rest of the batch.
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            if let Some(follow_up) = self.apply_effect(effect).await {
                for effect in follow_up.into_iter().rev() {
                    queue.push_front(effect);
                }
            }
        }
    }

    /// Carries out one effect. Returns the effects of any dispatch it caused.
    async fn apply_effect(&mut self, effect: Effect) -> Option<Vec<Effect>> {
        match effect {
            Effect::AcquireOutput { id } => return self.acquire_output(id).await,
            Effect::Connect { id, config } => {
                if self.controller.current_id() == Some(id) {
                    self.connect(id, config);
                } else {
                    debug!(connection_id = %id, "skipping connect for a superseded session");
                }
            }
            Effect::RequestMicrophone { id } => {
                if self.controller.current_id() == Some(id) {
                    self.request_microphone(id);
                } else {
                    debug!(connection_id = %id, "skipping microphone request for a superseded session");
                }
            }
            Effect::SendAudio(data) => {
                let resources = self.resources.as_ref()?;
                let id = resources.id;
                if let Err(err) = resources.transport.as_ref()?.send_audio(data) {
                    return Some(
                        self.controller
                            .handle(id, SessionEvent::SendFailed(err))
                            .into_effects(),
                    );
                }
            }
            Effect::Play { chunk, samples } => {
                if let Some(resources) = self.resources.as_mut() {
                    resources.output.play(&chunk, samples);
                }
            }
            Effect::ArmQuietTimer { generation, after } => {
                if let Some(resources) = self.resources.as_mut() {
                    let id = resources.id;
                    let inbound = self.inbound_tx.clone();
                    resources.tasks.push(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = inbound.send(Inbound::QuietElapsed { id, generation });
                    }));
                }
            }
            Effect::Cue(cue) => {
                if let Some(resources) = self.resources.as_mut() {
                    resources.output.play_cue(cue);
                }
            }
            Effect::ReleaseMicrophone => {
                if let Some(capture) = self.resources.as_mut().and_then(|r| r.capture.take()) {
                    self.stop_capture(capture);
                }
            }
            Effect::StopPlayback => {
                if let Some(resources) = self.resources.as_mut() {
                    resources.output.stop_all();
                }
            }
            Effect::CloseTransport => {
                if let Some(transport) = self.resources.as_mut().and_then(|r| r.transport.take()) {
                    transport.close();
                }
            }
            Effect::ReleaseOutput => {
                if let Some(resources) = self.resources.take() {
                    let teardown = resources.release();
                    self.track_teardown(teardown);
                }
            }
        }
        None
    }

    fn track_teardown(&mut self, teardown: JoinHandle<()>) {
        self.teardowns.retain(|t| !t.is_finished());
        self.teardowns.push(teardown);
    }

    fn stop_capture(&mut self, mut capture: Box<dyn CaptureStream>) {
        let teardown = tokio::task::spawn_blocking(move || capture.stop());
        self.track_teardown(teardown);
    }

    async fn acquire_output(&mut self, id: ConnectionId) -> Option<Vec<Effect>> {
        if let Some(leftover) = self.resources.take() {
            warn!(connection_id = %leftover.id, "releasing resources left behind by an earlier session");
            let teardown = leftover.release();
            self.track_teardown(teardown);
        }
        let inbound = self.inbound_tx.clone();
        let on_finished: FinishedSink = Box::new(move |unit| {
            let _ = inbound.send(Inbound::PlaybackFinished { id, unit });
        });
        // Stream start-up waits on the audio thread, so it runs off the runtime.
        let devices = self.devices.clone();
        let opened = tokio::task::spawn_blocking(move || devices.open_output(on_finished))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result);
        match opened {
            Ok(output) => {
                self.resources = Some(SessionResources {
                    id,
                    output,
                    transport: None,
                    capture: None,
                    tasks: Vec::new(),
                });
                None
            }
            Err(e) => {
                warn!(connection_id = %id, error = ?e, "Failed to open audio output");
                Some(
                    self.controller
                        .handle(id, SessionEvent::OutputFailed(format!("{e:#}")))
                        .into_effects(),
                )
            }
        }
    }

    fn connect(&mut self, id: ConnectionId, config: LiveSessionConfig) {
        let Some(resources) = self.resources.as_mut().filter(|r| r.id == id) else {
            warn!(connection_id = %id, "no resources for session, not connecting");
            return;
        };
        let backend = self.backend.clone();
        let inbound = self.inbound_tx.clone();
        resources.tasks.push(tokio::spawn(async move {
            let BackendConnection { sender, mut events } = match backend.connect(config).await {
                Ok(connection) => connection,
                Err(err) => {
                    let _ = inbound.send(Inbound::Transport {
                        id,
                        result: Err(err),
                    });
                    return;
                }
            };
            if inbound
                .send(Inbound::Transport {
                    id,
                    result: Ok(sender),
                })
                .is_err()
            {
                return;
            }
            while let Some(event) = events.recv().await {
                if inbound.send(Inbound::Backend { id, event }).is_err() {
                    break;
                }
            }
            debug!(connection_id = %id, "backend event stream ended");
        }));
    }

    fn request_microphone(&mut self, id: ConnectionId) {
        let devices = self.devices.clone();
        let inbound = self.inbound_tx.clone();
        let frames = self.inbound_tx.clone();
        let on_frame: FrameSink = Box::new(move |samples| {
            let _ = frames.send(Inbound::Frame { id, samples });
        });
        // Opening may block on a permission prompt; the result is checked
        // against the current session when it arrives.
        tokio::task::spawn_blocking(move || {
            let result = devices
                .open_capture(on_frame)
                .map_err(|e| format!("{e:#}"));
            let _ = inbound.send(Inbound::Microphone { id, result });
        });
    }

    fn publish_snapshot(&self) {
        let next = self.controller.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn publish_activity(&mut self) {
        let connected = self.controller.status() == SessionStatus::Connected;
        let frame = match self.resources.as_mut() {
            Some(resources) if connected => {
                let mic = resources
                    .capture
                    .as_mut()
                    .map(|capture| capture.spectrum())
                    .unwrap_or_default();
                let ai = resources.output.spectrum();
                ActivityFrame {
                    mic: mic_levels(&mic, MIC_BAR_COUNT, self.controller.is_muted()),
                    ai: ai_glow(&ai),
                }
            }
            _ => ActivityFrame::default(),
        };
        self.activity_tx.send_if_modified(|current| {
            if *current == frame {
                return false;
            }
            *current = frame;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockAudioDevices;
    use async_trait::async_trait;
    use samvad_core::audio_utils;
    use samvad_core::capture::FRAME_SIZE;
    use samvad_core::content::StaticContent;
    use samvad_core::playback::{Cue, ScheduledChunk};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const FIGURES: &str = r#"{
        "ashoka": {
            "summary": { "title": "Ashoka the Great (304-232 BCE)", "reign": "268-232 BCE" },
            "content": "<p>Third emperor of the Maurya dynasty.</p>"
        }
    }"#;

    #[derive(Default)]
    struct TransportLog {
        sent: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    struct FakeSender(Arc<TransportLog>);

    impl AudioSender for FakeSender {
        fn send_audio(&self, base64_pcm: String) -> Result<(), SessionError> {
            if self.0.closed.load(Ordering::SeqCst) {
                return Err(SessionError::StaleSession);
            }
            self.0.sent.lock().unwrap().push(base64_pcm);
            Ok(())
        }

        fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Plan {
        gate: Option<oneshot::Receiver<()>>,
        outcome: Result<Vec<BackendEvent>, SessionError>,
    }

    /// Backend whose connects follow a queue of plans.
    #[derive(Default)]
    struct FakeBackend {
        plans: Mutex<VecDeque<Plan>>,
        configs: Mutex<Vec<LiveSessionConfig>>,
        transports: Mutex<Vec<Arc<TransportLog>>>,
        // Keeps each event stream open and lets tests push more events.
        streams: Mutex<Vec<mpsc::UnboundedSender<BackendEvent>>>,
    }

    impl FakeBackend {
        fn plan(&self, events: Vec<BackendEvent>) {
            self.plans.lock().unwrap().push_back(Plan {
                gate: None,
                outcome: Ok(events),
            });
        }

        fn plan_gated(&self, events: Vec<BackendEvent>) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.plans.lock().unwrap().push_back(Plan {
                gate: Some(rx),
                outcome: Ok(events),
            });
            tx
        }

        fn transport(&self, n: usize) -> Arc<TransportLog> {
            self.transports.lock().unwrap()[n].clone()
        }

        fn transport_count(&self) -> usize {
            self.transports.lock().unwrap().len()
        }

        fn push_event(&self, n: usize, event: BackendEvent) {
            self.streams.lock().unwrap()[n].send(event).unwrap();
        }

        fn configs(&self) -> Vec<LiveSessionConfig> {
            self.configs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VoiceBackend for FakeBackend {
        async fn connect(
            &self,
            config: LiveSessionConfig,
        ) -> Result<BackendConnection, SessionError> {
            self.configs.lock().unwrap().push(config);
            let plan = self
                .plans
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected connect");
            if let Some(gate) = plan.gate {
                let _ = gate.await;
            }
            let events = plan.outcome?;
            let (tx, rx) = mpsc::unbounded_channel();
            for event in events {
                tx.send(event).unwrap();
            }
            let log = Arc::new(TransportLog::default());
            self.transports.lock().unwrap().push(log.clone());
            self.streams.lock().unwrap().push(tx);
            Ok(BackendConnection {
                sender: Box::new(FakeSender(log)),
                events: rx,
            })
        }
    }

    #[derive(Default)]
    struct OutputLog {
        played: Mutex<Vec<ScheduledChunk>>,
        cues: Mutex<Vec<Cue>>,
        stops: AtomicUsize,
        closed: AtomicBool,
        clock: Mutex<f64>,
        level: AtomicU8,
    }

    struct FakeOutput(Arc<OutputLog>);

    impl PlaybackOutput for FakeOutput {
        fn now(&self) -> f64 {
            *self.0.clock.lock().unwrap()
        }

        fn play(&mut self, chunk: &ScheduledChunk, _samples: Vec<f32>) {
            self.0.played.lock().unwrap().push(*chunk);
        }

        fn play_cue(&mut self, cue: Cue) {
            self.0.cues.lock().unwrap().push(cue);
        }

        fn stop_all(&mut self) {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn spectrum(&mut self) -> Vec<u8> {
            vec![self.0.level.load(Ordering::SeqCst); 32]
        }

        fn close(&mut self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CaptureLog {
        stopped: AtomicBool,
        polled: AtomicUsize,
    }

    struct FakeCapture(Arc<CaptureLog>);

    impl CaptureStream for FakeCapture {
        fn spectrum(&mut self) -> Vec<u8> {
            self.0.polled.fetch_add(1, Ordering::SeqCst);
            vec![128; 32]
        }

        fn stop(&mut self) {
            self.0.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RigOptions {
        fail_output: bool,
        deny_microphone: bool,
        microphone_gate: Option<std::sync::mpsc::Receiver<()>>,
    }

    struct Rig {
        backend: Arc<FakeBackend>,
        outputs: Arc<Mutex<Vec<Arc<OutputLog>>>>,
        captures: Arc<Mutex<Vec<Arc<CaptureLog>>>>,
        frame_sinks: Arc<Mutex<Vec<FrameSink>>>,
        finished_sinks: Arc<Mutex<Vec<FinishedSink>>>,
        handle: ManagerHandle,
    }

    impl Rig {
        fn new(options: RigOptions) -> Self {
            let backend = Arc::new(FakeBackend::default());
            let outputs: Arc<Mutex<Vec<Arc<OutputLog>>>> = Arc::default();
            let captures: Arc<Mutex<Vec<Arc<CaptureLog>>>> = Arc::default();
            let frame_sinks: Arc<Mutex<Vec<FrameSink>>> = Arc::default();
            let finished_sinks: Arc<Mutex<Vec<FinishedSink>>> = Arc::default();

            let mut devices = MockAudioDevices::new();
            let (outputs_in, finished_in) = (outputs.clone(), finished_sinks.clone());
            let fail_output = options.fail_output;
            devices.expect_open_output().returning(move |on_finished| {
                if fail_output {
                    return Err(anyhow!("no default output device"));
                }
                finished_in.lock().unwrap().push(on_finished);
                let log = Arc::new(OutputLog::default());
                outputs_in.lock().unwrap().push(log.clone());
                Ok(Box::new(FakeOutput(log)) as Box<dyn PlaybackOutput>)
            });
            let (captures_in, frames_in) = (captures.clone(), frame_sinks.clone());
            let deny = options.deny_microphone;
            let gate = Mutex::new(options.microphone_gate);
            devices.expect_open_capture().returning(move |on_frame| {
                let pending = gate.lock().unwrap().take();
                if let Some(pending) = pending {
                    let _ = pending.recv();
                }
                if deny {
                    return Err(anyhow!("NotAllowedError: permission denied"));
                }
                frames_in.lock().unwrap().push(on_frame);
                let log = Arc::new(CaptureLog::default());
                captures_in.lock().unwrap().push(log.clone());
                Ok(Box::new(FakeCapture(log)) as Box<dyn CaptureStream>)
            });

            let content = Arc::new(StaticContent::from_json_str(FIGURES).unwrap());
            let handle = LiveVoiceManager::new(
                backend.clone(),
                Arc::new(devices),
                content,
                VoiceProfile::Male,
            )
            .spawn();
            Self {
                backend,
                outputs,
                captures,
                frame_sinks,
                finished_sinks,
                handle,
            }
        }

        fn open(&self) {
            self.handle
                .send(UiCommand::Open {
                    figure_id: "ashoka".to_string(),
                })
                .unwrap();
        }

        fn output(&self, n: usize) -> Arc<OutputLog> {
            self.outputs.lock().unwrap()[n].clone()
        }

        fn capture_count(&self) -> usize {
            self.captures.lock().unwrap().len()
        }

        fn push_frame(&self) {
            let mut sinks = self.frame_sinks.lock().unwrap();
            if let Some(sink) = sinks.last_mut() {
                sink(vec![0.25; FRAME_SIZE]);
            }
        }

        async fn wait_for(&self, what: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
            let mut snapshots = self.handle.snapshots();
            let seen = timeout(Duration::from_secs(3), snapshots.wait_for(|s| what(s)))
                .await
                .expect("timed out waiting for snapshot")
                .map(|snapshot| snapshot.clone())
                .expect("manager stopped");
            seen
        }

        async fn wait_for_status(&self, status: SessionStatus) -> SessionSnapshot {
            self.wait_for(|s| s.status == status).await
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_open_streams_microphone_frames_to_transport() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();

        let snapshot = rig.wait_for_status(SessionStatus::Connected).await;
        assert_eq!(snapshot.figure_id.as_deref(), Some("ashoka"));
        assert!(snapshot.error_message.is_none());

        let configs = rig.backend.configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].voice_name, "Fenrir");
        assert!(configs[0].system_instruction.starts_with("You are Ashoka the Great (304-232 BCE)."));

        eventually(|| rig.capture_count() == 1).await;
        let transport = rig.backend.transport(0);
        eventually(|| {
            rig.push_frame();
            !transport.sent.lock().unwrap().is_empty()
        })
        .await;
        let first = transport.sent.lock().unwrap()[0].clone();
        let decoded = audio_utils::decode_f32_from_base64_i16(&first).unwrap();
        assert_eq!(decoded.len(), FRAME_SIZE);
        assert_eq!(*rig.output(0).cues.lock().unwrap(), vec![Cue::Connect]);

        rig.handle.send(UiCommand::Close).unwrap();
        rig.wait_for_status(SessionStatus::Disconnected).await;
        eventually(|| rig.output(0).closed.load(Ordering::SeqCst)).await;
        assert!(transport.closed.load(Ordering::SeqCst));
        assert!(rig.captures.lock().unwrap()[0].stopped.load(Ordering::SeqCst));
        assert!(rig.output(0).stops.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_microphone_granted_after_close_is_released() {
        let (release, gate) = std::sync::mpsc::channel();
        let rig = Rig::new(RigOptions {
            microphone_gate: Some(gate),
            ..RigOptions::default()
        });
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        rig.wait_for_status(SessionStatus::Connected).await;

        rig.handle.send(UiCommand::Close).unwrap();
        rig.wait_for_status(SessionStatus::Disconnected).await;

        // The permission prompt resolves only now.
        release.send(()).unwrap();
        eventually(|| rig.capture_count() == 1).await;
        eventually(|| rig.captures.lock().unwrap()[0].stopped.load(Ordering::SeqCst)).await;

        rig.push_frame();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.backend.transport(0).sent.lock().unwrap().is_empty());
        assert_eq!(rig.handle.snapshot().status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_superseded_handshake_never_goes_live() {
        let rig = Rig::new(RigOptions::default());
        let late = rig.backend.plan_gated(vec![BackendEvent::Opened]);
        rig.backend.plan(vec![BackendEvent::Opened]);

        rig.open();
        eventually(|| rig.backend.configs().len() == 1).await;
        rig.handle.send(UiCommand::Close).unwrap();
        rig.open();
        let connected = rig.wait_for_status(SessionStatus::Connected).await;

        // The first attempt's handshake completes after it was replaced.
        let _ = late.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let live: Vec<_> = (0..rig.backend.transport_count())
            .map(|n| rig.backend.transport(n))
            .filter(|t| !t.closed.load(Ordering::SeqCst))
            .collect();
        assert_eq!(live.len(), 1);
        let snapshot = rig.handle.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Connected);
        assert_eq!(snapshot.connection_id, connected.connection_id);
        eventually(|| rig.output(0).closed.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_access_denied_close_then_retry() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![
            BackendEvent::Opened,
            BackendEvent::Closed {
                code: Some(1008),
                reason: "referrer blocked".to_string(),
            },
        ]);
        rig.open();

        let failed = rig.wait_for_status(SessionStatus::Error).await;
        assert_eq!(
            failed.error_message.as_deref(),
            Some("Access Denied: Please check API Key Referrer/Domain restrictions.")
        );
        eventually(|| rig.output(0).closed.load(Ordering::SeqCst)).await;
        assert!(rig.backend.transport(0).closed.load(Ordering::SeqCst));

        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.handle.send(UiCommand::Retry).unwrap();
        let retried = rig.wait_for_status(SessionStatus::Connected).await;
        assert!(retried.connection_id > failed.connection_id);
        assert!(retried.error_message.is_none());
        assert_eq!(rig.backend.configs().len(), 2);
    }

    #[tokio::test]
    async fn test_output_failure_is_reported_without_connecting() {
        let rig = Rig::new(RigOptions {
            fail_output: true,
            ..RigOptions::default()
        });
        rig.open();
        let snapshot = rig.wait_for_status(SessionStatus::Error).await;
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("Audio output unavailable")
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.backend.configs().is_empty());
    }

    #[tokio::test]
    async fn test_denied_microphone_is_an_error() {
        let rig = Rig::new(RigOptions {
            deny_microphone: true,
            ..RigOptions::default()
        });
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        let snapshot = rig.wait_for_status(SessionStatus::Error).await;
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("Microphone access denied")
        );
        eventually(|| rig.backend.transport(0).closed.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_model_audio_is_scheduled_on_output_clock() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        rig.wait_for_status(SessionStatus::Connected).await;

        *rig.output(0).clock.lock().unwrap() = 1.5;
        let chunk = audio_utils::encode_f32_to_base64_i16(&vec![0.1; 2400]);
        rig.backend.push_event(0, BackendEvent::Audio(chunk.clone()));
        rig.backend.push_event(0, BackendEvent::Audio(chunk));
        eventually(|| rig.output(0).played.lock().unwrap().len() == 2).await;

        let played = rig.output(0).played.lock().unwrap().clone();
        assert!((played[0].start_at - 1.5).abs() < 1e-9);
        assert!((played[1].start_at - 1.6).abs() < 1e-9);
        rig.wait_for(|s| s.speaking).await;

        {
            let mut sinks = rig.finished_sinks.lock().unwrap();
            for chunk in &played {
                (sinks[0])(chunk.unit);
            }
        }
        rig.backend.push_event(0, BackendEvent::TurnComplete);
        rig.wait_for(|s| !s.speaking).await;
        assert_eq!(rig.handle.snapshot().status, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_mute_stops_frames_and_voice_switch_reopens() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        let first = rig.wait_for_status(SessionStatus::Connected).await;
        eventually(|| rig.capture_count() == 1).await;
        let transport = rig.backend.transport(0);
        eventually(|| {
            rig.push_frame();
            !transport.sent.lock().unwrap().is_empty()
        })
        .await;

        rig.handle.send(UiCommand::ToggleMute).unwrap();
        rig.wait_for(|s| s.muted).await;
        let sent = transport.sent.lock().unwrap().len();
        for _ in 0..3 {
            rig.push_frame();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), sent);
        assert!(rig.output(0).cues.lock().unwrap().contains(&Cue::Click));

        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.handle
            .send(UiCommand::SetVoice(VoiceProfile::Female))
            .unwrap();
        let second = rig
            .wait_for(|s| s.status == SessionStatus::Connected && s.connection_id > first.connection_id)
            .await;
        assert_eq!(second.voice, VoiceProfile::Female);
        assert!(second.muted);
        assert_eq!(rig.backend.configs()[1].voice_name, "Kore");
        assert!(transport.closed.load(Ordering::SeqCst));
        eventually(|| rig.output(0).closed.load(Ordering::SeqCst)).await;
        assert_eq!(
            rig.output(1).cues.lock().unwrap().first(),
            Some(&Cue::Click)
        );
    }

    #[tokio::test]
    async fn test_unknown_figure_is_ignored() {
        let rig = Rig::new(RigOptions::default());
        rig.handle
            .send(UiCommand::Open {
                figure_id: "nobody".to_string(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rig.handle.snapshot().status, SessionStatus::Disconnected);
        assert!(rig.backend.configs().is_empty());
        assert!(rig.outputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activity_feed_follows_connection() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        rig.wait_for_status(SessionStatus::Connected).await;
        rig.output(0).level.store(200, Ordering::SeqCst);

        let mut activity = rig.handle.activity();
        timeout(Duration::from_secs(3), activity.wait_for(|f| f.ai.active))
            .await
            .unwrap()
            .unwrap();

        rig.handle.send(UiCommand::Close).unwrap();
        timeout(
            Duration::from_secs(3),
            activity.wait_for(|f| *f == ActivityFrame::default()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_mute_flattens_mic_bars_but_keeps_capture_running() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        rig.wait_for_status(SessionStatus::Connected).await;
        eventually(|| rig.capture_count() == 1).await;
        let capture = rig.captures.lock().unwrap()[0].clone();

        let mut activity = rig.handle.activity();
        let live = |f: &ActivityFrame| f.mic.active && f.mic.bars.iter().all(|b| *b > 0.4);
        timeout(Duration::from_secs(3), activity.wait_for(live))
            .await
            .unwrap()
            .unwrap();

        rig.handle.send(UiCommand::ToggleMute).unwrap();
        timeout(
            Duration::from_secs(3),
            activity.wait_for(|f| !f.mic.active && f.mic.bars.iter().all(|b| *b == 0.0)),
        )
        .await
        .unwrap()
        .unwrap();
        let polled = capture.polled.load(Ordering::SeqCst);
        eventually(|| capture.polled.load(Ordering::SeqCst) > polled + 3).await;
        assert!(!capture.stopped.load(Ordering::SeqCst));
        assert_eq!(rig.capture_count(), 1);

        rig.handle.send(UiCommand::ToggleMute).unwrap();
        timeout(Duration::from_secs(3), activity.wait_for(live))
            .await
            .unwrap()
            .unwrap();
        assert!(!capture.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_releases_session() {
        let rig = Rig::new(RigOptions::default());
        rig.backend.plan(vec![BackendEvent::Opened]);
        rig.open();
        rig.wait_for_status(SessionStatus::Connected).await;

        let Rig {
            backend,
            outputs,
            handle,
            ..
        } = rig;
        handle.shutdown().await.unwrap();
        assert!(outputs.lock().unwrap()[0].closed.load(Ordering::SeqCst));
        assert!(backend.transport(0).closed.load(Ordering::SeqCst));
    }
}
