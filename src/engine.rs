//! # Conversation Engine
//!
//! One tokio task that owns every component of a conversation and a cloneable
//! [`VoiceClient`] handle the UI talks to.
//!
//! ## Ownership:
//! - the socket belongs to [`ConnectionManager`]
//! - the speaker belongs to [`AudioPlaybackQueue`]
//! - the microphone belongs to [`AudioCapture`]
//! - conversation flags belong to [`ConversationStateMachine`]
//!
//! The engine task is the only code that touches any of them. Socket events,
//! captured frames, timer firings, translation results and UI commands all
//! arrive as messages on channels and are handled one at a time inside a
//! single `tokio::select!` loop, so no locks are needed anywhere.
//!
//! ## Observing:
//! After every step the engine publishes a [`ConversationSnapshot`] on a
//! `watch` channel. UIs read or await changes on it; they cannot write.
//!
//! ## Key Rust Concepts Used:
//! - **mpsc + oneshot**: commands carry a reply channel when the caller needs an answer
//! - **watch**: latest-value broadcast of the observable state
//! - **Box<dyn Trait>**: devices and storage are chosen at runtime by the caller

use crate::audio::capture::{AudioCapture, AudioFrame};
use crate::audio::playback::{AudioPlaybackQueue, PlaybackEvent};
use crate::config::{AppConfig, SessionMode, VOICES};
use crate::connection::{CloseReason, ConnectionInput, ConnectionManager, ConnectionNotice};
use crate::device::{InputDevice, OutputContext};
use crate::dispatcher::{DispatchContext, DispatchSignal, ProtocolDispatcher, TranslationResult};
use crate::error::{CaptureError, ClientError, ClientResult, ConnectionError};
use crate::hint::{HintEscalationTimer, HintFired};
use crate::state::{
    ConversationSnapshot, ConversationStateMachine, ConversationStatus, MascotMood, TerminalError,
};
use crate::storage::{KeyValueStore, SELECTED_VOICE_KEY};
use crate::timer::Timer;
use crate::translation::Translator;
use crate::websocket::{parse_frame, ClientMessage, ResponseSettings, SessionReport, SessionSettings, SocketTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Extra wait after the last scheduled chunk should have ended before polling the queue.
const PLAYBACK_POLL_SLACK: Duration = Duration::from_millis(5);

/// Which session to talk to, and as whom.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBinding {
    pub session_id: String,
    /// Bearer token; `None` (or empty) connects as a guest.
    pub token: Option<String>,
}

/// Runtime-chosen collaborators for one conversation.
pub struct EngineResources {
    pub input: Box<dyn InputDevice>,
    pub output: Box<dyn OutputContext>,
    pub translator: Option<Arc<dyn Translator>>,
    /// Where a changed voice selection is persisted, if anywhere.
    pub store: Option<Box<dyn KeyValueStore>>,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Disconnect(oneshot::Sender<()>),
    StartCapture(oneshot::Sender<Result<(), CaptureError>>),
    StopCapture,
    SendText(String),
    RequestResponse,
    SetMuted(bool),
    CommitAudio,
    ClearAudio,
    DismissHint,
    UpdateVoice(String),
    Finish(oneshot::Sender<Option<SessionReport>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct FinishDue {
    generation: u64,
}

/// Handle to a running conversation engine.
#[derive(Clone)]
pub struct VoiceClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ConversationSnapshot>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl VoiceClient {
    /// Build every component and start the engine task. Must be called inside a tokio runtime.
    pub fn spawn(config: &AppConfig, binding: SessionBinding, resources: EngineResources) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(ConversationSnapshot::default());

        let target = SocketTarget {
            base_url: config.server.base_url.clone(),
            mode: config.session.mode,
            session_id: binding.session_id,
            token: binding.token,
            voice: config.session.voice.clone(),
            show_text: config.session.show_text,
        };
        let (connection, connection_rx) = ConnectionManager::new(target, config.reconnect.clone());
        let (dispatcher, translation_rx) =
            ProtocolDispatcher::new(config.session.mode, config.session.voice.clone(), resources.translator);
        let (hints, hint_rx) = HintEscalationTimer::new(config.hint_delay(), config.wait_popup_delay());
        let (frames_tx, frame_rx) = mpsc::unbounded_channel();
        let (finish_tx, finish_rx) = mpsc::unbounded_channel();

        let capture = AudioCapture::new(
            resources.input,
            config.audio.input_sample_rate,
            config.audio.buffer_size,
            config.audio.mute_policy,
        );

        let engine = ConversationEngine {
            mode: config.session.mode,
            voice: config.session.voice.clone(),
            finish_timeout: config.disconnect_timeout(),
            state: ConversationStateMachine::new(),
            connection,
            dispatcher,
            playback: AudioPlaybackQueue::new(resources.output),
            capture,
            hints,
            store: resources.store,
            frames_tx,
            terminal_error: None,
            pending_finish: None,
            finish_outbox: None,
            finish_timer: Timer::new(finish_tx),
            snapshots: snapshot_tx,
            last_status: ConversationStatus::Disconnected,
        };

        let channels = EngineChannels { command_rx, connection_rx, frame_rx, hint_rx, translation_rx, finish_rx };
        // Tags every log line the engine task emits
        let span = info_span!("conversation", client_id = %Uuid::new_v4());
        let task = tokio::spawn(engine.run(channels).instrument(span));

        Self { commands, snapshots, task: Arc::new(std::sync::Mutex::new(Some(task))) }
    }

    fn send(&self, command: Command) -> ClientResult<()> {
        self.commands.send(command).map_err(|_| ClientError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ClientResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    /// Open the socket. URL problems are returned; dial failures show up in the snapshot.
    pub async fn connect(&self) -> ClientResult<()> {
        self.request(Command::Connect).await??;
        Ok(())
    }

    /// Tear everything down. On return no capture, playback, reconnect or hint activity remains.
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.request(Command::Disconnect).await
    }

    pub async fn start_capture(&self) -> ClientResult<()> {
        self.request(Command::StartCapture).await??;
        Ok(())
    }

    pub fn stop_capture(&self) -> ClientResult<()> {
        self.send(Command::StopCapture)
    }

    /// Send a typed message and ask the AI to answer it.
    pub fn send_text(&self, text: impl Into<String>) -> ClientResult<()> {
        self.send(Command::SendText(text.into()))
    }

    /// Ask the AI to speak now, without any new user input.
    pub fn request_response(&self) -> ClientResult<()> {
        self.send(Command::RequestResponse)
    }

    pub fn set_muted(&self, muted: bool) -> ClientResult<()> {
        self.send(Command::SetMuted(muted))
    }

    pub fn commit_audio(&self) -> ClientResult<()> {
        self.send(Command::CommitAudio)
    }

    pub fn clear_audio(&self) -> ClientResult<()> {
        self.send(Command::ClearAudio)
    }

    /// Close the hint prompt and wait popup.
    pub fn dismiss_hint(&self) -> ClientResult<()> {
        self.send(Command::DismissHint)
    }

    pub fn update_voice(&self, voice: impl Into<String>) -> ClientResult<()> {
        self.send(Command::UpdateVoice(voice.into()))
    }

    /// Ask the server to end the session and wait (bounded) for its report.
    pub async fn finish(&self) -> ClientResult<Option<SessionReport>> {
        self.request(Command::Finish).await
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the snapshot satisfies `predicate`, returning that snapshot.
    pub async fn wait_for<F>(&self, mut predicate: F) -> ClientResult<ConversationSnapshot>
    where
        F: FnMut(&ConversationSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(|s| predicate(s)).await.map_err(|_| ClientError::EngineStopped)?;
        Ok(snapshot.clone())
    }

    /// Stop the engine task after a full disconnect, and wait for it.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Conversation engine task failed: {}", e);
            }
        }
    }
}

struct EngineChannels {
    command_rx: mpsc::UnboundedReceiver<Command>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionInput>,
    frame_rx: mpsc::UnboundedReceiver<AudioFrame>,
    hint_rx: mpsc::UnboundedReceiver<HintFired>,
    translation_rx: mpsc::UnboundedReceiver<TranslationResult>,
    finish_rx: mpsc::UnboundedReceiver<FinishDue>,
}

struct ConversationEngine {
    mode: SessionMode,
    voice: String,
    finish_timeout: Duration,
    state: ConversationStateMachine,
    connection: ConnectionManager,
    dispatcher: ProtocolDispatcher,
    playback: AudioPlaybackQueue,
    capture: AudioCapture,
    hints: HintEscalationTimer,
    store: Option<Box<dyn KeyValueStore>>,
    frames_tx: mpsc::UnboundedSender<AudioFrame>,
    terminal_error: Option<TerminalError>,
    pending_finish: Option<oneshot::Sender<Option<SessionReport>>>,
    /// A resolved finish, answered once the resulting state has been published.
    finish_outbox: Option<(oneshot::Sender<Option<SessionReport>>, Option<SessionReport>)>,
    finish_timer: Timer<FinishDue>,
    snapshots: watch::Sender<ConversationSnapshot>,
    last_status: ConversationStatus,
}

impl ConversationEngine {
    async fn run(mut self, mut channels: EngineChannels) {
        info!(mode = ?self.mode, "Conversation engine started");
        loop {
            let playback_wait = self
                .playback
                .is_playing()
                .then(|| Duration::from_secs_f64(self.playback.remaining_secs()) + PLAYBACK_POLL_SLACK);

            tokio::select! {
                command = channels.command_rx.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        self.shut_down();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(input) = channels.connection_rx.recv() => self.handle_connection_input(input),
                Some(frame) = channels.frame_rx.recv() => self.forward_frame(frame),
                Some(fired) = channels.hint_rx.recv() => {
                    self.hints.on_fired(fired);
                }
                Some(result) = channels.translation_rx.recv() => {
                    self.dispatcher.apply_translation(result);
                }
                Some(due) = channels.finish_rx.recv() => self.handle_finish_timeout(due),
                _ = tokio::time::sleep(playback_wait.unwrap_or_default()), if playback_wait.is_some() => {
                    self.poll_playback();
                }
            }

            self.after_step();
        }
        info!("Conversation engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.terminal_error = None;
                self.state.clear_error();
                let result = self.connection.connect();
                if let Err(e) = &result {
                    error!("Cannot connect: {}", e);
                }
                self.sync_phase();
                self.after_step();
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.full_disconnect();
                self.after_step();
                let _ = reply.send(());
            }
            Command::StartCapture(reply) => {
                let result = self.capture.start(self.frames_tx.clone());
                if matches!(result, Err(CaptureError::PermissionDenied)) {
                    self.terminal_error = Some(TerminalError::MicrophonePermission);
                }
                self.after_step();
                let _ = reply.send(result);
            }
            Command::StopCapture => self.capture.stop(),
            Command::SendText(text) => {
                if !self.state.is_ready() {
                    debug!("Session not ready, dropping typed message");
                    return;
                }
                self.connection.send(&ClientMessage::Text { text });
                self.connection
                    .send(&ClientMessage::ResponseCreate { response: ResponseSettings::text_and_audio() });
            }
            Command::RequestResponse => {
                if !self.state.is_ready() {
                    debug!("Session not ready, not requesting a response");
                    return;
                }
                self.connection
                    .send(&ClientMessage::ResponseCreate { response: ResponseSettings::text_and_audio() });
            }
            Command::SetMuted(muted) => self.capture.set_muted(muted),
            Command::CommitAudio => {
                self.connection.send(&ClientMessage::InputAudioCommit);
            }
            Command::ClearAudio => {
                self.connection.send(&ClientMessage::InputAudioClear);
            }
            Command::DismissHint => self.hints.dismiss(self.state.state().last_ai_audio_done_at),
            Command::UpdateVoice(voice) => self.update_voice(voice),
            Command::Finish(reply) => self.begin_finish(reply),
            Command::Shutdown => {}
        }
    }

    fn update_voice(&mut self, voice: String) {
        if !VOICES.contains(&voice.as_str()) {
            warn!(voice = %voice, "Ignoring unknown voice");
            return;
        }
        if voice == self.voice {
            return;
        }
        info!(voice = %voice, "Voice changed");
        self.voice = voice.clone();
        self.dispatcher.set_voice(voice.clone());
        self.connection.set_voice(voice.clone());

        if self.state.is_ready() {
            self.connection.send(&ClientMessage::SessionUpdate {
                session: SessionSettings { voice: Some(voice.clone()), turn_detection: None },
            });
        }
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.set(SELECTED_VOICE_KEY, &voice) {
                warn!("Failed to persist voice selection: {}", e);
            }
        }
    }

    fn begin_finish(&mut self, reply: oneshot::Sender<Option<SessionReport>>) {
        if self.pending_finish.is_some() {
            debug!("Finish already in progress");
            let _ = reply.send(None);
            return;
        }
        if !self.connection.is_open() {
            debug!("Socket not open, finishing without a report");
            self.full_disconnect();
            self.finish_outbox = Some((reply, None));
            return;
        }

        info!(timeout_ms = self.finish_timeout.as_millis() as u64, "Requesting session end");
        self.connection.send(&ClientMessage::Disconnect);
        self.finish_timer.arm(self.finish_timeout, |generation| FinishDue { generation });
        self.pending_finish = Some(reply);
    }

    fn handle_finish_timeout(&mut self, due: FinishDue) {
        if !self.finish_timer.accept(due.generation) {
            return;
        }
        warn!("No session report before timeout");
        self.resolve_finish(None);
        self.full_disconnect();
    }

    fn resolve_finish(&mut self, report: Option<SessionReport>) {
        self.finish_timer.cancel();
        if let Some(reply) = self.pending_finish.take() {
            self.finish_outbox = Some((reply, report));
        }
    }

    fn handle_connection_input(&mut self, input: ConnectionInput) {
        let Some(notice) = self.connection.handle(input) else {
            self.sync_phase();
            return;
        };

        match notice {
            ConnectionNotice::Opened { reconnected } => {
                self.sync_phase();
                self.dispatcher.on_connection_opened();
                self.terminal_error = None;
                if reconnected {
                    info!("Reconnected");
                }
            }
            ConnectionNotice::Frame(text) => self.handle_frame(&text),
            ConnectionNotice::Reconnecting { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting to reconnect");
                self.playback.flush();
                self.sync_phase();
            }
            ConnectionNotice::Closed(reason) => {
                let terminal = match reason {
                    CloseReason::AuthFailed(message) => TerminalError::Auth(message),
                    CloseReason::RetriesExhausted(attempts) => {
                        TerminalError::ConnectionLost(format!("gave up after {} reconnect attempts", attempts))
                    }
                    CloseReason::Lost(message) => TerminalError::ConnectionLost(message),
                };
                warn!(error = ?terminal, "Conversation connection ended");
                self.resolve_finish(None);
                self.release_local_resources();
                self.sync_phase();
                self.terminal_error = Some(terminal);
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let message = match parse_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                return;
            }
        };

        let mut ctx = DispatchContext {
            state: &mut self.state,
            outbound: &mut self.connection,
            playback: &mut self.playback,
        };
        if let Some(DispatchSignal::SessionEnded { report, .. }) = self.dispatcher.dispatch(message, &mut ctx) {
            self.resolve_finish(report);
            self.full_disconnect();
        }
    }

    fn forward_frame(&mut self, frame: AudioFrame) {
        if !self.state.is_ready() {
            return;
        }
        self.connection.send(&ClientMessage::InputAudioChunk {
            audio: frame.audio,
            sample_rate: frame.sample_rate,
        });
    }

    fn poll_playback(&mut self) {
        if let Some(PlaybackEvent::Drained) = self.playback.poll() {
            debug!(chunks = self.playback.chunks_played(), "AI finished speaking");
            self.state.ai_audio_finished(Instant::now());
        }
    }

    /// Mirror the socket phase into the state machine when it changed.
    fn sync_phase(&mut self) {
        let phase = self.connection.phase();
        if self.state.state().connection_phase != phase {
            self.state.on_connection_phase(phase);
        }
    }

    fn release_local_resources(&mut self) {
        self.capture.stop();
        self.playback.flush();
        self.hints.reset();
        self.dispatcher.cancel_pending();
    }

    /// Stop capture, flush playback, close the socket and cancel every timer.
    fn full_disconnect(&mut self) {
        self.resolve_finish(None);
        self.release_local_resources();
        self.connection.disconnect();
        self.state.reset();
        self.sync_phase();
    }

    fn shut_down(&mut self) {
        self.full_disconnect();
        self.playback.close();
        self.after_step();
    }

    /// Re-sync the hint timers and publish. Replies to callers go out after this,
    /// so an awaited command always observes its own effect in the snapshot.
    fn after_step(&mut self) {
        self.hints.sync(self.state.state(), Instant::now());
        self.publish();
        if let Some((reply, report)) = self.finish_outbox.take() {
            let _ = reply.send(report);
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        if snapshot.status != self.last_status {
            info!(from = self.last_status.as_str(), to = snapshot.status.as_str(), "Conversation status changed");
            self.last_status = snapshot.status;
        }
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn snapshot(&self) -> ConversationSnapshot {
        let state = self.state.state().clone();
        let hint = self.hints.flags();
        let reconnect_attempt = if self.state.status() == ConversationStatus::Reconnecting {
            self.connection.attempts()
        } else {
            0
        };

        ConversationSnapshot {
            status: self.state.status(),
            mood: MascotMood::derive(&state, &hint, self.dispatcher.language_not_recognized()),
            state,
            was_connected: self.state.was_connected(),
            reconnect_attempt,
            hint,
            ai_transcript: self.dispatcher.ai_transcript().to_string(),
            ai_translation: self.dispatcher.ai_translation().map(str::to_string),
            user_transcript: self.dispatcher.user_transcript().to_string(),
            language_not_recognized: self.dispatcher.language_not_recognized(),
            scenario_result: self.dispatcher.scenario_result().cloned(),
            session_report: self.dispatcher.session_report().cloned(),
            terminal_error: self.terminal_error.clone(),
            is_muted: self.capture.is_muted(),
            is_capturing: self.capture.is_active(),
        }
    }
}
