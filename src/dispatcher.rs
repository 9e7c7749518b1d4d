//! # Protocol Dispatcher
//!
//! Interprets inbound server messages, one at a time and in arrival order, and
//! applies them to the conversation: state flags, transcript buffers, the
//! playback queue and the scenario result.
//!
//! ## Construction:
//! Everything the dispatcher needs is provided up front (mode, voice, an
//! optional translator and the channel translation results come back on). The
//! mutable collaborators it touches per message are lent to it through a
//! [`DispatchContext`] for the duration of one call.
//!
//! ## AI Turns:
//! - a delta after silence (or after a finished turn) opens a new turn and clears the buffer
//! - further deltas append in receipt order
//! - `done` overwrites the buffer with the final text; a repeated `done` overwrites again
//! - user speech seals the turn, so the next AI text starts fresh
//!
//! Each finished utterance is translated on a detached task. The result is
//! tagged with `(turn, revision)` and dropped unless it still matches the
//! current text, so a slow translation can never land on a newer turn.

use crate::audio::playback::{AudioPlaybackQueue, EnqueueOutcome, PlaybackEvent};
use crate::config::SessionMode;
use crate::connection::Outbound;
use crate::state::{ConversationStateMachine, ScenarioResult};
use crate::translation::Translator;
use crate::websocket::{
    ClientMessage, ResponseSettings, ServerMessage, SessionReport, SessionSettings, TurnDetection,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Marker the speech recognizer leaves when it could not understand the user.
const UNINTELLIGIBLE_MARKER: &str = "[unintelligible]";

/// Collaborators lent to [`ProtocolDispatcher::dispatch`].
pub struct DispatchContext<'a> {
    pub state: &'a mut ConversationStateMachine,
    pub outbound: &'a mut dyn Outbound,
    pub playback: &'a mut AudioPlaybackQueue,
}

/// Something the engine must act on after a message was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchSignal {
    /// The server ended the session.
    SessionEnded {
        reason: Option<String>,
        report: Option<SessionReport>,
    },
}

/// Finished translation of one AI utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationResult {
    pub turn: u64,
    pub revision: u64,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    /// No AI turn in progress; the next AI text opens one.
    Sealed,
    Streaming,
    Finalized,
}

/// Messages sent once per connection when the server reports ready.
pub fn session_init_messages(mode: SessionMode, voice: &str) -> Vec<ClientMessage> {
    match mode {
        SessionMode::Scenario => vec![
            ClientMessage::SessionUpdate {
                session: SessionSettings { voice: None, turn_detection: Some(TurnDetection::server_vad()) },
            },
            ClientMessage::ResponseCreate { response: ResponseSettings::text_and_audio() },
        ],
        SessionMode::Chat => vec![ClientMessage::SessionUpdate {
            session: SessionSettings { voice: Some(voice.to_string()), turn_detection: None },
        }],
    }
}

pub struct ProtocolDispatcher {
    mode: SessionMode,
    voice: String,
    translator: Option<Arc<dyn Translator>>,
    translations: mpsc::UnboundedSender<TranslationResult>,
    translation_tasks: Vec<JoinHandle<()>>,
    session_initialized: bool,

    ai_text: String,
    ai_translation: Option<String>,
    turn: u64,
    revision: u64,
    turn_phase: TurnPhase,

    user_text: String,
    language_not_recognized: bool,
    scenario_result: Option<ScenarioResult>,
    session_report: Option<SessionReport>,
}

impl ProtocolDispatcher {
    /// Create a dispatcher and the receiver translation results arrive on.
    pub fn new(
        mode: SessionMode,
        voice: impl Into<String>,
        translator: Option<Arc<dyn Translator>>,
    ) -> (Self, mpsc::UnboundedReceiver<TranslationResult>) {
        let (translations, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            mode,
            voice: voice.into(),
            translator,
            translations,
            translation_tasks: Vec::new(),
            session_initialized: false,
            ai_text: String::new(),
            ai_translation: None,
            turn: 0,
            revision: 0,
            turn_phase: TurnPhase::Sealed,
            user_text: String::new(),
            language_not_recognized: false,
            scenario_result: None,
            session_report: None,
        };
        (dispatcher, rx)
    }

    /// A new socket opened; session setup must run again on its first ready.
    pub fn on_connection_opened(&mut self) {
        self.session_initialized = false;
    }

    pub fn set_voice(&mut self, voice: impl Into<String>) {
        self.voice = voice.into();
    }

    /// Apply one inbound message.
    pub fn dispatch(&mut self, message: ServerMessage, ctx: &mut DispatchContext<'_>) -> Option<DispatchSignal> {
        match message {
            ServerMessage::Ready => {
                ctx.state.mark_ready();
                if !self.session_initialized {
                    self.session_initialized = true;
                    info!(mode = ?self.mode, "Server ready, initializing session");
                    for init in session_init_messages(self.mode, &self.voice) {
                        ctx.outbound.send(&init);
                    }
                }
            }

            ServerMessage::AudioDelta { delta, sample_rate } => {
                // Some servers stream audio before any explicit ready
                ctx.state.mark_ready();
                match ctx.playback.enqueue(&delta, sample_rate) {
                    EnqueueOutcome::Scheduled(Some(PlaybackEvent::Started)) => ctx.state.ai_audio_started(),
                    EnqueueOutcome::Scheduled(_) => {}
                    EnqueueOutcome::Malformed => debug!("Skipped malformed audio delta"),
                    EnqueueOutcome::ContextClosed => debug!("Skipped audio delta after output closed"),
                }
            }

            ServerMessage::AudioDone => {
                debug!(queued = ctx.playback.queued_chunks(), "Server finished sending audio");
            }

            ServerMessage::TranscriptDelta { transcript_delta } => {
                if self.turn_phase != TurnPhase::Streaming {
                    self.begin_turn();
                    self.turn_phase = TurnPhase::Streaming;
                }
                self.ai_text.push_str(&transcript_delta);
            }

            ServerMessage::TranscriptDone { transcript } => {
                if self.turn_phase == TurnPhase::Sealed {
                    self.begin_turn();
                }
                self.turn_phase = TurnPhase::Finalized;
                self.revision += 1;
                self.ai_text = transcript;
                self.ai_translation = None;
                debug!(turn = self.turn, text = %self.ai_text, "AI utterance finished");
                self.request_translation();
            }

            ServerMessage::SpeechStarted => {
                if ctx.playback.is_playing() {
                    info!(queued = ctx.playback.queued_chunks(), "Barge-in, flushing playback");
                }
                ctx.playback.flush();
                ctx.state.user_started_speaking();
                self.turn_phase = TurnPhase::Sealed;
            }

            ServerMessage::SpeechStopped => {
                debug!("Server detected end of user speech");
            }

            ServerMessage::UserTranscript { transcript } => {
                ctx.state.user_finished_speaking();
                self.language_not_recognized = transcript.to_lowercase().contains(UNINTELLIGIBLE_MARKER);
                if self.language_not_recognized {
                    warn!("User speech was not recognized");
                }
                self.user_text = transcript;
                self.turn_phase = TurnPhase::Sealed;
            }

            ServerMessage::ScenarioCompleted { json } => {
                if self.scenario_result.is_some() {
                    debug!("Scenario result already recorded, ignoring repeat");
                } else {
                    info!(place = %json.place, partner = %json.conversation_partner, "Scenario completed");
                    self.scenario_result = Some(ScenarioResult {
                        place: json.place,
                        conversation_partner: json.conversation_partner,
                        conversation_goal: json.conversation_goal,
                        session_id: json.session_id,
                    });
                }
            }

            ServerMessage::Disconnected { reason, report } => {
                info!(reason = ?reason, has_report = report.is_some(), "Server ended the session");
                if report.is_some() {
                    self.session_report = report.clone();
                }
                return Some(DispatchSignal::SessionEnded { reason, report });
            }

            ServerMessage::Error { message, code } => {
                warn!(code = ?code, "Server reported error: {}", message);
                ctx.state.record_error(message);
            }

            ServerMessage::Unknown => {}
        }
        None
    }

    /// Apply a finished translation if it still belongs to the current text.
    pub fn apply_translation(&mut self, result: TranslationResult) -> bool {
        if result.turn != self.turn || result.revision != self.revision {
            debug!(turn = result.turn, current = self.turn, "Dropping stale translation");
            return false;
        }
        self.ai_translation = result.text;
        true
    }

    /// Abort translations still in flight.
    pub fn cancel_pending(&mut self) {
        for task in self.translation_tasks.drain(..) {
            task.abort();
        }
    }

    pub fn pending_translations(&self) -> usize {
        self.translation_tasks.iter().filter(|t| !t.is_finished()).count()
    }

    fn begin_turn(&mut self) {
        self.turn += 1;
        self.revision = 0;
        self.ai_text.clear();
        self.ai_translation = None;
    }

    fn request_translation(&mut self) {
        let Some(translator) = self.translator.clone() else {
            return;
        };
        if self.ai_text.trim().is_empty() {
            return;
        }

        let text = self.ai_text.clone();
        let (turn, revision) = (self.turn, self.revision);
        let results = self.translations.clone();

        self.translation_tasks.retain(|t| !t.is_finished());
        self.translation_tasks.push(tokio::spawn(async move {
            let text = match translator.translate(text).await {
                Ok(translated) => Some(translated),
                Err(e) => {
                    warn!(turn, "Translation failed: {}", e);
                    None
                }
            };
            let _ = results.send(TranslationResult { turn, revision, text });
        }));
    }

    pub fn ai_transcript(&self) -> &str {
        &self.ai_text
    }

    pub fn ai_translation(&self) -> Option<&str> {
        self.ai_translation.as_deref()
    }

    pub fn user_transcript(&self) -> &str {
        &self.user_text
    }

    pub fn language_not_recognized(&self) -> bool {
        self.language_not_recognized
    }

    pub fn scenario_result(&self) -> Option<&ScenarioResult> {
        self.scenario_result.as_ref()
    }

    pub fn session_report(&self) -> Option<&SessionReport> {
        self.session_report.as_ref()
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }
}

impl Drop for ProtocolDispatcher {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
