//! # Conversation State
//!
//! The value object the UI observes, and the small state machine that derives
//! a display status from it.
//!
//! ## States:
//! ```text
//! disconnected → connecting → connected-not-ready → ready-idle ⇄ ai-speaking
//!                     ↑                                  ⇅
//!               reconnecting                        user-speaking
//! ```
//!
//! ## Single Writer:
//! Only the engine task mutates [`ConversationStateMachine`], driven by
//! connection lifecycle events, dispatcher flags and playback activity. The UI
//! receives cloned [`ConversationSnapshot`]s through a `watch` channel and can
//! never write back.
//!
//! ## Was-Connected Latch:
//! `was_connected` flips to true the first time the socket opens and never goes
//! back. It tells "still trying to connect" apart from "lost a working connection".

use crate::connection::ConnectionPhase;
use crate::hint::HintFlags;
use crate::websocket::SessionReport;
use serde::Serialize;
use tokio::time::Instant;

/// Conversation state value object.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub connection_phase: ConnectionPhase,
    pub is_ready: bool,
    pub is_ai_speaking: bool,
    pub is_user_speaking: bool,
    /// When AI audio last finished playing out; cleared when the user starts speaking.
    pub last_ai_audio_done_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            connection_phase: ConnectionPhase::Idle,
            is_ready: false,
            is_ai_speaking: false,
            is_user_speaking: false,
            last_ai_audio_done_at: None,
            last_error: None,
        }
    }
}

/// UI-facing status derived from [`ConversationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationStatus {
    Disconnected,
    Connecting,
    Reconnecting,
    ConnectedNotReady,
    ReadyIdle,
    AiSpeaking,
    UserSpeaking,
}

impl ConversationStatus {
    /// Derive the status. User speech wins over AI speech, since barge-in flushes the AI.
    pub fn derive(state: &ConversationState) -> Self {
        match state.connection_phase {
            ConnectionPhase::Open => {
                if !state.is_ready {
                    ConversationStatus::ConnectedNotReady
                } else if state.is_user_speaking {
                    ConversationStatus::UserSpeaking
                } else if state.is_ai_speaking {
                    ConversationStatus::AiSpeaking
                } else {
                    ConversationStatus::ReadyIdle
                }
            }
            ConnectionPhase::Connecting => ConversationStatus::Connecting,
            ConnectionPhase::Reconnecting => ConversationStatus::Reconnecting,
            ConnectionPhase::Idle | ConnectionPhase::Closing | ConnectionPhase::Closed => {
                ConversationStatus::Disconnected
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Disconnected => "disconnected",
            ConversationStatus::Connecting => "connecting",
            ConversationStatus::Reconnecting => "reconnecting",
            ConversationStatus::ConnectedNotReady => "connected-not-ready",
            ConversationStatus::ReadyIdle => "ready-idle",
            ConversationStatus::AiSpeaking => "ai-speaking",
            ConversationStatus::UserSpeaking => "user-speaking",
        }
    }
}

/// Mascot expression shown next to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MascotMood {
    Default,
    Talking,
    Humm,
    Sad,
}

impl MascotMood {
    /// Unrecognized user speech wins over the hint prompt, which wins over AI speech.
    pub fn derive(state: &ConversationState, hint: &HintFlags, language_not_recognized: bool) -> Self {
        if language_not_recognized {
            MascotMood::Sad
        } else if hint.hint_prompt_visible {
            MascotMood::Humm
        } else if state.is_ai_speaking {
            MascotMood::Talking
        } else {
            MascotMood::Default
        }
    }
}

/// Terminal result of a scenario session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub place: String,
    pub conversation_partner: String,
    pub conversation_goal: String,
    pub session_id: String,
}

/// Why the session can no longer continue, if it can't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalError {
    /// Credential rejected; the UI should send the user to log in again.
    Auth(String),
    /// Reconnect attempts ran out.
    ConnectionLost(String),
    /// Microphone access refused.
    MicrophonePermission,
}

/// Everything the UI can observe, published after every engine step.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub state: ConversationState,
    pub status: ConversationStatus,
    pub was_connected: bool,
    pub reconnect_attempt: u32,
    pub hint: HintFlags,
    pub mood: MascotMood,
    pub ai_transcript: String,
    pub ai_translation: Option<String>,
    pub user_transcript: String,
    pub language_not_recognized: bool,
    pub scenario_result: Option<ScenarioResult>,
    pub session_report: Option<SessionReport>,
    pub terminal_error: Option<TerminalError>,
    pub is_muted: bool,
    pub is_capturing: bool,
}

impl Default for ConversationSnapshot {
    fn default() -> Self {
        let state = ConversationState::default();
        Self {
            status: ConversationStatus::derive(&state),
            state,
            was_connected: false,
            reconnect_attempt: 0,
            hint: HintFlags::default(),
            mood: MascotMood::Default,
            ai_transcript: String::new(),
            ai_translation: None,
            user_transcript: String::new(),
            language_not_recognized: false,
            scenario_result: None,
            session_report: None,
            terminal_error: None,
            is_muted: false,
            is_capturing: false,
        }
    }
}

/// Single-writer owner of [`ConversationState`].
#[derive(Debug, Default)]
pub struct ConversationStateMachine {
    state: ConversationState,
    was_connected: bool,
}

impl ConversationStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn status(&self) -> ConversationStatus {
        ConversationStatus::derive(&self.state)
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    /// Follow the socket lifecycle. Leaving `Open` clears every in-session flag.
    pub fn on_connection_phase(&mut self, phase: ConnectionPhase) {
        self.state.connection_phase = phase;
        if phase == ConnectionPhase::Open {
            self.was_connected = true;
        } else {
            self.state.is_ready = false;
            self.state.is_ai_speaking = false;
            self.state.is_user_speaking = false;
        }
    }

    pub fn mark_ready(&mut self) {
        if self.state.connection_phase == ConnectionPhase::Open {
            self.state.is_ready = true;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready
    }

    /// AI audio started playing.
    pub fn ai_audio_started(&mut self) {
        self.state.is_ai_speaking = true;
    }

    /// The playback queue drained: the AI finished speaking at `now`.
    pub fn ai_audio_finished(&mut self, now: Instant) {
        self.state.is_ai_speaking = false;
        self.state.last_ai_audio_done_at = Some(now);
    }

    /// Barge-in or plain user speech. Playback was flushed, so the AI is silent too.
    pub fn user_started_speaking(&mut self) {
        self.state.is_user_speaking = true;
        self.state.is_ai_speaking = false;
        self.state.last_ai_audio_done_at = None;
    }

    pub fn user_finished_speaking(&mut self) {
        self.state.is_user_speaking = false;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.state.last_error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.state.last_error = None;
    }

    /// Back to a fresh disconnected state. The was-connected latch survives.
    pub fn reset(&mut self) {
        let last_error = self.state.last_error.take();
        self.state = ConversationState { last_error, ..ConversationState::default() };
        self.state.connection_phase = ConnectionPhase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ready() -> ConversationStateMachine {
        let mut machine = ConversationStateMachine::new();
        machine.on_connection_phase(ConnectionPhase::Connecting);
        machine.on_connection_phase(ConnectionPhase::Open);
        machine.mark_ready();
        machine
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let machine = ConversationStateMachine::new();
        assert_eq!(machine.status(), ConversationStatus::Disconnected);
        assert!(!machine.was_connected());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut machine = ConversationStateMachine::new();
        machine.on_connection_phase(ConnectionPhase::Connecting);
        assert_eq!(machine.status(), ConversationStatus::Connecting);

        machine.on_connection_phase(ConnectionPhase::Open);
        assert_eq!(machine.status(), ConversationStatus::ConnectedNotReady);

        machine.mark_ready();
        assert_eq!(machine.status(), ConversationStatus::ReadyIdle);

        machine.ai_audio_started();
        assert_eq!(machine.status(), ConversationStatus::AiSpeaking);

        machine.user_started_speaking();
        assert_eq!(machine.status(), ConversationStatus::UserSpeaking);
        assert!(!machine.state().is_ai_speaking);

        machine.user_finished_speaking();
        assert_eq!(machine.status(), ConversationStatus::ReadyIdle);
    }

    #[test]
    fn test_ready_requires_open_socket() {
        let mut machine = ConversationStateMachine::new();
        machine.mark_ready();
        assert!(!machine.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ai_finish_records_timestamp_and_user_speech_clears_it() {
        let mut machine = open_ready();
        machine.ai_audio_started();
        let now = Instant::now();
        machine.ai_audio_finished(now);
        assert_eq!(machine.state().last_ai_audio_done_at, Some(now));
        assert!(!machine.state().is_ai_speaking);

        machine.user_started_speaking();
        assert_eq!(machine.state().last_ai_audio_done_at, None);
    }

    #[test]
    fn test_was_connected_latch_survives_drop() {
        let mut machine = open_ready();
        machine.on_connection_phase(ConnectionPhase::Reconnecting);
        assert_eq!(machine.status(), ConversationStatus::Reconnecting);
        assert!(!machine.is_ready());
        assert!(machine.was_connected());

        machine.reset();
        assert_eq!(machine.status(), ConversationStatus::Disconnected);
        assert!(machine.was_connected());
    }

    #[test]
    fn test_reset_keeps_last_error() {
        let mut machine = open_ready();
        machine.record_error("server busy");
        machine.reset();
        assert_eq!(machine.state().last_error.as_deref(), Some("server busy"));
        machine.clear_error();
        assert!(machine.state().last_error.is_none());
    }

    #[test]
    fn test_mood_derivation() {
        let mut state = ConversationState::default();
        let mut hint = HintFlags::default();
        assert_eq!(MascotMood::derive(&state, &hint, false), MascotMood::Default);
        state.is_ai_speaking = true;
        assert_eq!(MascotMood::derive(&state, &hint, false), MascotMood::Talking);
        hint.hint_prompt_visible = true;
        assert_eq!(MascotMood::derive(&state, &hint, false), MascotMood::Humm);
        hint.wait_popup_visible = true;
        assert_eq!(MascotMood::derive(&state, &hint, false), MascotMood::Humm);
        assert_eq!(MascotMood::derive(&state, &hint, true), MascotMood::Sad);

        // The wait popup alone does not change the expression
        let popup_only = HintFlags { hint_prompt_visible: false, wait_popup_visible: true };
        assert_eq!(MascotMood::derive(&ConversationState::default(), &popup_only, false), MascotMood::Default);
        assert_eq!(MascotMood::derive(&ConversationState::default(), &popup_only, true), MascotMood::Sad);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ConversationStatus::ConnectedNotReady.as_str(), "connected-not-ready");
        assert_eq!(
            serde_json::to_value(ConversationStatus::AiSpeaking).unwrap(),
            serde_json::json!("ai-speaking")
        );
    }
}
