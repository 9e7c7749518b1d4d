//! # Hint Escalation
//!
//! Idle-timeout prompts layered over the conversation state:
//!
//! 1. The AI finishes speaking and nobody talks for `D1`: show "need a hint?"
//! 2. Still nothing for a further `D2`: show "still there?", which can end the session
//!
//! ## Arming Rules:
//! - The hint timer runs only while the session is ready, neither side is
//!   speaking, and the time the AI last finished is known. Its delay is
//!   `max(0, D1 - (now - last_ai_audio_done_at))`, so re-arming after a brief
//!   flicker continues the countdown instead of restarting it.
//! - The wait timer runs only while the hint prompt is visible.
//! - The user starting to speak is the one reset path: both flags hide and both
//!   timers are cancelled. Firings already in flight are rejected by generation.
//! - Dismissing the prompts from the UI also resets, and keeps the hint timer
//!   quiet until the AI finishes another utterance.

use crate::state::ConversationState;
use crate::timer::Timer;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Visibility of the two escalation prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HintFlags {
    pub hint_prompt_visible: bool,
    pub wait_popup_visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintKind {
    Hint,
    WaitPopup,
}

/// Timer firing delivered to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintFired {
    pub kind: HintKind,
    pub generation: u64,
}

pub struct HintEscalationTimer {
    hint_delay: Duration,
    wait_delay: Duration,
    hint_timer: Timer<HintFired>,
    wait_timer: Timer<HintFired>,
    /// `last_ai_audio_done_at` the running hint timer was computed from.
    armed_for: Option<Instant>,
    /// `last_ai_audio_done_at` the user dismissed the prompts for.
    dismissed_for: Option<Instant>,
    flags: HintFlags,
}

impl HintEscalationTimer {
    pub fn new(hint_delay: Duration, wait_delay: Duration) -> (Self, mpsc::UnboundedReceiver<HintFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = Self {
            hint_delay,
            wait_delay,
            hint_timer: Timer::new(tx.clone()),
            wait_timer: Timer::new(tx),
            armed_for: None,
            dismissed_for: None,
            flags: HintFlags::default(),
        };
        (timer, rx)
    }

    pub fn flags(&self) -> HintFlags {
        self.flags
    }

    pub fn has_pending_timers(&self) -> bool {
        self.hint_timer.is_armed() || self.wait_timer.is_armed()
    }

    /// Bring the timers in line with the current conversation state.
    pub fn sync(&mut self, state: &ConversationState, now: Instant) {
        if state.is_user_speaking {
            if self.flags != HintFlags::default() || self.has_pending_timers() {
                debug!("User speaking, resetting hint escalation");
            }
            self.reset();
            return;
        }

        let hint_eligible = state.is_ready
            && !state.is_ai_speaking
            && !self.flags.hint_prompt_visible
            && state.last_ai_audio_done_at.is_some()
            && state.last_ai_audio_done_at != self.dismissed_for;

        match state.last_ai_audio_done_at {
            Some(done_at) if hint_eligible => {
                if !(self.hint_timer.is_armed() && self.armed_for == Some(done_at)) {
                    let elapsed = now.saturating_duration_since(done_at);
                    let remaining = self.hint_delay.saturating_sub(elapsed);
                    self.hint_timer.arm(remaining, |generation| HintFired { kind: HintKind::Hint, generation });
                    self.armed_for = Some(done_at);
                    debug!(remaining_ms = remaining.as_millis() as u64, "Hint timer armed");
                }
            }
            _ => {
                if self.hint_timer.is_armed() {
                    self.hint_timer.cancel();
                }
                self.armed_for = None;
            }
        }

        let wait_eligible = state.is_ready && self.flags.hint_prompt_visible && !self.flags.wait_popup_visible;
        if wait_eligible {
            if !self.wait_timer.is_armed() {
                self.wait_timer
                    .arm(self.wait_delay, |generation| HintFired { kind: HintKind::WaitPopup, generation });
                debug!(delay_ms = self.wait_delay.as_millis() as u64, "Wait popup timer armed");
            }
        } else if self.wait_timer.is_armed() {
            self.wait_timer.cancel();
        }
    }

    /// Apply a timer firing. Returns true when a flag changed.
    pub fn on_fired(&mut self, fired: HintFired) -> bool {
        match fired.kind {
            HintKind::Hint => {
                if !self.hint_timer.accept(fired.generation) {
                    return false;
                }
                self.armed_for = None;
                self.flags.hint_prompt_visible = true;
                debug!("Showing hint prompt");
            }
            HintKind::WaitPopup => {
                if !self.wait_timer.accept(fired.generation) {
                    return false;
                }
                self.flags.wait_popup_visible = true;
                debug!("Showing wait popup");
            }
        }
        true
    }

    /// The user closed the prompts. Both stay hidden until the AI speaks again.
    pub fn dismiss(&mut self, last_ai_audio_done_at: Option<Instant>) {
        debug!("Hint prompts dismissed");
        self.reset();
        self.dismissed_for = last_ai_audio_done_at;
    }

    /// Hide both prompts and cancel both timers.
    pub fn reset(&mut self) {
        self.hint_timer.cancel();
        self.wait_timer.cancel();
        self.armed_for = None;
        self.flags = HintFlags::default();
    }
}
