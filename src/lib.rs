//! # Voice Practice Client
//!
//! Client engine for realtime spoken conversation practice with an AI partner.
//! Microphone audio streams to the conversation server over a WebSocket; the
//! server answers with speech, transcripts and voice-activity events, which are
//! played back and folded into one observable conversation state.
//!
//! ## Modules:
//! - **audio**: PCM16 codec, microphone capture, gapless playback queue
//! - **device**: input/output device traits plus WAV-file and null implementations
//! - **connection**: the socket, reconnects and backoff
//! - **websocket**: wire messages and socket URLs
//! - **dispatcher**: applies inbound messages to the conversation
//! - **state**: conversation flags, derived status, snapshot
//! - **hint**: idle "need a hint?" / "still there?" escalation
//! - **session**: which session id to use, from URL or storage
//! - **storage**: persisted settings
//! - **translation**: best-effort subtitle translation
//! - **engine**: the task that owns all of the above, and its handle
//! - **config**: layered configuration
//! - **error**: error types

pub mod audio;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hint;
pub mod session;
pub mod state;
pub mod storage;
pub mod timer;
pub mod translation;
pub mod websocket;

pub use config::AppConfig;
pub use engine::{EngineResources, SessionBinding, VoiceClient};
pub use error::{ClientError, ClientResult};
pub use state::{ConversationSnapshot, ConversationStatus};
