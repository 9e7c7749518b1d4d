//! # Conversation Wire Protocol
//!
//! JSON text frames exchanged with the conversation server, one object per
//! frame, discriminated by a `type` field.
//!
//! ## Client → Server:
//! - `input_audio_chunk {audio, sample_rate}`: one captured PCM16 frame
//! - `input_audio_commit` / `input_audio_clear`: manual turn control
//! - `text {text}`: typed user message
//! - `session.update {session}` / `response.create {response}`: session setup
//! - `disconnect`: ask the server to end the session and send a report
//!
//! ## Server → Client:
//! Several spellings of the same event exist across server versions; they are
//! folded into one variant with serde aliases. Unknown types deserialize to
//! [`ServerMessage::Unknown`] so new server events never break old clients.
//!
//! ## Socket URLs:
//! Built by [`build_socket_url`] from the base URL, the mode, the session id and
//! an optional bearer token. Without a token the guest-scoped route is used.

use crate::config::SessionMode;
use crate::error::{ConnectionError, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Sample rate assumed for inbound audio when the server omits it.
pub const DEFAULT_SERVER_SAMPLE_RATE: u32 = 24000;

fn default_server_sample_rate() -> u32 {
    DEFAULT_SERVER_SAMPLE_RATE
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "input_audio_chunk")]
    InputAudioChunk {
        /// Base64 PCM16 mono samples
        audio: String,
        sample_rate: u32,
    },

    #[serde(rename = "input_audio_commit")]
    InputAudioCommit,

    #[serde(rename = "input_audio_clear")]
    InputAudioClear,

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseSettings },

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl ClientMessage {
    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::InputAudioChunk { .. } => "input_audio_chunk",
            ClientMessage::InputAudioCommit => "input_audio_commit",
            ClientMessage::InputAudioClear => "input_audio_clear",
            ClientMessage::Text { .. } => "text",
            ClientMessage::SessionUpdate { .. } => "session.update",
            ClientMessage::ResponseCreate { .. } => "response.create",
            ClientMessage::Disconnect => "disconnect",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Body of `session.update`. Absent fields are left unchanged by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub turn_detection: Option<TurnDetection>,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 1000,
        }
    }
}

/// Body of `response.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSettings {
    pub modalities: Vec<String>,
}

impl ResponseSettings {
    pub fn text_and_audio() -> Self {
        Self { modalities: vec!["text".to_string(), "audio".to_string()] }
    }
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The server is ready for session setup.
    #[serde(
        rename = "ready",
        alias = "session.created",
        alias = "connected",
        alias = "session.update"
    )]
    Ready,

    /// A chunk of AI speech.
    #[serde(rename = "response.audio.delta", alias = "audio.delta")]
    AudioDelta {
        #[serde(alias = "audio")]
        delta: String,
        #[serde(default = "default_server_sample_rate")]
        sample_rate: u32,
    },

    /// The server finished streaming audio for the current response.
    #[serde(rename = "response.audio.done", alias = "audio.done")]
    AudioDone,

    /// Incremental AI transcript text.
    #[serde(rename = "response.audio_transcript.delta", alias = "transcript.delta")]
    TranscriptDelta {
        #[serde(alias = "delta")]
        transcript_delta: String,
    },

    /// Final AI transcript for the turn.
    #[serde(rename = "response.audio_transcript.done", alias = "transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: String,
    },

    /// Server VAD detected the user starting to speak.
    #[serde(rename = "speech.started")]
    SpeechStarted,

    /// Server VAD detected the user stopping.
    #[serde(rename = "speech.stopped")]
    SpeechStopped,

    /// Final transcript of what the user said.
    #[serde(rename = "user.transcript", alias = "input_audio.transcript")]
    UserTranscript {
        #[serde(default)]
        transcript: String,
    },

    /// Scenario mode only: the scenario was established.
    #[serde(rename = "scenario.completed")]
    ScenarioCompleted { json: ScenarioPayload },

    /// The server ended the session, optionally with a report.
    #[serde(rename = "disconnected")]
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        report: Option<SessionReport>,
    },

    /// Application-level error. Does not close the socket by itself.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        code: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Payload of `scenario.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPayload {
    pub place: String,
    pub conversation_partner: String,
    pub conversation_goal: String,
    pub session_id: String,
}

/// End-of-session summary sent with `disconnected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub total_duration_sec: f64,
    pub user_speech_duration_sec: f64,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<ServerMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    let message = ServerMessage::deserialize(value)
        .map_err(|source| ProtocolError::Malformed { kind: kind.clone(), source })?;

    if message == ServerMessage::Unknown {
        debug!(kind = %kind, "Ignoring unknown message type");
    }
    Ok(message)
}

/// Everything needed to build the socket URL for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketTarget {
    pub base_url: String,
    pub mode: SessionMode,
    pub session_id: String,
    pub token: Option<String>,
    pub voice: String,
    pub show_text: bool,
}

impl SocketTarget {
    pub fn url(&self) -> Result<Url, ConnectionError> {
        build_socket_url(
            &self.base_url,
            self.mode,
            &self.session_id,
            self.token.as_deref(),
            &self.voice,
            self.show_text,
        )
    }

    pub fn is_guest(&self) -> bool {
        self.token.as_deref().map_or(true, str::is_empty)
    }
}

/// Build the conversation socket URL.
///
/// - scenario: `/api/v1/ws/scenario?token=…` or `/api/v1/ws/guest-scenario`
/// - chat: `/api/v1/ws/chat/{id}?token=…&voice=…&show_text=…` or
///   `/api/v1/ws/guest-chat/{id}?voice=…&show_text=…`
///
/// An http(s) base is mapped to ws(s). An empty token counts as no token.
pub fn build_socket_url(
    base_url: &str,
    mode: SessionMode,
    session_id: &str,
    token: Option<&str>,
    voice: &str,
    show_text: bool,
) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(base_url).map_err(|e| ConnectionError::InvalidUrl(format!("{}: {}", base_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectionError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;

    let token = token.filter(|t| !t.is_empty());
    let route = match (mode, token.is_some()) {
        (SessionMode::Scenario, true) => "scenario",
        (SessionMode::Scenario, false) => "guest-scenario",
        (SessionMode::Chat, true) => "chat",
        (SessionMode::Chat, false) => "guest-chat",
    };

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| ConnectionError::InvalidUrl(format!("{} cannot be a base", base_url)))?;
        segments.pop_if_empty().extend(["api", "v1", "ws", route]);
        if mode == SessionMode::Chat {
            segments.push(session_id);
        }
    }

    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        if let Some(token) = token {
            query.append_pair("token", token);
        }
        if mode == SessionMode::Chat {
            query.append_pair("voice", voice);
            query.append_pair("show_text", if show_text { "true" } else { "false" });
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url)
}
