//! # Error Handling
//!
//! Error types for every resource the conversation engine touches. The
//! taxonomy mirrors how failures are treated at runtime:
//!
//! - **Permission errors** (microphone denied): surfaced to the caller, never retried.
//! - **Transient connectivity errors**: retried by the connection manager and
//!   only surfaced once the retry budget is exhausted.
//! - **Authentication errors** (close code 1008, HTTP 401/403): terminal.
//! - **Protocol errors** (bad frame, undecodable audio chunk): logged and the
//!   single offending unit is dropped.
//! - **Application errors** reported by the server: recorded in state.
//!
//! ## Key Rust Concepts Used:
//! - **thiserror**: derives `Display` and `std::error::Error` from attributes
//! - **#[from]**: generates `From` impls so `?` converts between error types
//! - **type alias**: `ClientResult<T>` is shorthand for `Result<T, ClientError>`

use thiserror::Error;

/// Failures while converting between float samples and wire PCM16 chunks.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The chunk was not valid base64.
    #[error("invalid base64 audio chunk: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A sample rate of zero cannot be resampled or scheduled.
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

/// Failures reported by an input or output audio device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The user (or the OS) refused access to the device.
    #[error("permission to use the audio device was denied")]
    PermissionDenied,

    /// The device does not exist or is already in use.
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    /// The output context was closed and can no longer schedule audio.
    #[error("audio output context is closed")]
    Closed,

    /// Reading or writing the backing file failed.
    #[error("audio device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file had an unsupported sample format.
    #[error("unsupported audio format: {0}")]
    Format(String),
}

impl DeviceError {
    /// Map an I/O failure while opening a device, keeping permission problems distinct.
    pub fn from_open_error(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied,
            std::io::ErrorKind::NotFound => DeviceError::Unavailable(format!("{} not found", what)),
            _ => DeviceError::Io(err),
        }
    }
}

/// Failures starting microphone capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Microphone access was denied. Not retried automatically.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Any other device failure.
    #[error("failed to start audio capture: {0}")]
    Device(DeviceError),
}

impl From<DeviceError> for CaptureError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied => CaptureError::PermissionDenied,
            other => CaptureError::Device(other),
        }
    }
}

/// Failures on the conversation socket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The server rejected the credential. Terminal, never retried.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Network or protocol failure opening or using the socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// The configured base URL could not be turned into a socket URL.
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),

    /// Every reconnect attempt failed.
    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
}

impl ConnectionError {
    /// Authentication failures must never be retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectionError::AuthFailed(_))
    }
}

/// Failures resolving or persisting the session identity.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Neither the URL nor storage carried a session id.
    #[error("no session identifier available; create a new session first")]
    NoSessionIdentifier,

    /// The persisted key-value store could not be read or written.
    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Failures of the persisted key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single inbound frame that could not be understood. Always absorbed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("malformed `{kind}` frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of the best-effort translation service.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("translation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("translation service returned no text")]
    Empty,
}

/// Crate-wide error for operations exposed to the UI layer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The engine task has already shut down.
    #[error("conversation engine is not running")]
    EngineStopped,
}

/// Type alias for Results that use the crate-wide error type.
pub type ClientResult<T> = Result<T, ClientError>;
