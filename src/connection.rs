//! # Connection Manager
//!
//! Owns the conversation socket: builds the URL, dials it, reconnects with
//! exponential backoff after unexpected closures, and frames outbound messages.
//!
//! ## Lifecycle:
//! ```text
//! Idle → Connecting → Open → Closing → Closed
//!                      ↓                 ↑
//!                 (unexpected close)     │ (attempts exhausted / auth failure)
//!                      ↓                 │
//!                 Reconnecting ──────────┘
//! ```
//!
//! ## Socket Task:
//! Each dial spawns one task that owns the `tokio-tungstenite` stream, split
//! into a sink fed from an mpsc channel and a stream forwarded as
//! [`SocketEvent`]s. Every event carries the id of the dial that produced it;
//! the manager ignores events from any socket but the current one, so a slow
//! old socket can never disturb a newer connection.
//!
//! A user disconnect on an open socket hands the task a close request and keeps
//! its handle. The task gives the close handshake at most [`CLOSE_GRACE`]; the
//! handle is aborted by the next dial or when the manager is dropped.
//!
//! ## Failure Policy:
//! - close code 1008 or an HTTP 401/403 handshake: authentication failure, terminal
//! - anything else unexpected: retried after `base * 2^(n-1)` ms, capped, up to
//!   `max_attempts` times
//! - [`ConnectionManager::disconnect`]: cancels any pending retry, never retried

use crate::config::ReconnectConfig;
use crate::error::ConnectionError;
use crate::timer::Timer;
use crate::websocket::{ClientMessage, SocketTarget};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Close code the server uses for a bad or expired credential.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 1008;

/// Longest a socket task spends sending its close frame after a local disconnect.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Identifies one dial of the socket.
pub type ConnectionId = u64;

/// Socket lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Closed => "closed",
            ConnectionPhase::Reconnecting => "reconnecting",
        }
    }
}

/// What a socket task reports.
#[derive(Debug)]
pub enum SocketEvent {
    Opened,
    Frame(String),
    Closed { code: Option<u16>, reason: String },
    Failed(ConnectionError),
}

/// Input to [`ConnectionManager::handle`], delivered through the manager's event channel.
#[derive(Debug)]
pub enum ConnectionInput {
    Socket { id: ConnectionId, event: SocketEvent },
    RetryDue { generation: u64 },
}

/// Why the connection ended for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed(String),
    RetriesExhausted(u32),
    /// Closed unexpectedly with reconnects disabled.
    Lost(String),
}

/// What the owner needs to react to after handling an input.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotice {
    Opened { reconnected: bool },
    Frame(String),
    Reconnecting { attempt: u32, delay: Duration },
    Closed(CloseReason),
}

/// Anything that can carry outbound protocol messages.
pub trait Outbound {
    /// Best effort: returns false when the message could not be queued.
    fn send(&mut self, message: &ClientMessage) -> bool;
}

enum SocketCommand {
    Send(String),
    Close,
}

/// Delay before reconnect attempt `attempt` (1-based).
///
/// Doubles from `base_delay_ms` and never exceeds `max_delay_ms`.
pub fn backoff_delay(attempt: u32, policy: &ReconnectConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let delay = policy.base_delay_ms.saturating_mul(factor).min(policy.max_delay_ms);
    Duration::from_millis(delay)
}

/// Is this handshake failure a rejected credential?
fn classify_connect_error(err: &WsError) -> ConnectionError {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            ConnectionError::AuthFailed(format!("handshake rejected with HTTP {}", response.status()))
        }
        other => ConnectionError::Transport(other.to_string()),
    }
}

/// Owner of the single conversation socket.
pub struct ConnectionManager {
    target: SocketTarget,
    policy: ReconnectConfig,
    events: mpsc::UnboundedSender<ConnectionInput>,
    phase: ConnectionPhase,
    next_id: ConnectionId,
    active_id: Option<ConnectionId>,
    outbound: Option<mpsc::UnboundedSender<SocketCommand>>,
    socket_task: Option<JoinHandle<()>>,
    /// Task of a socket closed gracefully, still finishing its handshake.
    closing_task: Option<JoinHandle<()>>,
    retry_timer: Timer<ConnectionInput>,
    attempts: u32,
    has_connected_once: bool,
    last_error: Option<ConnectionError>,
}

impl ConnectionManager {
    /// Create a manager and the receiver its events arrive on.
    pub fn new(
        target: SocketTarget,
        policy: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionInput>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            target,
            policy,
            retry_timer: Timer::new(events.clone()),
            events,
            phase: ConnectionPhase::Idle,
            next_id: 1,
            active_id: None,
            outbound: None,
            socket_task: None,
            closing_task: None,
            attempts: 0,
            has_connected_once: false,
            last_error: None,
        };
        (manager, rx)
    }

    /// Open the socket unless one is already open or being opened.
    ///
    /// Clears any pending reconnect timer first. URL errors are returned; dial
    /// failures arrive later as events.
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        if matches!(self.phase, ConnectionPhase::Connecting | ConnectionPhase::Open) {
            debug!(phase = self.phase.as_str(), "Socket already active, ignoring connect");
            return Ok(());
        }
        self.retry_timer.cancel();
        self.attempts = 0;
        self.last_error = None;
        self.dial(ConnectionPhase::Connecting)
    }

    /// Close the socket on the user's behalf. Never followed by a retry.
    pub fn disconnect(&mut self) {
        self.retry_timer.cancel();
        self.attempts = 0;

        let graceful = self.phase == ConnectionPhase::Open;
        if self.active_id.is_some() {
            self.phase = ConnectionPhase::Closing;
            info!(connection_id = ?self.active_id, "Closing socket");
        }
        self.teardown_socket(graceful);

        if self.phase != ConnectionPhase::Idle {
            self.phase = ConnectionPhase::Closed;
        }
    }

    /// Queue a message on the open socket. A silent no-op otherwise.
    pub fn send(&mut self, message: &ClientMessage) -> bool {
        if self.phase != ConnectionPhase::Open {
            debug!(kind = message.kind(), phase = self.phase.as_str(), "Socket not open, dropping message");
            return false;
        }
        let Some(outbound) = &self.outbound else {
            return false;
        };

        match message.to_json() {
            Ok(text) => outbound.send(SocketCommand::Send(text)).is_ok(),
            Err(e) => {
                error!(kind = message.kind(), "Failed to serialize outbound message: {}", e);
                false
            }
        }
    }

    /// Apply one event from the manager's channel.
    pub fn handle(&mut self, input: ConnectionInput) -> Option<ConnectionNotice> {
        match input {
            ConnectionInput::RetryDue { generation } => {
                if !self.retry_timer.accept(generation) {
                    debug!(generation, "Ignoring stale reconnect timer");
                    return None;
                }
                info!(attempt = self.attempts, "Reconnecting");
                if let Err(e) = self.dial(ConnectionPhase::Reconnecting) {
                    return Some(ConnectionNotice::Closed(CloseReason::Lost(e.to_string())));
                }
                None
            }
            ConnectionInput::Socket { id, event } => {
                if self.active_id != Some(id) {
                    debug!(connection_id = id, "Ignoring event from stale socket");
                    return None;
                }
                self.handle_socket_event(event)
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) -> Option<ConnectionNotice> {
        match event {
            SocketEvent::Opened => {
                let reconnected = self.has_connected_once;
                self.phase = ConnectionPhase::Open;
                self.attempts = 0;
                self.has_connected_once = true;
                self.last_error = None;
                info!(connection_id = ?self.active_id, reconnected, "Socket open");
                Some(ConnectionNotice::Opened { reconnected })
            }
            SocketEvent::Frame(text) => {
                if self.phase == ConnectionPhase::Open {
                    Some(ConnectionNotice::Frame(text))
                } else {
                    None
                }
            }
            SocketEvent::Closed { code, reason } => {
                self.teardown_socket(false);
                if code == Some(AUTH_FAILURE_CLOSE_CODE) {
                    warn!(reason = %reason, "Server closed socket with policy violation");
                    return Some(self.fail_terminally(ConnectionError::AuthFailed(reason)));
                }
                warn!(code = ?code, reason = %reason, "Socket closed unexpectedly");
                Some(self.schedule_retry(ConnectionError::Transport(reason)))
            }
            SocketEvent::Failed(err) => {
                self.teardown_socket(false);
                if err.is_auth() {
                    warn!("Socket authentication failed: {}", err);
                    return Some(self.fail_terminally(err));
                }
                warn!("Socket failed: {}", err);
                Some(self.schedule_retry(err))
            }
        }
    }

    fn fail_terminally(&mut self, err: ConnectionError) -> ConnectionNotice {
        self.retry_timer.cancel();
        self.phase = ConnectionPhase::Closed;
        let reason = match &err {
            ConnectionError::AuthFailed(msg) => CloseReason::AuthFailed(msg.clone()),
            other => CloseReason::Lost(other.to_string()),
        };
        self.last_error = Some(err);
        ConnectionNotice::Closed(reason)
    }

    fn schedule_retry(&mut self, cause: ConnectionError) -> ConnectionNotice {
        if !self.policy.enabled {
            self.phase = ConnectionPhase::Closed;
            let reason = CloseReason::Lost(cause.to_string());
            self.last_error = Some(cause);
            return ConnectionNotice::Closed(reason);
        }

        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            let tried = self.attempts - 1;
            error!(attempts = tried, "Giving up on reconnecting");
            self.attempts = 0;
            self.phase = ConnectionPhase::Closed;
            self.last_error = Some(ConnectionError::RetriesExhausted(tried));
            return ConnectionNotice::Closed(CloseReason::RetriesExhausted(tried));
        }

        let delay = backoff_delay(self.attempts, &self.policy);
        self.retry_timer
            .arm(delay, |generation| ConnectionInput::RetryDue { generation });
        self.phase = ConnectionPhase::Reconnecting;
        self.last_error = Some(cause);
        info!(
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        ConnectionNotice::Reconnecting { attempt: self.attempts, delay }
    }

    /// Spawn a socket task for a new dial.
    fn dial(&mut self, phase: ConnectionPhase) -> Result<(), ConnectionError> {
        let url = match self.target.url() {
            Ok(url) => url,
            Err(e) => {
                self.phase = ConnectionPhase::Closed;
                self.last_error = Some(e.clone());
                return Err(e);
            }
        };

        self.teardown_socket(false);
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        debug!(connection_id = id, guest = self.target.is_guest(), "Dialing socket");
        self.socket_task = Some(tokio::spawn(run_socket(id, url.to_string(), rx, events)));
        self.outbound = Some(tx);
        self.active_id = Some(id);
        self.phase = phase;
        Ok(())
    }

    /// Forget the current socket. With `graceful`, the socket task is asked to
    /// send a close frame and kept as the closing task; otherwise it is aborted.
    fn teardown_socket(&mut self, graceful: bool) {
        self.active_id = None;
        if let Some(previous) = self.closing_task.take() {
            previous.abort();
        }

        let outbound = self.outbound.take();
        let task = self.socket_task.take();
        match (graceful, outbound, task) {
            (true, Some(outbound), Some(task)) if outbound.send(SocketCommand::Close).is_ok() => {
                self.closing_task = Some(task);
            }
            (_, _, task) => {
                if let Some(task) = task {
                    task.abort();
                }
            }
        }
    }

    /// True while any socket task, current or closing, is still running.
    pub fn has_live_socket_task(&self) -> bool {
        self.socket_task.iter().chain(self.closing_task.iter()).any(|task| !task.is_finished())
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == ConnectionPhase::Open
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_timer.is_armed()
    }

    pub fn has_connected_once(&self) -> bool {
        self.has_connected_once
    }

    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    pub fn target(&self) -> &SocketTarget {
        &self.target
    }

    /// Update the credential used by the next dial.
    pub fn set_token(&mut self, token: Option<String>) {
        self.target.token = token;
    }

    pub fn set_voice(&mut self, voice: String) {
        self.target.voice = voice;
    }
}

impl Outbound for ConnectionManager {
    fn send(&mut self, message: &ClientMessage) -> bool {
        ConnectionManager::send(self, message)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.retry_timer.cancel();
        for task in self.socket_task.take().into_iter().chain(self.closing_task.take()) {
            task.abort();
        }
    }
}

/// Body of a socket task: dial, then pump frames both ways until closed.
async fn run_socket(
    id: ConnectionId,
    url: String,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<ConnectionInput>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(ConnectionInput::Socket { id, event });
    };

    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            emit(SocketEvent::Failed(classify_connect_error(&e)));
            return;
        }
    };
    emit(SocketEvent::Opened);

    let (mut sink, mut inbound) = stream.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        emit(SocketEvent::Closed { code: None, reason: e.to_string() });
                        return;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    let frame = CloseFrame { code: CloseCode::Normal, reason: "client disconnect".into() };
                    let close = async {
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        let _ = sink.close().await;
                    };
                    if tokio::time::timeout(CLOSE_GRACE, close).await.is_err() {
                        warn!(connection_id = id, "Close handshake timed out");
                    }
                    debug!(connection_id = id, "Socket task finished after local close");
                    return;
                }
            },
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => emit(SocketEvent::Frame(text)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, "closed without status".to_string()),
                    };
                    emit(SocketEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(connection_id = id, len = bytes.len(), "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(SocketEvent::Closed { code: None, reason: e.to_string() });
                    return;
                }
                None => {
                    emit(SocketEvent::Closed { code: None, reason: "stream ended".to_string() });
                    return;
                }
            },
        }
    }
}
