//! # Voice Practice Client - Command Line Entry Point
//!
//! Runs one practice conversation from the terminal. A WAV file stands in for
//! the microphone and the AI's speech can be recorded to another WAV file.
//!
//! ## Key Rust Concepts Used:
//! - **clap derive**: the `Cli` struct below *is* the argument parser
//! - **async/await**: the whole program runs on the tokio runtime
//! - **Result<T, E> and `?`**: any setup failure ends the program with a message
//! - **static AtomicBool**: a global shutdown flag set from the signal handler task
//!
//! ## What happens:
//! 1. Configuration is loaded (defaults → config.toml → `APP_` environment)
//! 2. The session id is resolved from `--session-id` or persisted storage
//! 3. The client connects, streams the input, logs transcripts as they arrive
//! 4. On Ctrl-C, SIGTERM or after `--duration-secs`, the session is ended
//!    gracefully and the report is printed as JSON

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_practice_client::config::{AppConfig, SessionMode, VOICES};
use voice_practice_client::device::{InputDevice, NullOutput, OutputContext, SilentInput, WavFileInput, WavRecorderOutput};
use voice_practice_client::error::SessionError;
use voice_practice_client::session::{QueryUrl, SessionIdentityResolver, UrlState, SESSION_ID_PARAM};
use voice_practice_client::state::{ConversationSnapshot, TerminalError};
use voice_practice_client::storage::{
    JsonFileStore, KeyValueStore, ACCESS_TOKEN_KEY, SELECTED_VOICE_KEY, SUBTITLE_ENABLED_KEY,
};
use voice_practice_client::translation::HttpTranslator;
use voice_practice_client::{EngineResources, SessionBinding, VoiceClient};

/// Global shutdown flag, set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Address the conversation view is "opened" with; only its query matters.
const VIEW_URL: &str = "voice-practice://conversation";

/// Pause between the microphone going live and asking the AI to open a chat.
const CHAT_OPENING_DELAY: Duration = Duration::from_millis(500);

/// Realtime spoken conversation practice client.
#[derive(Debug, Parser)]
#[command(name = "voice-practice-client", version, about)]
struct Cli {
    /// Chat session to join; falls back to the persisted one
    #[arg(long)]
    session_id: Option<String>,

    /// Conversation mode: scenario or chat
    #[arg(long)]
    mode: Option<SessionMode>,

    /// AI voice
    #[arg(long)]
    voice: Option<String>,

    /// Access token; falls back to the persisted one, guest when absent
    #[arg(long)]
    token: Option<String>,

    /// WAV file used as the microphone (silence when omitted)
    #[arg(long)]
    input: Option<PathBuf>,

    /// WAV file the AI's speech is recorded to
    #[arg(long)]
    output: Option<PathBuf>,

    /// Typed message sent once the session is ready
    #[arg(long)]
    text: Option<String>,

    /// End the session after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Configuration file stem
    #[arg(long, default_value = "config")]
    config: String,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)?;

    let storage_path = config.session.storage_path.clone();
    let mut store = JsonFileStore::open(&storage_path)
        .with_context(|| format!("opening settings store {}", storage_path.display()))?;

    apply_persisted_settings(&mut config, &store);
    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting voice-practice-client v{}", env!("CARGO_PKG_VERSION"));
    info!(mode = ?config.session.mode, voice = %config.session.voice, server = %config.server.base_url, "Configuration loaded");

    let session_id = match resolve_session_id(&config, &cli, &mut store) {
        Ok(id) => id,
        Err(SessionError::NoSessionIdentifier) => {
            error!("No chat session to join. Start a new session and pass --session-id.");
            return Err(SessionError::NoSessionIdentifier.into());
        }
        Err(e) => return Err(e.into()),
    };
    let token = cli.token.clone().or_else(|| store.get(ACCESS_TOKEN_KEY)).filter(|t| !t.is_empty());
    if token.is_none() {
        info!("No access token, joining as guest");
    }

    let input: Box<dyn InputDevice> = match &cli.input {
        Some(path) => Box::new(WavFileInput::new(path)),
        None => Box::new(SilentInput::new(config.audio.input_sample_rate)),
    };
    let output: Box<dyn OutputContext> = match &cli.output {
        Some(path) => Box::new(WavRecorderOutput::new(path, config.audio.output_sample_rate)),
        None => Box::new(NullOutput::new(config.audio.output_sample_rate)),
    };
    let translator = HttpTranslator::from_config(&config.translation)?;

    let client = VoiceClient::spawn(
        &config,
        SessionBinding { session_id, token },
        EngineResources { input, output, translator, store: Some(Box::new(store)) },
    );
    let logger = tokio::spawn(log_conversation(WatchStream::new(client.subscribe())));

    client.connect().await?;
    if let Err(e) = client.start_capture().await {
        client.shutdown().await;
        return Err(e).context("microphone unavailable");
    }

    if config.session.mode == SessionMode::Chat || cli.text.is_some() {
        let ready = client.wait_for(|s| s.state.is_ready || s.terminal_error.is_some()).await?;
        if ready.state.is_ready {
            if config.session.mode == SessionMode::Chat {
                // The AI opens a chat once the microphone is live
                tokio::time::sleep(CHAT_OPENING_DELAY).await;
                client.request_response()?;
            }
            if let Some(text) = cli.text.clone() {
                client.send_text(text)?;
            }
        }
    }

    setup_signal_handlers();
    let deadline = cli.duration_secs.map(Duration::from_secs);

    let outcome = tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, ending session...");
            None
        }
        _ = sleep_or_forever(deadline) => {
            info!("Time is up, ending session...");
            None
        }
        ended = client.wait_for(|s| s.terminal_error.is_some() || s.session_report.is_some()) => {
            ended.ok()
        }
    };

    let report = match &outcome {
        Some(snapshot) if snapshot.session_report.is_some() => snapshot.session_report.clone(),
        _ => client.finish().await?,
    };
    let last = client.snapshot();
    client.shutdown().await;
    logger.abort();

    let summary = json!({
        "finished_at": chrono::Utc::now().to_rfc3339(),
        "status": last.status.as_str(),
        "was_connected": last.was_connected,
        "scenario_result": last.scenario_result,
        "session_report": report,
        "last_ai_transcript": last.ai_transcript,
        "last_user_transcript": last.user_transcript,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match last.terminal_error {
        Some(TerminalError::Auth(reason)) => Err(anyhow::anyhow!("authentication failed, log in again: {}", reason)),
        Some(TerminalError::ConnectionLost(reason)) => Err(anyhow::anyhow!("connection lost: {}", reason)),
        Some(TerminalError::MicrophonePermission) => Err(anyhow::anyhow!("microphone permission denied")),
        None => Ok(()),
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: e.g. "debug" or "voice_practice_client=trace"
/// - If not set, defaults to "voice_practice_client=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_practice_client=debug,voice_practice_client_cli=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Persisted voice and subtitle choices replace the configured defaults.
fn apply_persisted_settings(config: &mut AppConfig, store: &JsonFileStore) {
    if let Some(voice) = store.get(SELECTED_VOICE_KEY) {
        if VOICES.contains(&voice.as_str()) {
            config.session.voice = voice;
        } else {
            warn!(voice = %voice, "Ignoring unknown persisted voice");
        }
    }
    if let Some(enabled) = store.get(SUBTITLE_ENABLED_KEY) {
        match enabled.parse::<bool>() {
            Ok(enabled) => config.session.show_text = enabled,
            Err(_) => warn!(value = %enabled, "Ignoring malformed subtitle setting"),
        }
    }
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(mode) = cli.mode {
        config.session.mode = mode;
    }
    if let Some(voice) = &cli.voice {
        config.session.voice = voice.clone();
    }
}

/// Chat sessions need an id; scenario sessions are created by the server.
fn resolve_session_id(
    config: &AppConfig,
    cli: &Cli,
    store: &mut JsonFileStore,
) -> Result<String, SessionError> {
    if config.session.mode == SessionMode::Scenario {
        return Ok(cli.session_id.clone().unwrap_or_default());
    }

    let mut view = QueryUrl::parse(VIEW_URL).map_err(|_| SessionError::NoSessionIdentifier)?;
    if let Some(id) = &cli.session_id {
        view.replace_query_param(SESSION_ID_PARAM, id);
    }
    let mut resolver = SessionIdentityResolver::default();
    let id = resolver.resolve(&mut view, store)?;
    info!(session_id = %id, view = %view.as_url(), "Session resolved");
    Ok(id)
}

/// Log status changes and finished utterances as the conversation goes.
async fn log_conversation(mut snapshots: WatchStream<ConversationSnapshot>) {
    let mut previous = ConversationSnapshot::default();
    while let Some(snapshot) = snapshots.next().await {
        if snapshot.ai_transcript != previous.ai_transcript && !snapshot.ai_transcript.is_empty() {
            info!(target: "voice_practice_client_cli", "AI: {}", snapshot.ai_transcript);
        }
        if snapshot.ai_translation != previous.ai_translation {
            if let Some(translation) = &snapshot.ai_translation {
                info!(target: "voice_practice_client_cli", "AI (translated): {}", translation);
            }
        }
        if snapshot.user_transcript != previous.user_transcript && !snapshot.user_transcript.is_empty() {
            info!(target: "voice_practice_client_cli", "You: {}", snapshot.user_transcript);
        }
        if snapshot.hint != previous.hint {
            info!(target: "voice_practice_client_cli", hint = snapshot.hint.hint_prompt_visible, still_there = snapshot.hint.wait_popup_visible, "Prompts changed");
        }
        if snapshot.language_not_recognized && !previous.language_not_recognized {
            warn!(target: "voice_practice_client_cli", "Speech not recognized, try speaking in the practice language");
        }
        if snapshot.scenario_result.is_some() && previous.scenario_result.is_none() {
            info!(target: "voice_practice_client_cli", result = ?snapshot.scenario_result, "Scenario established");
        }
        previous = snapshot;
    }
}

async fn sleep_or_forever(deadline: Option<Duration>) {
    match deadline {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending::<()>().await,
    }
}

/// Listen for SIGTERM and SIGINT and raise the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Received Ctrl-C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
