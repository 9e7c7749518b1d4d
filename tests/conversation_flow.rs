//! End-to-end conversations against a scripted local WebSocket server.

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use voice_practice_client::audio::codec::float_to_pcm16_base64;
use voice_practice_client::config::{AppConfig, SessionMode};
use voice_practice_client::device::{NullOutput, SilentInput};
use voice_practice_client::state::{ConversationSnapshot, ConversationStatus, MascotMood, TerminalError};
use voice_practice_client::storage::MemoryStore;
use voice_practice_client::{EngineResources, SessionBinding, VoiceClient};

type Ws = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    base_url: String,
    accepted: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<Value>,
}

/// Accept connections forever, running `script` on each one with its index.
async fn start_server<F, Fut>(script: F) -> TestServer
where
    F: Fn(usize, Ws, mpsc::UnboundedSender<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, received) = mpsc::unbounded_channel();

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(ws) = accept_async(stream).await {
                tokio::spawn(script(index, ws, tx.clone()));
            }
        }
    });

    TestServer { base_url: format!("http://{}", addr), accepted, received }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, or `None` once the client is gone.
async fn next_json(ws: &mut Ws) -> Option<Value> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Forward every client message until the socket ends.
async fn drain(ws: &mut Ws, tx: &mpsc::UnboundedSender<Value>) {
    while let Some(value) = next_json(ws).await {
        let _ = tx.send(value);
    }
}

fn test_config(base_url: &str, mode: SessionMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.base_url = base_url.to_string();
    config.session.mode = mode;
    config.session.voice = "coral".to_string();
    config.session.disconnect_timeout_ms = 300;
    config.reconnect.base_delay_ms = 200;
    config.reconnect.max_delay_ms = 400;
    config.reconnect.max_attempts = 3;
    config
}

fn spawn_client(config: &AppConfig) -> VoiceClient {
    VoiceClient::spawn(
        config,
        SessionBinding { session_id: "s1".to_string(), token: None },
        EngineResources {
            input: Box::new(SilentInput::new(config.audio.input_sample_rate)),
            output: Box::new(NullOutput::new(config.audio.output_sample_rate)),
            translator: None,
            store: Some(Box::new(MemoryStore::new())),
        },
    )
}

async fn wait_until<F>(client: &VoiceClient, predicate: F) -> ConversationSnapshot
where
    F: FnMut(&ConversationSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, client.wait_for(predicate))
        .await
        .expect("timed out waiting for conversation state")
        .unwrap()
}

async fn next_received(server: &mut TestServer) -> Value {
    tokio::time::timeout(WAIT, server.received.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_scenario_end_to_end() {
    let mut server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        for _ in 0..2 {
            if let Some(value) = next_json(&mut ws).await {
                let _ = tx.send(value);
            }
        }
        send_json(&mut ws, json!({"type": "response.audio_transcript.done", "transcript": "Hi"})).await;
        send_json(&mut ws, json!({"type": "scenario.completed", "json": {
            "place": "Airport", "conversation_partner": "Staff",
            "conversation_goal": "Check in", "session_id": "s1"
        }}))
        .await;
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Scenario));
    client.connect().await.unwrap();

    let snapshot = wait_until(&client, |s| s.scenario_result.is_some()).await;
    assert_eq!(snapshot.ai_transcript, "Hi");
    assert!(snapshot.was_connected);
    assert_eq!(snapshot.status, ConversationStatus::ReadyIdle);
    assert_eq!(
        serde_json::to_value(snapshot.scenario_result.unwrap()).unwrap(),
        json!({"place": "Airport", "conversationPartner": "Staff", "conversationGoal": "Check in", "sessionId": "s1"})
    );

    // The session was initialized with server VAD, then the AI was asked to speak first
    let first = next_received(&mut server).await;
    assert_eq!(first["type"], "session.update");
    assert_eq!(first["session"]["turn_detection"]["type"], "server_vad");
    let second = next_received(&mut server).await;
    assert_eq!(second, json!({"type": "response.create", "response": {"modalities": ["text", "audio"]}}));

    client.shutdown().await;
}

#[tokio::test]
async fn test_audio_playback_and_barge_in() {
    let server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        let second_of_speech = float_to_pcm16_base64(&vec![0.25; 24000]);
        for _ in 0..3 {
            send_json(&mut ws, json!({"type": "response.audio.delta", "delta": second_of_speech, "sample_rate": 24000}))
                .await;
        }
        // Give the client a moment to start playing before the user interrupts
        tokio::time::sleep(Duration::from_millis(300)).await;
        send_json(&mut ws, json!({"type": "speech.started"})).await;
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Chat));
    client.connect().await.unwrap();

    let speaking = wait_until(&client, |s| s.state.is_ai_speaking).await;
    assert_eq!(speaking.status, ConversationStatus::AiSpeaking);

    let interrupted = wait_until(&client, |s| s.state.is_user_speaking).await;
    assert!(!interrupted.state.is_ai_speaking);
    assert_eq!(interrupted.status, ConversationStatus::UserSpeaking);
    assert_eq!(interrupted.state.last_ai_audio_done_at, None);

    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_unexpected_close() {
    let mut server = start_server(|index, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        if index == 0 {
            // Take the two setup messages, then vanish without a close frame
            for _ in 0..2 {
                if let Some(value) = next_json(&mut ws).await {
                    let _ = tx.send(value);
                }
            }
            return;
        }
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Scenario));
    client.connect().await.unwrap();

    let reconnecting = wait_until(&client, |s| s.status == ConversationStatus::Reconnecting).await;
    assert!(reconnecting.was_connected);
    assert_eq!(reconnecting.reconnect_attempt, 1);
    assert!(reconnecting.terminal_error.is_none());

    let back = wait_until(&client, |s| s.state.is_ready).await;
    assert_eq!(back.status, ConversationStatus::ReadyIdle);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);

    // Session setup ran again on the new socket
    let mut kinds = Vec::new();
    for _ in 0..4 {
        kinds.push(next_received(&mut server).await["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(kinds.iter().filter(|k| *k == "session.update").count(), 2);
    assert_eq!(kinds.iter().filter(|k| *k == "response.create").count(), 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_policy_close_is_terminal_auth_error() {
    let server = start_server(|_, mut ws, tx| async move {
        let frame = CloseFrame { code: CloseCode::Policy, reason: "token expired".into() };
        let _ = ws.send(Message::Close(Some(frame))).await;
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Chat));
    client.connect().await.unwrap();

    let failed = wait_until(&client, |s| s.terminal_error.is_some()).await;
    assert_eq!(failed.terminal_error, Some(TerminalError::Auth("token expired".to_string())));
    assert_eq!(failed.status, ConversationStatus::Disconnected);

    // Well past the first backoff delay: nobody dialed again
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_when_server_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut config = test_config(&base_url, SessionMode::Chat);
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.max_attempts = 2;
    let client = spawn_client(&config);
    client.connect().await.unwrap();

    let lost = wait_until(&client, |s| s.terminal_error.is_some()).await;
    assert!(matches!(lost.terminal_error, Some(TerminalError::ConnectionLost(_))));
    assert!(!lost.was_connected);
    assert_eq!(lost.status, ConversationStatus::Disconnected);

    client.shutdown().await;
}

#[tokio::test]
async fn test_finish_returns_session_report() {
    let server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "session.created"})).await;
        while let Some(value) = next_json(&mut ws).await {
            if value["type"] == "disconnect" {
                send_json(&mut ws, json!({"type": "disconnected", "reason": "client request", "report": {
                    "session_id": "s1", "total_duration_sec": 42.5, "user_speech_duration_sec": 12.0,
                    "messages": [{"role": "user", "content": "Hello"}]
                }}))
                .await;
            }
            let _ = tx.send(value);
        }
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Chat));
    client.connect().await.unwrap();
    wait_until(&client, |s| s.state.is_ready).await;

    let report = client.finish().await.unwrap().expect("report");
    assert_eq!(report.session_id, "s1");
    assert_eq!(report.total_duration_sec, 42.5);
    assert_eq!(report.messages.len(), 1);

    let ended = wait_until(&client, |s| s.status == ConversationStatus::Disconnected).await;
    assert_eq!(ended.session_report.map(|r| r.user_speech_duration_sec), Some(12.0));

    client.shutdown().await;
}

#[tokio::test]
async fn test_finish_times_out_without_report() {
    let server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Chat));
    client.connect().await.unwrap();
    wait_until(&client, |s| s.state.is_ready).await;

    let started = tokio::time::Instant::now();
    assert_eq!(client.finish().await.unwrap(), None);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(client.snapshot().status, ConversationStatus::Disconnected);

    client.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_final() {
    let server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Chat));
    client.connect().await.unwrap();
    client.start_capture().await.unwrap();
    wait_until(&client, |s| s.state.is_ready && s.is_capturing).await;

    client.disconnect().await.unwrap();
    let once = client.snapshot();
    client.disconnect().await.unwrap();
    let twice = client.snapshot();

    assert_eq!(once, twice);
    assert_eq!(twice.status, ConversationStatus::Disconnected);
    assert!(!twice.is_capturing);
    assert!(twice.was_connected);
    assert!(!twice.hint.hint_prompt_visible);

    // A user-initiated close is never followed by a reconnect
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(client.snapshot().status, ConversationStatus::Disconnected);

    client.shutdown().await;
}

#[tokio::test]
async fn test_captured_audio_reaches_server_once_ready() {
    let mut server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        drain(&mut ws, &tx).await;
    })
    .await;

    let client = spawn_client(&test_config(&server.base_url, SessionMode::Chat));
    client.connect().await.unwrap();
    client.start_capture().await.unwrap();

    // Chat setup first, then audio frames
    let setup = next_received(&mut server).await;
    assert_eq!(setup, json!({"type": "session.update", "session": {"voice": "coral"}}));

    let chunk = next_received(&mut server).await;
    assert_eq!(chunk["type"], "input_audio_chunk");
    assert_eq!(chunk["sample_rate"], 24000);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(chunk["audio"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), 4096 * 2);

    client.send_text("How much is a coffee?").unwrap();
    loop {
        let value = next_received(&mut server).await;
        if value["type"] == "text" {
            assert_eq!(value["text"], "How much is a coffee?");
            break;
        }
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_chat_opening_and_dismissed_hint() {
    let mut server = start_server(|_, mut ws, tx| async move {
        send_json(&mut ws, json!({"type": "ready"})).await;
        while let Some(value) = next_json(&mut ws).await {
            let opening = value["type"] == "response.create";
            let _ = tx.send(value);
            if opening {
                let greeting = float_to_pcm16_base64(&vec![0.1; 2400]);
                send_json(&mut ws, json!({"type": "response.audio.delta", "delta": greeting, "sample_rate": 24000}))
                    .await;
                send_json(&mut ws, json!({"type": "response.audio_transcript.done", "transcript": "Hello!"})).await;
            }
        }
    })
    .await;

    let mut config = test_config(&server.base_url, SessionMode::Chat);
    config.hint.hint_delay_ms = 150;
    config.hint.wait_popup_delay_ms = 5000;
    let client = spawn_client(&config);
    client.connect().await.unwrap();
    wait_until(&client, |s| s.state.is_ready).await;

    client.request_response().unwrap();
    assert_eq!(next_received(&mut server).await["type"], "session.update");
    assert_eq!(next_received(&mut server).await["type"], "response.create");

    let hinted = wait_until(&client, |s| s.hint.hint_prompt_visible).await;
    assert_eq!(hinted.ai_transcript, "Hello!");
    assert_eq!(hinted.mood, MascotMood::Humm);

    client.dismiss_hint().unwrap();
    let dismissed = wait_until(&client, |s| !s.hint.hint_prompt_visible).await;
    assert_eq!(dismissed.mood, MascotMood::Default);

    // Stays hidden while the AI is silent
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.snapshot().hint.hint_prompt_visible);

    client.shutdown().await;
}
