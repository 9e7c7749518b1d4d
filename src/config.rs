//! # Configuration Management
//!
//! Loads client configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between these structs and TOML / environment values
//! - **derive macros**: `Debug`, `Clone`, `Serialize`, `Deserialize` generated for us
//! - **enums with rename_all**: `mode = "chat"` in TOML becomes `SessionMode::Chat`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_SERVER__BASE_URL`, `APP_RECONNECT__MAX_ATTEMPTS`, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore so that field names which themselves
//! contain underscores (`base_delay_ms`) survive the mapping.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Voices the conversation server accepts for `session.update`.
pub const VOICES: [&str; 8] = [
    "alloy", "ash", "ballad", "coral", "echo", "sage", "shimmer", "verse",
];

/// Main client configuration, grouped by concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub reconnect: ReconnectConfig,
    pub hint: HintConfig,
    pub translation: TranslationConfig,
}

/// Where the conversation server lives.
///
/// ## Fields:
/// - `base_url`: http(s) or ws(s) origin; http is mapped to ws when building socket URLs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
}

/// Which kind of conversation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Guided conversation ending in a scenario result.
    Scenario,
    /// Free-form conversation bound to an existing session id.
    Chat,
}

impl std::str::FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scenario" => Ok(SessionMode::Scenario),
            "chat" | "conversation" => Ok(SessionMode::Chat),
            _ => Err(format!("Unknown session mode: {}", s)),
        }
    }
}

/// Per-session settings.
///
/// ## Fields:
/// - `mode`: scenario or chat
/// - `voice`: AI voice, one of [`VOICES`]
/// - `show_text`: whether the server should send subtitle text
/// - `storage_path`: JSON file holding persisted settings and the session id
/// - `disconnect_timeout_ms`: how long a graceful end waits for the session report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub voice: String,
    pub show_text: bool,
    pub storage_path: PathBuf,
    pub disconnect_timeout_ms: u64,
}

/// How muted capture behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutePolicy {
    /// Frames keep being produced but are not delivered.
    Drop,
    /// Frames are delivered with their content zeroed.
    Silence,
}

/// Audio format settings.
///
/// ## Tuning guidelines:
/// - `buffer_size` is the number of samples per outbound frame; 4096 at 24kHz is ~170ms
/// - Smaller frames lower latency but multiply the number of socket messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub buffer_size: usize,
    pub mute_policy: MutePolicy,
}

/// Reconnect policy for unexpected socket closures.
///
/// The delay for attempt `n` (1-based) is `base_delay_ms * 2^(n-1)`, capped at
/// `max_delay_ms`. After `max_attempts` failures the manager gives up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

/// Idle escalation delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintConfig {
    /// Silence after the AI finished speaking before "need a hint?" shows.
    pub hint_delay_ms: u64,
    /// Further wait after the hint prompt before "still there?" shows.
    pub wait_popup_delay_ms: u64,
}

/// Best-effort subtitle translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub target_language: String,
    pub timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: "http://127.0.0.1:8080".to_string(),
            },
            session: SessionConfig {
                mode: SessionMode::Scenario,
                voice: "alloy".to_string(),
                show_text: true,
                storage_path: PathBuf::from(".voice-practice/storage.json"),
                disconnect_timeout_ms: 5000,
            },
            audio: AudioConfig {
                input_sample_rate: 24000,
                output_sample_rate: 24000,
                buffer_size: 4096,
                mute_policy: MutePolicy::Drop,
            },
            reconnect: ReconnectConfig {
                enabled: true,
                base_delay_ms: 1000,
                max_delay_ms: 10_000,
                max_attempts: 5,
            },
            hint: HintConfig {
                hint_delay_ms: 15_000,
                wait_popup_delay_ms: 5000,
            },
            translation: TranslationConfig {
                enabled: false,
                endpoint: None,
                target_language: "ko".to_string(),
                timeout_ms: 5000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, then config.toml, then `APP_` environment variables.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__BASE_URL=https://practice.example.com`
    /// - `APP_SESSION__MODE=chat`
    /// - `APP_RECONNECT__MAX_ATTEMPTS=3`
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Same as [`AppConfig::load`] with an explicit config file stem.
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .server
            .base_url
            .split("://")
            .next()
            .unwrap_or_default();
        if !matches!(scheme, "http" | "https" | "ws" | "wss") {
            return Err(anyhow::anyhow!(
                "Server base URL must start with http(s):// or ws(s)://, got {}",
                self.server.base_url
            ));
        }

        if !VOICES.contains(&self.session.voice.as_str()) {
            return Err(anyhow::anyhow!("Unknown voice: {}", self.session.voice));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.buffer_size == 0 {
            return Err(anyhow::anyhow!("Audio buffer size must be greater than 0"));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect base delay must be greater than 0"));
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(anyhow::anyhow!(
                "Reconnect max delay ({}ms) must not be below the base delay ({}ms)",
                self.reconnect.max_delay_ms,
                self.reconnect.base_delay_ms
            ));
        }

        if self.translation.enabled && self.translation.endpoint.is_none() {
            return Err(anyhow::anyhow!("Translation is enabled but no endpoint is set"));
        }

        Ok(())
    }

    pub fn hint_delay(&self) -> Duration {
        Duration::from_millis(self.hint.hint_delay_ms)
    }

    pub fn wait_popup_delay(&self) -> Duration {
        Duration::from_millis(self.hint.wait_popup_delay_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.disconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.buffer_size, 4096);
        assert_eq!(config.hint.hint_delay_ms, 15_000);
        assert_eq!(config.session.mode, SessionMode::Scenario);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.voice = "robot".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_translation_requires_endpoint() {
        let mut config = AppConfig::default();
        config.translation.enabled = true;
        assert!(config.validate().is_err());
        config.translation.endpoint = Some("http://127.0.0.1:9000/translate".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[session]\nmode = \"chat\"\nvoice = \"coral\"\n\n[reconnect]\nmax_attempts = 2"
        )
        .unwrap();

        let stem = dir.path().join("client");
        let config = AppConfig::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(config.session.mode, SessionMode::Chat);
        assert_eq!(config.session.voice, "coral");
        assert_eq!(config.reconnect.max_attempts, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.audio.input_sample_rate, 24000);
    }

    #[test]
    fn test_session_mode_parsing() {
        assert_eq!("chat".parse::<SessionMode>().unwrap(), SessionMode::Chat);
        assert_eq!("Scenario".parse::<SessionMode>().unwrap(), SessionMode::Scenario);
        assert!("lecture".parse::<SessionMode>().is_err());
    }
}
