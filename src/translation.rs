//! # Subtitle Translation
//!
//! Best-effort translation of finished AI utterances for the subtitle line.
//! Failures are logged and leave the translated text empty; nothing waits on a
//! translation.

use crate::config::TranslationConfig;
use crate::error::TranslationError;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A translation service.
pub trait Translator: Send + Sync {
    fn translate(&self, text: String) -> BoxFuture<'static, Result<String, TranslationError>>;
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(alias = "translation", alias = "text")]
    translated: String,
}

/// Translator backed by an HTTP endpoint taking `{text, target}` and answering `{translated}`.
#[derive(Clone)]
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
    target_language: String,
}

impl HttpTranslator {
    pub fn new(endpoint: impl Into<String>, target_language: impl Into<String>, timeout: Duration) -> Result<Self, TranslationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            target_language: target_language.into(),
        })
    }

    /// Build the configured translator, or `None` when translation is off.
    pub fn from_config(config: &TranslationConfig) -> Result<Option<Arc<dyn Translator>>, TranslationError> {
        match (&config.endpoint, config.enabled) {
            (Some(endpoint), true) => {
                info!(endpoint = %endpoint, target = %config.target_language, "Subtitle translation enabled");
                let translator = Self::new(
                    endpoint.clone(),
                    config.target_language.clone(),
                    Duration::from_millis(config.timeout_ms),
                )?;
                Ok(Some(Arc::new(translator)))
            }
            _ => Ok(None),
        }
    }
}

impl Translator for HttpTranslator {
    fn translate(&self, text: String) -> BoxFuture<'static, Result<String, TranslationError>> {
        let this = self.clone();
        Box::pin(async move {
            let request = TranslateRequest { text: &text, target: &this.target_language };
            let response: TranslateResponse = this
                .client
                .post(&this.endpoint)
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let translated = response.translated.trim().to_string();
            if translated.is_empty() {
                return Err(TranslationError::Empty);
            }
            Ok(translated)
        })
    }
}
