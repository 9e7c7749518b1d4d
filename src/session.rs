//! # Session Identity
//!
//! Works out which session a conversation belongs to, once, when the
//! conversation view is mounted.
//!
//! ## Precedence:
//! 1. A `sessionId` query parameter on the current URL wins and is persisted,
//!    overwriting whatever storage held
//! 2. Otherwise the persisted id is used and written back into the URL
//!    (a history replace, no reload)
//! 3. Otherwise resolution fails with [`SessionError::NoSessionIdentifier`],
//!    which callers render as a recoverable "start a new session" prompt
//!
//! The outcome is cached: calling [`SessionIdentityResolver::resolve`] again
//! returns the first answer without looking at the URL or storage.

use crate::error::SessionError;
use crate::storage::{KeyValueStore, SESSION_ID_KEY};
use tracing::{debug, error, warn};
use url::Url;

/// Query parameter carrying the session id.
pub const SESSION_ID_PARAM: &str = "sessionId";

/// The address the conversation view was opened with.
pub trait UrlState {
    fn query_param(&self, name: &str) -> Option<String>;

    /// Set one query parameter in place, keeping the others.
    fn replace_query_param(&mut self, name: &str, value: &str);
}

/// [`UrlState`] over a parsed URL.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryUrl {
    url: Url,
}

impl QueryUrl {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn parse(input: &str) -> Result<Self, url::ParseError> {
        Ok(Self { url: Url::parse(input)? })
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }
}

impl UrlState for QueryUrl {
    fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn replace_query_param(&mut self, name: &str, value: &str) {
        let others: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(key, _)| key != name)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut query = self.url.query_pairs_mut();
        query.clear();
        for (key, v) in &others {
            query.append_pair(key, v);
        }
        query.append_pair(name, value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Found(String),
    Missing,
}

/// One-shot resolver of the session id.
#[derive(Debug)]
pub struct SessionIdentityResolver {
    storage_key: String,
    url_param: String,
    resolved: Option<Resolution>,
}

impl Default for SessionIdentityResolver {
    fn default() -> Self {
        Self::new(SESSION_ID_KEY, SESSION_ID_PARAM)
    }
}

impl SessionIdentityResolver {
    pub fn new(storage_key: impl Into<String>, url_param: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            url_param: url_param.into(),
            resolved: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Resolve the session id, or return the cached outcome of an earlier call.
    pub fn resolve(
        &mut self,
        url: &mut dyn UrlState,
        store: &mut dyn KeyValueStore,
    ) -> Result<String, SessionError> {
        let resolution = match &self.resolved {
            Some(resolution) => resolution.clone(),
            None => {
                let resolution = self.resolve_once(url, store);
                self.resolved = Some(resolution.clone());
                resolution
            }
        };

        match resolution {
            Resolution::Found(id) => Ok(id),
            Resolution::Missing => Err(SessionError::NoSessionIdentifier),
        }
    }

    fn resolve_once(&self, url: &mut dyn UrlState, store: &mut dyn KeyValueStore) -> Resolution {
        if let Some(id) = url.query_param(&self.url_param).filter(|id| !id.is_empty()) {
            debug!(session_id = %id, "Using session id from URL");
            if let Err(e) = store.set(&self.storage_key, &id) {
                warn!("Failed to persist session id: {}", e);
            }
            return Resolution::Found(id);
        }

        if let Some(id) = store.get(&self.storage_key).filter(|id| !id.is_empty()) {
            debug!(session_id = %id, "Using stored session id");
            url.replace_query_param(&self.url_param, &id);
            return Resolution::Found(id);
        }

        error!("No session id in URL or storage");
        Resolution::Missing
    }
}
