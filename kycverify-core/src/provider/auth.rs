//! Provider token lifecycle.
//!
//! ```text
//! NoToken --get_token--> Authenticating --ok--> Valid
//!    ^                                            |
//!    +------------- TTL expiry | 401 -------------+
//! ```
//!
//! [`TokenManager`] is the only owner of the cached token. The cache sits
//! behind an async mutex that stays locked for the whole authentication call,
//! so concurrent callers wait for one in-flight request instead of issuing
//! their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::KycResult;

/// A bearer token issued by the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    token: String,
    obtained_at: DateTime<Utc>,
    ttl_seconds: u64,
}

impl AuthToken {
    /// Wraps a freshly issued token.
    #[must_use]
    pub fn new(token: impl Into<String>, obtained_at: DateTime<Utc>, ttl_seconds: u64) -> Self {
        Self {
            token: token.into(),
            obtained_at,
            ttl_seconds,
        }
    }

    /// The opaque token value, for the `authorization` header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// When the token was issued.
    #[must_use]
    pub const fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }

    /// Lifetime in seconds.
    #[must_use]
    pub const fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Whether the token may still be used at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        let age = now.signed_duration_since(self.obtained_at).num_seconds();
        age >= 0 && age < ttl
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"[REDACTED]")
            .field("obtained_at", &self.obtained_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

/// Obtains a new token from the provider.
#[async_trait]
pub trait Authenticate: Send + Sync {
    /// Performs one authentication exchange.
    ///
    /// # Errors
    ///
    /// Returns [`crate::KycError::Auth`] if no usable token was issued.
    async fn authenticate(&self) -> KycResult<AuthToken>;
}

/// Caches a provider token for the lifetime of one batch run.
pub struct TokenManager {
    authenticator: Arc<dyn Authenticate>,
    // Safety margin so a token is not sent moments before it expires.
    expiry_skew: Duration,
    cached: Mutex<Option<AuthToken>>,
}

impl TokenManager {
    /// Creates a manager with no cached token.
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticate>) -> Self {
        Self {
            authenticator,
            expiry_skew: Duration::from_secs(30),
            cached: Mutex::new(None),
        }
    }

    /// Overrides the expiry safety margin.
    #[must_use]
    pub const fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    /// Returns a valid token, authenticating first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::KycError::Auth`] if authentication fails. A stale or
    /// empty token is never returned.
    pub async fn get_token(&self) -> KycResult<AuthToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_at(Utc::now() + self.skew_for(token)) {
                return Ok(token.clone());
            }
            debug!("cached provider token expired");
        }
        *cached = None;

        let token = self.authenticator.authenticate().await?;
        info!(ttl_seconds = token.ttl_seconds(), "obtained provider token");
        *cached = Some(token.clone());
        Ok(token)
    }

    // Never more than a quarter of the token's lifetime, so short-lived
    // tokens are still reused.
    fn skew_for(&self, token: &AuthToken) -> chrono::Duration {
        let skew = self
            .expiry_skew
            .min(Duration::from_secs(token.ttl_seconds()) / 4);
        chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Drops `token` from the cache after the provider rejected it.
    ///
    /// A newer token cached by another caller in the meantime is kept.
    pub async fn invalidate(&self, token: &AuthToken) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|current| current == token) {
            debug!("invalidating rejected provider token");
            *cached = None;
        }
    }

    /// Whether a token is cached and unexpired.
    pub async fn has_valid_token(&self) -> bool {
        self.cached
            .lock()
            .await
            .as_ref()
            .is_some_and(|token| token.is_valid_at(Utc::now()))
    }
}
