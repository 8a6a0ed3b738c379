//! Startup configuration.
//!
//! Everything the pipeline needs is read once into a [`KycConfig`] and passed
//! by reference into each component. Nothing reads the environment after
//! startup.

use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{KycError, KycResult};
use crate::spreadsheet::DEFAULT_MAX_UPLOAD_BYTES;

/// Default provider endpoint.
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.sandbox.co.in";

/// Upper bound on concurrent verification calls, to respect provider rate limits.
pub const MAX_CONCURRENCY: usize = 5;

/// What the retry policy does once a record's retry budget is spent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FallbackMode {
    /// Record an `error` outcome. Never invents data.
    #[default]
    Strict,
    /// Synthesize a clearly tagged placeholder outcome.
    Simulate,
}

/// Pipeline configuration.
#[derive(Debug)]
pub struct KycConfig {
    /// Provider base URL, without trailing slash.
    pub provider_base_url: String,
    /// Provider API key.
    pub api_key: SecretString,
    /// Provider API secret.
    pub api_secret: SecretString,
    /// Optional `x-api-version` header value.
    pub api_version: Option<String>,
    /// Passphrase the field cipher keys are derived from.
    pub field_cipher_key: SecretString,
    /// Extra verification attempts after the first one.
    pub max_retries: u32,
    /// First backoff delay.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Behaviour after retries are exhausted.
    pub fallback_mode: FallbackMode,
    /// Concurrent verification calls per batch (1..=5).
    pub concurrency: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Token lifetime assumed when the provider does not declare one.
    pub default_token_ttl: Duration,
    /// Upload size cap in bytes.
    pub max_upload_bytes: usize,
    /// Reason sent for rows that carry none.
    pub default_reason: String,
}

impl KycConfig {
    /// Builds the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Configuration`] if a required variable is missing or
    /// any value is malformed.
    pub fn from_env() -> KycResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`KycConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> KycResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| KycError::Configuration(format!("{key} is not set")))
        };

        let config = Self {
            provider_base_url: get("KYC_PROVIDER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: SecretString::from(required("KYC_API_KEY")?),
            api_secret: SecretString::from(required("KYC_API_SECRET")?),
            api_version: get("KYC_API_VERSION"),
            field_cipher_key: SecretString::from(required("KYC_FIELD_CIPHER_KEY")?),
            max_retries: parse_or(&get, "KYC_MAX_RETRIES", 2)?,
            retry_base_delay: Duration::from_millis(parse_or(&get, "KYC_RETRY_BASE_DELAY_MS", 200)?),
            retry_max_delay: Duration::from_millis(parse_or(&get, "KYC_RETRY_MAX_DELAY_MS", 2_000)?),
            fallback_mode: parse_or(&get, "KYC_FALLBACK_MODE", FallbackMode::Strict)?,
            concurrency: parse_or(&get, "KYC_CONCURRENCY", 3_usize)?.clamp(1, MAX_CONCURRENCY),
            request_timeout: Duration::from_secs(parse_or(&get, "KYC_REQUEST_TIMEOUT_SECS", 30)?),
            default_token_ttl: Duration::from_secs(parse_or(&get, "KYC_TOKEN_TTL_SECS", 3_600)?),
            max_upload_bytes: parse_or(&get, "KYC_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            default_reason: get("KYC_DEFAULT_REASON")
                .unwrap_or_else(|| "KYC verification".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Configuration`] describing the first violation.
    pub fn validate(&self) -> KycResult<()> {
        for (name, secret) in [
            ("KYC_API_KEY", &self.api_key),
            ("KYC_API_SECRET", &self.api_secret),
            ("KYC_FIELD_CIPHER_KEY", &self.field_cipher_key),
        ] {
            if secret.expose_secret().is_empty() {
                return Err(KycError::Configuration(format!("{name} is not set")));
            }
        }
        let url = &self.provider_base_url;
        let loopback = ["http://127.0.0.1", "http://localhost", "http://[::1]"]
            .iter()
            .any(|prefix| url.starts_with(prefix));
        if !url.starts_with("https://") && !loopback {
            return Err(KycError::Configuration(format!(
                "provider base url must use https: {url}"
            )));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(KycError::Configuration(
                "KYC_RETRY_BASE_DELAY_MS exceeds KYC_RETRY_MAX_DELAY_MS".to_string(),
            ));
        }
        if self.default_token_ttl.is_zero() {
            return Err(KycError::Configuration(
                "KYC_TOKEN_TTL_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Joins `path` onto the provider base URL.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.provider_base_url, path.trim_start_matches('/'))
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> KycResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key).map_or(Ok(default), |raw| {
        raw.parse()
            .map_err(|e| KycError::Configuration(format!("{key}={raw:?} is invalid: {e}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("KYC_API_KEY", "key_live_123"),
        ("KYC_API_SECRET", "secret_live_456"),
        ("KYC_FIELD_CIPHER_KEY", "a long passphrase"),
    ];

    #[test]
    fn test_defaults() {
        let config = KycConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.provider_base_url, DEFAULT_PROVIDER_BASE_URL);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.fallback_mode, FallbackMode::Strict);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.api_key.expose_secret(), "key_live_123");
        assert_eq!(
            config.endpoint("/kyc/pan/verify"),
            "https://api.sandbox.co.in/kyc/pan/verify"
        );
    }

    #[test]
    fn test_missing_secrets_are_fatal() {
        for missing in ["KYC_API_KEY", "KYC_API_SECRET", "KYC_FIELD_CIPHER_KEY"] {
            let pairs: Vec<_> = REQUIRED.into_iter().filter(|(k, _)| *k != missing).collect();
            match KycConfig::from_lookup(lookup(&pairs)) {
                Err(KycError::Configuration(msg)) => assert!(msg.contains(missing)),
                other => panic!("expected configuration error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_overrides_and_clamping() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("KYC_FALLBACK_MODE", "simulate"),
            ("KYC_CONCURRENCY", "50"),
            ("KYC_MAX_RETRIES", "4"),
            ("KYC_PROVIDER_BASE_URL", "http://127.0.0.1:8080/"),
        ]);
        let config = KycConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.fallback_mode, FallbackMode::Simulate);
        assert_eq!(config.concurrency, MAX_CONCURRENCY);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.provider_base_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn test_rejects_plain_http_and_bad_numbers() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("KYC_PROVIDER_BASE_URL", "http://provider.example.com"));
        assert!(matches!(
            KycConfig::from_lookup(lookup(&pairs)),
            Err(KycError::Configuration(_))
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("KYC_MAX_RETRIES", "many"));
        assert!(matches!(
            KycConfig::from_lookup(lookup(&pairs)),
            Err(KycError::Configuration(_))
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("KYC_FALLBACK_MODE", "sometimes"));
        assert!(matches!(
            KycConfig::from_lookup(lookup(&pairs)),
            Err(KycError::Configuration(_))
        ));
    }
}
