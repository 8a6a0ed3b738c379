//! HTTP client for the verification provider.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use super::auth::{AuthToken, Authenticate};
use super::wire::{
    classify_verdict, error_message, extract_token_grant, verify_path, verify_request_body,
    AUTHENTICATE_PATH,
};
use crate::config::KycConfig;
use crate::error::{KycError, KycResult};
use crate::http_request::{Request, RequestError};
use crate::outcome::{AttemptResult, VerificationStatus};
use crate::record::NormalizedRecord;

/// The provider's answer for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderVerdict {
    /// Verdict derived from the response flags.
    pub status: VerificationStatus,
    /// Response body as received.
    pub raw_response: Value,
}

/// Why a single verification call did not produce a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// 401: the token is no longer accepted.
    Unauthorized,
    /// Timeout, connection failure, 429 or 5xx. Worth retrying.
    Transient {
        /// HTTP status, absent for transport failures.
        status: Option<u16>,
        /// Error details.
        message: String,
    },
    /// 4xx business rejection, or a request that failed for good before any
    /// response arrived. Not retried.
    Rejected {
        /// HTTP status, absent when no response was received.
        status: Option<u16>,
        /// Provider message.
        message: String,
        /// Response body, when it was JSON.
        body: Option<Value>,
    },
    /// The record cannot be sent as is.
    Validation(String),
}

impl VerifyError {
    /// Attempt-log classification of this failure.
    #[must_use]
    pub const fn attempt_result(&self) -> AttemptResult {
        match self {
            Self::Unauthorized => AttemptResult::Unauthorized,
            Self::Transient { .. } => AttemptResult::Transient,
            Self::Rejected { .. } => AttemptResult::Rejected,
            Self::Validation(_) => AttemptResult::Invalid,
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "provider rejected the token (401)"),
            Self::Transient {
                status: Some(status),
                message,
            } => write!(f, "transient provider failure ({status}): {message}"),
            Self::Transient {
                status: None,
                message,
            } => write!(f, "transient provider failure: {message}"),
            Self::Rejected {
                status: Some(status),
                message,
                ..
            } => write!(f, "provider rejected the request ({status}): {message}"),
            Self::Rejected {
                status: None,
                message,
                ..
            } => write!(f, "provider request failed: {message}"),
            Self::Validation(message) => write!(f, "validation failed: {message}"),
        }
    }
}

impl From<RequestError> for VerifyError {
    fn from(err: RequestError) -> Self {
        if err.is_retryable() {
            Self::Transient {
                status: err.status,
                message: err.error,
            }
        } else {
            Self::Rejected {
                status: err.status,
                message: err.error,
                body: None,
            }
        }
    }
}

impl From<VerifyError> for KycError {
    fn from(value: VerifyError) -> Self {
        match value {
            VerifyError::Unauthorized => Self::Auth {
                status: Some(401),
                message: "token rejected".to_string(),
            },
            VerifyError::Transient { status, message } => Self::TransientProvider {
                url: String::new(),
                status,
                error: message,
            },
            VerifyError::Rejected {
                status, message, ..
            } => Self::ProviderRejection { status, message },
            VerifyError::Validation(message) => Self::Validation(message),
        }
    }
}

/// Issues a single verification call.
#[async_trait]
pub trait Verify: Send + Sync {
    /// Verifies `record` using `token`. No retries.
    ///
    /// # Errors
    ///
    /// See [`VerifyError`].
    async fn verify(
        &self,
        record: &NormalizedRecord,
        token: &AuthToken,
    ) -> Result<ProviderVerdict, VerifyError>;
}

/// Verification provider API client.
pub struct ProviderClient {
    base_url: String,
    api_key: SecretString,
    api_secret: SecretString,
    api_version: Option<String>,
    default_reason: String,
    default_token_ttl_seconds: u64,
    request: Request,
}

impl ProviderClient {
    /// Creates a client from the startup configuration.
    #[must_use]
    pub fn new(config: &KycConfig) -> Self {
        Self {
            base_url: config.provider_base_url.clone(),
            api_key: SecretString::from(config.api_key.expose_secret().to_string()),
            api_secret: SecretString::from(config.api_secret.expose_secret().to_string()),
            api_version: config.api_version.clone(),
            default_reason: config.default_reason.clone(),
            default_token_ttl_seconds: config.default_token_ttl.as_secs(),
            request: Request::new(
                config.request_timeout,
                config.max_retries,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn with_common_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("x-api-key", self.api_key.expose_secret());
        match &self.api_version {
            Some(version) => builder.header("x-api-version", version),
            None => builder,
        }
    }

    async fn parse_authenticate_response(&self, response: Response) -> KycResult<AuthToken> {
        let status = response.status();
        let body = response.text().await.map_err(|e| KycError::Auth {
            status: Some(status.as_u16()),
            message: format!("failed to read authentication response: {e}"),
        })?;

        if !status.is_success() {
            return Err(KycError::Auth {
                status: Some(status.as_u16()),
                message: error_message(&body),
            });
        }

        let json: Value = serde_json::from_str(&body).map_err(|e| KycError::Auth {
            status: Some(status.as_u16()),
            message: format!("authentication response is not json: {e}"),
        })?;
        let grant = extract_token_grant(&json).ok_or_else(|| KycError::Auth {
            status: Some(status.as_u16()),
            message: "authentication response carries no access token".to_string(),
        })?;

        Ok(AuthToken::new(
            grant.access_token,
            Utc::now(),
            grant.expires_in.unwrap_or(self.default_token_ttl_seconds),
        ))
    }

    async fn parse_verify_response(
        response: Response,
        dob_sent: bool,
    ) -> Result<ProviderVerdict, VerifyError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| VerifyError::Transient {
            status: Some(status.as_u16()),
            message: format!("failed to read response body: {e}"),
        })?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(VerifyError::Unauthorized);
        }
        if !status.is_success() {
            return Err(VerifyError::Rejected {
                status: Some(status.as_u16()),
                message: error_message(&body),
                body: serde_json::from_str(&body).ok(),
            });
        }

        let raw_response: Value =
            serde_json::from_str(&body).map_err(|e| VerifyError::Rejected {
                status: Some(status.as_u16()),
                message: format!("verification response is not json: {e}"),
                body: None,
            })?;
        Ok(ProviderVerdict {
            status: classify_verdict(&raw_response, dob_sent),
            raw_response,
        })
    }
}

#[async_trait]
impl Authenticate for ProviderClient {
    async fn authenticate(&self) -> KycResult<AuthToken> {
        let url = self.url(AUTHENTICATE_PATH);
        let builder = self
            .with_common_headers(self.request.post(&url))
            .header("x-api-secret", self.api_secret.expose_secret());

        let response = self.request.handle(builder).await.map_err(|err| {
            warn!(status = ?err.status, "provider authentication failed: {}", err.error);
            KycError::Auth {
                status: err.status,
                message: err.error,
            }
        })?;
        self.parse_authenticate_response(response).await
    }
}

#[async_trait]
impl Verify for ProviderClient {
    async fn verify(
        &self,
        record: &NormalizedRecord,
        token: &AuthToken,
    ) -> Result<ProviderVerdict, VerifyError> {
        let date_of_birth = record
            .formatted_date_of_birth()
            .map_err(|e| VerifyError::Validation(e.to_string()))?;
        let reason = record.reason.as_deref().unwrap_or(&self.default_reason);
        let body = verify_request_body(
            record.identifier_kind,
            &record.identifier_primary,
            &record.name,
            date_of_birth.as_deref(),
            reason,
        )
        .map_err(|e| VerifyError::Validation(format!("cannot encode request: {e}")))?;

        let url = self.url(verify_path(record.identifier_kind));
        let builder = self
            .with_common_headers(self.request.post(&url))
            .header("authorization", token.as_str())
            .json(&body);

        debug!(row = record.row_number, kind = %record.identifier_kind, "sending verification request");
        let response = self
            .request
            .execute(builder)
            .await
            .map_err(VerifyError::from)?;
        Self::parse_verify_response(response, date_of_birth.is_some()).await
    }
}
