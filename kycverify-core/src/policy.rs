//! Retry and fallback policy around single verification calls.
//!
//! Transient failures are retried with exponential backoff up to the
//! configured budget. A 401 invalidates the token and is retried once with a
//! fresh one inside the same attempt. What happens once the budget is spent is
//! decided by [`FallbackMode`], fixed for the whole run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{FallbackMode, KycConfig};
use crate::error::{KycError, KycResult};
use crate::outcome::{Attempt, OutcomeSource, VerificationOutcome, VerificationStatus};
use crate::provider::wire::classify_verdict;
use crate::provider::{ProviderVerdict, TokenManager, Verify, VerifyError};
use crate::record::NormalizedRecord;

#[derive(Debug)]
enum AttemptFailure {
    Auth(KycError),
    Verify(VerifyError),
}

impl AttemptFailure {
    const fn is_retryable(&self) -> bool {
        matches!(self, Self::Verify(VerifyError::Transient { .. }))
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(err) => write!(f, "{err}"),
            Self::Verify(err) => write!(f, "{err}"),
        }
    }
}

/// Wraps a [`Verify`] implementation with retries, token refresh and fallback.
pub struct VerificationPolicy {
    verifier: Arc<dyn Verify>,
    tokens: Arc<TokenManager>,
    fallback_mode: FallbackMode,
    max_retries: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl VerificationPolicy {
    /// Builds a policy for one run.
    #[must_use]
    pub fn new(verifier: Arc<dyn Verify>, tokens: Arc<TokenManager>, config: &KycConfig) -> Self {
        Self {
            verifier,
            tokens,
            fallback_mode: config.fallback_mode,
            max_retries: config.max_retries,
            min_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// The mode this policy applies after retries are exhausted.
    #[must_use]
    pub const fn fallback_mode(&self) -> FallbackMode {
        self.fallback_mode
    }

    /// Verifies one record, always producing an outcome unless no token can be
    /// obtained.
    ///
    /// `max_retries` bounds the extra attempts made after transient failures
    /// only. The single re-authentication after a 401 happens inside the
    /// current attempt and is not counted against it, so a 401 is retried once
    /// even when `max_retries` is 0.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Auth`] if authentication fails. Every other failure
    /// is recorded in the returned outcome.
    pub async fn verify_with_policy(
        &self,
        record: &NormalizedRecord,
    ) -> KycResult<VerificationOutcome> {
        let started = Instant::now();
        let attempts = Mutex::new(Vec::new());
        let reauthenticated = AtomicBool::new(false);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize);

        let result = (|| self.attempt(record, &attempts, &reauthenticated))
            .retry(backoff)
            .when(AttemptFailure::is_retryable)
            .notify(|err: &AttemptFailure, delay: Duration| {
                warn!(row = record.row_number, ?delay, "retrying verification: {err}");
            })
            .await;

        let attempts = attempts.into_inner().unwrap_or_else(PoisonError::into_inner);
        let (status, raw_provider_response, source) = match result {
            Ok(verdict) => (
                verdict.status,
                Some(verdict.raw_response),
                OutcomeSource::Provider,
            ),
            Err(AttemptFailure::Auth(err)) => return Err(err),
            Err(AttemptFailure::Verify(err)) => self.settle_failure(record, err),
        };

        let processing_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            row = record.row_number,
            %status,
            %source,
            attempts = attempts.len(),
            processing_time_ms,
            "record verified"
        );
        Ok(VerificationOutcome {
            status,
            raw_provider_response,
            attempts,
            source,
            processing_time_ms,
        })
    }

    async fn attempt(
        &self,
        record: &NormalizedRecord,
        attempts: &Mutex<Vec<Attempt>>,
        reauthenticated: &AtomicBool,
    ) -> Result<ProviderVerdict, AttemptFailure> {
        let log = |attempt: Attempt| {
            attempts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(attempt);
        };

        loop {
            let token = self.tokens.get_token().await.map_err(AttemptFailure::Auth)?;
            match self.verifier.verify(record, &token).await {
                Ok(verdict) => {
                    log(Attempt::success());
                    return Ok(verdict);
                }
                Err(err) => {
                    log(Attempt::failure(err.attempt_result(), err.to_string()));
                    if err == VerifyError::Unauthorized
                        && !reauthenticated.swap(true, Ordering::SeqCst)
                    {
                        debug!(row = record.row_number, "token rejected, re-authenticating");
                        self.tokens.invalidate(&token).await;
                        continue;
                    }
                    return Err(AttemptFailure::Verify(err));
                }
            }
        }
    }

    fn settle_failure(
        &self,
        record: &NormalizedRecord,
        err: VerifyError,
    ) -> (VerificationStatus, Option<Value>, OutcomeSource) {
        match err {
            VerifyError::Transient { message, .. } => match self.fallback_mode {
                FallbackMode::Strict => {
                    warn!(row = record.row_number, "retries exhausted: {message}");
                    (VerificationStatus::Error, None, OutcomeSource::Provider)
                }
                FallbackMode::Simulate => {
                    warn!(
                        row = record.row_number,
                        "retries exhausted, recording simulated placeholder: {message}"
                    );
                    (
                        VerificationStatus::Pending,
                        Some(simulated_response(record)),
                        OutcomeSource::FallbackSimulation,
                    )
                }
            },
            VerifyError::Rejected { status, body, .. } => {
                let verdict = body
                    .as_ref()
                    .map(|body| classify_verdict(body, false))
                    .filter(|verdict| *verdict == VerificationStatus::Invalid)
                    .unwrap_or(VerificationStatus::Error);
                debug!(row = record.row_number, ?status, %verdict, "provider rejected the request");
                (verdict, body, OutcomeSource::Provider)
            }
            VerifyError::Validation(_) => {
                (VerificationStatus::Invalid, None, OutcomeSource::Provider)
            }
            VerifyError::Unauthorized => {
                warn!(row = record.row_number, "token rejected again after re-authentication");
                (VerificationStatus::Error, None, OutcomeSource::Provider)
            }
        }
    }
}

/// The placeholder recorded in simulate mode. Carries no identity data.
fn simulated_response(record: &NormalizedRecord) -> Value {
    json!({
        "simulated": true,
        "reason": "provider_unavailable",
        "identifier_kind": record.identifier_kind,
        "status": VerificationStatus::Pending,
    })
}
