//! Per-record verification results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Verdict for one record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationStatus {
    /// Identifier valid and all supplied details match.
    Verified,
    /// Identifier valid but name or date of birth do not match.
    Mismatched,
    /// Identifier unknown or invalid at the provider.
    Invalid,
    /// Provider has no decisive answer yet.
    Pending,
    /// No answer could be obtained.
    Error,
    /// Never scheduled because the batch was cancelled.
    Cancelled,
}

/// Where an outcome came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeSource {
    /// A genuine provider answer (or a genuine failure to get one).
    Provider,
    /// Synthesized placeholder; never a real provider answer.
    FallbackSimulation,
}

/// Result of a single attempt against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptResult {
    /// The provider answered.
    Success,
    /// 401; the token was invalidated.
    Unauthorized,
    /// Timeout, connection failure, 429 or 5xx.
    Transient,
    /// 4xx business rejection.
    Rejected,
    /// The record could not be sent as is.
    Invalid,
}

/// One entry of an outcome's attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// How it went.
    pub outcome: AttemptResult,
    /// Error details for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Attempt {
    pub(crate) fn success() -> Self {
        Self {
            timestamp: Utc::now(),
            outcome: AttemptResult::Success,
            error_message: None,
        }
    }

    pub(crate) fn failure(outcome: AttemptResult, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            error_message: Some(message.into()),
        }
    }
}

/// Per-record verification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Verdict.
    pub status: VerificationStatus,
    /// Provider response body, when one was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_provider_response: Option<serde_json::Value>,
    /// Attempts in the order they were made.
    pub attempts: Vec<Attempt>,
    /// Provenance.
    pub source: OutcomeSource,
    /// Wall-clock time spent on the record, retries and backoff included.
    pub processing_time_ms: u64,
}

impl VerificationOutcome {
    /// Outcome for a row that was never scheduled.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self {
            status: VerificationStatus::Cancelled,
            raw_provider_response: None,
            attempts: Vec::new(),
            source: OutcomeSource::Provider,
            processing_time_ms: 0,
        }
    }

    /// Whether this outcome is a synthesized placeholder.
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        self.source == OutcomeSource::FallbackSimulation
    }
}
