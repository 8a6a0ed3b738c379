use thiserror::Error;

use crate::columns::FieldName;

/// Result type used throughout the crate.
pub type KycResult<T> = Result<T, KycError>;

/// Error outputs from the verification pipeline.
#[derive(Debug, Error)]
pub enum KycError {
    /// A required secret or setting is missing or malformed. Fatal at startup.
    #[error("configuration_error: {0}")]
    Configuration(String),
    /// The presented input is not valid for the requested operation
    #[error("invalid_input: {attribute}: {reason}")]
    InvalidInput {
        /// Name of the offending input.
        attribute: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A row or one of its values failed validation. The row is skipped.
    #[error("validation_error: {0}")]
    Validation(String),
    /// No token could be obtained from the provider.
    #[error("auth_error ({}): {message}", display_status(.status))]
    Auth {
        /// HTTP status returned by the provider, if a response was received.
        status: Option<u16>,
        /// Provider message or transport error.
        message: String,
    },
    /// Network failure, timeout or 5xx from the provider.
    #[error("transient_provider_error: {url} ({status:?}): {error}")]
    TransientProvider {
        /// Request URL.
        url: String,
        /// HTTP status, absent for transport failures.
        status: Option<u16>,
        /// Error details.
        error: String,
    },
    /// The provider rejected the request (4xx other than 401).
    #[error(
        "provider_rejection{}: {message}",
        .status.map_or_else(String::new, |status| format!(" ({status})"))
    )]
    ProviderRejection {
        /// HTTP status returned by the provider, absent when no response was
        /// received.
        status: Option<u16>,
        /// Provider message.
        message: String,
    },
    /// Ciphertext is malformed or was produced with another key.
    #[error("decryption_error: {0}")]
    Decryption(String),
    /// The spreadsheet header lacks required columns.
    #[error("missing_columns: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    MissingColumns(Vec<FieldName>),
    /// The uploaded file cannot be read as a spreadsheet.
    #[error("spreadsheet_error: {0}")]
    Spreadsheet(String),
    /// The persistence collaborator refused a write.
    #[error("persistence_error: {0}")]
    Persistence(String),
    /// Another run with the same batch identifier is still active.
    #[error("batch_in_progress: {0}")]
    BatchInProgress(uuid::Uuid),
    /// Unexpected error serializing information
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// A verification task panicked or was aborted.
    #[error("task_failed: {0}")]
    TaskFailed(String),
    /// Local I/O failure.
    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
}

impl KycError {
    /// Whether this error stops the whole batch rather than a single row.
    #[must_use]
    pub const fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Auth { .. }
                | Self::MissingColumns(_)
                | Self::Spreadsheet(_)
                | Self::Persistence(_)
                | Self::BatchInProgress(_)
                | Self::TaskFailed(_)
                | Self::Io(_)
        )
    }

    pub(crate) fn invalid_input(attribute: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}

fn display_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "no status".to_string(), |s| s.to_string())
}

impl From<serde_json::Error> for KycError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
