//! Storage for encrypted verification outcomes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::cipher::FieldCipher;
use crate::error::{KycError, KycResult};
use crate::outcome::{
    Attempt, AttemptResult, OutcomeSource, VerificationOutcome, VerificationStatus,
};
use crate::record::{IdentifierKind, NormalizedRecord};

/// An [`Attempt`] whose error message is encrypted. Provider error text may
/// echo the submitted identity values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedAttempt {
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// How it went.
    pub outcome: AttemptResult,
    /// Error details, encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EncryptedAttempt {
    fn seal(attempt: &Attempt, cipher: &FieldCipher) -> KycResult<Self> {
        Ok(Self {
            timestamp: attempt.timestamp,
            outcome: attempt.outcome,
            error_message: attempt
                .error_message
                .as_deref()
                .map(|message| cipher.encrypt(message))
                .transpose()?,
        })
    }
}

/// A [`VerificationOutcome`] whose provider response and attempt messages
/// are encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedOutcome {
    /// Verdict.
    pub status: VerificationStatus,
    /// Provider response JSON, encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_provider_response: Option<String>,
    /// Attempt log.
    pub attempts: Vec<EncryptedAttempt>,
    /// Provenance.
    pub source: OutcomeSource,
    /// Wall-clock processing time.
    pub processing_time_ms: u64,
}

/// What gets persisted for one verified row. Identity values are encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedOutcomeRecord {
    /// Batch the row belongs to.
    pub batch_id: Uuid,
    /// Spreadsheet row number.
    pub row_number: usize,
    /// Kind of `identifier`.
    pub identifier_kind: IdentifierKind,
    /// Encrypted identifier.
    pub identifier: String,
    /// Keyed digest of the identifier, for lookups.
    pub identifier_hash: String,
    /// Encrypted holder name.
    pub name: String,
    /// Encrypted date of birth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    /// Reason sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Outcome with its provider response encrypted.
    pub outcome: EncryptedOutcome,
}

impl EncryptedOutcomeRecord {
    /// Encrypts the identity fields of `record` and the provider response and
    /// attempt messages of `outcome`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be encrypted or the response cannot
    /// be serialized.
    pub fn seal(
        batch_id: Uuid,
        record: &NormalizedRecord,
        outcome: &VerificationOutcome,
        cipher: &FieldCipher,
    ) -> KycResult<Self> {
        let raw_provider_response = outcome
            .raw_provider_response
            .as_ref()
            .map(|raw| cipher.encrypt(&serde_json::to_string(raw)?))
            .transpose()?;
        let attempts = outcome
            .attempts
            .iter()
            .map(|attempt| EncryptedAttempt::seal(attempt, cipher))
            .collect::<KycResult<Vec<_>>>()?;

        Ok(Self {
            batch_id,
            row_number: record.row_number,
            identifier_kind: record.identifier_kind,
            identifier: cipher.encrypt(&record.identifier_primary)?,
            identifier_hash: cipher.hash(&record.identifier_primary),
            name: cipher.encrypt(&record.name)?,
            date_of_birth: record
                .date_of_birth
                .as_deref()
                .map(|dob| cipher.encrypt(dob))
                .transpose()?,
            reason: record.reason.clone(),
            outcome: EncryptedOutcome {
                status: outcome.status,
                raw_provider_response,
                attempts,
                source: outcome.source,
                processing_time_ms: outcome.processing_time_ms,
            },
        })
    }
}

/// Destination for encrypted outcomes.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Stores `record` and returns its new identifier.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Persistence`] if the record could not be stored.
    async fn persist(&self, record: EncryptedOutcomeRecord) -> KycResult<String>;
}

/// Keeps outcomes in memory.
#[derive(Debug, Default)]
pub struct MemoryOutcomeStore {
    records: Mutex<Vec<(String, EncryptedOutcomeRecord)>>,
}

impl MemoryOutcomeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored records with their ids, in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<(String, EncryptedOutcomeRecord)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutcomeSink for MemoryOutcomeStore {
    async fn persist(&self, record: EncryptedOutcomeRecord) -> KycResult<String> {
        let id = Uuid::new_v4().to_string();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), record));
        Ok(id)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredLine {
    id: String,
    #[serde(flatten)]
    record: EncryptedOutcomeRecord,
}

/// Appends outcomes to a JSON lines file, one record per line.
#[derive(Debug)]
pub struct JsonLinesOutcomeStore {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesOutcomeStore {
    /// Creates a store appending to `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// File the store appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every stored record with its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is not a record.
    pub async fn read_all(&self) -> KycResult<Vec<(String, EncryptedOutcomeRecord)>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| -> KycResult<_> {
                let stored: StoredLine = serde_json::from_str(line)?;
                Ok((stored.id, stored.record))
            })
            .collect()
    }
}

#[async_trait]
impl OutcomeSink for JsonLinesOutcomeStore {
    async fn persist(&self, record: EncryptedOutcomeRecord) -> KycResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut line = serde_json::to_string(&StoredLine {
            id: id.clone(),
            record,
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let persistence_error =
            |e: std::io::Error| KycError::Persistence(format!("{}: {e}", self.path.display()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(persistence_error)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(persistence_error)?;
        file.flush().await.map_err(persistence_error)?;
        Ok(id)
    }
}
