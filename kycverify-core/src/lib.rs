//! Batch KYC verification.
//!
//! An uploaded spreadsheet of identity rows is mapped onto canonical fields,
//! each valid row is verified against the provider under a bounded worker
//! pool, and every outcome is encrypted and persisted. See
//! [`BatchOrchestrator::run_batch`] for the entry point.

pub mod batch;
pub use batch::{
    cancellation, BatchOptions, BatchOrchestrator, BatchReport, BatchSummary, CancelHandle,
    CancellationSignal, RecordOutcome, SkippedRow,
};

pub mod cipher;
pub use cipher::{looks_encrypted, EncodedField, FieldCipher, ENCRYPTED_PLACEHOLDER};

pub mod columns;
pub use columns::{map_columns, ColumnMapping, FieldName};

pub mod config;
pub use config::{FallbackMode, KycConfig};

mod error;
pub use error::*;

pub mod logger;

pub mod outcome;
pub use outcome::{Attempt, AttemptResult, OutcomeSource, VerificationOutcome, VerificationStatus};

pub mod persistence;
pub use persistence::{
    EncryptedAttempt, EncryptedOutcome, EncryptedOutcomeRecord, JsonLinesOutcomeStore,
    MemoryOutcomeStore, OutcomeSink,
};

pub mod policy;
pub use policy::VerificationPolicy;

pub mod provider;

pub mod record;
pub use record::{IdentifierKind, NormalizedRecord};

pub mod spreadsheet;
pub use spreadsheet::{load_path, load_upload, RawRow, RawSheet};

// private modules
mod http_request;
