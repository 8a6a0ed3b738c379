//! Batch orchestration: one uploaded sheet in, one summary out.
//!
//! | Situation                                  | Effect                    |
//! |--------------------------------------------|---------------------------|
//! | header lacks a required column             | abort, `MissingColumns`   |
//! | row lacks a value, bad identifier or DOB   | row skipped               |
//! | provider failure after retries             | outcome recorded          |
//! | no token can be obtained                   | abort, `Auth`             |
//! | outcome cannot be persisted                | abort, `Persistence`      |
//!
//! Each run owns its token cache and summary builder. Nothing is shared
//! between runs except the configuration and the collaborators.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cipher::FieldCipher;
use crate::columns::{map_columns, FieldName};
use crate::config::KycConfig;
use crate::error::{KycError, KycResult};
use crate::outcome::{OutcomeSource, VerificationOutcome, VerificationStatus};
use crate::persistence::{EncryptedOutcomeRecord, OutcomeSink};
use crate::policy::VerificationPolicy;
use crate::provider::{Authenticate, ProviderClient, TokenManager, Verify};
use crate::record::{IdentifierKind, NormalizedRecord};
use crate::spreadsheet::RawSheet;

/// Creates a linked cancel handle and signal.
#[must_use]
pub fn cancellation() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancellationSignal { rx })
}

/// Requests cancellation of a running batch.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Stops the batch from scheduling further rows. Rows already in flight
    /// finish normally.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by a running batch to learn about cancellation.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Identifier for the run. A fresh one is generated when absent.
    pub batch_id: Option<Uuid>,
    /// Which identifier the sheet carries.
    pub identifier_kind: IdentifierKind,
}

/// A row that never reached the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    /// Spreadsheet row number.
    pub row_number: usize,
    /// Why the row was skipped.
    pub reason: String,
}

/// Aggregate statistics for one run. Immutable once the run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Run identifier.
    pub batch_id: Uuid,
    /// Non-blank data rows in the sheet.
    pub total_rows: usize,
    /// Rows that passed validation.
    pub accepted_records: usize,
    /// Rows rejected before verification.
    pub skipped_rows: usize,
    /// Accepted rows never scheduled because the run was cancelled.
    pub cancelled_rows: usize,
    /// Details of every skipped row.
    pub skipped: Vec<SkippedRow>,
    /// Completed outcomes per source.
    pub source_breakdown: BTreeMap<OutcomeSource, usize>,
    /// Completed outcomes per status.
    pub status_breakdown: BTreeMap<VerificationStatus, usize>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    /// Number of outcomes with the given status.
    #[must_use]
    pub fn count_status(&self, status: VerificationStatus) -> usize {
        self.status_breakdown.get(&status).copied().unwrap_or_default()
    }

    /// Number of outcomes from the given source.
    #[must_use]
    pub fn count_source(&self, source: OutcomeSource) -> usize {
        self.source_breakdown.get(&source).copied().unwrap_or_default()
    }
}

struct SummaryBuilder {
    batch_id: Uuid,
    started_at: DateTime<Utc>,
    total_rows: usize,
    accepted_records: usize,
    cancelled_rows: usize,
    skipped: Vec<SkippedRow>,
    source_breakdown: BTreeMap<OutcomeSource, usize>,
    status_breakdown: BTreeMap<VerificationStatus, usize>,
}

impl SummaryBuilder {
    fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            started_at: Utc::now(),
            total_rows: 0,
            accepted_records: 0,
            cancelled_rows: 0,
            skipped: Vec::new(),
            source_breakdown: OutcomeSource::iter().map(|source| (source, 0)).collect(),
            status_breakdown: VerificationStatus::iter()
                .filter(|status| *status != VerificationStatus::Cancelled)
                .map(|status| (status, 0))
                .collect(),
        }
    }

    fn accept(&mut self) {
        self.total_rows += 1;
        self.accepted_records += 1;
    }

    fn skip(&mut self, row_number: usize, reason: String) {
        self.total_rows += 1;
        self.skipped.push(SkippedRow { row_number, reason });
    }

    fn complete(&mut self, outcome: &VerificationOutcome) {
        *self.source_breakdown.entry(outcome.source).or_default() += 1;
        *self.status_breakdown.entry(outcome.status).or_default() += 1;
    }

    fn cancel(&mut self) {
        self.cancelled_rows += 1;
    }

    fn finish(self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id,
            total_rows: self.total_rows,
            accepted_records: self.accepted_records,
            skipped_rows: self.skipped.len(),
            cancelled_rows: self.cancelled_rows,
            skipped: self.skipped,
            source_breakdown: self.source_breakdown,
            status_breakdown: self.status_breakdown,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Outcome of one accepted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Spreadsheet row number.
    pub row_number: usize,
    /// Id assigned by the outcome sink. `None` for cancelled rows.
    pub record_id: Option<String>,
    /// The outcome itself.
    pub outcome: VerificationOutcome,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Aggregate statistics.
    pub summary: BatchSummary,
    /// Per-row outcomes in row order.
    pub outcomes: Vec<RecordOutcome>,
}

struct ActiveBatch<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    batch_id: Uuid,
}

impl<'a> ActiveBatch<'a> {
    fn register(active: &'a Mutex<HashSet<Uuid>>, batch_id: Uuid) -> KycResult<Self> {
        let inserted = active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch_id);
        if !inserted {
            return Err(KycError::BatchInProgress(batch_id));
        }
        Ok(Self { active, batch_id })
    }
}

impl Drop for ActiveBatch<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.batch_id);
    }
}

/// Drives verification of whole sheets.
pub struct BatchOrchestrator {
    config: Arc<KycConfig>,
    cipher: Arc<FieldCipher>,
    authenticator: Arc<dyn Authenticate>,
    verifier: Arc<dyn Verify>,
    sink: Arc<dyn OutcomeSink>,
    active: Mutex<HashSet<Uuid>>,
}

impl BatchOrchestrator {
    /// Creates an orchestrator from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Configuration`] if the field cipher cannot be keyed.
    pub fn new(
        config: Arc<KycConfig>,
        authenticator: Arc<dyn Authenticate>,
        verifier: Arc<dyn Verify>,
        sink: Arc<dyn OutcomeSink>,
    ) -> KycResult<Self> {
        let cipher = Arc::new(FieldCipher::new(&config.field_cipher_key)?);
        Ok(Self {
            config,
            cipher,
            authenticator,
            verifier,
            sink,
            active: Mutex::new(HashSet::new()),
        })
    }

    /// Creates an orchestrator talking to the configured provider over HTTP.
    ///
    /// # Errors
    ///
    /// See [`BatchOrchestrator::new`].
    pub fn with_provider(config: Arc<KycConfig>, sink: Arc<dyn OutcomeSink>) -> KycResult<Self> {
        let client = Arc::new(ProviderClient::new(&config));
        Self::new(config, client.clone(), client, sink)
    }

    /// The cipher outcomes are sealed with.
    #[must_use]
    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// Verifies every row of `sheet`.
    ///
    /// # Errors
    ///
    /// Returns a batch-fatal error (see [`KycError::is_batch_fatal`]): missing
    /// header columns, authentication failure, persistence failure, or a
    /// batch id that is already running. Row-level problems never fail the
    /// run.
    pub async fn run_batch(
        &self,
        sheet: &RawSheet,
        options: BatchOptions,
        cancel: CancellationSignal,
    ) -> KycResult<BatchReport> {
        let batch_id = options.batch_id.unwrap_or_else(Uuid::new_v4);
        let _active = ActiveBatch::register(&self.active, batch_id)?;
        let kind = options.identifier_kind;
        let mut summary = SummaryBuilder::new(batch_id);

        let mut mapping = map_columns(sheet.header_names(), &kind.required_fields());
        if !mapping.is_complete() {
            warn!(%batch_id, missing = ?mapping.missing, "sheet header lacks required columns");
            return Err(KycError::MissingColumns(mapping.missing));
        }
        mapping.resolve_optional(
            sheet.header_names(),
            &[FieldName::DateOfBirth, FieldName::Reason],
        );

        let mut records = Vec::new();
        for row in sheet.rows.iter().filter(|row| !row.is_blank()) {
            match NormalizedRecord::from_row(sheet, row, &mapping, kind) {
                Ok(record) => {
                    summary.accept();
                    records.push(record);
                }
                Err(err) => {
                    let reason = match err {
                        KycError::Validation(reason) => reason,
                        other => other.to_string(),
                    };
                    info!(%batch_id, row = row.row_number, %reason, "skipping row");
                    summary.skip(row.row_number, reason);
                }
            }
        }
        info!(
            %batch_id,
            %kind,
            accepted = records.len(),
            skipped = summary.skipped.len(),
            mode = %self.config.fallback_mode,
            "starting batch"
        );

        let outcomes = if records.is_empty() {
            Vec::new()
        } else {
            self.verify_records(batch_id, records, &mut summary, &cancel)
                .await?
        };

        let summary = summary.finish();
        info!(
            %batch_id,
            total = summary.total_rows,
            skipped = summary.skipped_rows,
            cancelled = summary.cancelled_rows,
            "batch finished"
        );
        Ok(BatchReport { summary, outcomes })
    }

    async fn verify_records(
        &self,
        batch_id: Uuid,
        records: Vec<NormalizedRecord>,
        summary: &mut SummaryBuilder,
        cancel: &CancellationSignal,
    ) -> KycResult<Vec<RecordOutcome>> {
        let tokens = Arc::new(TokenManager::new(self.authenticator.clone()));
        tokens.get_token().await?;
        let policy = Arc::new(VerificationPolicy::new(
            self.verifier.clone(),
            tokens,
            &self.config,
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<RecordOutcome>> = vec![None; records.len()];
        let mut unscheduled = Vec::new();

        let mut pending = records.into_iter().enumerate();
        while let Some((index, record)) = pending.next() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                unscheduled.push((index, record));
                unscheduled.extend(pending.by_ref());
                break;
            };

            let policy = policy.clone();
            let cipher = self.cipher.clone();
            let sink = self.sink.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = process_record(&policy, &cipher, sink.as_ref(), batch_id, record).await;
                (index, outcome)
            });

            while let Some(joined) = tasks.try_join_next() {
                store_result(joined, &mut slots)?;
            }
        }

        if !unscheduled.is_empty() {
            warn!(%batch_id, rows = unscheduled.len(), "batch cancelled, rows left unscheduled");
        }
        for (index, record) in unscheduled {
            summary.cancel();
            slots[index] = Some(RecordOutcome {
                row_number: record.row_number,
                record_id: None,
                outcome: VerificationOutcome::cancelled(),
            });
        }

        while let Some(joined) = tasks.join_next().await {
            store_result(joined, &mut slots)?;
        }

        let outcomes: Vec<RecordOutcome> = slots.into_iter().flatten().collect();
        for outcome in &outcomes {
            if outcome.outcome.status != VerificationStatus::Cancelled {
                summary.complete(&outcome.outcome);
            }
        }
        Ok(outcomes)
    }
}

async fn process_record(
    policy: &VerificationPolicy,
    cipher: &FieldCipher,
    sink: &dyn OutcomeSink,
    batch_id: Uuid,
    record: NormalizedRecord,
) -> KycResult<RecordOutcome> {
    let outcome = policy.verify_with_policy(&record).await?;
    let sealed = EncryptedOutcomeRecord::seal(batch_id, &record, &outcome, cipher)?;
    let record_id = sink.persist(sealed).await?;
    Ok(RecordOutcome {
        row_number: record.row_number,
        record_id: Some(record_id),
        outcome,
    })
}

// The remaining tasks are aborted when the `JoinSet` is dropped on error.
fn store_result(
    joined: Result<(usize, KycResult<RecordOutcome>), JoinError>,
    slots: &mut [Option<RecordOutcome>],
) -> KycResult<()> {
    let (index, result) = joined.map_err(|e| KycError::TaskFailed(e.to_string()))?;
    slots[index] = Some(result?);
    Ok(())
}
