//! Two-phase index integrity checking and repair.
//!
//! Phase 1 walks the index and flags entries whose record is gone
//! (dangling); phase 2 walks the records and flags expected entries the
//! index lacks (missing). Each phase resumes through its own range set, so
//! an interrupted scrub never mixes phases on resume.
//!
//! The batch protocol guarantees forward progress under hard budgets: a
//! batch commits at most `entries_scan_limit` entries or
//! `max_transaction_bytes` bytes, but always at least one entry; an entry
//! so large that its own transaction cannot commit is skipped through a
//! separately committed marker and counted, never retried forever.
//! Issues are recorded only after the batch that found them has durably
//! committed.

mod config;
mod metrics;
mod result;

pub use config::{ScrubberConfig, MAX_TRANSACTION_BYTES, MAX_TRANSACTION_TIMEOUT};
pub use metrics::ScrubMetrics;
pub use result::{IssueCounts, ScrubError, ScrubSummary, ScrubberResult};

use std::sync::Arc;
use std::time::Instant;

use taxis_core::layout::ScrubPhase;
use taxis_core::{
    key_after, CancelToken, Index, IndexError, Key, KeySelector, KvStore, RangeOptions,
    RangeSet, Record, RecordAccess, StoreLayout, Transaction,
};
use taxis_indexes::ValueMaintainer;
use tracing::{debug, info, warn};

/// Applied to the summary only after its batch committed.
#[derive(Debug, Default)]
struct BatchOutcome {
    continuation: Key,
    entries: u64,
    records: u64,
    dangling: IssueCounts,
    missing: IssueCounts,
    skipped: u64,
}

/// A failed batch, with the first key it touched so the oversize skip
/// protocol knows what to step over.
struct BatchFailure {
    error: IndexError,
    first_key: Option<Key>,
}

enum Termination {
    Cancelled,
    Error(ScrubError),
}

/// Checks one value index against its records, repairing when allowed.
pub struct Scrubber<R: Record, K: KvStore> {
    kv: K,
    layout: StoreLayout,
    index: Index,
    value: ValueMaintainer,
    access: Arc<dyn RecordAccess<R>>,
    config: ScrubberConfig,
    metrics: ScrubMetrics,
}

impl<R: Record, K: KvStore + std::fmt::Debug> std::fmt::Debug for Scrubber<R, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scrubber")
            .field("kv", &self.kv)
            .field("layout", &self.layout)
            .field("index", &self.index)
            .field("value", &self.value)
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl<R: Record, K: KvStore> Scrubber<R, K> {
    /// Validates that the index kind is supported and the index is
    /// readable before any scanning happens.
    pub fn new(
        kv: K,
        layout: StoreLayout,
        index: Index,
        access: Arc<dyn RecordAccess<R>>,
        config: ScrubberConfig,
    ) -> Result<Self, IndexError> {
        let config = config.clamped();

        if !config.supported_kinds.contains(&index.kind) {
            return Err(IndexError::invalid_argument(format!(
                "scrubbing {} indexes is not supported",
                index.kind
            )));
        }

        {
            let txn = kv.begin()?;
            layout.state_manager().expect_readable(&index.name, &txn)?;
        }

        let value = ValueMaintainer::new(index.clone(), layout.index(&index.name));

        Ok(Self {
            kv,
            layout,
            index,
            value,
            access,
            config,
            metrics: ScrubMetrics::new(),
        })
    }

    /// Run both phases. Never returns an error: whatever happens is
    /// packaged into the result.
    pub async fn scrub_index<C: CancelToken>(&self, cancel: &C) -> ScrubberResult {
        let started = Instant::now();
        let mut summary = ScrubSummary::default();

        for phase in [ScrubPhase::IndexToRecord, ScrubPhase::RecordToIndex] {
            match self.run_phase(phase, cancel, &mut summary).await {
                Ok(()) => {}
                Err(Termination::Cancelled) => {
                    summary.time_elapsed = started.elapsed();
                    return ScrubberResult::cancelled(summary);
                }
                Err(Termination::Error(error)) => {
                    warn!(index = %self.index.name, error = %error, "scrub terminated");
                    summary.time_elapsed = started.elapsed();
                    return ScrubberResult::terminated(summary, error);
                }
            }
        }

        // both phases drained; clear the resume sets so the next scrub
        // starts from the top
        if let Err(error) = self.clear_progress() {
            summary.time_elapsed = started.elapsed();
            return ScrubberResult::terminated(summary, error);
        }

        summary.time_elapsed = started.elapsed();
        info!(
            index = %self.index.name,
            entries = summary.entries_scanned,
            records = summary.records_scanned,
            dangling = summary.dangling.detected,
            missing = summary.missing.detected,
            "scrub complete"
        );

        ScrubberResult::completed(summary)
    }

    fn clear_progress(&self) -> Result<(), ScrubError> {
        let mut txn = self.kv.begin().map_err(IndexError::from)?;
        for phase in [ScrubPhase::IndexToRecord, ScrubPhase::RecordToIndex] {
            self.layout
                .scrub_range_set(&self.index.name, phase)
                .clear(&mut txn)?;
        }
        txn.commit().map_err(IndexError::from)?;
        Ok(())
    }

    async fn run_phase<C: CancelToken>(
        &self,
        phase: ScrubPhase,
        cancel: &C,
        summary: &mut ScrubSummary,
    ) -> Result<(), Termination> {
        let set = self.layout.scrub_range_set(&self.index.name, phase);

        // phase 1 walks the index subspace; phase 2 walks every record
        // type the index applies to
        let targets: Vec<(Option<String>, Key, Key)> = match phase {
            ScrubPhase::IndexToRecord => {
                let (begin, end) = self.layout.index(&self.index.name).range();
                vec![(None, begin, end)]
            }
            ScrubPhase::RecordToIndex => self
                .index
                .record_types
                .iter()
                .map(|record_type| {
                    let (begin, end) = self.layout.records_of(record_type).range();
                    (Some(record_type.clone()), begin, end)
                })
                .collect(),
        };

        let mut batches = 0u64;

        for (record_type, full_begin, full_end) in targets {
            let missing = {
                let txn = self
                    .kv
                    .begin()
                    .map_err(|e| Termination::Error(ScrubError::Kvs(e)))?;
                set.missing_ranges(&txn, &full_begin, &full_end)
                    .map_err(|e| Termination::Error(ScrubError::Kvs(e)))?
            };

            for (mut cursor, end) in missing {
                while cursor < end {
                    if cancel.is_cancelled() {
                        info!(index = %self.index.name, phase = phase.label(), "scrub interrupted");
                        return Err(Termination::Cancelled);
                    }

                    let batch_started = Instant::now();
                    let outcome = self
                        .batch_with_retries(phase, record_type.as_deref(), &set, &cursor, &end)
                        .await
                        .map_err(Termination::Error)?;

                    // the batch committed; only now do the issues count
                    summary.entries_scanned += outcome.entries;
                    summary.records_scanned += outcome.records;
                    summary.dangling.detected += outcome.dangling.detected;
                    summary.dangling.repaired += outcome.dangling.repaired;
                    summary.missing.detected += outcome.missing.detected;
                    summary.missing.repaired += outcome.missing.repaired;
                    summary.skipped += outcome.skipped;

                    let label = phase.label();
                    self.metrics.record_scanned(label, outcome.entries.max(outcome.records));
                    self.metrics.record_batch(
                        label,
                        batch_started.elapsed().as_secs_f64(),
                        outcome.entries.max(outcome.records),
                    );
                    for _ in 0..outcome.dangling.detected {
                        self.metrics
                            .record_issue("dangling_entry", outcome.dangling.repaired > 0);
                    }
                    for _ in 0..outcome.missing.detected {
                        self.metrics
                            .record_issue("missing_entry", outcome.missing.repaired > 0);
                    }

                    batches += 1;
                    if self.config.log_progress {
                        debug!(
                            index = %self.index.name,
                            phase = label,
                            batch = batches,
                            entries = outcome.entries,
                            records = outcome.records,
                            "scrub batch committed"
                        );
                    }

                    if batches % self.config.progress_refresh_batches.max(1) == 0 {
                        if let Ok(txn) = self.kv.begin() {
                            if let Ok(ratio) =
                                set.get_progress(&txn, &full_begin, &full_end)
                            {
                                self.metrics.record_progress(label, ratio);
                            }
                        }
                    }

                    cursor = outcome.continuation;
                }
            }
        }

        Ok(())
    }

    async fn batch_with_retries(
        &self,
        phase: ScrubPhase,
        record_type: Option<&str>,
        set: &RangeSet,
        cursor: &Key,
        end: &Key,
    ) -> Result<BatchOutcome, ScrubError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.run_batch(phase, record_type, set, cursor, end) {
                Ok(outcome) => return Ok(outcome),
                Err(failure) if is_size_class(&failure.error) => {
                    // a single entry larger than the whole budget: step
                    // over it with a separately committed marker
                    let offending = failure.first_key.ok_or_else(|| {
                        ScrubError::Index(IndexError::internal(
                            "transaction too large with no processed entry".to_string(),
                        ))
                    })?;

                    let continuation =
                        self.skip_oversized(phase, set, cursor, &offending).await?;

                    return Ok(BatchOutcome {
                        continuation,
                        skipped: 1,
                        ..BatchOutcome::default()
                    });
                }
                Err(failure)
                    if failure.error.is_retryable() && attempt <= self.config.max_retries =>
                {
                    let delay = self.config.retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        index = %self.index.name,
                        phase = phase.label(),
                        attempt,
                        ?delay,
                        error = %failure.error,
                        "retrying scrub batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) if failure.error.is_retryable() => {
                    return Err(ScrubError::RetryExhausted {
                        phase: phase.label(),
                        operation: "batch",
                        key_range: format!(
                            "{}..{}",
                            hex::encode(cursor),
                            hex::encode(end)
                        ),
                        attempts: attempt,
                        last_error: failure.error.to_string(),
                        recommendation:
                            "lower entries_scan_limit or raise max_retries and re-run; \
                             progress is preserved",
                    });
                }
                Err(failure) => return Err(ScrubError::Index(failure.error)),
            }
        }
    }

    /// Commit a marker stepping over one oversized entry. The marker
    /// commit follows the same retry policy as ordinary batches.
    async fn skip_oversized(
        &self,
        phase: ScrubPhase,
        set: &RangeSet,
        cursor: &Key,
        offending: &Key,
    ) -> Result<Key, ScrubError> {
        let continuation = key_after(offending);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = (|| -> Result<(), IndexError> {
                let mut txn = self.kv.begin()?;
                txn.set_timeout(self.config.transaction_timeout);
                set.insert_range(&mut txn, cursor, &continuation)?;
                txn.commit()?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    warn!(
                        index = %self.index.name,
                        phase = phase.label(),
                        key = %hex::encode(offending),
                        "skipped oversized entry"
                    );
                    self.metrics
                        .record_skipped(phase.label(), "oversized_key");
                    return Ok(continuation);
                }
                Err(error) if error.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(ScrubError::SkipFailed {
                        key: hex::encode(offending),
                        reason: error.to_string(),
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// One transactional batch of a phase.
    fn run_batch(
        &self,
        phase: ScrubPhase,
        record_type: Option<&str>,
        set: &RangeSet,
        cursor: &Key,
        end: &Key,
    ) -> Result<BatchOutcome, BatchFailure> {
        let fail = |error: IndexError| BatchFailure {
            error,
            first_key: None,
        };

        let mut txn = self.kv.begin().map_err(|e| fail(e.into()))?;
        txn.set_timeout(self.config.transaction_timeout);

        let entries: Vec<(Key, Vec<u8>)> = txn
            .get_range(
                &KeySelector::first_greater_or_equal(cursor.clone()),
                &KeySelector::first_greater_or_equal(end.clone()),
                RangeOptions {
                    limit: Some(self.config.entries_scan_limit),
                    reverse: false,
                    snapshot: !self.config.read_your_writes,
                },
            )
            .map_err(|e| fail(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| fail(e.into()))?;

        let first_key = entries.first().map(|(key, _)| key.clone());
        let with_first = |error: IndexError| BatchFailure {
            error,
            first_key: first_key.clone(),
        };

        let mut outcome = BatchOutcome::default();
        let mut scanned_bytes = 0usize;
        let mut last_key: Option<Key> = None;
        let mut early_stop: Option<Key> = None;

        for (key, value) in &entries {
            let entry_size = key.len()
                + match phase {
                    ScrubPhase::IndexToRecord => 0,
                    ScrubPhase::RecordToIndex => value.len(),
                };

            // the byte budget never blocks the first entry of a batch;
            // forward progress beats the budget
            if outcome.entries + outcome.records > 0
                && scanned_bytes + entry_size > self.config.max_transaction_bytes
            {
                early_stop = Some(key.clone());
                break;
            }

            match phase {
                ScrubPhase::IndexToRecord => self
                    .check_index_entry(&mut txn, key, &mut outcome)
                    .map_err(&with_first)?,
                ScrubPhase::RecordToIndex => self
                    .check_record(&mut txn, record_type, key, value, &mut outcome)
                    .map_err(&with_first)?,
            }

            scanned_bytes += entry_size;
            last_key = Some(key.clone());
        }

        outcome.continuation = match early_stop {
            // reprocess the key that did not fit into this batch
            Some(key) => key,
            None => match last_key {
                Some(last) if entries.len() == self.config.entries_scan_limit => {
                    key_after(&last)
                }
                _ => end.clone(),
            },
        };

        set.insert_range(&mut txn, cursor, &outcome.continuation)
            .map_err(|e| with_first(e.into()))?;

        txn.commit().map_err(|e| with_first(e.into()))?;

        Ok(outcome)
    }

    /// Phase 1: does the record behind this index entry exist?
    fn check_index_entry<T: Transaction>(
        &self,
        txn: &mut T,
        key: &[u8],
        outcome: &mut BatchOutcome,
    ) -> Result<(), IndexError> {
        let index_space = self.layout.index(&self.index.name);
        let tuple = index_space.unpack(key)?;
        let pk = tuple.suffix(self.index.column_count());

        let mut backed = false;
        for record_type in &self.index.record_types {
            if txn.get(&self.layout.record_key(record_type, &pk))?.is_some() {
                backed = true;
                break;
            }
        }

        outcome.entries += 1;

        if !backed {
            outcome.dangling.detected += 1;
            if self.config.allow_repair {
                txn.clear(key);
                outcome.dangling.repaired += 1;
            }
        }

        Ok(())
    }

    /// Phase 2: does the index hold every entry this record projects to?
    fn check_record<T: Transaction>(
        &self,
        txn: &mut T,
        record_type: Option<&str>,
        key: &[u8],
        value: &[u8],
        outcome: &mut BatchOutcome,
    ) -> Result<(), IndexError> {
        let record_type = record_type.ok_or_else(|| {
            IndexError::internal("record scan without a record type".to_string())
        })?;

        let records = self.layout.records_of(record_type);
        let _pk = records.unpack(key)?;
        let record = self.access.deserialize(record_type, value)?;

        let expected = self.value.keys_for(self.access.as_ref(), &record)?;

        outcome.records += 1;

        for expected_key in expected {
            if txn.get(&expected_key)?.is_none() {
                outcome.missing.detected += 1;
                if self.config.allow_repair {
                    txn.set(&expected_key, &[]);
                    outcome.missing.repaired += 1;
                }
            }
        }

        Ok(())
    }
}

fn is_size_class(error: &IndexError) -> bool {
    matches!(error, IndexError::Kvs(inner) if inner.is_size_class())
}
