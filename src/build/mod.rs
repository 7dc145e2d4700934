//! Online index building: backfill a secondary index in bounded batches
//! without blocking writers.
//!
//! The builder owns its transactions. Each batch streams a slice of the
//! record subspace at snapshot isolation, feeds every record through the
//! index's maintainer, commits, and marks the slice complete in the
//! index's range set. A crashed or paused build resumes from the missing
//! ranges; writers keep maintaining the index concurrently because it sits
//! in `write_only` state for the whole build.

pub mod hnsw;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use taxis_core::kvs::KvsError;
use taxis_core::{
    key_after, CancelToken, Index, IndexError, IndexMaintainer, IndexState, Key, KeySelector,
    KvStore, RangeOptions, RangeSet, Record, RecordAccess, StoreLayout, Transaction,
};
use taxis_indexes::build_maintainer;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Kvs(#[from] KvsError),

    #[error("build cancelled")]
    Cancelled,

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("invalid build state: {0}")]
    InvalidState(String),
}

/// Where a paused or failed session stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeCheckpoint {
    pub last_completed_key: Option<Key>,
    pub phase: String,
    pub processed_records: u64,
    pub timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle of one build session.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BuildState {
    #[default]
    NotStarted,
    Running {
        phase: String,
    },
    Completed,
    Paused(RangeCheckpoint),
    Failed {
        checkpoint: RangeCheckpoint,
        error: String,
    },
}

impl BuildState {
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused(_) | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    /// Records per transaction.
    pub batch_size: usize,
    /// Pause between batches, yielding to foreground traffic.
    pub throttle_delay: Duration,
    /// Per-transaction deadline, kept under the store's commit limit.
    pub txn_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            throttle_delay: Duration::from_millis(10),
            txn_timeout: Duration::from_secs(4),
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Counters reported while a build runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildProgress {
    pub records_scanned: u64,
    pub batches: u64,
    /// Estimated completed fraction from the range set.
    pub fraction: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BuildStatistics {
    pub records_scanned: u64,
    pub batches: u64,
    pub elapsed: Duration,
}

/// Builds one index from the stored records.
pub struct OnlineIndexer<R: Record, K: KvStore> {
    kv: K,
    layout: StoreLayout,
    index: Index,
    maintainer: Box<dyn IndexMaintainer<R, K::Txn>>,
    access: Arc<dyn RecordAccess<R>>,
    config: IndexerConfig,
    state: Arc<Mutex<BuildState>>,
    counters: Arc<Mutex<(u64, u64)>>,
}

impl<R: Record, K: KvStore> OnlineIndexer<R, K> {
    pub fn new(
        kv: K,
        layout: StoreLayout,
        index: Index,
        access: Arc<dyn RecordAccess<R>>,
        config: IndexerConfig,
    ) -> Result<Self, IndexError> {
        let maintainer = build_maintainer(&index, &layout)?;

        Ok(Self {
            kv,
            layout,
            index,
            maintainer,
            access,
            config,
            state: Arc::new(Mutex::new(BuildState::NotStarted)),
            counters: Arc::new(Mutex::new((0, 0))),
        })
    }

    fn range_set(&self) -> RangeSet {
        self.layout.build_range_set(&self.index.name)
    }

    pub fn state(&self) -> BuildState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: BuildState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn bump(&self, records: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.0 += records;
        counters.1 += 1;
    }

    fn checkpoint(&self, last_completed_key: Option<Key>) -> RangeCheckpoint {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        RangeCheckpoint {
            last_completed_key,
            phase: "scan".to_string(),
            processed_records: counters.0,
            timestamp_ms: now_ms(),
        }
    }

    /// Current progress; the fraction averages the range-set coverage over
    /// the record types the index applies to.
    pub fn get_progress(&self) -> Result<BuildProgress, BuildError> {
        let (records_scanned, batches) = *self.counters.lock().unwrap_or_else(|e| e.into_inner());

        let txn = self.kv.begin()?;
        let set = self.range_set();

        let mut fraction = 0.0;
        for record_type in &self.index.record_types {
            let (begin, end) = self.layout.records_of(record_type).range();
            fraction += set.get_progress(&txn, &begin, &end)?;
        }
        fraction /= self.index.record_types.len().max(1) as f64;

        Ok(BuildProgress {
            records_scanned,
            batches,
            fraction,
        })
    }

    /// Abandon the session and clear its progress markers.
    pub fn cancel(&self) -> Result<(), BuildError> {
        let mut txn = self.kv.begin()?;
        self.range_set().clear(&mut txn)?;
        txn.commit()?;

        self.set_state(BuildState::NotStarted);
        *self.counters.lock().unwrap_or_else(|e| e.into_inner()) = (0, 0);
        info!(index = %self.index.name, "index build cancelled, progress cleared");
        Ok(())
    }

    /// Build the index from scratch or from the last committed marker.
    pub async fn build_index<C: CancelToken>(
        &self,
        clear_first: bool,
        cancel: &C,
    ) -> Result<BuildStatistics, BuildError> {
        let started = Instant::now();

        // a fresh session starts its counters over; a resumed one keeps
        // accumulating
        if !self.state().can_resume() {
            *self.counters.lock().unwrap_or_else(|e| e.into_inner()) = (0, 0);
        }

        self.set_state(BuildState::Running {
            phase: "scan".to_string(),
        });

        self.prepare(clear_first)?;

        let result = self.drain_missing_ranges(cancel).await;

        match result {
            Ok(()) => {
                self.finish()?;

                let (records_scanned, batches) =
                    *self.counters.lock().unwrap_or_else(|e| e.into_inner());
                self.set_state(BuildState::Completed);

                info!(
                    index = %self.index.name,
                    records_scanned,
                    batches,
                    "index build complete"
                );

                Ok(BuildStatistics {
                    records_scanned,
                    batches,
                    elapsed: started.elapsed(),
                })
            }
            Err(BuildError::Cancelled) => {
                self.set_state(BuildState::Paused(self.checkpoint(None)));
                Err(BuildError::Cancelled)
            }
            Err(error) => {
                self.set_state(BuildState::Failed {
                    checkpoint: self.checkpoint(None),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Resume a paused or failed session.
    pub async fn resume_build<C: CancelToken>(
        &self,
        cancel: &C,
    ) -> Result<BuildStatistics, BuildError> {
        if !self.state().can_resume() {
            return Err(BuildError::InvalidState(
                "nothing to resume; session is not paused or failed".to_string(),
            ));
        }

        self.build_index(false, cancel).await
    }

    /// Move the index into `write_only` and optionally wipe previous
    /// payload and progress.
    fn prepare(&self, clear_first: bool) -> Result<(), BuildError> {
        let mut txn = self.kv.begin()?;
        let states = self.layout.state_manager();

        if states.state(&self.index.name, &txn)? == IndexState::Disabled {
            states.enable(&self.index.name, &mut txn)?;
        }

        if clear_first {
            self.range_set().clear(&mut txn)?;
            let (begin, end) = self.layout.index(&self.index.name).range();
            txn.clear_range(&begin, &end);
        }

        txn.commit()?;
        Ok(())
    }

    fn finish(&self) -> Result<(), BuildError> {
        let mut txn = self.kv.begin()?;
        self.layout
            .state_manager()
            .make_readable(&self.index.name, &mut txn)?;
        txn.commit()?;
        Ok(())
    }

    async fn drain_missing_ranges<C: CancelToken>(&self, cancel: &C) -> Result<(), BuildError> {
        for record_type in &self.index.record_types {
            let records = self.layout.records_of(record_type);
            let (full_begin, full_end) = records.range();

            let missing = {
                let txn = self.kv.begin()?;
                self.range_set().missing_ranges(&txn, &full_begin, &full_end)?
            };

            for (begin, end) in missing {
                self.drain_range(record_type, begin, end, cancel).await?;
            }
        }

        Ok(())
    }

    async fn drain_range<C: CancelToken>(
        &self,
        record_type: &str,
        begin: Key,
        end: Key,
        cancel: &C,
    ) -> Result<(), BuildError> {
        let records = self.layout.records_of(record_type);
        let mut cursor = begin;

        while cursor < end {
            if cancel.is_cancelled() {
                info!(index = %self.index.name, "index build interrupted between batches");
                return Err(BuildError::Cancelled);
            }

            let (continuation, scanned) = self
                .run_batch_with_retries(record_type, &records, &cursor, &end)
                .await?;

            self.bump(scanned);
            debug!(
                index = %self.index.name,
                scanned,
                continuation = %hex::encode(&continuation),
                "batch committed"
            );

            cursor = continuation;

            if !self.config.throttle_delay.is_zero() {
                tokio::time::sleep(self.config.throttle_delay).await;
            }
        }

        Ok(())
    }

    async fn run_batch_with_retries(
        &self,
        record_type: &str,
        records: &taxis_core::Subspace,
        cursor: &Key,
        end: &Key,
    ) -> Result<(Key, u64), BuildError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.run_batch(record_type, records, cursor, end) {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        index = %self.index.name,
                        attempt,
                        ?delay,
                        error = %error,
                        "retrying batch after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) if error.is_retryable() => {
                    return Err(BuildError::RetriesExhausted {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// One transactional batch: stream records at snapshot isolation, scan
    /// them into the index, mark `[cursor, continuation)` complete.
    fn run_batch(
        &self,
        record_type: &str,
        records: &taxis_core::Subspace,
        cursor: &Key,
        end: &Key,
    ) -> Result<(Key, u64), IndexError> {
        let mut txn = self.kv.begin()?;
        txn.set_timeout(self.config.txn_timeout);

        let batch: Vec<_> = txn
            .get_range(
                &KeySelector::first_greater_or_equal(cursor.clone()),
                &KeySelector::first_greater_or_equal(end.clone()),
                RangeOptions::limited(self.config.batch_size).with_snapshot(),
            )?
            .collect::<Result<_, _>>()?;

        let mut scanned = 0u64;
        let mut last_key: Option<Key> = None;

        for (key, value) in &batch {
            let pk = records.unpack(key)?;
            let record = self.access.deserialize(record_type, value)?;

            self.maintainer
                .scan_record(&record, &pk, self.access.as_ref(), &mut txn)?;

            scanned += 1;
            last_key = Some(key.clone());
        }

        let continuation = match last_key {
            Some(last) if batch.len() == self.config.batch_size => key_after(&last),
            _ => end.clone(),
        };

        self.range_set().insert_range(&mut txn, cursor, &continuation)?;
        txn.commit()?;

        Ok((continuation, scanned))
    }

}
