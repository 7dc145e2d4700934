//! Two-phase online construction of vector graphs.
//!
//! A graph insert walks the whole hierarchy, so bulk-loading through the
//! plain record scanner would blow the transaction budget on every call.
//! Instead the build splits into:
//!
//! - **Phase A, level assignment**: one pass over the records writing the
//!   flat vectors and the per-node level metadata. A handful of operations
//!   per record, so it runs at full batch size and resumes through the
//!   index's range set.
//! - **Phase B, graph construction**: walk levels from the top of the
//!   hierarchy down; at each level, wire every node whose assigned level
//!   reaches it. Each wiring call stays within a few thousand operations,
//!   so a small number of calls share one transaction under the commit
//!   budget.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taxis_core::{
    key_after, CancelToken, Index, IndexError, IndexKind, IndexState, Key, KeySelector,
    KvStore, RangeOptions, RangeSet, Record, RecordAccess, StoreLayout, Transaction, Tuple,
};
use taxis_indexes::HnswMaintainer;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{BuildError, BuildStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HnswBuildPhase {
    LevelAssignment,
    GraphConstruction { level: u8, total_levels: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HnswCheckpoint {
    pub phase: HnswBuildPhase,
    pub last_completed_key: Option<Key>,
    pub processed_records: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum HnswBuildState {
    #[default]
    NotStarted,
    Running(HnswBuildPhase),
    Completed,
    Paused(HnswCheckpoint),
    Failed {
        checkpoint: HnswCheckpoint,
        error: String,
    },
}

impl HnswBuildState {
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused(_) | Self::Failed { .. })
    }
}

/// Fractional progress published while a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HnswBuildProgress {
    pub phase_fraction: f64,
    pub phase: Option<HnswBuildPhase>,
}

#[derive(Debug, Clone, Copy)]
pub struct HnswBuilderConfig {
    /// Records per transaction during level assignment.
    pub assignment_batch_size: usize,
    /// Wiring calls per transaction during graph construction.
    pub constructions_per_txn: usize,
    pub txn_timeout: Duration,
    pub throttle_delay: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for HnswBuilderConfig {
    fn default() -> Self {
        Self {
            assignment_batch_size: 100,
            constructions_per_txn: 2,
            txn_timeout: Duration::from_secs(4),
            throttle_delay: Duration::from_millis(10),
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Service-layer state machine building one vector index.
pub struct HnswIndexBuilder<R: Record, K: KvStore> {
    kv: K,
    layout: StoreLayout,
    index: Index,
    maintainer: HnswMaintainer,
    access: Arc<dyn RecordAccess<R>>,
    config: HnswBuilderConfig,
    state: Arc<Mutex<HnswBuildState>>,
    processed: Arc<Mutex<u64>>,
    progress_tx: watch::Sender<HnswBuildProgress>,
}

impl<R: Record, K: KvStore> HnswIndexBuilder<R, K> {
    pub fn new(
        kv: K,
        layout: StoreLayout,
        index: Index,
        access: Arc<dyn RecordAccess<R>>,
        config: HnswBuilderConfig,
    ) -> Result<Self, IndexError> {
        if index.kind != IndexKind::Vector {
            return Err(IndexError::invalid_argument(format!(
                "index {} is a {} index, not a vector index",
                index.name, index.kind
            )));
        }

        let maintainer = HnswMaintainer::new(index.clone(), layout.index(&index.name));
        let (progress_tx, _) = watch::channel(HnswBuildProgress::default());

        Ok(Self {
            kv,
            layout,
            index,
            maintainer,
            access,
            config,
            state: Arc::new(Mutex::new(HnswBuildState::NotStarted)),
            processed: Arc::new(Mutex::new(0)),
            progress_tx,
        })
    }

    pub fn get_state(&self) -> HnswBuildState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: HnswBuildState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Live progress updates; the receiver sees the latest value.
    pub fn subscribe_progress(&self) -> watch::Receiver<HnswBuildProgress> {
        self.progress_tx.subscribe()
    }

    fn publish(&self, phase: HnswBuildPhase, fraction: f64) {
        let _ = self.progress_tx.send(HnswBuildProgress {
            phase: Some(phase),
            phase_fraction: fraction.clamp(0.0, 1.0),
        });
    }

    fn processed(&self) -> u64 {
        *self.processed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, count: u64) {
        *self.processed.lock().unwrap_or_else(|e| e.into_inner()) += count;
    }

    fn checkpoint(&self, phase: HnswBuildPhase, last: Option<Key>) -> HnswCheckpoint {
        HnswCheckpoint {
            phase,
            last_completed_key: last,
            processed_records: self.processed(),
        }
    }

    fn range_set(&self) -> RangeSet {
        self.layout.build_range_set(&self.index.name)
    }

    /// Abandon the session and clear its progress markers.
    pub fn cancel(&self) -> Result<(), BuildError> {
        let mut txn = self.kv.begin()?;
        self.range_set().clear(&mut txn)?;
        txn.commit()?;

        self.set_state(HnswBuildState::NotStarted);
        Ok(())
    }

    /// Run both phases to completion.
    pub async fn build<C: CancelToken>(
        &self,
        clear_first: bool,
        cancel: &C,
    ) -> Result<BuildStatistics, BuildError> {
        let started = Instant::now();
        let mut batches = 0u64;

        // fresh sessions start their counters over
        if !self.get_state().can_resume() {
            *self.processed.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        }

        self.prepare(clear_first)?;

        self.set_state(HnswBuildState::Running(HnswBuildPhase::LevelAssignment));
        batches += self.run_level_assignment(cancel).await.map_err(|e| {
            self.fail(HnswBuildPhase::LevelAssignment, &e);
            e
        })?;

        batches += self.run_graph_construction(cancel).await.map_err(|e| {
            self.fail(
                HnswBuildPhase::GraphConstruction {
                    level: 0,
                    total_levels: 0,
                },
                &e,
            );
            e
        })?;

        let mut txn = self.kv.begin()?;
        self.layout
            .state_manager()
            .make_readable(&self.index.name, &mut txn)?;
        txn.commit()?;

        self.set_state(HnswBuildState::Completed);
        info!(index = %self.index.name, "hnsw build complete");

        Ok(BuildStatistics {
            records_scanned: self.processed(),
            batches,
            elapsed: started.elapsed(),
        })
    }

    /// Resume a paused or failed session from its checkpoint.
    ///
    /// Level assignment resumes through the range set; an interrupted
    /// construction level restarts from its beginning, which is safe
    /// because wiring is idempotent per node.
    pub async fn resume<C: CancelToken>(
        &self,
        checkpoint: &HnswCheckpoint,
        cancel: &C,
    ) -> Result<BuildStatistics, BuildError> {
        debug!(index = %self.index.name, phase = ?checkpoint.phase, "resuming hnsw build");
        self.build(false, cancel).await
    }

    fn fail(&self, phase: HnswBuildPhase, error: &BuildError) {
        if matches!(error, BuildError::Cancelled) {
            self.set_state(HnswBuildState::Paused(self.checkpoint(phase, None)));
        } else {
            self.set_state(HnswBuildState::Failed {
                checkpoint: self.checkpoint(phase, None),
                error: error.to_string(),
            });
        }
    }

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

    /// Phase A: write vectors and level metadata, full batch size.
    async fn run_level_assignment<C: CancelToken>(
        &self,
        cancel: &C,
    ) -> Result<u64, BuildError> {
        let mut batches = 0u64;

        for record_type in &self.index.record_types {
            let records = self.layout.records_of(record_type);
            let (full_begin, full_end) = records.range();

            let missing = {
                let txn = self.kv.begin()?;
                self.range_set().missing_ranges(&txn, &full_begin, &full_end)?
            };

            for (mut cursor, end) in missing {
                while cursor < end {
                    if cancel.is_cancelled() {
                        return Err(BuildError::Cancelled);
                    }

                    let (continuation, scanned) = self
                        .retrying(|| self.assignment_batch(record_type, &cursor, &end))
                        .await?;

                    self.bump(scanned);
                    batches += 1;
                    cursor = continuation;

                    if !self.config.throttle_delay.is_zero() {
                        tokio::time::sleep(self.config.throttle_delay).await;
                    }
                }
            }
        }

        Ok(batches)
    }

    fn assignment_batch(
        &self,
        record_type: &str,
        cursor: &Key,
        end: &Key,
    ) -> Result<(Key, u64), IndexError> {
        let records = self.layout.records_of(record_type);

        let mut txn = self.kv.begin()?;
        txn.set_timeout(self.config.txn_timeout);

        let batch: Vec<_> = txn
            .get_range(
                &KeySelector::first_greater_or_equal(cursor.clone()),
                &KeySelector::first_greater_or_equal(end.clone()),
                RangeOptions::limited(self.config.assignment_batch_size).with_snapshot(),
            )?
            .collect::<Result<_, _>>()?;

        let mut scanned = 0u64;
        let mut last_key = None;

        for (key, value) in &batch {
            let record = self.access.deserialize(record_type, value)?;
            let pk = records.unpack(key)?;

            let vector = self.maintainer.vector_of(self.access.as_ref(), &record)?;
            self.maintainer.write_vector(&mut txn, &pk, &vector);
            self.maintainer.assign_level_meta(&mut txn, &pk)?;

            scanned += 1;
            last_key = Some(key.clone());
        }

        let continuation = match last_key {
            Some(last) if batch.len() == self.config.assignment_batch_size => key_after(&last),
            _ => end.clone(),
        };

        self.range_set().insert_range(&mut txn, cursor, &continuation)?;
        txn.commit()?;

        Ok((continuation, scanned))
    }

    /// Phase B: wire nodes level by level, from the top of the hierarchy.
    async fn run_graph_construction<C: CancelToken>(
        &self,
        cancel: &C,
    ) -> Result<u64, BuildError> {
        let total_levels = self.max_assigned_level()?;
        let mut batches = 0u64;

        let mut level = total_levels;
        loop {
            let phase = HnswBuildPhase::GraphConstruction {
                level,
                total_levels,
            };
            self.set_state(HnswBuildState::Running(phase));

            batches += self.wire_level(level, total_levels, cancel).await?;

            if level == 0 {
                break;
            }
            level -= 1;
        }

        Ok(batches)
    }

    fn max_assigned_level(&self) -> Result<u8, BuildError> {
        let txn = self.kv.begin()?;
        let nodes = self.maintainer.nodes_subspace().clone();
        let (mut cursor, end) = nodes.range();

        let mut max_level = 0u8;
        loop {
            let batch: Vec<_> = txn
                .get_range(
                    &KeySelector::first_greater_or_equal(cursor.clone()),
                    &KeySelector::first_greater_or_equal(end.clone()),
                    RangeOptions::limited(1_000).with_snapshot(),
                )?
                .collect::<Result<_, _>>()
                .map_err(IndexError::from)?;

            for (key, value) in &batch {
                let (_, level) = self.maintainer.decode_node(key, value)?;
                max_level = max_level.max(level);
            }

            match batch.last() {
                Some((last, _)) if batch.len() == 1_000 => cursor = key_after(last),
                _ => break,
            }
        }

        Ok(max_level)
    }

    async fn wire_level<C: CancelToken>(
        &self,
        level: u8,
        total_levels: u8,
        cancel: &C,
    ) -> Result<u64, BuildError> {
        let nodes = self.maintainer.nodes_subspace().clone();
        let (mut cursor, end) = nodes.range();

        let mut batches = 0u64;
        let mut wired = 0u64;
        let mut seen = 0u64;

        while cursor < end {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }

            // collect the next few nodes assigned to this level or above
            let page: Vec<(Key, Tuple)> = {
                let txn = self.kv.begin()?;
                let batch: Vec<_> = txn
                    .get_range(
                        &KeySelector::first_greater_or_equal(cursor.clone()),
                        &KeySelector::first_greater_or_equal(end.clone()),
                        RangeOptions::limited(200).with_snapshot(),
                    )?
                    .collect::<Result<_, _>>()
                    .map_err(IndexError::from)?;

                if batch.is_empty() {
                    break;
                }

                cursor = match batch.last() {
                    Some((last, _)) => key_after(last),
                    None => end.clone(),
                };
                seen += batch.len() as u64;

                let mut page = Vec::new();
                for (key, value) in &batch {
                    let (pk, node_level) = self.maintainer.decode_node(key, value)?;
                    if node_level >= level {
                        page.push((key.clone(), pk));
                    }
                }
                page
            };

            for chunk in page.chunks(self.config.constructions_per_txn.max(1)) {
                self.retrying(|| self.wire_chunk(chunk, level)).await?;
                batches += 1;
                wired += chunk.len() as u64;

                if !self.config.throttle_delay.is_zero() {
                    tokio::time::sleep(self.config.throttle_delay).await;
                }
            }

            let done = total_levels as f64 - level as f64;
            let within = if seen == 0 { 0.0 } else { wired as f64 / seen as f64 };
            self.publish(
                HnswBuildPhase::GraphConstruction {
                    level,
                    total_levels,
                },
                (done + within.min(1.0)) / (total_levels as f64 + 1.0),
            );
        }

        debug!(index = %self.index.name, level, wired, "graph level wired");
        Ok(batches)
    }

    fn wire_chunk(&self, chunk: &[(Key, Tuple)], level: u8) -> Result<(), IndexError> {
        let mut txn = self.kv.begin()?;
        txn.set_timeout(self.config.txn_timeout);

        for (_, pk) in chunk {
            let Some(vector) = self.maintainer.vector(&txn, pk)? else {
                warn!(index = %self.index.name, pk = %pk, "node has no vector, skipping");
                continue;
            };

            self.maintainer.insert_at_level(&mut txn, pk, &vector, level)?;
        }

        txn.commit()?;
        Ok(())
    }

    async fn retrying<F, O>(&self, mut operation: F) -> Result<O, BuildError>
    where
        F: FnMut() -> Result<O, IndexError>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation() {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.pow(attempt - 1);
                    warn!(
                        index = %self.index.name,
                        attempt,
                        ?delay,
                        error = %error,
                        "retrying after transient error"
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
}
