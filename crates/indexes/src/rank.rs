//! Rank index: a range tree of bucket counts over score entries.
//!
//! Every record contributes one score entry `grouping ++ [score] ++ pk`.
//! Next to the entries, per grouping, live count nodes
//! `grouping ++ ["_count", level, rangeStart]` holding a little-endian i64
//! maintained by atomic add. Levels 1..=3 cover buckets of `b`, `b^2` and
//! `b^3` scores (default `b` = 100).
//!
//! Rank and total-count queries walk the tree from the coarsest level down,
//! so they read O(log n) keys; by-rank queries scan entries and cost
//! O(rank). Count-node updates and entry writes share the transaction of
//! the record write, so the tree cannot drift from the entries.

use std::collections::VecDeque;

use taxis_core::kvs::read_range;
use taxis_core::record::evaluate_entries;
use taxis_core::{
    Index, IndexError, IndexMaintainer, RangeOptions, RankOrder, Record, RecordAccess,
    Subspace, Transaction, Tuple, TupleElement,
};

/// Marker element that keeps count nodes apart from score entries within a
/// grouping. Strings sort below integers in the tuple encoding, so count
/// nodes cluster at the front of the grouping range.
const COUNT_MARKER: &str = "_count";

const LEVELS: i64 = 3;

pub const DEFAULT_BUCKET_SIZE: i64 = 100;

/// A score entry decoded back out of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub score: i64,
    pub pk: Tuple,
}

pub struct RankMaintainer {
    index: Index,
    subspace: Subspace,
    bucket_size: i64,
    order: RankOrder,
}

impl RankMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Result<Self, IndexError> {
        let bucket_size = index
            .options
            .bucket_size
            .map(|b| b as i64)
            .unwrap_or(DEFAULT_BUCKET_SIZE);

        if bucket_size < 2 {
            return Err(IndexError::invalid_argument(format!(
                "index {}: bucket size {bucket_size} is too small",
                index.name
            )));
        }

        if index.column_count() == 0 {
            return Err(IndexError::invalid_argument(format!(
                "index {}: rank indexes need at least a score column",
                index.name
            )));
        }

        let order = index.options.rank_order.unwrap_or_default();

        Ok(Self {
            index,
            subspace,
            bucket_size,
            order,
        })
    }

    pub fn order(&self) -> RankOrder {
        self.order
    }

    fn span(&self, level: i64) -> i64 {
        self.bucket_size.pow(level as u32)
    }

    /// Start of the level-`level` bucket containing `score`. Euclidean
    /// division keeps negative scores in stable buckets.
    fn bucket_start(&self, score: i64, level: i64) -> i64 {
        let span = self.span(level);
        score.div_euclid(span) * span
    }

    fn split_entry(&self, entry: &Tuple) -> Result<(Tuple, i64), IndexError> {
        let columns = self.index.column_count();

        match entry.get(columns - 1) {
            Some(TupleElement::Int(score)) => Ok((entry.prefix(columns - 1), *score)),
            other => Err(IndexError::invalid_argument(format!(
                "index {} ranks non-integer score {other:?}",
                self.index.name
            ))),
        }
    }

    fn entry_key(&self, grouping: &Tuple, score: i64, pk: &Tuple) -> Vec<u8> {
        self.subspace.pack(&grouping.clone().with(score).concat(pk))
    }

    fn count_key(&self, grouping: &Tuple, level: i64, range_start: i64) -> Vec<u8> {
        self.subspace.pack(
            &grouping
                .clone()
                .with(COUNT_MARKER)
                .with(level)
                .with(range_start),
        )
    }

    fn apply(
        &self,
        grouping: &Tuple,
        score: i64,
        pk: &Tuple,
        sign: i64,
        txn: &mut impl Transaction,
    ) {
        let key = self.entry_key(grouping, score, pk);
        if sign > 0 {
            txn.set(&key, &[]);
        } else {
            txn.clear(&key);
        }

        for level in 1..=LEVELS {
            let start = self.bucket_start(score, level);
            txn.atomic_add(&self.count_key(grouping, level, start), sign);
        }
    }

    /// Sum the count nodes of one level whose range starts fall within
    /// `[from, to)`; an unbounded side runs to the edge of the level.
    fn sum_nodes<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
        level: i64,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<i64, IndexError> {
        let level_space = self
            .subspace
            .subspace(&grouping.clone().with(COUNT_MARKER).with(level));
        let (level_begin, level_end) = level_space.range();

        let begin = match from {
            Some(from) => self.count_key(grouping, level, from),
            None => level_begin,
        };
        let end = match to {
            Some(to) => self.count_key(grouping, level, to),
            None => level_end,
        };

        let mut total = 0i64;
        for (_, value) in read_range(txn, &begin, &end, RangeOptions::default())? {
            let mut raw = [0u8; 8];
            let len = value.len().min(8);
            raw[..len].copy_from_slice(&value[..len]);
            total += i64::from_le_bytes(raw);
        }

        Ok(total)
    }

    /// Visit score entries of a grouping within `[begin, end)` in key
    /// order, in bounded batches. The visitor returns false to stop.
    fn scan_entries<T: Transaction>(
        &self,
        txn: &T,
        begin: Vec<u8>,
        end: Vec<u8>,
        mut visit: impl FnMut(ScoreEntry) -> bool,
    ) -> Result<(), IndexError> {
        const BATCH: usize = 1_000;
        let columns = self.index.column_count();
        let mut cursor = begin;

        loop {
            let batch = read_range(txn, &cursor, &end, RangeOptions::limited(BATCH))?;
            let drained = batch.len() < BATCH;

            for (key, _) in &batch {
                let tuple = self.subspace.unpack(key)?;

                // skip count nodes sharing the grouping range
                let score = match tuple.get(columns - 1) {
                    Some(TupleElement::Int(score)) => *score,
                    _ => continue,
                };

                let entry = ScoreEntry {
                    score,
                    pk: tuple.suffix(columns),
                };
                if !visit(entry) {
                    return Ok(());
                }
            }

            if drained {
                return Ok(());
            }

            if let Some((last, _)) = batch.last() {
                cursor = taxis_core::key_after(last);
            }
        }
    }

    fn grouping_range(&self, grouping: &Tuple) -> (Vec<u8>, Vec<u8>) {
        self.subspace.subspace(grouping).range()
    }

    /// Number of scores strictly better than `score` under this index's
    /// order. Reads O(log n) count nodes plus one partial bucket of
    /// entries.
    pub fn count_better<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
        score: i64,
    ) -> Result<i64, IndexError> {
        let mut total = 0i64;

        match self.order {
            RankOrder::Descending => {
                // whole buckets strictly above the score, coarse to fine
                let mut enclosing_end: Option<i64> = None;

                for level in (1..=LEVELS).rev() {
                    let bucket = self.bucket_start(score, level);
                    let from = bucket.checked_add(self.span(level));

                    if let Some(from) = from {
                        total +=
                            self.sum_nodes(txn, grouping, level, Some(from), enclosing_end)?;
                    }

                    enclosing_end = from;
                }

                // partial level-1 bucket: entries with score' > score
                let begin = self
                    .subspace
                    .subspace(&grouping.clone().with(score))
                    .range()
                    .1;
                let end = match self.bucket_start(score, 1).checked_add(self.span(1)) {
                    Some(bucket_end) => self.subspace.pack(&grouping.clone().with(bucket_end)),
                    None => self.grouping_range(grouping).1,
                };

                self.scan_entries(txn, begin, end, |_| {
                    total += 1;
                    true
                })?;
            }
            RankOrder::Ascending => {
                // whole buckets strictly below the score, coarse to fine
                let mut enclosing_start: Option<i64> = None;

                for level in (1..=LEVELS).rev() {
                    let bucket = self.bucket_start(score, level);
                    total +=
                        self.sum_nodes(txn, grouping, level, enclosing_start, Some(bucket))?;
                    enclosing_start = Some(bucket);
                }

                // partial level-1 bucket: entries with score' < score
                let begin = self
                    .subspace
                    .pack(&grouping.clone().with(self.bucket_start(score, 1)));
                let end = self.subspace.pack(&grouping.clone().with(score));

                self.scan_entries(txn, begin, end, |_| {
                    total += 1;
                    true
                })?;
            }
        }

        Ok(total)
    }

    /// `rank(score) = count_better(score) + 1`.
    pub fn rank_of<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
        score: i64,
    ) -> Result<u64, IndexError> {
        Ok(self.count_better(txn, grouping, score)? as u64 + 1)
    }

    /// Total number of entries under a grouping, from the level-1 count
    /// nodes.
    pub fn count<T: Transaction>(&self, txn: &T, grouping: &Tuple) -> Result<i64, IndexError> {
        self.sum_nodes(txn, grouping, 1, None, None)
    }

    /// Entries at ranks `start..=end` (1-based), best first.
    ///
    /// Ascending order streams forward with a rank counter; descending
    /// order keeps a deque bounded by `end` over the forward scan and
    /// slices it from the tail. Either way the cost is O(end).
    pub fn entries_by_rank<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
        start: u64,
        end: u64,
    ) -> Result<Vec<ScoreEntry>, IndexError> {
        if start == 0 || end < start {
            return Err(IndexError::invalid_argument(format!(
                "bad rank window {start}..={end}"
            )));
        }

        let (begin, scan_end) = self.grouping_range(grouping);
        let mut out = Vec::new();

        match self.order {
            RankOrder::Ascending => {
                let mut rank = 0u64;
                self.scan_entries(txn, begin, scan_end, |entry| {
                    rank += 1;
                    if rank >= start {
                        out.push(entry);
                    }
                    rank < end
                })?;
            }
            RankOrder::Descending => {
                let mut tail: VecDeque<ScoreEntry> = VecDeque::with_capacity(end as usize);
                self.scan_entries(txn, begin, scan_end, |entry| {
                    if tail.len() == end as usize {
                        tail.pop_front();
                    }
                    tail.push_back(entry);
                    true
                })?;

                out = tail
                    .into_iter()
                    .rev()
                    .skip(start as usize - 1)
                    .collect();
            }
        }

        Ok(out)
    }

    /// Entries with scores in `[min, max]`, in score order.
    pub fn entries_by_score<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
        min: i64,
        max: i64,
    ) -> Result<Vec<ScoreEntry>, IndexError> {
        if min > max {
            return Ok(Vec::new());
        }

        let begin = self.subspace.pack(&grouping.clone().with(min));
        let end = self.subspace.subspace(&grouping.clone().with(max)).range().1;

        let mut out = Vec::new();
        self.scan_entries(txn, begin, end, |entry| {
            out.push(entry);
            true
        })?;

        Ok(out)
    }

    fn update_for(
        &self,
        record_entries: &[Tuple],
        pk: &Tuple,
        sign: i64,
        txn: &mut impl Transaction,
    ) -> Result<(), IndexError> {
        for entry in record_entries {
            let (grouping, score) = self.split_entry(entry)?;
            self.apply(&grouping, score, pk, sign, txn);
        }
        Ok(())
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for RankMaintainer {
    fn index(&self) -> &Index {
        &self.index
    }

    fn update_index(
        &self,
        old: Option<&R>,
        new: Option<&R>,
        access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        if let Some(record) = old {
            let entries = evaluate_entries(access, record, &self.index.root_expression)?;
            self.update_for(&entries, &record.primary_key(), -1, txn)?;
        }

        if let Some(record) = new {
            let entries = evaluate_entries(access, record, &self.index.root_expression)?;
            self.update_for(&entries, &record.primary_key(), 1, txn)?;
        }

        Ok(())
    }
}
