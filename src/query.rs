//! Record-returning query surfaces over index primitives.
//!
//! Maintainers answer in index terms (scores, primary keys); these
//! wrappers resolve primary keys back to records through the store layout
//! and the caller's record access, probing each record type the index
//! declares, the same way the scrubber resolves entries.

use taxis_core::{
    Index, IndexError, IndexKind, Record, RecordAccess, StoreLayout, Transaction, Tuple,
};
use taxis_indexes::rank::ScoreEntry;
use taxis_indexes::RankMaintainer;

/// Load a record by primary key, trying each declared record type.
pub fn load_record<R: Record, T: Transaction>(
    layout: &StoreLayout,
    record_types: &[String],
    access: &dyn RecordAccess<R>,
    txn: &T,
    pk: &Tuple,
) -> Result<Option<R>, IndexError> {
    for record_type in record_types {
        if let Some(bytes) = txn.get(&layout.record_key(record_type, pk))? {
            return Ok(Some(access.deserialize(record_type, &bytes)?));
        }
    }
    Ok(None)
}

/// Leaderboard-style queries over one rank index.
pub struct RankQuery<'a, R: Record> {
    maintainer: RankMaintainer,
    layout: &'a StoreLayout,
    access: &'a dyn RecordAccess<R>,
    record_types: Vec<String>,
}

impl<'a, R: Record> RankQuery<'a, R> {
    pub fn new(
        index: &Index,
        layout: &'a StoreLayout,
        access: &'a dyn RecordAccess<R>,
    ) -> Result<Self, IndexError> {
        if index.kind != IndexKind::Rank {
            return Err(IndexError::invalid_argument(format!(
                "index {} is a {} index, not a rank index",
                index.name, index.kind
            )));
        }

        Ok(Self {
            maintainer: RankMaintainer::new(index.clone(), layout.index(&index.name))?,
            layout,
            access,
            record_types: index.record_types.clone(),
        })
    }

    fn load<T: Transaction>(&self, txn: &T, pk: &Tuple) -> Result<Option<R>, IndexError> {
        load_record(self.layout, &self.record_types, self.access, txn, pk)
    }

    fn load_all<T: Transaction>(
        &self,
        txn: &T,
        entries: Vec<ScoreEntry>,
    ) -> Result<Vec<R>, IndexError> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(record) = self.load(txn, &entry.pk)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// The record at 1-based `rank`, or None past the end.
    pub fn by_rank<T: Transaction>(
        &self,
        txn: &T,
        rank: u64,
        grouping: &Tuple,
    ) -> Result<Option<R>, IndexError> {
        let mut hits = self.maintainer.entries_by_rank(txn, grouping, rank, rank)?;

        match hits.pop() {
            Some(entry) => self.load(txn, &entry.pk),
            None => Ok(None),
        }
    }

    /// Records at ranks `start..=end`, best first.
    pub fn range<T: Transaction>(
        &self,
        txn: &T,
        start: u64,
        end: u64,
        grouping: &Tuple,
    ) -> Result<Vec<R>, IndexError> {
        let entries = self.maintainer.entries_by_rank(txn, grouping, start, end)?;
        self.load_all(txn, entries)
    }

    /// The best `n` records.
    pub fn top<T: Transaction>(
        &self,
        txn: &T,
        n: u64,
        grouping: &Tuple,
    ) -> Result<Vec<R>, IndexError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.range(txn, 1, n, grouping)
    }

    /// Rank a score would hold; O(log n) in the entry count.
    pub fn get_rank<T: Transaction>(
        &self,
        txn: &T,
        score: i64,
        grouping: &Tuple,
    ) -> Result<u64, IndexError> {
        self.maintainer.rank_of(txn, grouping, score)
    }

    /// Records with scores in `[min, max]`.
    pub fn by_score_range<T: Transaction>(
        &self,
        txn: &T,
        min: i64,
        max: i64,
        grouping: &Tuple,
    ) -> Result<Vec<R>, IndexError> {
        let entries = self.maintainer.entries_by_score(txn, grouping, min, max)?;
        self.load_all(txn, entries)
    }

    pub fn count<T: Transaction>(&self, txn: &T, grouping: &Tuple) -> Result<i64, IndexError> {
        self.maintainer.count(txn, grouping)
    }

    /// The score held at 1-based `rank`, or None past the end.
    pub fn score_at_rank<T: Transaction>(
        &self,
        txn: &T,
        rank: u64,
        grouping: &Tuple,
    ) -> Result<Option<i64>, IndexError> {
        let mut hits = self.maintainer.entries_by_rank(txn, grouping, rank, rank)?;
        Ok(hits.pop().map(|entry| entry.score))
    }
}
