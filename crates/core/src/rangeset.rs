//! Persistent set of completed half-open byte ranges.
//!
//! Long-running scans (online build, scrubbing) record the ranges they have
//! finished so a later session can pick up where the last one stopped.
//! Each entry is one KVS pair: `subspace ++ rangeStart -> rangeEnd`.
//! Inserts coalesce overlapping and adjacent entries, so the set stays
//! proportional to the number of interruptions, not the number of batches.

use crate::kvs::{read_range, KvsError, RangeOptions, Transaction};
use crate::subspace::{KeySelector, Subspace};
use crate::{key_after, ByteRange, Key};

#[derive(Debug, Clone)]
pub struct RangeSet {
    subspace: Subspace,
}

impl RangeSet {
    pub fn new(subspace: Subspace) -> Self {
        Self { subspace }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    fn decode_entry(&self, key: &[u8], value: &[u8]) -> (Key, Key) {
        (key[self.subspace.prefix().len()..].to_vec(), value.to_vec())
    }

    /// The completed entry starting at or before `key`, if any.
    fn predecessor<T: Transaction>(
        &self,
        txn: &T,
        key: &[u8],
    ) -> Result<Option<(Key, Key)>, KvsError> {
        let (subspace_begin, _) = self.subspace.range();
        let upper = key_after(&self.subspace.key(key));

        let mut hits = txn.get_range(
            &KeySelector::first_greater_or_equal(subspace_begin),
            &KeySelector::first_greater_or_equal(upper),
            RangeOptions::reversed().with_limit(1),
        )?;

        match hits.next().transpose()? {
            Some((entry_key, entry_value)) => {
                Ok(Some(self.decode_entry(&entry_key, &entry_value)))
            }
            None => Ok(None),
        }
    }

    /// Mark `[begin, end)` complete. Returns false when the range was
    /// already fully covered.
    pub fn insert_range<T: Transaction>(
        &self,
        txn: &mut T,
        begin: &[u8],
        end: &[u8],
    ) -> Result<bool, KvsError> {
        if begin >= end {
            return Ok(false);
        }

        let mut merged_begin = begin.to_vec();
        let mut merged_end = end.to_vec();

        if let Some((entry_begin, entry_end)) = self.predecessor(txn, begin)? {
            if entry_end.as_slice() >= end {
                return Ok(false);
            }

            // overlap or adjacency on the left: absorb the predecessor
            if entry_end.as_slice() >= begin {
                merged_begin = entry_begin.clone();
                merged_end = merged_end.max(entry_end);
                txn.clear(&self.subspace.key(&entry_begin));
            }
        }

        // absorb every entry starting inside (begin, end]
        let overlapping = read_range(
            txn,
            &key_after(&self.subspace.key(begin)),
            &key_after(&self.subspace.key(end)),
            RangeOptions::default(),
        )?;

        for (entry_key, entry_value) in overlapping {
            let (entry_begin, entry_end) = self.decode_entry(&entry_key, &entry_value);
            merged_end = merged_end.max(entry_end);
            txn.clear(&self.subspace.key(&entry_begin));
        }

        txn.set(&self.subspace.key(&merged_begin), &merged_end);
        Ok(true)
    }

    /// Whether `[begin, end)` is already fully covered.
    pub fn contains_range<T: Transaction>(
        &self,
        txn: &T,
        begin: &[u8],
        end: &[u8],
    ) -> Result<bool, KvsError> {
        if begin >= end {
            return Ok(true);
        }

        match self.predecessor(txn, begin)? {
            Some((_, entry_end)) => Ok(entry_end.as_slice() >= end),
            None => Ok(false),
        }
    }

    fn entries<T: Transaction>(&self, txn: &T) -> Result<Vec<(Key, Key)>, KvsError> {
        let (begin, end) = self.subspace.range();
        let raw = read_range(txn, &begin, &end, RangeOptions::default())?;

        Ok(raw
            .iter()
            .map(|(k, v)| self.decode_entry(k, v))
            .collect())
    }

    /// The complement of the completed set within `[full_begin, full_end)`,
    /// in ascending order.
    pub fn missing_ranges<T: Transaction>(
        &self,
        txn: &T,
        full_begin: &[u8],
        full_end: &[u8],
    ) -> Result<Vec<ByteRange>, KvsError> {
        let mut gaps = Vec::new();
        let mut cursor = full_begin.to_vec();

        for (entry_begin, entry_end) in self.entries(txn)? {
            if cursor.as_slice() >= full_end {
                break;
            }

            if entry_end.as_slice() <= cursor.as_slice() {
                continue;
            }

            if entry_begin.as_slice() > cursor.as_slice() {
                let gap_end = entry_begin.min(full_end.to_vec());
                gaps.push((cursor.clone(), gap_end));
            }

            cursor = cursor.max(entry_end);
        }

        if cursor.as_slice() < full_end {
            gaps.push((cursor, full_end.to_vec()));
        }

        Ok(gaps)
    }

    /// Rough fraction of `[full_begin, full_end)` already completed.
    ///
    /// Keys are projected to numbers by the 8 bytes following the common
    /// prefix of the bounds, which is plenty for a progress gauge.
    pub fn get_progress<T: Transaction>(
        &self,
        txn: &T,
        full_begin: &[u8],
        full_end: &[u8],
    ) -> Result<f64, KvsError> {
        let lo = key_position(full_begin, full_begin, full_end);
        let hi = key_position(full_end, full_begin, full_end);

        if hi <= lo {
            return Ok(1.0);
        }

        let mut covered = 0.0;
        for (entry_begin, entry_end) in self.entries(txn)? {
            let b = key_position(&entry_begin, full_begin, full_end).clamp(lo, hi);
            let e = key_position(&entry_end, full_begin, full_end).clamp(lo, hi);
            covered += (e - b).max(0.0);
        }

        Ok((covered / (hi - lo)).clamp(0.0, 1.0))
    }

    /// Drop every completed entry.
    pub fn clear<T: Transaction>(&self, txn: &mut T) -> Result<(), KvsError> {
        let (begin, end) = self.subspace.range();
        txn.clear_range(&begin, &end);
        Ok(())
    }
}

fn key_position(key: &[u8], lo: &[u8], hi: &[u8]) -> f64 {
    let common = lo
        .iter()
        .zip(hi.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut window = [0u8; 8];
    for (i, byte) in key.iter().skip(common).take(8).enumerate() {
        window[i] = *byte;
    }

    u64::from_be_bytes(window) as f64
}
