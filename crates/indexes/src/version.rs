//! Version index: a versionstamped history per primary key.
//!
//! Every insert appends `subspace ++ pack(pk ++ [versionstamp])` through a
//! versionstamped mutation, so the store itself assigns the 10-byte commit
//! stamp. The value holds the little-endian wall-clock milliseconds of the
//! write, which retention uses to age entries out. The set of versions for
//! one primary key is totally ordered by the stamp; optimistic concurrency
//! compares the newest stamp against the caller's expectation.

use std::time::{SystemTime, UNIX_EPOCH};

use taxis_core::{
    Index, IndexError, IndexMaintainer, KeySelector, RangeOptions, Record, RecordAccess,
    RetentionPolicy, Subspace, Transaction, Tuple, TupleElement, Versionstamp,
};

use taxis_core::kvs::read_range;

pub struct VersionMaintainer {
    index: Index,
    subspace: Subspace,
    retention: RetentionPolicy,
}

/// One stored version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry {
    pub stamp: Versionstamp,
    /// Wall-clock milliseconds stored with the write; 0 for entries written
    /// before timestamps were introduced.
    pub timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_timestamp(value: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let len = value.len().min(8);
    raw[..len].copy_from_slice(&value[..len]);
    u64::from_le_bytes(raw)
}

impl VersionMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        let retention = index.options.retention.unwrap_or_default();
        Self {
            index,
            subspace,
            retention,
        }
    }

    fn pk_space(&self, pk: &Tuple) -> Subspace {
        self.subspace.subspace(pk)
    }

    fn decode_version(&self, pk: &Tuple, key: &[u8], value: &[u8]) -> Result<VersionEntry, IndexError> {
        let suffix = self.pk_space(pk).unpack(key)?;

        match suffix.get(0) {
            Some(TupleElement::Versionstamp(stamp)) => Ok(VersionEntry {
                stamp: *stamp,
                timestamp_ms: decode_timestamp(value),
            }),
            other => Err(IndexError::internal(format!(
                "index {} holds a non-versionstamp element {other:?}",
                self.index.name
            ))),
        }
    }

    /// Append a version key for `pk`; the store completes the stamp at
    /// commit.
    fn append_version(&self, pk: &Tuple, txn: &mut impl Transaction) -> Result<(), IndexError> {
        let tuple = pk.clone().with(Versionstamp::incomplete());
        let key = self.subspace.pack_with_versionstamp(&tuple)?;
        txn.set_versionstamped_key(&key, &now_ms().to_le_bytes());
        Ok(())
    }

    /// All stored versions for `pk`, oldest first.
    pub fn versions<T: Transaction>(
        &self,
        txn: &T,
        pk: &Tuple,
    ) -> Result<Vec<VersionEntry>, IndexError> {
        let (begin, end) = self.pk_space(pk).range();

        read_range(txn, &begin, &end, RangeOptions::default())?
            .iter()
            .map(|(key, value)| self.decode_version(pk, key, value))
            .collect()
    }

    /// The newest version for `pk`, resolved with one boundary read: the
    /// last key below the end of the pk range, which must still carry the
    /// pk prefix.
    pub fn current_version<T: Transaction>(
        &self,
        txn: &T,
        pk: &Tuple,
    ) -> Result<Option<VersionEntry>, IndexError> {
        let scope = self.pk_space(pk);
        let (begin, end) = scope.range();

        let Some(key) = txn.get_key(&KeySelector::last_less_than(end))? else {
            return Ok(None);
        };

        if key < begin || !scope.contains(&key) {
            return Ok(None);
        }

        let value = txn.get(&key)?.unwrap_or_default();
        Ok(Some(self.decode_version(pk, &key, &value)?))
    }

    /// Optimistic concurrency check: fail unless the newest stored version
    /// matches `expected`.
    pub fn check_version<T: Transaction>(
        &self,
        txn: &T,
        pk: &Tuple,
        expected: Versionstamp,
    ) -> Result<(), IndexError> {
        match self.current_version(txn, pk)? {
            None => Err(IndexError::VersionNotFound(expected)),
            Some(entry) if entry.stamp == expected => Ok(()),
            Some(entry) => Err(IndexError::VersionMismatch {
                expected,
                actual: entry.stamp,
            }),
        }
    }

    /// Apply the retention policy for `pk` as of `now_ms`.
    ///
    /// Runs inside the insert's transaction; `pending_insert` says whether
    /// this transaction has already appended a version that is invisible
    /// until commit. A history is never pruned to nothing: with no pending
    /// insert the most recent stored version always survives.
    pub fn apply_retention<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
        now_ms: u64,
        pending_insert: bool,
    ) -> Result<(), IndexError> {
        let versions = self.versions(txn, pk)?;
        if versions.is_empty() {
            return Ok(());
        }

        let doomed: Vec<&VersionEntry> = match self.retention {
            RetentionPolicy::KeepAll => Vec::new(),
            RetentionPolicy::KeepLast(keep) => {
                // the in-flight version occupies one retention slot
                let keep = if pending_insert {
                    keep.max(1) - 1
                } else {
                    keep.max(1)
                };

                if versions.len() > keep {
                    versions[..versions.len() - keep].iter().collect()
                } else {
                    Vec::new()
                }
            }
            RetentionPolicy::KeepForMillis(window) => {
                let cutoff = now_ms.saturating_sub(window);
                let protected = if pending_insert { 0 } else { 1 };
                versions[..versions.len() - protected]
                    .iter()
                    .filter(|entry| entry.timestamp_ms < cutoff)
                    .collect()
            }
        };

        let scope = self.pk_space(pk);
        for entry in doomed {
            txn.clear(&scope.pack(&Tuple::single(entry.stamp)));
        }

        Ok(())
    }

    fn clear_all(&self, pk: &Tuple, txn: &mut impl Transaction) {
        let (begin, end) = self.pk_space(pk).range();
        txn.clear_range(&begin, &end);
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for VersionMaintainer {
    fn index(&self) -> &Index {
        &self.index
    }

    fn update_index(
        &self,
        old: Option<&R>,
        new: Option<&R>,
        _access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        match (old, new) {
            (None, None) => Ok(()),
            (_, Some(record)) => {
                let pk = record.primary_key();
                self.append_version(&pk, txn)?;
                self.apply_retention(txn, &pk, now_ms(), true)
            }
            (Some(record), None) => {
                self.clear_all(&record.primary_key(), txn);
                Ok(())
            }
        }
    }
}
