//! The contract the layer demands from its key/value store.
//!
//! The KVS is external: ordered keys, serializable transactions, atomic
//! mutations and commit-time versionstamps. The layer never assumes more
//! than this trait surface, and every error the store raises is surfaced
//! through [`KvsError`] unchanged so that callers can tell a retryable
//! conflict from a corrupt key.
//!
//! Range reads hand back a finite iterator over the requested window. The
//! iterator is not restartable; long scans break out at a batch boundary
//! and reissue a new range read from the last seen key.

use std::time::Duration;

use crate::subspace::KeySelector;
use crate::tuple::Versionstamp;
use crate::{Key, Value};

#[derive(Debug, thiserror::Error)]
pub enum KvsError {
    /// The mutation set exceeded the commit byte budget.
    #[error("transaction exceeds size limit ({size} > {limit} bytes)")]
    TransactionTooLarge { size: usize, limit: usize },

    /// The transaction outlived its deadline.
    #[error("transaction timed out after {0:?}")]
    TransactionTimedOut(Duration),

    /// Conflict or other transient condition; safe to retry in a fresh
    /// transaction.
    #[error("retryable transaction error: {0}")]
    Retryable(String),

    /// A versionstamped mutation carried a malformed offset trailer.
    #[error("invalid versionstamp offset in key {}", hex::encode(.0))]
    InvalidVersionstampOffset(Key),

    #[error("store error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl KvsError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        KvsError::Internal(value.into())
    }

    /// Whether a fresh transaction may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvsError::Retryable(_) | KvsError::TransactionTimedOut(_)
        )
    }

    /// Whether the failure is the size class that the scrubber's skip
    /// protocol handles.
    pub fn is_size_class(&self) -> bool {
        matches!(self, KvsError::TransactionTooLarge { .. })
    }
}

/// Options for a range read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Stop after this many entries.
    pub limit: Option<usize>,
    /// Iterate from the end of the range backwards.
    pub reverse: bool,
    /// Read at the transaction's snapshot, ignoring its own writes.
    pub snapshot: bool,
}

impl RangeOptions {
    pub fn limited(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn reversed() -> Self {
        Self {
            reverse: true,
            ..Self::default()
        }
    }

    pub fn with_snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One transaction against the KVS.
///
/// Writes are buffered until `commit`, which applies them atomically and
/// yields the commit versionstamp. Dropping a transaction without
/// committing discards it.
pub trait Transaction: Send {
    type Range: Iterator<Item = Result<(Key, Value), KvsError>> + Send;

    fn get(&self, key: &[u8]) -> Result<Option<Value>, KvsError>;

    /// Resolve a key selector to an existing key, if any.
    fn get_key(&self, selector: &KeySelector) -> Result<Option<Key>, KvsError>;

    /// Read the half-open range `[begin, end)` resolved from selectors.
    fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        options: RangeOptions,
    ) -> Result<Self::Range, KvsError>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, begin: &[u8], end: &[u8]);

    /// Atomically add a little-endian i64 operand to the existing value
    /// (missing value counts as zero; a resulting zero is kept, not
    /// collapsed to a clear).
    fn atomic_add(&mut self, key: &[u8], delta: i64);

    /// Register a mutation whose key carries a 10-byte 0xFF placeholder at
    /// the offset named by the key's 4-byte little-endian trailer. The
    /// store substitutes its native versionstamp at commit and drops the
    /// trailer.
    fn set_versionstamped_key(&mut self, key_with_offset: &[u8], value: &[u8]);

    /// Explicit deadline for this transaction; reads and commit fail with
    /// [`KvsError::TransactionTimedOut`] once exceeded.
    fn set_timeout(&mut self, timeout: Duration);

    /// Approximate size in bytes of the buffered mutation set.
    fn mutation_bytes(&self) -> usize;

    fn commit(self) -> Result<Versionstamp, KvsError>;
}

/// Handle to the KVS able to mint transactions.
pub trait KvStore: Clone + Send + Sync + 'static {
    type Txn: Transaction;

    fn begin(&self) -> Result<Self::Txn, KvsError>;
}

/// Convenience: read a full range in one bounded gulp.
pub fn read_range<T: Transaction>(
    txn: &T,
    begin: &[u8],
    end: &[u8],
    options: RangeOptions,
) -> Result<Vec<(Key, Value)>, KvsError> {
    txn.get_range(
        &KeySelector::first_greater_or_equal(begin.to_vec()),
        &KeySelector::first_greater_or_equal(end.to_vec()),
        options,
    )?
    .collect()
}
