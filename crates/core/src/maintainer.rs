//! The uniform contract every index kind implements.

use crate::index::Index;
use crate::kvs::Transaction;
use crate::record::{Record, RecordAccess};
use crate::tuple::Tuple;
use crate::IndexError;

/// Translates record transitions into index mutations.
///
/// Maintainers mutate only their own subspace, always inside the caller's
/// transaction, and never retry or swallow errors. The four transitions:
///
/// - `(None, None)`: no-op.
/// - `(None, Some)`: insert.
/// - `(Some, None)`: delete.
/// - `(Some, Some)`: update.
///
/// Implementations are held as boxed trait objects so one manager can
/// carry maintainers of different kinds side by side.
pub trait IndexMaintainer<R: Record, T: Transaction>: Send + Sync {
    fn index(&self) -> &Index;

    fn update_index(
        &self,
        old: Option<&R>,
        new: Option<&R>,
        access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError>;

    /// Treat `record` as freshly inserted; the backfill path.
    ///
    /// `pk` is passed by the scanner which already decoded it from the
    /// record key.
    fn scan_record(
        &self,
        record: &R,
        pk: &Tuple,
        access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        let _ = pk;
        self.update_index(None, Some(record), access, txn)
    }
}
