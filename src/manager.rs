//! Fan-out of record transitions to the applicable maintainers.

use taxis_core::{
    Index, IndexError, IndexMaintainer, Record, RecordAccess, StoreLayout, Transaction, Tuple,
};
use taxis_indexes::build_maintainer;
use tracing::debug;

/// Holds the maintainers of one record store and routes record
/// transitions to those that apply.
///
/// Maintainers of different kinds live behind one trait object each; the
/// manager filters them by record type and current index state before
/// dispatching. A disabled index receives no maintenance at all; a
/// write-only index is maintained but not query-visible.
pub struct IndexManager<R: Record, T: Transaction> {
    layout: StoreLayout,
    maintainers: Vec<Box<dyn IndexMaintainer<R, T>>>,
}

impl<R: Record, T: Transaction> IndexManager<R, T> {
    pub fn new(layout: StoreLayout, indexes: Vec<Index>) -> Result<Self, IndexError> {
        let maintainers = indexes
            .iter()
            .map(|index| build_maintainer(index, &layout))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            layout,
            maintainers,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn indexes(&self) -> impl Iterator<Item = &Index> {
        self.maintainers.iter().map(|m| m.index())
    }

    pub fn index_named(&self, name: &str) -> Result<&Index, IndexError> {
        self.indexes()
            .find(|index| index.name == name)
            .ok_or_else(|| IndexError::IndexNotFound(name.to_string()))
    }

    /// Apply a record transition to every applicable, maintained index,
    /// inside the caller's transaction.
    pub fn update(
        &self,
        old: Option<&R>,
        new: Option<&R>,
        access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        let record_type = match (old, new) {
            (_, Some(record)) | (Some(record), None) => record.record_type(),
            (None, None) => return Ok(()),
        };

        let states = self.layout.state_manager();

        for maintainer in &self.maintainers {
            let index = maintainer.index();

            if !index.applies_to(record_type) {
                continue;
            }

            if !states.state(&index.name, txn)?.is_maintained() {
                debug!(index = %index.name, "skipping disabled index");
                continue;
            }

            maintainer.update_index(old, new, access, txn)?;
        }

        Ok(())
    }

    /// Backfill entry point used by the online indexer: treat one stored
    /// record as inserted for a single index.
    pub fn scan_record_into(
        &self,
        index_name: &str,
        record: &R,
        pk: &Tuple,
        access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        let maintainer = self
            .maintainers
            .iter()
            .find(|m| m.index().name == index_name)
            .ok_or_else(|| IndexError::IndexNotFound(index_name.to_string()))?;

        maintainer.scan_record(record, pk, access, txn)
    }
}
