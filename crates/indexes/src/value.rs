//! The plain value index: one key per (projected values, primary key).
//!
//! Key layout: `subspace ++ pack(values ++ pk)` with an empty value. Point
//! and range lookups against it are ordinary range reads over a values
//! prefix; the primary key always trails the projected values so equal
//! values stay unique per record.

use taxis_core::kvs::read_range;
use taxis_core::record::evaluate_entries;
use taxis_core::{
    Index, IndexError, IndexMaintainer, Key, RangeOptions, Record, RecordAccess, Subspace,
    Transaction, Tuple,
};

#[derive(Debug)]
pub struct ValueMaintainer {
    index: Index,
    subspace: Subspace,
}

impl ValueMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        Self { index, subspace }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    /// All index keys this record currently projects to.
    pub fn keys_for<R: Record>(
        &self,
        access: &dyn RecordAccess<R>,
        record: &R,
    ) -> Result<Vec<Key>, IndexError> {
        let pk = record.primary_key();
        let entries = evaluate_entries(access, record, &self.index.root_expression)?;

        Ok(entries
            .into_iter()
            .map(|entry| self.subspace.pack(&entry.concat(&pk)))
            .collect())
    }

    /// Scan entries under a values prefix, decoded into (values, pk).
    pub fn scan<T: Transaction>(
        &self,
        txn: &T,
        prefix: &Tuple,
        options: RangeOptions,
    ) -> Result<Vec<(Tuple, Tuple)>, IndexError> {
        let scope = self.subspace.subspace(prefix);
        let (begin, end) = scope.range();

        let columns = self.index.column_count();
        let mut out = Vec::new();

        for (key, _) in read_range(txn, &begin, &end, options)? {
            let tuple = self.subspace.unpack(&key)?;
            out.push((tuple.prefix(columns), tuple.suffix(columns)));
        }

        Ok(out)
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for ValueMaintainer {
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
        if old.is_none() && new.is_none() {
            return Ok(());
        }

        let old_keys = match old {
            Some(record) => self.keys_for(access, record)?,
            None => Vec::new(),
        };
        let new_keys = match new {
            Some(record) => self.keys_for(access, record)?,
            None => Vec::new(),
        };

        for key in &old_keys {
            if !new_keys.contains(key) {
                txn.clear(key);
            }
        }

        for key in &new_keys {
            if !old_keys.contains(key) {
                txn.set(key, &[]);
            }
        }

        Ok(())
    }
}
