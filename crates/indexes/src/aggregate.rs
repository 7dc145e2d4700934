//! Aggregate indexes: count, sum, min, max and the two-key avg variant.
//!
//! Count and sum keep one little-endian i64 per grouping, maintained with
//! atomic adds so concurrent updates never conflict. Min and max store the
//! aggregated value inside the key (`grouping ++ [value] ++ pk`) and answer
//! queries with a single boundary read. Avg is a sum that also bumps a
//! sibling count; the quotient is computed client side.

use taxis_core::record::evaluate_entries;
use taxis_core::{
    Index, IndexError, IndexKind, IndexMaintainer, KeySelector, Record, RecordAccess,
    Subspace, Transaction, Tuple, TupleElement,
};

fn decode_le_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    let len = bytes.len().min(8);
    raw[..len].copy_from_slice(&bytes[..len]);
    i64::from_le_bytes(raw)
}

/// Split an evaluated entry into (grouping, aggregated value), enforcing
/// that the aggregated value is an integer.
fn split_grouped(index: &Index, entry: &Tuple) -> Result<(Tuple, i64), IndexError> {
    let columns = index.column_count();

    if columns == 0 || entry.len() < columns {
        return Err(IndexError::internal(format!(
            "index {} produced a misshapen entry {entry}",
            index.name
        )));
    }

    let value = match entry.get(columns - 1) {
        Some(TupleElement::Int(value)) => *value,
        Some(TupleElement::Float(_)) | Some(TupleElement::Double(_)) => {
            return Err(IndexError::invalid_argument(format!(
                "index {} aggregates a float; use integer minor units",
                index.name
            )));
        }
        other => {
            return Err(IndexError::invalid_argument(format!(
                "index {} aggregates non-numeric element {other:?}",
                index.name
            )));
        }
    };

    Ok((entry.prefix(columns - 1), value))
}

/// Count of records per grouping, via atomic add.
pub struct CountMaintainer {
    index: Index,
    subspace: Subspace,
}

impl CountMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        Self { index, subspace }
    }

    pub fn get<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
    ) -> Result<Option<i64>, IndexError> {
        let raw = txn.get(&self.subspace.pack(grouping))?;
        Ok(raw.map(|v| decode_le_i64(&v)))
    }

    fn apply<R: Record>(
        &self,
        record: &R,
        access: &dyn RecordAccess<R>,
        delta: i64,
        txn: &mut impl Transaction,
    ) -> Result<(), IndexError> {
        for entry in evaluate_entries(access, record, &self.index.root_expression)? {
            txn.atomic_add(&self.subspace.pack(&entry), delta);
        }
        Ok(())
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for CountMaintainer {
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
            self.apply(record, access, -1, txn)?;
        }
        if let Some(record) = new {
            self.apply(record, access, 1, txn)?;
        }
        Ok(())
    }
}

/// Sum of an integer field per grouping, via atomic add.
pub struct SumMaintainer {
    index: Index,
    subspace: Subspace,
}

impl SumMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        Self { index, subspace }
    }

    pub fn get<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
    ) -> Result<Option<i64>, IndexError> {
        let raw = txn.get(&self.subspace.pack(grouping))?;
        Ok(raw.map(|v| decode_le_i64(&v)))
    }

    fn apply<R: Record>(
        &self,
        record: &R,
        access: &dyn RecordAccess<R>,
        sign: i64,
        txn: &mut impl Transaction,
    ) -> Result<(), IndexError> {
        for entry in evaluate_entries(access, record, &self.index.root_expression)? {
            let (grouping, value) = split_grouped(&self.index, &entry)?;
            txn.atomic_add(&self.subspace.pack(&grouping), sign * value);
        }
        Ok(())
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for SumMaintainer {
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
            self.apply(record, access, -1, txn)?;
        }
        if let Some(record) = new {
            self.apply(record, access, 1, txn)?;
        }
        Ok(())
    }
}

/// Min/max per grouping, stored as `grouping ++ [value] ++ pk` keys and
/// answered with one boundary read over the grouping range.
pub struct ExtremumMaintainer {
    index: Index,
    subspace: Subspace,
    take_max: bool,
}

impl ExtremumMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Result<Self, IndexError> {
        let take_max = match index.kind {
            IndexKind::Min => false,
            IndexKind::Max => true,
            other => {
                return Err(IndexError::invalid_argument(format!(
                    "extremum maintainer cannot serve {other} index {}",
                    index.name
                )));
            }
        };

        Ok(Self {
            index,
            subspace,
            take_max,
        })
    }

    /// Current extremum for a grouping, if any record contributes to it.
    pub fn get<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
    ) -> Result<Option<i64>, IndexError> {
        let scope = self.subspace.subspace(grouping);
        let (begin, end) = scope.range();

        let boundary = if self.take_max {
            txn.get_key(&KeySelector::last_less_than(end))?
        } else {
            txn.get_key(&KeySelector::first_greater_or_equal(begin))?
        };

        let Some(key) = boundary else {
            return Ok(None);
        };
        if !scope.contains(&key) {
            return Ok(None);
        }

        let suffix = scope.unpack(&key)?;
        match suffix.get(0) {
            Some(TupleElement::Int(value)) => Ok(Some(*value)),
            other => Err(IndexError::internal(format!(
                "index {} stores non-integer extremum {other:?}",
                self.index.name
            ))),
        }
    }

    fn keys_for<R: Record>(
        &self,
        access: &dyn RecordAccess<R>,
        record: &R,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        let pk = record.primary_key();
        let mut keys = Vec::new();

        for entry in evaluate_entries(access, record, &self.index.root_expression)? {
            let (grouping, value) = split_grouped(&self.index, &entry)?;
            let tuple = grouping.with(value).concat(&pk);
            keys.push(self.subspace.pack(&tuple));
        }

        Ok(keys)
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for ExtremumMaintainer {
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

/// Sum plus sibling count; the average is `sum / count`, `None` while the
/// count is not positive.
pub struct AvgMaintainer {
    index: Index,
    sums: Subspace,
    counts: Subspace,
}

impl AvgMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        Self {
            sums: subspace.at("sum"),
            counts: subspace.at("count"),
            index,
        }
    }

    pub fn average<T: Transaction>(
        &self,
        txn: &T,
        grouping: &Tuple,
    ) -> Result<Option<f64>, IndexError> {
        let count = txn
            .get(&self.counts.pack(grouping))?
            .map(|v| decode_le_i64(&v))
            .unwrap_or(0);

        if count <= 0 {
            return Ok(None);
        }

        let sum = txn
            .get(&self.sums.pack(grouping))?
            .map(|v| decode_le_i64(&v))
            .unwrap_or(0);

        Ok(Some(sum as f64 / count as f64))
    }

    fn apply<R: Record>(
        &self,
        record: &R,
        access: &dyn RecordAccess<R>,
        sign: i64,
        txn: &mut impl Transaction,
    ) -> Result<(), IndexError> {
        for entry in evaluate_entries(access, record, &self.index.root_expression)? {
            let (grouping, value) = split_grouped(&self.index, &entry)?;
            txn.atomic_add(&self.sums.pack(&grouping), sign * value);
            txn.atomic_add(&self.counts.pack(&grouping), sign);
        }
        Ok(())
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for AvgMaintainer {
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
            self.apply(record, access, -1, txn)?;
        }
        if let Some(record) = new {
            self.apply(record, access, 1, txn)?;
        }
        Ok(())
    }
}
