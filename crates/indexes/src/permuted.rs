//! Permuted copies of a compound index.
//!
//! A permutation `π` reorders the columns of the base expression, giving
//! the planner an alternative sort order. Storage is independent of the
//! base index; sharing entries with it is a possible future optimization,
//! not current behavior.

use taxis_core::record::evaluate_entries;
use taxis_core::{
    Index, IndexError, IndexMaintainer, Record, RecordAccess, Subspace, Transaction, Tuple,
};

#[derive(Debug)]
pub struct PermutedMaintainer {
    index: Index,
    subspace: Subspace,
    permutation: Vec<usize>,
}

impl PermutedMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Result<Self, IndexError> {
        let columns = index.column_count();

        let permutation = index
            .options
            .permutation
            .clone()
            .ok_or_else(|| {
                IndexError::InvalidPermutation(format!(
                    "index {} declares no permutation",
                    index.name
                ))
            })?;

        if permutation.len() != columns {
            return Err(IndexError::InvalidPermutation(format!(
                "index {}: permutation has {} positions for {} columns",
                index.name,
                permutation.len(),
                columns
            )));
        }

        let mut seen = vec![false; columns];
        for position in &permutation {
            if *position >= columns || seen[*position] {
                return Err(IndexError::InvalidPermutation(format!(
                    "index {}: {:?} is not a bijection on 0..{columns}",
                    index.name, permutation
                )));
            }
            seen[*position] = true;
        }

        Ok(Self {
            index,
            subspace,
            permutation,
        })
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    fn permute(&self, entry: &Tuple) -> Result<Tuple, IndexError> {
        self.permutation
            .iter()
            .map(|position| {
                entry.get(*position).cloned().ok_or_else(|| {
                    IndexError::internal(format!(
                        "index {} produced entry {entry} narrower than its permutation",
                        self.index.name
                    ))
                })
            })
            .collect()
    }

    fn keys_for<R: Record>(
        &self,
        access: &dyn RecordAccess<R>,
        record: &R,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        let pk = record.primary_key();
        let entries = evaluate_entries(access, record, &self.index.root_expression)?;

        entries
            .iter()
            .map(|entry| Ok(self.subspace.pack(&self.permute(entry)?.concat(&pk))))
            .collect()
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for PermutedMaintainer {
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

#[cfg(test)]
mod tests {
    use super::*;
    use taxis_core::{IndexKind, KeyExpression};

    fn base_index(permutation: Vec<usize>) -> Index {
        let mut index = Index::new(
            "by_region_tier",
            IndexKind::Permuted,
            KeyExpression::concat(vec![
                KeyExpression::field("region"),
                KeyExpression::field("tier"),
            ]),
            vec!["venue".into()],
        );
        index.options.permutation = Some(permutation);
        index
    }

    #[test]
    fn test_permutation_must_be_bijection() {
        let subspace = Subspace::new(b"P".to_vec());

        assert!(PermutedMaintainer::new(base_index(vec![1, 0]), subspace.clone()).is_ok());

        for broken in [vec![0], vec![0, 0], vec![0, 2], vec![1, 0, 1]] {
            let err =
                PermutedMaintainer::new(base_index(broken), subspace.clone()).unwrap_err();
            assert!(matches!(err, IndexError::InvalidPermutation(_)));
        }
    }

    #[test]
    fn test_permute_round_trips_through_inverse() {
        let maintainer =
            PermutedMaintainer::new(base_index(vec![1, 0]), Subspace::new(b"P".to_vec()))
                .unwrap();

        let entry = Tuple::new().with("eu").with(3i64);
        let permuted = maintainer.permute(&entry).unwrap();
        assert_eq!(permuted.get(0).unwrap().as_int(), Some(3));

        // applying the inverse (here: itself) restores the original
        let restored = maintainer.permute(&permuted).unwrap();
        assert_eq!(restored, entry);
    }
}
