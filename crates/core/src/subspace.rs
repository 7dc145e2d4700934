//! Byte-prefix namespaces and key selectors.
//!
//! Every component of the layer owns a subspace: a byte prefix under which
//! all of its keys live. Packing a tuple through a subspace prepends the
//! prefix; the subspace range covers every packed key, so a single range
//! clear erases a component's state.

use crate::tuple::{Tuple, TupleElement, TupleError};
use crate::Key;

/// A byte prefix delimiting a logical namespace in the KVS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Child subspace whose prefix is extended by a packed tuple.
    pub fn subspace(&self, tuple: &Tuple) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple.pack());
        Subspace { prefix }
    }

    /// Child subspace extended by a single element.
    pub fn at(&self, element: impl Into<TupleElement>) -> Subspace {
        self.subspace(&Tuple::single(element))
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Raw key: prefix followed by arbitrary suffix bytes.
    pub fn key(&self, suffix: &[u8]) -> Key {
        let mut key = Vec::with_capacity(self.prefix.len() + suffix.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(suffix);
        key
    }

    /// Pack a tuple under this subspace.
    pub fn pack(&self, tuple: &Tuple) -> Key {
        self.key(&tuple.pack())
    }

    /// Pack a tuple carrying one incomplete versionstamp, with the 4-byte
    /// little-endian offset trailer appended.
    pub fn pack_with_versionstamp(&self, tuple: &Tuple) -> Result<Key, TupleError> {
        tuple.pack_with_versionstamp(&self.prefix)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// Strip the prefix and decode the remaining tuple.
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple, TupleError> {
        if !self.contains(key) {
            return Err(TupleError::PrefixMismatch);
        }
        Tuple::unpack(&key[self.prefix.len()..])
    }

    /// The half-open range `[prefix, prefix ++ 0xFF)` covering every packed
    /// key in this subspace.
    pub fn range(&self) -> (Key, Key) {
        let begin = self.prefix.clone();
        let mut end = self.prefix.clone();
        end.push(0xFF);
        (begin, end)
    }
}

/// The four selector primitives resolved by the KVS against its ordered
/// key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    FirstGreaterOrEqual(Key),
    FirstGreaterThan(Key),
    LastLessOrEqual(Key),
    LastLessThan(Key),
}

impl KeySelector {
    pub fn first_greater_or_equal(key: impl Into<Key>) -> Self {
        Self::FirstGreaterOrEqual(key.into())
    }

    pub fn first_greater_than(key: impl Into<Key>) -> Self {
        Self::FirstGreaterThan(key.into())
    }

    pub fn last_less_or_equal(key: impl Into<Key>) -> Self {
        Self::LastLessOrEqual(key.into())
    }

    pub fn last_less_than(key: impl Into<Key>) -> Self {
        Self::LastLessThan(key.into())
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Self::FirstGreaterOrEqual(key)
            | Self::FirstGreaterThan(key)
            | Self::LastLessOrEqual(key)
            | Self::LastLessThan(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_prepends_prefix() {
        let subspace = Subspace::new(b"I".to_vec());
        let key = subspace.pack(&Tuple::new().with("email"));
        assert!(key.starts_with(b"I"));

        let unpacked = subspace.unpack(&key).unwrap();
        assert_eq!(unpacked.get(0).unwrap().as_str(), Some("email"));
    }

    #[test]
    fn test_range_covers_packed_keys() {
        let subspace = Subspace::new(b"idx".to_vec());
        let (begin, end) = subspace.range();

        let key = subspace.pack(&Tuple::new().with(42i64));
        assert!(key >= begin && key < end);

        let outside = Subspace::new(b"idy".to_vec()).pack(&Tuple::new().with(1i64));
        assert!(!(outside >= begin && outside < end));
    }

    #[test]
    fn test_child_subspace_nesting() {
        let root = Subspace::new(b"S".to_vec());
        let child = root.at("hnsw").at("edges");

        let key = child.pack(&Tuple::new().with(7i64));
        assert!(root.contains(&key));
        assert!(child.contains(&key));
    }
}
