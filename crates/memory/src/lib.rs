//! Ephemeral in-memory KVS backend.
//!
//! A `BTreeMap` behind an `RwLock` with the full transaction contract:
//! snapshot-at-begin reads, read-your-writes overlay, atomic adds,
//! versionstamp substitution at commit, and the byte/time budgets the
//! background jobs rely on. One commit lock makes commits serializable;
//! there is no conflict detection because there is nothing to conflict
//! with under a single writer at a time.
//!
//! This is the backend every test in the workspace runs against, and it
//! doubles as an ephemeral store for callers that want the layer without
//! persistence.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use taxis_core::tuple::VERSIONSTAMP_SIZE;
use taxis_core::{Key, KeySelector, KvStore, KvsError, RangeOptions, Transaction, Value, Versionstamp};

/// The commit budgets enforced by the store, mirroring the limits of the
/// production-class stores the layer targets.
#[derive(Debug, Clone, Copy)]
pub struct MemoryKvLimits {
    pub max_transaction_bytes: usize,
    pub default_timeout: Duration,
}

impl Default for MemoryKvLimits {
    fn default() -> Self {
        Self {
            max_transaction_bytes: 10 * 1024 * 1024,
            default_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    data: BTreeMap<Key, Value>,
    commit_version: u64,
}

/// Handle to an in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    shared: Arc<RwLock<Shared>>,
    limits: MemoryKvLimits,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: MemoryKvLimits) -> Self {
        Self {
            shared: Arc::default(),
            limits,
        }
    }

    /// Number of keys currently stored; test helper.
    pub fn len(&self) -> usize {
        self.shared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Mutation {
    Set(Key, Value),
    Clear(Key),
    ClearRange(Key, Key),
    Add(Key, i64),
    Stamped(Key, Value),
}

pub struct MemoryTransaction {
    shared: Arc<RwLock<Shared>>,
    /// Immutable view taken at begin.
    snapshot: BTreeMap<Key, Value>,
    /// Snapshot plus this transaction's own writes.
    view: BTreeMap<Key, Value>,
    log: Vec<Mutation>,
    mutation_bytes: usize,
    deadline: Instant,
    timeout: Duration,
    limits: MemoryKvLimits,
}

impl KvStore for MemoryKv {
    type Txn = MemoryTransaction;

    fn begin(&self) -> Result<Self::Txn, KvsError> {
        let shared = self.shared.read().map_err(|_| {
            KvsError::internal("memory store lock poisoned")
        })?;

        let snapshot = shared.data.clone();
        drop(shared);

        Ok(MemoryTransaction {
            shared: self.shared.clone(),
            view: snapshot.clone(),
            snapshot,
            log: Vec::new(),
            mutation_bytes: 0,
            deadline: Instant::now() + self.limits.default_timeout,
            timeout: self.limits.default_timeout,
            limits: self.limits,
        })
    }
}

impl MemoryTransaction {
    fn check_deadline(&self) -> Result<(), KvsError> {
        if Instant::now() > self.deadline {
            return Err(KvsError::TransactionTimedOut(self.timeout));
        }
        Ok(())
    }

    fn source(&self, snapshot: bool) -> &BTreeMap<Key, Value> {
        if snapshot {
            &self.snapshot
        } else {
            &self.view
        }
    }

    fn read_i64(&self, key: &[u8]) -> i64 {
        decode_le_i64(self.view.get(key).map(|v| v.as_slice()).unwrap_or(&[]))
    }
}

fn decode_le_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    let len = bytes.len().min(8);
    raw[..len].copy_from_slice(&bytes[..len]);
    i64::from_le_bytes(raw)
}

/// Split a versionstamped key into (key bytes with placeholder, placeholder
/// offset), validating the 4-byte little-endian trailer.
fn split_stamped_key(key: &[u8]) -> Result<(Vec<u8>, usize), KvsError> {
    if key.len() < 4 {
        return Err(KvsError::InvalidVersionstampOffset(key.to_vec()));
    }

    let (body, trailer) = key.split_at(key.len() - 4);
    let offset = u32::from_le_bytes(trailer.try_into().unwrap()) as usize;

    let region = body.get(offset..offset + VERSIONSTAMP_SIZE);
    match region {
        Some(region) if region.iter().all(|b| *b == 0xFF) => Ok((body.to_vec(), offset)),
        _ => Err(KvsError::InvalidVersionstampOffset(key.to_vec())),
    }
}

impl Transaction for MemoryTransaction {
    type Range = std::vec::IntoIter<Result<(Key, Value), KvsError>>;

    fn get(&self, key: &[u8]) -> Result<Option<Value>, KvsError> {
        self.check_deadline()?;
        Ok(self.view.get(key).cloned())
    }

    fn get_key(&self, selector: &KeySelector) -> Result<Option<Key>, KvsError> {
        self.check_deadline()?;

        let hit = match selector {
            KeySelector::FirstGreaterOrEqual(key) => self
                .view
                .range::<[u8], _>((Bound::Included(key.as_slice()), Bound::Unbounded))
                .next(),
            KeySelector::FirstGreaterThan(key) => self
                .view
                .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
                .next(),
            KeySelector::LastLessOrEqual(key) => self
                .view
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key.as_slice())))
                .next_back(),
            KeySelector::LastLessThan(key) => self
                .view
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_slice())))
                .next_back(),
        };

        Ok(hit.map(|(k, _)| k.clone()))
    }

    fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        options: RangeOptions,
    ) -> Result<Self::Range, KvsError> {
        self.check_deadline()?;

        // resolve selectors against the chosen view before walking it
        let resolve = |selector: &KeySelector| -> Key {
            match selector {
                KeySelector::FirstGreaterOrEqual(key) => key.clone(),
                KeySelector::FirstGreaterThan(key) => taxis_core::key_after(key),
                // selector floors: the resolved boundary is the matching
                // key itself, or the queried key when absent
                KeySelector::LastLessOrEqual(key) | KeySelector::LastLessThan(key) => {
                    key.clone()
                }
            }
        };

        let begin_key = resolve(begin);
        let end_key = resolve(end);

        if begin_key >= end_key {
            return Ok(Vec::new().into_iter());
        }

        let source = self.source(options.snapshot);
        let walk = source.range::<[u8], _>((
            Bound::Included(begin_key.as_slice()),
            Bound::Excluded(end_key.as_slice()),
        ));

        let mut hits: Vec<Result<(Key, Value), KvsError>> = if options.reverse {
            walk.rev()
                .map(|(k, v)| Ok((k.clone(), v.clone())))
                .collect()
        } else {
            walk.map(|(k, v)| Ok((k.clone(), v.clone()))).collect()
        };

        if let Some(limit) = options.limit {
            hits.truncate(limit);
        }

        Ok(hits.into_iter())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.mutation_bytes += key.len() + value.len();
        self.view.insert(key.to_vec(), value.to_vec());
        self.log.push(Mutation::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.mutation_bytes += key.len();
        self.view.remove(key);
        self.log.push(Mutation::Clear(key.to_vec()));
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        self.mutation_bytes += begin.len() + end.len();

        let doomed: Vec<Key> = self
            .view
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.view.remove(&key);
        }

        self.log
            .push(Mutation::ClearRange(begin.to_vec(), end.to_vec()));
    }

    fn atomic_add(&mut self, key: &[u8], delta: i64) {
        self.mutation_bytes += key.len() + 8;

        // read-your-writes sees the summed value immediately
        let current = self.read_i64(key);
        self.view
            .insert(key.to_vec(), current.wrapping_add(delta).to_le_bytes().to_vec());

        self.log.push(Mutation::Add(key.to_vec(), delta));
    }

    fn set_versionstamped_key(&mut self, key_with_offset: &[u8], value: &[u8]) {
        self.mutation_bytes += key_with_offset.len() + value.len();

        // stamped keys are not readable before commit; only the log learns
        // about them
        self.log
            .push(Mutation::Stamped(key_with_offset.to_vec(), value.to_vec()));
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = Instant::now() + timeout;
    }

    fn mutation_bytes(&self) -> usize {
        self.mutation_bytes
    }

    fn commit(self) -> Result<Versionstamp, KvsError> {
        self.check_deadline()?;

        if self.mutation_bytes > self.limits.max_transaction_bytes {
            return Err(KvsError::TransactionTooLarge {
                size: self.mutation_bytes,
                limit: self.limits.max_transaction_bytes,
            });
        }

        let mut shared = self.shared.write().map_err(|_| {
            KvsError::internal("memory store lock poisoned")
        })?;

        shared.commit_version += 1;
        let stamp = Versionstamp::complete(shared.commit_version, 0);

        for mutation in self.log {
            match mutation {
                Mutation::Set(key, value) => {
                    shared.data.insert(key, value);
                }
                Mutation::Clear(key) => {
                    shared.data.remove(&key);
                }
                Mutation::ClearRange(begin, end) => {
                    let doomed: Vec<Key> = shared
                        .data
                        .range::<[u8], _>((
                            Bound::Included(begin.as_slice()),
                            Bound::Excluded(end.as_slice()),
                        ))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        shared.data.remove(&key);
                    }
                }
                Mutation::Add(key, delta) => {
                    let current = decode_le_i64(
                        shared.data.get(&key).map(|v| v.as_slice()).unwrap_or(&[]),
                    );
                    shared
                        .data
                        .insert(key, current.wrapping_add(delta).to_le_bytes().to_vec());
                }
                Mutation::Stamped(key_with_offset, value) => {
                    let (mut key, offset) = split_stamped_key(&key_with_offset)?;
                    key[offset..offset + VERSIONSTAMP_SIZE]
                        .copy_from_slice(stamp.as_bytes());
                    shared.data.insert(key, value);
                }
            }
        }

        Ok(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxis_core::{RangeSet, Subspace, Tuple};

    fn store() -> MemoryKv {
        MemoryKv::new()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.set(b"a", b"1");
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(txn.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_read_your_writes_and_snapshot() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.set(b"a", b"1");

        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));

        let snap = txn
            .get_range(
                &KeySelector::first_greater_or_equal(b"".to_vec()),
                &KeySelector::first_greater_or_equal(b"\xff".to_vec()),
                RangeOptions::default().with_snapshot(),
            )
            .unwrap()
            .count();
        assert_eq!(snap, 0);
    }

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.set(b"a", b"1");
        drop(txn);

        let txn = kv.begin().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_range_reverse_and_limit() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        for i in 0u8..5 {
            txn.set(&[i], &[i]);
        }
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        let hits: Vec<_> = txn
            .get_range(
                &KeySelector::first_greater_or_equal(vec![0]),
                &KeySelector::first_greater_or_equal(vec![0xFF]),
                RangeOptions::reversed().with_limit(2),
            )
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();

        assert_eq!(hits, vec![vec![4], vec![3]]);
    }

    #[test]
    fn test_key_selectors() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.set(b"b", b"");
        txn.set(b"d", b"");
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();

        let got = txn
            .get_key(&KeySelector::first_greater_or_equal(b"b".to_vec()))
            .unwrap();
        assert_eq!(got, Some(b"b".to_vec()));

        let got = txn
            .get_key(&KeySelector::first_greater_than(b"b".to_vec()))
            .unwrap();
        assert_eq!(got, Some(b"d".to_vec()));

        let got = txn
            .get_key(&KeySelector::last_less_than(b"d".to_vec()))
            .unwrap();
        assert_eq!(got, Some(b"b".to_vec()));

        let got = txn
            .get_key(&KeySelector::last_less_or_equal(b"d".to_vec()))
            .unwrap();
        assert_eq!(got, Some(b"d".to_vec()));

        let got = txn
            .get_key(&KeySelector::last_less_than(b"a".to_vec()))
            .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_atomic_add_merges_at_commit() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.atomic_add(b"n", 5);
        txn.atomic_add(b"n", -2);
        assert_eq!(decode_le_i64(&txn.get(b"n").unwrap().unwrap()), 3);
        txn.commit().unwrap();

        let mut txn = kv.begin().unwrap();
        txn.atomic_add(b"n", 4);
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        assert_eq!(decode_le_i64(&txn.get(b"n").unwrap().unwrap()), 7);
    }

    #[test]
    fn test_versionstamp_substitution() {
        let kv = store();

        let tuple = Tuple::new().with("pk").with(Versionstamp::incomplete());
        let key = tuple.pack_with_versionstamp(b"V").unwrap();

        let mut txn = kv.begin().unwrap();
        txn.set_versionstamped_key(&key, b"ts");
        let stamp = txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        let subspace = Subspace::new(b"V".to_vec());
        let (begin, end) = subspace.range();
        let hits = taxis_core::kvs::read_range(&txn, &begin, &end, RangeOptions::default())
            .unwrap();

        assert_eq!(hits.len(), 1);
        let decoded = subspace.unpack(&hits[0].0).unwrap();
        assert_eq!(
            decoded.get(1),
            Some(&taxis_core::TupleElement::Versionstamp(stamp))
        );
    }

    #[test]
    fn test_versionstamps_are_monotonic() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.set(b"a", b"");
        let first = txn.commit().unwrap();

        let mut txn = kv.begin().unwrap();
        txn.set(b"b", b"");
        let second = txn.commit().unwrap();

        assert!(first < second);
    }

    #[test]
    fn test_transaction_too_large() {
        let kv = MemoryKv::with_limits(MemoryKvLimits {
            max_transaction_bytes: 16,
            ..Default::default()
        });

        let mut txn = kv.begin().unwrap();
        txn.set(b"key", &[0u8; 64]);
        let err = txn.commit().unwrap_err();

        assert!(err.is_size_class());
    }

    #[test]
    fn test_transaction_timeout() {
        let kv = store();

        let mut txn = kv.begin().unwrap();
        txn.set_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));

        assert!(matches!(
            txn.get(b"a"),
            Err(KvsError::TransactionTimedOut(_))
        ));
    }

    #[test]
    fn test_rangeset_insert_and_missing() {
        let kv = store();
        let set = RangeSet::new(Subspace::new(b"R".to_vec()));

        let mut txn = kv.begin().unwrap();
        assert!(set.insert_range(&mut txn, b"b", b"d").unwrap());
        assert!(set.insert_range(&mut txn, b"f", b"h").unwrap());
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        let missing = set.missing_ranges(&txn, b"a", b"z").unwrap();
        assert_eq!(
            missing,
            vec![
                (b"a".to_vec(), b"b".to_vec()),
                (b"d".to_vec(), b"f".to_vec()),
                (b"h".to_vec(), b"z".to_vec()),
            ]
        );
    }

    #[test]
    fn test_rangeset_coalesces() {
        let kv = store();
        let set = RangeSet::new(Subspace::new(b"R".to_vec()));

        let mut txn = kv.begin().unwrap();
        set.insert_range(&mut txn, b"b", b"d").unwrap();
        set.insert_range(&mut txn, b"d", b"f").unwrap();
        set.insert_range(&mut txn, b"c", b"e").unwrap();
        txn.commit().unwrap();

        // one coalesced entry: [b, f)
        assert_eq!(kv.len(), 1);

        let txn = kv.begin().unwrap();
        assert!(set.contains_range(&txn, b"b", b"f").unwrap());
        assert!(!set.contains_range(&txn, b"a", b"c").unwrap());
        assert_eq!(
            set.missing_ranges(&txn, b"a", b"z").unwrap(),
            vec![
                (b"a".to_vec(), b"b".to_vec()),
                (b"f".to_vec(), b"z".to_vec()),
            ]
        );
    }

    #[test]
    fn test_rangeset_insert_is_idempotent() {
        let kv = store();
        let set = RangeSet::new(Subspace::new(b"R".to_vec()));

        let mut txn = kv.begin().unwrap();
        assert!(set.insert_range(&mut txn, b"b", b"d").unwrap());
        assert!(!set.insert_range(&mut txn, b"b", b"d").unwrap());
        txn.commit().unwrap();

        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_rangeset_clear() {
        let kv = store();
        let set = RangeSet::new(Subspace::new(b"R".to_vec()));

        let mut txn = kv.begin().unwrap();
        set.insert_range(&mut txn, b"b", b"d").unwrap();
        set.clear(&mut txn).unwrap();
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        assert_eq!(
            set.missing_ranges(&txn, b"a", b"z").unwrap(),
            vec![(b"a".to_vec(), b"z".to_vec())]
        );
    }

    #[test]
    fn test_rangeset_progress() {
        let kv = store();
        let set = RangeSet::new(Subspace::new(b"R".to_vec()));

        let mut txn = kv.begin().unwrap();
        set.insert_range(&mut txn, &[0x00], &[0x80]).unwrap();
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        let progress = set.get_progress(&txn, &[0x00], &[0xFF]).unwrap();
        assert!((progress - 0.5).abs() < 0.01);
    }
}
