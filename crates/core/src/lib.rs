//! Traits and machinery that are common to all taxis crates.
//!
//! Glossary:
//!  - `subspace`: a byte prefix delimiting a logical namespace in the KVS.
//!  - `tuple`: an ordered sequence of typed elements with a byte encoding
//!    that preserves the logical ordering under lexicographic comparison.
//!  - `versionstamp`: a 10-byte commit-time unique value assigned by the
//!    KVS (8-byte commit version + 2-byte batch order).
//!  - `range set`: a persistent set of completed half-open byte ranges used
//!    to resume long-running scans.
//!  - `maintainer`: the per-index-kind component that translates record
//!    transitions into index mutations.

pub mod expression;
pub mod kvs;
pub mod layout;
pub mod maintainer;
pub mod rangeset;
pub mod record;
pub mod state;
pub mod subspace;
pub mod tuple;

mod error;
mod index;

pub use error::IndexError;
pub use expression::KeyExpression;
pub use index::{
    DistanceMetric, HnswParams, Index, IndexKind, IndexOptions, IndexScope, RankOrder,
    RetentionPolicy, SpatialKind,
};
pub use kvs::{KvStore, KvsError, RangeOptions, Transaction};
pub use layout::StoreLayout;
pub use maintainer::IndexMaintainer;
pub use rangeset::RangeSet;
pub use record::{Record, RecordAccess};
pub use state::{IndexState, IndexStateManager};
pub use subspace::{KeySelector, Subspace};
pub use tuple::{Tuple, TupleElement, Versionstamp};

/// A raw key in the KVS.
pub type Key = Vec<u8>;

/// A raw value in the KVS.
pub type Value = Vec<u8>;

/// A half-open byte range `[begin, end)`.
pub type ByteRange = (Key, Key);

/// Cooperative cancellation for background loops.
///
/// Builder and scrubber tasks poll this between batches; implementations
/// are expected to resolve `cancelled` once and stay resolved.
#[trait_variant::make(Send)]
pub trait CancelToken: Send + Sync + 'static + Clone {
    async fn cancelled(&self);

    fn is_cancelled(&self) -> bool;
}

/// A token that never cancels, for foreground callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancelToken for NeverCancel {
    async fn cancelled(&self) {
        std::future::pending::<()>().await
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Appends a `0x00` byte, yielding the immediate successor key.
///
/// Used to continue a scan strictly after a processed key and to mark
/// `[begin, key+0x00)` complete in a range set.
pub fn key_after(key: &[u8]) -> Key {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0x00);
    next
}

/// The first key strictly beyond every key that starts with `prefix`.
///
/// Increments the last non-0xFF byte and truncates. An all-0xFF prefix has
/// no strict upper bound; we fall back to appending 0xFF which is good
/// enough for subspace prefixes that never end in 0xFF.
pub fn prefix_end(prefix: &[u8]) -> Key {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last() {
        if *last < 0xFF {
            *end.last_mut().unwrap() += 1;
            return end;
        }
        end.pop();
    }
    let mut end = prefix.to_vec();
    end.push(0xFF);
    end
}
