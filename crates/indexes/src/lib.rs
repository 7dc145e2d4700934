//! Concrete index maintainers.
//!
//! Each module implements one index kind against the maintainer contract
//! from `taxis-core`; [`build_maintainer`] turns a declarative [`Index`]
//! into the matching boxed maintainer, which is how the manager assembles
//! a heterogeneous set per record type.

pub mod aggregate;
pub mod hnsw;
pub mod permuted;
pub mod rank;
pub mod spatial;
pub mod value;
pub mod version;

#[cfg(test)]
mod testkit;

pub use aggregate::{AvgMaintainer, CountMaintainer, ExtremumMaintainer, SumMaintainer};
pub use hnsw::{HnswMaintainer, Neighbor};
pub use permuted::PermutedMaintainer;
pub use rank::{RankMaintainer, ScoreEntry};
pub use spatial::SpatialMaintainer;
pub use value::ValueMaintainer;
pub use version::{VersionEntry, VersionMaintainer};

use taxis_core::{Index, IndexError, IndexKind, IndexMaintainer, Record, StoreLayout, Transaction};

/// Build the maintainer for an index definition, rooted in the store's
/// layout. A maintainer exists for every supported kind; an unsupported
/// kind is an invalid argument, not a silent skip.
pub fn build_maintainer<R: Record, T: Transaction>(
    index: &Index,
    layout: &StoreLayout,
) -> Result<Box<dyn IndexMaintainer<R, T>>, IndexError> {
    let subspace = layout.index(&index.name);

    match index.kind {
        IndexKind::Value => Ok(Box::new(ValueMaintainer::new(index.clone(), subspace))),
        IndexKind::Count => Ok(Box::new(CountMaintainer::new(index.clone(), subspace))),
        IndexKind::Sum => Ok(Box::new(SumMaintainer::new(index.clone(), subspace))),
        IndexKind::Min | IndexKind::Max => {
            Ok(Box::new(ExtremumMaintainer::new(index.clone(), subspace)?))
        }
        IndexKind::Avg => Ok(Box::new(AvgMaintainer::new(index.clone(), subspace))),
        IndexKind::Permuted => {
            Ok(Box::new(PermutedMaintainer::new(index.clone(), subspace)?))
        }
        IndexKind::Rank => Ok(Box::new(RankMaintainer::new(index.clone(), subspace)?)),
        IndexKind::Version => Ok(Box::new(VersionMaintainer::new(index.clone(), subspace))),
        IndexKind::Spatial => Ok(Box::new(SpatialMaintainer::new(index.clone(), subspace))),
        IndexKind::Vector => Ok(Box::new(HnswMaintainer::new(index.clone(), subspace))),
    }
}
