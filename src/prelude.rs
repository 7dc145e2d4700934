//! One-stop imports for embedding the layer.

pub use taxis_core::{
    key_after, prefix_end, CancelToken, DistanceMetric, HnswParams, Index, IndexError,
    IndexKind, IndexMaintainer, IndexOptions, IndexScope, IndexState, IndexStateManager, Key,
    KeyExpression, KeySelector, KvStore, KvsError, NeverCancel, RangeOptions, RangeSet,
    RankOrder, Record, RecordAccess, RetentionPolicy, SpatialKind, StoreLayout, Subspace,
    Transaction, Tuple, TupleElement, Value, Versionstamp,
};

pub use taxis_indexes::{
    build_maintainer, AvgMaintainer, CountMaintainer, ExtremumMaintainer, HnswMaintainer,
    Neighbor, PermutedMaintainer, RankMaintainer, ScoreEntry, SpatialMaintainer,
    SumMaintainer, ValueMaintainer, VersionEntry, VersionMaintainer,
};

pub use crate::build::hnsw::{
    HnswBuildPhase, HnswBuildProgress, HnswBuildState, HnswBuilderConfig, HnswCheckpoint,
    HnswIndexBuilder,
};
pub use crate::build::{
    BuildError, BuildProgress, BuildState, BuildStatistics, IndexerConfig, OnlineIndexer,
    RangeCheckpoint,
};
pub use crate::manager::IndexManager;
pub use crate::query::{load_record, RankQuery};
pub use crate::scrub::{
    IssueCounts, ScrubError, ScrubSummary, Scrubber, ScrubberConfig, ScrubberResult,
};
pub use crate::Cancellation;
