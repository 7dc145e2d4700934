//! Index definitions.
//!
//! An [`Index`] is the declarative half of an index: name, kind, the key
//! expression projecting records into tuples, kind-specific options and the
//! record types it applies to. The imperative half is the maintainer built
//! from it.

use serde::{Deserialize, Serialize};

use crate::expression::KeyExpression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Value,
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Permuted,
    Rank,
    Version,
    Spatial,
    Vector,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Value => "value",
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Permuted => "permuted",
            Self::Rank => "rank",
            Self::Version => "version",
            Self::Spatial => "spatial",
            Self::Vector => "vector",
        };
        write!(f, "{name}")
    }
}

/// Whether the index spans the whole store or one partition of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScope {
    #[default]
    Partition,
    Global,
}

/// Ordering for rank indexes: whether a lower score is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    #[default]
    Ascending,
    Descending,
}

/// Version retention applied after every insert, inside the same
/// transaction. None of the variants ever deletes the most recent version.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    KeepAll,
    KeepLast(usize),
    /// Keep versions younger than this many milliseconds.
    KeepForMillis(u64),
}

/// Variant selector for spatial codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialKind {
    /// Spherical cells over (lat, lon) degrees.
    #[default]
    Geo,
    /// Morton codes over (lat, lon, normalized altitude).
    Geo3d,
    /// Morton-interleaved 2-D cartesian coordinates in [0, 1].
    Cartesian2d,
    /// Morton-interleaved 3-D cartesian coordinates in [0, 1].
    Cartesian3d,
}

/// Distance metrics for vector indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`; zero-norm inputs yield 2.
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
    /// Negated dot product.
    InnerProduct,
}

/// Graph parameters for vector indexes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub metric: DistanceMetric,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            metric: DistanceMetric::default(),
        }
    }
}

impl HnswParams {
    /// Level normalization factor `1 / ln M`.
    pub fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Neighbor cap per node at `level` (`2M` at level 0).
    pub fn max_neighbors(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// Kind-specific options carried by an index definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Rank bucket size; defaults to 100.
    pub bucket_size: Option<u32>,
    pub rank_order: Option<RankOrder>,
    /// Permutation of the base expression's column positions.
    pub permutation: Option<Vec<usize>>,
    pub retention: Option<RetentionPolicy>,
    pub spatial_kind: Option<SpatialKind>,
    /// Spatial encoding level / precision.
    pub spatial_level: Option<u8>,
    pub hnsw: Option<HnswParams>,
}

/// The declarative definition of one secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub kind: IndexKind,
    pub root_expression: KeyExpression,
    #[serde(default)]
    pub options: IndexOptions,
    #[serde(default)]
    pub scope: IndexScope,
    pub record_types: Vec<String>,
}

impl Index {
    pub fn new(
        name: impl Into<String>,
        kind: IndexKind,
        root_expression: KeyExpression,
        record_types: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            root_expression,
            options: IndexOptions::default(),
            scope: IndexScope::default(),
            record_types,
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn applies_to(&self, record_type: &str) -> bool {
        self.record_types.iter().any(|t| t == record_type)
    }

    /// Number of key columns produced by the root expression.
    pub fn column_count(&self) -> usize {
        self.root_expression.column_count()
    }
}
