//! taxis: a record/index layer for ordered transactional key/value
//! stores.
//!
//! The layer translates structured records into key ranges of an external
//! KVS and maintains a family of secondary indexes over them: plain value
//! indexes, atomic-add aggregates, permuted orderings, rank range trees,
//! versionstamped histories, spatial codes and vector graphs. Maintenance
//! happens inside the caller's transactions; the background flows (online
//! build, scrubbing) own their transactions and resume through persistent
//! range sets.
//!
//! This crate is the orchestration layer: the [`manager::IndexManager`]
//! fan-out, the [`build::OnlineIndexer`] and [`build::hnsw::HnswIndexBuilder`]
//! backfill services and the [`scrub::Scrubber`]. The contracts live in
//! `taxis-core`, the maintainers in `taxis-indexes`, and an ephemeral
//! backend in `taxis-memory`.

pub mod build;
pub mod manager;
pub mod prelude;
pub mod query;
pub mod scrub;

pub use build::hnsw::HnswIndexBuilder;
pub use build::OnlineIndexer;
pub use manager::IndexManager;
pub use query::RankQuery;
pub use scrub::{Scrubber, ScrubberConfig, ScrubberResult};

use taxis_core::CancelToken;

/// [`CancelToken`] adapter for tokio's cancellation tokens, which is what
/// callers running the background flows under a task tracker hold.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(pub tokio_util::sync::CancellationToken);

impl Cancellation {
    pub fn new(token: tokio_util::sync::CancellationToken) -> Self {
        Self(token)
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl CancelToken for Cancellation {
    async fn cancelled(&self) {
        self.0.cancelled().await
    }

    fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}
