//! The per-store keyspace layout.
//!
//! Everything a store owns lives under one root subspace `S`:
//!
//! - `S/record/<type>/<pk...>` -> serialized record bytes (written by the
//!   caller's CRUD layer, scanned here).
//! - `S/index/<name>/...` -> per-index payload.
//! - `S/indexState/<name>` -> one state byte.
//! - `S/indexBuild/<name>/scrubber/<phase>/<rangeStart>` -> rangeEnd.
//! - `S/indexRange/<name>/<rangeStart>` -> rangeEnd.

use crate::rangeset::RangeSet;
use crate::state::IndexStateManager;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

/// The scrubber's two resume sets are kept phase-separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubPhase {
    IndexToRecord,
    RecordToIndex,
}

impl ScrubPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::IndexToRecord => "phase1",
            Self::RecordToIndex => "phase2",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: Subspace,
}

impl StoreLayout {
    pub fn new(root: Subspace) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Subspace {
        &self.root
    }

    /// All records of every type.
    pub fn records(&self) -> Subspace {
        self.root.at("record")
    }

    /// Records of one type; primary-key tuples are packed beneath it.
    pub fn records_of(&self, record_type: &str) -> Subspace {
        self.records().at(record_type)
    }

    pub fn record_key(&self, record_type: &str, pk: &Tuple) -> Vec<u8> {
        self.records_of(record_type).pack(pk)
    }

    /// Payload subspace of one index.
    pub fn index(&self, name: &str) -> Subspace {
        self.root.at("index").at(name)
    }

    pub fn state_manager(&self) -> IndexStateManager {
        IndexStateManager::new(self.root.at("indexState"))
    }

    /// Resume set for the online build of one index.
    pub fn build_range_set(&self, name: &str) -> RangeSet {
        RangeSet::new(self.root.at("indexRange").at(name))
    }

    /// Resume set for one scrubber phase of one index.
    pub fn scrub_range_set(&self, name: &str, phase: ScrubPhase) -> RangeSet {
        RangeSet::new(
            self.root
                .at("indexBuild")
                .at(name)
                .at("scrubber")
                .at(phase.label()),
        )
    }
}
