//! Vector index: a hierarchical navigable small world graph stored in the
//! KVS.
//!
//! Storage layout under the index subspace:
//!
//! - `pack(pk)` -> vector as a packed tuple of doubles (the flat subindex;
//!   the single source of truth for vectors).
//! - `"hnsw" / "nodes" / pack(pk)` -> JSON `{"level": n}` (additive fields
//!   stay forward-compatible).
//! - `"hnsw" / "edges" / pack(pk ++ [level] ++ neighbor_pk)` -> empty.
//! - `"hnsw" / "entrypoint"` -> packed pk of the top node.
//!
//! Edges are bidirectional (two keys per undirected edge) and capped at
//! `M` per node per level, `2M` at level 0. Inline inserts estimate their
//! operation count from the entry point's level and refuse to run when the
//! estimate exceeds the transaction budget; bulk loads go through the
//! online builder's level-wise hooks instead. Deletes are always allowed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use taxis_core::kvs::read_range;
use taxis_core::{
    DistanceMetric, HnswParams, Index, IndexError, IndexMaintainer, Key, RangeOptions,
    Record, RecordAccess, Subspace, Transaction, Tuple, TupleElement,
};

/// Inline inserts above this estimated operation count are refused.
const MAX_INLINE_OPS: usize = 10_000;

/// Rough operation cost of one inline insert into a graph whose entry
/// point sits at `level`.
fn estimate_insert_ops(level: u8) -> usize {
    level as usize * 1200 + 200
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeMeta {
    level: u8,
}

/// One search hit: distance and primary key, ascending by distance.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub distance: f64,
    pub pk: Tuple,
}

/// Heap entry ordered by distance, ties broken on the packed key so the
/// ordering is total.
#[derive(Debug, Clone)]
struct Candidate {
    distance: f64,
    pk: Tuple,
    packed: Key,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance).is_eq() && self.packed == other.packed
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.packed.cmp(&other.packed))
    }
}

pub fn distance(metric: DistanceMetric, a: &[f64], b: &[f64]) -> Result<f64, IndexError> {
    if a.len() != b.len() {
        return Err(IndexError::invalid_argument(format!(
            "vector dimensions differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    match metric {
        DistanceMetric::Cosine => {
            let mut dot = 0.0;
            let mut norm_a = 0.0;
            let mut norm_b = 0.0;
            for (x, y) in a.iter().zip(b) {
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }

            if norm_a == 0.0 || norm_b == 0.0 {
                return Ok(2.0);
            }

            Ok(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
        }
        DistanceMetric::L2 => {
            let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            Ok(sum.sqrt())
        }
        DistanceMetric::InnerProduct => {
            Ok(-a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>())
        }
    }
}

pub struct HnswMaintainer {
    index: Index,
    /// Flat vector subindex; also the parent of the graph subspaces.
    vectors: Subspace,
    nodes: Subspace,
    edges: Subspace,
    entry_key: Key,
    params: HnswParams,
    /// When set, inline inserts are skipped with a warning instead of
    /// being applied; bulk loads must go through the online builder.
    batch_only: bool,
    /// Seed for deterministic level draws (keyed by pk), so rebuilds
    /// assign stable levels.
    seed: u64,
}

impl HnswMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        let params = index.options.hnsw.unwrap_or_default();
        let graph = subspace.at("hnsw");

        Self {
            nodes: graph.at("nodes"),
            edges: graph.at("edges"),
            entry_key: graph.at("entrypoint").prefix().to_vec(),
            vectors: subspace,
            params,
            batch_only: false,
            seed: 0,
            index,
        }
    }

    /// Skip inline inserts entirely; the online builder owns this graph.
    pub fn batch_only(mut self) -> Self {
        self.batch_only = true;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    pub fn nodes_subspace(&self) -> &Subspace {
        &self.nodes
    }

    // ---- storage primitives ----

    fn vector_key(&self, pk: &Tuple) -> Key {
        self.vectors.pack(pk)
    }

    pub fn write_vector<T: Transaction>(&self, txn: &mut T, pk: &Tuple, vector: &[f64]) {
        let tuple: Tuple = vector.iter().map(|v| TupleElement::Double(*v)).collect();
        txn.set(&self.vector_key(pk), &tuple.pack());
    }

    pub fn vector<T: Transaction>(
        &self,
        txn: &T,
        pk: &Tuple,
    ) -> Result<Option<Vec<f64>>, IndexError> {
        let Some(raw) = txn.get(&self.vector_key(pk))? else {
            return Ok(None);
        };

        let tuple = Tuple::unpack(&raw)?;
        let mut out = Vec::with_capacity(tuple.len());
        for element in tuple.elements() {
            match element {
                TupleElement::Double(value) => out.push(*value),
                TupleElement::Float(value) => out.push(*value as f64),
                other => {
                    return Err(IndexError::internal(format!(
                        "index {} stores non-float component {other:?}",
                        self.index.name
                    )));
                }
            }
        }

        Ok(Some(out))
    }

    pub fn node_level<T: Transaction>(
        &self,
        txn: &T,
        pk: &Tuple,
    ) -> Result<Option<u8>, IndexError> {
        let Some(raw) = txn.get(&self.nodes.pack(pk))? else {
            return Ok(None);
        };

        let meta: NodeMeta = serde_json::from_slice(&raw).map_err(|e| {
            IndexError::internal(format!(
                "index {}: corrupt node metadata: {e}",
                self.index.name
            ))
        })?;

        Ok(Some(meta.level))
    }

    fn set_node_level<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
        level: u8,
    ) -> Result<(), IndexError> {
        let meta = serde_json::to_vec(&NodeMeta { level }).map_err(|e| {
            IndexError::internal(format!("metadata encoding failed: {e}"))
        })?;
        txn.set(&self.nodes.pack(pk), &meta);
        Ok(())
    }

    /// Decode one entry of the nodes subspace into `(pk, level)`.
    pub fn decode_node(&self, key: &[u8], value: &[u8]) -> Result<(Tuple, u8), IndexError> {
        let pk = self.nodes.unpack(key)?;
        let meta: NodeMeta = serde_json::from_slice(value).map_err(|e| {
            IndexError::internal(format!(
                "index {}: corrupt node metadata: {e}",
                self.index.name
            ))
        })?;
        Ok((pk, meta.level))
    }

    fn edge_key(&self, from: &Tuple, level: u8, to: &Tuple) -> Key {
        self.edges
            .pack(&from.clone().with(level as i64).concat(to))
    }

    fn add_edge<T: Transaction>(&self, txn: &mut T, a: &Tuple, level: u8, b: &Tuple) {
        txn.set(&self.edge_key(a, level, b), &[]);
        txn.set(&self.edge_key(b, level, a), &[]);
    }

    fn remove_edge<T: Transaction>(&self, txn: &mut T, a: &Tuple, level: u8, b: &Tuple) {
        txn.clear(&self.edge_key(a, level, b));
        txn.clear(&self.edge_key(b, level, a));
    }

    pub fn neighbors<T: Transaction>(
        &self,
        txn: &T,
        pk: &Tuple,
        level: u8,
    ) -> Result<Vec<Tuple>, IndexError> {
        let scope = self.edges.subspace(&pk.clone().with(level as i64));
        let (begin, end) = scope.range();

        read_range(txn, &begin, &end, RangeOptions::default())?
            .iter()
            .map(|(key, _)| scope.unpack(key).map_err(IndexError::from))
            .collect()
    }

    pub fn entry_point<T: Transaction>(
        &self,
        txn: &T,
    ) -> Result<Option<(Tuple, u8)>, IndexError> {
        let Some(raw) = txn.get(&self.entry_key)? else {
            return Ok(None);
        };

        let pk = Tuple::unpack(&raw)?;
        let level = self.node_level(txn, &pk)?.ok_or_else(|| {
            IndexError::internal(format!(
                "index {}: entry point has no node metadata",
                self.index.name
            ))
        })?;

        Ok(Some((pk, level)))
    }

    fn set_entry_point<T: Transaction>(&self, txn: &mut T, pk: &Tuple) {
        txn.set(&self.entry_key, &pk.pack());
    }

    // ---- vector extraction ----

    /// Vector indexes require a plain field expression; the multi-valued
    /// extraction yields the vector components.
    pub fn vector_of<R: Record>(
        &self,
        access: &dyn RecordAccess<R>,
        record: &R,
    ) -> Result<Vec<f64>, IndexError> {
        let field = match &self.index.root_expression {
            taxis_core::KeyExpression::Field(name) => name,
            other => {
                return Err(IndexError::invalid_argument(format!(
                    "index {} must index a vector field, found {other:?}",
                    self.index.name
                )));
            }
        };

        let mut out = Vec::new();
        for element in access.extract_field(record, field)? {
            match element {
                TupleElement::Double(value) => out.push(value),
                TupleElement::Float(value) => out.push(value as f64),
                TupleElement::Int(value) => out.push(value as f64),
                other => {
                    return Err(IndexError::invalid_argument(format!(
                        "index {}: vector component {other:?} is not numeric",
                        self.index.name
                    )));
                }
            }
        }

        Ok(out)
    }

    /// Deterministic level draw: `floor(-ln(U) * ml)`, keyed by pk so
    /// rebuilds reproduce the same levels.
    pub fn assign_level(&self, pk: &Tuple) -> u8 {
        let mut hash = self.seed ^ 0x9E37_79B9_7F4A_7C15;
        for byte in pk.pack() {
            hash = (hash ^ byte as u64).wrapping_mul(0x100_0000_01B3);
        }

        let mut rng = StdRng::seed_from_u64(hash);
        let uniform: f64 = rng.gen_range(f64::EPSILON..1.0);
        let level = (-uniform.ln() * self.params.ml()).floor();

        level.clamp(0.0, 63.0) as u8
    }

    // ---- search ----

    fn candidate<T: Transaction>(
        &self,
        txn: &T,
        query: &[f64],
        pk: Tuple,
    ) -> Result<Option<Candidate>, IndexError> {
        let Some(vector) = self.vector(txn, &pk)? else {
            return Ok(None);
        };

        let packed = pk.pack();
        Ok(Some(Candidate {
            distance: distance(self.params.metric, query, &vector)?,
            pk,
            packed,
        }))
    }

    /// Greedy beam search within one layer.
    ///
    /// Expands the closest frontier candidate while it is not worse than
    /// the worst of the `ef` best results seen; a visited set prevents
    /// revisits. Returns the results ascending by distance.
    fn search_layer<T: Transaction>(
        &self,
        txn: &T,
        query: &[f64],
        entries: Vec<Candidate>,
        ef: usize,
        level: u8,
    ) -> Result<Vec<Candidate>, IndexError> {
        let mut visited: HashSet<Key> = entries.iter().map(|c| c.packed.clone()).collect();
        let mut frontier: BinaryHeap<Reverse<Candidate>> =
            entries.iter().cloned().map(Reverse).collect();
        let mut results: BinaryHeap<Candidate> = entries.into_iter().collect();

        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }

            for neighbor_pk in self.neighbors(txn, &current.pk, level)? {
                if !visited.insert(neighbor_pk.pack()) {
                    continue;
                }

                // vectors can lag edges during deletes; skip ghosts
                let Some(candidate) = self.candidate(txn, query, neighbor_pk)? else {
                    continue;
                };

                let admit = results.len() < ef
                    || results
                        .peek()
                        .map(|worst| candidate.distance < worst.distance)
                        .unwrap_or(true);

                if admit {
                    frontier.push(Reverse(candidate.clone()));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        Ok(results.into_sorted_vec())
    }

    /// Greedy single-path descent from `from_level` down to `to_level`
    /// (exclusive of layers below `to_level`).
    fn greedy_descent<T: Transaction>(
        &self,
        txn: &T,
        query: &[f64],
        start: Candidate,
        from_level: u8,
        to_level: u8,
    ) -> Result<Candidate, IndexError> {
        let mut best = start;

        let mut level = from_level;
        while level > to_level {
            let found = self.search_layer(txn, query, vec![best.clone()], 1, level)?;
            if let Some(closest) = found.into_iter().next() {
                best = closest;
            }
            level -= 1;
        }

        Ok(best)
    }

    /// Approximate nearest neighbors: `k` results searched with beam
    /// width `ef >= k`.
    pub fn search<T: Transaction>(
        &self,
        txn: &T,
        query: &[f64],
        k: usize,
        ef: usize,
    ) -> Result<Vec<Neighbor>, IndexError> {
        if ef < k {
            return Err(IndexError::invalid_argument(format!(
                "ef {ef} must be at least k {k}"
            )));
        }

        let Some((entry_pk, entry_level)) = self.entry_point(txn)? else {
            if self.has_vectors(txn)? {
                return Err(IndexError::GraphNotBuilt {
                    index: self.index.name.clone(),
                    message: "vectors exist but the graph has no entry point; run the online builder".to_string(),
                });
            }
            return Ok(Vec::new());
        };

        let Some(entry) = self.candidate(txn, query, entry_pk)? else {
            return Err(IndexError::internal(format!(
                "index {}: entry point lost its vector",
                self.index.name
            )));
        };

        let best = self.greedy_descent(txn, query, entry, entry_level, 0)?;
        let found = self.search_layer(txn, query, vec![best], ef, 0)?;

        Ok(found
            .into_iter()
            .take(k)
            .map(|c| Neighbor {
                distance: c.distance,
                pk: c.pk,
            })
            .collect())
    }

    fn has_vectors<T: Transaction>(&self, txn: &T) -> Result<bool, IndexError> {
        // the flat range minus the graph's own child subspace
        let (vec_begin, vec_end) = self.vectors.range();
        let (graph_begin, graph_end) = self.vectors.at("hnsw").range();

        let before = read_range(txn, &vec_begin, &graph_begin, RangeOptions::limited(1))?;
        if !before.is_empty() {
            return Ok(true);
        }

        let after = read_range(txn, &graph_end, &vec_end, RangeOptions::limited(1))?;
        Ok(!after.is_empty())
    }

    // ---- maintenance ----

    /// Re-select the best neighbors of `pk` at `level` when its degree
    /// exceeds the cap, dropping the rest.
    fn prune_neighbors<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
        level: u8,
    ) -> Result<(), IndexError> {
        let cap = self.params.max_neighbors(level as usize);
        let current = self.neighbors(txn, pk, level)?;
        if current.len() <= cap {
            return Ok(());
        }

        let Some(own) = self.vector(txn, pk)? else {
            return Ok(());
        };

        let mut ranked = Vec::with_capacity(current.len());
        for neighbor in current {
            if let Some(candidate) = self.candidate(txn, &own, neighbor)? {
                ranked.push(candidate);
            }
        }
        ranked.sort();

        for dropped in ranked.iter().skip(cap) {
            self.remove_edge(txn, pk, level, &dropped.pk);
        }

        Ok(())
    }

    fn connect_at_level<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
        candidates: Vec<Candidate>,
        level: u8,
    ) -> Result<(), IndexError> {
        let cap = self.params.max_neighbors(level as usize);

        // closest-first selection
        let selected: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.pk != *pk)
            .take(cap)
            .collect();

        for neighbor in &selected {
            self.add_edge(txn, pk, level, &neighbor.pk);
        }

        for neighbor in &selected {
            self.prune_neighbors(txn, &neighbor.pk, level)?;
        }

        Ok(())
    }

    /// Insert a vector inline, inside the caller's transaction.
    pub fn insert<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
        vector: &[f64],
    ) -> Result<(), IndexError> {
        if self.node_level(txn, pk)?.is_some() {
            // already wired; vector refreshes go through delete + insert
            self.write_vector(txn, pk, vector);
            return Ok(());
        }

        let node_level = self.assign_level(pk);
        self.write_vector(txn, pk, vector);

        let Some((entry_pk, entry_level)) = self.entry_point(txn)? else {
            self.set_node_level(txn, pk, node_level)?;
            self.set_entry_point(txn, pk);
            debug!(index = %self.index.name, level = node_level, "seeded hnsw graph");
            return Ok(());
        };

        let estimate = estimate_insert_ops(entry_level);
        if estimate > MAX_INLINE_OPS {
            return Err(IndexError::internal(format!(
                "index {}: inline insert estimated at {estimate} operations exceeds the \
                 transaction budget of {MAX_INLINE_OPS}; build this index with the online \
                 builder",
                self.index.name
            )));
        }

        let Some(entry) = self.candidate(txn, vector, entry_pk)? else {
            return Err(IndexError::internal(format!(
                "index {}: entry point lost its vector",
                self.index.name
            )));
        };

        let top_connected = node_level.min(entry_level);
        let mut best = self.greedy_descent(txn, vector, entry, entry_level, top_connected)?;

        let mut level = top_connected;
        loop {
            let candidates = self.search_layer(
                txn,
                vector,
                vec![best.clone()],
                self.params.ef_construction,
                level,
            )?;

            if let Some(closest) = candidates.first() {
                best = closest.clone();
            }

            self.connect_at_level(txn, pk, candidates, level)?;

            if level == 0 {
                break;
            }
            level -= 1;
        }

        self.set_node_level(txn, pk, node_level)?;

        if node_level > entry_level {
            self.set_entry_point(txn, pk);
        }

        Ok(())
    }

    /// Remove a node, rewiring its neighbors pairwise so the layer stays
    /// navigable.
    pub fn delete<T: Transaction>(&self, txn: &mut T, pk: &Tuple) -> Result<(), IndexError> {
        let Some(node_level) = self.node_level(txn, pk)? else {
            txn.clear(&self.vector_key(pk));
            return Ok(());
        };

        for level in 0..=node_level {
            let orphans = self.neighbors(txn, pk, level)?;

            // distance-ascending pair candidates among the survivors
            let mut pairs = Vec::new();
            for (i, a) in orphans.iter().enumerate() {
                let Some(vector_a) = self.vector(txn, a)? else {
                    continue;
                };
                for b in orphans.iter().skip(i + 1) {
                    let Some(vector_b) = self.vector(txn, b)? else {
                        continue;
                    };
                    let d = distance(self.params.metric, &vector_a, &vector_b)?;
                    pairs.push((d, a.clone(), b.clone()));
                }
            }
            pairs.sort_by(|x, y| x.0.total_cmp(&y.0));

            let cap = self.params.max_neighbors(level as usize);
            let mut degrees: std::collections::HashMap<Key, usize> =
                std::collections::HashMap::new();
            for node in &orphans {
                degrees.insert(node.pack(), self.neighbors(txn, node, level)?.len());
            }

            for (_, a, b) in pairs {
                let key_a = a.pack();
                let key_b = b.pack();

                let deg_a = degrees.get(&key_a).copied().unwrap_or(0);
                let deg_b = degrees.get(&key_b).copied().unwrap_or(0);
                if deg_a >= cap || deg_b >= cap {
                    continue;
                }

                if txn.get(&self.edge_key(&a, level, &b))?.is_none() {
                    self.add_edge(txn, &a, level, &b);
                    degrees.insert(key_a, deg_a + 1);
                    degrees.insert(key_b, deg_b + 1);
                }
            }

            for orphan in &orphans {
                self.remove_edge(txn, pk, level, orphan);
            }
        }

        txn.clear(&self.nodes.pack(pk));

        // re-elect the entry point if the deleted node held it
        if let Some(raw) = txn.get(&self.entry_key)? {
            if raw == pk.pack() {
                match self.highest_node(txn, pk)? {
                    Some((next_packed, _)) => txn.set(&self.entry_key, &next_packed),
                    None => txn.clear(&self.entry_key),
                }
            }
        }

        txn.clear(&self.vector_key(pk));
        Ok(())
    }

    /// The highest-level node other than `excluded`, scanning the node
    /// metadata.
    fn highest_node<T: Transaction>(
        &self,
        txn: &T,
        excluded: &Tuple,
    ) -> Result<Option<(Key, u8)>, IndexError> {
        let (begin, end) = self.nodes.range();
        let excluded_key = self.nodes.pack(excluded);

        let mut best: Option<(Key, u8)> = None;
        for (key, value) in read_range(txn, &begin, &end, RangeOptions::default())? {
            if key == excluded_key {
                continue;
            }

            let (pk, level) = self.decode_node(&key, &value)?;
            if best.as_ref().map(|(_, l)| level > *l).unwrap_or(true) {
                best = Some((pk.pack(), level));
            }
        }

        Ok(best)
    }

    // ---- level-wise build hooks ----

    /// Phase A hook: store the node's level without touching the graph.
    /// Roughly ten operations per record.
    pub fn assign_level_meta<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
    ) -> Result<u8, IndexError> {
        if let Some(existing) = self.node_level(txn, pk)? {
            return Ok(existing);
        }

        let level = self.assign_level(pk);
        self.set_node_level(txn, pk, level)?;
        Ok(level)
    }

    /// Phase B hook: wire one node at one layer. Bounded by roughly
    /// `ef_construction` reads plus the edge writes, so a handful of calls
    /// fits a single transaction budget.
    pub fn insert_at_level<T: Transaction>(
        &self,
        txn: &mut T,
        pk: &Tuple,
        vector: &[f64],
        level: u8,
    ) -> Result<(), IndexError> {
        self.write_vector(txn, pk, vector);

        let Some((entry_pk, entry_level)) = self.entry_point(txn)? else {
            self.set_entry_point(txn, pk);
            return Ok(());
        };

        if entry_pk == *pk {
            return Ok(());
        }

        let Some(entry) = self.candidate(txn, vector, entry_pk)? else {
            return Err(IndexError::internal(format!(
                "index {}: entry point lost its vector",
                self.index.name
            )));
        };

        let best = self.greedy_descent(txn, vector, entry, entry_level, level)?;
        let candidates = self.search_layer(
            txn,
            vector,
            vec![best],
            self.params.ef_construction,
            level,
        )?;

        self.connect_at_level(txn, pk, candidates, level)?;

        // the level-by-level build visits the tallest nodes first, so a
        // taller node than the current entry takes over
        if let Some(own_level) = self.node_level(txn, pk)? {
            if own_level > entry_level {
                self.set_entry_point(txn, pk);
            }
        }

        Ok(())
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for HnswMaintainer {
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
        match (old, new) {
            (None, None) => Ok(()),
            (Some(old_record), None) => self.delete(txn, &old_record.primary_key()),
            (old, Some(record)) => {
                let pk = record.primary_key();
                let vector = self.vector_of(access, record)?;

                if let Some(old_record) = old {
                    let previous = self.vector_of(access, old_record)?;
                    if previous == vector {
                        return Ok(());
                    }
                    self.delete(txn, &pk)?;
                }

                if self.batch_only {
                    warn!(
                        index = %self.index.name,
                        pk = %pk,
                        "skipping inline hnsw insert; index is batch-only, build it with the online builder"
                    );
                    return Ok(());
                }

                self.insert(txn, &pk, &vector)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxis_core::{IndexKind, KeyExpression, KvStore};
    use taxis_memory::MemoryKv;

    fn maintainer() -> HnswMaintainer {
        let index = Index::new(
            "embeddings",
            IndexKind::Vector,
            KeyExpression::field("embedding"),
            vec!["doc".into()],
        );
        HnswMaintainer::new(index, Subspace::new(b"H".to_vec())).with_seed(7)
    }

    fn pk(id: i64) -> Tuple {
        Tuple::new().with(id)
    }

    fn insert_all(kv: &MemoryKv, hnsw: &HnswMaintainer, vectors: &[(i64, Vec<f64>)]) {
        for (id, vector) in vectors {
            let mut txn = kv.begin().unwrap();
            hnsw.insert(&mut txn, &pk(*id), vector).unwrap();
            txn.commit().unwrap();
        }
    }

    #[test]
    fn test_distance_metrics() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];

        assert!((distance(DistanceMetric::Cosine, &a, &b).unwrap() - 1.0).abs() < 1e-9);
        assert!((distance(DistanceMetric::L2, &a, &b).unwrap() - 2f64.sqrt()).abs() < 1e-9);
        assert_eq!(distance(DistanceMetric::InnerProduct, &a, &b).unwrap(), 0.0);

        // zero-norm convention
        assert_eq!(
            distance(DistanceMetric::Cosine, &[0.0, 0.0], &b).unwrap(),
            2.0
        );

        assert!(distance(DistanceMetric::L2, &a, &[1.0]).is_err());
    }

    #[test]
    fn test_first_insert_seeds_entry_point() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        insert_all(&kv, &hnsw, &[(1, vec![1.0, 2.0])]);

        let txn = kv.begin().unwrap();
        let (entry, _level) = hnsw.entry_point(&txn).unwrap().unwrap();
        assert_eq!(entry, pk(1));
        assert_eq!(hnsw.vector(&txn, &pk(1)).unwrap().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_search_finds_nearest() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        let vectors: Vec<(i64, Vec<f64>)> = (0..30)
            .map(|i| (i, vec![i as f64, (i * i) as f64 % 7.0]))
            .collect();
        insert_all(&kv, &hnsw, &vectors);

        let txn = kv.begin().unwrap();
        let hits = hnsw.search(&txn, &[10.1, 2.0], 3, 20).unwrap();

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].pk, pk(10));
        assert!(hits[0].distance <= hits[1].distance);
        assert!(hits[1].distance <= hits[2].distance);
    }

    #[test]
    fn test_search_rejects_small_ef() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        let txn = kv.begin().unwrap();
        let err = hnsw.search(&txn, &[0.0], 10, 5).unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
    }

    #[test]
    fn test_search_on_empty_graph_is_empty() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        let txn = kv.begin().unwrap();
        assert!(hnsw.search(&txn, &[0.0, 0.0], 1, 1).unwrap().is_empty());
    }

    #[test]
    fn test_vectors_without_graph_report_not_built() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        let mut txn = kv.begin().unwrap();
        hnsw.write_vector(&mut txn, &pk(1), &[1.0, 2.0]);
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        let err = hnsw.search(&txn, &[0.0, 0.0], 1, 1).unwrap_err();
        assert!(matches!(err, IndexError::GraphNotBuilt { .. }));
    }

    #[test]
    fn test_edges_are_bidirectional_and_capped() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        let vectors: Vec<(i64, Vec<f64>)> =
            (0..60).map(|i| (i, vec![(i % 8) as f64, (i / 8) as f64])).collect();
        insert_all(&kv, &hnsw, &vectors);

        let txn = kv.begin().unwrap();
        for (id, _) in &vectors {
            let level = hnsw.node_level(&txn, &pk(*id)).unwrap().unwrap();
            for l in 0..=level {
                let neighbors = hnsw.neighbors(&txn, &pk(*id), l).unwrap();
                assert!(neighbors.len() <= hnsw.params().max_neighbors(l as usize));

                for neighbor in &neighbors {
                    let back = hnsw.neighbors(&txn, neighbor, l).unwrap();
                    assert!(back.contains(&pk(*id)), "edge {id}->{neighbor} not mirrored");
                }
            }
        }
    }

    #[test]
    fn test_delete_rewires_and_reelects_entry() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();

        let vectors: Vec<(i64, Vec<f64>)> =
            (0..20).map(|i| (i, vec![i as f64, 0.0])).collect();
        insert_all(&kv, &hnsw, &vectors);

        let (entry, _) = {
            let txn = kv.begin().unwrap();
            hnsw.entry_point(&txn).unwrap().unwrap()
        };

        let mut txn = kv.begin().unwrap();
        hnsw.delete(&mut txn, &entry).unwrap();
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        let (new_entry, _) = hnsw.entry_point(&txn).unwrap().unwrap();
        assert_ne!(new_entry, entry);
        assert!(hnsw.vector(&txn, &entry).unwrap().is_none());

        // deleted node left no edges behind
        let hits = hnsw.search(&txn, &[5.0, 0.0], 5, 20).unwrap();
        assert!(hits.iter().all(|h| h.pk != entry));
    }

    #[test]
    fn test_delete_last_node_clears_entry() {
        let kv = MemoryKv::new();
        let hnsw = maintainer();
        insert_all(&kv, &hnsw, &[(1, vec![1.0])]);

        let mut txn = kv.begin().unwrap();
        hnsw.delete(&mut txn, &pk(1)).unwrap();
        txn.commit().unwrap();

        let txn = kv.begin().unwrap();
        assert!(hnsw.entry_point(&txn).unwrap().is_none());
        assert!(hnsw.search(&txn, &[0.0], 1, 1).unwrap().is_empty());
    }

    #[test]
    fn test_assign_level_is_deterministic() {
        let hnsw = maintainer();
        assert_eq!(hnsw.assign_level(&pk(42)), hnsw.assign_level(&pk(42)));

        // levels follow a decaying distribution: most nodes at level 0
        let ground = (0..200).filter(|i| hnsw.assign_level(&pk(*i)) == 0).count();
        assert!(ground > 150);
    }
}
