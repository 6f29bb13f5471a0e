//! Approximate Nearest Neighbor Index
//!
//! Hierarchical Navigable Small World graph over sparse vectors with cosine
//! distance.
//!
//! # Algorithm
//!
//! Elements are inserted one by one at a random top level and connected to
//! their `M` closest already-inserted neighbours on every level they live on
//! (`2 * M` on the bottom level). Queries descend greedily from the entry
//! point through the upper levels and run a best-first beam search of width
//! `ef_search` on the bottom level. Larger `M` and `ef_construction` raise
//! recall at the cost of build time.
//!
//! The graph is persisted separately from the vectors: loading an index means
//! handing it the same vector matrix it was built from.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use taxo_core::{Result, TaxoError};
use tracing::{debug, info};

use crate::sparse::{cosine_distance, SparseVector};

/// Levels above this are never assigned
const MAX_LEVEL: usize = 16;

/// Index construction and query parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Neighbours per element on upper levels
    pub m: usize,
    /// Beam width during construction
    pub ef_construction: usize,
    /// Beam width during queries
    pub ef_search: usize,
    /// Seed for level assignment
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 100,
            ef_construction: 2000,
            ef_search: 200,
            seed: 42,
        }
    }
}

/// One query result: position of the vector in the index and its distance
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

impl Neighbor {
    /// Cosine similarity, in [0, 1]
    pub fn similarity(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

/// Persisted graph structure
#[derive(Debug, Serialize, Deserialize)]
struct GraphState {
    params: HnswParams,
    entry_point: Option<usize>,
    max_level: usize,
    /// links[element][level] = neighbour positions
    links: Vec<Vec<Vec<u32>>>,
}

/// HNSW index over a fixed set of sparse vectors
pub struct AnnIndex {
    params: HnswParams,
    vectors: Vec<SparseVector>,
    norms: Vec<f32>,
    links: Vec<Vec<Vec<u32>>>,
    entry_point: Option<usize>,
    max_level: usize,
}

impl AnnIndex {
    /// Build an index over `vectors`
    ///
    /// Zero vectors cannot be compared under cosine distance and are refused;
    /// callers drop them before building.
    pub fn build(vectors: Vec<SparseVector>, params: HnswParams) -> Result<Self> {
        if params.m < 2 {
            return Err(TaxoError::ValidationError(format!(
                "HNSW connectivity M must be at least 2, got {}",
                params.m
            )));
        }
        if let Some(position) = vectors.iter().position(|v| v.is_zero()) {
            return Err(TaxoError::IndexError(format!(
                "Vector {position} is all zeros and cannot be indexed"
            )));
        }

        let started = std::time::Instant::now();
        let norms = vectors.iter().map(|v| v.norm()).collect();
        let mut index = Self {
            params,
            links: Vec::with_capacity(vectors.len()),
            vectors,
            norms,
            entry_point: None,
            max_level: 0,
        };

        let mut rng = StdRng::seed_from_u64(params.seed);
        let level_multiplier = 1.0 / (params.m as f64).ln();
        for element in 0..index.vectors.len() {
            let uniform: f64 = rng.gen();
            let level =
                ((-(1.0 - uniform).ln() * level_multiplier).floor() as usize).min(MAX_LEVEL);
            index.insert(element, level);
        }

        info!(
            elements = index.len(),
            m = params.m,
            ef_construction = params.ef_construction,
            levels = index.max_level + 1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built HNSW index"
        );
        Ok(index)
    }

    /// Attach a persisted graph to the vectors it was built from
    pub fn load(path: impl AsRef<Path>, vectors: Vec<SparseVector>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| TaxoError::NotFound(format!("{}: {e}", path.display())))?;
        let state: GraphState = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| TaxoError::ParseError(format!("Invalid index {}: {e}", path.display())))?;

        if state.links.len() != vectors.len() {
            return Err(TaxoError::IndexError(format!(
                "Index {} has {} elements but {} vectors were supplied",
                path.display(),
                state.links.len(),
                vectors.len()
            )));
        }
        let out_of_range = state
            .links
            .iter()
            .flatten()
            .flatten()
            .any(|n| *n as usize >= vectors.len());
        if out_of_range || state.entry_point.is_some_and(|ep| ep >= vectors.len()) {
            return Err(TaxoError::IndexError(format!(
                "Index {} references elements outside the vector set",
                path.display()
            )));
        }

        let norms = vectors.iter().map(|v| v.norm()).collect();
        Ok(Self {
            params: state.params,
            vectors,
            norms,
            links: state.links,
            entry_point: state.entry_point,
            max_level: state.max_level,
        })
    }

    /// Persist the graph (not the vectors)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state = GraphState {
            params: self.params,
            entry_point: self.entry_point,
            max_level: self.max_level,
            links: self.links.clone(),
        };
        let file = std::fs::File::create(path).map_err(|e| {
            TaxoError::StorageError(format!("Failed to create {}: {e}", path.display()))
        })?;
        serde_json::to_writer(std::io::BufWriter::new(file), &state).map_err(|e| {
            TaxoError::StorageError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Set the query-time beam width
    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.params.ef_search = ef_search.max(1);
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Up to `k` nearest neighbours, closest first
    ///
    /// A zero query vector is an error: it has no direction to compare.
    pub fn knn_query(&self, query: &SparseVector, k: usize) -> Result<Vec<Neighbor>> {
        if query.is_zero() {
            return Err(TaxoError::IndexError(
                "All-zero query vectors cannot be searched".to_string(),
            ));
        }
        let Some(entry_point) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_norm = query.norm();
        let mut nearest = Neighbor {
            index: entry_point,
            distance: self.distance_to(query, query_norm, entry_point),
        };
        for level in (1..=self.max_level).rev() {
            nearest = self.greedy_closest(query, query_norm, nearest, level);
        }

        let ef = self.params.ef_search.max(k);
        let mut found = self.search_level(query, query_norm, &[nearest], ef, 0);
        found.truncate(k);
        Ok(found)
    }

    /// Query a batch; result `i` belongs to query `i`
    pub fn knn_query_batch(
        &self,
        queries: &[SparseVector],
        k: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        let started = std::time::Instant::now();
        let results = queries
            .iter()
            .map(|q| self.knn_query(q, k))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            queries = queries.len(),
            k,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished batch neighbour search"
        );
        Ok(results)
    }

    fn distance_to(&self, query: &SparseVector, query_norm: f32, element: usize) -> f32 {
        cosine_distance(query, query_norm, &self.vectors[element], self.norms[element])
    }

    fn neighbours(&self, element: usize, level: usize) -> &[u32] {
        self.links[element]
            .get(level)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn greedy_closest(
        &self,
        query: &SparseVector,
        query_norm: f32,
        mut current: Neighbor,
        level: usize,
    ) -> Neighbor {
        loop {
            let mut improved = false;
            for &n in self.neighbours(current.index, level) {
                let candidate = Neighbor {
                    index: n as usize,
                    distance: self.distance_to(query, query_norm, n as usize),
                };
                if candidate < current {
                    current = candidate;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first beam search on one level; returns closest first
    fn search_level(
        &self,
        query: &SparseVector,
        query_norm: f32,
        entry_points: &[Neighbor],
        ef: usize,
        level: usize,
    ) -> Vec<Neighbor> {
        let mut visited: HashSet<usize> = entry_points.iter().map(|n| n.index).collect();
        let mut candidates: BinaryHeap<Reverse<Neighbor>> =
            entry_points.iter().copied().map(Reverse).collect();
        let mut results: BinaryHeap<Neighbor> = entry_points.iter().copied().collect();
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(closest)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && closest > *worst {
                    break;
                }
            }

            for &n in self.neighbours(closest.index, level) {
                let n = n as usize;
                if !visited.insert(n) {
                    continue;
                }
                let candidate = Neighbor {
                    index: n,
                    distance: self.distance_to(query, query_norm, n),
                };
                let admit = results.len() < ef || results.peek().is_some_and(|w| candidate < *w);
                if admit {
                    candidates.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn insert(&mut self, element: usize, level: usize) {
        self.links.push(vec![Vec::new(); level + 1]);

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(element);
            self.max_level = level;
            return;
        };

        let query = self.vectors[element].clone();
        let query_norm = self.norms[element];
        let mut nearest = Neighbor {
            index: entry_point,
            distance: self.distance_to(&query, query_norm, entry_point),
        };
        for l in (level + 1..=self.max_level).rev() {
            nearest = self.greedy_closest(&query, query_norm, nearest, l);
        }

        let mut entry_points = vec![nearest];
        for l in (0..=level.min(self.max_level)).rev() {
            let found = self.search_level(
                &query,
                query_norm,
                &entry_points,
                self.params.ef_construction.max(self.params.m),
                l,
            );

            let selected: Vec<u32> = found
                .iter()
                .filter(|n| n.index != element)
                .take(self.params.m)
                .map(|n| n.index as u32)
                .collect();
            for &n in &selected {
                self.connect(n as usize, element, l);
            }
            self.links[element][l] = selected;
            entry_points = found;
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(element);
        }
    }

    /// Add a back-link from `from` to `to`, pruning `from` to its closest
    /// neighbours when it exceeds the level's capacity
    fn connect(&mut self, from: usize, to: usize, level: usize) {
        let capacity = if level == 0 {
            2 * self.params.m
        } else {
            self.params.m
        };
        self.links[from][level].push(to as u32);
        if self.links[from][level].len() <= capacity {
            return;
        }

        let base = &self.vectors[from];
        let base_norm = self.norms[from];
        let mut ranked: Vec<Neighbor> = self.links[from][level]
            .iter()
            .map(|&n| Neighbor {
                index: n as usize,
                distance: cosine_distance(
                    base,
                    base_norm,
                    &self.vectors[n as usize],
                    self.norms[n as usize],
                ),
            })
            .collect();
        ranked.sort();
        ranked.truncate(capacity);
        self.links[from][level] = ranked.into_iter().map(|n| n.index as u32).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tfidf::{TfidfVectorizer, VectorizerParams};

    fn small_params() -> HnswParams {
        HnswParams {
            m: 8,
            ef_construction: 64,
            ef_search: 64,
            seed: 7,
        }
    }

    fn species() -> Vec<String> {
        let genera = ["Ursus", "Canis", "Felis", "Panthera", "Vulpes", "Quercus", "Pinus"];
        let epithets = ["arctos", "lupus", "catus", "leo", "vulpes", "robur", "sylvestris"];
        genera
            .iter()
            .flat_map(|g| epithets.iter().map(move |e| format!("{g} {e}")))
            .collect()
    }

    fn vectors(texts: &[String]) -> (TfidfVectorizer, Vec<SparseVector>) {
        TfidfVectorizer::fit_transform(texts, VectorizerParams { ngram: 3, min_df: 1 }).unwrap()
    }

    #[test]
    fn test_each_element_finds_itself() {
        let texts = species();
        let (_, vecs) = vectors(&texts);
        let index = AnnIndex::build(vecs.clone(), small_params()).unwrap();

        for (i, v) in vecs.iter().enumerate() {
            let found = index.knn_query(v, 3).unwrap();
            assert_eq!(found[0].index, i, "query {} returned {:?}", texts[i], found);
            assert!(found[0].distance.abs() < 1e-5);
        }
    }

    #[test]
    fn test_results_sorted_and_bounded() {
        let texts = species();
        let (vectorizer, vecs) = vectors(&texts);
        let index = AnnIndex::build(vecs, small_params()).unwrap();

        let query = vectorizer.transform(&["Ursus arctos horribilis".to_string()]);
        let found = index.knn_query(&query[0], 5).unwrap();
        assert_eq!(found.len(), 5);
        assert!(found.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(found.iter().all(|n| (0.0..=1.0).contains(&n.similarity())));
        assert_eq!(texts[found[0].index], "Ursus arctos");
    }

    #[test]
    fn test_zero_vectors_rejected() {
        let err = AnnIndex::build(vec![SparseVector::default()], small_params());
        assert!(matches!(err, Err(TaxoError::IndexError(_))));

        let (_, vecs) = vectors(&species());
        let index = AnnIndex::build(vecs, small_params()).unwrap();
        assert!(index.knn_query(&SparseVector::default(), 3).is_err());
    }

    #[test]
    fn test_empty_index() {
        let index = AnnIndex::build(Vec::new(), small_params()).unwrap();
        let query = SparseVector::from_pairs(vec![(0, 1.0)]);
        assert!(index.knn_query(&query, 3).unwrap().is_empty());
    }

    #[test]
    fn test_build_is_deterministic_and_persistable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann_index.json");

        let texts = species();
        let (vectorizer, vecs) = vectors(&texts);
        let index = AnnIndex::build(vecs.clone(), small_params()).unwrap();
        index.save(&path).unwrap();
        let loaded = AnnIndex::load(&path, vecs.clone()).unwrap();

        let query = vectorizer.transform(&["Canis lupus familiaris".to_string()]);
        let ids = |index: &AnnIndex| -> Vec<usize> {
            index
                .knn_query(&query[0], 4)
                .unwrap()
                .iter()
                .map(|n| n.index)
                .collect()
        };
        let (a, b) = (ids(&index), ids(&loaded));
        assert_eq!(a, b);

        assert!(AnnIndex::load(&path, vecs[1..].to_vec()).is_err());
    }
}
