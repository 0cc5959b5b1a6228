//! Fixed-dimension HNSW index with dense `u32` labels.
//!
//! The graph has no removal or resize, so the raw vectors are cached by
//! label and the graph is rebuilt from them whenever capacity changes.
//! Without a graph (small index, a zero or non-finite vector, or a failed
//! insert) searches scan the cache; a missing graph is rebuilt each time the
//! count reaches a power of two. Distances returned to callers are always
//! exact cosine distances.
use anndists::dist::distances::DistCosine;
use hnsw_rs::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

/// Below this many candidates the whole cache is scanned exactly.
const MIN_CANDIDATES: usize = 64;
/// Smallest count at which a missing graph is built.
const GRAPH_THRESHOLD: usize = 2 * MIN_CANDIDATES;
const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;

type Graph = Hnsw<'static, f32, DistCosine>;

pub struct VectorIndex {
    dimension: usize,
    capacity: usize,
    points: Vec<Vec<f32>>,
    ann: Option<Graph>,
}

impl VectorIndex {
    /// Empty index able to hold `capacity` points before it must grow.
    pub fn new(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            capacity,
            points: Vec::new(),
            ann: None,
        }
    }

    /// Index over `points`, where a point's position is its label.
    pub fn from_points(dimension: usize, capacity: usize, points: Vec<Vec<f32>>) -> Result<Self> {
        if let Some(bad) = points.iter().find(|p| p.len() != dimension) {
            return Err(MemoryError::index(format!(
                "point of dimension {} in index of dimension {}",
                bad.len(),
                dimension
            )));
        }
        let mut index = Self {
            dimension,
            capacity: capacity.max(points.len()),
            points,
            ann: None,
        };
        index.rebuild_graph();
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn current_count(&self) -> usize {
        self.points.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.capacity
    }

    pub fn points(&self) -> &[Vec<f32>] {
        &self.points
    }

    /// True when a graph backs searches; otherwise they scan every point.
    pub fn has_graph(&self) -> bool {
        self.ann.is_some()
    }

    /// Append `vector` under `label`, which must equal the current count.
    pub fn add_point(&mut self, vector: &[f32], label: u32) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::index(format!(
                "point of dimension {} in index of dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        if label as usize != self.points.len() {
            return Err(MemoryError::index(format!(
                "label {} is not the next dense label {}",
                label,
                self.points.len()
            )));
        }
        if self.is_full() {
            return Err(MemoryError::index(format!("index is full at capacity {}", self.capacity)));
        }

        self.points.push(vector.to_vec());

        if self.ann.is_some() {
            let inserted = match (self.ann.as_ref(), self.points.last()) {
                (Some(ann), Some(point)) if graphable(point) => {
                    panic::catch_unwind(AssertUnwindSafe(|| ann.insert((point, label as usize)))).is_ok()
                }
                _ => false,
            };
            if !inserted {
                debug!("Graph insert of label {} failed, using exact scan until next rebuild", label);
                self.ann = None;
            }
        } else if self.points.len() >= GRAPH_THRESHOLD && self.points.len().is_power_of_two() {
            self.rebuild_graph();
        }
        Ok(())
    }

    /// Change capacity, keeping every point. Shrinking below the current
    /// count is rejected.
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity < self.points.len() {
            return Err(MemoryError::index(format!(
                "cannot resize to {} below current count {}",
                new_capacity,
                self.points.len()
            )));
        }
        debug!("Resizing index from {} to {}", self.capacity, new_capacity);
        self.capacity = new_capacity;
        self.rebuild_graph();
        Ok(())
    }

    /// Grow per `grown_capacity` when no room is left for one more point.
    /// Returns the new capacity when a resize happened.
    pub fn ensure_room(&mut self) -> Result<Option<usize>> {
        if !self.is_full() {
            return Ok(None);
        }
        let target = grown_capacity(self.capacity);
        self.resize(target)?;
        Ok(Some(target))
    }

    /// The `k` nearest labels to `query` with their cosine distances,
    /// closest first. `k` is clamped to the current count.
    pub fn search_knn(&self, query: &[f32], k: usize) -> Result<(Vec<u32>, Vec<f32>)> {
        if query.len() != self.dimension {
            return Err(MemoryError::index(format!(
                "query of dimension {} against index of dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let k = k.min(self.points.len());
        if k == 0 {
            return Ok((Vec::new(), Vec::new()));
        }

        let wanted = (k * 2).max(MIN_CANDIDATES);
        let graph_candidates = match &self.ann {
            Some(ann) if wanted < self.points.len() && graphable(query) => {
                let ef = wanted.saturating_mul(2).clamp(50, 10_000);
                panic::catch_unwind(AssertUnwindSafe(|| ann.search(query, wanted, ef)))
                    .ok()
                    .map(|found| found.into_iter().map(|n| n.d_id).collect::<Vec<usize>>())
            }
            _ => None,
        };
        let candidates = graph_candidates.unwrap_or_else(|| (0..self.points.len()).collect());

        let mut scored: Vec<(u32, f32)> = candidates
            .into_iter()
            .filter_map(|label| {
                self.points
                    .get(label)
                    .map(|point| (label as u32, cosine_distance(query, point)))
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.dedup_by_key(|(label, _)| *label);
        scored.truncate(k);

        Ok(scored.into_iter().unzip())
    }

    /// Drop every point, keeping dimension and capacity.
    pub fn clear(&mut self) {
        self.points.clear();
        self.ann = None;
    }

    fn rebuild_graph(&mut self) {
        self.ann = None;
        if self.points.is_empty() {
            return;
        }
        if let Some(label) = self.points.iter().position(|p| !graphable(p)) {
            debug!("Label {} has a zero or non-finite vector; searches scan exactly", label);
            return;
        }

        let max_elements = self.capacity.max(self.points.len());
        let points = &self.points;
        let built = panic::catch_unwind(AssertUnwindSafe(|| {
            let graph = Graph::new(MAX_NB_CONNECTION, max_elements, MAX_LAYER, EF_CONSTRUCTION, DistCosine {});
            for (label, point) in points.iter().enumerate() {
                graph.insert((point, label));
            }
            graph
        }));
        match built {
            Ok(graph) => self.ann = Some(graph),
            Err(_) => warn!("Graph build over {} points failed; falling back to exact scan", points.len()),
        }
    }
}

/// Cosine distance is undefined for zero vectors, and NaN or infinite
/// components poison neighbour ordering.
fn graphable(vector: &[f32]) -> bool {
    vector.iter().all(|x| x.is_finite()) && vector.iter().any(|x| *x != 0.0)
}

/// Capacity after one growth step: `max(1000, ceil(0.2 * capacity))` more.
pub fn grown_capacity(capacity: usize) -> usize {
    let step = (capacity + 4) / 5;
    capacity + step.max(1000)
}

/// `1 - cos(a, b)`, in `[0, 2]`. Zero vectors are treated as orthogonal.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nearest_points_come_first() {
        let mut index = VectorIndex::new(4, 10);
        index.add_point(&[1.0, 0.0, 0.0, 0.0], 0).unwrap();
        index.add_point(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        index.add_point(&[0.9, 0.1, 0.0, 0.0], 2).unwrap();

        let (labels, distances) = index.search_knn(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(labels, vec![0, 2]);
        assert!(distances[0] < 1e-6);
        assert!(distances[0] <= distances[1]);
    }

    #[test]
    fn k_is_clamped_and_empty_index_returns_nothing() {
        let mut index = VectorIndex::new(2, 4);
        assert_eq!(index.search_knn(&[1.0, 0.0], 5).unwrap(), (vec![], vec![]));
        index.add_point(&[1.0, 0.0], 0).unwrap();
        let (labels, _) = index.search_knn(&[1.0, 0.0], 5).unwrap();
        assert_eq!(labels, vec![0]);
    }

    #[test]
    fn labels_must_be_dense_and_dimensions_exact() {
        let mut index = VectorIndex::new(2, 4);
        assert!(index.add_point(&[1.0, 0.0], 1).is_err());
        assert!(index.add_point(&[1.0, 0.0, 0.0], 0).is_err());
        assert!(index.search_knn(&[1.0], 1).is_err());
        assert_eq!(index.current_count(), 0);
    }

    #[test]
    fn full_index_refuses_until_grown() {
        let mut index = VectorIndex::new(2, 1);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        assert!(index.add_point(&[0.0, 1.0], 1).is_err());
        assert_eq!(index.ensure_room().unwrap(), Some(1001));
        index.add_point(&[0.0, 1.0], 1).unwrap();
        assert_eq!(index.ensure_room().unwrap(), None);

        let (labels, _) = index.search_knn(&[0.0, 1.0], 1).unwrap();
        assert_eq!(labels, vec![1]);
    }

    #[test]
    fn resize_preserves_points_and_rejects_shrink() {
        let points: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32, 1.0]).collect();
        let mut index = VectorIndex::from_points(2, 5, points.clone()).unwrap();
        assert!(index.resize(4).is_err());
        index.resize(50).unwrap();
        assert_eq!(index.max_capacity(), 50);
        assert_eq!(index.points(), points.as_slice());
    }

    #[test]
    fn clear_keeps_shape() {
        let mut index = VectorIndex::from_points(2, 8, vec![vec![1.0, 1.0]]).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.max_capacity(), 8);
        index.add_point(&[0.5, 0.5], 0).unwrap();
    }

    #[test]
    fn larger_index_still_finds_exact_match() {
        let points: Vec<Vec<f32>> = (0..300)
            .map(|i| {
                let angle = i as f32 * 0.02;
                vec![angle.cos(), angle.sin(), (i % 7) as f32 * 0.01]
            })
            .collect();
        let index = VectorIndex::from_points(3, 400, points.clone()).unwrap();
        let (labels, distances) = index.search_knn(&points[123], 1).unwrap();
        assert_eq!(labels.len(), 1);
        assert!(distances[0] < 1e-3);
    }

    #[test]
    fn graph_appears_once_index_is_large_enough() {
        let mut index = VectorIndex::new(2, 1000);
        for label in 0..GRAPH_THRESHOLD as u32 {
            let angle = label as f32 * 0.01;
            index.add_point(&[angle.cos(), angle.sin()], label).unwrap();
        }
        assert!(index.has_graph());
        let (labels, _) = index.search_knn(&[1.0, 0.0], 1).unwrap();
        assert_eq!(labels, vec![0]);
    }

    #[test]
    fn inserts_past_the_graph_threshold_stay_searchable() {
        let mut index = VectorIndex::new(3, 1000);
        for label in 0..300u32 {
            let angle = label as f32 * 0.021;
            let point = [angle.cos(), angle.sin(), (label % 5) as f32 * 0.1];
            index.add_point(&point, label).unwrap();
        }
        assert_eq!(index.current_count(), 300);
        assert!(index.has_graph());

        for label in [0u32, 127, 128, 129, 255, 299] {
            let angle = label as f32 * 0.021;
            let query = [angle.cos(), angle.sin(), (label % 5) as f32 * 0.1];
            let (labels, distances) = index.search_knn(&query, 3).unwrap();
            assert_eq!(labels.len(), 3);
            assert!(distances[0] < 1e-4, "label {} not found: {:?}", label, distances);
        }
    }

    #[test]
    fn rebuilt_graph_over_skewed_vectors_finds_every_point() {
        let points: Vec<Vec<f32>> = (0..200)
            .map(|i| {
                let x = i as f32;
                vec![1.0 + x, -0.5 * x, (x * 0.3).sin(), 1e-3 * x]
            })
            .collect();
        let mut index = VectorIndex::from_points(4, 210, points.clone()).unwrap();
        index.resize(2000).unwrap();
        assert!(index.has_graph());
        for target in [3usize, 64, 150, 199] {
            let (_, distances) = index.search_knn(&points[target], 1).unwrap();
            assert!(distances[0] < 1e-4);
        }
    }

    #[test]
    fn zero_vector_falls_back_to_exact_scan() {
        let mut points: Vec<Vec<f32>> = (0..130)
            .map(|i| {
                let angle = i as f32 * 0.03;
                vec![angle.cos(), angle.sin()]
            })
            .collect();
        points[7] = vec![0.0, 0.0];
        let index = VectorIndex::from_points(2, 200, points).unwrap();
        assert!(!index.has_graph());

        let (labels, _) = index.search_knn(&[1.0, 0.0], 1).unwrap();
        assert_eq!(labels, vec![0]);
        let (labels, _) = index.search_knn(&[0.0, 0.0], 130).unwrap();
        assert_eq!(labels.len(), 130);
    }

    #[test]
    fn growth_step_examples() {
        assert_eq!(grown_capacity(0), 1000);
        assert_eq!(grown_capacity(10_000), 12_000);
        assert_eq!(grown_capacity(10_001), 12_002);
    }

    proptest! {
        #[test]
        fn growth_adds_at_least_a_fifth_and_a_thousand(capacity in 0usize..10_000_000) {
            let grown = grown_capacity(capacity);
            prop_assert!(grown - capacity >= 1000);
            prop_assert!((grown - capacity) * 5 >= capacity);
            prop_assert!(grown - capacity <= 1000usize.max(capacity / 5 + 1));
        }

        #[test]
        fn cosine_distance_stays_in_range(
            a in prop::collection::vec(-100.0f32..100.0, 8),
            b in prop::collection::vec(-100.0f32..100.0, 8),
        ) {
            let d = cosine_distance(&a, &b);
            prop_assert!((0.0..=2.0).contains(&d));
            prop_assert!((cosine_distance(&a, &b) - cosine_distance(&b, &a)).abs() < 1e-5);
        }
    }
}
