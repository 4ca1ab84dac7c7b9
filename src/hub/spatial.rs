//! Spatial hash grid for area-scoped delivery
//!
//! Participants are bucketed by position into square cells. A radius query
//! visits only the cells overlapped by the query's bounding box, then filters
//! by exact distance.

use std::hash::Hash;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::util::vec2::Vec2;

/// Default cell edge (world units), about the size of a typical area broadcast
pub const DEFAULT_CELL_SIZE: f32 = 128.0;

/// Initial capacity for the cell map (number of expected non-empty cells)
const GRID_INITIAL_CAPACITY: usize = 256;

/// Grid cell key - (x, y) cell coordinates
pub type CellKey = (i32, i32);

type Bucket<K> = SmallVec<[K; 8]>;

#[derive(Debug, Clone, Copy)]
struct Entry {
    position: Vec2,
    cell: CellKey,
}

/// Summary of grid occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct SpatialStats {
    pub entries: usize,
    pub cells: usize,
    pub max_per_cell: usize,
}

/// Spatial index keyed by `K`, holding at most one position per key
#[derive(Debug)]
pub struct SpatialIndex<K> {
    cell_size: f32,
    inv_cell_size: f32,
    entries: HashMap<K, Entry>,
    cells: HashMap<CellKey, Bucket<K>>,
}

impl<K: Copy + Eq + Hash> Default for SpatialIndex<K> {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

impl<K: Copy + Eq + Hash> SpatialIndex<K> {
    /// Create an index with the given cell edge. Non-positive sizes fall back
    /// to [`DEFAULT_CELL_SIZE`].
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE
        };
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            entries: HashMap::new(),
            cells: HashMap::with_capacity(GRID_INITIAL_CAPACITY),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Convert world position to cell key
    #[inline]
    fn position_to_cell(&self, position: Vec2) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
        )
    }

    /// Insert or move `key`. Returns false (and leaves the index untouched)
    /// for non-finite positions.
    pub fn upsert(&mut self, key: K, position: Vec2) -> bool {
        if !position.is_finite() {
            return false;
        }

        let cell = self.position_to_cell(position);
        match self.entries.insert(key, Entry { position, cell }) {
            Some(previous) if previous.cell == cell => {}
            Some(previous) => {
                self.detach(key, previous.cell);
                self.cells.entry(cell).or_default().push(key);
            }
            None => self.cells.entry(cell).or_default().push(key),
        }
        true
    }

    /// Remove `key`, returning its last position
    pub fn remove(&mut self, key: &K) -> Option<Vec2> {
        let entry = self.entries.remove(key)?;
        self.detach(*key, entry.cell);
        Some(entry.position)
    }

    fn detach(&mut self, key: K, cell: CellKey) {
        if let Some(members) = self.cells.get_mut(&cell) {
            if let Some(idx) = members.iter().position(|k| *k == key) {
                members.swap_remove(idx);
            }
            if members.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    pub fn position(&self, key: &K) -> Option<Vec2> {
        self.entries.get(key).map(|entry| entry.position)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Call `visit` for every key within `radius` of `center` (inclusive)
    pub fn for_each_within<F>(&self, center: Vec2, radius: f32, mut visit: F)
    where
        F: FnMut(K, Vec2),
    {
        if radius.is_nan() || radius < 0.0 || !center.is_finite() || self.entries.is_empty() {
            return;
        }

        let radius_sq = radius * radius;
        let mut check = |members: &Bucket<K>| {
            for key in members {
                if let Some(entry) = self.entries.get(key) {
                    if entry.position.distance_sq_to(center) <= radius_sq {
                        visit(*key, entry.position);
                    }
                }
            }
        };

        let (min_x, min_y) = self.position_to_cell(center - Vec2::new(radius, radius));
        let (max_x, max_y) = self.position_to_cell(center + Vec2::new(radius, radius));
        let span = (max_x as i64 - min_x as i64 + 1).saturating_mul(max_y as i64 - min_y as i64 + 1);

        if span > self.cells.len() as i64 {
            // Huge radius: cheaper to walk what is occupied
            for members in self.cells.values() {
                check(members);
            }
            return;
        }

        for cx in min_x..=max_x {
            for cy in min_y..=max_y {
                if let Some(members) = self.cells.get(&(cx, cy)) {
                    check(members);
                }
            }
        }
    }

    /// Keys within `radius` of `center`
    pub fn query_radius(&self, center: Vec2, radius: f32) -> Vec<K> {
        let mut found = Vec::new();
        self.for_each_within(center, radius, |key, _| found.push(key));
        found
    }

    pub fn stats(&self) -> SpatialStats {
        SpatialStats {
            entries: self.entries.len(),
            cells: self.cells.len(),
            max_per_cell: self.cells.values().map(|c| c.len()).max().unwrap_or(0),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sorted(mut keys: Vec<u32>) -> Vec<u32> {
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_query_within_radius() {
        let mut index = SpatialIndex::new(100.0);
        index.upsert(1, Vec2::new(0.0, 0.0));
        index.upsert(2, Vec2::new(50.0, 0.0));
        index.upsert(3, Vec2::new(500.0, 500.0));

        assert_eq!(sorted(index.query_radius(Vec2::ZERO, 60.0)), vec![1, 2]);
        assert_eq!(index.query_radius(Vec2::new(500.0, 500.0), 1.0), vec![3]);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let mut index = SpatialIndex::new(10.0);
        index.upsert(1, Vec2::new(30.0, 40.0));
        assert_eq!(index.query_radius(Vec2::ZERO, 50.0), vec![1]);
        assert!(index.query_radius(Vec2::ZERO, 49.9).is_empty());
    }

    #[test]
    fn test_negative_coordinates() {
        let mut index = SpatialIndex::new(16.0);
        index.upsert(1, Vec2::new(-1.0, -1.0));
        index.upsert(2, Vec2::new(1.0, 1.0));
        assert_eq!(sorted(index.query_radius(Vec2::ZERO, 2.0)), vec![1, 2]);
    }

    #[test]
    fn test_move_across_cells() {
        let mut index = SpatialIndex::new(10.0);
        index.upsert(7, Vec2::new(1.0, 1.0));
        index.upsert(7, Vec2::new(95.0, 95.0));

        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().cells, 1);
        assert!(index.query_radius(Vec2::new(1.0, 1.0), 5.0).is_empty());
        assert_eq!(index.query_radius(Vec2::new(95.0, 95.0), 5.0), vec![7]);
    }

    #[test]
    fn test_remove_drops_empty_cell() {
        let mut index = SpatialIndex::new(10.0);
        index.upsert(1, Vec2::new(5.0, 5.0));
        assert_eq!(index.remove(&1), Some(Vec2::new(5.0, 5.0)));
        assert_eq!(index.remove(&1), None);
        assert!(index.is_empty());
        assert_eq!(index.stats(), SpatialStats::default());
    }

    #[test]
    fn test_rejects_non_finite_position() {
        let mut index = SpatialIndex::new(10.0);
        assert!(!index.upsert(1, Vec2::new(f32::NAN, 0.0)));
        assert!(!index.upsert(1, Vec2::new(0.0, f32::INFINITY)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_degenerate_radius() {
        let mut index = SpatialIndex::new(10.0);
        index.upsert(1, Vec2::new(3.0, 4.0));

        assert!(index.query_radius(Vec2::ZERO, -1.0).is_empty());
        assert!(index.query_radius(Vec2::ZERO, f32::NAN).is_empty());
        assert_eq!(index.query_radius(Vec2::new(3.0, 4.0), 0.0), vec![1]);
        // Covers far more cells than are occupied
        assert_eq!(index.query_radius(Vec2::ZERO, 1.0e9), vec![1]);
        assert_eq!(index.query_radius(Vec2::ZERO, f32::MAX), vec![1]);
    }

    #[test]
    fn test_invalid_cell_size_uses_default() {
        let index: SpatialIndex<u32> = SpatialIndex::new(0.0);
        assert_eq!(index.cell_size(), DEFAULT_CELL_SIZE);
    }

    #[test]
    fn test_matches_brute_force() {
        let mut rng = rand::thread_rng();
        let mut index = SpatialIndex::new(64.0);
        let mut points = Vec::new();

        for key in 0..500u32 {
            let position = Vec2::new(rng.gen_range(-1000.0..1000.0), rng.gen_range(-1000.0..1000.0));
            index.upsert(key, position);
            points.push((key, position));
        }

        for _ in 0..50 {
            let center = Vec2::new(rng.gen_range(-1000.0..1000.0), rng.gen_range(-1000.0..1000.0));
            let radius = rng.gen_range(0.0..400.0);

            let expected: Vec<u32> = points
                .iter()
                .filter(|(_, p)| p.distance_sq_to(center) <= radius * radius)
                .map(|(k, _)| *k)
                .collect();
            assert_eq!(sorted(index.query_radius(center, radius)), sorted(expected));
        }
    }
}
