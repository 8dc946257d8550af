use meshgen_geom::Rect;

use crate::rng::CellRng;

/// Total free area below which a bucket family counts as exhausted.
const EMPTY_AREA: f32 = 1e-6;

/// Handle to a free rectangle returned by [`PositionMap::random_position`].
///
/// Only valid until the next mutation of the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AreaId {
    bucket: usize,
    slot: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub x: f32,
    pub z: f32,
    pub area: AreaId,
}

/// Free rectangles whose shorter side is at least `min_side`, stored as an implicit binary
/// tree where `sums[i]` is the area of node `i` plus both of its subtrees.
#[derive(Clone, Debug)]
struct Bucket {
    min_side: f32,
    rects: Vec<Rect>,
    sums: Vec<f32>,
}

impl Bucket {
    fn new(min_side: f32) -> Self {
        Self {
            min_side,
            rects: Vec::new(),
            sums: Vec::new(),
        }
    }

    #[inline]
    fn total(&self) -> f32 {
        self.sums.first().copied().unwrap_or(0.0)
    }

    fn push(&mut self, rect: Rect) {
        self.rects.push(rect);
        self.sums.push(0.0);
        self.refresh_path(self.rects.len() - 1);
    }

    fn remove(&mut self, slot: usize) -> Rect {
        let last = self.rects.len() - 1;
        let removed = self.rects.swap_remove(slot);
        self.sums.swap_remove(slot);
        let len = self.rects.len();
        if slot < len {
            self.refresh_path(slot);
        }
        if last > 0 {
            let parent = (last - 1) / 2;
            if parent < len {
                self.refresh_path(parent);
            }
        }
        removed
    }

    /// Recompute subtree sums from `slot` up to the root.
    fn refresh_path(&mut self, mut slot: usize) {
        let len = self.rects.len();
        loop {
            let mut sum = self.rects[slot].area();
            let left = 2 * slot + 1;
            if left < len {
                sum += self.sums[left];
            }
            if left + 1 < len {
                sum += self.sums[left + 1];
            }
            self.sums[slot] = sum;
            if slot == 0 {
                break;
            }
            slot = (slot - 1) / 2;
        }
    }

    /// Walk down the tree to the rectangle covering `value` in `[0, total)`.
    fn pick(&self, mut value: f32) -> usize {
        let len = self.rects.len();
        let mut slot = 0;
        loop {
            let own = self.rects[slot].area();
            if value < own {
                return slot;
            }
            value -= own;
            let left = 2 * slot + 1;
            if left >= len {
                return slot;
            }
            if value < self.sums[left] {
                slot = left;
                continue;
            }
            value -= self.sums[left];
            let right = left + 1;
            if right >= len {
                // Rounding carried us past the last subtree.
                slot = left;
                continue;
            }
            slot = right;
        }
    }
}

/// Bucketed free-area allocator for one cell.
///
/// One bucket exists per distinct footprint radius, ordered by descending `2 * radius`.
/// A free rectangle lives in the first bucket whose `min_side` its shorter side reaches;
/// rectangles thinner than the smallest `min_side` are dropped for good.
///
/// A request for radius `r` only draws from buckets with `min_side >= 2r`. If no bucket is
/// that large the request fails, and radii below the smallest bucket simply use every bucket.
#[derive(Clone, Debug)]
pub struct PositionMap {
    buckets: Vec<Bucket>,
    rng: CellRng,
    carved_area: f32,
    discarded_area: f32,
}

impl PositionMap {
    pub fn new(radii: &[f32], bounds: Rect, seed: u64) -> Self {
        let mut sides: Vec<f32> = radii
            .iter()
            .filter(|r| r.is_finite())
            .map(|r| 2.0 * r.max(0.0))
            .collect();
        sides.sort_by(|a, b| b.total_cmp(a));
        sides.dedup();
        let mut map = Self {
            buckets: sides.into_iter().map(Bucket::new).collect(),
            rng: CellRng::new(seed),
            carved_area: 0.0,
            discarded_area: 0.0,
        };
        map.insert_free(bounds);
        map
    }

    /// Draw a point, uniformly by free area, whose `radius` footprint fits a free rectangle.
    pub fn random_position(&mut self, radius: f32) -> Option<Candidate> {
        let need = 2.0 * radius;
        let eligible = self.buckets.iter().take_while(|b| b.min_side >= need).count();
        let total: f32 = self.buckets[..eligible].iter().map(Bucket::total).sum();
        if total <= EMPTY_AREA {
            return None;
        }

        let mut value = total * self.rng.get();
        let mut chosen = None;
        for (index, bucket) in self.buckets[..eligible].iter().enumerate() {
            let bucket_total = bucket.total();
            if bucket.rects.is_empty() {
                continue;
            }
            chosen = Some(index);
            if value < bucket_total {
                break;
            }
            value -= bucket_total;
        }
        let bucket_index = chosen?;
        let bucket = &self.buckets[bucket_index];
        let slot = bucket.pick(value.clamp(0.0, bucket.total()));
        let rect = bucket.rects[slot];

        let x = rect.min_x + radius + self.rng.get() * (rect.width() - need).max(0.0);
        let z = rect.min_z + radius + self.rng.get() * (rect.depth() - need).max(0.0);
        Some(Candidate {
            x,
            z,
            area: AreaId {
                bucket: bucket_index,
                slot,
            },
        })
    }

    /// Carve the `2r x 2r` square centred on `(x, z)` out of the rectangle `area`.
    ///
    /// The remainder is split left, right, above, below (in that order); pieces thinner than
    /// the smallest bucket are discarded.
    pub fn mark_area_used(&mut self, area: AreaId, radius: f32, x: f32, z: f32) {
        let valid = self
            .buckets
            .get(area.bucket)
            .is_some_and(|b| area.slot < b.rects.len());
        debug_assert!(valid, "stale area handle {area:?}");
        if !valid {
            return;
        }
        let rect = self.buckets[area.bucket].remove(area.slot);

        let lx = (x - radius).max(rect.min_x);
        let hx = (x + radius).min(rect.max_x);
        let lz = (z - radius).max(rect.min_z);
        let hz = (z + radius).min(rect.max_z);
        self.carved_area += (hx - lx).max(0.0) * (hz - lz).max(0.0);

        self.insert_free(Rect::new(rect.min_x, rect.min_z, lx, rect.max_z));
        self.insert_free(Rect::new(hx, rect.min_z, rect.max_x, rect.max_z));
        self.insert_free(Rect::new(lx, rect.min_z, hx, lz));
        self.insert_free(Rect::new(lx, hz, hx, rect.max_z));
    }

    fn insert_free(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let side = rect.min_side();
        match self.buckets.iter_mut().find(|b| side >= b.min_side) {
            Some(bucket) => bucket.push(rect),
            None => self.discarded_area += rect.area(),
        }
    }

    /// Sum of all free rectangles across buckets.
    pub fn free_area(&self) -> f32 {
        self.buckets.iter().map(Bucket::total).sum()
    }

    pub fn carved_area(&self) -> f32 {
        self.carved_area
    }

    pub fn discarded_area(&self) -> f32 {
        self.discarded_area
    }

    pub fn free_rect_count(&self) -> usize {
        self.buckets.iter().map(|b| b.rects.len()).sum()
    }

    /// Bucket thresholds, largest first.
    pub fn bucket_sides(&self) -> impl Iterator<Item = f32> + '_ {
        self.buckets.iter().map(|b| b.min_side)
    }

    /// Free rectangles of every bucket, for inspection.
    pub fn free_rects(&self) -> impl Iterator<Item = &Rect> + '_ {
        self.buckets.iter().flat_map(|b| b.rects.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_sums(bucket: &Bucket) {
        let len = bucket.rects.len();
        for i in 0..len {
            let mut expect = bucket.rects[i].area();
            for c in [2 * i + 1, 2 * i + 2] {
                if c < len {
                    expect += bucket.sums[c];
                }
            }
            assert!((bucket.sums[i] - expect).abs() <= 1e-3, "node {i}");
        }
    }

    #[test]
    fn buckets_are_deduplicated_and_descending() {
        let map = PositionMap::new(&[0.5, 2.0, 0.5, 1.0], Rect::new(0.0, 0.0, 10.0, 10.0), 1);
        let sides: Vec<f32> = map.bucket_sides().collect();
        assert_eq!(sides, vec![4.0, 2.0, 1.0]);
        assert_eq!(map.free_rect_count(), 1);
        assert!((map.free_area() - 100.0).abs() < 1e-4);
    }

    #[test]
    fn bucket_tree_sums_survive_removals() {
        let mut bucket = Bucket::new(0.0);
        for i in 0..37 {
            let w = 1.0 + i as f32;
            bucket.push(Rect::new(0.0, 0.0, w, 1.0));
        }
        check_sums(&bucket);
        for slot in [0, 5, 30, 2, 17, 0, 1] {
            let len = bucket.rects.len();
            bucket.remove(slot % len);
            check_sums(&bucket);
        }
        let direct: f32 = bucket.rects.iter().map(Rect::area).sum();
        assert!((bucket.total() - direct).abs() <= 1e-3);
    }

    #[test]
    fn pick_respects_area_weights() {
        let mut bucket = Bucket::new(0.0);
        bucket.push(Rect::new(0.0, 0.0, 1.0, 1.0));
        bucket.push(Rect::new(0.0, 0.0, 3.0, 1.0));
        bucket.push(Rect::new(0.0, 0.0, 6.0, 1.0));
        // Node 0 covers [0,1), its left child [1,4), its right child [4,10).
        assert_eq!(bucket.pick(0.5), 0);
        assert_eq!(bucket.pick(1.5), 1);
        assert_eq!(bucket.pick(3.99), 1);
        assert_eq!(bucket.pick(4.0), 2);
        assert_eq!(bucket.pick(9.99), 2);
    }

    #[test]
    fn candidate_fits_inside_chosen_rect() {
        let bounds = Rect::new(10.0, 20.0, 14.0, 30.0);
        let mut map = PositionMap::new(&[0.5], bounds, 9);
        for _ in 0..100 {
            let c = map.random_position(0.5).expect("space left");
            assert!(c.x >= bounds.min_x + 0.5 && c.x <= bounds.max_x - 0.5);
            assert!(c.z >= bounds.min_z + 0.5 && c.z <= bounds.max_z - 0.5);
        }
    }

    #[test]
    fn radius_above_every_bucket_fails() {
        let mut map = PositionMap::new(&[0.5], Rect::new(0.0, 0.0, 10.0, 10.0), 2);
        assert!(map.random_position(1.0).is_none());
        assert!(map.random_position(0.25).is_some());
    }

    #[test]
    fn carving_splits_into_four() {
        let mut map = PositionMap::new(&[0.5], Rect::new(0.0, 0.0, 10.0, 10.0), 3);
        let c = map.random_position(0.5).unwrap();
        map.mark_area_used(c.area, 0.5, 5.0, 5.0);
        assert_eq!(map.free_rect_count(), 4);
        assert!((map.carved_area() - 1.0).abs() < 1e-5);
        assert!((map.free_area() - 99.0).abs() < 1e-3);
        assert_eq!(map.discarded_area(), 0.0);
    }

    #[test]
    fn thin_leftovers_are_discarded() {
        let mut map = PositionMap::new(&[1.0], Rect::new(0.0, 0.0, 2.5, 2.0), 4);
        let c = map.random_position(1.0).unwrap();
        map.mark_area_used(c.area, 1.0, 1.0, 1.0);
        // Only a 0.5 x 2 strip remains on the right, below the 2.0 minimum side.
        assert_eq!(map.free_rect_count(), 0);
        assert!((map.discarded_area() - 1.0).abs() < 1e-5);
        assert!(map.random_position(1.0).is_none());
    }

    #[test]
    fn exhausts_eventually() {
        let mut map = PositionMap::new(&[0.5], Rect::new(0.0, 0.0, 4.0, 4.0), 5);
        let mut placed = 0;
        while let Some(c) = map.random_position(0.5) {
            map.mark_area_used(c.area, 0.5, c.x, c.z);
            placed += 1;
            assert!(placed <= 16, "more 1x1 footprints than fit in 4x4");
        }
        assert!(placed >= 1);
    }
}
