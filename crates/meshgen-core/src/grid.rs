use std::sync::Arc;

use meshgen_geom::{Aabb, Rect, Vec2};

use crate::block_pool::BlockId;
use crate::scene::GroundMesh;

/// One square of the uniform grid over the sample box.
pub struct Cell {
    pub rect: Rect,
    pub needs_positions: bool,
    pub block: Option<BlockId>,
    /// Ground meshes whose bounds reach into this cell.
    pub meshes: Vec<Arc<dyn GroundMesh>>,
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("rect", &self.rect)
            .field("needs_positions", &self.needs_positions)
            .field("block", &self.block)
            .field("meshes", &self.meshes.len())
            .finish()
    }
}

/// Inclusive rectangle of cell indices; empty when `min > max` on either axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRect {
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
}

impl IndexRect {
    pub const EMPTY: IndexRect = IndexRect {
        min_x: 0,
        min_z: 0,
        max_x: -1,
        max_z: -1,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_z > self.max_z
    }

    #[inline]
    pub fn contains(&self, x: i32, z: i32) -> bool {
        x >= self.min_x && x <= self.max_x && z >= self.min_z && z <= self.max_z
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            ((self.max_x - self.min_x + 1) * (self.max_z - self.min_z + 1)) as usize
        }
    }

    /// Cells in row-major order (Z outer).
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let r = *self;
        let (zs, xs) = if r.is_empty() {
            (1..=0, 1..=0)
        } else {
            (r.min_z..=r.max_z, r.min_x..=r.max_x)
        };
        zs.flat_map(move |z| xs.clone().map(move |x| (x, z)))
    }
}

impl Default for IndexRect {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// `cell_count x cell_count` cells covering the XZ extent of the sample box.
#[derive(Debug)]
pub struct CellGrid {
    bounds: Rect,
    cell_count: usize,
    // cells per world unit
    samplefact_x: f32,
    samplefact_z: f32,
    cells: Vec<Cell>,
}

impl CellGrid {
    /// Build the grid and hand each cell the ground meshes that overlap it.
    pub fn new(sample_box: &Aabb, cell_count: usize, ground: &[Arc<dyn GroundMesh>]) -> Self {
        let bounds = sample_box.xz_rect();
        let n = cell_count.max(1);
        let cell_w = bounds.width() / n as f32;
        let cell_d = bounds.depth() / n as f32;
        let mut cells = Vec::with_capacity(n * n);
        for z in 0..n {
            for x in 0..n {
                let rect = Rect::new(
                    bounds.min_x + x as f32 * cell_w,
                    bounds.min_z + z as f32 * cell_d,
                    bounds.min_x + (x + 1) as f32 * cell_w,
                    bounds.min_z + (z + 1) as f32 * cell_d,
                );
                let meshes = ground
                    .iter()
                    .filter(|m| mesh_reaches(m.as_ref(), &rect))
                    .cloned()
                    .collect();
                cells.push(Cell {
                    rect,
                    needs_positions: true,
                    block: None,
                    meshes,
                });
            }
        }
        Self {
            bounds,
            cell_count: n,
            samplefact_x: n as f32 / bounds.width(),
            samplefact_z: n as f32 / bounds.depth(),
            cells,
        }
    }

    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    #[inline]
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn cell(&self, id: usize) -> &Cell {
        &self.cells[id]
    }

    #[inline]
    pub fn cell_mut(&mut self, id: usize) -> &mut Cell {
        &mut self.cells[id]
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    /// Unclamped column of world `x`.
    #[inline]
    pub fn cell_x(&self, x: f32) -> i32 {
        ((x - self.bounds.min_x) * self.samplefact_x).floor() as i32
    }

    /// Unclamped row of world `z`.
    #[inline]
    pub fn cell_z(&self, z: f32) -> i32 {
        ((z - self.bounds.min_z) * self.samplefact_z).floor() as i32
    }

    #[inline]
    pub fn index(&self, x: i32, z: i32) -> usize {
        z as usize * self.cell_count + x as usize
    }

    /// Cell containing `p`, clamped into the grid.
    pub fn cell_id(&self, p: Vec2) -> usize {
        let last = self.cell_count as i32 - 1;
        let x = self.cell_x(p.x).clamp(0, last);
        let z = self.cell_z(p.y).clamp(0, last);
        self.index(x, z)
    }

    /// Index rectangle of cells that may lie within `dist` of `p`.
    pub fn cells_within(&self, p: Vec2, dist: f32) -> IndexRect {
        let last = self.cell_count as i32 - 1;
        let md_x = 1 + (dist * self.samplefact_x) as i32;
        let md_z = 1 + (dist * self.samplefact_z) as i32;
        let cx = self.cell_x(p.x);
        let cz = self.cell_z(p.y);
        IndexRect {
            min_x: cx.saturating_sub(md_x).max(0),
            min_z: cz.saturating_sub(md_z).max(0),
            max_x: cx.saturating_add(md_x).min(last),
            max_z: cz.saturating_add(md_z).min(last),
        }
    }

    pub fn add_ground_mesh(&mut self, mesh: &Arc<dyn GroundMesh>) {
        for cell in &mut self.cells {
            if mesh_reaches(mesh.as_ref(), &cell.rect) {
                cell.meshes.push(Arc::clone(mesh));
                cell.needs_positions = true;
            }
        }
    }

    pub fn remove_ground_mesh(&mut self, mesh: &Arc<dyn GroundMesh>) {
        for cell in &mut self.cells {
            let before = cell.meshes.len();
            cell.meshes.retain(|m| !Arc::ptr_eq(m, mesh));
            if cell.meshes.len() != before {
                cell.needs_positions = true;
            }
        }
    }
}

fn mesh_reaches(mesh: &dyn GroundMesh, rect: &Rect) -> bool {
    mesh.bounds().is_none_or(|b| b.xz_rect().overlaps(rect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlatGround;
    use meshgen_geom::Vec3;

    fn grid(n: usize) -> CellGrid {
        let sample = Aabb::new(Vec3::new(0.0, -10.0, 0.0), Vec3::new(100.0, 10.0, 100.0));
        let ground: Vec<Arc<dyn GroundMesh>> = vec![Arc::new(FlatGround::new(0.0))];
        CellGrid::new(&sample, n, &ground)
    }

    #[test]
    fn cell_rects_tile_the_box() {
        let g = grid(10);
        assert_eq!(g.len(), 100);
        assert_eq!(g.cell(0).rect, Rect::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(g.cell(g.index(3, 2)).rect, Rect::new(30.0, 20.0, 40.0, 30.0));
        assert!(g.cells().iter().all(|c| c.needs_positions && c.meshes.len() == 1));
    }

    #[test]
    fn cell_id_clamps_outside_points() {
        let g = grid(10);
        assert_eq!(g.cell_id(Vec2::new(55.0, 15.0)), 15);
        assert_eq!(g.cell_id(Vec2::new(-5.0, 500.0)), 90);
    }

    #[test]
    fn range_rect_is_clamped() {
        let g = grid(10);
        let r = g.cells_within(Vec2::new(50.0, 50.0), 20.0);
        assert_eq!(r, IndexRect { min_x: 2, min_z: 2, max_x: 8, max_z: 8 });
        let edge = g.cells_within(Vec2::new(1.0, 1.0), 5.0);
        assert_eq!(edge, IndexRect { min_x: 0, min_z: 0, max_x: 1, max_z: 1 });
        let far = g.cells_within(Vec2::new(-1000.0, 50.0), 5.0);
        assert!(far.is_empty());
        assert_eq!(far.iter().count(), 0);
    }

    #[test]
    fn index_rect_iterates_row_major() {
        let r = IndexRect { min_x: 1, min_z: 4, max_x: 2, max_z: 5 };
        let cells: Vec<_> = r.iter().collect();
        assert_eq!(cells, vec![(1, 4), (2, 4), (1, 5), (2, 5)]);
        assert_eq!(r.len(), 4);
        assert!(r.contains(2, 5));
        assert!(!r.contains(3, 5));
    }

    #[test]
    fn bounded_ground_meshes_only_reach_overlapping_cells() {
        let mut g = grid(10);
        let patch: Arc<dyn GroundMesh> = Arc::new(FlatGround::bounded(
            2.0,
            Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(15.0, 5.0, 5.0)),
        ));
        for cell in g.cells_mut() {
            cell.needs_positions = false;
        }
        g.add_ground_mesh(&patch);
        let touched: Vec<usize> = (0..g.len())
            .filter(|&i| g.cell(i).meshes.len() == 2)
            .collect();
        assert_eq!(touched, vec![0, 1]);
        assert!(g.cell(0).needs_positions);
        assert!(!g.cell(2).needs_positions);

        g.remove_ground_mesh(&patch);
        assert!(g.cells().iter().all(|c| c.meshes.len() == 1));
    }
}
