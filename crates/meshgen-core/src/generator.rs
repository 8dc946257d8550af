//! The mesh generator: cell grid, block cache and per-frame instance placement.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use log::{debug, error, trace};
use meshgen_geom::{Aabb, Mat3, Vec2, Vec3};
use meshgen_place::{CellRng, PositionMap};

use crate::block_pool::{BlockId, BlockPool, BlockPoolStats};
use crate::density::{DensityFactorMap, MapTransform};
use crate::error::{InvariantViolation, MeshGenError};
use crate::geometry::{FadeParams, GeometryId, GeometryLod};
use crate::grid::{CellGrid, IndexRect};
use crate::position::{InstanceSlot, Position, PositionRef};
use crate::scene::{BeamHit, GroundMesh, MeshFactory};

/// Number of quantized Y rotations a position can take.
pub const MAX_ROTATIONS: usize = 6;

pub const DEFAULT_CELL_COUNT: usize = 50;
pub const DEFAULT_BLOCK_COUNT: usize = 100;

// Lift applied to the beam end after a hit so later meshes only report higher surfaces.
const BEAM_LIFT: f32 = 0.0001;
const FACTOR_REJECT: f32 = 0.0001;
const FACTOR_ACCEPT: f32 = 0.9999;
const POSITION_MAP_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// What one `update_for_position` call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub cells_in_range: usize,
    pub blocks_generated: usize,
    pub blocks_stolen: usize,
    pub instances_allocated: usize,
    pub instances_freed: usize,
    pub live_instances: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct DensityScale {
    min_dist: f32,
    sq_min_dist: f32,
    max_dist: f32,
    max_factor: f32,
    scale: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct AlphaScale {
    min_dist: f32,
    max_dist: f32,
    scale: f32,
}

pub struct MeshGenerator {
    sample_box: Option<Aabb>,
    cell_count: usize,
    grid: Option<CellGrid>,
    grid_dirty: bool,
    pool: BlockPool,
    geometries: Vec<GeometryLod>,
    seen_revisions: Vec<u64>,
    ground: Vec<Arc<dyn GroundMesh>>,
    density_factor_maps: HashMap<String, DensityFactorMap>,
    default_density_factor: f32,
    density_scale: Option<DensityScale>,
    alpha_scale: Option<AlphaScale>,
    rotations: [Mat3; MAX_ROTATIONS],
    rng: CellRng,
    last_position: Option<Vec3>,
    prev_cells: IndexRect,
}

impl Default for MeshGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshGenerator {
    pub fn new() -> Self {
        Self {
            sample_box: None,
            cell_count: DEFAULT_CELL_COUNT,
            grid: None,
            grid_dirty: true,
            pool: BlockPool::new(DEFAULT_BLOCK_COUNT),
            geometries: Vec::new(),
            seen_revisions: Vec::new(),
            ground: Vec::new(),
            density_factor_maps: HashMap::new(),
            default_density_factor: 1.0,
            density_scale: None,
            alpha_scale: None,
            rotations: std::array::from_fn(|i| {
                Mat3::rotation_y(TAU * i as f32 / MAX_ROTATIONS as f32)
            }),
            rng: CellRng::for_cell(0),
            last_position: None,
            prev_cells: IndexRect::EMPTY,
        }
    }

    // ---- configuration --------------------------------------------------------------

    /// Area to scatter over; Y bounds the downward placement beam.
    pub fn set_sample_box(&mut self, sample_box: Aabb) -> Result<(), MeshGenError> {
        if sample_box.xz_rect().is_empty() || sample_box.max.y < sample_box.min.y {
            return Err(MeshGenError::DegenerateSampleBox);
        }
        self.release_all_blocks();
        self.sample_box = Some(sample_box);
        self.grid_dirty = true;
        Ok(())
    }

    pub fn sample_box(&self) -> Option<Aabb> {
        self.sample_box
    }

    /// Grid resolution per axis.
    pub fn set_cell_count(&mut self, count: usize) -> Result<(), MeshGenError> {
        if count == 0 {
            return Err(MeshGenError::InvalidCellCount(count));
        }
        self.release_all_blocks();
        self.cell_count = count;
        self.grid_dirty = true;
        Ok(())
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Size of the position block pool. Drops every cached block.
    pub fn set_block_count(&mut self, count: usize) {
        self.release_all_blocks();
        self.pool.resize(count);
        debug!(target: "meshgen", "block pool resized to {count}");
    }

    pub fn block_count(&self) -> usize {
        self.pool.capacity()
    }

    pub fn set_default_density_factor(&mut self, factor: f32) {
        self.default_density_factor = factor;
        self.invalidate_cells();
    }

    pub fn default_density_factor(&self) -> f32 {
        self.default_density_factor
    }

    /// Thin out placements beyond `min_dist`, keeping `max_factor` of them at `max_dist`.
    pub fn set_density_scale(
        &mut self,
        min_dist: f32,
        max_dist: f32,
        max_factor: f32,
    ) -> Result<(), MeshGenError> {
        if !(max_dist > min_dist) {
            return Err(MeshGenError::InvalidDistanceRange {
                min: min_dist,
                max: max_dist,
            });
        }
        self.density_scale = Some(DensityScale {
            min_dist,
            sq_min_dist: min_dist * min_dist,
            max_dist,
            max_factor,
            scale: (1.0 - max_factor) / (max_dist - min_dist),
        });
        Ok(())
    }

    pub fn clear_density_scale(&mut self) {
        self.density_scale = None;
    }

    /// Alpha fade range written into new instance extras.
    pub fn set_alpha_scale(&mut self, min_dist: f32, max_dist: f32) -> Result<(), MeshGenError> {
        if !(max_dist > min_dist) || min_dist < 0.0 {
            return Err(MeshGenError::InvalidDistanceRange {
                min: min_dist,
                max: max_dist,
            });
        }
        self.alpha_scale = Some(AlphaScale {
            min_dist,
            max_dist,
            scale: 1.0 / (max_dist - min_dist),
        });
        Ok(())
    }

    pub fn clear_alpha_scale(&mut self) {
        self.alpha_scale = None;
    }

    /// Drop every cached position; cells regenerate when next in range.
    pub fn clear_all_positions(&mut self) {
        self.release_all_blocks();
    }

    /// Drop the cached positions of the cell containing `pos`.
    pub fn clear_position(&mut self, pos: Vec3) {
        let Some(grid) = self.grid.as_mut() else {
            return;
        };
        let cell = grid.cell_mut(grid.cell_id(pos.xz()));
        cell.needs_positions = true;
        if let Some(block) = cell.block.take() {
            free_block_instances(&mut self.pool, &mut self.geometries, block);
            self.pool.release(block);
        }
    }

    // ---- geometries -----------------------------------------------------------------

    pub fn create_geometry(&mut self) -> GeometryId {
        self.geometries.push(GeometryLod::new());
        // Force a first sync so every cell picks up the new content type.
        self.seen_revisions.push(u64::MAX);
        GeometryId(self.geometries.len() - 1)
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn geometry(&self, id: GeometryId) -> Option<&GeometryLod> {
        self.geometries.get(id.0)
    }

    /// Placement settings of a geometry. LOD table edits go through
    /// [`MeshGenerator::add_factory`] and [`MeshGenerator::remove_factory`].
    pub fn geometry_mut(&mut self, id: GeometryId) -> Option<&mut GeometryLod> {
        self.geometries.get_mut(id.0)
    }

    pub fn geometries(&self) -> &[GeometryLod] {
        &self.geometries
    }

    /// Remove a geometry; ids above `id` shift down by one.
    pub fn remove_geometry(&mut self, id: GeometryId) -> Result<(), MeshGenError> {
        if id.0 >= self.geometries.len() {
            return Err(MeshGenError::UnknownGeometry(id.0));
        }
        // Every cached position stores a geometry index, so all blocks go.
        self.release_all_blocks();
        let mut removed = self.geometries.remove(id.0);
        self.seen_revisions.remove(id.0);
        removed.finish_update();
        Ok(())
    }

    /// Add a LOD level to a geometry; returns the level's index after sorting.
    pub fn add_factory(
        &mut self,
        id: GeometryId,
        factory: Arc<dyn MeshFactory>,
        max_distance: f32,
    ) -> Result<usize, MeshGenError> {
        if id.0 >= self.geometries.len() {
            return Err(MeshGenError::UnknownGeometry(id.0));
        }
        free_geometry_instances(&mut self.pool, &mut self.geometries, id.0);
        Ok(self.geometries[id.0].add_factory(factory, max_distance))
    }

    pub fn remove_factory(&mut self, id: GeometryId, lod: usize) -> Result<bool, MeshGenError> {
        if id.0 >= self.geometries.len() {
            return Err(MeshGenError::UnknownGeometry(id.0));
        }
        free_geometry_instances(&mut self.pool, &mut self.geometries, id.0);
        Ok(self.geometries[id.0].remove_factory(lod))
    }

    /// Largest draw distance over all geometries.
    pub fn total_max_dist(&self) -> f32 {
        self.geometries
            .iter()
            .map(GeometryLod::max_draw_distance)
            .fold(0.0, f32::max)
    }

    pub fn rotation(&self, index: usize) -> Option<&Mat3> {
        self.rotations.get(index)
    }

    // ---- ground meshes --------------------------------------------------------------

    pub fn add_ground_mesh(&mut self, mesh: Arc<dyn GroundMesh>) {
        if let Some(grid) = self.grid.as_mut() {
            grid.add_ground_mesh(&mesh);
        }
        self.ground.push(mesh);
    }

    pub fn remove_ground_mesh(&mut self, mesh: &Arc<dyn GroundMesh>) -> bool {
        let before = self.ground.len();
        self.ground.retain(|m| !Arc::ptr_eq(m, mesh));
        if self.ground.len() == before {
            return false;
        }
        if let Some(grid) = self.grid.as_mut() {
            grid.remove_ground_mesh(mesh);
        }
        true
    }

    pub fn ground_mesh_count(&self) -> usize {
        self.ground.len()
    }

    // ---- density factor maps --------------------------------------------------------

    /// Register (or replace) a named density raster.
    pub fn add_density_factor_map(&mut self, id: impl Into<String>, map: DensityFactorMap) {
        self.density_factor_maps.insert(id.into(), map);
        self.invalidate_cells();
    }

    /// Swap the raster of an existing map, keeping its transform.
    pub fn update_density_factor_map(
        &mut self,
        id: &str,
        width: usize,
        height: usize,
        luma: &[u8],
    ) -> Result<(), MeshGenError> {
        let map = self
            .density_factor_maps
            .get_mut(id)
            .ok_or_else(|| MeshGenError::UnknownDensityFactorMap(id.to_owned()))?;
        map.set_image(width, height, luma)?;
        self.invalidate_cells();
        Ok(())
    }

    pub fn is_valid_density_factor_map(&self, id: &str) -> bool {
        self.density_factor_maps.contains_key(id)
    }

    /// `(width, height)` of a registered map.
    pub fn density_factor_map_size(&self, id: &str) -> Option<(usize, usize)> {
        self.density_factor_maps
            .get(id)
            .map(|m| (m.width(), m.height()))
    }

    pub fn world_to_map_transform(&self, id: &str) -> Option<MapTransform> {
        self.density_factor_maps.get(id).map(|m| *m.world_to_map())
    }

    /// Weight a registered map into a geometry's density; `false` if either is unknown.
    pub fn use_density_factor_map(&mut self, geometry: GeometryId, id: &str, factor: f32) -> bool {
        if !self.density_factor_maps.contains_key(id) {
            return false;
        }
        let Some(g) = self.geometries.get_mut(geometry.0) else {
            return false;
        };
        g.use_density_factor_map(id, factor);
        true
    }

    // ---- queries --------------------------------------------------------------------

    /// Cell index containing `p`, building the grid if needed.
    pub fn cell_id(&mut self, p: Vec2) -> Option<usize> {
        self.ensure_grid();
        self.grid.as_ref().map(|g| g.cell_id(p))
    }

    pub fn grid(&self) -> Option<&CellGrid> {
        self.grid.as_ref()
    }

    /// Cached positions of a cell; empty when it holds no block.
    pub fn cell_positions(&self, cell: usize) -> &[Position] {
        self.grid
            .as_ref()
            .and_then(|g| g.cells().get(cell))
            .and_then(|c| c.block)
            .map_or(&[], |b| self.pool.block(b).positions.as_slice())
    }

    pub fn pool_stats(&self) -> BlockPoolStats {
        self.pool.stats()
    }

    pub fn live_instances(&self) -> usize {
        self.geometries.iter().map(GeometryLod::live_instances).sum()
    }

    /// Estimate of ground-hitting candidates in one cell, without carving or material tests.
    pub fn count_positions(&mut self, cell: usize) -> usize {
        self.ensure_grid();
        let (Some(grid), Some(sample_box)) = (self.grid.as_ref(), self.sample_box) else {
            return 0;
        };
        let Some(c) = grid.cells().get(cell) else {
            return 0;
        };
        let mut rng = CellRng::for_cell(cell);
        let area = c.rect.area();
        let mut counter = 0;
        for g in &self.geometries {
            let count = (g.density() * self.default_density_factor * area).round() as usize;
            for _ in 0..count {
                let x = rng.range(c.rect.min_x, c.rect.max_x);
                let z = rng.range(c.rect.min_z, c.rect.max_z);
                if cast_down(&c.meshes, x, z, &sample_box, false).is_some() {
                    counter += 1;
                }
            }
        }
        counter
    }

    pub fn count_all_positions(&mut self) -> usize {
        self.ensure_grid();
        let cells = self.grid.as_ref().map_or(0, CellGrid::len);
        (0..cells).map(|c| self.count_positions(c)).sum()
    }

    // ---- per-frame update -----------------------------------------------------------

    /// Bring live instances in line with a viewer at `pos`.
    ///
    /// Fails with [`MeshGenError::BlockBudgetExceeded`] when more cells are in range than
    /// the block pool holds; cells that left range are still released in that case.
    pub fn update_for_position(&mut self, pos: Vec3) -> Result<UpdateStats, MeshGenError> {
        self.ensure_grid();
        self.sync_geometries();
        let Some(mut grid) = self.grid.take() else {
            for g in &mut self.geometries {
                g.finish_update();
            }
            return Ok(UpdateStats::default());
        };
        let result = self.update_cells(&mut grid, pos);
        self.grid = Some(grid);
        result
    }

    fn update_cells(&mut self, grid: &mut CellGrid, pos: Vec3) -> Result<UpdateStats, MeshGenError> {
        let started = Instant::now();
        let mut stats = UpdateStats::default();
        let total_max_dist = self.total_max_dist();
        let sq_total = total_max_dist * total_max_dist;
        let viewer = pos.xz();
        let cur = if total_max_dist > 0.0 {
            grid.cells_within(viewer, total_max_dist)
        } else {
            IndexRect::EMPTY
        };

        // Release cells that left range first so their instances are gone before new ones.
        let prev = self.prev_cells;
        for (x, z) in prev.iter() {
            if cur.contains(x, z) {
                continue;
            }
            if let Some(block) = grid.cell(grid.index(x, z)).block {
                stats.instances_freed +=
                    free_block_instances(&mut self.pool, &mut self.geometries, block);
            }
        }
        self.prev_cells = cur;

        let in_range = |cid: usize| grid.cell(cid).rect.distance_sq_to(viewer) <= sq_total;
        let needed = cur
            .iter()
            .filter(|&(x, z)| in_range(grid.index(x, z)))
            .count();
        stats.cells_in_range = needed;
        if needed > self.pool.capacity() {
            error!(
                target: "meshgen",
                "{needed} cells within {total_max_dist} of ({}, {}) but only {} position blocks; frame abandoned",
                pos.x,
                pos.z,
                self.pool.capacity()
            );
            for g in &mut self.geometries {
                g.finish_update();
            }
            return Err(MeshGenError::BlockBudgetExceeded {
                needed,
                max_blocks: self.pool.capacity(),
            });
        }

        let moved = self.last_position != Some(pos);
        if moved {
            for g in &mut self.geometries {
                g.update_anchor(pos);
            }
        }
        let default_fade = self.default_fade(total_max_dist);

        for (x, z) in cur.iter() {
            let cid = grid.index(x, z);
            if grid.cell(cid).rect.distance_sq_to(viewer) <= sq_total {
                let block = self.allocate_block(grid, cid, &mut stats)?;
                self.allocate_meshes(block, pos, moved, sq_total, default_fade, &mut stats);
            } else if let Some(block) = grid.cell(cid).block {
                stats.instances_freed +=
                    free_block_instances(&mut self.pool, &mut self.geometries, block);
            }
        }
        self.last_position = Some(pos);

        for g in &mut self.geometries {
            g.finish_update();
        }
        stats.live_instances = self.live_instances();

        let ms = started.elapsed().as_secs_f32() * 1000.0;
        log::info!(
            target: "perf",
            "ms={:.3} meshgen_update cells={} generated={} stolen={} alloc={} freed={} live={}",
            ms,
            stats.cells_in_range,
            stats.blocks_generated,
            stats.blocks_stolen,
            stats.instances_allocated,
            stats.instances_freed,
            stats.live_instances
        );
        Ok(stats)
    }

    /// Give `cid` a block with up-to-date positions, stealing the LRU block if the pool is dry.
    fn allocate_block(
        &mut self,
        grid: &mut CellGrid,
        cid: usize,
        stats: &mut UpdateStats,
    ) -> Result<BlockId, MeshGenError> {
        if let Some(block) = grid.cell(cid).block {
            self.pool.touch(block);
            if grid.cell(cid).needs_positions {
                self.generate_positions(grid, cid, block, stats);
            }
            return Ok(block);
        }

        let block = match self.pool.acquire_free(cid) {
            Some(block) => block,
            None => {
                let Some(victim) = self.pool.lru() else {
                    return Err(MeshGenError::BlockBudgetExceeded {
                        needed: 1,
                        max_blocks: self.pool.capacity(),
                    });
                };
                stats.instances_freed +=
                    free_block_instances(&mut self.pool, &mut self.geometries, victim);
                if let Some(old) = self.pool.reassign(victim, cid) {
                    let old_cell = grid.cell_mut(old);
                    old_cell.block = None;
                    old_cell.needs_positions = true;
                    debug!(target: "meshgen", "block {} moved from cell {old} to cell {cid}", victim.0);
                }
                stats.blocks_stolen += 1;
                victim
            }
        };
        grid.cell_mut(cid).block = Some(block);
        self.generate_positions(grid, cid, block, stats);
        Ok(block)
    }

    /// Rebuild a block's candidates from the cell's seed.
    fn generate_positions(
        &mut self,
        grid: &mut CellGrid,
        cid: usize,
        block: BlockId,
        stats: &mut UpdateStats,
    ) {
        stats.instances_freed += free_block_instances(&mut self.pool, &mut self.geometries, block);
        stats.blocks_generated += 1;
        let mut positions = std::mem::take(&mut self.pool.block_mut(block).positions);
        positions.clear();
        grid.cell_mut(cid).needs_positions = false;

        let Some(sample_box) = self.sample_box else {
            return;
        };
        let cell = grid.cell(cid);
        let area = cell.rect.area();
        self.rng.reseed(cid as u64);
        let radii: Vec<f32> = self.geometries.iter().map(GeometryLod::radius).collect();
        let mut map = PositionMap::new(&radii, cell.rect, cid as u64 ^ POSITION_MAP_SALT);

        'geometries: for (gi, geometry) in self.geometries.iter().enumerate() {
            let manual = geometry.manual_positions_in(cid).filter(|m| !m.is_empty());
            let count = match manual {
                Some(points) => points.len(),
                None => (geometry.density() * self.default_density_factor * area).round() as usize,
            };
            if count == 0 {
                continue;
            }
            let radius = geometry.radius();
            let with_material = geometry.uses_material_factors();
            let min_samples = (count as f32).sqrt().ceil() as usize;
            let mut used = 0usize;

            for j in 0..count {
                let (x, z, factor) = match manual {
                    Some(points) => (points[j].x, points[j].y, 1.0),
                    None => {
                        // An exhausted map ends the whole cell, later geometries included.
                        let Some(c) = map.random_position(radius) else {
                            trace!(target: "meshgen", "cell {cid} out of room at geometry {gi} after {j} samples");
                            break 'geometries;
                        };
                        // The footprint is spent even if the candidate is rejected below.
                        map.mark_area_used(c.area, radius, c.x, c.z);
                        (c.x, c.z, geometry.density_factor(c.x, c.z, &self.density_factor_maps))
                    }
                };

                let hit = if rejects(factor, &mut self.rng) {
                    None
                } else {
                    cast_down(&cell.meshes, x, z, &sample_box, with_material)
                };
                let hit = hit.filter(|h| {
                    !(with_material && rejects(geometry.material_factor(h.material), &mut self.rng))
                });
                if let Some(hit) = hit {
                    let rotation = self.rng.below(MAX_ROTATIONS);
                    let random = self.rng.get();
                    positions.push(Position::new(hit.point, rotation, random, gi));
                    used += 1;
                }

                let estimated = (count as f32 * (used as f32 / (j + 1) as f32)).ceil() as usize;
                if j >= min_samples && used >= estimated {
                    break;
                }
            }
        }
        trace!(target: "meshgen", "cell {cid} generated {} positions", positions.len());
        self.pool.block_mut(block).positions = positions;
    }

    /// Create, move, re-LOD or free the instances of one block's positions.
    fn allocate_meshes(
        &mut self,
        block: BlockId,
        viewer: Vec3,
        moved: bool,
        sq_total: f32,
        default_fade: FadeParams,
        stats: &mut UpdateStats,
    ) {
        for slot in 0..self.pool.block(block).positions.len() {
            let at = PositionRef { block, slot };
            let p = self.pool.position(at);
            let (world, rotation, random, gi) = (p.position, p.rotation, p.random, p.geometry);
            let (instance, added_dist) = (p.instance, p.added_dist);
            let sq_dist = viewer.distance_sq(world);
            let rot = self.rotations[rotation];

            if sq_dist >= sq_total {
                if instance.is_some() {
                    free_instance(&mut self.pool, &mut self.geometries, at);
                    self.pool.position_mut(at).added_dist = 0.0;
                    stats.instances_freed += 1;
                }
                continue;
            }

            match instance {
                None => {
                    let mut admitted_at = added_dist;
                    if let Some(ds) = self.density_scale {
                        if sq_dist > ds.sq_min_dist {
                            let dist = sq_dist.sqrt();
                            let factor =
                                ((ds.max_dist - dist) * ds.scale + ds.max_factor).clamp(0.0, 1.0);
                            if random > factor {
                                continue;
                            }
                            admitted_at = dist;
                        }
                    }
                    let scaled = self.scaled_fade(admitted_at);
                    let geometry = &mut self.geometries[gi];
                    if let Some(new_slot) = geometry.alloc_mesh(sq_dist, at, default_fade, random) {
                        geometry.move_mesh(new_slot, world, &rot);
                        if let Some(fade) = scaled {
                            geometry.set_fade_params(new_slot, fade);
                        }
                        let p = self.pool.position_mut(at);
                        p.instance = Some(new_slot);
                        p.added_dist = admitted_at;
                        stats.instances_allocated += 1;
                    }
                }
                Some(current) => {
                    if !self.geometries[gi].is_right_lod(sq_dist, current.lod) {
                        free_instance(&mut self.pool, &mut self.geometries, at);
                        stats.instances_freed += 1;
                        let scaled = self.scaled_fade(added_dist);
                        let geometry = &mut self.geometries[gi];
                        if let Some(new_slot) = geometry.alloc_mesh(sq_dist, at, default_fade, random)
                        {
                            geometry.move_mesh(new_slot, world, &rot);
                            if let Some(fade) = scaled {
                                geometry.set_fade_params(new_slot, fade);
                            }
                            self.pool.position_mut(at).instance = Some(new_slot);
                            stats.instances_allocated += 1;
                        }
                    } else if moved {
                        self.geometries[gi].move_mesh(current, world, &rot);
                    }
                }
            }
        }
    }

    fn default_fade(&self, total_max_dist: f32) -> FadeParams {
        match self.alpha_scale {
            Some(a) => FadeParams {
                opaque_dist: a.min_dist,
                dist_scale: a.scale,
            },
            None => FadeParams {
                opaque_dist: total_max_dist,
                dist_scale: 0.0,
            },
        }
    }

    /// Fade for a placement admitted by density scaling at distance `added_dist`.
    fn scaled_fade(&self, added_dist: f32) -> Option<FadeParams> {
        if added_dist <= 0.0 || self.density_scale.is_none() {
            return None;
        }
        let a = self.alpha_scale?;
        let max = added_dist;
        let min = added_dist * (a.min_dist / a.max_dist);
        Some(FadeParams {
            opaque_dist: min,
            dist_scale: 1.0 / (max - min),
        })
    }

    // ---- bookkeeping ----------------------------------------------------------------

    fn ensure_grid(&mut self) {
        if !self.grid_dirty && self.grid.is_some() {
            return;
        }
        let Some(sample_box) = self.sample_box else {
            return;
        };
        self.release_all_blocks();
        let grid = CellGrid::new(&sample_box, self.cell_count, &self.ground);
        debug!(
            target: "meshgen",
            "grid rebuilt: {n}x{n} cells over {:?}",
            grid.bounds(),
            n = grid.cell_count()
        );
        for g in &mut self.geometries {
            g.invalidate_manual_buckets();
        }
        self.grid = Some(grid);
        self.grid_dirty = false;
        self.prev_cells = IndexRect::EMPTY;
    }

    /// Pick up geometry setting changes made through `geometry_mut`.
    fn sync_geometries(&mut self) {
        if let Some(grid) = self.grid.as_ref() {
            for g in &mut self.geometries {
                if g.needs_manual_bucketing() {
                    g.bucket_manual_positions(|p| grid.cell_id(p));
                }
            }
        }
        let mut changed = false;
        for (g, seen) in self.geometries.iter().zip(self.seen_revisions.iter_mut()) {
            if g.revision() != *seen {
                *seen = g.revision();
                changed = true;
            }
        }
        if changed {
            self.invalidate_cells();
        }
    }

    fn invalidate_cells(&mut self) {
        if let Some(grid) = self.grid.as_mut() {
            for cell in grid.cells_mut() {
                cell.needs_positions = true;
            }
        }
    }

    fn release_all_blocks(&mut self) {
        let in_use: Vec<BlockId> = self.pool.iter_in_use().collect();
        for block in in_use {
            free_block_instances(&mut self.pool, &mut self.geometries, block);
        }
        self.pool.release_all();
        if let Some(grid) = self.grid.as_mut() {
            for cell in grid.cells_mut() {
                cell.block = None;
                cell.needs_positions = true;
            }
        }
    }

    /// Check every back-reference between positions, instance arrays, blocks and cells.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let fail = |msg: String| Err(InvariantViolation(msg));
        let mut listed = 0usize;
        for (gi, g) in self.geometries.iter().enumerate() {
            for (lod, level) in g.levels().iter().enumerate() {
                let instances = level.instances();
                if instances.transforms().len() != instances.len()
                    || instances.extras().len() != instances.len()
                {
                    return fail(format!("geometry {gi} lod {lod}: parallel arrays differ in length"));
                }
                for (index, owner) in instances.owners().iter().enumerate() {
                    listed += 1;
                    if owner.block.0 >= self.pool.capacity() {
                        return fail(format!("geometry {gi} lod {lod} #{index}: block {} out of pool", owner.block.0));
                    }
                    let block = self.pool.block(owner.block);
                    if block.cell().is_none() {
                        return fail(format!("geometry {gi} lod {lod} #{index}: owner block {} is free", owner.block.0));
                    }
                    let Some(p) = block.positions.get(owner.slot) else {
                        return fail(format!("geometry {gi} lod {lod} #{index}: owner slot {} missing", owner.slot));
                    };
                    if p.geometry != gi || p.instance != Some(InstanceSlot { lod, index }) {
                        return fail(format!(
                            "geometry {gi} lod {lod} #{index}: owner points at {:?} of geometry {}",
                            p.instance, p.geometry
                        ));
                    }
                }
            }
        }

        let mut instanced = 0usize;
        for block in self.pool.iter_in_use() {
            let b = self.pool.block(block);
            let Some(cid) = b.cell() else {
                return fail(format!("block {} listed in use without a cell", block.0));
            };
            let owner = self.grid.as_ref().map(|g| g.cells().get(cid).and_then(|c| c.block));
            if owner.is_some_and(|b| b != Some(block)) {
                return fail(format!("cell {cid} does not own block {}", block.0));
            }
            instanced += b.positions.iter().filter(|p| p.is_instanced()).count();
        }
        if instanced != listed {
            return fail(format!("{instanced} instanced positions but {listed} instances"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MeshGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshGenerator")
            .field("sample_box", &self.sample_box)
            .field("cell_count", &self.cell_count)
            .field("pool", &self.pool.stats())
            .field("geometries", &self.geometries)
            .field("ground", &self.ground.len())
            .field("last_position", &self.last_position)
            .finish_non_exhaustive()
    }
}

/// Topmost hit of a downward beam at `(x, z)` across `meshes`.
fn cast_down(
    meshes: &[Arc<dyn GroundMesh>],
    x: f32,
    z: f32,
    sample_box: &Aabb,
    want_material: bool,
) -> Option<BeamHit> {
    let start = Vec3::new(x, sample_box.max.y, z);
    let mut end = Vec3::new(x, sample_box.min.y, z);
    let mut best = None;
    for mesh in meshes {
        if let Some(hit) = mesh.hit_beam(start, end, want_material) {
            end.y = hit.point.y + BEAM_LIFT;
            best = Some(hit);
        }
    }
    best
}

/// Probabilistic density rejection shared by density maps and material factors.
#[inline]
fn rejects(factor: f32, rng: &mut CellRng) -> bool {
    factor < FACTOR_REJECT || (factor < FACTOR_ACCEPT && rng.get() > factor)
}

/// Free the instance of one position and patch whichever position got swapped into its slot.
fn free_instance(pool: &mut BlockPool, geometries: &mut [GeometryLod], at: PositionRef) -> bool {
    let p = pool.position_mut(at);
    let Some(slot) = p.instance.take() else {
        return false;
    };
    let gi = p.geometry;
    if let Some(moved) = geometries[gi].free_mesh(slot) {
        let other = pool.position_mut(moved.owner);
        debug_assert_eq!(
            other.instance,
            Some(InstanceSlot {
                lod: slot.lod,
                index: moved.from
            }),
            "relocated instance owner out of sync"
        );
        if let Some(s) = other.instance.as_mut() {
            s.index = moved.to;
        }
    }
    true
}

fn free_block_instances(pool: &mut BlockPool, geometries: &mut [GeometryLod], block: BlockId) -> usize {
    let mut freed = 0;
    for slot in 0..pool.block(block).positions.len() {
        if free_instance(pool, geometries, PositionRef { block, slot }) {
            freed += 1;
        }
    }
    freed
}

fn free_geometry_instances(pool: &mut BlockPool, geometries: &mut [GeometryLod], gi: usize) -> usize {
    let in_use: Vec<BlockId> = pool.iter_in_use().collect();
    let mut freed = 0;
    for block in in_use {
        for slot in 0..pool.block(block).positions.len() {
            let at = PositionRef { block, slot };
            if pool.position(at).geometry == gi && free_instance(pool, geometries, at) {
                freed += 1;
            }
        }
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlatGround, RecordingFactory};

    fn generator(cells: usize, blocks: usize) -> (MeshGenerator, GeometryId) {
        let mut mg = MeshGenerator::new();
        mg.set_sample_box(Aabb::new(
            Vec3::new(0.0, -10.0, 0.0),
            Vec3::new(100.0, 10.0, 100.0),
        ))
        .unwrap();
        mg.set_cell_count(cells).unwrap();
        mg.set_block_count(blocks);
        mg.add_ground_mesh(Arc::new(FlatGround::new(0.0)));
        let g = mg.create_geometry();
        mg.add_factory(g, RecordingFactory::new("grass"), 20.0).unwrap();
        {
            let geom = mg.geometry_mut(g).unwrap();
            geom.set_radius(0.5);
            geom.set_density(0.05);
        }
        (mg, g)
    }

    #[test]
    fn rotation_table_spans_full_turn() {
        let mg = MeshGenerator::new();
        assert_eq!(mg.rotation(0), Some(&Mat3::IDENTITY));
        assert!(mg.rotation(MAX_ROTATIONS).is_none());
        let half = mg.rotation(MAX_ROTATIONS / 2).unwrap();
        assert!((half.m[0][0] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut mg = MeshGenerator::new();
        assert_eq!(mg.set_cell_count(0), Err(MeshGenError::InvalidCellCount(0)));
        assert_eq!(
            mg.set_sample_box(Aabb::new(Vec3::ZERO, Vec3::new(0.0, 1.0, 5.0))),
            Err(MeshGenError::DegenerateSampleBox)
        );
        assert!(matches!(
            mg.set_density_scale(10.0, 10.0, 0.5),
            Err(MeshGenError::InvalidDistanceRange { .. })
        ));
        assert!(mg.set_alpha_scale(5.0, 2.0).is_err());
        assert_eq!(
            mg.remove_geometry(GeometryId(3)),
            Err(MeshGenError::UnknownGeometry(3))
        );
    }

    #[test]
    fn update_without_sample_box_is_a_no_op() {
        let mut mg = MeshGenerator::new();
        let stats = mg.update_for_position(Vec3::ZERO).unwrap();
        assert_eq!(stats, UpdateStats::default());
    }

    #[test]
    fn beam_keeps_topmost_surface() {
        let meshes: Vec<Arc<dyn GroundMesh>> = vec![
            Arc::new(FlatGround::new(1.0)),
            Arc::new(FlatGround::new(4.0)),
            Arc::new(FlatGround::new(2.0)),
        ];
        let sample = Aabb::new(Vec3::new(0.0, -10.0, 0.0), Vec3::new(10.0, 10.0, 10.0));
        let hit = cast_down(&meshes, 3.0, 3.0, &sample, false).unwrap();
        assert_eq!(hit.point, Vec3::new(3.0, 4.0, 3.0));
        assert!(cast_down(&[], 3.0, 3.0, &sample, false).is_none());
    }

    #[test]
    fn rejection_thresholds() {
        let mut rng = CellRng::new(1);
        assert!(rejects(0.0, &mut rng));
        assert!(rejects(0.00005, &mut rng));
        assert!(!rejects(1.0, &mut rng));
        assert!(!rejects(0.99995, &mut rng));
    }

    #[test]
    fn positions_regenerate_identically() {
        let (mut mg, _) = generator(10, 100);
        mg.update_for_position(Vec3::new(50.0, 0.0, 50.0)).unwrap();
        let cid = mg.cell_id(Vec2::new(55.0, 55.0)).unwrap();
        let before = mg.cell_positions(cid).to_vec();
        assert!(!before.is_empty());

        mg.clear_position(Vec3::new(55.0, 0.0, 55.0));
        assert!(mg.cell_positions(cid).is_empty());
        mg.update_for_position(Vec3::new(50.0, 0.0, 50.0)).unwrap();
        let after = mg.cell_positions(cid);
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after) {
            assert_eq!(a.position, b.position);
            assert_eq!(a.rotation, b.rotation);
            assert_eq!(a.random, b.random);
        }
        mg.validate().unwrap();
    }

    #[test]
    fn geometry_edits_regenerate_cells() {
        let (mut mg, g) = generator(10, 100);
        let viewer = Vec3::new(50.0, 0.0, 50.0);
        let first = mg.update_for_position(viewer).unwrap();
        assert!(first.blocks_generated > 0);
        let steady = mg.update_for_position(viewer).unwrap();
        assert_eq!(steady.blocks_generated, 0);
        assert_eq!(steady.instances_allocated, 0);

        mg.geometry_mut(g).unwrap().set_density(0.1);
        let redo = mg.update_for_position(viewer).unwrap();
        assert_eq!(redo.blocks_generated, redo.cells_in_range);
        assert!(redo.live_instances > first.live_instances);
        mg.validate().unwrap();
    }

    #[test]
    fn adding_a_factory_reassigns_lods() {
        let (mut mg, g) = generator(10, 100);
        let viewer = Vec3::new(50.0, 0.0, 50.0);
        mg.update_for_position(viewer).unwrap();
        let live = mg.live_instances();
        assert!(live > 0);

        let near = RecordingFactory::new("grass-near");
        assert_eq!(mg.add_factory(g, near.clone(), 5.0).unwrap(), 0);
        assert_eq!(mg.live_instances(), 0);
        mg.validate().unwrap();

        mg.update_for_position(viewer).unwrap();
        assert_eq!(mg.live_instances(), live);
        mg.validate().unwrap();

        assert_eq!(mg.remove_factory(g, 0), Ok(true));
        assert_eq!(mg.live_instances(), 0);
        mg.update_for_position(viewer).unwrap();
        assert_eq!(mg.live_instances(), live);
    }

    #[test]
    fn removing_geometry_detaches_its_batches() {
        let (mut mg, g) = generator(10, 100);
        let factory = RecordingFactory::new("stone");
        let rocks = mg.create_geometry();
        mg.add_factory(rocks, factory.clone(), 20.0).unwrap();
        mg.geometry_mut(rocks).unwrap().set_density(0.05);
        mg.update_for_position(Vec3::new(50.0, 0.0, 50.0)).unwrap();
        assert!(factory.log().attached);

        mg.remove_geometry(rocks).unwrap();
        assert!(!factory.log().attached);
        assert_eq!(mg.geometry_count(), 1);
        mg.update_for_position(Vec3::new(50.0, 0.0, 50.0)).unwrap();
        assert!(mg.live_instances() > 0);
        assert!(mg.geometry(g).is_some());
        mg.validate().unwrap();
    }

    #[test]
    fn ground_meshes_are_removed_by_identity() {
        let (mut mg, _) = generator(10, 100);
        mg.cell_id(Vec2::ZERO).unwrap();
        assert_eq!(mg.grid().unwrap().cell(0).meshes.len(), 1);
        let patch: Arc<dyn GroundMesh> = Arc::new(FlatGround::new(2.0));
        mg.add_ground_mesh(patch.clone());
        assert_eq!(mg.ground_mesh_count(), 2);
        assert_eq!(mg.grid().unwrap().cell(0).meshes.len(), 2);

        let stranger: Arc<dyn GroundMesh> = Arc::new(FlatGround::new(2.0));
        assert!(!mg.remove_ground_mesh(&stranger));
        assert!(mg.remove_ground_mesh(&patch));
        assert!(!mg.remove_ground_mesh(&patch));
        assert_eq!(mg.ground_mesh_count(), 1);
        assert_eq!(mg.grid().unwrap().cell(0).meshes.len(), 1);
    }

    #[test]
    fn exhausted_cell_skips_later_geometries() {
        let (mut mg, g) = generator(10, 100);
        // Far more 2-radius footprints than a 10x10 cell can hold.
        {
            let boulders = mg.geometry_mut(g).unwrap();
            boulders.set_radius(2.0);
            boulders.set_density(1.0);
        }
        let pebbles = mg.create_geometry();
        mg.add_factory(pebbles, RecordingFactory::new("pebble"), 20.0)
            .unwrap();
        {
            let geom = mg.geometry_mut(pebbles).unwrap();
            geom.set_radius(0.1);
            geom.set_density(0.05);
        }
        mg.update_for_position(Vec3::new(50.0, 0.0, 50.0)).unwrap();

        let cid = mg.cell_id(Vec2::new(55.0, 55.0)).unwrap();
        let positions = mg.cell_positions(cid);
        assert!(!positions.is_empty());
        assert!(positions.len() < 100);
        assert!(positions.iter().all(|p| p.geometry == g.0));
        mg.validate().unwrap();
    }

    #[test]
    fn scale_settings_can_be_cleared() {
        let (mut mg, g) = generator(10, 100);
        mg.set_density_scale(5.0, 20.0, 0.0).unwrap();
        mg.set_alpha_scale(10.0, 20.0).unwrap();
        let viewer = Vec3::new(50.0, 0.0, 50.0);
        mg.update_for_position(viewer).unwrap();
        let scaled = mg.live_instances();

        mg.clear_density_scale();
        mg.clear_alpha_scale();
        mg.clear_all_positions();
        mg.update_for_position(viewer).unwrap();
        assert!(mg.live_instances() > scaled);

        let level = mg.geometry(g).unwrap().level(0).unwrap();
        for e in level.instances().extras() {
            assert_eq!(e.fade_opaque_dist, 20.0);
            assert_eq!(e.fade_dist_scale, 0.0);
        }
        mg.validate().unwrap();
    }

    #[test]
    fn count_positions_matches_ground_coverage() {
        let (mut mg, _) = generator(10, 100);
        // 0.05 per unit over a 10x10 cell
        assert_eq!(mg.count_positions(0), 5);
        assert_eq!(mg.count_all_positions(), 500);
        assert_eq!(mg.count_positions(10_000), 0);
    }
}
