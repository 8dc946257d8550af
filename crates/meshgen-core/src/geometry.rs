//! One scatterable content type and its per-LOD instance batches.

use std::sync::Arc;

use hashbrown::HashMap;
use meshgen_geom::{Mat3, Rect, Vec2, Vec3};

use crate::density::DensityFactorMap;
use crate::error::MeshGenError;
use crate::instances::{InstanceArrays, InstanceExtra, InstanceTransform, Relocation};
use crate::position::{InstanceSlot, PositionRef};
use crate::scene::{DensitySampler, InstanceBatch, MaterialId, MeshFactory};

/// Handle of a geometry inside its generator. Removing a geometry shifts later ids down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub usize);

/// Alpha fade inputs stored in every instance extra.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FadeParams {
    pub opaque_dist: f32,
    pub dist_scale: f32,
}

pub struct LodLevel {
    factory: Arc<dyn MeshFactory>,
    max_distance: f32,
    sq_max_distance: f32,
    batch: Box<dyn InstanceBatch>,
    instances: InstanceArrays,
    buffer_capacity: Option<usize>,
    dirty: bool,
}

impl LodLevel {
    #[inline]
    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    #[inline]
    pub fn factory(&self) -> &Arc<dyn MeshFactory> {
        &self.factory
    }

    #[inline]
    pub fn instances(&self) -> &InstanceArrays {
        &self.instances
    }

    #[inline]
    pub fn batch(&self) -> &dyn InstanceBatch {
        self.batch.as_ref()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl std::fmt::Debug for LodLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LodLevel")
            .field("max_distance", &self.max_distance)
            .field("instances", &self.instances.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("dirty", &self.dirty)
            .finish()
    }
}

struct DensityMap {
    sampler: Arc<dyn DensitySampler>,
    factor: f32,
}

/// Scatterable content type: LOD table, placement parameters and live instances.
///
/// Setters that change which candidates a cell produces bump [`GeometryLod::revision`];
/// the generator regenerates every cell on the next update when it sees a new revision.
pub struct GeometryLod {
    levels: Vec<LodLevel>,
    radius: f32,
    density: f32,
    min_draw_distance: f32,
    sq_min_draw_distance: f32,
    density_map: Option<DensityMap>,
    factor_maps: Vec<(String, f32)>,
    material_factors: HashMap<MaterialId, f32>,
    default_material_factor: f32,
    manual_positions: Vec<Vec2>,
    // Manual positions keyed by cell index; rebuilt whenever the grid changes.
    manual_by_cell: HashMap<usize, Vec<Vec2>>,
    manual_bucketed: bool,
    wind_direction: Vec2,
    wind_bias: f32,
    wind_speed: f32,
    anchor: Vec3,
    revision: u64,
}

impl Default for GeometryLod {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryLod {
    pub fn new() -> Self {
        Self {
            levels: Vec::new(),
            radius: 0.0,
            density: 1.0,
            min_draw_distance: 0.0,
            sq_min_draw_distance: 0.0,
            density_map: None,
            factor_maps: Vec::new(),
            material_factors: HashMap::new(),
            default_material_factor: 0.0,
            manual_positions: Vec::new(),
            manual_by_cell: HashMap::new(),
            manual_bucketed: false,
            wind_direction: Vec2::ZERO,
            wind_bias: 1.0,
            wind_speed: 1.0,
            anchor: Vec3::ZERO,
            revision: 0,
        }
    }

    // ---- configuration --------------------------------------------------------------

    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius.max(0.0);
        self.revision += 1;
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Candidate points per square unit.
    pub fn set_density(&mut self, density: f32) {
        self.density = density.max(0.0);
        self.revision += 1;
    }

    #[inline]
    pub fn density(&self) -> f32 {
        self.density
    }

    pub fn set_minimum_draw_distance(&mut self, dist: f32) {
        self.min_draw_distance = dist;
        self.sq_min_draw_distance = dist * dist;
    }

    #[inline]
    pub fn minimum_draw_distance(&self) -> f32 {
        self.min_draw_distance
    }

    /// Multiply placement density by `sampler(x, z) * factor`.
    pub fn set_density_map(&mut self, sampler: Arc<dyn DensitySampler>, factor: f32) {
        self.density_map = Some(DensityMap { sampler, factor });
        self.revision += 1;
    }

    pub fn clear_density_map(&mut self) {
        if self.density_map.take().is_some() {
            self.revision += 1;
        }
    }

    pub fn add_density_material_factor(&mut self, material: MaterialId, factor: f32) {
        self.material_factors.insert(material, factor);
        self.revision += 1;
    }

    /// Factor for hit materials without an explicit entry.
    pub fn set_default_density_material_factor(&mut self, factor: f32) {
        self.default_material_factor = factor;
        self.revision += 1;
    }

    #[inline]
    pub fn default_density_material_factor(&self) -> f32 {
        self.default_material_factor
    }

    #[inline]
    pub fn uses_material_factors(&self) -> bool {
        !self.material_factors.is_empty()
    }

    pub fn material_factor(&self, material: Option<MaterialId>) -> f32 {
        material
            .and_then(|m| self.material_factors.get(&m).copied())
            .unwrap_or(self.default_material_factor)
    }

    pub fn set_wind_direction(&mut self, x: f32, z: f32) {
        self.wind_direction = Vec2::new(x, z);
        self.push_wind();
    }

    pub fn set_wind_bias(&mut self, bias: f32) {
        self.wind_bias = bias.clamp(0.0, 1.0);
        self.push_wind();
    }

    pub fn set_wind_speed(&mut self, speed: f32) {
        self.wind_speed = speed.max(0.0);
        self.push_wind();
    }

    /// `(max offset x, max offset z, bias)` as handed to the batches.
    pub fn wind_data(&self) -> Vec3 {
        let offset = self.wind_direction * self.wind_speed;
        Vec3::new(offset.x, offset.y, self.wind_bias)
    }

    fn push_wind(&mut self) {
        let wind = self.wind_data();
        for level in &mut self.levels {
            level.batch.set_wind_data(wind);
        }
    }

    /// Author-placed point; cells holding manual points skip random sampling.
    pub fn add_position(&mut self, pos: Vec2) {
        self.manual_positions.push(pos);
        self.manual_bucketed = false;
        self.revision += 1;
    }

    /// Add a manual point at every raster sample equal to `key`. `values` is row-major,
    /// `width` samples per row, rows running along +Z across `region`.
    pub fn add_positions_from_raster(
        &mut self,
        region: Rect,
        width: usize,
        height: usize,
        values: &[f32],
        key: f32,
    ) -> Result<usize, MeshGenError> {
        if values.len() != width * height {
            return Err(MeshGenError::InvalidRaster {
                width,
                height,
                len: values.len(),
            });
        }
        let step_x = region.width() / width.max(1) as f32;
        let step_z = region.depth() / height.max(1) as f32;
        let mut added = 0;
        for (row, samples) in values.chunks(width.max(1)).enumerate() {
            for (col, &v) in samples.iter().enumerate() {
                if v == key {
                    self.manual_positions.push(Vec2::new(
                        region.min_x + col as f32 * step_x,
                        region.min_z + row as f32 * step_z,
                    ));
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.manual_bucketed = false;
            self.revision += 1;
        }
        Ok(added)
    }

    pub fn manual_positions(&self) -> &[Vec2] {
        &self.manual_positions
    }

    pub(crate) fn manual_positions_in(&self, cell: usize) -> Option<&[Vec2]> {
        self.manual_by_cell.get(&cell).map(Vec::as_slice)
    }

    pub(crate) fn needs_manual_bucketing(&self) -> bool {
        !self.manual_bucketed
    }

    pub(crate) fn bucket_manual_positions(&mut self, cell_of: impl Fn(Vec2) -> usize) {
        self.manual_by_cell.clear();
        for &p in &self.manual_positions {
            self.manual_by_cell.entry(cell_of(p)).or_default().push(p);
        }
        self.manual_bucketed = true;
    }

    pub(crate) fn invalidate_manual_buckets(&mut self) {
        self.manual_bucketed = false;
    }

    pub(crate) fn use_density_factor_map(&mut self, id: &str, factor: f32) {
        self.factor_maps.push((id.to_owned(), factor));
        self.revision += 1;
    }

    pub fn density_factor_maps(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        self.factor_maps.iter().map(|(id, f)| (id.as_str(), *f))
    }

    /// Combined density multiplier at world `(x, z)`.
    pub fn density_factor(&self, x: f32, z: f32, maps: &HashMap<String, DensityFactorMap>) -> f32 {
        let mut factor = self
            .density_map
            .as_ref()
            .map_or(1.0, |m| m.sampler.sample(x, z) * m.factor);
        if !self.factor_maps.is_empty() {
            let sum: f32 = self
                .factor_maps
                .iter()
                .map(|(id, weight)| maps.get(id).map_or(0.0, |m| m.density(x, z)) * weight)
                .sum();
            factor *= sum;
        }
        factor
    }

    /// Bumped by every setter that changes the candidate set.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // ---- LOD table ------------------------------------------------------------------

    /// Insert a level keeping the table sorted by `max_distance`; returns its LOD index.
    /// Callers must free this geometry's instances first since later indices shift.
    pub(crate) fn add_factory(&mut self, factory: Arc<dyn MeshFactory>, max_distance: f32) -> usize {
        let mut batch = factory.create_instance_batch();
        batch.set_anchor(self.anchor);
        batch.set_wind_data(self.wind_data());
        let at = self
            .levels
            .partition_point(|l| l.max_distance <= max_distance);
        self.levels.insert(
            at,
            LodLevel {
                factory,
                max_distance,
                sq_max_distance: max_distance * max_distance,
                batch,
                instances: InstanceArrays::new(),
                buffer_capacity: None,
                dirty: false,
            },
        );
        at
    }

    /// Drop LOD level `lod`. The level must not hold instances.
    pub(crate) fn remove_factory(&mut self, lod: usize) -> bool {
        if lod >= self.levels.len() {
            return false;
        }
        let mut level = self.levels.remove(lod);
        debug_assert!(level.instances.is_empty(), "removing a LOD level with live instances");
        if level.batch.is_attached() {
            level.batch.detach();
        }
        true
    }

    pub fn levels(&self) -> &[LodLevel] {
        &self.levels
    }

    pub fn level(&self, lod: usize) -> Option<&LodLevel> {
        self.levels.get(lod)
    }

    /// Largest LOD threshold; `0` without factories.
    pub fn max_draw_distance(&self) -> f32 {
        self.levels.last().map_or(0.0, |l| l.max_distance)
    }

    pub fn live_instances(&self) -> usize {
        self.levels.iter().map(|l| l.instances.len()).sum()
    }

    // ---- LOD selection ---------------------------------------------------------------

    /// LOD for a squared viewer distance, `None` when closer than the minimum draw
    /// distance or beyond the last threshold.
    pub fn lod_level(&self, sq_distance: f32) -> Option<usize> {
        if sq_distance < self.sq_min_draw_distance {
            return None;
        }
        self.levels
            .iter()
            .position(|l| sq_distance <= l.sq_max_distance)
    }

    /// Whether `sq_distance` still falls in `lod`'s band.
    pub fn is_right_lod(&self, sq_distance: f32, lod: usize) -> bool {
        if sq_distance < self.sq_min_draw_distance {
            return false;
        }
        let Some(level) = self.levels.get(lod) else {
            return false;
        };
        if sq_distance > level.sq_max_distance {
            return false;
        }
        lod == 0 || sq_distance > self.levels[lod - 1].sq_max_distance
    }

    // ---- instance management ---------------------------------------------------------

    /// Append an instance for `owner` at the LOD matching `sq_distance`.
    pub fn alloc_mesh(
        &mut self,
        sq_distance: f32,
        owner: PositionRef,
        fade: FadeParams,
        random: f32,
    ) -> Option<InstanceSlot> {
        let lod = self.lod_level(sq_distance)?;
        let level = &mut self.levels[lod];
        let index = level.instances.push(
            owner,
            InstanceExtra {
                random,
                fade_opaque_dist: fade.opaque_dist,
                fade_dist_scale: fade.dist_scale,
            },
        );
        level.dirty = true;
        Some(InstanceSlot { lod, index })
    }

    /// Swap-remove an instance. A returned relocation names the owner whose slot index
    /// has to be patched.
    pub fn free_mesh(&mut self, slot: InstanceSlot) -> Option<Relocation> {
        let level = &mut self.levels[slot.lod];
        level.dirty = true;
        level.instances.remove_at(slot.index)
    }

    /// Write the instance transform; translation is stored relative to the batch anchor.
    pub fn move_mesh(&mut self, slot: InstanceSlot, world: Vec3, rotation: &Mat3) {
        let level = &mut self.levels[slot.lod];
        let rel = world - level.batch.anchor();
        level
            .instances
            .set_transform(slot.index, InstanceTransform::new(rotation, rel));
        level.dirty = true;
    }

    pub fn set_fade_params(&mut self, slot: InstanceSlot, fade: FadeParams) {
        let level = &mut self.levels[slot.lod];
        let extra = level.instances.extra_mut(slot.index);
        extra.fade_opaque_dist = fade.opaque_dist;
        extra.fade_dist_scale = fade.dist_scale;
        level.dirty = true;
    }

    /// Re-anchor every batch; live transforms must be rewritten afterwards.
    pub fn update_anchor(&mut self, anchor: Vec3) {
        self.anchor = anchor;
        for level in &mut self.levels {
            level.batch.set_anchor(anchor);
        }
    }

    /// Push this frame's instance state to the batches.
    pub fn finish_update(&mut self) {
        for level in &mut self.levels {
            if level.instances.is_empty() {
                if level.batch.is_attached() {
                    level.batch.detach();
                }
                continue;
            }
            if !level.batch.is_attached() {
                level.batch.attach();
            }
            level.batch.set_instance_count(level.instances.len());

            // Buffers follow the array capacity so small size changes keep them.
            let capacity = level.instances.capacity();
            let mut upload = level.dirty;
            if level.buffer_capacity != Some(capacity) {
                level.batch.allocate_buffers(capacity);
                level.buffer_capacity = Some(capacity);
                upload = true;
            }
            if upload {
                level
                    .batch
                    .upload(level.instances.transforms(), level.instances.extras());
            }
            level.dirty = false;
        }
    }
}

impl std::fmt::Debug for GeometryLod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryLod")
            .field("levels", &self.levels)
            .field("radius", &self.radius)
            .field("density", &self.density)
            .field("min_draw_distance", &self.min_draw_distance)
            .field("manual_positions", &self.manual_positions.len())
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}
