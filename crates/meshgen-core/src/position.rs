use meshgen_geom::Vec3;

use crate::block_pool::BlockId;

/// Live instance of a position: LOD level plus slot in that level's instance arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceSlot {
    pub lod: usize,
    pub index: usize,
}

/// Address of one position inside the block pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PositionRef {
    pub block: BlockId,
    pub slot: usize,
}

/// One generated candidate scatter point.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub position: Vec3,
    /// Index into the generator's rotation table.
    pub rotation: usize,
    /// Drawn once at generation; drives density fading and the per-instance seed.
    pub random: f32,
    pub geometry: usize,
    pub instance: Option<InstanceSlot>,
    /// Distance at which density scaling admitted this position; `0` when unset.
    pub added_dist: f32,
}

impl Position {
    pub fn new(position: Vec3, rotation: usize, random: f32, geometry: usize) -> Self {
        Self {
            position,
            rotation,
            random,
            geometry,
            instance: None,
            added_dist: 0.0,
        }
    }

    #[inline]
    pub fn is_instanced(&self) -> bool {
        self.instance.is_some()
    }
}
