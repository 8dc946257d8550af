//! Seams to the renderer and the scene: everything the generator consumes but does not own.

use meshgen_geom::{Aabb, Vec3};

use crate::instances::{InstanceExtra, InstanceTransform};

/// Opaque material identity reported by ground hits and used by material density factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeamHit {
    pub point: Vec3,
    pub material: Option<MaterialId>,
}

/// Surface that candidate positions are dropped onto.
pub trait GroundMesh {
    /// First intersection of the segment `start..end`, if any. `want_material` asks for the
    /// hit material when it is not free to compute.
    fn hit_beam(&self, start: Vec3, end: Vec3, want_material: bool) -> Option<BeamHit>;

    /// World bounds used to assign the mesh to grid cells; `None` means unbounded.
    fn bounds(&self) -> Option<Aabb> {
        None
    }
}

/// One mesh variant a geometry can instance at a given LOD.
pub trait MeshFactory {
    fn create_instance_batch(&self) -> Box<dyn InstanceBatch>;
}

/// Renderer-side collection of instances sharing one factory.
pub trait InstanceBatch {
    /// Position that instance translations are relative to.
    fn set_anchor(&mut self, anchor: Vec3);
    fn anchor(&self) -> Vec3;

    fn is_attached(&self) -> bool;
    /// Put the batch into the scene.
    fn attach(&mut self);
    /// Take the batch out of the scene.
    fn detach(&mut self);

    fn set_instance_count(&mut self, count: usize);
    /// `(max offset x, max offset z, bias)`.
    fn set_wind_data(&mut self, wind: Vec3);

    /// Replace the instance buffers with new ones of `capacity` elements.
    fn allocate_buffers(&mut self, capacity: usize);
    /// Copy the live instance data into the current buffers.
    fn upload(&mut self, transforms: &[InstanceTransform], extras: &[InstanceExtra]);
}

/// Scalar field sampled on the ground plane, e.g. a terrain-provided density raster.
pub trait DensitySampler {
    /// Factor in `[0, 1]` at world `(x, z)`.
    fn sample(&self, x: f32, z: f32) -> f32;
}

impl<F> DensitySampler for F
where
    F: Fn(f32, f32) -> f32,
{
    fn sample(&self, x: f32, z: f32) -> f32 {
        self(x, z)
    }
}
