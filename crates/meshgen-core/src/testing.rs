//! Scene stand-ins shared by unit tests, integration tests and benches.

use std::sync::{Arc, Mutex};

use meshgen_geom::{Aabb, Vec3};

use crate::instances::{InstanceExtra, InstanceTransform};
use crate::scene::{BeamHit, GroundMesh, InstanceBatch, MaterialId, MeshFactory};

/// Horizontal plane at `height`, optionally limited to `bounds` on XZ.
#[derive(Clone, Debug)]
pub struct FlatGround {
    pub height: f32,
    pub bounds: Option<Aabb>,
    pub material: Option<MaterialId>,
}

impl FlatGround {
    pub fn new(height: f32) -> Self {
        Self {
            height,
            bounds: None,
            material: None,
        }
    }

    pub fn bounded(height: f32, bounds: Aabb) -> Self {
        Self {
            height,
            bounds: Some(bounds),
            material: None,
        }
    }

    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.material = Some(material);
        self
    }
}

impl GroundMesh for FlatGround {
    fn hit_beam(&self, start: Vec3, end: Vec3, want_material: bool) -> Option<BeamHit> {
        let (lo, hi) = if start.y <= end.y {
            (start.y, end.y)
        } else {
            (end.y, start.y)
        };
        if self.height < lo || self.height > hi {
            return None;
        }
        let dy = end.y - start.y;
        let t = if dy == 0.0 { 0.0 } else { (self.height - start.y) / dy };
        let point = Vec3::new(
            start.x + (end.x - start.x) * t,
            self.height,
            start.z + (end.z - start.z) * t,
        );
        if self.bounds.is_some_and(|b| !b.xz_rect().contains(point.xz())) {
            return None;
        }
        Some(BeamHit {
            point,
            material: if want_material { self.material } else { None },
        })
    }

    fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }
}

/// Everything the batches of one [`RecordingFactory`] were told.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchLog {
    pub batches: usize,
    pub attached: bool,
    pub attaches: usize,
    pub detaches: usize,
    pub instance_count: usize,
    pub allocations: usize,
    pub capacity: usize,
    pub uploads: usize,
    pub last_upload: Vec<InstanceTransform>,
    pub last_extras: Vec<InstanceExtra>,
    pub last_wind: Option<Vec3>,
    pub anchor: Vec3,
}

#[derive(Debug)]
pub struct RecordingFactory {
    name: String,
    log: Arc<Mutex<BatchLog>>,
}

impl RecordingFactory {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log: Arc::new(Mutex::new(BatchLog::default())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the shared log.
    pub fn log(&self) -> BatchLog {
        self.log.lock().unwrap().clone()
    }
}

impl MeshFactory for RecordingFactory {
    fn create_instance_batch(&self) -> Box<dyn InstanceBatch> {
        self.log.lock().unwrap().batches += 1;
        Box::new(RecordingBatch {
            log: Arc::clone(&self.log),
            anchor: Vec3::ZERO,
            attached: false,
        })
    }
}

#[derive(Debug)]
pub struct RecordingBatch {
    log: Arc<Mutex<BatchLog>>,
    anchor: Vec3,
    attached: bool,
}

impl InstanceBatch for RecordingBatch {
    fn set_anchor(&mut self, anchor: Vec3) {
        self.anchor = anchor;
        self.log.lock().unwrap().anchor = anchor;
    }

    fn anchor(&self) -> Vec3 {
        self.anchor
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    fn attach(&mut self) {
        self.attached = true;
        let mut log = self.log.lock().unwrap();
        log.attached = true;
        log.attaches += 1;
    }

    fn detach(&mut self) {
        self.attached = false;
        let mut log = self.log.lock().unwrap();
        log.attached = false;
        log.detaches += 1;
    }

    fn set_instance_count(&mut self, count: usize) {
        self.log.lock().unwrap().instance_count = count;
    }

    fn set_wind_data(&mut self, wind: Vec3) {
        self.log.lock().unwrap().last_wind = Some(wind);
    }

    fn allocate_buffers(&mut self, capacity: usize) {
        let mut log = self.log.lock().unwrap();
        log.allocations += 1;
        log.capacity = capacity;
    }

    fn upload(&mut self, transforms: &[InstanceTransform], extras: &[InstanceExtra]) {
        let mut log = self.log.lock().unwrap();
        log.uploads += 1;
        log.last_upload = transforms.to_vec();
        log.last_extras = extras.to_vec();
    }
}
