//! Renderer stand-ins for the demo: batches that only log what they are told.

use log::{debug, trace};
use meshgen_core::{InstanceBatch, InstanceExtra, InstanceTransform, MeshFactory};
use meshgen_geom::Vec3;

pub struct LoggingFactory {
    name: String,
}

impl LoggingFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl MeshFactory for LoggingFactory {
    fn create_instance_batch(&self) -> Box<dyn InstanceBatch> {
        debug!(target: "meshgen::batch", "{}: batch created", self.name);
        Box::new(LoggingBatch {
            name: self.name.clone(),
            anchor: Vec3::ZERO,
            attached: false,
            capacity: 0,
        })
    }
}

struct LoggingBatch {
    name: String,
    anchor: Vec3,
    attached: bool,
    capacity: usize,
}

impl InstanceBatch for LoggingBatch {
    fn set_anchor(&mut self, anchor: Vec3) {
        self.anchor = anchor;
    }

    fn anchor(&self) -> Vec3 {
        self.anchor
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    fn attach(&mut self) {
        self.attached = true;
        debug!(target: "meshgen::batch", "{}: attached", self.name);
    }

    fn detach(&mut self) {
        self.attached = false;
        debug!(target: "meshgen::batch", "{}: detached", self.name);
    }

    fn set_instance_count(&mut self, count: usize) {
        trace!(target: "meshgen::batch", "{}: {count} instances", self.name);
    }

    fn set_wind_data(&mut self, wind: Vec3) {
        debug!(
            target: "meshgen::batch",
            "{}: wind offset=({:.2}, {:.2}) bias={:.2}",
            self.name,
            wind.x,
            wind.y,
            wind.z
        );
    }

    fn allocate_buffers(&mut self, capacity: usize) {
        debug!(
            target: "meshgen::batch",
            "{}: buffers {} -> {capacity}",
            self.name,
            self.capacity
        );
        self.capacity = capacity;
    }

    fn upload(&mut self, transforms: &[InstanceTransform], extras: &[InstanceExtra]) {
        trace!(
            target: "meshgen::batch",
            "{}: upload {} transforms {} extras",
            self.name,
            transforms.len(),
            extras.len()
        );
    }
}
