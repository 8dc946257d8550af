//! Procedural scatter of instanced meshes around a moving viewer: cell grid, position
//! block cache, LOD banding and instance bookkeeping.
#![forbid(unsafe_code)]

pub mod block_pool;
pub mod config;
pub mod density;
pub mod error;
pub mod generator;
pub mod geometry;
pub mod grid;
pub mod instances;
pub mod position;
pub mod scene;
pub mod testing;

pub use block_pool::{BlockId, BlockPool, BlockPoolStats};
pub use config::{GeneratorConfig, load_config_from_path};
pub use density::{DensityFactorMap, MapTransform};
pub use error::{InvariantViolation, MeshGenError};
pub use generator::{MAX_ROTATIONS, MeshGenerator, UpdateStats};
pub use geometry::{FadeParams, GeometryId, GeometryLod};
pub use instances::{InstanceArrays, InstanceExtra, InstanceTransform};
pub use position::{InstanceSlot, Position, PositionRef};
pub use scene::{BeamHit, DensitySampler, GroundMesh, InstanceBatch, MaterialId, MeshFactory};
