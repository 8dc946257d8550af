use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshGenError {
    /// More cells are in range than the block pool can hold; the frame is abandoned.
    #[error("{needed} cells in range but only {max_blocks} position blocks; raise the block count or lower the draw distance")]
    BlockBudgetExceeded { needed: usize, max_blocks: usize },
    #[error("cell count must be at least 1, got {0}")]
    InvalidCellCount(usize),
    #[error("sample box has no extent on the ground plane")]
    DegenerateSampleBox,
    #[error("distance range {min}..{max} is empty")]
    InvalidDistanceRange { min: f32, max: f32 },
    #[error("no geometry with id {0}")]
    UnknownGeometry(usize),
    #[error("unknown mesh factory `{0}`")]
    UnknownFactory(String),
    #[error("unknown density factor map `{0}`")]
    UnknownDensityFactorMap(String),
    #[error("raster of {width}x{height} expects {} samples, got {len}", .width * .height)]
    InvalidRaster { width: usize, height: usize, len: usize },
}

/// Broken back-reference between a position and the instance arrays.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("instance invariant violated: {0}")]
pub struct InvariantViolation(pub String);
