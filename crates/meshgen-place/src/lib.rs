//! Candidate placement inside one grid cell: seeded sampling and free-area bookkeeping.
#![forbid(unsafe_code)]

mod position_map;
mod rng;

pub use position_map::{AreaId, Candidate, PositionMap};
pub use rng::CellRng;
