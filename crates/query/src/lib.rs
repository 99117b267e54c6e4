//! Query: resumable, per-client point retrieval over streamed voxels.
//!
//! # Invariants
//! - At most one cursor per client.
//! - A client's cursor only moves forward until the client resets it.

mod cursor;
mod density;
mod error;
mod state_set;

pub use cursor::PointQuery;
pub use density::{LoadAmount, QueryDensity, QuerySettings, voxel_load_amount};
pub use error::QueryError;
pub use state_set::{QueryState, VoxelQueryStateSet};

pub fn crate_info() -> &'static str {
    "pointstream-query v0.1.0"
}
