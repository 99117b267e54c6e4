//! Streaming: out-of-core voxel cache for massive point clouds.
//!
//! Decides which voxels need data in memory, batches the byte-range reads
//! that fill them into read-sets, and loads or unloads their channel data at
//! a fractional level of detail.
//!
//! # Invariants
//! - A voxel is pending in at most one data source at a time.
//! - A voxel's last-served iteration never decreases and only moves when a
//!   completed read served it.
//! - A read-set handed to execution is never modified; new demand goes into
//!   a fresh one.
//! - Voxel buffers are mutated only under the voxel lock, and only after the
//!   data for the whole change has been staged and verified.

mod config;
mod control;
mod data_source;
mod error;
mod host;
mod loader;
mod pager;
mod read_set;
mod remote;
mod scheduler;
mod store;
mod synthetic;
mod voxel;

pub use config::{ReadBudget, StreamConfig};
pub use control::{CancelToken, PauseFlag, WorkerRole};
pub use data_source::{
    ExecutedBatch, LoadReport, PagerContext, PendingSet, PreparedReadSet, StreamDataSource,
    execute_read_set,
};
pub use error::{ConfigError, StreamError};
pub use host::{DataSourceHandle, StreamHost};
pub use loader::{LoadOutcome, UnloadOutcome, VoxelLoader, load_sample, load_voxel, unload_voxel};
pub use pager::Pager;
pub use read_set::{ExecutedReadSet, ReadRequest, ReadSet};
pub use remote::{RemoteStore, Transport, serve_read_request};
pub use scheduler::{ProcessReport, StreamScheduler, StreamingSession};
pub use store::{BackingStore, FileStore, LOCAL_HOST, MemoryStore, StoreRegistry};
pub use synthetic::{synthetic_cloud, synthetic_position};
pub use voxel::{
    ChannelBuffer, ChannelSource, LoadState, Voxel, VoxelData, decode_positions, encode_positions,
};

pub fn crate_info() -> &'static str {
    "pointstream-stream v0.1.0"
}
