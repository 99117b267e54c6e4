//! Shared types for the point stream engine: identifiers, spatial extents,
//! point channel layout and level-of-detail helpers.

mod types;

pub use types::{
    ChannelKind, ClientId, Extents, RemoteObjectId, StoreId, VoxelId, clamp_lod, points_at_lod,
};
