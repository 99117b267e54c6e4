//! Deterministic synthetic point clouds for benches and tests.

use std::sync::Arc;

use glam::Vec3;
use pointstream_common::{ChannelKind, Extents, StoreId};

use crate::store::MemoryStore;
use crate::voxel::{ChannelSource, Voxel, encode_positions};

/// Position of point `index` in voxel `voxel` of a synthetic cloud.
pub fn synthetic_position(voxel: usize, index: u64) -> Vec3 {
    Vec3::new(voxel as f32 * 1000.0 + index as f32, voxel as f32, 0.0)
}

/// Build `voxel_count` voxels of `points_per_voxel` points each, laid out one
/// after another in a single memory store. Every voxel carries a position
/// and an intensity channel; intensity is the point index.
pub fn synthetic_cloud(
    store: StoreId,
    voxel_count: usize,
    points_per_voxel: u64,
) -> (MemoryStore, Vec<Arc<Voxel>>) {
    let mut bytes = Vec::new();
    let mut voxels = Vec::with_capacity(voxel_count);

    for v in 0..voxel_count {
        let points: Vec<Vec3> = (0..points_per_voxel)
            .map(|i| synthetic_position(v, i))
            .collect();
        let position_offset = bytes.len() as u64;
        bytes.extend_from_slice(&encode_positions(&points));
        let intensity_offset = bytes.len() as u64;
        for i in 0..points_per_voxel {
            bytes.extend_from_slice(&(i as u16).to_le_bytes());
        }

        let extents = Extents::new(
            synthetic_position(v, 0),
            synthetic_position(v, points_per_voxel.saturating_sub(1)),
        );
        let sources = vec![
            ChannelSource {
                kind: ChannelKind::Position,
                offset: position_offset,
            },
            ChannelSource {
                kind: ChannelKind::Intensity,
                offset: intensity_offset,
            },
        ];
        voxels.push(Arc::new(Voxel::new(store, extents, points_per_voxel, sources)));
    }

    (MemoryStore::new(store, bytes), voxels)
}
