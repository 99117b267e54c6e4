//! The voxel entity the streaming engine fills and drains.
//!
//! Voxels are created and destroyed by the point cloud catalog. The engine
//! only mutates their channel buffers, LOD bookkeeping and last-served
//! iteration. Channel bytes live contiguously in the backing store with
//! points in progressive order, so loading a higher LOD always appends to
//! what is already resident.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use glam::Vec3;
use parking_lot::{Mutex, MutexGuard};
use pointstream_common::{ChannelKind, Extents, StoreId, VoxelId, clamp_lod, points_at_lod};

use crate::control::CancelToken;
use crate::read_set::ReadRequest;

/// Location of one channel's data in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSource {
    pub kind: ChannelKind,
    /// Byte offset of the channel's first point.
    pub offset: u64,
}

/// Observable load state of a voxel.
///
/// Sampling, loading and unloading run while the voxel lock is held, so
/// readers only ever observe the settled states below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadState {
    Unloaded,
    /// Only the coarse preview is resident.
    Sampled,
    PartiallyLoaded(f32),
    FullyLoaded,
}

/// Resident channel bytes for one channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelBuffer {
    pub(crate) bytes: Vec<u8>,
}

impl ChannelBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Mutable voxel state, guarded by the voxel lock.
#[derive(Debug)]
pub struct VoxelData {
    pub(crate) channels: Vec<ChannelBuffer>,
    pub(crate) loaded_points: u64,
    pub(crate) current_lod: f32,
    pub(crate) request_lod: f32,
    pub(crate) previous_lod: f32,
    pub(crate) sample: Option<Vec<u8>>,
    pub(crate) state: LoadState,
}

impl VoxelData {
    fn new(channel_count: usize) -> Self {
        Self {
            channels: vec![ChannelBuffer::default(); channel_count],
            loaded_points: 0,
            current_lod: 0.0,
            request_lod: 0.0,
            previous_lod: 0.0,
            sample: None,
            state: LoadState::Unloaded,
        }
    }

    pub fn loaded_points(&self) -> u64 {
        self.loaded_points
    }

    pub fn current_lod(&self) -> f32 {
        self.current_lod
    }

    pub fn request_lod(&self) -> f32 {
        self.request_lod
    }

    /// LOD the voxel had before the last load raised it.
    pub fn previous_lod(&self) -> f32 {
        self.previous_lod
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Bytes held by the channel buffers (the preview sample is not counted).
    pub fn loaded_bytes(&self) -> u64 {
        self.channels.iter().map(|c| c.len() as u64).sum()
    }

    pub fn channels(&self) -> &[ChannelBuffer] {
        &self.channels
    }

    pub fn sample(&self) -> Option<&[u8]> {
        self.sample.as_deref()
    }

    /// Recompute `state` from the resident data.
    pub(crate) fn refresh_state(&mut self, point_count: u64) {
        self.state = if self.loaded_points >= point_count {
            LoadState::FullyLoaded
        } else if self.loaded_points > 0 {
            LoadState::PartiallyLoaded(self.current_lod)
        } else if self.sample.is_some() {
            LoadState::Sampled
        } else {
            LoadState::Unloaded
        };
    }
}

/// A bounded spatial partition of a point cloud.
#[derive(Debug)]
pub struct Voxel {
    id: VoxelId,
    store: StoreId,
    extents: Extents,
    point_count: u64,
    sources: Vec<ChannelSource>,
    data: Mutex<VoxelData>,
    last_served: AtomicU64,
    registered: AtomicBool,
    cancel: Mutex<CancelToken>,
}

impl Voxel {
    pub fn new(store: StoreId, extents: Extents, point_count: u64, sources: Vec<ChannelSource>) -> Self {
        Self::with_id(VoxelId::new(), store, extents, point_count, sources)
    }

    pub fn with_id(
        id: VoxelId,
        store: StoreId,
        extents: Extents,
        point_count: u64,
        sources: Vec<ChannelSource>,
    ) -> Self {
        let data = VoxelData::new(sources.len());
        Self {
            id,
            store,
            extents,
            point_count,
            sources,
            data: Mutex::new(data),
            last_served: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            cancel: Mutex::new(CancelToken::new()),
        }
    }

    /// Restore a last-served iteration recorded by the catalog.
    pub fn with_last_served(self, iteration: u64) -> Self {
        self.last_served.store(iteration, Ordering::Release);
        self
    }

    pub fn id(&self) -> VoxelId {
        self.id
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    pub fn channel_sources(&self) -> &[ChannelSource] {
        &self.sources
    }

    pub fn channel_index(&self, kind: ChannelKind) -> Option<usize> {
        self.sources.iter().position(|s| s.kind == kind)
    }

    /// Bytes per point summed over every channel.
    pub fn bytes_per_point(&self) -> u64 {
        self.sources
            .iter()
            .map(|s| s.kind.bytes_per_point() as u64)
            .sum()
    }

    /// Acquire the voxel lock.
    pub fn lock(&self) -> MutexGuard<'_, VoxelData> {
        self.data.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, VoxelData>> {
        self.data.try_lock()
    }

    pub fn current_lod(&self) -> f32 {
        self.data.lock().current_lod
    }

    pub fn request_lod(&self) -> f32 {
        self.data.lock().request_lod
    }

    /// Set the LOD consumers want resident. The scheduler streams towards it.
    pub fn set_request_lod(&self, lod: f32) {
        self.data.lock().request_lod = clamp_lod(lod);
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.data.lock().loaded_bytes()
    }

    pub fn state(&self) -> LoadState {
        self.data.lock().state
    }

    /// Resident positions, decoded from the position channel.
    pub fn positions(&self) -> Vec<Vec3> {
        let data = self.data.lock();
        self.channel_index(ChannelKind::Position)
            .map(|i| decode_positions(data.channels[i].as_bytes()))
            .unwrap_or_default()
    }

    pub fn last_served(&self) -> u64 {
        self.last_served.load(Ordering::Acquire)
    }

    /// Raise the last-served iteration to `tick`. Never lowers it.
    pub fn bump_last_served(&self, tick: u64) -> u64 {
        self.last_served.fetch_max(tick, Ordering::AcqRel).max(tick)
    }

    /// Points needed to reach `lod`.
    pub fn points_for_lod(&self, lod: f32) -> u64 {
        points_at_lod(self.point_count, lod)
    }

    /// Bytes needed to grow from `from_points` to `to_points` across all channels.
    pub fn bytes_between(&self, from_points: u64, to_points: u64) -> u64 {
        to_points.saturating_sub(from_points) * self.bytes_per_point()
    }

    /// One read per channel covering points `from_points..to_points`.
    pub fn read_requests(&self, from_points: u64, to_points: u64) -> Vec<ReadRequest> {
        if to_points <= from_points {
            return Vec::new();
        }
        self.sources
            .iter()
            .map(|s| {
                let bpp = s.kind.bytes_per_point() as u64;
                ReadRequest {
                    voxel: self.id,
                    channel: s.kind,
                    offset: s.offset + from_points * bpp,
                    len: (to_points - from_points) * bpp,
                }
            })
            .collect()
    }

    /// Mark the voxel as registered in a data source. Returns false if it already was.
    pub(crate) fn try_register(&self) -> bool {
        self.registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unregister(&self) {
        self.registered.store(false, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Start a new streaming generation and return its token.
    pub(crate) fn begin_streaming(&self) -> CancelToken {
        let token = CancelToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    /// Cancel whatever load work belongs to the current streaming generation.
    pub(crate) fn cancel_streaming(&self) {
        self.cancel.lock().cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.lock().clone()
    }
}

/// Decode packed `[f32; 3]` positions. Trailing partial points are ignored.
pub fn decode_positions(bytes: &[u8]) -> Vec<Vec3> {
    let stride = ChannelKind::Position.bytes_per_point();
    bytes
        .chunks_exact(stride)
        .map(|chunk| Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(chunk)))
        .collect()
}

/// Encode positions the way the position channel stores them.
pub fn encode_positions(points: &[Vec3]) -> Vec<u8> {
    let raw: Vec<[f32; 3]> = points.iter().map(|p| p.to_array()).collect();
    bytemuck::cast_slice(&raw).to_vec()
}
