//! Single-voxel load and unload at a target level of detail.
//!
//! A [`VoxelLoader`] is built per invocation. Loads stage every channel in
//! `chunk_size` pieces without holding the voxel lock, polling the cancel
//! token and pause flag between pieces, and only touch the voxel's buffers
//! once all channels are staged. An interrupted or failed load therefore
//! leaves the voxel exactly as it was.

use parking_lot::MutexGuard;
use pointstream_common::{ChannelKind, clamp_lod};

use crate::control::{CancelToken, PauseFlag, WorkerRole, should_stop};
use crate::error::StreamError;
use crate::store::BackingStore;
use crate::voxel::{Voxel, VoxelData};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_SAMPLE_POINTS: u64 = 256;

/// Result of a load request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOutcome {
    /// New data was committed; `lod` is the resulting LOD.
    Loaded { lod: f32, bytes: u64 },
    /// The voxel already holds the requested LOD.
    AlreadyLoaded,
    /// A cancel or pause checkpoint stopped the load before commit.
    Interrupted,
    /// `lock` was not requested and another thread holds the voxel.
    Busy,
    /// Loading is disabled for diagnostics.
    Skipped,
}

/// Result of an unload request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnloadOutcome {
    Unloaded { freed_bytes: u64, lod: f32 },
    AlreadyUnloaded,
    Busy,
}

/// One load or unload of one voxel.
pub struct VoxelLoader<'a> {
    voxel: &'a Voxel,
    lod: f32,
    full: bool,
    lock: bool,
    dump: bool,
    skip_load: bool,
    role: WorkerRole,
    cancel: Option<CancelToken>,
    pause: Option<PauseFlag>,
    chunk_size: usize,
    sample_points: u64,
}

impl<'a> VoxelLoader<'a> {
    pub fn new(voxel: &'a Voxel, lod: f32) -> Self {
        Self {
            voxel,
            lod: clamp_lod(lod),
            full: false,
            lock: true,
            dump: false,
            skip_load: false,
            role: WorkerRole::Pager,
            cancel: None,
            pause: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sample_points: DEFAULT_SAMPLE_POINTS,
        }
    }

    /// Force a complete load regardless of the requested LOD.
    pub fn full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    /// Block on the voxel lock (`true`) or give up with `Busy` when it is held.
    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Release intermediate buffers: slack capacity and, once real data is
    /// resident, the preview sample.
    pub fn dump(mut self, dump: bool) -> Self {
        self.dump = dump;
        self
    }

    pub fn skip_load(mut self, skip: bool) -> Self {
        self.skip_load = skip;
        self
    }

    pub fn role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn pause(mut self, flag: PauseFlag) -> Self {
        self.pause = Some(flag);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn sample_points(mut self, points: u64) -> Self {
        self.sample_points = points;
        self
    }

    pub fn target_lod(&self) -> f32 {
        if self.full { 1.0 } else { self.lod }
    }

    /// Load channel data up to the target LOD.
    pub fn load(&self, store: &dyn BackingStore) -> Result<LoadOutcome, StreamError> {
        let voxel = self.voxel;
        let _span = tracing::info_span!("load_voxel", voxel = ?voxel.id(), role = ?self.role).entered();
        if self.skip_load {
            tracing::debug!("voxel load skipped");
            return Ok(LoadOutcome::Skipped);
        }
        loop {
            let (from, to) = {
                let Some(data) = self.acquire() else {
                    return Ok(LoadOutcome::Busy);
                };
                (data.loaded_points, voxel.points_for_lod(self.target_lod()))
            };
            if to <= from {
                return Ok(LoadOutcome::AlreadyLoaded);
            }

            // Reads run without the voxel lock so renderers and the pager
            // are not held up by slow stores.
            let mut staged = Vec::with_capacity(voxel.channel_sources().len());
            for read in voxel.read_requests(from, to) {
                match self.stage(store, read.offset, read.len)? {
                    Some(buf) => staged.push(buf),
                    None => {
                        tracing::debug!(from, to, "voxel load interrupted");
                        return Ok(LoadOutcome::Interrupted);
                    }
                }
            }

            let Some(mut data) = self.acquire() else {
                return Ok(LoadOutcome::Busy);
            };
            if data.loaded_points != from {
                tracing::trace!(from, now = data.loaded_points, "voxel changed while staging, restaging");
                continue;
            }
            let previous = data.current_lod;
            let chunks: Vec<&[u8]> = staged.iter().map(Vec::as_slice).collect();
            let bytes = commit_channel_data(&mut data, voxel, from, to, &chunks)?;
            data.previous_lod = previous;
            if self.dump {
                release_intermediate(&mut data, voxel.point_count());
            }
            tracing::debug!(lod = data.current_lod, bytes, "voxel loaded");
            return Ok(LoadOutcome::Loaded {
                lod: data.current_lod,
                bytes,
            });
        }
    }

    /// Free channel memory proportionally to `amount` (0 keeps everything,
    /// 1 releases everything including the preview sample).
    pub fn unload(&self, amount: f32) -> UnloadOutcome {
        let amount = clamp_lod(amount);
        self.shrink(|current| current * (1.0 - amount), amount >= 1.0)
    }

    /// Shrink the voxel back to `lod`. A voxel already at or below it is left alone.
    pub fn unload_to(&self, lod: f32) -> UnloadOutcome {
        let lod = clamp_lod(lod);
        self.shrink(|current| current.min(lod), false)
    }

    fn shrink(&self, target: impl FnOnce(f32) -> f32, drop_sample: bool) -> UnloadOutcome {
        let voxel = self.voxel;
        let Some(mut data) = self.acquire() else {
            return UnloadOutcome::Busy;
        };
        if data.loaded_points == 0 && (!drop_sample || data.sample.is_none()) {
            return UnloadOutcome::AlreadyUnloaded;
        }

        let before = data.loaded_bytes() + data.sample.as_ref().map_or(0, |s| s.len() as u64);
        let keep = voxel
            .points_for_lod(target(data.current_lod))
            .min(data.loaded_points);
        for (buffer, source) in data.channels.iter_mut().zip(voxel.channel_sources()) {
            buffer.bytes.truncate(keep as usize * source.kind.bytes_per_point());
            buffer.bytes.shrink_to_fit();
        }
        if drop_sample {
            data.sample = None;
        }
        data.previous_lod = data.current_lod;
        data.loaded_points = keep;
        data.current_lod = lod_of(keep, voxel.point_count());
        data.refresh_state(voxel.point_count());

        let after = data.loaded_bytes() + data.sample.as_ref().map_or(0, |s| s.len() as u64);
        tracing::debug!(voxel = ?voxel.id(), lod = data.current_lod, freed = before - after, "voxel unloaded");
        UnloadOutcome::Unloaded {
            freed_bytes: before - after,
            lod: data.current_lod,
        }
    }

    /// Load a coarse preview of the positions, independent of the main
    /// progressive buffers.
    pub fn load_sample(&self, store: &dyn BackingStore) -> Result<LoadOutcome, StreamError> {
        let voxel = self.voxel;
        if self.skip_load {
            return Ok(LoadOutcome::Skipped);
        }
        let Some(index) = voxel.channel_index(ChannelKind::Position) else {
            return Ok(LoadOutcome::Skipped);
        };
        let points = self.sample_points.min(voxel.point_count());
        let len = points as usize * ChannelKind::Position.bytes_per_point();
        let resident = {
            let Some(data) = self.acquire() else {
                return Ok(LoadOutcome::Busy);
            };
            if data.sample.is_some() {
                return Ok(LoadOutcome::AlreadyLoaded);
            }
            (data.loaded_points >= points).then(|| data.channels[index].bytes[..len].to_vec())
        };
        let sample = match resident {
            Some(sample) => sample,
            None => {
                let offset = voxel.channel_sources()[index].offset;
                match self.stage(store, offset, len as u64)? {
                    Some(buf) => buf,
                    None => return Ok(LoadOutcome::Interrupted),
                }
            }
        };

        let Some(mut data) = self.acquire() else {
            return Ok(LoadOutcome::Busy);
        };
        if data.sample.is_some() {
            return Ok(LoadOutcome::AlreadyLoaded);
        }
        data.sample = Some(sample);
        data.refresh_state(voxel.point_count());
        Ok(LoadOutcome::Loaded {
            lod: lod_of(points, voxel.point_count()),
            bytes: len as u64,
        })
    }

    fn acquire(&self) -> Option<MutexGuard<'a, VoxelData>> {
        if self.lock {
            Some(self.voxel.lock())
        } else {
            self.voxel.try_lock()
        }
    }

    /// Read `len` bytes at `offset` in chunks. `None` when a checkpoint stops the read.
    fn stage(&self, store: &dyn BackingStore, offset: u64, len: u64) -> Result<Option<Vec<u8>>, StreamError> {
        let len = usize::try_from(len).map_err(|_| StreamError::Allocation {
            requested: usize::MAX,
        })?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| StreamError::Allocation { requested: len })?;
        buf.resize(len, 0);

        let mut done = 0;
        while done < len {
            if should_stop(self.cancel.as_ref(), self.pause.as_ref()) {
                return Ok(None);
            }
            let n = self.chunk_size.min(len - done);
            store.read_at(offset + done as u64, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(Some(buf))
    }
}

/// Fraction of `total` represented by `points`.
pub(crate) fn lod_of(points: u64, total: u64) -> f32 {
    if total == 0 {
        1.0
    } else {
        (points as f64 / total as f64) as f32
    }
}

/// Append staged channel data covering points `from..to` to the voxel.
///
/// Every chunk is checked against the expected size and every buffer
/// reserved before the first byte is appended, so a failure leaves the
/// voxel's contents untouched.
pub(crate) fn commit_channel_data(
    data: &mut VoxelData,
    voxel: &Voxel,
    from: u64,
    to: u64,
    chunks: &[&[u8]],
) -> Result<u64, StreamError> {
    let sources = voxel.channel_sources();
    let expected_total = voxel.bytes_between(from, to);
    let actual_total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
    if data.loaded_points != from || chunks.len() != sources.len() || actual_total != expected_total {
        return Err(StreamError::Verification {
            expected: expected_total,
            actual: actual_total,
        });
    }
    for (source, chunk) in sources.iter().zip(chunks) {
        let expected = (to - from) * source.kind.bytes_per_point() as u64;
        if chunk.len() as u64 != expected {
            return Err(StreamError::Verification {
                expected,
                actual: chunk.len() as u64,
            });
        }
    }
    for (buffer, chunk) in data.channels.iter_mut().zip(chunks) {
        buffer
            .bytes
            .try_reserve(chunk.len())
            .map_err(|_| StreamError::Allocation {
                requested: chunk.len(),
            })?;
    }
    for (buffer, chunk) in data.channels.iter_mut().zip(chunks) {
        buffer.bytes.extend_from_slice(chunk);
    }
    data.loaded_points = to;
    data.current_lod = lod_of(to, voxel.point_count());
    data.refresh_state(voxel.point_count());
    Ok(actual_total)
}

fn release_intermediate(data: &mut VoxelData, point_count: u64) {
    for buffer in &mut data.channels {
        buffer.bytes.shrink_to_fit();
    }
    if data.loaded_points > 0 {
        data.sample = None;
    }
    data.refresh_state(point_count);
}

/// Load `voxel` up to `lod`. `full` forces a complete load; `lock` blocks on
/// the voxel lock instead of returning `Busy`.
pub fn load_voxel(
    store: &dyn BackingStore,
    voxel: &Voxel,
    lod: f32,
    full: bool,
    lock: bool,
) -> Result<LoadOutcome, StreamError> {
    VoxelLoader::new(voxel, lod).full(full).lock(lock).load(store)
}

/// Release `amount` (0..=1) of the voxel's resident channel data.
pub fn unload_voxel(voxel: &Voxel, amount: f32, lock: bool) -> UnloadOutcome {
    VoxelLoader::new(voxel, 0.0).lock(lock).unload(amount)
}

/// Load the coarse position preview of `voxel`.
pub fn load_sample(store: &dyn BackingStore, voxel: &Voxel) -> Result<LoadOutcome, StreamError> {
    VoxelLoader::new(voxel, 0.0).load_sample(store)
}
