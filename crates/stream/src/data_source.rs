//! Per-(host, backing store) aggregation of voxels awaiting data.
//!
//! A [`StreamDataSource`] keeps its pending voxels ordered by last-served
//! iteration and turns the least recently served ones into a single batched
//! read-set each cycle. It is not internally synchronized: the owning
//! [`StreamHost`](crate::StreamHost) lock guards it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pointstream_common::{StoreId, VoxelId};

use crate::config::ReadBudget;
use crate::control::{CancelToken, PauseFlag, WorkerRole};
use crate::error::StreamError;
use crate::loader::commit_channel_data;
use crate::read_set::{ExecutedReadSet, ReadSet};
use crate::store::BackingStore;
use crate::voxel::Voxel;

struct PendingEntry {
    voxel: Arc<Voxel>,
    iteration: u64,
    token: CancelToken,
    // Planned into a read-set whose results have not been applied yet.
    in_flight: bool,
}

/// Pending voxels ordered by ascending `(last-served iteration, id)`.
///
/// The order key lives outside the voxel, so an iteration change is applied
/// as remove, update, reinsert and the set never holds a stale key.
#[derive(Default)]
pub struct PendingSet {
    order: BTreeSet<(u64, VoxelId)>,
    entries: HashMap<VoxelId, PendingEntry>,
}

impl PendingSet {
    fn insert(&mut self, voxel: Arc<Voxel>, token: CancelToken) -> bool {
        let id = voxel.id();
        if self.entries.contains_key(&id) {
            return false;
        }
        let iteration = voxel.last_served();
        self.order.insert((iteration, id));
        self.entries.insert(
            id,
            PendingEntry {
                voxel,
                iteration,
                token,
                in_flight: false,
            },
        );
        true
    }

    fn remove(&mut self, id: VoxelId) -> Option<PendingEntry> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&(entry.iteration, id));
        Some(entry)
    }

    fn set_iteration(&mut self, id: VoxelId, iteration: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.order.remove(&(entry.iteration, id));
            entry.iteration = iteration;
            self.order.insert((iteration, id));
        }
    }

    /// Least recently served entry not already claimed by a read-set.
    fn next_idle(&self) -> Option<(u64, VoxelId)> {
        self.order
            .iter()
            .find(|(_, id)| self.entries.get(id).is_some_and(|e| !e.in_flight))
            .copied()
    }

    fn claim(&mut self, id: VoxelId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.in_flight = true;
        }
    }

    /// Clear the claim on `id` if it was made in the generation of `token`.
    fn release(&mut self, id: VoxelId, token: &CancelToken) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.token.same_generation(token) {
                entry.in_flight = false;
            }
        }
    }

    pub fn is_in_flight(&self, id: VoxelId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.in_flight)
    }

    pub fn contains(&self, id: VoxelId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iteration_of(&self, id: VoxelId) -> Option<u64> {
        self.entries.get(&id).map(|e| e.iteration)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One voxel's share of a prepared read-set.
#[derive(Debug)]
struct PlannedVoxel {
    voxel: Arc<Voxel>,
    from: u64,
    to: u64,
    reads: usize,
    token: CancelToken,
}

/// A finished read-set and the voxels its reads are destined for.
///
/// Moved into execution; never shared.
#[derive(Debug)]
pub struct PreparedReadSet {
    read_set: ReadSet,
    plan: Vec<PlannedVoxel>,
}

impl PreparedReadSet {
    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    pub fn total_read_size(&self) -> u64 {
        self.read_set.total_read_size()
    }

    pub fn num_voxels(&self) -> usize {
        self.plan.len()
    }

    /// Voxels in the order their reads were issued.
    pub fn voxels(&self) -> impl Iterator<Item = VoxelId> + '_ {
        self.plan.iter().map(|p| p.voxel.id())
    }

    /// The pending-set claims this read-set holds, for releasing them when
    /// the read-set never reaches demultiplexing.
    pub(crate) fn claims(&self) -> Vec<(VoxelId, CancelToken)> {
        self.plan.iter().map(|p| (p.voxel.id(), p.token.clone())).collect()
    }
}

/// Result of executing a [`PreparedReadSet`].
#[derive(Debug)]
pub struct ExecutedBatch {
    executed: ExecutedReadSet,
    plan: Vec<PlannedVoxel>,
}

impl ExecutedBatch {
    pub fn bytes_transferred(&self) -> u64 {
        self.executed.bytes_transferred()
    }

    pub fn executed(&self) -> &ExecutedReadSet {
        &self.executed
    }
}

/// Result of offering one more voxel to the read-set under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FillStep {
    Added,
    /// The voxel already held its request LOD and left the pending set.
    Satisfied,
    /// The budget cannot take the next voxel; selection ends.
    Stop,
    /// Nothing left to offer.
    Empty,
}

/// Context a read-set's results are applied in.
#[derive(Debug, Clone, Default)]
pub struct PagerContext {
    /// Scheduler tick served voxels are bumped to.
    pub tick: u64,
    pub role: WorkerRole,
    pub pause: Option<PauseFlag>,
}

/// Outcome of demultiplexing one executed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Voxels whose data was committed and iteration bumped.
    pub served: usize,
    /// Served voxels that reached their request LOD and left the pending set.
    pub completed: usize,
    /// Voxels whose data was dropped: removed, cancelled, or changed since selection.
    pub discarded: usize,
    pub bytes_committed: u64,
    /// A pause stopped demultiplexing before every voxel was visited.
    pub interrupted: bool,
}

struct ReadSetBuilder {
    read_set: ReadSet,
    plan: Vec<PlannedVoxel>,
}

/// Pending voxels and read-set construction for one backing store.
pub struct StreamDataSource {
    store: Arc<dyn BackingStore>,
    pending: PendingSet,
    building: Option<ReadSetBuilder>,
}

impl StreamDataSource {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self {
            store,
            pending: PendingSet::default(),
            building: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn store_id(&self) -> StoreId {
        self.store.id()
    }

    /// Queue `voxel` for streaming. Returns false when nothing changed.
    pub fn add_voxel(&mut self, voxel: Arc<Voxel>) -> bool {
        if self.pending.contains(voxel.id()) {
            return false;
        }
        let registered = voxel.try_register();
        debug_assert!(
            registered,
            "voxel {:?} is already pending in another data source",
            voxel.id()
        );
        if !registered {
            tracing::warn!(voxel = ?voxel.id(), "voxel already pending elsewhere, ignoring");
            return false;
        }
        let token = voxel.begin_streaming();
        tracing::debug!(voxel = ?voxel.id(), store = ?self.store.id(), "voxel queued");
        self.pending.insert(voxel, token)
    }

    /// Drop `id` from the pending set and cancel its in-flight work. Absent
    /// voxels are ignored.
    pub fn remove_voxel(&mut self, id: VoxelId) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                entry.voxel.cancel_streaming();
                entry.voxel.unregister();
                tracing::debug!(voxel = ?id, "voxel removed from streaming");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: VoxelId) -> bool {
        self.pending.contains(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    /// Pending voxel ids, least recently served first.
    pub fn pending_order(&self) -> Vec<VoxelId> {
        self.pending.order.iter().map(|(_, id)| *id).collect()
    }

    pub fn is_building(&self) -> bool {
        self.building.is_some()
    }

    /// Start a fresh read-set.
    pub fn begin_read_set(&mut self) -> Result<(), StreamError> {
        if self.building.is_some() {
            return Err(StreamError::ReadSetInProgress);
        }
        let read_set = match self.store.remote_object() {
            Some(remote) => ReadSet::for_remote(self.store.id(), remote),
            None => ReadSet::new(self.store.id()),
        };
        self.building = Some(ReadSetBuilder {
            read_set,
            plan: Vec::new(),
        });
        Ok(())
    }

    /// Add the least recently served voxels to the read-set under
    /// construction until `budget` runs out. Returns the number of voxels
    /// added.
    ///
    /// A voxel that does not fit ends the selection, except the first one,
    /// which is trimmed to the whole points that fit. Voxels that already
    /// hold their request LOD leave the pending set. Voxels claimed by a
    /// read-set that has not been applied yet are skipped.
    pub fn fill_read_set(&mut self, budget: &mut ReadBudget) -> usize {
        loop {
            let trim = self.building.as_ref().is_some_and(|b| b.plan.is_empty());
            match self.fill_next(budget, trim) {
                FillStep::Added | FillStep::Satisfied => {}
                FillStep::Stop | FillStep::Empty => break,
            }
        }
        self.building.as_ref().map_or(0, |b| b.plan.len())
    }

    /// Order key of the voxel [`fill_next`](Self::fill_next) would look at.
    pub(crate) fn next_candidate(&self) -> Option<(u64, VoxelId)> {
        self.building.as_ref()?;
        self.pending.next_idle()
    }

    /// Offer the least recently served idle voxel to the read-set under
    /// construction. With `trim`, a voxel too large for `budget` is cut down
    /// to the whole points that fit instead of ending the selection.
    pub(crate) fn fill_next(&mut self, budget: &mut ReadBudget, trim: bool) -> FillStep {
        let Some(builder) = self.building.as_mut() else {
            return FillStep::Empty;
        };
        if budget.is_exhausted() {
            return FillStep::Stop;
        }
        let Some((_, id)) = self.pending.next_idle() else {
            return FillStep::Empty;
        };
        let Some(entry) = self.pending.entries.get(&id) else {
            return FillStep::Empty;
        };
        let voxel = entry.voxel.clone();
        let token = entry.token.clone();

        let (from, target) = {
            let data = voxel.lock();
            (data.loaded_points, voxel.points_for_lod(data.request_lod))
        };
        if target <= from {
            if let Some(entry) = self.pending.remove(id) {
                entry.voxel.unregister();
                tracing::debug!(voxel = ?id, "voxel at request lod, leaving pending set");
            }
            return FillStep::Satisfied;
        }

        let mut to = target;
        let mut bytes = voxel.bytes_between(from, to);
        if bytes > budget.max_bytes {
            let bpp = voxel.bytes_per_point();
            if !trim || bpp == 0 {
                return FillStep::Stop;
            }
            let fit = budget.max_bytes / bpp;
            if fit == 0 {
                return FillStep::Stop;
            }
            to = from + fit;
            bytes = voxel.bytes_between(from, to);
        }

        let reads = voxel.read_requests(from, to);
        let count = reads.len();
        if let Err(err) = builder.read_set.extend(reads) {
            tracing::warn!(voxel = ?id, error = %err, "voxel reads do not fit the read-set");
            return FillStep::Stop;
        }
        builder.plan.push(PlannedVoxel {
            voxel,
            from,
            to,
            reads: count,
            token,
        });
        self.pending.claim(id);
        budget.consume(bytes);
        FillStep::Added
    }

    /// Finish the read-set under construction. `None` when none was started
    /// or nothing was selected.
    pub fn end_read_set(&mut self) -> Option<PreparedReadSet> {
        let builder = self.building.take()?;
        if builder.plan.is_empty() {
            return None;
        }
        tracing::debug!(
            store = ?self.store.id(),
            voxels = builder.plan.len(),
            reads = builder.read_set.num_reads(),
            bytes = builder.read_set.total_read_size(),
            "read-set built"
        );
        Some(PreparedReadSet {
            read_set: builder.read_set,
            plan: builder.plan,
        })
    }

    pub fn execute_read_set(&self, prepared: PreparedReadSet) -> Result<ExecutedBatch, StreamError> {
        execute_read_set(self.store.as_ref(), prepared)
    }

    /// Give up on a read-set built here without applying it. Its voxels
    /// become selectable again.
    pub fn abandon_read_set(&mut self, prepared: PreparedReadSet) {
        self.release_claims(&prepared.claims());
    }

    pub(crate) fn release_claims(&mut self, claims: &[(VoxelId, CancelToken)]) {
        for (id, token) in claims {
            self.pending.release(*id, token);
        }
    }

    /// Commit an executed batch into its voxels in issue order.
    ///
    /// The whole batch is verified first; a size mismatch touches no voxel
    /// and leaves every one of them pending at its old iteration.
    pub fn load_read_set_voxel_data(
        &mut self,
        batch: ExecutedBatch,
        ctx: &PagerContext,
    ) -> Result<LoadReport, StreamError> {
        let _span = tracing::info_span!(
            "load_read_set",
            store = ?self.store.id(),
            tick = ctx.tick,
            role = ?ctx.role
        )
        .entered();
        for planned in &batch.plan {
            self.pending.release(planned.voxel.id(), &planned.token);
        }
        if let Err(err) = batch.executed.verify() {
            tracing::warn!(error = %err, "read-set verification failed, voxels re-queued");
            return Err(err);
        }

        let mut report = LoadReport::default();
        let mut chunks = batch.executed.chunks();
        for planned in &batch.plan {
            if ctx.pause.as_ref().is_some_and(PauseFlag::is_paused) {
                report.interrupted = true;
                break;
            }
            let slices: Vec<&[u8]> = chunks.by_ref().take(planned.reads).map(|(_, d)| d).collect();
            let voxel = &planned.voxel;
            let id = voxel.id();
            if !self.pending.contains(id) || planned.token.is_cancelled() {
                report.discarded += 1;
                continue;
            }

            let done = {
                let mut data = voxel.lock();
                if data.loaded_points != planned.from {
                    report.discarded += 1;
                    continue;
                }
                let previous = data.current_lod;
                match commit_channel_data(&mut data, voxel, planned.from, planned.to, &slices) {
                    Ok(bytes) => report.bytes_committed += bytes,
                    Err(err) => {
                        tracing::warn!(voxel = ?id, error = %err, "discarding voxel data");
                        report.discarded += 1;
                        continue;
                    }
                }
                data.previous_lod = previous;
                data.loaded_points >= voxel.points_for_lod(data.request_lod)
            };

            let iteration = voxel.bump_last_served(ctx.tick);
            report.served += 1;
            if done {
                if let Some(entry) = self.pending.remove(id) {
                    entry.voxel.unregister();
                }
                report.completed += 1;
            } else {
                self.pending.set_iteration(id, iteration);
            }
        }
        Ok(report)
    }
}

impl Drop for StreamDataSource {
    fn drop(&mut self) {
        for entry in self.pending.entries.values() {
            entry.voxel.cancel_streaming();
            entry.voxel.unregister();
        }
    }
}

/// Build one read-set per source from a single shared budget.
///
/// Voxels are taken in ascending `(last-served iteration, id)` order across
/// every source, so a source with a deep backlog cannot starve the others.
/// Only the first voxel of the whole pass may be trimmed to fit. The result
/// lines up with `sources`; a source that was already building gets `None`.
pub(crate) fn prepare_fairly(
    sources: &mut [&mut StreamDataSource],
    budget: &mut ReadBudget,
) -> Vec<Option<PreparedReadSet>> {
    let mut open: Vec<bool> = sources
        .iter_mut()
        .map(|source| match source.begin_read_set() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(store = ?source.store_id(), error = %err, "skipping data source");
                false
            }
        })
        .collect();

    let mut first = true;
    while !budget.is_exhausted() {
        let next = sources
            .iter()
            .enumerate()
            .filter(|(i, _)| open[*i])
            .filter_map(|(i, source)| source.next_candidate().map(|key| (key, i)))
            .min();
        let Some((_, i)) = next else {
            break;
        };
        match sources[i].fill_next(budget, first) {
            FillStep::Added => first = false,
            FillStep::Satisfied => {}
            FillStep::Stop => break,
            FillStep::Empty => open[i] = false,
        }
    }

    sources
        .iter_mut()
        .zip(open)
        .map(|(source, opened)| if opened { source.end_read_set() } else { None })
        .collect()
}

/// Execute `prepared` against `store`. Runs without any data source lock held.
pub fn execute_read_set(store: &dyn BackingStore, prepared: PreparedReadSet) -> Result<ExecutedBatch, StreamError> {
    let _span = tracing::info_span!(
        "execute_read_set",
        store = ?store.id(),
        reads = prepared.read_set.num_reads(),
        bytes = prepared.read_set.total_read_size()
    )
    .entered();
    let data = store.execute(&prepared.read_set)?;
    Ok(ExecutedBatch {
        executed: ExecutedReadSet::new(prepared.read_set, data),
        plan: prepared.plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::synthetic::{synthetic_cloud, synthetic_position};
    use crate::voxel::LoadState;
    use pointstream_common::{Extents, StoreId};

    fn source_with(voxels: &[Arc<Voxel>], store: MemoryStore) -> StreamDataSource {
        let mut source = StreamDataSource::new(Arc::new(store));
        for voxel in voxels {
            voxel.set_request_lod(1.0);
            assert!(source.add_voxel(voxel.clone()));
        }
        source
    }

    fn cycle(source: &mut StreamDataSource, budget: ReadBudget, tick: u64) -> LoadReport {
        let mut budget = budget;
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut budget);
        let Some(prepared) = source.end_read_set() else {
            return LoadReport::default();
        };
        let batch = source.execute_read_set(prepared).unwrap();
        let ctx = PagerContext {
            tick,
            ..PagerContext::default()
        };
        source.load_read_set_voxel_data(batch, &ctx).unwrap()
    }

    #[test]
    fn least_recently_served_voxels_win() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 3, 10);
        let aged = |v: &Voxel, iteration: u64| {
            let copy = Voxel::new(StoreId(1), *v.extents(), v.point_count(), v.channel_sources().to_vec());
            Arc::new(copy.with_last_served(iteration))
        };
        let a = aged(&voxels[0], 5);
        let b = aged(&voxels[1], 1);
        let c = aged(&voxels[2], 3);
        let mut source = source_with(&[a.clone(), b.clone(), c.clone()], store);

        let mut budget = ReadBudget::voxels(2);
        source.begin_read_set().unwrap();
        assert_eq!(source.fill_read_set(&mut budget), 2);
        let prepared = source.end_read_set().unwrap();
        assert_eq!(prepared.voxels().collect::<Vec<_>>(), vec![b.id(), c.id()]);

        let batch = source.execute_read_set(prepared).unwrap();
        let ctx = PagerContext {
            tick: 10,
            ..PagerContext::default()
        };
        let report = source.load_read_set_voxel_data(batch, &ctx).unwrap();
        assert_eq!(report.served, 2);
        assert_eq!(b.last_served(), 10);
        assert_eq!(c.last_served(), 10);
        assert_eq!(a.last_served(), 5);
        assert!(source.contains(a.id()));
        assert_eq!(a.state(), LoadState::Unloaded);
        assert_eq!(b.state(), LoadState::FullyLoaded);
        assert_eq!(c.positions()[3], synthetic_position(2, 3));
    }

    #[test]
    fn partially_served_voxels_move_to_the_back() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 3, 100);
        let mut source = source_with(&voxels, store);
        let before = source.pending_order();

        // Room for half of the first voxel only.
        let report = cycle(&mut source, ReadBudget::bytes(50 * 14), 1);
        assert_eq!(report.served, 1);
        assert_eq!(report.completed, 0);
        let first = voxels.iter().find(|v| v.id() == before[0]).unwrap();
        assert_eq!(first.state(), LoadState::PartiallyLoaded(0.5));

        let after = source.pending_order();
        assert_eq!(after.len(), 3);
        assert_eq!(after[2], before[0]);
        assert_eq!(source.pending().iteration_of(before[0]), Some(1));
    }

    #[test]
    fn byte_budget_is_never_exceeded() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 8, 37);
        let mut source = source_with(&voxels, store);
        for limit in [1u64, 13, 14, 500, 519, 2000] {
            let mut budget = ReadBudget::bytes(limit);
            source.begin_read_set().unwrap();
            source.fill_read_set(&mut budget);
            if let Some(prepared) = source.end_read_set() {
                assert!(prepared.total_read_size() <= limit, "limit {limit}");
            }
        }
    }

    #[test]
    fn pending_set_stays_sorted_through_adds_and_removes() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 6, 4);
        let mut source = StreamDataSource::new(Arc::new(store));
        let mut adds = 0usize;
        let mut removes = 0usize;
        for (i, voxel) in voxels.iter().enumerate() {
            voxel.bump_last_served((i as u64 * 7) % 5);
            if source.add_voxel(voxel.clone()) {
                adds += 1;
            }
            if i % 2 == 1 && source.remove_voxel(voxels[i - 1].id()) {
                removes += 1;
            }
            assert_eq!(source.len(), adds - removes);
            let iterations: Vec<u64> = source
                .pending_order()
                .iter()
                .map(|id| source.pending().iteration_of(*id).unwrap())
                .collect();
            assert!(iterations.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn removing_an_absent_voxel_is_a_no_op() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 2, 4);
        let mut source = StreamDataSource::new(Arc::new(store));
        source.add_voxel(voxels[0].clone());
        let order = source.pending_order();
        assert!(!source.remove_voxel(voxels[1].id()));
        assert!(!source.remove_voxel(VoxelId::new()));
        assert_eq!(source.pending_order(), order);
        assert!(!source.add_voxel(voxels[0].clone()));
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn removal_cancels_in_flight_batch() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 2, 10);
        let mut source = source_with(&voxels, store);
        let mut budget = ReadBudget::default();
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut budget);
        let prepared = source.end_read_set().unwrap();
        let batch = source.execute_read_set(prepared).unwrap();

        source.remove_voxel(voxels[0].id());
        assert!(voxels[0].cancel_token().is_cancelled());
        let report = source.load_read_set_voxel_data(batch, &PagerContext::default()).unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(report.served, 1);
        assert_eq!(voxels[0].loaded_bytes(), 0);
        assert!(!voxels[0].is_registered());
    }

    #[test]
    fn verification_failure_leaves_voxels_pending() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 2, 10);
        let mut source = source_with(&voxels, store);
        let mut budget = ReadBudget::default();
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut budget);
        let prepared = source.end_read_set().unwrap();
        let batch = ExecutedBatch {
            executed: ExecutedReadSet::new(prepared.read_set, vec![0; 3]),
            plan: prepared.plan,
        };
        let result = source.load_read_set_voxel_data(batch, &PagerContext::default());
        assert!(matches!(result, Err(StreamError::Verification { .. })));
        assert_eq!(source.len(), 2);
        assert!(voxels.iter().all(|v| v.loaded_bytes() == 0 && v.last_served() == 0));
        assert!(voxels.iter().all(|v| !source.pending().is_in_flight(v.id())));
    }

    #[test]
    fn claimed_voxels_are_skipped_until_released() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 2, 10);
        let mut source = source_with(&voxels, store);

        let mut budget = ReadBudget::voxels(1);
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut budget);
        let first = source.end_read_set().unwrap();
        let claimed: Vec<VoxelId> = first.voxels().collect();
        assert!(source.pending().is_in_flight(claimed[0]));

        let mut budget = ReadBudget::default();
        source.begin_read_set().unwrap();
        assert_eq!(source.fill_read_set(&mut budget), 1);
        let second = source.end_read_set().unwrap();
        let other: Vec<VoxelId> = second.voxels().collect();
        assert_ne!(other, claimed);

        source.begin_read_set().unwrap();
        assert_eq!(source.fill_read_set(&mut ReadBudget::default()), 0);
        assert!(source.end_read_set().is_none());

        source.abandon_read_set(second);
        assert!(!source.pending().is_in_flight(other[0]));
        source.begin_read_set().unwrap();
        assert_eq!(source.fill_read_set(&mut ReadBudget::default()), 1);
        assert!(source.end_read_set().is_some());

        let batch = source.execute_read_set(first).unwrap();
        let report = source.load_read_set_voxel_data(batch, &PagerContext::default()).unwrap();
        assert_eq!(report.served, 1);
    }

    #[test]
    fn claims_from_an_earlier_generation_are_ignored() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 1, 10);
        let mut source = source_with(&voxels, store);
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut ReadBudget::default());
        let stale = source.end_read_set().unwrap();

        source.remove_voxel(voxels[0].id());
        source.add_voxel(voxels[0].clone());
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut ReadBudget::default());
        let _current = source.end_read_set().unwrap();

        source.abandon_read_set(stale);
        assert!(source.pending().is_in_flight(voxels[0].id()));
    }

    #[test]
    fn foreground_load_since_selection_discards_batch_entry() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 1, 10);
        let mut source = source_with(&voxels, store);
        let mut budget = ReadBudget::default();
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut budget);
        let prepared = source.end_read_set().unwrap();
        let batch = source.execute_read_set(prepared).unwrap();

        crate::loader::load_voxel(source.store().as_ref(), &voxels[0], 0.5, false, true).unwrap();
        let report = source.load_read_set_voxel_data(batch, &PagerContext::default()).unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(voxels[0].lock().loaded_points(), 5);
        assert!(source.contains(voxels[0].id()));
    }

    #[test]
    fn paused_demux_serves_nothing() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 2, 10);
        let mut source = source_with(&voxels, store);
        let mut budget = ReadBudget::default();
        source.begin_read_set().unwrap();
        source.fill_read_set(&mut budget);
        let prepared = source.end_read_set().unwrap();
        let batch = source.execute_read_set(prepared).unwrap();
        let pause = PauseFlag::new();
        pause.pause();
        let ctx = PagerContext {
            tick: 4,
            role: WorkerRole::Pager,
            pause: Some(pause),
        };
        let report = source.load_read_set_voxel_data(batch, &ctx).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.served, 0);
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn satisfied_voxels_leave_without_reads() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 2, 10);
        let mut source = StreamDataSource::new(Arc::new(store));
        voxels[0].set_request_lod(0.0);
        voxels[1].set_request_lod(1.0);
        source.add_voxel(voxels[0].clone());
        source.add_voxel(voxels[1].clone());

        let mut budget = ReadBudget::default();
        source.begin_read_set().unwrap();
        assert_eq!(source.fill_read_set(&mut budget), 1);
        assert!(!source.contains(voxels[0].id()));
        assert!(!voxels[0].is_registered());
        assert!(source.end_read_set().is_some());
    }

    #[test]
    fn nested_read_set_is_rejected() {
        let store = MemoryStore::new(StoreId(1), Vec::new());
        let mut source = StreamDataSource::new(Arc::new(store));
        source.begin_read_set().unwrap();
        assert!(matches!(source.begin_read_set(), Err(StreamError::ReadSetInProgress)));
        assert!(source.end_read_set().is_none());
        assert!(!source.is_building());
    }

    #[test]
    fn dropping_a_source_releases_its_voxels() {
        let (store, voxels) = synthetic_cloud(StoreId(1), 1, 10);
        let source = source_with(&voxels, store);
        assert!(voxels[0].is_registered());
        drop(source);
        assert!(!voxels[0].is_registered());
        let other = Voxel::new(StoreId(1), Extents::default(), 0, Vec::new());
        assert!(!other.is_registered());
    }
}
