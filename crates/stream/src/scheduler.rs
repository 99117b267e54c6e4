//! The streaming engine object: owns every active host and drives the
//! periodic build/execute/demultiplex cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::{ReadBudget, StreamConfig};
use crate::control::{PauseFlag, WorkerRole};
use crate::data_source::{PagerContext, PreparedReadSet, execute_read_set};
use crate::error::StreamError;
use crate::host::{DataSourceHandle, StreamHost, prepare_across_hosts};
use crate::loader::{LoadOutcome, VoxelLoader};
use crate::store::{BackingStore, StoreRegistry};
use crate::voxel::Voxel;

struct QueuedReadSet {
    host: Arc<StreamHost>,
    store: Arc<dyn BackingStore>,
    tick: u64,
    prepared: PreparedReadSet,
}

/// Summary of one [`StreamScheduler::process_stream_hosts_read`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub read_sets: usize,
    pub bytes_read: u64,
    pub voxels_served: usize,
    /// Read-sets whose execution or verification failed.
    pub failures: usize,
    pub hosts_pruned: usize,
    pub sources_pruned: usize,
}

/// Coordinates streaming across all hosts.
///
/// One instance per process, shared as `Arc<StreamScheduler>` between the
/// pager thread and foreground callers.
pub struct StreamScheduler {
    config: StreamConfig,
    hosts: Mutex<BTreeMap<String, Arc<StreamHost>>>,
    stores: StoreRegistry,
    queued: Mutex<Vec<QueuedReadSet>>,
    // Next tick to hand out. Starts at 1 so a served voxel is always
    // distinguishable from a never-served one.
    tick: AtomicU64,
    sessions: AtomicUsize,
    pause: PauseFlag,
}

impl Default for StreamScheduler {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

impl StreamScheduler {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(BTreeMap::new()),
            stores: StoreRegistry::new(),
            queued: Mutex::new(Vec::new()),
            tick: AtomicU64::new(1),
            sessions: AtomicUsize::new(0),
            pause: PauseFlag::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Return the host called `name`, creating it if needed, and mark it active.
    pub fn add_stream_host_active(&self, name: &str) -> Arc<StreamHost> {
        let mut hosts = self.hosts.lock();
        Self::host_entry(&mut hosts, name)
    }

    fn host_entry(hosts: &mut BTreeMap<String, Arc<StreamHost>>, name: &str) -> Arc<StreamHost> {
        let host = hosts
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(host = name, "stream host created");
                Arc::new(StreamHost::new(name))
            })
            .clone();
        host.set_active(true);
        host
    }

    pub fn stream_host(&self, name: &str) -> Option<Arc<StreamHost>> {
        self.hosts.lock().get(name).cloned()
    }

    /// Route `voxel` into the data source for `store`. The flag reports
    /// whether a new data source was created.
    pub fn add_active_data_source_voxel(
        &self,
        store: Arc<dyn BackingStore>,
        voxel: Arc<Voxel>,
    ) -> (DataSourceHandle, bool) {
        debug_assert_eq!(store.id(), voxel.store(), "voxel routed to a foreign store");
        if self.stores.get(store.id()).is_none() {
            self.stores.insert(store.clone());
        }
        // Held across the insert so pruning cannot drop the host in between.
        let mut hosts = self.hosts.lock();
        let host = Self::host_entry(&mut hosts, store.host_name());
        let created = host.add_voxel(&store, voxel);
        (DataSourceHandle::new(host, store.id()), created)
    }

    /// Take `voxel` out of streaming. Unknown voxels are ignored.
    pub fn remove_active_voxel(&self, voxel: &Voxel) -> bool {
        let hosts: Vec<_> = self.hosts.lock().values().cloned().collect();
        hosts
            .iter()
            .any(|host| host.remove_voxel(voxel.store(), voxel.id()))
    }

    /// Build read-sets for this tick from the least recently served voxels
    /// of every host, within `budget`. Returns the number of read-sets queued.
    ///
    /// Voxels already in a queued read-set are not selected again until
    /// that read-set has been processed.
    pub fn process_stream_hosts(&self, budget: ReadBudget) -> usize {
        if self.pause.is_paused() {
            return 0;
        }
        let tick = self.tick.fetch_add(1, Ordering::AcqRel);
        let hosts: Vec<_> = self.hosts.lock().values().cloned().collect();
        let mut budget = budget;
        let queued: Vec<_> = prepare_across_hosts(&hosts, &mut budget)
            .into_iter()
            .map(|(host, store, prepared)| QueuedReadSet {
                host,
                store,
                tick,
                prepared,
            })
            .collect();
        let count = queued.len();
        self.queued.lock().extend(queued);
        count
    }

    /// Execute every queued read-set and feed the results back into their
    /// voxels, then prune empty data sources and hosts.
    ///
    /// A failing read-set is logged and counted; its voxels stay pending and
    /// the remaining read-sets are still processed.
    pub fn process_stream_hosts_read(&self) -> ProcessReport {
        let queued = std::mem::take(&mut *self.queued.lock());
        let mut report = ProcessReport::default();

        for item in queued {
            report.read_sets += 1;
            let store_id = item.store.id();
            let ctx = PagerContext {
                tick: item.tick,
                role: WorkerRole::Pager,
                pause: Some(self.pause.clone()),
            };
            let claims = item.prepared.claims();
            let result = execute_read_set(item.store.as_ref(), item.prepared).and_then(|batch| {
                report.bytes_read += batch.bytes_transferred();
                item.host.load_batch(store_id, batch, &ctx)
            });
            match result {
                Ok(load) => report.voxels_served += load.served,
                Err(err) => {
                    item.host.release_claims(store_id, &claims);
                    report.failures += 1;
                    tracing::warn!(host = %item.host.name(), store = ?store_id, error = %err, "read-set failed");
                }
            }
        }

        let mut hosts = self.hosts.lock();
        for host in hosts.values() {
            report.sources_pruned += host.prune_empty_sources();
        }
        let before = hosts.len();
        hosts.retain(|name, host| {
            let keep = host.data_source_count() > 0;
            if !keep {
                host.set_active(false);
                tracing::debug!(host = %name, "stream host pruned");
            }
            keep
        });
        report.hosts_pruned = before - hosts.len();
        report
    }

    /// One full scheduling cycle.
    pub fn tick(&self, budget: ReadBudget) -> ProcessReport {
        let _span = tracing::info_span!("stream_tick", tick = self.current_tick()).entered();
        self.process_stream_hosts(budget);
        let report = self.process_stream_hosts_read();
        tracing::trace!(
            read_sets = report.read_sets,
            bytes = report.bytes_read,
            served = report.voxels_served,
            failures = report.failures,
            "stream tick complete"
        );
        report
    }

    /// Open a streaming session. The session ends when the guard drops.
    pub fn begin_streaming(&self) -> StreamingSession<'_> {
        self.sessions.fetch_add(1, Ordering::AcqRel);
        StreamingSession { scheduler: self }
    }

    /// Close one streaming session. Extra calls are ignored.
    pub fn end_streaming(&self) {
        let _ = self
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_streaming(&self) -> bool {
        self.sessions.load(Ordering::Acquire) > 0
    }

    pub fn num_voxels_active(&self) -> usize {
        self.hosts.lock().values().map(|h| h.num_voxels()).sum()
    }

    pub fn is_stream_host_active(&self, name: &str) -> bool {
        self.hosts.lock().get(name).is_some_and(|h| h.is_active())
    }

    pub fn num_stream_hosts_active(&self) -> usize {
        self.hosts.lock().values().filter(|h| h.is_active()).count()
    }

    /// Stop background loading at the next checkpoint.
    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// The tick the next [`process_stream_hosts`](Self::process_stream_hosts) call uses.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Synchronously load `voxel` to `lod` on the caller's thread, blocking on
    /// the voxel lock. Not affected by [`pause`](Self::pause).
    pub fn load_now(&self, voxel: &Voxel, lod: f32) -> Result<LoadOutcome, StreamError> {
        let store = self
            .stores
            .get(voxel.store())
            .ok_or(StreamError::UnknownStore(voxel.store()))?;
        VoxelLoader::new(voxel, lod)
            .lock(true)
            .role(WorkerRole::Foreground)
            .chunk_size(self.config.chunk_size)
            .sample_points(self.config.sample_points)
            .load(store.as_ref())
    }
}

/// Guard for an open streaming session.
pub struct StreamingSession<'a> {
    scheduler: &'a StreamScheduler,
}

impl Drop for StreamingSession<'_> {
    fn drop(&mut self) {
        self.scheduler.end_streaming();
    }
}
