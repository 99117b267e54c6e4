use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pointstream_common::{StoreId, VoxelId};

use crate::config::ReadBudget;
use crate::control::CancelToken;
use crate::data_source::{ExecutedBatch, LoadReport, PagerContext, PreparedReadSet, StreamDataSource, prepare_fairly};
use crate::error::StreamError;
use crate::store::BackingStore;
use crate::voxel::Voxel;

/// A named endpoint supplying voxel data, and the data sources for each of
/// its backing stores.
///
/// The sources map is the host-level lock: registration and read-set
/// demultiplexing both go through it.
pub struct StreamHost {
    name: String,
    active: AtomicBool,
    sources: Mutex<BTreeMap<StoreId, StreamDataSource>>,
}

impl StreamHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: AtomicBool::new(false),
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn data_source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Pending voxels across every data source of this host.
    pub fn num_voxels(&self) -> usize {
        self.sources.lock().values().map(StreamDataSource::len).sum()
    }

    pub fn contains_voxel(&self, store: StoreId, id: VoxelId) -> bool {
        self.sources
            .lock()
            .get(&store)
            .is_some_and(|source| source.contains(id))
    }

    /// Route `voxel` into the data source for `store`, creating it on first
    /// use. Returns whether a data source was created.
    pub(crate) fn add_voxel(&self, store: &Arc<dyn BackingStore>, voxel: Arc<Voxel>) -> bool {
        let mut sources = self.sources.lock();
        let mut created = false;
        let source = sources.entry(store.id()).or_insert_with(|| {
            created = true;
            tracing::debug!(host = %self.name, store = ?store.id(), "data source created");
            StreamDataSource::new(store.clone())
        });
        source.add_voxel(voxel);
        created
    }

    pub(crate) fn remove_voxel(&self, store: StoreId, id: VoxelId) -> bool {
        self.sources
            .lock()
            .get_mut(&store)
            .is_some_and(|source| source.remove_voxel(id))
    }

    /// Apply an executed batch to the data source it was built by.
    pub(crate) fn load_batch(
        &self,
        store: StoreId,
        batch: ExecutedBatch,
        ctx: &PagerContext,
    ) -> Result<LoadReport, StreamError> {
        let mut sources = self.sources.lock();
        match sources.get_mut(&store) {
            Some(source) => source.load_read_set_voxel_data(batch, ctx),
            // The source was pruned while the batch was in flight.
            None => Ok(LoadReport::default()),
        }
    }

    /// Make the voxels of a read-set that failed before demultiplexing
    /// selectable again.
    pub(crate) fn release_claims(&self, store: StoreId, claims: &[(VoxelId, CancelToken)]) {
        if let Some(source) = self.sources.lock().get_mut(&store) {
            source.release_claims(claims);
        }
    }

    /// Destroy data sources whose pending set is empty. Returns how many went.
    pub(crate) fn prune_empty_sources(&self) -> usize {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|store, source| {
            let keep = !source.is_empty();
            if !keep {
                tracing::debug!(host = %self.name, store = ?store, "data source pruned");
            }
            keep
        });
        before - sources.len()
    }
}

/// Build read-sets for every data source of `hosts` from one shared budget,
/// least recently served voxels first regardless of host or store.
///
/// Host locks are taken in slice order and held until selection is done.
pub(crate) fn prepare_across_hosts(
    hosts: &[Arc<StreamHost>],
    budget: &mut ReadBudget,
) -> Vec<(Arc<StreamHost>, Arc<dyn BackingStore>, PreparedReadSet)> {
    let mut guards: Vec<_> = hosts.iter().map(|host| host.sources.lock()).collect();
    let mut owners = Vec::new();
    let mut sources: Vec<&mut StreamDataSource> = Vec::new();
    for (i, guard) in guards.iter_mut().enumerate() {
        for source in guard.values_mut() {
            owners.push(i);
            sources.push(source);
        }
    }
    let prepared = prepare_fairly(&mut sources, budget);
    sources
        .iter()
        .zip(owners)
        .zip(prepared)
        .filter_map(|((source, owner), prepared)| {
            prepared.map(|p| (hosts[owner].clone(), source.store().clone(), p))
        })
        .collect()
}

/// Handle on the data source a voxel was routed into.
#[derive(Clone)]
pub struct DataSourceHandle {
    host: Arc<StreamHost>,
    store: StoreId,
}

impl DataSourceHandle {
    pub(crate) fn new(host: Arc<StreamHost>, store: StoreId) -> Self {
        Self { host, store }
    }

    pub fn host(&self) -> &Arc<StreamHost> {
        &self.host
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    /// Pending voxels in this data source; 0 once it has been pruned.
    pub fn num_voxels(&self) -> usize {
        self.host
            .sources
            .lock()
            .get(&self.store)
            .map_or(0, StreamDataSource::len)
    }

    pub fn is_live(&self) -> bool {
        self.host.sources.lock().contains_key(&self.store)
    }
}
