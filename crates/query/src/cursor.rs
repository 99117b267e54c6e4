//! Resumable point query: "the next N points from where this client left off".

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use pointstream_common::{ClientId, Extents};
use pointstream_stream::{LoadOutcome, StoreRegistry, StreamError, Voxel, VoxelLoader, WorkerRole};

use crate::density::QuerySettings;
use crate::error::QueryError;
use crate::state_set::{QueryState, VoxelQueryStateSet};

/// A voxel this query raised above its resident LOD and has not finished
/// iterating yet.
struct RaisedVoxel {
    voxel: Arc<Voxel>,
    lod: f32,
}

/// A point query over an ordered voxel list, filtered by extents.
///
/// The query order is every voxel intersecting the extents, in list order,
/// each contributing the first points of its density amount. A client's
/// cursor counts the points of that order it has been through.
pub struct PointQuery {
    voxels: Vec<Arc<Voxel>>,
    extents: Extents,
    settings: QuerySettings,
    raised: HashMap<ClientId, RaisedVoxel>,
}

impl PointQuery {
    pub fn new(voxels: Vec<Arc<Voxel>>, extents: Extents, settings: QuerySettings) -> Self {
        Self {
            voxels,
            extents,
            settings,
            raised: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: QuerySettings) {
        self.settings = settings;
    }

    /// Append up to `max` positions to `out`, continuing from the cursor of
    /// `client`, and advance the cursor. Returns the number of points added.
    ///
    /// Voxels are loaded on the caller's thread when the density asks for
    /// more than is resident; a voxel raised that way drops back to its
    /// earlier LOD once it has been fully iterated.
    pub fn next_points(
        &mut self,
        states: &mut VoxelQueryStateSet,
        client: ClientId,
        stores: &StoreRegistry,
        max: usize,
        out: &mut Vec<Vec3>,
    ) -> Result<usize, QueryError> {
        let mut pos = 0;
        let state = states.get_query_state(client, Some(&mut pos));
        let mut cursor = state.last_point_index;
        let limit = self.settings.point_limit().unwrap_or(u64::MAX);
        let mut voxel_start = 0u64;
        let mut delivered = 0usize;

        for voxel in &self.voxels {
            if delivered >= max || cursor >= limit {
                break;
            }
            if !voxel.extents().intersects(&self.extents) {
                continue;
            }
            let amount = self.settings.load_amount(voxel);
            let count = voxel.points_for_lod(amount.amount);
            let voxel_end = voxel_start + count;
            if cursor >= voxel_end {
                voxel_start = voxel_end;
                continue;
            }

            let mut raised_by_load = None;
            if amount.load {
                let store = stores
                    .get(voxel.store())
                    .ok_or(StreamError::UnknownStore(voxel.store()))?;
                let outcome = VoxelLoader::new(voxel, amount.amount)
                    .role(WorkerRole::Foreground)
                    .lock(true)
                    .load(store.as_ref())?;
                if let LoadOutcome::Loaded { .. } = outcome {
                    raised_by_load = Some(voxel.lock().previous_lod());
                }
            }
            // Taken only once loading can no longer fail, so an error keeps it.
            let earlier = match self.raised.get(&client) {
                Some(raised) if Arc::ptr_eq(&raised.voxel, voxel) => {
                    self.raised.remove(&client).map(|r| r.lod)
                }
                _ => None,
            };
            let restore = earlier.or(raised_by_load);

            let positions = voxel.positions();
            let mut index = cursor - voxel_start;
            while index < count && delivered < max && cursor < limit {
                if let Some(point) = positions.get(index as usize) {
                    if self.extents.contains(*point) {
                        out.push(*point);
                        delivered += 1;
                    }
                }
                index += 1;
                cursor += 1;
            }

            if let Some(lod) = restore {
                if cursor >= voxel_end {
                    VoxelLoader::new(voxel, lod).lock(true).unload_to(lod);
                } else {
                    self.raised.insert(
                        client,
                        RaisedVoxel {
                            voxel: voxel.clone(),
                            lod,
                        },
                    );
                }
            }
            voxel_start = voxel_end;
        }

        if !client.is_none() {
            states.set_query_state_at(pos, QueryState::new(client, cursor))?;
        }
        tracing::trace!(client = client.0, delivered, cursor, "query points delivered");
        Ok(delivered)
    }

    /// Forget the cursor of `client` and release anything the query still
    /// holds loaded on its behalf.
    pub fn reset(&mut self, states: &mut VoxelQueryStateSet, client: ClientId) {
        states.remove_query_state(client);
        if let Some(raised) = self.raised.remove(&client) {
            VoxelLoader::new(&raised.voxel, raised.lod)
                .lock(true)
                .unload_to(raised.lod);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::QueryDensity;
    use pointstream_common::StoreId;
    use pointstream_stream::{BackingStore, load_voxel, synthetic_cloud, synthetic_position};

    fn setup(voxels: usize, points: u64) -> (StoreRegistry, Vec<Arc<Voxel>>) {
        let (store, voxels) = synthetic_cloud(StoreId(1), voxels, points);
        let registry = StoreRegistry::new();
        let store: Arc<dyn BackingStore> = Arc::new(store);
        registry.insert(store);
        (registry, voxels)
    }

    #[test]
    fn cursor_resumes_across_calls() {
        let (stores, voxels) = setup(2, 10);
        let mut query = PointQuery::new(voxels, Extents::infinite(), QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let client = ClientId(7);

        let mut out = Vec::new();
        assert_eq!(query.next_points(&mut states, client, &stores, 4, &mut out).unwrap(), 4);
        assert_eq!(out[3], synthetic_position(0, 3));
        assert_eq!(states.get_query_state(client, None).last_point_index, 4);

        out.clear();
        assert_eq!(query.next_points(&mut states, client, &stores, 10, &mut out).unwrap(), 10);
        assert_eq!(out[0], synthetic_position(0, 4));
        assert_eq!(out[6], synthetic_position(1, 0));

        out.clear();
        assert_eq!(query.next_points(&mut states, client, &stores, 100, &mut out).unwrap(), 6);
        assert_eq!(out[5], synthetic_position(1, 9));
        assert_eq!(query.next_points(&mut states, client, &stores, 100, &mut out).unwrap(), 0);
        assert_eq!(states.get_query_state(client, None).last_point_index, 20);
    }

    #[test]
    fn clients_are_independent() {
        let (stores, voxels) = setup(1, 10);
        let mut query = PointQuery::new(voxels, Extents::infinite(), QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();

        query.next_points(&mut states, ClientId(1), &stores, 8, &mut out).unwrap();
        out.clear();
        query.next_points(&mut states, ClientId(2), &stores, 2, &mut out).unwrap();
        assert_eq!(out, vec![synthetic_position(0, 0), synthetic_position(0, 1)]);
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn raised_lod_is_restored_after_iteration() {
        let (stores, voxels) = setup(2, 10);
        let mut query = PointQuery::new(voxels.clone(), Extents::infinite(), QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let client = ClientId(3);
        let mut out = Vec::new();

        query.next_points(&mut states, client, &stores, 15, &mut out).unwrap();
        // First voxel fully iterated and restored; second still in use.
        assert_eq!(voxels[0].loaded_bytes(), 0);
        assert_eq!(voxels[1].current_lod(), 1.0);

        query.reset(&mut states, client);
        assert!(states.get_query_state(client, None).is_null());
        assert_eq!(voxels[1].loaded_bytes(), 0);
    }

    #[test]
    fn partially_iterated_voxel_restored_on_completion() {
        let (stores, voxels) = setup(1, 10);
        let mut query = PointQuery::new(voxels.clone(), Extents::infinite(), QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();

        query.next_points(&mut states, ClientId(1), &stores, 6, &mut out).unwrap();
        assert_eq!(voxels[0].current_lod(), 1.0);
        query.next_points(&mut states, ClientId(1), &stores, 6, &mut out).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(voxels[0].loaded_bytes(), 0);
    }

    #[test]
    fn resident_data_is_left_in_place() {
        let (stores, voxels) = setup(1, 10);
        let store = stores.get(StoreId(1)).unwrap();
        load_voxel(store.as_ref(), &voxels[0], 1.0, false, true).unwrap();
        let mut query = PointQuery::new(voxels.clone(), Extents::infinite(), QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();

        query.next_points(&mut states, ClientId(1), &stores, 100, &mut out).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(voxels[0].current_lod(), 1.0);
    }

    #[test]
    fn extents_filter_points_and_voxels() {
        let (stores, voxels) = setup(2, 10);
        let extents = Extents::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(4.5, 0.5, 1.0));
        let mut query = PointQuery::new(voxels.clone(), extents, QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();

        assert_eq!(query.next_points(&mut states, ClientId(1), &stores, 100, &mut out).unwrap(), 5);
        assert_eq!(out.last(), Some(&synthetic_position(0, 4)));
        assert_eq!(states.get_query_state(ClientId(1), None).last_point_index, 10);
        assert_eq!(voxels[1].loaded_bytes(), 0);
    }

    #[test]
    fn point_limit_caps_the_query() {
        let (stores, voxels) = setup(2, 10);
        let settings = QuerySettings::new(QueryDensity::Limit, 7.0);
        let mut query = PointQuery::new(voxels, Extents::infinite(), settings);
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();

        assert_eq!(query.next_points(&mut states, ClientId(1), &stores, 100, &mut out).unwrap(), 7);
        assert_eq!(query.next_points(&mut states, ClientId(1), &stores, 100, &mut out).unwrap(), 0);
    }

    #[test]
    fn view_density_never_loads() {
        let (stores, voxels) = setup(2, 10);
        let store = stores.get(StoreId(1)).unwrap();
        load_voxel(store.as_ref(), &voxels[0], 0.5, false, true).unwrap();
        for voxel in &voxels {
            voxel.set_request_lod(1.0);
        }
        let settings = QuerySettings::new(QueryDensity::View, 1.0);
        let mut query = PointQuery::new(voxels.clone(), Extents::infinite(), settings);
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();

        assert_eq!(query.next_points(&mut states, ClientId(1), &stores, 100, &mut out).unwrap(), 5);
        assert_eq!(voxels[1].loaded_bytes(), 0);
        assert_eq!(voxels[0].current_lod(), 0.5);
    }

    #[test]
    fn failed_load_keeps_the_pending_restore() {
        let (stores, voxels) = setup(1, 10);
        let mut query = PointQuery::new(voxels.clone(), Extents::infinite(), QuerySettings::new(QueryDensity::Full, 0.5));
        let mut states = VoxelQueryStateSet::new();
        let client = ClientId(5);
        let mut out = Vec::new();

        query.next_points(&mut states, client, &stores, 3, &mut out).unwrap();
        assert_eq!(voxels[0].current_lod(), 0.5);

        // Asking for more needs another load, which now has no store to read from.
        query.set_settings(QuerySettings::default());
        let result = query.next_points(&mut states, client, &StoreRegistry::new(), 3, &mut out);
        assert!(matches!(result, Err(QueryError::Stream(StreamError::UnknownStore(_)))));

        query.reset(&mut states, client);
        assert_eq!(voxels[0].loaded_bytes(), 0);
    }

    #[test]
    fn unknown_store_is_reported() {
        let (_, voxels) = setup(1, 10);
        let mut query = PointQuery::new(voxels, Extents::infinite(), QuerySettings::default());
        let mut states = VoxelQueryStateSet::new();
        let mut out = Vec::new();
        let result = query.next_points(&mut states, ClientId(1), &StoreRegistry::new(), 10, &mut out);
        assert!(matches!(result, Err(QueryError::Stream(StreamError::UnknownStore(_)))));
        assert!(states.is_empty());
    }
}
