use pointstream_common::ClientId;

use crate::error::QueryError;

/// A client's position in a query: how many points of the query order it
/// has already been through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryState {
    pub client_id: ClientId,
    pub last_point_index: u64,
}

impl QueryState {
    /// Returned for clients without a cursor.
    pub const NULL: QueryState = QueryState {
        client_id: ClientId::NONE,
        last_point_index: 0,
    };

    pub fn new(client_id: ClientId, last_point_index: u64) -> Self {
        Self {
            client_id,
            last_point_index,
        }
    }

    pub fn is_null(&self) -> bool {
        self.client_id.is_none()
    }
}

/// Per-client query cursors, kept sorted by client id.
///
/// There is no expiry: the session layer removes a client's cursor when
/// the client goes away.
#[derive(Debug, Default)]
pub struct VoxelQueryStateSet {
    states: Vec<QueryState>,
}

impl VoxelQueryStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn search(&self, client: ClientId) -> Result<usize, usize> {
        self.states.binary_search_by_key(&client, |s| s.client_id)
    }

    /// Insert or update the cursor of `state.client_id`.
    ///
    /// A cursor may not move backwards; remove it first to restart. States
    /// for [`ClientId::NONE`] are ignored.
    pub fn set_query_state(&mut self, state: QueryState) -> Result<(), QueryError> {
        if state.is_null() {
            return Ok(());
        }
        match self.search(state.client_id) {
            Ok(pos) => Self::advance(&mut self.states[pos], state),
            Err(pos) => {
                self.states.insert(pos, state);
                Ok(())
            }
        }
    }

    /// Like [`set_query_state`](Self::set_query_state), reusing a position
    /// obtained from [`get_query_state`](Self::get_query_state). A stale hint
    /// falls back to a search.
    pub fn set_query_state_at(&mut self, pos: usize, state: QueryState) -> Result<(), QueryError> {
        match self.states.get_mut(pos) {
            Some(existing) if existing.client_id == state.client_id => Self::advance(existing, state),
            _ => self.set_query_state(state),
        }
    }

    fn advance(existing: &mut QueryState, state: QueryState) -> Result<(), QueryError> {
        if state.last_point_index < existing.last_point_index {
            return Err(QueryError::CursorRegressed {
                client: state.client_id,
                current: existing.last_point_index,
                requested: state.last_point_index,
            });
        }
        existing.last_point_index = state.last_point_index;
        Ok(())
    }

    /// Look up the cursor of `client`, or [`QueryState::NULL`].
    ///
    /// `position` receives the entry's index, or where it would be inserted,
    /// for a following [`set_query_state_at`](Self::set_query_state_at).
    pub fn get_query_state(&self, client: ClientId, position: Option<&mut usize>) -> QueryState {
        let found = self.search(client);
        if let Some(position) = position {
            *position = match found {
                Ok(pos) | Err(pos) => pos,
            };
        }
        match found {
            Ok(pos) => self.states[pos],
            Err(_) => QueryState::NULL,
        }
    }

    pub fn remove_query_state(&mut self, client: ClientId) -> bool {
        match self.search(client) {
            Ok(pos) => {
                self.states.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.states.iter().map(|s| s.client_id)
    }
}
