//! Stores reached through an external transport.
//!
//! The engine only needs an opaque remote object identifier and the CBOR
//! encoding of a [`ReadSet`]; framing and connection management belong to
//! the [`Transport`] implementation.

use pointstream_common::{ChannelKind, RemoteObjectId, StoreId, VoxelId};

use crate::error::StreamError;
use crate::read_set::{ReadRequest, ReadSet};
use crate::store::BackingStore;

/// Request/response channel to a remote host.
pub trait Transport: Send + Sync {
    /// Send an encoded read-set, return the concatenated read payload.
    fn call(&self, request: &[u8]) -> Result<Vec<u8>, StreamError>;
}

/// A read-only backing store served by a remote host.
pub struct RemoteStore<T> {
    id: StoreId,
    host: String,
    remote_object: RemoteObjectId,
    len: u64,
    transport: T,
}

impl<T: Transport> RemoteStore<T> {
    pub fn new(
        id: StoreId,
        host: impl Into<String>,
        remote_object: RemoteObjectId,
        len: u64,
        transport: T,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            remote_object,
            len,
            transport,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> BackingStore for RemoteStore<T> {
    fn id(&self) -> StoreId {
        self.id
    }

    fn host_name(&self) -> &str {
        &self.host
    }

    fn remote_object(&self) -> Option<RemoteObjectId> {
        Some(self.remote_object)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut read_set = ReadSet::for_remote(self.id, self.remote_object);
        read_set.push(ReadRequest {
            voxel: VoxelId::default(),
            channel: ChannelKind::Position,
            offset,
            len: buf.len() as u64,
        })?;
        let data = self.execute(&read_set)?;
        if data.len() != buf.len() {
            return Err(StreamError::Verification {
                expected: buf.len() as u64,
                actual: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<(), StreamError> {
        Err(StreamError::Transport(format!(
            "remote store {:?} on {} is read-only",
            self.id, self.host
        )))
    }

    fn execute(&self, read_set: &ReadSet) -> Result<Vec<u8>, StreamError> {
        let request = if read_set.remote_object() == Some(self.remote_object) {
            read_set.to_bytes()?
        } else {
            let mut tagged = ReadSet::for_remote(self.id, self.remote_object);
            tagged.extend(read_set.reads().iter().copied())?;
            tagged.to_bytes()?
        };
        tracing::trace!(host = %self.host, bytes = request.len(), "remote read request");
        self.transport.call(&request)
    }
}

/// Server side of a remote read: decode `request` and execute it against `store`.
pub fn serve_read_request(store: &dyn BackingStore, request: &[u8]) -> Result<Vec<u8>, StreamError> {
    let read_set = ReadSet::from_bytes(request)?;
    store.execute(&read_set)
}
