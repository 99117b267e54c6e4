//! Backing stores: random-access byte-range providers the engine reads
//! voxel channel data from.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use pointstream_common::{RemoteObjectId, StoreId};

use crate::error::StreamError;
use crate::read_set::ReadSet;

/// Host name used by stores that live on the local machine.
pub const LOCAL_HOST: &str = "local";

/// An opaque random-access byte-range provider.
pub trait BackingStore: Send + Sync {
    fn id(&self) -> StoreId;

    /// Name of the endpoint serving this store.
    fn host_name(&self) -> &str {
        LOCAL_HOST
    }

    /// Identifier of the remote object, for stores reached through a transport.
    fn remote_object(&self) -> Option<RemoteObjectId> {
        None
    }

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StreamError>;

    /// Perform every read of `read_set` and return the concatenated bytes in
    /// issue order.
    ///
    /// Every range is checked against [`len`](Self::len) before anything is
    /// allocated.
    fn execute(&self, read_set: &ReadSet) -> Result<Vec<u8>, StreamError> {
        let store_len = self.len();
        for read in read_set.reads() {
            check_range(read.offset, read.len, store_len)?;
        }
        let total = usize::try_from(read_set.total_read_size()).map_err(|_| StreamError::Allocation {
            requested: usize::MAX,
        })?;
        let mut out = Vec::new();
        out.try_reserve_exact(total)
            .map_err(|_| StreamError::Allocation { requested: total })?;
        for read in read_set.reads() {
            let start = out.len();
            // Bounded by `total`, which fits in usize.
            let end = start.saturating_add(usize::try_from(read.len).unwrap_or(usize::MAX));
            out.resize(end.min(total), 0);
            self.read_at(read.offset, &mut out[start..])?;
        }
        Ok(out)
    }
}

fn check_range(offset: u64, len: u64, store_len: u64) -> Result<(), StreamError> {
    match offset.checked_add(len) {
        Some(end) if end <= store_len => Ok(()),
        _ => Err(StreamError::OutOfRange {
            offset,
            len,
            store_len,
        }),
    }
}

/// A store backed by a file on local disk.
pub struct FileStore {
    id: StoreId,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileStore {
    /// Open an existing file for reading and writing.
    pub fn open(id: StoreId, path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
        })
    }

    /// Create (or truncate) a file holding `data`.
    pub fn create(id: StoreId, path: impl AsRef<Path>, data: &[u8]) -> Result<Self, StreamError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(data)?;
        file.flush()?;
        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn len(&self) -> u64 {
        self.file.lock().metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut file = self.file.lock();
        let store_len = file.metadata()?.len();
        check_range(offset, buf.len() as u64, store_len)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StreamError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }
}

/// An in-memory store. Useful for caches and tests.
pub struct MemoryStore {
    id: StoreId,
    host: String,
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(id: StoreId, data: Vec<u8>) -> Self {
        Self {
            id,
            host: LOCAL_HOST.to_string(),
            data: RwLock::new(data),
        }
    }

    /// Report a different host name, so the store is grouped under that host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

impl BackingStore for MemoryStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn host_name(&self) -> &str {
        &self.host
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError> {
        let data = self.data.read();
        check_range(offset, buf.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StreamError> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Lookup table from store identity to store.
#[derive(Default)]
pub struct StoreRegistry {
    stores: RwLock<HashMap<StoreId, Arc<dyn BackingStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store, replacing any previous store with the same id.
    pub fn insert(&self, store: Arc<dyn BackingStore>) {
        self.stores.write().insert(store.id(), store);
    }

    pub fn get(&self, id: StoreId) -> Option<Arc<dyn BackingStore>> {
        self.stores.read().get(&id).cloned()
    }

    pub fn remove(&self, id: StoreId) -> Option<Arc<dyn BackingStore>> {
        self.stores.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }
}
