//! Batched multi-read: several byte-range reads bound to one backing store,
//! executed as a single I/O operation.
//!
//! The same structure describes a local multi-read and a remote read
//! request; a remote read-set also carries the remote object identifier
//! and travels over the transport as CBOR.

use pointstream_common::{ChannelKind, RemoteObjectId, StoreId, VoxelId};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// One byte-range read, destined for a voxel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub voxel: VoxelId,
    pub channel: ChannelKind,
    pub offset: u64,
    pub len: u64,
}

/// An ordered list of reads bound to one backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadSet {
    store: StoreId,
    remote_object: Option<RemoteObjectId>,
    reads: Vec<ReadRequest>,
    total: u64,
}

impl ReadSet {
    pub fn new(store: StoreId) -> Self {
        Self {
            store,
            remote_object: None,
            reads: Vec::new(),
            total: 0,
        }
    }

    pub fn for_remote(store: StoreId, remote_object: RemoteObjectId) -> Self {
        Self {
            remote_object: Some(remote_object),
            ..Self::new(store)
        }
    }

    pub fn push(&mut self, read: ReadRequest) -> Result<(), StreamError> {
        self.total = self
            .total
            .checked_add(read.len)
            .ok_or(StreamError::ReadSetOverflow)?;
        self.reads.push(read);
        Ok(())
    }

    /// Append `reads` in order. Either all of them are added or none.
    pub fn extend(&mut self, reads: impl IntoIterator<Item = ReadRequest>) -> Result<(), StreamError> {
        let reads: Vec<ReadRequest> = reads.into_iter().collect();
        self.total = total_len(self.total, &reads).ok_or(StreamError::ReadSetOverflow)?;
        self.reads.extend(reads);
        Ok(())
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn remote_object(&self) -> Option<RemoteObjectId> {
        self.remote_object
    }

    pub fn reads(&self) -> &[ReadRequest] {
        &self.reads
    }

    pub fn total_read_size(&self) -> u64 {
        self.total
    }

    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Release every descriptor and the memory backing them.
    pub fn delete_all(&mut self) {
        self.reads = Vec::new();
        self.total = 0;
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StreamError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| StreamError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StreamError> {
        let mut read_set: ReadSet =
            ciborium::from_reader(data).map_err(|e| StreamError::CborDecode(e.to_string()))?;
        // The total is derived data; never trust the wire copy.
        read_set.total = total_len(0, &read_set.reads)
            .ok_or_else(|| StreamError::CborDecode("read lengths overflow u64".into()))?;
        Ok(read_set)
    }
}

fn total_len(start: u64, reads: &[ReadRequest]) -> Option<u64> {
    reads.iter().try_fold(start, |acc, r| acc.checked_add(r.len))
}

/// A read-set together with the bytes its execution returned.
///
/// Immutable once built: new demand goes into a fresh [`ReadSet`].
#[derive(Debug)]
pub struct ExecutedReadSet {
    read_set: ReadSet,
    data: Vec<u8>,
}

impl ExecutedReadSet {
    pub fn new(read_set: ReadSet, data: Vec<u8>) -> Self {
        Self { read_set, data }
    }

    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.data.len() as u64
    }

    /// Reject results whose size does not match the requested byte count.
    pub fn verify(&self) -> Result<(), StreamError> {
        let expected = self.read_set.total_read_size();
        let actual = self.bytes_transferred();
        if expected != actual {
            return Err(StreamError::Verification { expected, actual });
        }
        Ok(())
    }

    /// Each read paired with its slice of the returned data, in issue order.
    ///
    /// Call [`verify`](Self::verify) first; a short buffer yields truncated
    /// slices for the trailing reads.
    pub fn chunks(&self) -> impl Iterator<Item = (&ReadRequest, &[u8])> {
        let mut cursor = 0usize;
        self.read_set.reads.iter().map(move |read| {
            let len = usize::try_from(read.len).unwrap_or(usize::MAX);
            let start = cursor.min(self.data.len());
            let end = cursor.saturating_add(len).min(self.data.len());
            cursor = cursor.saturating_add(len);
            (read, &self.data[start..end])
        })
    }
}
