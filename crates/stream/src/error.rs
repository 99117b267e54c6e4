use pointstream_common::StoreId;

/// Errors raised by the streaming engine.
///
/// Every variant is scoped to a single read-set or voxel load; none of them
/// is fatal to the scheduler loop.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read of {len} bytes at offset {offset} exceeds store length {store_len}")]
    OutOfRange { offset: u64, len: u64, store_len: u64 },
    #[error("read-set verification failed: expected {expected} bytes, got {actual}")]
    Verification { expected: u64, actual: u64 },
    #[error("failed to allocate {requested} bytes for channel data")]
    Allocation { requested: usize },
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("read-set byte total overflows u64")]
    ReadSetOverflow,
    #[error("a read-set is already under construction")]
    ReadSetInProgress,
    #[error("unknown backing store: {0:?}")]
    UnknownStore(StoreId),
}

/// Errors from loading a [`StreamConfig`](crate::StreamConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stream config: {0}")]
    Invalid(String),
}
