use pointstream_common::ClientId;
use pointstream_stream::StreamError;

/// Errors raised by point queries.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("cursor of client {client:?} cannot move back from {current} to {requested}")]
    CursorRegressed {
        client: ClientId,
        current: u64,
        requested: u64,
    },
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}
