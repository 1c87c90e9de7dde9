//! Chunked snapshot storage.
//!
//! One writer (the scrape loop) appends snapshots; many readers (the
//! HTTP handlers) fetch the latest snapshot or whole chunks. The chunk
//! currently being filled lives in memory and is persisted on bucket
//! rollover; completed chunks are plain JSON files on disk.

use anyhow::Error;

use crate::model::Snapshot;

mod chunk;
mod disk;

pub use chunk::*;
pub use disk::*;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("storage is closed")]
    Closed,
}

/// Write half of the storage, used by the scrape loop.
pub trait Appender: Send + Sync {
    fn add(&self, snapshot: Snapshot) -> Result<(), Error>;
}

/// Read half of the storage, used by the HTTP handlers.
pub trait Querier: Send + Sync {
    fn get_chunk(&self, id: i64) -> Result<Chunk, Error>;
    fn get_latest_snapshot(&self) -> Result<Snapshot, Error>;
}
