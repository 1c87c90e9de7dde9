use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::model::Snapshot;

/// Bucket the given timestamp to the chunk covering it.
pub fn chunk_id(ts: i64, chunk_length: i64) -> i64 {
    (ts / chunk_length) * chunk_length
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("cannot add a snapshot to a completed chunk")]
    Completed,
}

/// An ordered batch of snapshots sharing one time bucket.
///
/// Snapshots are kept sorted by timestamp no matter the order they are
/// added in. Once a chunk is flagged completed it is read-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    id: i64,
    #[serde(rename = "snapshots")]
    sorted_snapshots: Vec<Snapshot>,
    completed: bool,
}

impl Chunk {
    pub fn new(id: i64) -> Self {
        Self { id, sorted_snapshots: Vec::new(), completed: false }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Append a snapshot, restoring sort order with a single
    /// right-to-left pass. Snapshots arrive in scrape-tick order, so
    /// the pass usually terminates immediately.
    pub fn add(&mut self, snapshot: Snapshot) -> Result<(), ChunkError> {
        if self.completed {
            return Err(ChunkError::Completed);
        }
        self.sorted_snapshots.push(snapshot);
        let mut i = self.sorted_snapshots.len() - 1;
        while i > 0 && self.sorted_snapshots[i].timestamp < self.sorted_snapshots[i - 1].timestamp {
            self.sorted_snapshots.swap(i, i - 1);
            i -= 1;
        }
        Ok(())
    }

    /// The newest snapshot strictly older than `ts`. When every
    /// snapshot is at or past `ts` the earliest one is returned
    /// instead; an empty chunk has no answer.
    pub fn find_best_snapshot(&self, ts: i64) -> Option<&Snapshot> {
        for snapshot in self.sorted_snapshots.iter().rev() {
            if snapshot.timestamp < ts {
                return Some(snapshot);
            }
        }
        self.sorted_snapshots.first()
    }

    pub fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn len(&self) -> usize {
        self.sorted_snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.sorted_snapshots
    }

    pub fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).map_err(Error::from)
    }
}
