use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::chunk::{chunk_id, Chunk};
use super::{Appender, Querier, StorageError};
use crate::metrics;
use crate::model::Snapshot;
use crate::tools;

/// Cadence of the background retention sweep.
const RETENTION_TICK: Duration = Duration::from_secs(60);

pub struct Options {
    /// How long chunk files are kept on disk.
    pub retention: Duration,
    /// Seconds covered by one chunk.
    pub chunk_length: i64,
    /// Seconds covered by one block directory. Must not be shorter
    /// than `chunk_length`.
    pub block_length: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(168 * 3600),
            chunk_length: 30,
            block_length: 120,
        }
    }
}

struct State {
    current: Chunk,
    latest: Option<Snapshot>,
}

/// Snapshot store backed by one in-memory chunk and a directory of
/// rolled chunk files.
///
/// The scrape loop is the only writer; HTTP handlers read concurrently.
/// Readers never see the current chunk itself, only a detached clone,
/// so the writer may keep appending while a reader walks the snapshot
/// list.
pub struct DiskStorage {
    dir: PathBuf,
    options: Options,
    state: RwLock<State>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiskStorage {
    /// Open the store below `dir`, creating the directory if missing.
    ///
    /// A chunk file covering the current bucket is picked up again, so
    /// a restart within one bucket loses nothing. A corrupt file is
    /// logged and replaced by a fresh chunk.
    pub fn open<P: Into<PathBuf>>(dir: P, options: Options) -> Result<Arc<Self>, Error> {
        if options.block_length < options.chunk_length {
            bail!(
                "block length ({}s) must not be shorter than chunk length ({}s)",
                options.block_length,
                options.chunk_length
            );
        }

        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| format_err!("unable to create storage directory {:?} - {}", dir, err))?;

        let id = chunk_id(tools::epoch_secs(), options.chunk_length);
        let path = chunk_path(&dir, options.block_length, id);
        let mut current = match load_chunk_file(&path) {
            Ok(chunk) => {
                log::info!("recovered chunk {} with {} snapshots", id, chunk.len());
                chunk
            }
            Err(err) => {
                log::info!("starting chunk {} fresh: {}", id, err);
                Chunk::new(id)
            }
        };
        current.set_completed(false);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(retention_loop(
            dir.clone(),
            options.retention,
            options.block_length,
            shutdown_rx,
        ));

        Ok(Arc::new(Self {
            dir,
            options,
            state: RwLock::new(State { current, latest: None }),
            closed: AtomicBool::new(false),
            shutdown,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn chunk_length(&self) -> i64 {
        self.options.chunk_length
    }

    /// Persist the current chunk and stop the retention worker. Any
    /// later call fails with `StorageError::Closed`, as does `add`.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Closed.into());
        }
        let _ = self.shutdown.send(true);

        let save_result = {
            let mut state = self.state.write().unwrap();
            state.current.set_completed(true);
            self.save_chunk(&state.current)
        };

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                log::error!("retention worker exited abnormally: {}", err);
            }
        }
        save_result
    }

    fn save_chunk(&self, chunk: &Chunk) -> Result<(), Error> {
        let path = chunk_path(&self.dir, self.options.block_length, chunk.id());
        let block_dir = path
            .parent()
            .ok_or_else(|| format_err!("chunk path {:?} has no parent", path))?;
        fs::create_dir_all(block_dir)
            .map_err(|err| format_err!("unable to create block directory {:?} - {}", block_dir, err))?;

        // write-then-rename keeps concurrent readers off half-written files
        let data = chunk.marshal()?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &data)
            .map_err(|err| format_err!("unable to write chunk file {:?} - {}", tmp_path, err))?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o644))
            .map_err(|err| format_err!("unable to chmod chunk file {:?} - {}", tmp_path, err))?;
        fs::rename(&tmp_path, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            format_err!("atomic rename to {:?} failed - {}", path, err)
        })?;

        log::debug!("saved chunk {} ({} snapshots)", chunk.id(), chunk.len());
        Ok(())
    }

    fn load_chunk(&self, id: i64) -> Result<Chunk, Error> {
        load_chunk_file(&chunk_path(&self.dir, self.options.block_length, id))
    }
}

impl Appender for DiskStorage {
    fn add(&self, snapshot: Snapshot) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed.into());
        }

        let mut state = self.state.write().unwrap();

        let id = chunk_id(snapshot.timestamp, self.options.chunk_length);
        match &state.latest {
            Some(latest) if snapshot.timestamp < latest.timestamp => {}
            _ => state.latest = Some(snapshot.clone()),
        }

        let current_id = state.current.id();
        if id == current_id {
            state.current.add(snapshot)?;
        } else if id > current_id {
            // Bucket rollover: seal and persist the chunk before the
            // fresh one becomes visible to readers.
            state.current.set_completed(true);
            self.save_chunk(&state.current)?;
            let mut fresh = Chunk::new(id);
            fresh.add(snapshot)?;
            state.current = fresh;
            log::info!("rolled over to chunk {}", id);
        } else {
            log::warn!(
                "dropping snapshot at {} behind current chunk {}",
                snapshot.timestamp,
                current_id
            );
            metrics::SNAPSHOTS_DISCARDED.inc();
            return Ok(());
        }

        metrics::SNAPSHOTS_APPENDED.inc();
        Ok(())
    }
}

impl Querier for DiskStorage {
    fn get_chunk(&self, id: i64) -> Result<Chunk, Error> {
        {
            let state = self.state.read().unwrap();
            if id == state.current.id() {
                return Ok(state.current.clone());
            }
        }
        self.load_chunk(id)
    }

    fn get_latest_snapshot(&self) -> Result<Snapshot, Error> {
        let state = self.state.read().unwrap();
        match &state.latest {
            Some(snapshot) => Ok(snapshot.clone()),
            None => Err(StorageError::NotFound.into()),
        }
    }
}

fn chunk_path(dir: &Path, block_length: i64, id: i64) -> PathBuf {
    let block = (id / block_length) * block_length;
    dir.join(block.to_string()).join(format!("{}.json", id))
}

fn load_chunk_file(path: &Path) -> Result<Chunk, Error> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::NotFound.into());
        }
        Err(err) => return Err(format_err!("unable to read chunk file {:?} - {}", path, err)),
    };
    Chunk::unmarshal(&data)
        .map_err(|err| format_err!("unable to decode chunk file {:?} - {}", path, err))
}

async fn retention_loop(
    dir: PathBuf,
    retention: Duration,
    block_length: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(RETENTION_TICK);
    // the first tick of a tokio interval fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                let cutoff = tools::epoch_secs() - retention.as_secs() as i64 - block_length;
                let timer = metrics::RETENTION_DURATION.start_timer();
                let result = sweep_expired_blocks(&dir, cutoff);
                timer.observe_duration();
                match result {
                    Ok(removed) => {
                        metrics::RETENTION_RUNS.with_label_values(&["success"]).inc();
                        if removed > 0 {
                            log::info!("removed {} expired blocks below {:?}", removed, dir);
                        }
                    }
                    Err(err) => {
                        metrics::RETENTION_RUNS.with_label_values(&["error"]).inc();
                        log::error!("retention sweep below {:?} failed: {}", dir, err);
                    }
                }
            }
        }
    }
}

/// Remove every block directory whose timestamp-name is at or before
/// `cutoff`. Entries that do not parse as an integer are left alone.
fn sweep_expired_blocks(dir: &Path, cutoff: i64) -> Result<usize, Error> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let block_ts: i64 = match name.to_string_lossy().parse() {
            Ok(ts) => ts,
            Err(_) => continue,
        };
        if block_ts <= cutoff {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ts: i64) -> Snapshot {
        Snapshot::new(ts, format!("{{\"serverUpdateTime\":{}}}", ts))
    }

    fn test_options() -> Options {
        Options { retention: Duration::from_secs(3600), chunk_length: 300, block_length: 600 }
    }

    #[tokio::test]
    async fn add_and_get_latest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        assert!(storage.get_latest_snapshot().is_err());

        let now = tools::epoch_secs();
        storage.add(snapshot(now)).unwrap();
        storage.add(snapshot(now + 1)).unwrap();
        assert_eq!(storage.get_latest_snapshot().unwrap().timestamp, now + 1);

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn latest_snapshot_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        let now = tools::epoch_secs();
        storage.add(snapshot(now)).unwrap();
        // behind the current bucket: discarded, latest unchanged
        storage.add(snapshot(now - 100_000)).unwrap();
        assert_eq!(storage.get_latest_snapshot().unwrap().timestamp, now);

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn rollover_persists_the_completed_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        let now = tools::epoch_secs();
        let first_id = chunk_id(now, 300);
        storage.add(snapshot(now)).unwrap();
        storage.add(snapshot(first_id + 300)).unwrap();

        let rolled = storage.get_chunk(first_id).unwrap();
        assert!(rolled.is_completed());
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled.snapshots()[0].timestamp, now);

        let block = (first_id / 600) * 600;
        let path = dir.path().join(block.to_string()).join(format!("{}.json", first_id));
        assert!(path.exists());

        let current = storage.get_chunk(first_id + 300).unwrap();
        assert!(!current.is_completed());
        assert_eq!(current.len(), 1);

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn current_chunk_is_returned_as_a_detached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        let now = tools::epoch_secs();
        storage.add(snapshot(now)).unwrap();
        let copy = storage.get_chunk(chunk_id(now, 300)).unwrap();
        storage.add(snapshot(now + 1)).unwrap();
        assert_eq!(copy.len(), 1);

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        let err = storage.get_chunk(0).unwrap_err();
        assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::NotFound)));

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        let now = tools::epoch_secs();
        storage.add(snapshot(now)).unwrap();
        storage.close().await.unwrap();

        let err = storage.close().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Closed)));
        let err = storage.add(snapshot(now + 1)).unwrap_err();
        assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Closed)));
    }

    #[tokio::test]
    async fn close_persists_the_current_chunk_completed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();

        let now = tools::epoch_secs();
        storage.add(snapshot(now)).unwrap();
        storage.close().await.unwrap();

        let id = chunk_id(now, 300);
        let chunk = load_chunk_file(&chunk_path(dir.path(), 600, id)).unwrap();
        assert!(chunk.is_completed());
        assert_eq!(chunk.len(), 1);
    }

    #[tokio::test]
    async fn reopen_recovers_the_current_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();
        let now = tools::epoch_secs();
        storage.add(snapshot(now)).unwrap();
        storage.close().await.unwrap();

        // same bucket: the persisted chunk is loaded and unsealed
        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();
        let chunk = storage.get_chunk(chunk_id(now, 300)).unwrap();
        assert_eq!(chunk.len(), 1);
        assert!(!chunk.is_completed());
        storage.add(snapshot(now + 1)).unwrap();

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_chunk_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let now = tools::epoch_secs();
        let id = chunk_id(now, 300);
        let path = chunk_path(dir.path(), 600, id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not json").unwrap();

        let storage = DiskStorage::open(dir.path(), test_options()).unwrap();
        let chunk = storage.get_chunk(id).unwrap();
        assert!(chunk.is_empty());

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_rejects_blocks_shorter_than_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let options =
            Options { retention: Duration::from_secs(3600), chunk_length: 300, block_length: 120 };
        assert!(DiskStorage::open(dir.path(), options).is_err());
    }

    #[test]
    fn sweep_removes_expired_blocks_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in &["0", "6000", "9900", "not-a-block"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("0").join("0.json"), b"{}").unwrap();

        // retention 1h, block 2m, now 10000: everything at or before
        // the cutoff goes, unparseable names are left alone
        let removed = sweep_expired_blocks(dir.path(), 10000 - 3600 - 120).unwrap();
        assert_eq!(removed, 2);
        assert!(!dir.path().join("0").exists());
        assert!(!dir.path().join("6000").exists());
        assert!(dir.path().join("9900").exists());
        assert!(dir.path().join("not-a-block").exists());
    }
}
