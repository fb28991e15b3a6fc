//! Repository - per-entity snapshot + event log storage
//!
//! Each aggregate id owns two files under `data_dir/name`: an atomically
//! replaced `{id}.snapshot` and an append-only `{id}.evt`. Live instances
//! are cached, one per id, and shared as [`SharedAggregate`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tokio::sync::broadcast;

use crate::aggregate::{Aggregate, AggregateRoot, EventSink};
use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::types::EventMessage;
use crate::utils::cleanup_temp_files;

use super::config::RepositoryConfig;
use super::log::{encode_record, Frame, RecordReader};
use super::snapshot::{read_snapshot, write_snapshot, SnapshotInfo};
use super::writer::{WriteFailure, WriterHandle};

/// A live aggregate instance shared by everyone who loaded it
pub type SharedAggregate<A> = Arc<Mutex<AggregateRoot<A>>>;

type Factory<A> = Box<dyn Fn(&str) -> A + Send + Sync>;

/// Storage for aggregates of type `A`.
///
/// Calls block the current thread. They work from any thread, but in async
/// code prefer `tokio::task::spawn_blocking` so a runtime worker is not
/// held while the writer answers. Buffered events reach disk on idle flush,
/// snapshot or [`close`](Self::close); call `close` before exiting.
pub struct Repository<A: Aggregate> {
    inner: Arc<Inner<A>>,
}

impl<A: Aggregate> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<A: Aggregate> {
    config: RepositoryConfig,
    factory: Factory<A>,
    bus: RwLock<Option<EventBus>>,
    cache: Mutex<HashMap<String, SharedAggregate<A>>>,
    /// Serializes load/new_instance per id
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    writer: WriterHandle,
    closed: AtomicBool,
}

impl<A: Aggregate> Repository<A> {
    /// Open (creating if needed) the repository directory and start its writer.
    ///
    /// `factory` builds the initial state for [`new_instance`](Self::new_instance).
    pub fn open<F>(config: RepositoryConfig, factory: F) -> Result<Self>
    where
        F: Fn(&str) -> A + Send + Sync + 'static,
    {
        let dir = config.repository_dir();
        fs::create_dir_all(&dir)?;

        let cleaned = cleanup_temp_files(&dir)?;
        if cleaned > 0 {
            tracing::warn!(
                repository = %config.name,
                cleaned,
                "removed leftover temp files from an interrupted snapshot"
            );
        }

        let writer = WriterHandle::spawn(&config)?;
        tracing::info!(repository = %config.name, dir = %dir.display(), "repository opened");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                factory: Box::new(factory),
                bus: RwLock::new(None),
                cache: Mutex::new(HashMap::new()),
                id_locks: Mutex::new(HashMap::new()),
                writer,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Publish applied events of loaded and new aggregates on `bus`.
    ///
    /// Instances already cached keep the bus they were bound with.
    pub fn with_bus(self, bus: &EventBus) -> Self {
        *self.inner.bus.write() = Some(bus.clone());
        self
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Background write failures, as they happen
    pub fn write_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.inner.writer.subscribe_failures()
    }

    /// Load an aggregate: its snapshot plus every event appended after it.
    ///
    /// Returns the cached instance if one is live, `None` if the id was
    /// never created.
    pub fn load(&self, id: &str) -> Result<Option<SharedAggregate<A>>> {
        self.ensure_open()?;
        validate_id(id)?;

        if let Some(shared) = self.inner.cached(id) {
            return Ok(Some(shared));
        }

        self.inner.with_id_lock(id, || self.load_locked(id))
    }

    fn load_locked(&self, id: &str) -> Result<Option<SharedAggregate<A>>> {
        if let Some(shared) = self.inner.cached(id) {
            return Ok(Some(shared));
        }

        let path = self.inner.config.snapshot_path(id);
        let Some((log_offset, mut root)) = read_snapshot::<A>(&path, id)? else {
            return Ok(None);
        };
        root.init();

        let log_len = self.inner.writer.flush(id)?;
        if log_offset > log_len {
            return Err(Error::corrupted(
                id,
                format!(
                    "snapshot offset {log_offset} is past the end of the event log \
                     ({log_len} bytes)"
                ),
            ));
        }

        let replayed = self.inner.replay(&mut root, log_offset)?;
        tracing::debug!(
            repository = %self.inner.config.name,
            aggregate_id = %id,
            log_offset,
            replayed,
            "aggregate loaded"
        );

        Ok(Some(self.inner.attach_and_cache(root)))
    }

    /// Create a new aggregate with an empty event log.
    ///
    /// Fails with [`Error::AlreadyExists`] if the id is live or either of its
    /// files already has content.
    pub fn new_instance(&self, id: &str) -> Result<SharedAggregate<A>> {
        self.ensure_open()?;
        validate_id(id)?;

        self.inner.with_id_lock(id, || self.create_locked(id))
    }

    fn create_locked(&self, id: &str) -> Result<SharedAggregate<A>> {
        let config = &self.inner.config;
        let snapshot_path = config.snapshot_path(id);
        let events_path = config.events_path(id);
        if self.inner.cached(id).is_some()
            || has_content(&snapshot_path)?
            || has_content(&events_path)?
        {
            return Err(Error::AlreadyExists(id.to_string()));
        }

        let mut root = AggregateRoot::new(id, (self.inner.factory)(id));
        root.init();

        File::create(&events_path)?;
        write_snapshot(&snapshot_path, &root, 0)?;
        tracing::debug!(repository = %config.name, aggregate_id = %id, "aggregate created");

        Ok(self.inner.attach_and_cache(root))
    }

    /// Rewrite the snapshot of `id` at the current end of its event log.
    ///
    /// Does nothing and returns `None` for ids that have no snapshot.
    pub fn snapshot(&self, id: &str) -> Result<Option<SnapshotInfo>> {
        self.ensure_open()?;
        validate_id(id)?;

        if !self.inner.config.snapshot_path(id).exists() {
            return Ok(None);
        }
        let Some(shared) = self.load(id)? else {
            return Ok(None);
        };
        self.inner.snapshot_shared(&shared).map(Some)
    }

    /// Queue `event` for appending to `id`'s event log
    pub fn add_event(&self, id: &str, event: &EventMessage<A::Event>) -> Result<()> {
        self.ensure_open()?;
        validate_id(id)?;
        self.inner.add_event(id, event)
    }

    /// Ids with a snapshot in this repository, sorted
    pub fn list_ids(&self) -> Result<Vec<String>> {
        self.ensure_open()?;

        let dir = self.inner.config.repository_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "snapshot") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Flush all buffered events, snapshot every live aggregate and stop the
    /// writer.
    ///
    /// Later calls return `Ok(())`; every other operation returns
    /// [`Error::Closed`]. A bus passed to [`with_bus`](Self::with_bus) is
    /// left open.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = self.inner.writer.flush_all();

        let live: Vec<SharedAggregate<A>> = self.inner.cache.lock().values().cloned().collect();
        let snapshots: Vec<Result<SnapshotInfo>> = live
            .par_iter()
            .map(|shared| self.inner.snapshot_shared(shared))
            .collect();

        let stopped = self.inner.writer.shutdown();

        tracing::info!(
            repository = %self.inner.config.name,
            snapshots = snapshots.len(),
            "repository closed"
        );

        flushed?;
        for result in snapshots {
            result?;
        }
        stopped
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

impl<A: Aggregate> Inner<A> {
    fn cached(&self, id: &str) -> Option<SharedAggregate<A>> {
        self.cache.lock().get(id).cloned()
    }

    /// Run `f` holding `id`'s creation lock. The lock entry is dropped
    /// again once no other caller is waiting on it.
    fn with_id_lock<R>(&self, id: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let lock = self.id_locks.lock().entry(id.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.id_locks.lock();
        // One count for the map, one for us
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
        result
    }

    /// Bind the repository and bus, then publish the instance in the cache
    fn attach_and_cache(self: &Arc<Self>, mut root: AggregateRoot<A>) -> SharedAggregate<A> {
        let weak: Weak<Inner<A>> = Arc::downgrade(self);
        let sink: Weak<dyn EventSink<A::Event>> = weak;
        let bus = self.bus.read().as_ref().map(EventBus::downgrade);
        root.attach(Some(sink), bus);

        let id = root.id().to_string();
        let shared = Arc::new(Mutex::new(root));
        self.cache.lock().insert(id, shared.clone());
        shared
    }

    /// Apply every whole record from `offset` to the end of the event log.
    ///
    /// A torn trailing record is cut off so later appends stay framed.
    fn replay(&self, root: &mut AggregateRoot<A>, offset: u64) -> Result<usize> {
        let id = root.id().to_string();
        let path = self.config.events_path(&id);

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let end = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = RecordReader::new(BufReader::new(file), offset, end);

        let mut replayed = 0;
        while !root.is_completed() {
            let at = reader.offset();
            match reader.next_frame()? {
                Frame::Record(body) => {
                    let event: EventMessage<A::Event> = serde_json::from_slice(&body)
                        .map_err(|e| Error::corrupted(&id, format!("event at offset {at}: {e}")))?;
                    root.apply(event)?;
                    replayed += 1;
                }
                Frame::End => break,
                Frame::Corrupt { at, reason } => {
                    let reason = format!("event log at offset {at}: {reason}");
                    return Err(Error::corrupted(&id, reason));
                }
                Frame::Torn { valid_len } => {
                    tracing::warn!(
                        repository = %self.config.name,
                        aggregate_id = %id,
                        valid_len,
                        "torn record at end of event log, truncating"
                    );
                    OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
                    break;
                }
            }
        }
        Ok(replayed)
    }

    /// Flush `shared`'s events and snapshot it at the resulting log length
    fn snapshot_shared(&self, shared: &SharedAggregate<A>) -> Result<SnapshotInfo> {
        let root = shared.lock();
        let id = root.id().to_string();

        let log_offset = self.writer.flush(&id)?;
        write_snapshot(&self.config.snapshot_path(&id), &root, log_offset)?;

        tracing::info!(
            repository = %self.config.name,
            aggregate_id = %id,
            log_offset,
            "snapshot created"
        );
        Ok(SnapshotInfo { id, log_offset })
    }
}

impl<A: Aggregate> EventSink<A::Event> for Inner<A> {
    fn add_event(&self, aggregate_id: &str, event: &EventMessage<A::Event>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let record = encode_record(event)?;
        self.writer.append(aggregate_id, record)
    }
}

/// Ids become file names, so they must stay inside the repository directory
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::Storage(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid aggregate id {id:?}"),
        )))
    }
}

fn has_content(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
