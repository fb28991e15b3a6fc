//! Repository configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-entity write buffer (1 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default idle time after the last append before buffered records are written
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(100);

/// Configuration for a [`Repository`](super::Repository)
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Root data directory shared by all repositories
    pub data_dir: PathBuf,
    /// Namespace; files live under `data_dir/name`
    pub name: String,
    /// Bytes buffered per entity before a write is forced
    pub buffer_size: usize,
    /// Debounce window for the idle flush
    pub idle_flush: Duration,
    /// Whether explicit flushes (snapshot, load, close) fsync the event file
    pub sync_on_flush: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            name: "default".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_flush: DEFAULT_IDLE_FLUSH,
            sync_on_flush: true,
        }
    }
}

impl RepositoryConfig {
    /// Create config for repository `name` under `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P, name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_idle_flush(mut self, idle_flush: Duration) -> Self {
        self.idle_flush = idle_flush;
        self
    }

    pub fn with_sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    /// Directory holding this repository's files
    pub fn repository_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }

    /// Get path to `{id}.snapshot`
    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.repository_dir().join(format!("{id}.snapshot"))
    }

    /// Get path to `{id}.evt`
    pub fn events_path(&self, id: &str) -> PathBuf {
        self.repository_dir().join(format!("{id}.evt"))
    }
}
