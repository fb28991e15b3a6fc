//! Background event writer
//!
//! All appends for one repository go through a single writer thread that
//! runs a current-thread Tokio runtime. Records are buffered per entity and
//! written when the buffer would overflow, when an explicit flush is
//! requested, or once the entity has been idle for `idle_flush`.
//!
//! ```text
//! add_event ──► mpsc ──► select! { command | earliest idle deadline }
//!                             │
//!                             └─► per-entity buffer ──► {id}.evt
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

use crate::error::{Error, Result};

use super::config::RepositoryConfig;

/// Buffered write failures kept for late `write_failures()` subscribers
const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// A background write that failed; the entity refuses further appends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub repository: String,
    pub aggregate_id: String,
    pub reason: String,
}

/// Reply slot for a request. A std channel so callers can wait on any
/// thread, including Tokio workers where `oneshot::blocking_recv` panics.
type Ack<T> = std_mpsc::SyncSender<io::Result<T>>;

enum Command {
    Append {
        id: String,
        record: Vec<u8>,
    },
    /// Write the entity's buffer and report the event file length
    Flush {
        id: String,
        ack: Ack<u64>,
    },
    FlushAll {
        ack: Ack<()>,
    },
    Shutdown {
        ack: Ack<()>,
    },
}

type FailedSet = Arc<Mutex<HashMap<String, String>>>;

/// Handle to the writer thread, owned by the repository
pub(crate) struct WriterHandle {
    tx: mpsc::UnboundedSender<Command>,
    failed: FailedSet,
    failures: broadcast::Sender<WriteFailure>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriterHandle {
    pub(crate) fn spawn(config: &RepositoryConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let failed = FailedSet::default();

        let writer = Writer {
            repository: config.name.clone(),
            config: config.clone(),
            logs: HashMap::new(),
            failed: failed.clone(),
            failures: failures.clone(),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let thread = thread::Builder::new()
            .name(format!("es-writer-{}", config.name))
            .spawn(move || runtime.block_on(writer.run(rx)))?;

        Ok(Self {
            tx,
            failed,
            failures,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a framed record; returns without waiting for the write
    pub(crate) fn append(&self, id: &str, record: Vec<u8>) -> Result<()> {
        self.check(id)?;
        self.tx
            .send(Command::Append {
                id: id.to_string(),
                record,
            })
            .map_err(|_| Error::Closed)
    }

    /// Write out `id`'s buffer and return the event file length
    pub(crate) fn flush(&self, id: &str) -> Result<u64> {
        self.check(id)?;
        let result = self.request(|ack| Command::Flush {
            id: id.to_string(),
            ack,
        })?;
        result.map_err(|e| self.escalate(id, e))
    }

    pub(crate) fn flush_all(&self) -> Result<()> {
        Ok(self.request(|ack| Command::FlushAll { ack })??)
    }

    /// Flush everything and stop the writer thread
    pub(crate) fn shutdown(&self) -> Result<()> {
        let result = self.request(|ack| Command::Shutdown { ack });
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("event writer thread panicked");
            }
        }
        Ok(result??)
    }

    /// Reason `id` stopped accepting appends, if it did
    pub(crate) fn failure(&self, id: &str) -> Option<String> {
        self.failed.lock().get(id).cloned()
    }

    pub(crate) fn subscribe_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.failures.subscribe()
    }

    fn check(&self, id: &str) -> Result<()> {
        match self.failure(id) {
            Some(reason) => Err(Error::WriterFailed {
                id: id.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn escalate(&self, id: &str, error: io::Error) -> Error {
        match self.failure(id) {
            Some(reason) => Error::WriterFailed {
                id: id.to_string(),
                reason,
            },
            None => Error::Storage(error),
        }
    }

    fn request<T>(
        &self,
        command: impl FnOnce(Ack<T>) -> Command,
    ) -> Result<io::Result<T>> {
        let (ack, rx) = std_mpsc::sync_channel(1);
        self.tx.send(command(ack)).map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }
}

struct EntityLog {
    file: File,
    buffer: Vec<u8>,
    deadline: Option<Instant>,
}

struct Writer {
    repository: String,
    config: RepositoryConfig,
    logs: HashMap<String, EntityLog>,
    failed: FailedSet,
    failures: broadcast::Sender<WriteFailure>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(repository = %self.repository, "event writer started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        let _ = ack.send(self.flush_all());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        // Repository dropped without close: flush what we have
                        if let Err(e) = self.flush_all() {
                            tracing::error!(
                                repository = %self.repository,
                                error = %e,
                                "final flush failed"
                            );
                        }
                        break;
                    }
                },

                _ = idle(deadline) => self.flush_idle(),
            }
        }

        tracing::debug!(repository = %self.repository, "event writer stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Append { id, record } => self.append(id, record),
            Command::Flush { id, ack } => {
                let _ = ack.send(self.flush(&id));
            }
            Command::FlushAll { ack } => {
                let _ = ack.send(self.flush_all());
            }
            Command::Shutdown { ack } => {
                let _ = ack.send(self.flush_all());
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.logs.values().filter_map(|log| log.deadline).min()
    }

    fn append(&mut self, id: String, record: Vec<u8>) {
        if self.failed.lock().contains_key(&id) {
            return;
        }
        let buffer_size = self.config.buffer_size;
        let deadline = Instant::now() + self.config.idle_flush;

        let result = self.log_for(&id).and_then(|log| {
            if log.buffer.len() + record.len() > buffer_size {
                write_buffer(log)?;
            }
            if record.len() > buffer_size {
                log.file.write_all(&record)?;
            } else {
                log.buffer.extend_from_slice(&record);
            }
            log.deadline = Some(deadline);
            Ok(())
        });

        if let Err(e) = result {
            self.fail(&id, e);
        }
    }

    fn flush(&mut self, id: &str) -> io::Result<u64> {
        if let Some(reason) = self.failed.lock().get(id) {
            return Err(io::Error::other(reason.clone()));
        }

        let sync = self.config.sync_on_flush;
        if let Some(log) = self.logs.get_mut(id) {
            let result = write_buffer(log).and_then(|()| {
                if sync {
                    log.file.sync_data()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                let reason = e.to_string();
                self.fail(id, e);
                return Err(io::Error::other(reason));
            }
        }

        match fs::metadata(self.config.events_path(id)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Flush every entity; the first error is returned after all were tried
    fn flush_all(&mut self) -> io::Result<()> {
        let ids: Vec<String> = self.logs.keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.flush(&id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Write buffers whose idle deadline has passed
    fn flush_idle(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .logs
            .iter()
            .filter(|(_, log)| log.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let result = match self.logs.get_mut(&id) {
                Some(log) => write_buffer(log),
                None => Ok(()),
            };
            if let Err(e) = result {
                self.fail(&id, e);
            }
        }
    }

    fn log_for(&mut self, id: &str) -> io::Result<&mut EntityLog> {
        if !self.logs.contains_key(id) {
            let path: PathBuf = self.config.events_path(id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.logs.insert(
                id.to_string(),
                EntityLog {
                    file,
                    buffer: Vec::with_capacity(self.config.buffer_size.min(64 * 1024)),
                    deadline: None,
                },
            );
        }
        self.logs
            .get_mut(id)
            .ok_or_else(|| io::Error::other("event log missing after open"))
    }

    /// Mark `id` failed, drop its buffered records and report the failure
    fn fail(&mut self, id: &str, error: io::Error) {
        let reason = error.to_string();
        tracing::error!(
            repository = %self.repository,
            aggregate_id = %id,
            error = %reason,
            "event write failed, aggregate stops accepting events"
        );

        self.logs.remove(id);
        self.failed.lock().insert(id.to_string(), reason.clone());
        let _ = self.failures.send(WriteFailure {
            repository: self.repository.clone(),
            aggregate_id: id.to_string(),
            reason,
        });
    }
}

fn write_buffer(log: &mut EntityLog) -> io::Result<()> {
    log.deadline = None;
    if log.buffer.is_empty() {
        return Ok(());
    }
    log.file.write_all(&log.buffer)?;
    log.buffer.clear();
    Ok(())
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
