//! Storage engine for event-sourced aggregates
//!
//! - `Repository`: load, create, snapshot and close aggregates
//! - writer: single background thread buffering appends per entity
//! - snapshot / log: the two on-disk formats
//!
//! # Layout
//!
//! ```text
//! {data_dir}/{name}/{id}.snapshot   [u64 log_offset][aggregate json]
//! {data_dir}/{name}/{id}.evt        [u32 len][event json] [u32 len][event json] ...
//! ```
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//! ┌───────────┐    ┌────────────┐    ┌──────────────┐    ┌──────────┐
//! │ apply()   │───►│ add_event  │───►│ writer queue │───►│ {id}.evt │
//! │ aggregate │    │ frame+send │    │ 1 MiB buffer │    │ (append) │
//! └───────────┘    └────────────┘    └──────────────┘    └──────────┘
//!                                     idle 100 ms / full / flush
//!
//! Read Path (load):
//! ┌───────────────┐    ┌────────────┐    ┌─────────────────────┐
//! │ {id}.snapshot │───►│ flush {id} │───►│ replay from offset  │───► cached
//! └───────────────┘    └────────────┘    └─────────────────────┘
//! ```

mod config;
mod log;
mod snapshot;
mod store;
mod writer;

pub use config::{RepositoryConfig, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_FLUSH};
pub use snapshot::SnapshotInfo;
pub use store::{Repository, SharedAggregate};
pub use writer::WriteFailure;
