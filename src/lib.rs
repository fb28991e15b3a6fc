//! Event Source
//!
//! An embeddable event-sourcing framework: aggregates change state only by
//! applying events, events are appended to a per-aggregate log and fanned
//! out on an in-process bus, and state is rebuilt from a snapshot plus the
//! events appended after it.
//!
//! # Features
//!
//! - **Covariant dispatch**: a handler for an event type also fires for
//!   events extending it
//! - **Completion**: a completion event closes an aggregate for good
//! - **Buffered appends**: one writer thread per repository, 1 MiB buffer
//!   per entity, debounced idle flush
//! - **Snapshots**: atomic replace, replay only what came after
//! - **Event bus**: bounded ring buffer with backpressure, one worker per
//!   subscriber
//!
//! # Modules
//!
//! - `types`: events, the completion marker and the message envelope
//! - `registry`: handler tables and dispatch
//! - `aggregate`: aggregate roots and sub-aggregates
//! - `event_store`: the file-backed repository
//! - `bus`: the publish/subscribe event bus
//! - `utils`: atomic file writes
//!
//! # Example
//!
//! ```no_run
//! use event_source::{
//!     Aggregate, DomainEvent, Event, EventBus, HandlerTable, Handles, Repository,
//!     RepositoryConfig,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Deposited {
//!     amount: u64,
//! }
//! impl Event for Deposited {}
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum AccountEvent {
//!     Deposited(Deposited),
//! }
//! impl DomainEvent for AccountEvent {
//!     fn as_event(&self) -> &dyn Event {
//!         match self {
//!             AccountEvent::Deposited(e) => e,
//!         }
//!     }
//! }
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Account {
//!     balance: u64,
//! }
//! impl Handles for Account {
//!     fn register_handlers(table: &mut HandlerTable<Self>) {
//!         table.on(|account: &mut Account, e: &Deposited| account.balance += e.amount);
//!     }
//! }
//! impl Aggregate for Account {
//!     type Event = AccountEvent;
//!     type Sub = ();
//! }
//!
//! fn main() -> event_source::Result<()> {
//!     let bus = EventBus::default();
//!     let repo = Repository::open(RepositoryConfig::new("data", "accounts"), |_| Account::default())?
//!         .with_bus(&bus);
//!
//!     let account = repo.new_instance("acc-1")?;
//!     account.lock().apply(AccountEvent::Deposited(Deposited { amount: 10 }))?;
//!
//!     repo.close()?;
//!     bus.close()
//! }
//! ```

pub mod aggregate;
pub mod bus;
pub mod error;
pub mod event_store;
pub mod registry;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use aggregate::{
    Aggregate, AggregateRoot, EventSink, SubAggregate, SubAggregates, SubEntity, SubHandle,
};
pub use bus::{EventBus, EventBusConfig, Subscriber, SubscriptionId, WeakEventBus};
pub use error::{Error, Result};
pub use event_store::{Repository, RepositoryConfig, SharedAggregate, SnapshotInfo, WriteFailure};
pub use registry::{DispatchError, DispatchOutcome, HandlerRegistry, HandlerTable, Handles};
pub use types::{
    is_completion, lineage, Completed, DomainEvent, Event, EventMessage, EventMeta, Message,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
