//! Aggregate model
//!
//! An aggregate is a plain state struct implementing [`Aggregate`], wrapped in
//! an [`AggregateRoot`] that owns its identity and completion flag and
//! forwards applied events to the repository and the event bus.
//!
//! ```text
//! apply(event)
//!   ├─► own handlers ──► sub-aggregate handlers      (HandlerRegistry)
//!   ├─► completion marker? ──► completed = true
//!   ├─► EventSink::add_event                          (Repository)
//!   └─► WeakEventBus::publish_one                     (EventBus)
//! ```

mod root;
mod sub;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::registry::Handles;
use crate::types::{DomainEvent, EventMessage};

pub use root::AggregateRoot;
pub use sub::{SubAggregate, SubAggregates, SubEntity, SubHandle};

/// Application state of an event-sourced entity.
///
/// State changes only through handlers declared in
/// [`Handles::register_handlers`], which the root invokes from `apply`.
pub trait Aggregate: Handles + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Events this aggregate persists and replays
    type Event: DomainEvent;

    /// Child entity type; `()` when the aggregate has none
    type Sub: SubAggregate;

    /// Whether the aggregate has reached a terminal state on its own terms.
    ///
    /// A completion event closes the aggregate regardless of this predicate.
    fn is_complete(&self) -> bool {
        false
    }

    /// The sub-aggregates owned by this state, if it has any
    fn sub_aggregates(&self) -> Option<&SubAggregates<Self::Sub>> {
        None
    }

    fn sub_aggregates_mut(&mut self) -> Option<&mut SubAggregates<Self::Sub>> {
        None
    }
}

/// Durable append capability held by aggregates as a weak back-reference
pub trait EventSink<E>: Send + Sync {
    fn add_event(&self, aggregate_id: &str, event: &EventMessage<E>) -> Result<()>;
}
