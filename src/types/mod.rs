//! Event data types
//!
//! Events, the completion marker and the [`EventMessage`] envelope that is
//! persisted and published.

mod event;

pub use event::{
    is_completion, lineage, AsAny, Completed, DomainEvent, Event, EventMessage, EventMeta, Message,
};
