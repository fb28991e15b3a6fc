//! Event types for Event Sourcing
//!
//! Events are immutable records of state changes. A concrete event is a plain
//! struct implementing [`Event`]; an aggregate persists a serializable family
//! of them (usually an enum) implementing [`DomainEvent`], wrapped in an
//! [`EventMessage`] envelope that carries the timestamp and aggregate id.

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upcast to `Any` so handlers can recover the concrete event type
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A concrete event type.
///
/// An event can extend another event by embedding it and returning it from
/// [`parent`](Event::parent). The chain `self -> parent -> ...` is the type
/// hierarchy used for dispatch: a handler registered for any type in the
/// chain receives the event.
///
/// ```
/// use event_source::{Completed, Event};
///
/// #[derive(Debug)]
/// struct OrderClosed {
///     reason: String,
/// }
///
/// impl Event for OrderClosed {
///     fn parent(&self) -> Option<&dyn Event> {
///         Some(&Completed)
///     }
/// }
/// ```
pub trait Event: AsAny + Send + Sync + fmt::Debug + 'static {
    /// The event this one extends, if any
    fn parent(&self) -> Option<&dyn Event> {
        None
    }
}

/// Walk an event's type hierarchy, starting with the event itself
pub fn lineage<'a>(event: &'a dyn Event) -> impl Iterator<Item = &'a dyn Event> + 'a {
    std::iter::successors(Some(event), |e: &&'a dyn Event| (*e).parent())
}

/// Marker event: the aggregate has reached its terminal state.
///
/// Any event with `Completed` in its lineage closes the aggregate once it has
/// been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Completed;

impl Event for Completed {}

/// Check whether an event is (or extends) [`Completed`]
pub fn is_completion(event: &dyn Event) -> bool {
    lineage(event).any(|e| e.as_any().is::<Completed>())
}

/// The serializable event family an aggregate persists.
///
/// Typically an enum whose variants wrap [`Event`] structs; `as_event`
/// returns the wrapped struct so dispatch sees its concrete type.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    fn as_event(&self) -> &dyn Event;
}

/// Envelope metadata shared by every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate_id: Option<String>,
}

impl EventMeta {
    /// Metadata timestamped now, with no aggregate id yet
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            aggregate_id: None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Id of the aggregate the event was applied to, once stamped
    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_id.as_deref()
    }

    /// Set the aggregate id. Only the first stamp takes effect.
    pub(crate) fn stamp(&mut self, aggregate_id: &str) -> bool {
        if self.aggregate_id.is_some() {
            return false;
        }
        self.aggregate_id = Some(aggregate_id.to_string());
        true
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::now()
    }
}

/// An immutable event in the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage<P> {
    meta: EventMeta,
    payload: P,
}

impl<P> EventMessage<P> {
    /// Wrap a payload, timestamped now
    pub fn new(payload: P) -> Self {
        Self {
            meta: EventMeta::now(),
            payload,
        }
    }

    pub fn with_meta(meta: EventMeta, payload: P) -> Self {
        Self { meta, payload }
    }

    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.meta.timestamp
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.meta.aggregate_id()
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub(crate) fn stamp(&mut self, aggregate_id: &str) -> bool {
        self.meta.stamp(aggregate_id)
    }
}

impl<P> From<P> for EventMessage<P> {
    fn from(payload: P) -> Self {
        Self::new(payload)
    }
}

/// Type-erased event envelope, as carried by the event bus
pub trait Message: Send + Sync + fmt::Debug {
    fn meta(&self) -> &EventMeta;
    fn event(&self) -> &dyn Event;
}

impl<P: DomainEvent> Message for EventMessage<P> {
    fn meta(&self) -> &EventMeta {
        &self.meta
    }

    fn event(&self) -> &dyn Event {
        self.payload.as_event()
    }
}
