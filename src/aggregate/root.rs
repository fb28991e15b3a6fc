//! Aggregate root: identity, completion and the apply path

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::bus::WeakEventBus;
use crate::error::{Error, Result};
use crate::registry::{DispatchOutcome, HandlerRegistry};
use crate::types::{is_completion, DomainEvent, EventMessage};

use super::{Aggregate, EventSink, SubEntity, SubHandle};

/// An aggregate instance: id, completion flag, state and its attachments.
///
/// Only `id`, `completed` and `state` are serialized into snapshots. The
/// repository and bus references are non-owning and re-bound on load.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    completed: bool,
    state: A,
    #[serde(skip)]
    repository: Option<Weak<dyn EventSink<A::Event>>>,
    #[serde(skip)]
    bus: Option<WeakEventBus>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Create a detached aggregate
    pub fn new(id: impl Into<String>, state: A) -> Self {
        Self {
            id: id.into(),
            completed: false,
            state,
            repository: None,
            bus: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Logically closed: no further events are applied or persisted
    pub fn is_completed(&self) -> bool {
        self.completed || self.state.is_complete()
    }

    /// Register handler tables for the aggregate and its sub-aggregate type,
    /// and bind sub-aggregate back-references.
    pub fn init(&mut self) {
        let registry = HandlerRegistry::global();
        registry.register::<A>();
        registry.register::<A::Sub>();

        let id = self.id.clone();
        if let Some(subs) = self.state.sub_aggregates_mut() {
            subs.bind_owner(&id);
        }
    }

    /// Bind the repository and bus this aggregate forwards events to
    pub fn attach(
        &mut self,
        repository: Option<Weak<dyn EventSink<A::Event>>>,
        bus: Option<WeakEventBus>,
    ) {
        self.repository = repository;
        self.bus = bus;
    }

    pub fn is_attached(&self) -> bool {
        self.repository.is_some() || self.bus.is_some()
    }

    /// Apply an event: dispatch to handlers, then persist and publish it.
    ///
    /// A no-op once the aggregate is completed. Handler failures are
    /// reported in the returned outcome and do not stop the event. A
    /// persistence failure is returned after publication was attempted.
    pub fn apply(&mut self, event: impl Into<EventMessage<A::Event>>) -> Result<DispatchOutcome> {
        let mut event = event.into();
        if self.is_completed() {
            tracing::trace!(aggregate_id = %self.id, "ignoring event for completed aggregate");
            return Ok(DispatchOutcome::default());
        }

        let outcome = self.dispatch(&event);
        if is_completion(event.payload().as_event()) {
            self.completed = true;
            tracing::debug!(aggregate_id = %self.id, "aggregate completed");
        }

        if !self.is_attached() {
            return Ok(outcome);
        }
        event.stamp(&self.id);

        let persisted = match &self.repository {
            Some(repository) => match repository.upgrade() {
                Some(repository) => repository.add_event(&self.id, &event),
                None => Err(Error::Closed),
            },
            None => Ok(()),
        };

        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish_one(Arc::new(event)) {
                tracing::warn!(aggregate_id = %self.id, error = %e, "failed to publish event");
            }
        }

        persisted.map(|()| outcome)
    }

    /// Register a sub-aggregate with this aggregate.
    ///
    /// Returns `None` if the aggregate does not hold sub-aggregates.
    pub fn register_sub_aggregate(
        &mut self,
        id: impl Into<String>,
        state: A::Sub,
    ) -> Option<SubHandle> {
        HandlerRegistry::global().register::<A::Sub>();
        let owner = self.id.clone();
        let subs = self.state.sub_aggregates_mut()?;
        subs.bind_owner(&owner);
        Some(subs.register(id, state))
    }

    /// Remove a sub-aggregate; `None` if it was not registered
    pub fn unregister_sub_aggregate(&mut self, handle: SubHandle) -> Option<SubEntity<A::Sub>> {
        self.state.sub_aggregates_mut()?.unregister(handle)
    }

    pub fn sub_aggregate(&self, handle: SubHandle) -> Option<&SubEntity<A::Sub>> {
        self.state.sub_aggregates()?.get(handle)
    }

    pub fn sub_aggregate_count(&self) -> usize {
        self.state.sub_aggregates().map_or(0, |subs| subs.len())
    }

    /// Own handlers first, then every sub-aggregate in registration order
    fn dispatch(&mut self, event: &EventMessage<A::Event>) -> DispatchOutcome {
        let registry = HandlerRegistry::global();
        let payload = event.payload().as_event();

        let mut outcome = registry.dispatch(&mut self.state, payload, event.meta());
        if let Some(subs) = self.state.sub_aggregates_mut() {
            let table = registry.table::<A::Sub>();
            for sub in subs.iter_mut() {
                outcome.merge(table.dispatch(sub.state_mut(), payload, event.meta()));
            }
        }
        outcome
    }
}

impl<A> fmt::Debug for AggregateRoot<A>
where
    A: Aggregate + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("id", &self.id)
            .field("completed", &self.completed)
            .field("state", &self.state)
            .field("attached", &self.is_attached())
            .finish()
    }
}
