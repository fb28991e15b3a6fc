//! Sub-aggregates: child entities owned by an aggregate.
//!
//! The owner holds them in a [`SubAggregates`] collection inside its own
//! state, so they are snapshotted and replayed with it. Each entry keeps a
//! non-owning back-reference to its owner's id.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::registry::{HandlerTable, Handles};

/// A child entity whose events always go through its owner's `apply`
pub trait SubAggregate: Handles + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Placeholder for aggregates without children
impl Handles for () {
    fn register_handlers(_table: &mut HandlerTable<Self>) {}
}

impl SubAggregate for () {}

/// Stable identity of a registered sub-aggregate within its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubHandle(u64);

impl SubHandle {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered sub-aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubEntity<S> {
    id: String,
    #[serde(skip)]
    owner_id: Option<String>,
    state: S,
}

impl<S> SubEntity<S> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the owning aggregate; `None` once unregistered
    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }
}

/// Owner-held collection of sub-aggregates, in registration order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAggregates<S> {
    #[serde(skip)]
    owner_id: Option<String>,
    next_handle: u64,
    entries: BTreeMap<u64, SubEntity<S>>,
}

impl<S> SubAggregates<S> {
    pub fn new() -> Self {
        Self {
            owner_id: None,
            next_handle: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Add a sub-aggregate and bind it to the owner.
    ///
    /// The state is moved in, so the same instance can never be registered
    /// twice.
    pub fn register(&mut self, id: impl Into<String>, state: S) -> SubHandle {
        let handle = SubHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(
            handle.0,
            SubEntity {
                id: id.into(),
                owner_id: self.owner_id.clone(),
                state,
            },
        );
        handle
    }

    /// Remove a sub-aggregate and clear its back-reference.
    ///
    /// Returns `None` if the handle is not (or no longer) registered.
    pub fn unregister(&mut self, handle: SubHandle) -> Option<SubEntity<S>> {
        let mut entity = self.entries.remove(&handle.0)?;
        entity.owner_id = None;
        Some(entity)
    }

    pub fn get(&self, handle: SubHandle) -> Option<&SubEntity<S>> {
        self.entries.get(&handle.0)
    }

    /// Find a sub-aggregate by its id
    pub fn find(&self, id: &str) -> Option<(SubHandle, &SubEntity<S>)> {
        self.iter().find(|(_, entity)| entity.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubHandle, &SubEntity<S>)> {
        self.entries.iter().map(|(k, v)| (SubHandle(*k), v))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubEntity<S>> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id of the aggregate this collection is bound to
    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub(crate) fn bind_owner(&mut self, owner_id: &str) {
        self.owner_id = Some(owner_id.to_string());
        for entity in self.entries.values_mut() {
            entity.owner_id = Some(owner_id.to_string());
        }
    }
}

impl<S> Default for SubAggregates<S> {
    fn default() -> Self {
        Self::new()
    }
}
