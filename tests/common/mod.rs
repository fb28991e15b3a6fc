//! Shared fixtures: a counter aggregate and tracing setup
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use event_source::{
    Aggregate, Completed, DomainEvent, Event, HandlerTable, Handles, Repository, RepositoryConfig,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG=event_source=debug` to see logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incremented {
    pub by: u64,
}

impl Event for Incremented {}

/// Terminal event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finished {
    pub reason: String,
}

impl Event for Finished {
    fn parent(&self) -> Option<&dyn Event> {
        Some(&Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CounterEvent {
    Incremented(Incremented),
    Finished(Finished),
}

impl DomainEvent for CounterEvent {
    fn as_event(&self) -> &dyn Event {
        match self {
            CounterEvent::Incremented(e) => e,
            CounterEvent::Finished(e) => e,
        }
    }
}

pub fn increment(by: u64) -> CounterEvent {
    CounterEvent::Incremented(Incremented { by })
}

pub fn finish(reason: &str) -> CounterEvent {
    CounterEvent::Finished(Finished {
        reason: reason.to_string(),
    })
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Counter {
    pub value: u64,
    /// Value observed by the completion handler
    pub final_value: Option<u64>,
}

impl Handles for Counter {
    fn register_handlers(table: &mut HandlerTable<Self>) {
        table
            .on(|counter: &mut Counter, e: &Incremented| counter.value += e.by)
            .on(|counter: &mut Counter, _: &Finished| counter.final_value = Some(counter.value));
    }
}

impl Aggregate for Counter {
    type Event = CounterEvent;
    type Sub = ();
}

pub fn config(dir: &Path) -> RepositoryConfig {
    RepositoryConfig::new(dir, "counters")
}

pub fn open(dir: &Path) -> Repository<Counter> {
    Repository::open(config(dir), |_| Counter::default()).unwrap()
}

/// Open with a short idle flush so tests need not wait long
pub fn open_fast(dir: &Path) -> Repository<Counter> {
    let config = config(dir).with_idle_flush(Duration::from_millis(20));
    Repository::open(config, |_| Counter::default()).unwrap()
}
