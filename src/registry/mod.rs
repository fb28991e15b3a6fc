//! Handler Registry
//!
//! Maps a handler type (aggregate, sub-aggregate or bus subscriber) to the
//! table of event handlers it declares. Tables are built once per type, on
//! first use, and cached for the life of the process.
//!
//! ```text
//! Handles::register_handlers ──► HandlerTable<T> ──► HandlerRegistry (TypeId → table)
//!                                                          │
//!         dispatch(target, event) ◄────────────────────────┘
//!         fires every entry whose event type is in the event's lineage,
//!         plus catch-all entries declared with `on_any`
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::types::{lineage, Event, EventMeta};

/// Implemented by every type that receives events.
///
/// `register_handlers` plays the role of the "on(Event)" method
/// convention: each call to [`HandlerTable::on`] declares one handler.
pub trait Handles: Sized + 'static {
    fn register_handlers(table: &mut HandlerTable<Self>);
}

/// Return types accepted from handler closures
pub trait HandlerResult {
    fn into_result(self) -> Result<(), String>;
}

impl HandlerResult for () {
    fn into_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> HandlerResult for Result<(), E> {
    fn into_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// A handler invocation that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler {target}::on({handler_event}) failed for {event}: {reason}")]
pub struct DispatchError {
    /// Type that declared the handler
    pub target: &'static str,
    /// Runtime type of the dispatched event
    pub event: &'static str,
    /// Event type the handler was declared for
    pub handler_event: &'static str,
    pub reason: String,
}

/// Result of dispatching one event to one target
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Number of handlers invoked
    pub invoked: usize,
    pub failures: Vec<DispatchError>,
}

impl DispatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn merge(&mut self, other: DispatchOutcome) {
        self.invoked += other.invoked;
        self.failures.extend(other.failures);
    }
}

type HandlerFn<T> = Box<dyn Fn(&mut T, &dyn Event, &EventMeta) -> Result<(), String> + Send + Sync>;

struct HandlerEntry<T> {
    /// `None` matches every event
    event_type: Option<TypeId>,
    event_name: &'static str,
    call: HandlerFn<T>,
}

impl<T> HandlerEntry<T> {
    /// The member of `event`'s lineage this entry handles, if any
    fn matches<'a>(&self, event: &'a dyn Event) -> Option<&'a dyn Event> {
        match self.event_type {
            None => Some(event),
            Some(event_type) => lineage(event).find(|e| e.as_any().type_id() == event_type),
        }
    }
}

/// The handlers one type declares, in declaration order
pub struct HandlerTable<T> {
    entries: Vec<HandlerEntry<T>>,
}

impl<T: 'static> HandlerTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Declare a handler for events of type `E` (or events extending `E`).
    ///
    /// If a handler for `E` is already declared, the first one is kept.
    pub fn on<E, F, R>(&mut self, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(&mut T, &E) -> R + Send + Sync + 'static,
        R: HandlerResult,
    {
        self.on_message::<E, _, _>(move |target, event, _meta| handler(target, event))
    }

    /// Like [`on`](Self::on), but the handler also receives the envelope metadata
    pub fn on_message<E, F, R>(&mut self, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(&mut T, &E, &EventMeta) -> R + Send + Sync + 'static,
        R: HandlerResult,
    {
        self.push(
            Some(TypeId::of::<E>()),
            type_name::<E>(),
            Box::new(move |target, event, meta| match event.as_any().downcast_ref::<E>() {
                Some(event) => handler(target, event, meta).into_result(),
                None => Err(format!("event is not a {}", type_name::<E>())),
            }),
        )
    }

    /// Declare a handler that receives every event, whatever its type.
    ///
    /// Runs in declaration order alongside typed handlers. Only the first
    /// catch-all declaration is kept.
    pub fn on_any<F, R>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut T, &dyn Event, &EventMeta) -> R + Send + Sync + 'static,
        R: HandlerResult,
    {
        self.push(
            None,
            "*",
            Box::new(move |target, event, meta| handler(target, event, meta).into_result()),
        )
    }

    /// Check if a handler is declared for exactly `E`
    pub fn handles<E: Event>(&self) -> bool {
        self.handles_type(Some(TypeId::of::<E>()))
    }

    /// Check if a catch-all handler is declared
    pub fn handles_any(&self) -> bool {
        self.handles_type(None)
    }

    fn handles_type(&self, event_type: Option<TypeId>) -> bool {
        self.entries.iter().any(|e| e.event_type == event_type)
    }

    fn push(
        &mut self,
        event_type: Option<TypeId>,
        event_name: &'static str,
        call: HandlerFn<T>,
    ) -> &mut Self {
        if self.handles_type(event_type) {
            tracing::debug!(
                target_type = type_name::<T>(),
                event = event_name,
                "duplicate handler ignored, first declaration wins"
            );
            return self;
        }

        self.entries.push(HandlerEntry {
            event_type,
            event_name,
            call,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke every catch-all handler and every handler whose declared type
    /// is in the event's lineage.
    ///
    /// Failures are logged and collected; remaining handlers still run.
    pub fn dispatch(&self, target: &mut T, event: &dyn Event, meta: &EventMeta) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for entry in &self.entries {
            let Some(matched) = entry.matches(event) else {
                continue;
            };

            outcome.invoked += 1;
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| (entry.call)(target, matched, meta)));
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(reason)) => reason,
                Err(payload) => panic_message(payload.as_ref()),
            };

            let error = DispatchError {
                target: type_name::<T>(),
                event: event.type_name(),
                handler_event: entry.event_name,
                reason,
            };
            tracing::warn!(error = %error, "event handler failed");
            outcome.failures.push(error);
        }

        outcome
    }
}

impl<T: 'static> Default for HandlerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Global registry instance (built on first use, never torn down)
static REGISTRY: OnceLock<HandlerRegistry> = OnceLock::new();

/// Per-type cache of handler tables
pub struct HandlerRegistry {
    tables: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl HandlerRegistry {
    /// Create an empty registry. Most code uses [`global`](Self::global).
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static HandlerRegistry {
        REGISTRY.get_or_init(HandlerRegistry::new)
    }

    /// Build and cache `T`'s handler table.
    ///
    /// Returns `false` if the type was already registered; its table is
    /// left untouched.
    pub fn register<T: Handles>(&self) -> bool {
        self.get_or_build::<T>().1
    }

    /// Check if `T` has been registered
    pub fn contains<T: Handles>(&self) -> bool {
        self.tables.read().contains_key(&TypeId::of::<T>())
    }

    /// `T`'s handler table, registering it on first use
    pub fn table<T: Handles>(&self) -> Arc<HandlerTable<T>> {
        self.get_or_build::<T>().0
    }

    /// Dispatch an event to `target` using its type's handler table
    pub fn dispatch<T: Handles>(
        &self,
        target: &mut T,
        event: &dyn Event,
        meta: &EventMeta,
    ) -> DispatchOutcome {
        self.table::<T>().dispatch(target, event, meta)
    }

    fn get_or_build<T: Handles>(&self) -> (Arc<HandlerTable<T>>, bool) {
        let key = TypeId::of::<T>();

        if let Some(table) = self.tables.read().get(&key).and_then(downcast_table::<T>) {
            return (table, false);
        }

        // Built outside the lock so handler declarations may touch the registry
        let mut table = HandlerTable::new();
        T::register_handlers(&mut table);

        let mut tables = self.tables.write();
        match tables.entry(key) {
            Entry::Occupied(existing) => match downcast_table::<T>(existing.get()) {
                Some(table) => (table, false),
                None => (Arc::new(table), false),
            },
            Entry::Vacant(slot) => {
                tracing::trace!(
                    handler_type = type_name::<T>(),
                    handlers = table.len(),
                    "registered handler table"
                );
                let table = Arc::new(table);
                slot.insert(table.clone());
                (table, true)
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast_table<T: Handles>(entry: &Arc<dyn Any + Send + Sync>) -> Option<Arc<HandlerTable<T>>> {
    entry.clone().downcast::<HandlerTable<T>>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Deposited {
        amount: i64,
    }

    impl Event for Deposited {}

    #[derive(Debug)]
    struct BonusDeposited {
        base: Deposited,
    }

    impl Event for BonusDeposited {
        fn parent(&self) -> Option<&dyn Event> {
            Some(&self.base)
        }
    }

    #[derive(Debug)]
    struct Frozen;

    impl Event for Frozen {}

    #[derive(Default)]
    struct Ledger {
        deposits: Vec<i64>,
        bonuses: usize,
        calls: Vec<&'static str>,
    }

    impl Handles for Ledger {
        fn register_handlers(table: &mut HandlerTable<Self>) {
            table
                .on(|ledger: &mut Ledger, event: &Deposited| {
                    ledger.deposits.push(event.amount);
                    ledger.calls.push("deposited");
                })
                .on(|ledger: &mut Ledger, _event: &BonusDeposited| {
                    ledger.bonuses += 1;
                    ledger.calls.push("bonus");
                })
                .on(|ledger: &mut Ledger, _event: &Deposited| {
                    ledger.calls.push("shadowed");
                });
        }
    }

    #[test]
    fn test_exact_type_dispatch() {
        let registry = HandlerRegistry::new();
        let mut ledger = Ledger::default();

        let outcome = registry.dispatch(&mut ledger, &Deposited { amount: 5 }, &EventMeta::now());

        assert_eq!(outcome.invoked, 1);
        assert!(outcome.is_ok());
        assert_eq!(ledger.deposits, vec![5]);
    }

    #[test]
    fn test_supertype_handler_fires_too() {
        let registry = HandlerRegistry::new();
        let mut ledger = Ledger::default();
        let event = BonusDeposited {
            base: Deposited { amount: 10 },
        };

        let outcome = registry.dispatch(&mut ledger, &event, &EventMeta::now());

        assert_eq!(outcome.invoked, 2);
        assert_eq!(ledger.deposits, vec![10]);
        assert_eq!(ledger.bonuses, 1);
        assert_eq!(ledger.calls, vec!["deposited", "bonus"]);
    }

    #[test]
    fn test_first_declaration_wins() {
        let registry = HandlerRegistry::new();
        let table = registry.table::<Ledger>();
        assert_eq!(table.len(), 2);

        let mut ledger = Ledger::default();
        table.dispatch(&mut ledger, &Deposited { amount: 1 }, &EventMeta::now());
        assert!(!ledger.calls.contains(&"shadowed"));
    }

    #[test]
    fn test_unhandled_event_is_ignored() {
        let registry = HandlerRegistry::new();
        let mut ledger = Ledger::default();

        let outcome = registry.dispatch(&mut ledger, &Frozen, &EventMeta::now());

        assert_eq!(outcome.invoked, 0);
        assert!(ledger.calls.is_empty());
    }

    struct Fragile {
        reached: Vec<&'static str>,
    }

    impl Handles for Fragile {
        fn register_handlers(table: &mut HandlerTable<Self>) {
            table
                .on(|_f: &mut Fragile, _e: &BonusDeposited| -> Result<(), String> {
                    Err("rejected".to_string())
                })
                .on(|_f: &mut Fragile, _e: &Deposited| -> Result<(), String> {
                    panic!("boom");
                })
                .on_message(|f: &mut Fragile, _e: &BonusDeposited, meta: &EventMeta| {
                    assert!(meta.aggregate_id().is_none());
                    f.reached.push("after-failures");
                });
        }
    }

    #[test]
    fn test_handler_failures_are_isolated() {
        let registry = HandlerRegistry::new();
        let mut fragile = Fragile { reached: vec![] };
        let event = BonusDeposited {
            base: Deposited { amount: 1 },
        };

        let outcome = registry.dispatch(&mut fragile, &event, &EventMeta::now());

        // the third declaration duplicates BonusDeposited and is dropped
        assert_eq!(outcome.invoked, 2);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].reason, "rejected");
        assert!(outcome.failures[1].reason.contains("boom"));
        assert!(fragile.reached.is_empty());
    }

    #[derive(Default)]
    struct Journal {
        seen: Vec<&'static str>,
    }

    impl Handles for Journal {
        fn register_handlers(table: &mut HandlerTable<Self>) {
            table
                .on(|j: &mut Journal, _e: &Deposited| j.seen.push("deposited"))
                .on_any(|j: &mut Journal, e: &dyn Event, _meta: &EventMeta| {
                    j.seen.push(e.type_name().rsplit("::").next().unwrap_or_default());
                })
                .on_any(|j: &mut Journal, _e: &dyn Event, _meta: &EventMeta| {
                    j.seen.push("second catch-all");
                });
        }
    }

    #[test]
    fn test_catch_all_receives_every_event() {
        let registry = HandlerRegistry::new();
        let table = registry.table::<Journal>();
        assert!(table.handles_any());
        assert_eq!(table.len(), 2);

        let mut journal = Journal::default();
        let bonus = BonusDeposited {
            base: Deposited { amount: 3 },
        };
        let outcome = table.dispatch(&mut journal, &bonus, &EventMeta::now());
        assert_eq!(outcome.invoked, 2);

        table.dispatch(&mut journal, &Frozen, &EventMeta::now());

        // the catch-all sees the runtime type, not a matched ancestor
        assert_eq!(journal.seen, vec!["deposited", "BonusDeposited", "Frozen"]);
    }

    static COUNTED_BUILDS: AtomicUsize = AtomicUsize::new(0);

    struct Counted;

    impl Handles for Counted {
        fn register_handlers(table: &mut HandlerTable<Self>) {
            COUNTED_BUILDS.fetch_add(1, Ordering::SeqCst);
            table.on(|_c: &mut Counted, _e: &Frozen| {});
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = HandlerRegistry::new();

        assert!(!registry.contains::<Counted>());
        assert!(registry.register::<Counted>());
        assert!(!registry.register::<Counted>());
        assert!(registry.contains::<Counted>());

        let first = registry.table::<Counted>();
        let second = registry.table::<Counted>();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_registration_of_different_types() {
        let registry = Arc::new(HandlerRegistry::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        registry.register::<Ledger>();
                    } else {
                        registry.register::<Fragile>();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.contains::<Ledger>());
        assert!(registry.contains::<Fragile>());
        assert_eq!(registry.table::<Ledger>().len(), 2);
    }
}
