//! In-process event bus
//!
//! Fans published events out to subscribers through a bounded ring buffer.
//! Every subscriber gets its own cursor and worker thread, so a slow
//! subscriber delays only itself until the ring fills, at which point
//! publishers wait for it (backpressure). All subscribers observe events
//! in the same total order.
//!
//! ```text
//! publish ──► [ ring: 1024 slots ] ──► worker A ──► HandlerTable<A>
//!                                  └─► worker B ──► HandlerTable<B>
//! ```

mod ring;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::registry::{HandlerRegistry, Handles};
use crate::types::{DomainEvent, EventMessage, Message};

use ring::Ring;

/// Default number of ring slots
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default time `close` waits for subscribers to drain
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Ring buffer slots; publishers wait once this many events are unconsumed
    pub capacity: usize,
    /// Upper bound on how long `close` waits for subscribers to finish
    pub shutdown_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl EventBusConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// An object that receives bus events through its declared handlers.
///
/// Implemented for every [`Handles`] type that can move to a worker thread.
pub trait Subscriber: Handles + Send {}

impl<T: Handles + Send> Subscriber for T {}

/// Identifies a subscription for [`EventBus::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Shared {
    config: EventBusConfig,
    ring: Arc<Ring>,
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: let workers drain and exit on their own
        self.ring.close_now();
    }
}

/// Handle to a shared event bus. Clones refer to the same bus.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let ring = Arc::new(Ring::new(config.capacity));
        tracing::debug!(capacity = ring.capacity(), "event bus started");
        Self {
            shared: Arc::new(Shared {
                config,
                ring,
                workers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.shared.config
    }

    /// Non-owning handle, as held by aggregates
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Publish events in iteration order.
    ///
    /// Blocks while the ring is full. With no subscribers, events are
    /// accepted and dropped.
    pub fn publish<I>(&self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Message>>,
    {
        self.shared.ring.publish(events)
    }

    pub fn publish_one(&self, event: Arc<dyn Message>) -> Result<()> {
        self.publish([event])
    }

    /// Wrap a payload in a message and publish it
    pub fn publish_event<P: DomainEvent>(&self, event: P) -> Result<()> {
        self.publish_one(Arc::new(EventMessage::new(event)))
    }

    /// Start delivering events to `subscriber` on its own worker thread.
    ///
    /// Delivery begins with the next event published after this call.
    pub fn subscribe<T: Subscriber>(&self, subscriber: T) -> Result<SubscriptionId> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let table = HandlerRegistry::global().table::<T>();
        self.shared.ring.join(id)?;

        let ring = self.shared.ring.clone();
        let spawned = thread::Builder::new()
            .name(format!("event-bus-{id}"))
            .spawn(move || run_worker(ring, id, subscriber, table));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.ring.remove(id);
                self.shared.ring.leave(id);
                return Err(Error::Storage(e));
            }
        };
        self.shared.workers.lock().insert(id, handle);

        tracing::debug!(
            subscription = id,
            subscriber = std::any::type_name::<T>(),
            "subscribed"
        );
        Ok(SubscriptionId(id))
    }

    /// Stop delivery to a subscriber.
    ///
    /// Waits for an in-flight handler to return, unless called from the
    /// subscriber's own handler. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.ring.remove(id.0);
        let handle = self.shared.workers.lock().remove(&id.0);

        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!(subscription = id.0, "subscriber worker panicked");
            }
        }

        if removed {
            tracing::debug!(subscription = id.0, "unsubscribed");
        }
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.ring.is_closed()
    }

    /// Stop accepting events and drain subscribers.
    ///
    /// Waits up to the configured shutdown timeout; subscribers still busy
    /// after that are halted and reported as [`Error::ShutdownTimeout`].
    /// Calling it again is harmless.
    pub fn close(&self) -> Result<()> {
        let pending = self.shared.ring.close(self.shared.config.shutdown_timeout);

        let workers: Vec<_> = self.shared.workers.lock().drain().collect();
        if pending > 0 {
            tracing::warn!(
                pending,
                timeout_ms = self.shared.config.shutdown_timeout.as_millis() as u64,
                "event bus shutdown timed out"
            );
            return Err(Error::ShutdownTimeout { pending });
        }

        let current = thread::current().id();
        for (id, handle) in workers {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!(subscription = id, "subscriber worker panicked");
            }
        }
        tracing::info!("event bus closed");
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.shared.ring.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning bus handle. Publishing through it fails once the bus is gone.
#[derive(Clone, Default)]
pub struct WeakEventBus {
    shared: Weak<Shared>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.shared.upgrade().map(|shared| EventBus { shared })
    }

    pub fn publish_one(&self, event: Arc<dyn Message>) -> Result<()> {
        match self.upgrade() {
            Some(bus) => bus.publish_one(event),
            None => Err(Error::BusClosed),
        }
    }
}

impl fmt::Debug for WeakEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventBus")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

fn run_worker<T: Subscriber>(
    ring: Arc<Ring>,
    id: u64,
    mut subscriber: T,
    table: Arc<crate::registry::HandlerTable<T>>,
) {
    while let Some(batch) = ring.next_batch(id) {
        let mut consumed = None;
        for (seq, message) in batch {
            if ring.is_halted() {
                break;
            }
            table.dispatch(&mut subscriber, message.event(), message.meta());
            consumed = Some(seq + 1);
        }
        if let Some(next) = consumed {
            ring.advance(id, next);
        }
    }
    ring.leave(id);
    tracing::trace!(subscription = id, "subscriber worker stopped");
}
