//! Event Bus Integration Tests
//!
//! Tests for publish/subscribe including:
//! - Per-subscriber ordering and a shared total order
//! - Covariant handler matching
//! - Unsubscribe, drain on close and shutdown timeout
//! - Backpressure without loss

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use event_source::{
    Completed, Error, Event, EventBus, EventBusConfig, EventMessage, EventMeta, HandlerTable,
    Handles, Message,
};

use common::{finish, increment, init_tracing, CounterEvent, Finished, Incremented};

/// Forwards every increment it sees
struct Recorder(mpsc::Sender<u64>);

impl Handles for Recorder {
    fn register_handlers(table: &mut HandlerTable<Self>) {
        table.on(|r: &mut Recorder, e: &Incremented| {
            let _ = r.0.send(e.by);
        });
    }
}

/// Handles only the completion marker
struct CompletionWatcher(mpsc::Sender<&'static str>);

impl Handles for CompletionWatcher {
    fn register_handlers(table: &mut HandlerTable<Self>) {
        table
            .on(|w: &mut CompletionWatcher, _: &Completed| {
                let _ = w.0.send("completed");
            })
            .on(|w: &mut CompletionWatcher, _: &Finished| {
                let _ = w.0.send("finished");
            });
    }
}

/// Forwards the type name of every event, whatever its type
struct Forwarder(mpsc::Sender<String>);

impl Handles for Forwarder {
    fn register_handlers(table: &mut HandlerTable<Self>) {
        table.on_any(|f: &mut Forwarder, e: &dyn Event, _meta: &EventMeta| {
            let name = e.type_name().rsplit("::").next().unwrap_or_default();
            let _ = f.0.send(name.to_string());
        });
    }
}

/// Sleeps in its handler to lag behind publishers
struct SlowRecorder(mpsc::Sender<u64>, Duration);

impl Handles for SlowRecorder {
    fn register_handlers(table: &mut HandlerTable<Self>) {
        table.on(|r: &mut SlowRecorder, e: &Incremented| {
            thread::sleep(r.1);
            let _ = r.0.send(e.by);
        });
    }
}

/// Blocks its handler until released
struct Stuck(Arc<parking_lot::Mutex<()>>);

impl Handles for Stuck {
    fn register_handlers(table: &mut HandlerTable<Self>) {
        table.on(|s: &mut Stuck, _: &Incremented| {
            let _guard = s.0.lock();
        });
    }
}

fn message(event: CounterEvent) -> Arc<dyn Message> {
    Arc::new(EventMessage::new(event))
}

#[test]
fn test_events_arrive_in_publish_order() {
    init_tracing();
    let bus = EventBus::default();
    let (tx_a, rx_a) = mpsc::channel();
    let (tx_b, rx_b) = mpsc::channel();
    bus.subscribe(Recorder(tx_a)).unwrap();
    bus.subscribe(Recorder(tx_b)).unwrap();

    bus.publish([message(increment(1)), message(increment(2))]).unwrap();
    bus.close().unwrap();

    assert_eq!(rx_a.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(rx_b.try_iter().collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_concurrent_publishers_share_one_total_order() {
    let bus = EventBus::default();
    let (tx_a, rx_a) = mpsc::channel();
    let (tx_b, rx_b) = mpsc::channel();
    bus.subscribe(Recorder(tx_a)).unwrap();
    bus.subscribe(Recorder(tx_b)).unwrap();

    let publishers: Vec<_> = (0..4u64)
        .map(|p| {
            let bus = bus.clone();
            thread::spawn(move || {
                for n in 0..100u64 {
                    bus.publish_event(increment(p * 1000 + n)).unwrap();
                }
            })
        })
        .collect();
    for p in publishers {
        p.join().unwrap();
    }
    bus.close().unwrap();

    let a: Vec<_> = rx_a.try_iter().collect();
    let b: Vec<_> = rx_b.try_iter().collect();
    assert_eq!(a.len(), 400);
    assert_eq!(a, b);

    // Each publisher's own events stay in order
    for p in 0..4u64 {
        let own: Vec<_> = a.iter().copied().filter(|v| v / 1000 == p).collect();
        let mut sorted = own.clone();
        sorted.sort_unstable();
        assert_eq!(own, sorted);
    }
}

#[test]
fn test_supertype_handler_fires_for_subtype() {
    let bus = EventBus::default();
    let (tx, rx) = mpsc::channel();
    bus.subscribe(CompletionWatcher(tx)).unwrap();

    bus.publish_event(finish("done")).unwrap();
    bus.publish_event(increment(1)).unwrap();
    bus.close().unwrap();

    let mut seen: Vec<_> = rx.try_iter().collect();
    seen.sort_unstable();
    assert_eq!(seen, vec!["completed", "finished"]);
}

#[test]
fn test_catch_all_subscriber_sees_every_event() {
    let bus = EventBus::default();
    let (tx, rx) = mpsc::channel();
    bus.subscribe(Forwarder(tx)).unwrap();

    bus.publish_event(increment(1)).unwrap();
    bus.publish_event(finish("done")).unwrap();
    bus.close().unwrap();

    assert_eq!(
        rx.try_iter().collect::<Vec<_>>(),
        vec!["Incremented".to_string(), "Finished".to_string()]
    );
}

#[test]
fn test_unsubscribed_listener_stops_receiving() {
    let bus = EventBus::default();
    let (tx, rx) = mpsc::channel();
    let id = bus.subscribe(Recorder(tx)).unwrap();

    bus.publish_event(increment(1)).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));

    bus.publish_event(increment(2)).unwrap();
    bus.close().unwrap();

    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn test_late_subscriber_sees_only_later_events() {
    let bus = EventBus::default();
    bus.publish_event(increment(1)).unwrap();

    let (tx, rx) = mpsc::channel();
    bus.subscribe(Recorder(tx)).unwrap();
    bus.publish_event(increment(2)).unwrap();
    bus.close().unwrap();

    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2]);
}

#[test]
fn test_full_ring_applies_backpressure_without_loss() {
    let bus = EventBus::new(EventBusConfig::default().with_capacity(4));
    let (tx, rx) = mpsc::channel();
    bus.subscribe(SlowRecorder(tx, Duration::from_millis(2))).unwrap();

    for n in 0..40 {
        bus.publish_event(increment(n)).unwrap();
    }
    bus.close().unwrap();

    assert_eq!(rx.try_iter().collect::<Vec<_>>(), (0..40).collect::<Vec<_>>());
}

#[test]
fn test_close_drains_queued_events() {
    let bus = EventBus::default();
    let (tx, rx) = mpsc::channel();
    bus.subscribe(SlowRecorder(tx, Duration::from_millis(5))).unwrap();

    for n in 0..20 {
        bus.publish_event(increment(n)).unwrap();
    }
    bus.close().unwrap();

    assert_eq!(rx.try_iter().count(), 20);
}

#[test]
fn test_publish_after_close_is_rejected() {
    let bus = EventBus::default();
    bus.close().unwrap();

    assert!(bus.is_closed());
    assert!(matches!(bus.publish_event(increment(1)), Err(Error::BusClosed)));
    assert!(matches!(
        bus.subscribe(Recorder(mpsc::channel().0)),
        Err(Error::BusClosed)
    ));
    bus.close().unwrap();
}

#[test]
fn test_close_times_out_on_stuck_subscriber() {
    let bus = EventBus::new(
        EventBusConfig::default().with_shutdown_timeout(Duration::from_millis(100)),
    );
    let gate = Arc::new(parking_lot::Mutex::new(()));
    let held = gate.lock();
    bus.subscribe(Stuck(gate.clone())).unwrap();

    bus.publish_event(increment(1)).unwrap();
    let result = bus.close();
    assert!(matches!(result, Err(Error::ShutdownTimeout { pending: 1 })));

    drop(held);
}
