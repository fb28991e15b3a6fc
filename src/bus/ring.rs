//! Bounded ring buffer shared by publishers and subscriber workers.
//!
//! One circular array of `capacity` slots, a global publish sequence and one
//! read cursor per subscriber. A publisher may claim sequence `n` only when
//! every cursor has moved past `n - capacity`, so slots are never
//! overwritten before all subscribers have taken them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::types::Message;

/// A claimed event and its sequence number
pub(crate) type Slot = (u64, Arc<dyn Message>);

struct RingState {
    slots: Vec<Option<Arc<dyn Message>>>,
    /// Next sequence to publish
    published: u64,
    /// Subscriber id -> next sequence to consume
    cursors: HashMap<u64, u64>,
    closed: bool,
    running: usize,
}

impl RingState {
    fn slowest_cursor(&self) -> u64 {
        self.cursors.values().copied().min().unwrap_or(self.published)
    }
}

pub(crate) struct Ring {
    capacity: usize,
    state: Mutex<RingState>,
    not_full: Condvar,
    not_empty: Condvar,
    drained: Condvar,
    halted: AtomicBool,
}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                published: 0,
                cursors: HashMap::new(),
                closed: false,
                running: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            halted: AtomicBool::new(false),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim, fill and commit one slot per message, waiting while full
    pub(crate) fn publish<I>(&self, messages: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Message>>,
    {
        let mut state = self.state.lock();
        for message in messages {
            loop {
                if state.closed {
                    return Err(Error::BusClosed);
                }
                let in_flight = state.published - state.slowest_cursor();
                if in_flight < self.capacity as u64 {
                    break;
                }
                self.not_full.wait(&mut state);
            }

            let index = (state.published % self.capacity as u64) as usize;
            state.slots[index] = Some(message);
            state.published += 1;
            self.not_empty.notify_all();
        }
        Ok(())
    }

    /// Add a cursor starting at the next published sequence
    pub(crate) fn join(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::BusClosed);
        }
        let start = state.published;
        state.cursors.insert(id, start);
        state.running += 1;
        Ok(())
    }

    /// Everything between the subscriber's cursor and the publish sequence.
    ///
    /// Blocks while there is nothing to read. `None` means the worker should
    /// stop: it was removed, the ring was halted, or the ring is closed and
    /// fully drained for this cursor.
    pub(crate) fn next_batch(&self, id: u64) -> Option<Vec<Slot>> {
        let mut state = self.state.lock();
        loop {
            if self.is_halted() {
                return None;
            }
            let cursor = *state.cursors.get(&id)?;
            if cursor < state.published {
                let batch = (cursor..state.published)
                    .filter_map(|seq| {
                        let index = (seq % self.capacity as u64) as usize;
                        state.slots[index].clone().map(|message| (seq, message))
                    })
                    .collect();
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Mark everything before `next` as consumed
    pub(crate) fn advance(&self, id: u64, next: u64) {
        let mut state = self.state.lock();
        if let Some(cursor) = state.cursors.get_mut(&id) {
            *cursor = next;
        }
        self.not_full.notify_all();
    }

    /// Drop a cursor so publishers stop waiting on it; its worker exits
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let removed = state.cursors.remove(&id).is_some();
        self.not_full.notify_all();
        self.not_empty.notify_all();
        removed
    }

    /// Called by a worker as it exits
    pub(crate) fn leave(&self, id: u64) {
        let mut state = self.state.lock();
        state.cursors.remove(&id);
        state.running = state.running.saturating_sub(1);
        self.not_full.notify_all();
        self.drained.notify_all();
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Refuse new publishes and let workers drain what is queued.
    ///
    /// Waits up to `timeout` for every worker to exit, then halts the rest.
    /// Returns the number of workers still running when halted.
    pub(crate) fn close(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();

        while state.running > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let pending = state.running;
        if pending > 0 {
            self.halted.store(true, Ordering::Release);
            self.not_empty.notify_all();
        }
        pending
    }

    /// Close without waiting for workers
    pub(crate) fn close_now(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[cfg(test)]
    fn published(&self) -> u64 {
        self.state.lock().published
    }
}
