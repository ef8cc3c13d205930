//! One-way signals used off the hot path.
//!
//! [`Flare`] is the completion signal of a root frame and of the pool-start
//! handshake. It does not carry a condvar of its own: blocking goes through
//! an [`EventCount`] owned by the pool, so the firing thread is out of the
//! (possibly submitter-owned) structure the moment the flag is stored.
//! [`CountLatch`] counts outstanding root frames so that shutdown can block
//! until the pool has drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use super::event_count::EventCount;

/// A one-shot completion signal.
///
/// Observers either block in [`Flare::wait`] (external submitters, the
/// start handshake) or poll [`Flare::peek`] from the steal-while-waiting
/// loop. Firing is a release store plus a notify on the event-count the
/// blocked observers registered with; after the store the firing thread
/// never touches the flare again, which is what lets a submitter free the
/// enclosing root activation as soon as it observes completion.
pub struct Flare {
    fired: AtomicBool,
}

impl Flare {
    pub fn new() -> Flare {
        Flare {
            fired: AtomicBool::new(false),
        }
    }

    /// Fires the signal and wakes everything parked on `events`. Observers
    /// whose own flare this is not will re-check and park again.
    pub fn fire(&self, events: &EventCount) {
        self.fired.store(true, Ordering::Release);
        events.notify_all();
    }

    /// Non-blocking probe.
    pub fn peek(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Blocks until the flare fires. `events` must be the event-count the
    /// firing side notifies.
    pub fn wait(&self, events: &EventCount) {
        loop {
            if self.peek() {
                return;
            }
            let token = events.prepare_wait();
            if self.peek() {
                events.cancel_wait();
                return;
            }
            events.wait(token);
        }
    }
}

/// A countdown the scheduler uses to track outstanding root frames:
/// `increment()` on submission, `set()` when a root completes, and
/// `wait()` blocks shutdown until the count reaches zero. The owner holds
/// one reference of its own and drops it when shutdown begins.
pub struct CountLatch {
    count: Mutex<isize>,
    cond: Condvar,
}

impl CountLatch {
    /// Starts with a count of one, held by the owner until shutdown.
    pub fn new() -> CountLatch {
        CountLatch {
            count: Mutex::new(1),
            cond: Condvar::new(),
        }
    }

    pub fn increment(&self) {
        let mut guard = self.count.lock().unwrap();
        debug_assert!(*guard > 0);
        *guard += 1;
    }

    /// Lowers the count; the latch is set once it reaches zero.
    pub fn set(&self) {
        let mut guard = self.count.lock().unwrap();
        *guard -= 1;
        if *guard == 0 {
            self.cond.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.count.lock().unwrap() == 0
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut guard = self.count.lock().unwrap();
        while *guard > 0 {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}
