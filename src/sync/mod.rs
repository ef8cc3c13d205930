//! Blocking primitives used off the hot path: the event-count that lets
//! idle threads sleep without losing wakeups, and the one-way signals for
//! root completion and pool lifecycle built on top of it.

pub mod event_count;
pub mod latch;

pub use self::event_count::{EventCount, WaitToken};
pub use self::latch::{CountLatch, Flare};
