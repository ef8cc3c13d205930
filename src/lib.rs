//! #### Twine
//!
//! Twine is a light-weight fork/join task runtime for fine-grained structured
//! parallelism. Task bodies are plain `async fn`s that suspend only at the
//! three runtime operations `fork`, `call` and `join`; between them execution
//! runs straight-line on the current worker thread. The runtime schedules
//! tasks across a fixed pool of workers with lock-free work-stealing deques,
//! and keeps task activation frames on per-worker bump-allocated async stacks
//! instead of the heap.
//!
//! ```ignore
//! use twine::{call, fork, join, Scheduler, Slot};
//!
//! async fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!
//!     let a = Slot::new();
//!     let b = Slot::new();
//!
//!     fork(&a, move || fib(n - 1)).await;
//!     call(&b, move || fib(n - 2)).await;
//!     join().await;
//!
//!     a.take() + b.take()
//! }
//!
//! let scheduler = Scheduler::new(4).unwrap();
//! scheduler.start().unwrap();
//! assert_eq!(scheduler.sync_wait(fib(30)), 832_040);
//! scheduler.stop();
//! ```
//!
//! The scheduling policy is child-first: a `fork` makes the *parent*
//! stealable and runs the child immediately, which keeps the common
//! deep-recursion case cache-hot and defers all bookkeeping to the rare
//! moment an idle worker actually steals.

pub mod errors;
pub mod settings;
pub mod sync;

mod deque;
mod frame;
mod mailbox;
mod panics;
mod scheduler;
mod stack;
mod task;
mod worker;

pub use self::errors::{Error, Result};
pub use self::frame::Slot;
pub use self::scheduler::{Scheduler, Ticket};
pub use self::settings::Settings;
pub use self::task::{call, fork, join, CallAwait, ForkAwait, JoinAwait};
