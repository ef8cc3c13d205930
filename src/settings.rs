//! Configuration for the scheduler and its workers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Smallest async stack we are willing to run on. Anything below this can
/// not hold a realistic activation chain and would abort almost immediately.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Default async stack size per worker.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// A structure containing configuration data for the task scheduler, which
/// is used to size the worker pool and the per-worker resources.
#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Number of worker threads. `0` selects the hardware concurrency.
    pub workers: usize,
    /// Byte size of each async stack. At least [`MIN_STACK_SIZE`].
    pub stack_size: usize,
    /// Consecutive empty scans a thief tolerates before it parks on the
    /// event-count.
    pub park_patience: u32,
    /// Initial capacity (in entries) of each worker's deque. Rounded up to a
    /// power of two; the deque grows on demand afterwards.
    pub deque_capacity: usize,
    /// Hook invoked once on every worker thread right after it starts, with
    /// the worker index. Use it to bind workers to CPUs.
    #[serde(skip)]
    pub affinity: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            workers: 0,
            stack_size: DEFAULT_STACK_SIZE,
            park_patience: 64,
            deque_capacity: 256,
            affinity: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("workers", &self.workers)
            .field("stack_size", &self.stack_size)
            .field("park_patience", &self.park_patience)
            .field("deque_capacity", &self.deque_capacity)
            .field("affinity", &self.affinity.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.workers, 0);
        assert_eq!(settings.stack_size, DEFAULT_STACK_SIZE);
        assert!(settings.affinity.is_none());
    }
}
