//! The public scheduler handle: pool lifecycle, submission and blocking
//! waits.

use std::future::Future;
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use crate::deque::Deque;
use crate::errors::{Error, Result};
use crate::frame::FrameHandle;
use crate::mailbox::Mailbox;
use crate::settings::{Settings, MIN_STACK_SIZE};
use crate::panics;
use crate::sync::{CountLatch, EventCount, Flare};
use crate::task::{self, RootHeader};
use crate::worker::{self, main_loop, Shared, WorkerInfo};

const NEW: usize = 0;
const RUNNING: usize = 1;
const STOPPED: usize = 2;

/// Handle to a pool of worker threads executing fork/join task trees.
///
/// A scheduler is constructed, `start`ed once, used from any number of
/// threads, and `stop`ped once (dropping it stops it as well). Stopping
/// blocks until every submitted root has completed, then joins the workers.
pub struct Scheduler {
    shared: Arc<Shared>,
    deques: Mutex<Vec<Deque<FrameHandle>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    state: AtomicUsize,
}

impl Scheduler {
    /// A scheduler with `workers` worker threads (`0` selects the hardware
    /// concurrency) and default settings otherwise.
    pub fn new(workers: usize) -> Result<Scheduler> {
        Scheduler::with_settings(Settings {
            workers,
            ..Settings::default()
        })
    }

    pub fn with_settings(mut settings: Settings) -> Result<Scheduler> {
        if settings.workers == 0 {
            settings.workers = num_cpus::get();
        }
        if settings.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidSettings(format!(
                "stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, settings.stack_size
            ))
            .into());
        }
        if settings.park_patience == 0 {
            return Err(
                Error::InvalidSettings("park_patience must be non-zero".to_owned()).into(),
            );
        }

        let mut deques = Vec::with_capacity(settings.workers);
        let mut infos = Vec::with_capacity(settings.workers);
        for _ in 0..settings.workers {
            let (deque, stealer) = Deque::new(settings.deque_capacity);
            deques.push(deque);
            infos.push(WorkerInfo {
                stealer,
                mailbox: Mailbox::new(),
                primed: Flare::new(),
            });
        }

        Ok(Scheduler {
            shared: Arc::new(Shared {
                workers: infos,
                idle: EventCount::new(),
                completions: EventCount::new(),
                stop: AtomicBool::new(false),
                roots: CountLatch::new(),
                round_robin: AtomicUsize::new(0),
                settings,
            }),
            deques: Mutex::new(deques),
            threads: Mutex::new(Vec::new()),
            state: AtomicUsize::new(NEW),
        })
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Spawns the worker threads and blocks until all of them are up.
    pub fn start(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(NEW, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Err(Error::AlreadyStarted.into()),
            Err(_) => return Err(Error::Terminated.into()),
        }

        let deques = {
            let mut guard = self.deques.lock().unwrap();
            mem::replace(&mut *guard, Vec::new())
        };
        let mut threads = self.threads.lock().unwrap();
        for (index, deque) in deques.into_iter().enumerate() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("twine-worker-{}", index))
                .spawn(move || main_loop(shared, index, deque))
                .expect("failed to spawn a worker thread");
            threads.push(handle);
        }

        for info in &self.shared.workers {
            info.primed.wait(&self.shared.completions);
        }
        debug!("scheduler started with {} workers", self.workers());
        Ok(())
    }

    /// Blocks until all submitted roots have drained, then shuts the
    /// workers down. Idempotent; also performed on drop.
    pub fn stop(&self) {
        let was = self.state.swap(STOPPED, Ordering::AcqRel);
        if was != RUNNING {
            return;
        }

        // Drop the owner's reference on the root count, then wait for the
        // outstanding ones.
        self.shared.roots.set();
        self.shared.roots.wait();

        self.shared.stop.store(true, Ordering::Release);
        self.shared.idle.notify_all();

        let threads = {
            let mut guard = self.threads.lock().unwrap();
            mem::replace(&mut *guard, Vec::new())
        };
        for handle in threads {
            let _ = handle.join();
        }
        debug!("scheduler stopped");
    }

    /// Non-blocking submission of a root task. The returned ticket blocks
    /// on the root's completion flare and yields the result.
    pub fn submit<F>(&self, fut: F) -> Result<Ticket<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.state.load(Ordering::Acquire) {
            RUNNING => {}
            NEW => return Err(Error::NotRunning.into()),
            _ => return Err(Error::Terminated.into()),
        }

        self.shared.roots.increment();
        let parts = task::create_root(fut);
        let ticket = Ticket {
            root: parts.root,
            result: parts.result,
            free: parts.free,
            shared: self.shared.clone(),
        };

        let current = worker::current();
        unsafe {
            if !current.is_null() && (*current).belongs_to(&self.shared) {
                // Roots submitted from a worker stay local to it.
                (*current).push_root(parts.handle);
            } else {
                let n = self.shared.workers.len();
                let target = self.shared.round_robin.fetch_add(1, Ordering::Relaxed) % n;
                self.shared.workers[target].mailbox.push(parts.handle);
                self.shared.idle.notify_one();
            }
        }
        Ok(ticket)
    }

    /// Submits `fut` and blocks until it completes, returning its value or
    /// resuming the panic captured from the task tree. When called on a
    /// worker thread the wait runs the work-stealing loop instead of
    /// blocking it.
    ///
    /// Panics if the scheduler is not running.
    pub fn sync_wait<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.submit(fut) {
            Ok(ticket) => ticket.wait(),
            Err(err) => panic!("sync_wait: {}", err),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Completion handle for a submitted root.
pub struct Ticket<T> {
    root: *mut RootHeader,
    result: *mut Option<T>,
    free: unsafe fn(*mut RootHeader),
    shared: Arc<Shared>,
}

unsafe impl<T: Send> Send for Ticket<T> {}

impl<T> Ticket<T> {
    /// Blocks until the root completes; returns its value or resumes the
    /// captured panic on this thread.
    pub fn wait(self) -> T {
        let mut this = ManuallyDrop::new(self);
        unsafe {
            this.block();
            let payload = (*this.root).frame.panic.take();
            let value = (*this.result).take();
            (this.free)(this.root);
            if let Some(payload) = payload {
                panics::rethrow(payload);
            }
            value.expect("root task completed without a result")
        }
    }

    fn block(&self) {
        unsafe {
            let done = &(*self.root).done;
            let current = worker::current();
            if !current.is_null() && (*current).belongs_to(&self.shared) {
                (*current).wait_until(done);
            } else {
                done.wait(&self.shared.completions);
            }
        }
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        unsafe {
            self.block();
            if (*self.root).frame.panic.take().is_some() {
                warn!("discarding the panic of a task whose ticket was dropped");
            }
            (self.free)(self.root);
        }
    }
}
