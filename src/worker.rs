//! Worker threads and the resume protocol.
//!
//! Each worker owns a Chase-Lev deque of stealable continuations, shares a
//! submission mailbox, and carries one async stack at a time. The loop is
//! the standard thief cycle: drain the own mailbox, pop the own deque,
//! otherwise pick a random victim and try to steal; after enough empty
//! scans, park on the pool-wide event-count. The interesting part is
//! `finish`, which implements the continuation-stealing join protocol and
//! the stack hand-over that goes with it.

use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, trace};

use crate::deque::{Deque, Steal, Stealer};
use crate::frame::{FrameHandle, FrameHeader, Stage, Tag};
use crate::mailbox::Mailbox;
use crate::panics::{self, FatalGuard, PanicPayload};
use crate::settings::Settings;
use crate::stack::Stack;
use crate::sync::{CountLatch, EventCount, Flare};
use crate::task::{destroy_stack, resume_stack, RootHeader, StackActivation};

/// Consecutive `Abort` results tolerated on one victim before moving on.
const STEAL_RETRIES: usize = 4;

/// State shared between the scheduler handle and every worker.
pub(crate) struct Shared {
    pub workers: Vec<WorkerInfo>,
    /// Pool-wide event-count slot the thieves park on. Every deque push and
    /// every submission notifies it.
    pub idle: EventCount,
    /// Event-count behind the completion flares: root tickets and the
    /// start handshake block here, away from the thieves' wake traffic.
    pub completions: EventCount,
    pub stop: AtomicBool,
    /// Outstanding root frames; shutdown drains this before the stop flag
    /// goes up.
    pub roots: CountLatch,
    pub round_robin: AtomicUsize,
    pub settings: Settings,
}

pub(crate) struct WorkerInfo {
    pub stealer: Stealer<FrameHandle>,
    pub mailbox: Mailbox,
    pub primed: Flare,
}

/// What the frame being polled suspended for; written by the awaitables in
/// `task.rs`, consumed right after the poll returns.
pub(crate) enum PendingOp {
    None,
    Fork(FrameHandle),
    Call(FrameHandle),
    Join,
}

pub(crate) struct WorkerThread {
    shared: Arc<Shared>,
    index: usize,
    deque: Deque<FrameHandle>,
    /// Current async stack; children are allocated here. Swapped out when
    /// the stack is handed to a stolen continuation.
    stack: Cell<*mut Stack>,
    /// One cached clean stack so hand-overs do not always hit the allocator.
    spare: Cell<*mut Stack>,
    /// The frame currently being polled.
    active: Cell<*mut FrameHeader>,
    pending: Cell<PendingOp>,
    victims: VictimPicker,
}

// The worker thread state never leaves its thread; other threads only reach
// it through `Shared`.
thread_local! {
    static CURRENT: Cell<*const WorkerThread> = Cell::new(ptr::null());
}

pub(crate) fn current() -> *const WorkerThread {
    CURRENT.with(|c| c.get())
}

pub(crate) fn expect_current(op: &str) -> *const WorkerThread {
    let worker = current();
    assert!(
        !worker.is_null(),
        "`{}` may only be awaited inside a task body running on a scheduler",
        op
    );
    worker
}

unsafe fn set_current(worker: *const WorkerThread) {
    CURRENT.with(|c| {
        debug_assert!(c.get().is_null());
        c.set(worker);
    });
}

fn clear_current() {
    CURRENT.with(|c| c.set(ptr::null()));
}

/// Translates the pending cell into the stage reported to the resume loop.
pub(crate) fn take_stage() -> Stage {
    let worker = current();
    debug_assert!(!worker.is_null());
    match unsafe { (*worker).pending.replace(PendingOp::None) } {
        PendingOp::Fork(child) => Stage::Forked(child),
        PendingOp::Call(child) => Stage::Called(child),
        PendingOp::Join => Stage::Joined,
        PendingOp::None => {
            // A task awaited something that is not a runtime operation.
            panics::fatal("task suspended outside fork/call/join; foreign futures are not supported")
        }
    }
}

/// Entry point of a worker thread.
pub(crate) fn main_loop(shared: Arc<Shared>, index: usize, deque: Deque<FrameHandle>) {
    let worker = WorkerThread {
        stack: Cell::new(Stack::create(shared.settings.stack_size)),
        spare: Cell::new(ptr::null_mut()),
        active: Cell::new(ptr::null_mut()),
        pending: Cell::new(PendingOp::None),
        victims: VictimPicker::new(),
        shared,
        index,
        deque,
    };

    unsafe { set_current(&worker) };
    if let Some(hook) = worker.shared.settings.affinity.clone() {
        hook(index);
    }
    worker.shared.workers[index].primed.fire(&worker.shared.completions);
    debug!("worker {} up", index);

    worker.run();

    clear_current();
    unsafe {
        Stack::destroy(worker.stack.get());
        let spare = worker.spare.get();
        if !spare.is_null() {
            Stack::destroy(spare);
        }
    }
    debug!("worker {} down", index);
}

impl WorkerThread {
    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    pub(crate) fn active(&self) -> *mut FrameHeader {
        self.active.get()
    }

    pub(crate) fn set_pending_fork(&self, child: FrameHandle) {
        self.pending.set(PendingOp::Fork(child));
    }

    pub(crate) fn set_pending_call(&self, child: FrameHandle) {
        self.pending.set(PendingOp::Call(child));
    }

    pub(crate) fn set_pending_join(&self) {
        self.pending.set(PendingOp::Join);
    }

    fn mailbox(&self) -> &Mailbox {
        &self.shared.workers[self.index].mailbox
    }

    /// Places a child activation on the current stack and links it under
    /// the frame being polled. Forked children raise the parent's join
    /// counter before the parent becomes stealable.
    pub(crate) unsafe fn allocate_child<W>(&self, fut: W, tag: Tag) -> FrameHandle
    where
        W: Future<Output = ()> + Send,
    {
        let parent = self.active.get();
        debug_assert!(!parent.is_null());

        let stack = self.stack.get();
        let base = (*stack).checkpoint();
        let raw = (*stack).allocate(std::alloc::Layout::new::<StackActivation<W>>())
            as *mut StackActivation<W>;
        let stack_top = (*stack).checkpoint();

        ptr::write(
            raw,
            StackActivation {
                header: FrameHeader::new(
                    resume_stack::<W>,
                    destroy_stack::<W>,
                    tag,
                    parent,
                    stack,
                    base,
                    stack_top,
                ),
                future: ManuallyDrop::new(fut),
            },
        );

        if tag == Tag::Fork {
            (*parent).join.fetch_add(1, Ordering::Relaxed);
        }

        FrameHandle::from_ptr(raw as *mut FrameHeader)
    }

    /// Accepts a root submitted from this worker thread. It goes through
    /// the own mailbox rather than straight onto the deque: the deque holds
    /// the depth-first chain of stolen-from continuations, and a root
    /// spliced into the middle of it would be popped where the chain
    /// expects its parent. The mailbox is drained first thing every round,
    /// so the root is picked up just as promptly.
    pub(crate) fn push_root(&self, handle: FrameHandle) {
        self.mailbox().push(handle);
        self.shared.idle.notify_one();
    }

    // -----------------------------------------------------------------------
    // The worker loop
    // -----------------------------------------------------------------------

    fn run(&self) {
        let mut idle = 0u32;
        loop {
            if self.tick() {
                idle = 0;
                continue;
            }
            if self.should_exit() {
                return;
            }
            idle += 1;
            if idle <= self.shared.settings.park_patience {
                self.backoff(idle);
                continue;
            }
            idle = 0;

            // Park sequence: announce, re-scan everything, then sleep.
            let token = self.shared.idle.prepare_wait();
            if self.work_available() || self.shared.stop.load(Ordering::Acquire) {
                self.shared.idle.cancel_wait();
                continue;
            }
            trace!("worker {} parking", self.index);
            self.shared.idle.wait(token);
        }
    }

    /// One scheduling round: mailbox, own deque, then a steal attempt.
    /// Returns true when any frame was resumed.
    fn tick(&self) -> bool {
        self.find_work(true)
    }

    /// `pop_own` is false while a task on this worker is blocked in a
    /// nested wait: the deque then still holds the ancestors of the blocked
    /// chain, and popping one would resume a frame whose forked child is
    /// live further up the native call stack.
    fn find_work(&self, pop_own: bool) -> bool {
        let mut resumed = false;
        for handle in self.mailbox().drain() {
            unsafe { self.execute(handle.as_ptr()) };
            resumed = true;
        }
        if pop_own {
            if let Some(handle) = self.deque.pop() {
                unsafe { self.execute(handle.as_ptr()) };
                return true;
            }
        }
        if resumed {
            return true;
        }
        self.try_steal()
    }

    fn should_exit(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
            && self.deque.is_empty()
            && self.mailbox().is_empty()
    }

    fn work_available(&self) -> bool {
        if !self.deque.is_empty() || !self.mailbox().is_empty() {
            return true;
        }
        self.shared.workers.iter().enumerate().any(|(i, info)| {
            i != self.index && (!info.stealer.is_empty() || !info.mailbox.is_empty())
        })
    }

    fn backoff(&self, round: u32) {
        let cap = 1usize << round.min(6);
        for _ in 0..=self.victims.jitter(cap) {
            std::hint::spin_loop();
        }
        if round > 8 {
            thread::yield_now();
        }
    }

    /// Tries one random victim: its deque first, then its mailbox.
    fn try_steal(&self) -> bool {
        let n = self.shared.workers.len();
        if n <= 1 {
            return false;
        }

        let victim = self.victims.pick(n, self.index);
        let info = &self.shared.workers[victim];

        for _ in 0..STEAL_RETRIES {
            match info.stealer.steal() {
                Steal::Success(handle) => unsafe {
                    let frame = handle.as_ptr();
                    (*frame).steals.fetch_add(1, Ordering::Relaxed);
                    debug_assert!((*self.stack.get()).is_clean());
                    trace!("worker {} stole a continuation from {}", self.index, victim);
                    self.execute(frame);
                    return true;
                },
                Steal::Abort => continue,
                Steal::Empty => break,
            }
        }

        // Help with the victim's submissions: take the whole list, run the
        // oldest, re-mail the rest to ourselves. The deque is no place for
        // them; it is reserved for the depth-first continuation chain.
        let mut drained = self.mailbox_of(victim).drain().into_iter();
        if let Some(first) = drained.next() {
            for handle in drained {
                self.mailbox().push(handle);
                self.shared.idle.notify_one();
            }
            unsafe { self.execute(first.as_ptr()) };
            return true;
        }
        false
    }

    fn mailbox_of(&self, index: usize) -> &Mailbox {
        &self.shared.workers[index].mailbox
    }

    // -----------------------------------------------------------------------
    // The resume protocol
    // -----------------------------------------------------------------------

    /// Drives a frame (and the chain of children and resumed parents it
    /// leads to) until the chain suspends or bottoms out.
    pub(crate) unsafe fn execute(&self, frame: *mut FrameHeader) {
        let mut frame = frame;
        loop {
            self.active.set(frame);
            let stage = ((*frame).resume_fn)(frame);
            self.active.set(ptr::null_mut());

            let next = match stage {
                Stage::Forked(child) => {
                    // Child-first: the parent becomes stealable, the child
                    // runs right away on this worker.
                    self.deque.push(FrameHandle::from_ptr(frame));
                    self.shared.idle.notify_one();
                    Some(child.as_ptr())
                }
                Stage::Called(child) => Some(child.as_ptr()),
                Stage::Joined => self.decrement_join(frame),
                Stage::Done => self.finish(frame, None),
                Stage::Panicked(payload) => self.finish(frame, Some(payload)),
            };

            match next {
                Some(resumable) => frame = resumable,
                None => return,
            }
        }
    }

    /// Completion protocol for a frame whose body returned (or unwound).
    /// Returns the next frame to resume on this worker, if any.
    unsafe fn finish(
        &self,
        frame: *mut FrameHeader,
        mut panic: Option<PanicPayload>,
    ) -> Option<*mut FrameHeader> {
        if let Some(payload) = panic.take() {
            if !(*frame).poisoned.get() && (*frame).steals.load(Ordering::Relaxed) > 0 {
                // The body unwound while forked children may still be
                // running elsewhere, and their result slots live inside
                // this activation. The frame cannot be destroyed yet; park
                // the payload and complete through the join protocol.
                trace!("frame poisoned on worker {}", self.index);
                (*frame).poisoned.set(true);
                (*frame).panic.set(payload);
                return self.decrement_join(frame);
            }
            match (*frame).tag {
                Tag::Root => (*frame).panic.set(payload),
                _ => (*(*frame).parent).panic.set(payload),
            }
        }

        debug_assert_eq!(
            (*frame).join.load(Ordering::Relaxed),
            1,
            "task returned with forked children it never joined"
        );

        // All descendants are done; drop the future state in place. The
        // memory itself is stack storage and is reclaimed by the retraction
        // below or by an ancestor's resume.
        {
            let guard = FatalGuard("task state destructor panicked during frame completion");
            ((*frame).destroy_fn)(frame);
            guard.disarm();
        }

        debug_assert!((*frame).saved_stack.load(Ordering::Relaxed).is_null());

        match (*frame).tag {
            Tag::Root => {
                trace!("root completed on worker {}", self.index);
                let root = frame as *mut RootHeader;
                (*root).done.fire(&self.shared.completions);
                // Past the flare the submitter may free the frame; it must
                // not be touched again. Workers waiting out a nested root
                // park on the idle slot, so poke that too.
                self.shared.idle.notify_all();
                self.shared.roots.set();
                None
            }
            Tag::Call => {
                let parent = (*frame).parent;
                self.release_frame(frame);
                Some(parent)
            }
            Tag::Fork => {
                let parent = (*frame).parent;
                self.release_frame(frame);
                if let Some(handle) = self.deque.pop() {
                    // Depth-first execution keeps the parent at the bottom
                    // of the deque; if it is still there, nobody stole it
                    // and it resumes right here, cache-hot. Its sentinel is
                    // untouched (the parent has not reached the join), so
                    // the decrement cannot race a resume.
                    debug_assert_eq!(handle.as_ptr(), parent);
                    let joins = (*parent).join.fetch_sub(1, Ordering::Relaxed);
                    debug_assert!(joins > 1);
                    Some(handle.as_ptr())
                } else {
                    // The continuation was stolen. Hand our stack over if
                    // the parent lives at the base of it, then count this
                    // child out; the last one in resumes the parent.
                    self.relinquish_to(parent);
                    self.decrement_join(parent)
                }
            }
        }
    }

    /// Spends one unit of the frame's join counter. The thread that takes
    /// the counter to zero owns the resume: it adopts the frame's parked
    /// stack and continues it (continuation stealing).
    unsafe fn decrement_join(&self, frame: *mut FrameHeader) -> Option<*mut FrameHeader> {
        let joins = (*frame).join.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(joins >= 0);
        if joins == 0 {
            self.adopt_saved(frame);
            Some(frame)
        } else {
            None
        }
    }

    /// If the (stolen) continuation `parent` lives on our current stack, we
    /// cannot keep allocating on it: park the stack in the frame's
    /// bookkeeping, where the resuming worker will pick it up, and continue
    /// on a fresh one.
    unsafe fn relinquish_to(&self, parent: *mut FrameHeader) {
        debug_assert!(!parent.is_null());
        let current = self.stack.get();
        if (*parent).stack == current {
            trace!(
                "worker {} hands its stack to a stolen continuation",
                self.index
            );
            let previous = (*parent).saved_stack.swap(current, Ordering::Release);
            debug_assert!(previous.is_null());
            self.stack.set(self.fresh_stack());
        }
    }

    /// Takes over the stack a resumed frame lives on, retracting it to the
    /// frame's own allocation point. Our current stack is clean at this
    /// point and goes into the spare slot.
    unsafe fn adopt_saved(&self, frame: *mut FrameHeader) {
        let saved = (*frame).saved_stack.swap(ptr::null_mut(), Ordering::Acquire);
        if !saved.is_null() {
            debug_assert_eq!(saved, (*frame).stack);
            let retired = self.stack.replace(saved);
            debug_assert!((*retired).is_clean());
            self.park_spare(retired);
            (*saved).release_to((*frame).stack_top);
        }
    }

    /// Returns a frame's storage to its stack when it is the most recent
    /// allocation on it. Otherwise the region is reclaimed wholesale when
    /// an ancestor living below it resumes.
    unsafe fn release_frame(&self, frame: *mut FrameHeader) {
        let stack = (*frame).stack;
        if !stack.is_null() && (*stack).checkpoint() == (*frame).stack_top {
            (*stack).release_to((*frame).base);
        }
    }

    fn fresh_stack(&self) -> *mut Stack {
        let spare = self.spare.replace(ptr::null_mut());
        if !spare.is_null() {
            return spare;
        }
        Stack::create(self.shared.settings.stack_size)
    }

    unsafe fn park_spare(&self, stack: *mut Stack) {
        let evicted = self.spare.replace(stack);
        if !evicted.is_null() {
            Stack::destroy(evicted);
        }
    }

    /// Runs the work-stealing loop until `done` fires. Used when a worker
    /// thread itself blocks on a root (nested `sync_wait`), so the thread
    /// keeps contributing instead of stalling the pool.
    pub(crate) unsafe fn wait_until(&self, done: &Flare) {
        let active = self.active.replace(ptr::null_mut());
        let pending = self.pending.replace(PendingOp::None);
        // Work picked up during the wait must not allocate above the
        // blocked chain's frames: a later retraction around those frames
        // would sweep the newcomers away. The nested work runs on a stack
        // of its own; the blocked chain's stack is reinstated on exit.
        let outer = self.stack.replace(self.fresh_stack());

        while !done.peek() {
            if self.find_work(false) {
                continue;
            }
            let token = self.shared.idle.prepare_wait();
            if done.peek() || self.work_available() {
                self.shared.idle.cancel_wait();
                continue;
            }
            self.shared.idle.wait(token);
        }

        let nested = self.stack.replace(outer);
        debug_assert!((*nested).is_clean());
        self.park_spare(nested);

        self.active.set(active);
        self.pending.set(pending);
    }
}

/// Victim selection for the thief loop. Choosing whom to rob is the only
/// consumer of randomness in the runtime, so the generator and the index
/// mapping live together: a per-worker xoroshiro128++ stream drives a
/// uniform pick over the other workers, plus the jitter for the scan
/// backoff.
struct VictimPicker {
    s0: Cell<u64>,
    s1: Cell<u64>,
}

impl VictimPicker {
    fn new() -> VictimPicker {
        VictimPicker {
            s0: Cell::new(entropy()),
            s1: Cell::new(entropy()),
        }
    }

    /// A worker index in `0..count` that is never `home`. `count` must be
    /// at least two.
    fn pick(&self, count: usize, home: usize) -> usize {
        debug_assert!(count > 1);
        let mut victim = (self.next() % (count - 1) as u64) as usize;
        if victim >= home {
            victim += 1;
        }
        victim
    }

    /// Spin budget in `0..bound` for the backoff between empty scans.
    fn jitter(&self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }

    // xoroshiro128++
    fn next(&self) -> u64 {
        let s0 = self.s0.get();
        let mut s1 = self.s1.get();
        let out = s0.wrapping_add(s1).rotate_left(17).wrapping_add(s0);

        s1 ^= s0;
        self.s0.set(s0.rotate_left(49) ^ s1 ^ (s1 << 21));
        self.s1.set(s1.rotate_left(28));
        out
    }
}

/// Per-worker entropy: `RandomState` draws fresh OS randomness for every
/// instance. The low bit is pinned so the generator state can never be all
/// zero.
fn entropy() -> u64 {
    RandomState::new().build_hasher().finish() | 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn picker_skips_home_and_stays_in_range() {
        let picker = VictimPicker::new();
        for _ in 0..1000 {
            let victim = picker.pick(4, 2);
            assert!(victim < 4);
            assert_ne!(victim, 2);
        }
    }

    #[test]
    fn picker_reaches_every_victim() {
        let picker = VictimPicker::new();
        let mut seen = [false; 4];
        for _ in 0..1000 {
            seen[picker.pick(4, 3)] = true;
        }
        assert_eq!(seen, [true, true, true, false]);
    }

    #[test]
    fn jitter_stays_under_bound() {
        let picker = VictimPicker::new();
        for _ in 0..1000 {
            assert!(picker.jitter(64) < 64);
        }
    }
}
