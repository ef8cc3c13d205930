//! The task state machine: activations, and the `fork`/`call`/`join`
//! operations task bodies await.
//!
//! A task body is an `async fn`. The compiler turns it into a state machine
//! we place behind a [`FrameHeader`] on an async stack (or on the heap for
//! roots), and the worker loop drives it through the erased `resume_fn`.
//! The awaitables below never use the `Waker`; they record what the frame
//! suspended for in the current worker's pending cell, and the worker picks
//! the protocol from there. Awaiting anything else inside a task body is
//! not supported.

use std::cell::UnsafeCell;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::frame::{FrameHandle, FrameHeader, Slot, Stage, Tag};
use crate::panics;
use crate::sync::Flare;
use crate::worker;

// ---------------------------------------------------------------------------
// Polling plumbing
// ---------------------------------------------------------------------------

// Tasks are resumed by the scheduler, never by a reactor, so the waker does
// nothing.
fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

unsafe fn poisoned_stage(header: *mut FrameHeader) -> Stage {
    // All children have joined by the time a poisoned frame is resumed.
    (*header).reset_join_state();
    let payload = (*header)
        .panic
        .take()
        .expect("poisoned frame resumed without a stored panic");
    Stage::Panicked(payload)
}

// ---------------------------------------------------------------------------
// Stack activations
// ---------------------------------------------------------------------------

/// A forked or called child as it lives on an async stack: the frame header
/// followed by the (result-writing) future.
#[repr(C)]
pub(crate) struct StackActivation<W: Future<Output = ()>> {
    pub header: FrameHeader,
    pub future: ManuallyDrop<W>,
}

pub(crate) unsafe fn resume_stack<W: Future<Output = ()>>(raw: *mut FrameHeader) -> Stage {
    if (*raw).poisoned.get() {
        return poisoned_stage(raw);
    }

    let act = raw as *mut StackActivation<W>;
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let future = Pin::new_unchecked(&mut *(*act).future);

    match panics::capture(move || future.poll(&mut cx)) {
        Ok(Poll::Ready(())) => Stage::Done,
        Ok(Poll::Pending) => worker::take_stage(),
        Err(payload) => Stage::Panicked(payload),
    }
}

pub(crate) unsafe fn destroy_stack<W: Future<Output = ()>>(raw: *mut FrameHeader) {
    let act = raw as *mut StackActivation<W>;
    ManuallyDrop::drop(&mut (*act).future);
}

/// Wraps a task body so that its return value lands in the parent's slot
/// before the frame reports completion.
pub(crate) struct WriteBack<T, F: Future<Output = T>> {
    out: *const Slot<T>,
    fut: F,
}

// The slot pointer targets parent-owned storage that outlives the child;
// the activation migrates between workers with the usual steal/resume
// synchronization.
unsafe impl<T: Send, F: Future<Output = T> + Send> Send for WriteBack<T, F> {}

impl<T, F: Future<Output = T>> Future for WriteBack<T, F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        unsafe {
            let this = self.get_unchecked_mut();
            match Pin::new_unchecked(&mut this.fut).poll(cx) {
                Poll::Ready(value) => {
                    (*this.out).put(value);
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Root activations
// ---------------------------------------------------------------------------

/// Fixed-layout prefix of every root activation, so the worker can fire the
/// completion flare without knowing the concrete future type.
#[repr(C)]
pub(crate) struct RootHeader {
    pub frame: FrameHeader,
    pub done: Flare,
}

#[repr(C)]
struct RootActivation<F: Future> {
    root: RootHeader,
    result: UnsafeCell<Option<F::Output>>,
    future: ManuallyDrop<F>,
}

unsafe fn resume_root<F: Future>(raw: *mut FrameHeader) -> Stage {
    if (*raw).poisoned.get() {
        return poisoned_stage(raw);
    }

    let act = raw as *mut RootActivation<F>;
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let future = Pin::new_unchecked(&mut *(*act).future);

    match panics::capture(move || future.poll(&mut cx)) {
        Ok(Poll::Ready(value)) => {
            *(*act).result.get() = Some(value);
            Stage::Done
        }
        Ok(Poll::Pending) => worker::take_stage(),
        Err(payload) => Stage::Panicked(payload),
    }
}

unsafe fn destroy_root<F: Future>(raw: *mut FrameHeader) {
    let act = raw as *mut RootActivation<F>;
    ManuallyDrop::drop(&mut (*act).future);
}

unsafe fn free_root<F: Future>(root: *mut RootHeader) {
    drop(Box::from_raw(root as *mut RootActivation<F>));
}

/// Raw pieces of a freshly boxed root frame, wrapped into a `Ticket` by the
/// scheduler. The box is freed through `free` by whoever holds the ticket,
/// strictly after the completion flare has fired.
pub(crate) struct RootParts<T> {
    pub handle: FrameHandle,
    pub root: *mut RootHeader,
    pub result: *mut Option<T>,
    pub free: unsafe fn(*mut RootHeader),
}

pub(crate) fn create_root<F>(fut: F) -> RootParts<F::Output>
where
    F: Future,
{
    let act = Box::new(RootActivation {
        root: RootHeader {
            frame: FrameHeader::root(resume_root::<F>, destroy_root::<F>),
            done: Flare::new(),
        },
        result: UnsafeCell::new(None),
        future: ManuallyDrop::new(fut),
    });
    let raw = Box::into_raw(act);
    unsafe {
        RootParts {
            handle: FrameHandle::from_ptr(raw as *mut FrameHeader),
            root: raw as *mut RootHeader,
            result: (*raw).result.get(),
            free: free_root::<F>,
        }
    }
}

// ---------------------------------------------------------------------------
// fork / call / join
// ---------------------------------------------------------------------------

/// Schedules `task` as a child of the current frame and begins executing it
/// immediately; the *parent* becomes stealable in the meantime. The child
/// writes its result into `slot`, readable after the matching [`join`].
///
/// `task` is a factory rather than a future so that recursive task bodies
/// stay finitely sized; it runs on the first poll of the returned awaitable.
///
/// Panics when awaited outside a task body.
pub fn fork<'s, T, C, F>(slot: &'s Slot<T>, task: C) -> ForkAwait<'s, T, C>
where
    C: FnOnce() -> F + Send,
    F: Future<Output = T> + Send,
    T: Send,
{
    ForkAwait {
        slot,
        task: Some(task),
        forked: false,
    }
}

pub struct ForkAwait<'s, T, C> {
    slot: &'s Slot<T>,
    task: Option<C>,
    forked: bool,
}

impl<'s, T, C, F> Future for ForkAwait<'s, T, C>
where
    C: FnOnce() -> F + Send,
    F: Future<Output = T> + Send,
    T: Send,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        unsafe {
            let this = self.get_unchecked_mut();
            if this.forked {
                // The child ran (or is running elsewhere); control is back.
                return Poll::Ready(());
            }
            this.forked = true;

            let worker = worker::expect_current("fork");
            let fut = this.task.take().expect("fork polled twice before dispatch")();
            let child = (*worker).allocate_child(
                WriteBack {
                    out: this.slot as *const Slot<T>,
                    fut,
                },
                Tag::Fork,
            );
            (*worker).set_pending_fork(child);
            Poll::Pending
        }
    }
}

/// Invokes `task` as a child of the current frame with no opportunity for
/// stealing: the child (and its entire subtree) completes before control
/// returns to the parent. Cheaper than [`fork`] when the parent has nothing
/// else to run in the meantime.
pub fn call<'s, T, C, F>(slot: &'s Slot<T>, task: C) -> CallAwait<'s, T, C>
where
    C: FnOnce() -> F + Send,
    F: Future<Output = T> + Send,
    T: Send,
{
    CallAwait {
        slot,
        task: Some(task),
        called: false,
    }
}

pub struct CallAwait<'s, T, C> {
    slot: &'s Slot<T>,
    task: Option<C>,
    called: bool,
}

impl<'s, T, C, F> Future for CallAwait<'s, T, C>
where
    C: FnOnce() -> F + Send,
    F: Future<Output = T> + Send,
    T: Send,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        unsafe {
            let this = self.get_unchecked_mut();
            if this.called {
                // The called child finished. If it failed and no forked
                // sibling is still outstanding, surface the panic here;
                // otherwise it stays parked for the next join.
                let worker = worker::expect_current("call");
                let frame = (*worker).active();
                if (*frame).panic.is_set() && (*frame).join.load(Ordering::Acquire) == 1 {
                    if let Some(payload) = (*frame).panic.take() {
                        panics::rethrow(payload);
                    }
                }
                return Poll::Ready(());
            }
            this.called = true;

            let worker = worker::expect_current("call");
            let fut = this.task.take().expect("call polled twice before dispatch")();
            let child = (*worker).allocate_child(
                WriteBack {
                    out: this.slot as *const Slot<T>,
                    fut,
                },
                Tag::Call,
            );
            (*worker).set_pending_call(child);
            Poll::Pending
        }
    }
}

/// Waits until every child forked by the current frame since the last join
/// has completed, then rethrows the first panic captured from them, if any.
/// When nothing was stolen this is a handful of loads and continues inline.
pub fn join() -> JoinAwait {
    JoinAwait { joined: false }
}

pub struct JoinAwait {
    joined: bool,
}

impl Future for JoinAwait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        unsafe {
            let worker = worker::expect_current("join");
            let frame = (*worker).active();

            if !self.joined {
                self.joined = true;

                if (*frame).steals.load(Ordering::Relaxed) == 0 {
                    // Never stolen since the last join: strict depth-first
                    // execution means every forked child already returned.
                    debug_assert_eq!((*frame).join.load(Ordering::Relaxed), 1);
                    rethrow_if_captured(frame);
                    return Poll::Ready(());
                }

                (*worker).set_pending_join();
                return Poll::Pending;
            }

            // Resumed by the worker whose decrement closed the scope.
            (*frame).reset_join_state();
            rethrow_if_captured(frame);
            Poll::Ready(())
        }
    }
}

unsafe fn rethrow_if_captured(frame: *mut FrameHeader) {
    if let Some(payload) = (*frame).panic.take() {
        panics::rethrow(payload);
    }
}
