//! Task frames.
//!
//! Every task owns exactly one frame. The header below is the first field of
//! every activation (`#[repr(C)]`), so the runtime can drive any task
//! through two erased function pointers without knowing its concrete future
//! type. The header also carries the whole join protocol state: the parent
//! back reference, the steal counter bumped by thieves, the join counter the
//! children decrement on completion, and the panic slot.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use log::warn;

use crate::stack::Stack;

/// How a frame was created, which decides its completion protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tag {
    /// Submitted from outside; completion fires the submitter's flare.
    Root,
    /// Spawned with `call`; completes synchronously, resumes the parent
    /// directly.
    Call,
    /// Spawned with `fork`; the parent became stealable and the join
    /// counter protocol applies.
    Fork,
}

/// What a single resume step of a frame produced, as reported back to the
/// worker loop that drives the state machine.
pub enum Stage {
    /// The task body ran to completion; its result has been written through
    /// the result slot.
    Done,
    /// Suspended at a fork: push the (now stealable) frame, run the child.
    Forked(FrameHandle),
    /// Suspended at a call: run the child without publishing the frame.
    Called(FrameHandle),
    /// Suspended at a join that could not complete inline.
    Joined,
    /// The body unwound; the payload rides the join path from here.
    Panicked(Box<dyn Any + Send>),
}

pub type ResumeFn = unsafe fn(*mut FrameHeader) -> Stage;
pub type DestroyFn = unsafe fn(*mut FrameHeader);

#[repr(C)]
pub struct FrameHeader {
    pub resume_fn: ResumeFn,
    pub destroy_fn: DestroyFn,
    /// Enclosing frame; null for roots. Non-owning back reference.
    pub parent: *mut FrameHeader,
    /// The async stack holding this activation; null for heap-allocated
    /// roots. The activation never moves off it.
    pub stack: *mut Stack,
    /// Allocation point before this frame was placed: retracting the stack
    /// to `base` frees the frame's storage.
    pub base: *mut u8,
    /// Allocation point immediately after this activation, i.e. where this
    /// frame's children go. A join resume retracts the stack here.
    pub stack_top: *mut u8,
    /// Hand-over slot: the worker that discovers this (stolen) frame at the
    /// base of its current stack parks the stack here before it moves on;
    /// the worker that resumes the frame at its join adopts it. Ordered by
    /// the release/acquire pair on `join`.
    pub saved_stack: AtomicPtr<Stack>,
    /// Incremented only by a thief at the moment of stealing; reset when a
    /// join completes. Zero at a join is the no-atomics fast path.
    pub steals: AtomicI32,
    /// One sentinel (owned by the frame itself, spent when it suspends at a
    /// join) plus the number of outstanding forked children. The thread
    /// whose decrement reaches zero resumes the frame.
    pub join: AtomicI32,
    pub panic: PanicSlot,
    /// Intrusive link used while the frame sits in a submission mailbox.
    pub link: AtomicPtr<FrameHeader>,
    pub tag: Tag,
    /// Set when the body unwound with children still outstanding; the frame
    /// then completes through the join protocol without being polled again.
    pub poisoned: Cell<bool>,
}

impl FrameHeader {
    pub fn new(
        resume_fn: ResumeFn,
        destroy_fn: DestroyFn,
        tag: Tag,
        parent: *mut FrameHeader,
        stack: *mut Stack,
        base: *mut u8,
        stack_top: *mut u8,
    ) -> FrameHeader {
        FrameHeader {
            resume_fn,
            destroy_fn,
            parent,
            stack,
            base,
            stack_top,
            saved_stack: AtomicPtr::new(ptr::null_mut()),
            steals: AtomicI32::new(0),
            join: AtomicI32::new(1),
            panic: PanicSlot::new(),
            link: AtomicPtr::new(ptr::null_mut()),
            tag,
            poisoned: Cell::new(false),
        }
    }

    pub fn root(resume_fn: ResumeFn, destroy_fn: DestroyFn) -> FrameHeader {
        FrameHeader::new(
            resume_fn,
            destroy_fn,
            Tag::Root,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    }

    /// Back to the rest state after a join completed. Only called while the
    /// frame has a single owner again.
    pub fn reset_join_state(&self) {
        self.steals.store(0, Ordering::Relaxed);
        self.join.store(1, Ordering::Relaxed);
    }
}

/// A copyable reference to a frame, the element type of deques and
/// mailboxes. The pointee is pinned for the frame's whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameHandle(NonNull<FrameHeader>);

unsafe impl Send for FrameHandle {}

impl FrameHandle {
    /// # Safety
    /// `frame` must be non-null.
    pub unsafe fn from_ptr(frame: *mut FrameHeader) -> FrameHandle {
        FrameHandle(NonNull::new_unchecked(frame))
    }

    pub fn as_ptr(self) -> *mut FrameHeader {
        self.0.as_ptr()
    }
}

/// At-most-one panic payload captured from a frame's descendants. The first
/// panic wins the slot; panics from other siblings are dropped with a log
/// entry, so the enclosing join surfaces a deterministic single failure.
pub struct PanicSlot {
    slot: AtomicPtr<Box<dyn Any + Send>>,
}

impl PanicSlot {
    pub fn new() -> PanicSlot {
        PanicSlot {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Thread-safe setter; may race with sibling completions.
    pub fn set(&self, payload: Box<dyn Any + Send>) {
        let boxed = Box::into_raw(Box::new(payload));
        match self.slot.compare_exchange(
            ptr::null_mut(),
            boxed,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => {}
            Err(_) => {
                warn!("dropping sibling panic: another task in the scope failed first");
                unsafe {
                    drop(Box::from_raw(boxed));
                }
            }
        }
    }

    /// Single reader, at the join point.
    pub fn take(&self) -> Option<Box<dyn Any + Send>> {
        let raw = self.slot.swap(ptr::null_mut(), Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            Some(unsafe { *Box::from_raw(raw) })
        }
    }

    pub fn is_set(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }
}

impl Drop for PanicSlot {
    fn drop(&mut self) {
        if let Some(payload) = self.take() {
            drop(payload);
        }
    }
}

/// Parent-owned storage a forked or called child writes its result into.
/// The write happens before the child decrements the parent's join counter,
/// and the parent reads only after the matching join, so `take` after
/// `join().await` always observes the value.
pub struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    written: AtomicBool,
}

// One writer (the child, through a raw pointer) followed by one reader (the
// parent, after the join edge). The flag swap in `take` keeps even a misuse
// from doubling the value out.
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for Slot<T> {}

impl<T> Slot<T> {
    pub fn new() -> Slot<T> {
        Slot {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            written: AtomicBool::new(false),
        }
    }

    /// Moves the result out. Panics if no child has written the slot, which
    /// happens when it is read before the matching `join` or after the
    /// producing child panicked.
    pub fn take(&self) -> T {
        assert!(
            self.written.swap(false, Ordering::Acquire),
            "result slot is empty: `take` before the matching join, or the child failed"
        );
        unsafe { (*self.value.get()).as_ptr().read() }
    }

    pub(crate) unsafe fn put(&self, value: T) {
        (*self.value.get()).as_mut_ptr().write(value);
        self.written.store(true, Ordering::Release);
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::new()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if *self.written.get_mut() {
            unsafe {
                ptr::drop_in_place((*self.value.get()).as_mut_ptr());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    unsafe fn nop_resume(_: *mut FrameHeader) -> Stage {
        Stage::Done
    }

    unsafe fn nop_destroy(_: *mut FrameHeader) {}

    pub fn dummy_frame() -> Box<FrameHeader> {
        Box::new(FrameHeader::root(nop_resume, nop_destroy))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn slot_round_trip() {
        let slot = Slot::new();
        unsafe { slot.put(42u64) };
        assert_eq!(slot.take(), 42);
    }

    #[test]
    #[should_panic(expected = "result slot is empty")]
    fn slot_take_before_write() {
        let slot: Slot<u64> = Slot::new();
        slot.take();
    }

    #[test]
    fn slot_drops_unclaimed_value() {
        let marker = Arc::new(());
        let slot = Slot::new();
        unsafe { slot.put(marker.clone()) };
        drop(slot);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn panic_slot_first_wins() {
        let slot = Arc::new(PanicSlot::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let slot = slot.clone();
            handles.push(thread::spawn(move || {
                slot.set(Box::new(i));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let payload = slot.take().expect("one payload must survive");
        let value = payload.downcast::<i32>().unwrap();
        assert!(*value >= 0 && *value < 8);
        assert!(slot.take().is_none());
    }
}
