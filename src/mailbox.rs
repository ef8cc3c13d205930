//! External submission mailboxes.
//!
//! A bounded queue would not do here: any number of submitters may target
//! the same worker at once. The mailbox is therefore an unbounded lock-free
//! intrusive list threaded through the frames' `link` field. Producers
//! splice a frame in with a single compare-and-swap on the head; a consumer
//! (the owning worker, or a thief helping out) takes the entire list in one
//! swap and processes it oldest-first.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use smallvec::SmallVec;

use crate::frame::{FrameHandle, FrameHeader};

pub struct Mailbox {
    head: AtomicPtr<FrameHeader>,
}

unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Splices `frame` at the head. Safe for any number of concurrent
    /// producers; never fails and never blocks.
    pub fn push(&self, frame: FrameHandle) {
        let node = frame.as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*node).link.store(head, Ordering::Relaxed);
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Takes the whole list in one swap. The spliced list is newest-first,
    /// so it is reversed before being handed back: submissions are resumed
    /// in the order they arrived.
    pub fn drain(&self) -> SmallVec<[FrameHandle; 8]> {
        let mut drained: SmallVec<[FrameHandle; 8]> = SmallVec::new();
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        while !node.is_null() {
            drained.push(unsafe { FrameHandle::from_ptr(node) });
            node = unsafe { (*node).link.load(Ordering::Relaxed) };
        }
        drained.reverse();
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::frame::test_support::dummy_frame;

    #[test]
    fn drains_oldest_first() {
        let mailbox = Mailbox::new();
        let frames: Vec<_> = (0..4).map(|_| dummy_frame()).collect();

        for frame in &frames {
            mailbox.push(unsafe { FrameHandle::from_ptr(&**frame as *const _ as *mut _) });
        }
        assert!(!mailbox.is_empty());

        let drained = mailbox.drain();
        assert!(mailbox.is_empty());
        assert_eq!(drained.len(), 4);
        for (frame, handle) in frames.iter().zip(drained.iter()) {
            assert_eq!(&**frame as *const FrameHeader as *mut _, handle.as_ptr());
        }
    }

    #[test]
    fn empty_drain() {
        let mailbox = Mailbox::new();
        assert!(mailbox.is_empty());
        assert!(mailbox.drain().is_empty());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let mailbox = Arc::new(Mailbox::new());
        let mut frames = Vec::new();
        for _ in 0..PRODUCERS {
            let batch: Vec<_> = (0..PER_PRODUCER).map(|_| dummy_frame()).collect();
            frames.push(batch);
        }

        let mut handles = Vec::new();
        for batch in &frames {
            let mailbox = mailbox.clone();
            let ptrs: Vec<usize> = batch
                .iter()
                .map(|f| &**f as *const FrameHeader as usize)
                .collect();
            handles.push(thread::spawn(move || {
                for p in ptrs {
                    mailbox.push(unsafe { FrameHandle::from_ptr(p as *mut FrameHeader) });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = mailbox.drain();
        assert_eq!(drained.len(), PRODUCERS * PER_PRODUCER);
        assert!(mailbox.is_empty());
    }
}
