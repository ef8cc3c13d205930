//! A lock-free Chase-Lev deque.
//!
//! Each worker owns one deque and is the only thread that may `push` and
//! `pop` at the bottom; every other worker holds a [`Stealer`] and takes
//! elements from the top. The orderings follow the C11 formulation of the
//! algorithm ("Correct and Efficient Work-Stealing for Weak Memory Models"):
//! a successful steal acquires the matching push, and a racing `pop`/`steal`
//! on the last element is resolved by a compare-and-swap on `top` so that
//! exactly one side wins.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

/// Outcome of a steal attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The deque was observed empty.
    Empty,
    /// Lost a race against the owner or another thief; worth retrying.
    Abort,
    /// Took the top element.
    Success(T),
}

struct Buffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: isize,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Box<Buffer<T>> {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Buffer {
            slots,
            mask: capacity as isize - 1,
        })
    }

    fn capacity(&self) -> isize {
        self.mask + 1
    }

    unsafe fn read(&self, index: isize) -> T {
        let slot = &self.slots[(index & self.mask) as usize];
        (*slot.get()).as_ptr().read()
    }

    unsafe fn write(&self, index: isize, value: T) {
        let slot = &self.slots[(index & self.mask) as usize];
        (*slot.get()).as_mut_ptr().write(value)
    }
}

struct Inner<T> {
    top: AtomicIsize,
    bottom: AtomicIsize,
    buffer: AtomicPtr<Buffer<T>>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Elements are `Copy` handles; only the buffer itself needs freeing.
        unsafe {
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
        }
    }
}

/// The owner half. Not `Sync`: only the owning worker may push and pop.
pub struct Deque<T: Copy> {
    inner: Arc<Inner<T>>,
    /// Buffers replaced by `grow`. A thief may still be reading a retired
    /// buffer, so they are only freed when the deque itself drops.
    retired: UnsafeCell<Vec<Box<Buffer<T>>>>,
}

unsafe impl<T: Copy + Send> Send for Deque<T> {}

/// The shared half handed to other workers.
pub struct Stealer<T: Copy> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Stealer {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy> Deque<T> {
    pub fn new(capacity: usize) -> (Deque<T>, Stealer<T>) {
        let capacity = capacity.max(4).next_power_of_two();
        let buffer = Box::into_raw(Buffer::new(capacity));
        let inner = Arc::new(Inner {
            top: AtomicIsize::new(0),
            bottom: AtomicIsize::new(0),
            buffer: AtomicPtr::new(buffer),
        });

        let stealer = Stealer {
            inner: inner.clone(),
        };
        let deque = Deque {
            inner,
            retired: UnsafeCell::new(Vec::new()),
        };
        (deque, stealer)
    }

    /// Appends at the bottom. Owner only. Doubles the backing buffer when
    /// full; growth synchronizes on the owner side alone.
    pub fn push(&self, value: T) {
        unsafe {
            let b = self.inner.bottom.load(Ordering::Relaxed);
            let t = self.inner.top.load(Ordering::Acquire);
            let mut buffer = self.inner.buffer.load(Ordering::Relaxed);

            if b - t >= (*buffer).capacity() {
                buffer = self.grow(t, b);
            }

            (*buffer).write(b, value);
            fence(Ordering::Release);
            self.inner.bottom.store(b + 1, Ordering::Relaxed);
        }
    }

    /// Removes from the bottom. Owner only.
    pub fn pop(&self) -> Option<T> {
        unsafe {
            let b = self.inner.bottom.load(Ordering::Relaxed) - 1;
            let buffer = self.inner.buffer.load(Ordering::Relaxed);
            self.inner.bottom.store(b, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            let t = self.inner.top.load(Ordering::Relaxed);

            if t <= b {
                let value = (*buffer).read(b);
                if t == b {
                    // Single element left: race a concurrent steal for it.
                    let won = self
                        .inner
                        .top
                        .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok();
                    self.inner.bottom.store(b + 1, Ordering::Relaxed);
                    if won {
                        Some(value)
                    } else {
                        None
                    }
                } else {
                    Some(value)
                }
            } else {
                self.inner.bottom.store(b + 1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Relaxed);
        b <= t
    }

    unsafe fn grow(&self, t: isize, b: isize) -> *mut Buffer<T> {
        let old = self.inner.buffer.load(Ordering::Relaxed);
        let new = Buffer::new(((*old).capacity() as usize) * 2);
        for i in t..b {
            new.write(i, (*old).read(i));
        }
        let raw = Box::into_raw(new);
        self.inner.buffer.store(raw, Ordering::Release);
        (*self.retired.get()).push(Box::from_raw(old));
        raw
    }
}

impl<T: Copy> Stealer<T> {
    /// Takes the top element: read `top`, then `bottom`, then the element,
    /// then CAS `top`. A failed CAS reports [`Steal::Abort`] so the caller
    /// can decide between retrying and moving to another victim.
    pub fn steal(&self) -> Steal<T> {
        let t = self.inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.inner.bottom.load(Ordering::Acquire);

        if t < b {
            let buffer = self.inner.buffer.load(Ordering::Acquire);
            let value = unsafe { (*buffer).read(t) };
            if self
                .inner
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return Steal::Abort;
            }
            Steal::Success(value)
        } else {
            Steal::Empty
        }
    }

    pub fn is_empty(&self) -> bool {
        let t = self.inner.top.load(Ordering::Acquire);
        let b = self.inner.bottom.load(Ordering::Acquire);
        b <= t
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn lifo_for_owner() {
        let (deque, _stealer) = Deque::new(8);
        for i in 0..16usize {
            deque.push(i);
        }
        for i in (0..16usize).rev() {
            assert_eq!(deque.pop(), Some(i));
        }
        assert_eq!(deque.pop(), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn fifo_for_thieves() {
        let (deque, stealer) = Deque::new(8);
        for i in 0..4usize {
            deque.push(i);
        }
        for i in 0..4usize {
            match stealer.steal() {
                Steal::Success(v) => assert_eq!(v, i),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(stealer.steal(), Steal::Empty);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let (deque, _stealer) = Deque::new(4);
        for i in 0..1000usize {
            deque.push(i);
        }
        for i in (0..1000usize).rev() {
            assert_eq!(deque.pop(), Some(i));
        }
    }

    #[test]
    fn every_element_taken_exactly_once() {
        const COUNT: usize = 100_000;
        const THIEVES: usize = 4;

        let (deque, stealer) = Deque::new(64);
        let done = Arc::new(AtomicBool::new(false));
        let stolen_sum = Arc::new(AtomicUsize::new(0));
        let stolen_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..THIEVES {
            let stealer = stealer.clone();
            let done = done.clone();
            let sum = stolen_sum.clone();
            let count = stolen_count.clone();
            handles.push(thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    match stealer.steal() {
                        Steal::Success(v) => {
                            sum.fetch_add(v, Ordering::Relaxed);
                            count.fetch_add(1, Ordering::Relaxed);
                        }
                        Steal::Abort | Steal::Empty => thread::yield_now(),
                    }
                }
            }));
        }

        let mut popped = HashSet::new();
        for i in 0..COUNT {
            deque.push(i);
            if i % 3 == 0 {
                if let Some(v) = deque.pop() {
                    assert!(popped.insert(v), "popped {} twice", v);
                }
            }
        }
        let mut popped_sum: usize = popped.iter().sum();
        while let Some(v) = deque.pop() {
            assert!(popped.insert(v), "popped {} twice", v);
            popped_sum += v;
        }
        done.store(true, Ordering::Release);
        for handle in handles {
            handle.join().unwrap();
        }

        let total = COUNT * (COUNT - 1) / 2;
        assert_eq!(
            popped.len() + stolen_count.load(Ordering::Relaxed),
            COUNT,
            "elements lost or duplicated"
        );
        assert_eq!(popped_sum + stolen_sum.load(Ordering::Relaxed), total);
    }
}
