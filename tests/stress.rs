//! Irregular workloads that shake out races the structured benchmarks
//! (fib, n-queens) are too regular to hit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use twine::{call, fork, join, Scheduler, Slot};

// An unbalanced tree whose shape is derived from a little hash of the node
// path, so sibling subtrees differ wildly in size and steals land at odd
// places. Returns the number of leaves; the same shape is recomputed
// serially as the reference.
fn shape(seed: u64, depth: u32) -> usize {
    let mut h = seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(u64::from(depth));
    h ^= h >> 33;
    (h % 4) as usize
}

fn irregular(seed: u64, depth: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send>> {
    Box::pin(async move {
        if depth == 0 {
            return 1;
        }

        let children = shape(seed, depth);
        if children == 0 {
            return 1;
        }

        let slots: Vec<Slot<u64>> = (0..children).map(|_| Slot::new()).collect();
        for (i, slot) in slots.iter().enumerate() {
            let child_seed = seed.wrapping_mul(31).wrapping_add(i as u64);
            if i % 2 == 0 {
                fork(slot, move || irregular(child_seed, depth - 1)).await;
            } else {
                call(slot, move || irregular(child_seed, depth - 1)).await;
            }
        }
        join().await;

        slots.iter().map(|slot| slot.take()).sum()
    })
}

fn irregular_serial(seed: u64, depth: u32) -> u64 {
    if depth == 0 {
        return 1;
    }
    let children = shape(seed, depth);
    if children == 0 {
        return 1;
    }
    (0..children)
        .map(|i| irregular_serial(seed.wrapping_mul(31).wrapping_add(i as u64), depth - 1))
        .sum()
}

#[test]
fn irregular_trees_match_serial() {
    let _ = env_logger::try_init();
    let scheduler = Scheduler::new(4).unwrap();
    scheduler.start().unwrap();

    let mut rng = rand::thread_rng();
    for _ in 0..30 {
        let seed: u64 = rng.gen();
        let depth = rng.gen_range(1u32, 12);
        assert_eq!(
            scheduler.sync_wait(irregular(seed, depth)),
            irregular_serial(seed, depth),
            "seed {} depth {}",
            seed,
            depth
        );
    }

    scheduler.stop();
}

// Many external submitters hammering the mailboxes while the workers are
// already busy: exercises the splice/drain paths and thief-side drains.
#[test]
fn submission_churn() {
    let _ = env_logger::try_init();
    let scheduler = Arc::new(Scheduler::new(4).unwrap());
    scheduler.start().unwrap();

    let total = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for t in 0..8u64 {
        let scheduler = scheduler.clone();
        let total = total.clone();
        handles.push(thread::spawn(move || {
            for i in 0..50u64 {
                let value = scheduler.sync_wait(irregular(t * 1000 + i, 6));
                total.fetch_add(value, Ordering::Relaxed);
            }
        }));
    }

    let mut expected = 0u64;
    for t in 0..8u64 {
        for i in 0..50u64 {
            expected += irregular_serial(t * 1000 + i, 6);
        }
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::Relaxed), expected);

    scheduler.stop();
}

// Tiny tasks on many workers maximize steal traffic relative to real work.
#[test]
fn steal_churn_on_shallow_trees() {
    let _ = env_logger::try_init();
    let scheduler = Scheduler::new(8).unwrap();
    scheduler.start().unwrap();

    async fn pair() -> u64 {
        let a = Slot::new();
        let b = Slot::new();
        fork(&a, || async { 1u64 }).await;
        fork(&b, || async { 2u64 }).await;
        join().await;
        a.take() + b.take()
    }

    for _ in 0..2000 {
        assert_eq!(scheduler.sync_wait(pair()), 3);
    }

    scheduler.stop();
}

// Start/stop cycles must not leak workers or wedge on a stale stop flag.
#[test]
fn repeated_pools() {
    let _ = env_logger::try_init();
    for round in 0..20 {
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.start().unwrap();
        assert_eq!(
            scheduler.sync_wait(irregular(round, 5)),
            irregular_serial(round, 5)
        );
        scheduler.stop();
    }
}
