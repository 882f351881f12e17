//! Test-and-set spin lock over a shared-memory word.
//!
//! Used for the per-row queue locks and the allocator-internal lock. The
//! word lives in a mapped segment, so the standard library mutexes cannot
//! guard it; acquire/release ordering on the word itself carries the
//! happens-before between processes. Holders do O(1) work, so contention
//! is short; past `spin_limit` iterations the backoff starts yielding.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::Backoff;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

pub(crate) fn acquire(lock: &AtomicU32, spin_limit: u32) -> SpinGuard<'_> {
    let backoff = Backoff::new();
    let mut spins = 0u32;
    while lock
        .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        if spins < spin_limit {
            spins += 1;
            backoff.spin();
        } else {
            backoff.snooze();
        }
    }
    SpinGuard { lock }
}

pub(crate) struct SpinGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let word = AtomicU32::new(0);
        {
            let _g = acquire(&word, 8);
            assert_eq!(word.load(Ordering::Relaxed), LOCKED);
        }
        assert_eq!(word.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn contended_counter_stays_exact() {
        let word = AtomicU32::new(0);
        let counter = AtomicU32::new(0);
        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..1000 {
                        let _g = acquire(&word, 8);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
