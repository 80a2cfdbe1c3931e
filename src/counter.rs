//! Approximate striped counter.
//!
//! Writers pick a stripe by thread and bump it without touching the other
//! stripes, so increments from different threads never contend on one cache
//! line. Reads sum every stripe and are only an estimate while writers are
//! active; once writers quiesce the sum is exact.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use portable_atomic::AtomicI64;

/// Number of stripes. Power of two so the stripe index is a mask.
const STRIPES: usize = 16;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE: Cell<usize> = const { Cell::new(usize::MAX) };
}

#[inline]
fn stripe_index() -> usize {
    STRIPE.with(|s| {
        let idx = s.get();
        if idx != usize::MAX {
            return idx;
        }
        let idx = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed) & (STRIPES - 1);
        s.set(idx);
        idx
    })
}

/// A write-many / read-rarely counter.
pub struct Counter {
    cells: Box<[CachePadded<AtomicI64>]>,
}

impl Counter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        let cells = (0..STRIPES)
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells }
    }

    /// Adds `delta` to the calling thread's stripe.
    #[inline]
    pub fn add(&self, delta: i64) {
        self.cells[stripe_index()].fetch_add(delta, Ordering::Relaxed);
    }

    /// Adds one.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtracts one.
    #[inline]
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Sums all stripes.
    ///
    /// Updates racing with the sum may or may not be included. The result can
    /// transiently be negative when a decrement lands on a stripe that was
    /// already summed while its matching increment was not.
    pub fn estimate(&self) -> i64 {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Like [`estimate`](Self::estimate) but clamped at zero.
    pub fn estimate_usize(&self) -> usize {
        self.estimate().max(0) as usize
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Counter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Counter").field(&self.estimate()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_thread() {
        let c = Counter::new();
        assert_eq!(c.estimate(), 0);
        c.increment();
        c.increment();
        c.decrement();
        assert_eq!(c.estimate(), 1);
        c.add(-5);
        assert_eq!(c.estimate(), -4);
        assert_eq!(c.estimate_usize(), 0);
    }

    #[test]
    fn test_concurrent_sum_is_exact_after_join() {
        let c = Arc::new(Counter::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let c = c.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    c.increment();
                }
                if t % 2 == 0 {
                    for _ in 0..5_000 {
                        c.decrement();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.estimate(), 8 * 10_000 - 4 * 5_000);
    }
}
