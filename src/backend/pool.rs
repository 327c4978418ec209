use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::backend::bio::{alloc_page, PageBuf};

/// Smallest pool any mapping gets, no matter how many mappings share the
/// machine.
pub(crate) const MIN_POOL_PAGES: usize = 32;
/// Fraction of system pages a mapping may claim: 2%.
const POOL_PERCENT: usize = 2;

/// Sizes one mapping's pool as its fair share of system memory.
pub(crate) fn pool_pages_for(total_system_pages: usize, n_mappings: usize) -> usize {
    let share = (total_system_pages * POOL_PERCENT / 100) / n_mappings.max(1);
    share.max(MIN_POOL_PAGES)
}

/// Page accounting spread over several cells so concurrent converters do not
/// fight over one cache line. Only the sum is meaningful.
pub(crate) struct ShardedCounter {
    cells: Vec<AtomicIsize>,
    next: AtomicUsize,
}

impl ShardedCounter {
    pub fn new() -> ShardedCounter {
        ShardedCounter { cells: (0..8).map(|_| AtomicIsize::new(0)).collect(), next: AtomicUsize::new(0) }
    }

    pub fn add(&self, delta: isize) {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) & (self.cells.len() - 1);
        self.cells[slot].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sum(&self) -> isize {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

struct PoolState {
    free: Vec<PageBuf>,
    /// Pages handed out and not yet returned; `free` only caches recycled
    /// ones, so availability is `limit - outstanding`.
    outstanding: usize,
}

/// The per-mapping page pool behind write clones.
///
/// Allocation is two-phase to dodge the classic N-mapping deadlock where
/// every mapping holds half the pages it needs and blocks on the rest:
/// a lock-free first attempt that may come back empty-handed, then a retry
/// under a mapping-wide mutex where blocking is allowed. At most one I/O per
/// mapping can be in the blocking phase, so it always drains.
pub(crate) struct PagePool {
    limit: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
    /// Serializes the blocking phase.
    slow_lock: Mutex<()>,
    slow_hits: AtomicUsize,
    accounted: ShardedCounter,
}

impl PagePool {
    pub fn new(limit: usize) -> PagePool {
        PagePool {
            limit,
            state: Mutex::new(PoolState { free: Vec::new(), outstanding: 0 }),
            returned: Condvar::new(),
            slow_lock: Mutex::new(()),
            slow_hits: AtomicUsize::new(0),
            accounted: ShardedCounter::new(),
        }
    }

    pub fn limit(&self) -> usize { self.limit }

    /// Longest run of pages one I/O may claim; oversize descriptors split to
    /// this before allocation so the blocking phase can always succeed.
    pub fn max_run_pages(&self) -> usize { self.limit.min(256) }

    /// Fast path: all of `n` pages without blocking, or nothing.
    pub fn try_alloc(&self, n: usize) -> Option<Vec<PageBuf>> {
        let mut state = self.state.lock().unwrap();
        if self.limit - state.outstanding < n {
            return None;
        }
        Some(self.grab(&mut state, n))
    }

    /// Slow path: take the mapping-wide mutex and wait for returns. Callers
    /// reach this only after `try_alloc` failed.
    pub fn alloc_blocking(&self, n: usize) -> Vec<PageBuf> {
        assert!(n <= self.limit, "request exceeds pool");
        let _serial = self.slow_lock.lock().unwrap();
        self.slow_hits.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        while self.limit - state.outstanding < n {
            state = self.returned.wait(state).unwrap();
        }
        self.grab(&mut state, n)
    }

    fn grab(&self, state: &mut PoolState, n: usize) -> Vec<PageBuf> {
        let mut pages = Vec::with_capacity(n);
        while pages.len() < n {
            match state.free.pop() {
                Some(page) => pages.push(page),
                None => pages.push(alloc_page()),
            }
        }
        state.outstanding += n;
        self.accounted.add(n as isize);
        pages
    }

    /// Returns pages to the pool, zeroed, and wakes blocked allocators.
    pub fn release(&self, pages: Vec<PageBuf>) {
        if pages.is_empty() {
            return;
        }
        let n = pages.len();
        let mut state = self.state.lock().unwrap();
        for page in pages {
            page.lock().unwrap().fill(0);
            state.free.push(page);
        }
        state.outstanding -= n;
        self.accounted.add(-(n as isize));
        drop(state);
        self.returned.notify_all();
    }

    pub fn outstanding(&self) -> usize { self.state.lock().unwrap().outstanding }

    pub fn accounted(&self) -> isize { self.accounted.sum() }

    /// How many times an allocation had to enter the blocking phase.
    pub fn slow_path_hits(&self) -> usize { self.slow_hits.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn sizing_follows_share_with_floor() {
        assert_eq!(pool_pages_for(1_000_000, 2), 10_000);
        assert_eq!(pool_pages_for(100, 1), MIN_POOL_PAGES);
        assert_eq!(pool_pages_for(0, 0), MIN_POOL_PAGES);
    }

    #[test]
    fn fast_path_is_all_or_nothing() {
        let pool = PagePool::new(4);
        let got = pool.try_alloc(3).unwrap();
        assert_eq!(got.len(), 3);
        assert!(pool.try_alloc(2).is_none());
        assert_eq!(pool.outstanding(), 3);
        pool.release(got);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.accounted(), 0);
    }

    #[test]
    fn blocking_phase_waits_for_returns() {
        let pool = Arc::new(PagePool::new(4));
        let held = pool.try_alloc(4).unwrap();
        let p2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            let got = p2.alloc_blocking(2);
            assert_eq!(got.len(), 2);
            p2.release(got);
        });
        std::thread::sleep(Duration::from_millis(50));
        pool.release(held);
        waiter.join().unwrap();
        assert_eq!(pool.slow_path_hits(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn two_starved_allocators_both_finish() {
        let pool = Arc::new(PagePool::new(8));
        let hog = pool.try_alloc(8).unwrap();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let got = match pool.try_alloc(8) {
                    Some(got) => got,
                    None => pool.alloc_blocking(8),
                };
                std::thread::sleep(Duration::from_millis(10));
                pool.release(got);
            }));
        }
        std::thread::sleep(Duration::from_millis(20));
        pool.release(hog);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.slow_path_hits() >= 1);
    }

    #[test]
    fn sharded_counter_sums_across_cells() {
        let c = ShardedCounter::new();
        for _ in 0..100 {
            c.add(3);
        }
        for _ in 0..50 {
            c.add(-2);
        }
        assert_eq!(c.sum(), 200);
    }
}
