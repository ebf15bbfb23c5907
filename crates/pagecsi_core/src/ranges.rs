//! Page-range lock manager.
//!
//! Grants shared or exclusive locks over inclusive page-index intervals.
//! A new range registers immediately with a count of the outstanding ranges
//! that conflict with it; it is granted once that count drops to zero.
//! Two ranges conflict when they overlap and at least one is exclusive.
//!
//! There is no FIFO fairness. Overlap detection is a linear scan over the
//! outstanding ranges.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    id: u64,
    first: u64,
    last: u64,
    exclusive: bool,
    blocks: usize,
}

impl RangeEntry {
    fn conflicts(&self, first: u64, last: u64, exclusive: bool) -> bool {
        (self.exclusive || exclusive) && self.first <= last && first <= self.last
    }
}

#[derive(Debug, Default)]
struct RangeTable {
    next_id: u64,
    ranges: Vec<RangeEntry>,
}

/// Tracks outstanding page-range locks for one file.
#[derive(Debug, Default)]
pub struct RangeLockManager {
    table: Mutex<RangeTable>,
    released: Condvar,
}

impl RangeLockManager {
    /// Creates a manager with no outstanding ranges.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a lock over pages `first..=last`.
    ///
    /// The lock is counted as outstanding straight away; call
    /// [`RangeLock::wait`] to block until it is granted.
    pub fn add_range(self: &Arc<Self>, first: u64, last: u64, exclusive: bool) -> RangeLock {
        let mut table = self.table.lock();
        let blocks = table
            .ranges
            .iter()
            .filter(|r| r.conflicts(first, last, exclusive))
            .count();
        let id = table.next_id;
        table.next_id += 1;
        table.ranges.push(RangeEntry {
            id,
            first,
            last,
            exclusive,
            blocks,
        });

        RangeLock {
            manager: Arc::clone(self),
            id,
        }
    }

    fn wait(&self, id: u64) {
        let mut table = self.table.lock();
        loop {
            let blocked = table
                .ranges
                .iter()
                .find(|r| r.id == id)
                .is_some_and(|r| r.blocks > 0);
            if !blocked {
                return;
            }
            self.released.wait(&mut table);
        }
    }

    fn blocks(&self, id: u64) -> usize {
        self.table
            .lock()
            .ranges
            .iter()
            .find(|r| r.id == id)
            .map_or(0, |r| r.blocks)
    }

    fn remove(&self, id: u64) {
        let mut table = self.table.lock();
        let Some(pos) = table.ranges.iter().position(|r| r.id == id) else {
            return;
        };
        let removed = table.ranges.remove(pos);

        // Only ranges registered later counted this one.
        let mut woke = false;
        for r in table.ranges.iter_mut().filter(|r| r.id > removed.id) {
            if r.conflicts(removed.first, removed.last, removed.exclusive) {
                r.blocks -= 1;
                woke |= r.blocks == 0;
            }
        }
        drop(table);

        if woke {
            self.released.notify_all();
        }
    }

    /// Returns the number of outstanding ranges, granted or waiting.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table.lock().ranges.len()
    }
}

/// A registered page-range lock. Dropping it removes the range.
#[derive(Debug)]
#[must_use = "the range is released as soon as the lock is dropped"]
pub struct RangeLock {
    manager: Arc<RangeLockManager>,
    id: u64,
}

impl RangeLock {
    /// Blocks until no conflicting range registered earlier remains.
    pub fn wait(&self) {
        self.manager.wait(self.id);
    }

    /// Returns true if the lock is granted.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.manager.blocks(self.id) == 0
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        self.manager.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_ranges_coexist() {
        let manager = RangeLockManager::new();
        let a = manager.add_range(0, 10, false);
        let b = manager.add_range(5, 15, false);
        assert!(a.is_granted());
        assert!(b.is_granted());
        assert_eq!(manager.outstanding(), 2);
    }

    #[test]
    fn exclusive_blocks_overlapping() {
        let manager = RangeLockManager::new();
        let a = manager.add_range(0, 10, true);
        let b = manager.add_range(10, 20, false);
        let c = manager.add_range(11, 20, true);
        assert!(a.is_granted());
        assert!(!b.is_granted());
        assert!(!c.is_granted());

        drop(a);
        assert!(b.is_granted());
        assert!(!c.is_granted());
        drop(b);
        assert!(c.is_granted());
    }

    #[test]
    fn disjoint_exclusive_ranges_do_not_block() {
        let manager = RangeLockManager::new();
        let a = manager.add_range(0, 0, true);
        let b = manager.add_range(1, 1, true);
        assert!(a.is_granted());
        assert!(b.is_granted());
    }

    #[test]
    fn removal_only_unblocks_later_ranges() {
        let manager = RangeLockManager::new();
        let a = manager.add_range(0, 5, true);
        let b = manager.add_range(0, 5, true);
        // `b` was counted against `a`, `a` was not counted against `b`.
        drop(b);
        assert!(a.is_granted());
        let c = manager.add_range(0, 5, false);
        assert!(!c.is_granted());
        drop(a);
        assert!(c.is_granted());
        assert_eq!(manager.outstanding(), 1);
    }

    #[test]
    fn waiter_wakes_on_release() {
        let manager = RangeLockManager::new();
        let first = manager.add_range(0, 3, true);
        let entered = Arc::new(AtomicBool::new(false));

        let handle = {
            let manager = Arc::clone(&manager);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let lock = manager.add_range(2, 2, false);
                lock.wait();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));
        drop(first);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn exclusive_holders_never_overlap() {
        let manager = RangeLockManager::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let lock = manager.add_range(3, 7, true);
                    lock.wait();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(manager.outstanding(), 0);
    }
}
