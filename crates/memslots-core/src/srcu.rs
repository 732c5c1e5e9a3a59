//! Sleepable read-copy-update for the slot table and I/O buses.
//!
//! Execution threads read the published slot table and bus tables on
//! every access, so readers must never take a lock a topology writer
//! holds.  Instead each reader brackets its access with a cheap
//! [`Srcu::read_lock`] guard, and a writer that has swapped in a new
//! version calls [`Srcu::synchronize`] to wait until every reader that
//! could still see the old version has left.
//!
//! # Protocol
//!
//! ```text
//!  reader                         writer
//!  ──────                         ──────
//!  idx = epoch & 1                ptr.swap(new)
//!  readers[idx] += 1              epoch += 1;  wait readers[old] == 0
//!  p = ptr.load()                 epoch += 1;  wait readers[!old] == 0
//!  ... use *p ...                 free(old)
//!  readers[idx] -= 1
//! ```
//!
//! All accesses are sequentially consistent.  A reader whose counter
//! increment lands after the writer observed that counter at zero also
//! loads the pointer after the swap, so it can only see the new version.
//! Flipping twice drains both parities, which covers readers that
//! registered against either epoch before the grace period began.

use std::cell::Cell;
use std::hint;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

/// Default busy-wait iterations before a grace period starts yielding.
pub const DEFAULT_SPIN_BUDGET: u32 = 128;

thread_local! {
    static READ_DEPTH: Cell<usize> = const { Cell::new(0) };
}

// ═══════════════════════════════════════════════════════════════════════
//  Srcu
// ═══════════════════════════════════════════════════════════════════════

/// Grace-period domain shared by every [`RcuCell`] of one VM.
pub struct Srcu {
    readers: [AtomicUsize; 2],
    epoch: AtomicUsize,
    gp_lock: Mutex<()>,
    spin_budget: u32,
    completed: AtomicU64,
}

impl Srcu {
    pub fn new(spin_budget: u32) -> Self {
        Self {
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            epoch: AtomicUsize::new(0),
            gp_lock: Mutex::new(()),
            spin_budget,
            completed: AtomicU64::new(0),
        }
    }

    /// Enter a read-side critical section.
    ///
    /// Never blocks.  The guard must be dropped on the thread that took it.
    pub fn read_lock(&self) -> SrcuReadGuard<'_> {
        let idx = self.epoch.load(Ordering::SeqCst) & 1;
        self.readers[idx].fetch_add(1, Ordering::SeqCst);
        READ_DEPTH.with(|d| d.set(d.get() + 1));
        SrcuReadGuard {
            srcu: self,
            idx,
            _not_send: PhantomData,
        }
    }

    /// Wait until every read-side section that started before this call
    /// has ended.
    ///
    /// # Panics
    ///
    /// Debug builds panic if the calling thread is itself inside a
    /// read-side section, which would deadlock.
    pub fn synchronize(&self) {
        debug_assert_eq!(
            READ_DEPTH.with(Cell::get),
            0,
            "synchronize() called inside a read-side section"
        );

        let _gp = self.gp_lock.lock();
        fence(Ordering::SeqCst);
        for _ in 0..2 {
            let old = self.epoch.fetch_add(1, Ordering::SeqCst) & 1;
            self.wait_for_readers(old);
        }
        fence(Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_for_readers(&self, idx: usize) {
        let mut spins = 0;
        while self.readers[idx].load(Ordering::SeqCst) != 0 {
            if spins < self.spin_budget {
                hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    /// Number of grace periods completed so far.
    pub fn grace_periods(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Readers currently inside a section (both parities).
    pub fn active_readers(&self) -> usize {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }
}

impl Default for Srcu {
    fn default() -> Self {
        Self::new(DEFAULT_SPIN_BUDGET)
    }
}

/// Read-side critical section; ends on drop.
pub struct SrcuReadGuard<'a> {
    srcu: &'a Srcu,
    idx: usize,
    _not_send: PhantomData<*const ()>,
}

impl SrcuReadGuard<'_> {
    fn domain(&self) -> *const Srcu {
        self.srcu
    }
}

impl Drop for SrcuReadGuard<'_> {
    fn drop(&mut self) {
        READ_DEPTH.with(|d| d.set(d.get() - 1));
        self.srcu.readers[self.idx].fetch_sub(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  RcuCell
// ═══════════════════════════════════════════════════════════════════════

/// A published, immutable `T` that is replaced wholesale and reclaimed
/// only after a grace period.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
    srcu: Arc<Srcu>,
}

// SAFETY: the cell hands out `&T` to many threads and moves boxed `T`s
// between threads on publish, which is what `Send + Sync` on `T` allows.
unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    pub fn new(value: T, srcu: Arc<Srcu>) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            srcu,
        }
    }

    /// The version current at the time of the call.
    ///
    /// The reference is valid for as long as `guard` is held.
    pub fn read<'g>(&'g self, guard: &'g SrcuReadGuard<'_>) -> &'g T {
        debug_assert!(
            ptr::eq(guard.domain(), Arc::as_ptr(&self.srcu)),
            "guard taken from a different grace-period domain"
        );
        // SAFETY: the pointer came from `Box::into_raw` and is only freed
        // by `publish` after a grace period, which waits for `guard`.
        unsafe { &*self.ptr.load(Ordering::SeqCst) }
    }

    /// Swap in `new`, wait out the grace period, and return the retired
    /// version so the caller can dispose of it.
    ///
    /// Must not be called while holding a read guard or any lock a
    /// reader needs.
    pub fn publish(&self, new: Box<T>) -> Box<T> {
        let old = self.ptr.swap(Box::into_raw(new), Ordering::SeqCst);
        self.srcu.synchronize();
        // SAFETY: `old` was produced by `Box::into_raw`, is no longer
        // reachable through `ptr`, and no reader can still hold it.
        unsafe { Box::from_raw(old) }
    }

    /// Grace-period domain this cell publishes through.
    pub fn srcu(&self) -> &Arc<Srcu> {
        &self.srcu
    }
}

impl<T: Clone> RcuCell<T> {
    /// Clone of the current version, for copy-on-write updates.
    pub fn snapshot(&self) -> T {
        let guard = self.srcu.read_lock();
        self.read(&guard).clone()
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader can hold a reference.
        unsafe { drop(Box::from_raw(*self.ptr.get_mut())) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn read_sees_initial_value() {
        let srcu = Arc::new(Srcu::default());
        let cell = RcuCell::new(7u32, srcu.clone());
        let guard = srcu.read_lock();
        assert_eq!(*cell.read(&guard), 7);
        assert_eq!(srcu.active_readers(), 1);
        drop(guard);
        assert_eq!(srcu.active_readers(), 0);
    }

    #[test]
    fn publish_returns_old_value() {
        let srcu = Arc::new(Srcu::default());
        let cell = RcuCell::new(String::from("old"), srcu.clone());
        let old = cell.publish(Box::new(String::from("new")));
        assert_eq!(*old, "old");
        assert_eq!(cell.snapshot(), "new");
        assert_eq!(srcu.grace_periods(), 1);
    }

    #[test]
    fn synchronize_without_readers_returns() {
        let srcu = Srcu::default();
        srcu.synchronize();
        srcu.synchronize();
        assert_eq!(srcu.grace_periods(), 2);
    }

    #[test]
    fn synchronize_waits_for_preexisting_reader() {
        let srcu = Arc::new(Srcu::new(4));
        let cell = Arc::new(RcuCell::new(1u64, srcu.clone()));
        let published = AtomicBool::new(false);

        thread::scope(|s| {
            let guard = srcu.read_lock();
            let seen = *cell.read(&guard);

            s.spawn(|| {
                cell.publish(Box::new(2));
                published.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(
                !published.load(Ordering::SeqCst),
                "grace period ended while a reader was active"
            );
            assert_eq!(seen, 1);
            drop(guard);
        });

        assert!(published.load(Ordering::SeqCst));
        assert_eq!(cell.snapshot(), 2);
    }

    #[test]
    fn readers_never_see_freed_versions() {
        let srcu = Arc::new(Srcu::new(16));
        let cell = RcuCell::new(vec![0u64; 64], srcu.clone());
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        let guard = srcu.read_lock();
                        let v = cell.read(&guard);
                        let first = v[0];
                        assert!(v.iter().all(|&x| x == first), "torn version");
                    }
                });
            }
            for i in 1..=200u64 {
                cell.publish(Box::new(vec![i; 64]));
            }
            stop.store(true, Ordering::Relaxed);
        });

        assert_eq!(cell.snapshot()[0], 200);
    }
}
