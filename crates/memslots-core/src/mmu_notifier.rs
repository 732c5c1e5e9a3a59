//! Invalidation coordinator.
//!
//! Host mapping changes arrive through [`HostMappingListener`].  Each one
//! zaps the guest translations derived from the affected host range and
//! moves the `(seq, count)` pair that translators use to detect a race:
//!
//! ```text
//!  translator                            host reclaim
//!  ──────────                            ────────────
//!  s = seq            (acquire)          lock; count += 1; zap; flush; unlock
//!  pin page (may sleep)                  ... unmap host page ...
//!  lock                                  lock; seq += 1; (release) count -= 1; unlock
//!  count > 0 || seq != s  → drop, retry
//!  commit; unlock
//! ```
//!
//! A translator that sees `count == 0` and an unchanged `seq` under the
//! lock knows no invalidation of any range began or ended since it took
//! its snapshot, so the frame it pinned is still mapped.

use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};

use log::{error, trace};
use parking_lot::{Mutex, MutexGuard};

use crate::host::{HostMappingListener, Pfn};
use crate::vm::VmMemory;

/// The `(seq, count)` pair and the lock that serialises updates to it.
#[derive(Debug, Default)]
pub struct MmuNotifier {
    lock: Mutex<()>,
    seq: AtomicU64,
    count: AtomicI64,
    tlbs_dirty: AtomicU64,
}

impl MmuNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the invalidation lock.
    ///
    /// Never acquire the topology lock while holding this.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Snapshot the sequence before starting a translation.
    pub fn read_seq(&self) -> u64 {
        let seq = self.seq.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        seq
    }

    /// True if a translation that started at `seq` must be discarded.
    pub fn retry(&self, _guard: &MutexGuard<'_, ()>, seq: u64) -> bool {
        if self.count.load(Ordering::Relaxed) > 0 {
            return true;
        }
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) != seq
    }

    /// Open an invalidation window.
    pub fn begin(&self, _guard: &MutexGuard<'_, ()>) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // The count must be visible before the host unmaps anything.
        fence(Ordering::SeqCst);
    }

    /// Close an invalidation window; returns the remaining open count.
    pub fn end(&self, _guard: &MutexGuard<'_, ()>) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Record a single-page event that has no window.
    pub fn bump_seq(&self, _guard: &MutexGuard<'_, ()>) {
        self.seq.fetch_add(1, Ordering::Relaxed);
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Open invalidation windows.
    pub fn active_count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Note that translations were dropped without a TLB flush.
    pub fn note_tlbs_dirty(&self) {
        self.tlbs_dirty.fetch_add(1, Ordering::SeqCst);
    }

    pub fn tlbs_dirty(&self) -> u64 {
        self.tlbs_dirty.load(Ordering::SeqCst)
    }

    /// Reset the deferred-flush count if no one added to it since
    /// `observed` was read.
    pub(crate) fn clear_tlbs_dirty(&self, observed: u64) {
        let _ = self
            .tlbs_dirty
            .compare_exchange(observed, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl HostMappingListener for VmMemory {
    fn invalidate_page(&self, hva: u64) {
        let srcu = self.srcu.read_lock();
        let slots = self.slots.read(&srcu);
        let guard = self.mmu.lock();
        self.mmu.bump_seq(&guard);
        let need_flush =
            self.arch.unmap_hva_range(slots, hva, hva + 1) || self.mmu.tlbs_dirty() != 0;
        if need_flush {
            self.flush_remote_tlbs();
        }
        trace!("invalidate_page {hva:#x} (flush {need_flush})");
    }

    fn invalidate_range_start(&self, start: u64, end: u64) {
        let srcu = self.srcu.read_lock();
        let slots = self.slots.read(&srcu);
        let guard = self.mmu.lock();
        self.mmu.begin(&guard);
        let need_flush =
            self.arch.unmap_hva_range(slots, start, end) || self.mmu.tlbs_dirty() != 0;
        if need_flush {
            self.flush_remote_tlbs();
        }
        trace!("invalidate_range_start {start:#x}..{end:#x} (flush {need_flush})");
    }

    fn invalidate_range_end(&self, start: u64, end: u64) {
        let remaining = {
            let guard = self.mmu.lock();
            self.mmu.end(&guard)
        };
        if remaining < 0 {
            error!("invalidate_range_end {start:#x}..{end:#x} without a matching start");
            self.mark_bugged("unbalanced invalidation window");
        }
    }

    fn change_pte(&self, hva: u64, pfn: Pfn) {
        let srcu = self.srcu.read_lock();
        let slots = self.slots.read(&srcu);
        let guard = self.mmu.lock();
        self.mmu.bump_seq(&guard);
        self.arch.set_spte_hva(slots, hva, pfn);
    }

    fn clear_flush_young(&self, start: u64, end: u64) -> bool {
        let srcu = self.srcu.read_lock();
        let slots = self.slots.read(&srcu);
        let _guard = self.mmu.lock();
        let young = self.arch.age_hva(slots, start, end);
        if young {
            self.flush_remote_tlbs();
        }
        young
    }

    fn test_young(&self, hva: u64) -> bool {
        let srcu = self.srcu.read_lock();
        let slots = self.slots.read(&srcu);
        let _guard = self.mmu.lock();
        self.arch.test_age_hva(slots, hva)
    }

    fn release(&self) {
        let _srcu = self.srcu.read_lock();
        self.arch.flush_shadow_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::vm::VmError;
    use memslots_abi::{UserMemoryRegion, PAGE_SIZE};

    // ─── Sequence / count ────────────────────────────────────────────

    #[test]
    fn fresh_snapshot_does_not_retry() {
        let n = MmuNotifier::new();
        let seq = n.read_seq();
        assert!(!n.retry(&n.lock(), seq));
    }

    #[test]
    fn single_page_event_bumps_sequence() {
        let n = MmuNotifier::new();
        let seq = n.read_seq();
        n.bump_seq(&n.lock());
        assert!(n.retry(&n.lock(), seq));
        assert_eq!(n.seq(), seq + 1);
    }

    #[test]
    fn nested_windows_balance() {
        let n = MmuNotifier::new();
        let g = n.lock();
        n.begin(&g);
        n.begin(&g);
        assert_eq!(n.active_count(), 2);
        assert_eq!(n.end(&g), 1);
        assert_eq!(n.end(&g), 0);
        assert_eq!(n.seq(), 2);
    }

    #[test]
    fn tlbs_dirty_cleared_only_if_unchanged() {
        let n = MmuNotifier::new();
        n.note_tlbs_dirty();
        let observed = n.tlbs_dirty();
        n.note_tlbs_dirty();
        n.clear_tlbs_dirty(observed);
        assert_eq!(n.tlbs_dirty(), 2);
        n.clear_tlbs_dirty(2);
        assert_eq!(n.tlbs_dirty(), 0);
    }

    // ─── Host notifications ──────────────────────────────────────────

    #[test]
    fn swap_out_zaps_translation_and_flushes_running_vcpus() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.mmu.install(0x101, Pfn(1), true);
        h.mmu.install(0x102, Pfn(2), true);
        let vcpu = h.vm.add_vcpu(0);
        assert!(vcpu.enter_guest());

        h.host.swap_out(h.hva(0x101));

        assert!(h.mmu.lookup(0x101).is_none());
        assert!(h.mmu.lookup(0x102).is_some());
        assert_eq!(h.kicker.count(), 1);
        assert_eq!(h.vm.stats().remote_tlb_flush, 1);
        assert_eq!(h.vm.mmu.seq(), 1);
    }

    #[test]
    fn miss_outside_slots_does_not_flush() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        assert!(h.vm.add_vcpu(0).enter_guest());
        h.host.swap_out(h.hva(0x900));
        assert_eq!(h.kicker.count(), 0);
        assert_eq!(h.vm.stats().remote_tlb_flush, 0);
    }

    #[test]
    fn range_unmap_opens_and_closes_window() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 8, 0);
        for gfn in 0x100..0x108 {
            h.mmu.install(gfn, Pfn(gfn), true);
        }
        h.host.unmap(h.hva(0x102), 3 * PAGE_SIZE);
        assert_eq!(h.mmu.len(), 5);
        assert_eq!(h.vm.mmu.active_count(), 0);
        assert_eq!(h.vm.mmu.seq(), 1);
    }

    #[test]
    fn change_pte_retargets_read_only() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.mmu.install(0x103, Pfn(7), true);
        let pfn = h.host.migrate(h.hva(0x103));
        let e = h.mmu.lookup(0x103).unwrap();
        assert_eq!(e.pfn, pfn);
        assert!(!e.writable);
    }

    #[test]
    fn aging_clears_accessed_state() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.mmu.install(0x100, Pfn(1), true);
        assert!(h.host.is_young(h.hva(0x100)));
        assert!(h.host.age(h.hva(0x100), PAGE_SIZE));
        assert!(!h.host.is_young(h.hva(0x100)));
        assert!(!h.host.age(h.hva(0x100), PAGE_SIZE));
        h.mmu.touch(0x100);
        assert!(h.host.is_young(h.hva(0x100)));
    }

    #[test]
    fn release_flushes_everything() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.mmu.install(0x100, Pfn(1), true);
        h.host.release();
        assert!(h.mmu.is_empty());
    }

    #[test]
    fn unbalanced_end_marks_vm_bugged() {
        let h = Harness::new();
        h.vm.invalidate_range_end(0, PAGE_SIZE);
        assert!(h.vm.is_bugged());
        let err = h
            .vm
            .set_user_region(&UserMemoryRegion::new(0, 0, PAGE_SIZE, h.hva(0)))
            .unwrap_err();
        assert!(matches!(err, VmError::Bugged));
    }
}
