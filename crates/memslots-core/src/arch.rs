//! Architecture collaborator interface and a software shadow MMU.
//!
//! The memory core never builds processor-visible page tables itself.
//! It drives an [`ArchMemory`] implementation at four points of a slot
//! change and whenever the host tears down or retargets a mapping.
//! [`SoftMmu`] is a reference implementation that keeps a plain
//! `gfn → pfn` map, which is enough to observe every invalidation the
//! core issues.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;
use memslots_abi::UserMemoryRegion;
use parking_lot::Mutex;
use thiserror::Error;

use crate::host::Pfn;
use crate::memslot::{MemorySlot, Memslots};
use crate::verified::slots::ChangeKind;

// ═══════════════════════════════════════════════════════════════════════
//  Interface
// ═══════════════════════════════════════════════════════════════════════

/// Errors an architecture hook may report from `prepare_region`.
#[derive(Error, Debug)]
pub enum ArchError {
    /// The architecture refuses this change.
    #[error("slot {slot}: {reason}")]
    Rejected {
        /// Slot id.
        slot: u16,
        /// Human-readable cause.
        reason: String,
    },
}

/// Hooks the memory core calls into architecture-specific code.
///
/// Region hooks run under the VM's topology lock.  MMU hooks run under
/// the invalidation lock with an SRCU read guard held, and must not
/// block on host I/O.
pub trait ArchMemory: Send + Sync {
    /// Pre-flight check before a change becomes visible.
    fn prepare_region(
        &self,
        _candidate: &MemorySlot,
        _req: &UserMemoryRegion,
        _change: ChangeKind,
    ) -> Result<(), ArchError> {
        Ok(())
    }

    /// Called once the new table is published.
    fn commit_region(&self, _old: &MemorySlot, _new: &MemorySlot, _change: ChangeKind) {}

    /// Drop all shadow state derived from `slot`.
    fn flush_shadow_for_slot(&self, _slot: &MemorySlot) {}

    /// Drop all shadow state.
    fn flush_shadow_all(&self) {}

    /// Zap translations backed by host range `[start, end)`.
    ///
    /// Returns true if anything was zapped and a TLB flush is needed.
    fn unmap_hva_range(&self, _slots: &Memslots, _start: u64, _end: u64) -> bool {
        false
    }

    /// Point translations of the page at `hva` at `pfn`, read-only.
    fn set_spte_hva(&self, _slots: &Memslots, _hva: u64, _pfn: Pfn) {}

    /// Test and clear the accessed state of `[start, end)`.
    fn age_hva(&self, _slots: &Memslots, _start: u64, _end: u64) -> bool {
        false
    }

    /// Test the accessed state of the page at `hva`.
    fn test_age_hva(&self, _slots: &Memslots, _hva: u64) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SoftMmu
// ═══════════════════════════════════════════════════════════════════════

/// A translation installed in the [`SoftMmu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowEntry {
    pub pfn: Pfn,
    pub writable: bool,
    pub accessed: bool,
}

/// Region-hook calls observed by a [`SoftMmu`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchEvent {
    Prepare { slot: u16, change: ChangeKind },
    Commit { slot: u16, change: ChangeKind },
    FlushSlot { slot: u16 },
    FlushAll,
}

/// Shadow translation map keyed by guest frame.
#[derive(Debug, Default)]
pub struct SoftMmu {
    entries: Mutex<BTreeMap<u64, ShadowEntry>>,
    events: Mutex<Vec<ArchEvent>>,
    reject_prepare: AtomicBool,
    zapped: AtomicU64,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a translation.  Call only from a commit that passed the
    /// invalidation re-check.
    pub fn install(&self, gfn: u64, pfn: Pfn, writable: bool) {
        self.entries.lock().insert(
            gfn,
            ShadowEntry {
                pfn,
                writable,
                accessed: true,
            },
        );
    }

    pub fn lookup(&self, gfn: u64) -> Option<ShadowEntry> {
        self.entries.lock().get(&gfn).copied()
    }

    /// Mark the translation of `gfn` as used by the guest.
    pub fn touch(&self, gfn: u64) {
        if let Some(e) = self.entries.lock().get_mut(&gfn) {
            e.accessed = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Translations removed by invalidations and flushes so far.
    pub fn zapped(&self) -> u64 {
        self.zapped.load(Ordering::Relaxed)
    }

    /// Region-hook calls so far.
    pub fn events(&self) -> Vec<ArchEvent> {
        self.events.lock().clone()
    }

    /// Make the next `prepare_region` fail.
    pub fn reject_next_prepare(&self) {
        self.reject_prepare.store(true, Ordering::SeqCst);
    }

    fn record(&self, event: ArchEvent) {
        self.events.lock().push(event);
    }

    fn zap_gfns(&self, start: u64, end: u64) -> bool {
        let mut entries = self.entries.lock();
        let doomed: Vec<u64> = entries.range(start..end).map(|(&gfn, _)| gfn).collect();
        for gfn in &doomed {
            entries.remove(gfn);
        }
        self.zapped.fetch_add(doomed.len() as u64, Ordering::Relaxed);
        !doomed.is_empty()
    }
}

impl ArchMemory for SoftMmu {
    fn prepare_region(
        &self,
        candidate: &MemorySlot,
        _req: &UserMemoryRegion,
        change: ChangeKind,
    ) -> Result<(), ArchError> {
        self.record(ArchEvent::Prepare {
            slot: candidate.id(),
            change,
        });
        if self.reject_prepare.swap(false, Ordering::SeqCst) {
            return Err(ArchError::Rejected {
                slot: candidate.id(),
                reason: "prepare rejected by fault injection".into(),
            });
        }
        Ok(())
    }

    fn commit_region(&self, _old: &MemorySlot, new: &MemorySlot, change: ChangeKind) {
        self.record(ArchEvent::Commit {
            slot: new.id(),
            change,
        });
    }

    fn flush_shadow_for_slot(&self, slot: &MemorySlot) {
        self.record(ArchEvent::FlushSlot { slot: slot.id() });
        if self.zap_gfns(slot.base_gfn(), slot.end_gfn()) {
            debug!("flushed shadow entries of {slot}");
        }
    }

    fn flush_shadow_all(&self) {
        self.record(ArchEvent::FlushAll);
        let mut entries = self.entries.lock();
        self.zapped.fetch_add(entries.len() as u64, Ordering::Relaxed);
        entries.clear();
    }

    fn unmap_hva_range(&self, slots: &Memslots, start: u64, end: u64) -> bool {
        let mut zapped = false;
        slots.for_each_in_hva_range(start, end, |_, gfn_start, gfn_end| {
            zapped |= self.zap_gfns(gfn_start, gfn_end);
        });
        zapped
    }

    fn set_spte_hva(&self, slots: &Memslots, hva: u64, pfn: Pfn) {
        let mut entries = self.entries.lock();
        slots.for_each_in_hva_range(hva, hva + 1, |_, gfn, _| {
            if let Some(e) = entries.get_mut(&gfn) {
                e.pfn = pfn;
                e.writable = false;
            }
        });
    }

    fn age_hva(&self, slots: &Memslots, start: u64, end: u64) -> bool {
        let mut entries = self.entries.lock();
        let mut young = false;
        slots.for_each_in_hva_range(start, end, |_, gfn_start, gfn_end| {
            for (_, e) in entries.range_mut(gfn_start..gfn_end) {
                young |= e.accessed;
                e.accessed = false;
            }
        });
        young
    }

    fn test_age_hva(&self, slots: &Memslots, hva: u64) -> bool {
        let entries = self.entries.lock();
        let mut young = false;
        slots.for_each_in_hva_range(hva, hva + 1, |_, gfn, _| {
            young |= entries.get(&gfn).is_some_and(|e| e.accessed);
        });
        young
    }
}
