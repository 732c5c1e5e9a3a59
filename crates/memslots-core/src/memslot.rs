//! The versioned memory-slot table.
//!
//! A [`Memslots`] value is an immutable snapshot of every slot of one VM
//! plus a generation number.  The [`SlotTable`] publishes snapshots
//! through an [`RcuCell`]: execution threads read the current snapshot
//! under an SRCU guard without taking any lock, while a single writer
//! (serialised by the VM's topology lock) builds a modified copy and
//! swaps it in.
//!
//! # Update protocol
//!
//! ```text
//!  validate ─► classify ─► overlap check ─► build copies ─► prepare hook
//!                                                             │
//!      ┌──────────────── delete / move ─────────────────┐     │
//!      │ publish copy with slot INVALID, grace period,  │◄────┤
//!      │ flush shadow state for the old slot            │     │
//!      └──────────────────────┬─────────────────────────┘     │
//!                             ▼                               ▼
//!                publish final table, grace period ─► commit hook
//! ```
//!
//! Every replacement table is allocated before anything is published, so
//! a failure leaves the active table untouched.

use std::collections::TryReserveError;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, info};
use memslots_abi::{UserMemoryRegion, MEM_LOG_DIRTY_PAGES, MEM_READONLY, PAGE_SHIFT};
use parking_lot::MutexGuard;
use thiserror::Error;

use crate::arch::{ArchError, ArchMemory};
use crate::dirty::DirtyBitmap;
use crate::srcu::{RcuCell, Srcu, SrcuReadGuard};
use crate::verified::slots::{self as vslots, ChangeKind, Geometry, InvalidReason, Limits};

// ═══════════════════════════════════════════════════════════════════════
//  Slot flags
// ═══════════════════════════════════════════════════════════════════════

bitflags! {
    /// Per-slot state bits.
    ///
    /// The low bits mirror the request-surface `MEM_*` flags; `INVALID`
    /// is internal and only ever set on the transitional table of a
    /// delete or move.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotFlags: u32 {
        const LOG_DIRTY_PAGES = MEM_LOG_DIRTY_PAGES;
        const READONLY = MEM_READONLY;
        const INVALID = 1 << 16;
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from slot-table mutation and dirty-log retrieval.
#[derive(Error, Debug)]
pub enum SlotError {
    /// Malformed or ambiguous request; nothing changed.
    #[error("invalid request for slot {slot}: {reason}")]
    InvalidRequest {
        /// Slot id from the request.
        slot: u32,
        /// What was wrong with it.
        reason: InvalidReason,
    },

    /// The requested guest range overlaps another user slot.
    #[error("region {base_gfn:#x}+{npages} for slot {slot} is in use by slot {other}")]
    RegionConflict {
        /// Slot being created or moved.
        slot: u16,
        /// Slot already occupying part of the range.
        other: u16,
        /// First frame of the requested range.
        base_gfn: u64,
        /// Pages in the requested range.
        npages: u64,
    },

    /// A bitmap or replacement table could not be allocated.
    #[error("out of memory allocating {what}")]
    OutOfMemory {
        /// Which allocation failed.
        what: &'static str,
    },

    /// The dirty log was requested for a slot that is not logging.
    #[error("slot {slot} has no dirty log")]
    DirtyLogDisabled {
        /// Slot id.
        slot: u16,
    },

    /// The architecture collaborator refused the change.
    #[error("architecture rejected {change} of slot {slot}")]
    Arch {
        /// Slot id.
        slot: u16,
        /// Change that was refused.
        change: ChangeKind,
        #[source]
        source: ArchError,
    },
}

impl SlotError {
    fn oom(what: &'static str) -> impl FnOnce(TryReserveError) -> Self {
        move |_| SlotError::OutOfMemory { what }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  MemorySlot
// ═══════════════════════════════════════════════════════════════════════

/// One contiguous guest-frame range backed by one host-virtual range.
#[derive(Debug, Clone)]
pub struct MemorySlot {
    id: u16,
    base_gfn: u64,
    npages: u64,
    userspace_addr: u64,
    flags: SlotFlags,
    dirty_bitmap: Option<Arc<DirtyBitmap>>,
}

impl MemorySlot {
    /// An empty (non-present) slot.
    pub const fn empty(id: u16) -> Self {
        Self {
            id,
            base_gfn: 0,
            npages: 0,
            userspace_addr: 0,
            flags: SlotFlags::empty(),
            dirty_bitmap: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn base_gfn(&self) -> u64 {
        self.base_gfn
    }

    pub fn npages(&self) -> u64 {
        self.npages
    }

    /// One past the last frame.
    pub fn end_gfn(&self) -> u64 {
        self.base_gfn + self.npages
    }

    pub fn userspace_addr(&self) -> u64 {
        self.userspace_addr
    }

    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    /// True if the slot maps at least one page.
    pub fn is_present(&self) -> bool {
        self.npages > 0
    }

    /// True while a delete or move of this slot is in flight.
    pub fn is_invalid(&self) -> bool {
        self.flags.contains(SlotFlags::INVALID)
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(SlotFlags::READONLY)
    }

    pub fn logs_dirty(&self) -> bool {
        self.flags.contains(SlotFlags::LOG_DIRTY_PAGES)
    }

    pub fn dirty_bitmap(&self) -> Option<&Arc<DirtyBitmap>> {
        self.dirty_bitmap.as_ref()
    }

    /// True if `gfn` lies inside the slot.
    pub fn contains(&self, gfn: u64) -> bool {
        self.relative_page(gfn).is_some()
    }

    /// Offset of `gfn` from the slot base, if inside.
    pub fn relative_page(&self, gfn: u64) -> Option<u64> {
        vslots::relative_page(self.base_gfn, self.npages, gfn)
    }

    /// Host virtual address backing `gfn`.  `gfn` must be inside the slot.
    pub fn gfn_to_hva(&self, gfn: u64) -> u64 {
        vslots::gfn_to_hva(self.base_gfn, self.userspace_addr, gfn)
    }

    /// Host virtual range `[start, end)` backing the slot.
    pub fn hva_range(&self) -> (u64, u64) {
        (self.userspace_addr, self.userspace_addr + (self.npages << PAGE_SHIFT))
    }

    /// Set the dirty bit for `gfn` if logging is on and `gfn` is inside.
    pub fn mark_dirty(&self, gfn: u64) {
        if let (Some(bitmap), Some(rel)) = (&self.dirty_bitmap, self.relative_page(gfn)) {
            bitmap.set(rel);
        }
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            base_gfn: self.base_gfn,
            npages: self.npages,
            userspace_addr: self.userspace_addr,
            flags: (self.flags - SlotFlags::INVALID).bits(),
        }
    }
}

impl fmt::Display for MemorySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {} gfn {:#x}..{:#x} hva {:#x} {:?}",
            self.id,
            self.base_gfn,
            self.end_gfn(),
            self.userspace_addr,
            self.flags
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Memslots
// ═══════════════════════════════════════════════════════════════════════

/// One immutable generation of the slot table.
///
/// `slots` holds every slot id (present or not), in placement order:
/// descending page count, then ascending id.  `id_to_index` maps a slot
/// id to its position; `by_base` lists present slots by ascending base
/// frame for lookup, with `by_base_end` holding the running maximum end
/// frame so a search can stop early.
#[derive(Debug)]
pub struct Memslots {
    slots: Vec<MemorySlot>,
    id_to_index: Vec<u16>,
    by_base: Vec<u16>,
    by_base_end: Vec<u64>,
    generation: u64,
    user_slots: u16,
}

impl Memslots {
    /// An empty generation-0 table with `total_slots` ids.
    pub fn new(user_slots: u16, total_slots: u16) -> Self {
        debug_assert!(user_slots <= total_slots);
        let slots: Vec<MemorySlot> = (0..total_slots).map(MemorySlot::empty).collect();
        let id_to_index = (0..total_slots).collect();
        Self {
            slots,
            id_to_index,
            by_base: Vec::new(),
            by_base_end: Vec::new(),
            generation: 0,
            user_slots,
        }
    }

    /// Monotonic version of this table.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ids below this are user-visible.
    pub fn user_slots(&self) -> u16 {
        self.user_slots
    }

    /// Number of slot ids in the table.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The slot with `id`, present or not.
    pub fn get(&self, id: u16) -> Option<&MemorySlot> {
        let idx = *self.id_to_index.get(usize::from(id))?;
        self.slots.get(usize::from(idx))
    }

    /// The present slot containing `gfn`, including invalid ones.
    pub fn find(&self, gfn: u64) -> Option<&MemorySlot> {
        let mut pos = self
            .by_base
            .partition_point(|&i| self.slots[usize::from(i)].base_gfn <= gfn);
        while pos > 0 {
            pos -= 1;
            if self.by_base_end[pos] <= gfn {
                return None;
            }
            let slot = &self.slots[usize::from(self.by_base[pos])];
            if slot.contains(gfn) {
                return Some(slot);
            }
        }
        None
    }

    /// The present, valid slot containing `gfn`.
    pub fn find_usable(&self, gfn: u64) -> Option<&MemorySlot> {
        self.find(gfn).filter(|s| !s.is_invalid())
    }

    /// Present slots in placement order.
    pub fn iter(&self) -> impl Iterator<Item = &MemorySlot> {
        self.slots.iter().take_while(|s| s.is_present())
    }

    /// Present slots by ascending base frame.
    pub fn iter_by_base(&self) -> impl Iterator<Item = &MemorySlot> {
        self.by_base.iter().map(|&i| &self.slots[usize::from(i)])
    }

    /// First user slot other than `id` overlapping `[base_gfn, base_gfn + npages)`.
    pub fn find_conflict(&self, id: u16, base_gfn: u64, npages: u64) -> Option<&MemorySlot> {
        self.iter().find(|s| {
            s.id != id
                && s.id < self.user_slots
                && vslots::ranges_overlap(s.base_gfn, s.npages, base_gfn, npages)
        })
    }

    /// Call `f(slot, gfn_start, gfn_end)` for every present slot whose
    /// host range intersects `[start, end)`, with the intersecting frames.
    pub fn for_each_in_hva_range(&self, start: u64, end: u64, mut f: impl FnMut(&MemorySlot, u64, u64)) {
        for slot in self.iter() {
            let (s_start, s_end) = slot.hva_range();
            let lo = start.max(s_start);
            let hi = end.min(s_end);
            if lo >= hi {
                continue;
            }
            let gfn_start = slot.base_gfn + ((lo - s_start) >> PAGE_SHIFT);
            let gfn_end = slot.base_gfn + ((hi - s_start + (1 << PAGE_SHIFT) - 1) >> PAGE_SHIFT);
            f(slot, gfn_start, gfn_end);
        }
    }

    /// True if `gfn` is backed by a present, valid user slot.
    pub fn is_visible_gfn(&self, gfn: u64) -> bool {
        self.find_usable(gfn).is_some_and(|s| s.id < self.user_slots)
    }

    /// Fallible deep copy, for building the next generation.
    pub fn try_clone(&self) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(self.slots.len())?;
        slots.extend(self.slots.iter().cloned());
        let mut id_to_index = Vec::new();
        id_to_index.try_reserve_exact(self.id_to_index.len())?;
        id_to_index.extend_from_slice(&self.id_to_index);
        let mut by_base = Vec::new();
        by_base.try_reserve_exact(self.slots.len())?;
        by_base.extend_from_slice(&self.by_base);
        let mut by_base_end = Vec::new();
        by_base_end.try_reserve_exact(self.slots.len())?;
        by_base_end.extend_from_slice(&self.by_base_end);
        Ok(Self {
            slots,
            id_to_index,
            by_base,
            by_base_end,
            generation: self.generation,
            user_slots: self.user_slots,
        })
    }

    /// Replace the slot with `slot.id`, then restore both orderings.
    ///
    /// Capacity for the indexes was reserved by [`try_clone`](Self::try_clone),
    /// so this never allocates.
    fn install(&mut self, slot: MemorySlot) {
        let idx = usize::from(self.id_to_index[usize::from(slot.id)]);
        let resort = self.slots[idx].npages != slot.npages;
        self.slots[idx] = slot;
        if resort {
            self.slots
                .sort_unstable_by(|a, b| b.npages.cmp(&a.npages).then(a.id.cmp(&b.id)));
            for (i, s) in self.slots.iter().enumerate() {
                self.id_to_index[usize::from(s.id)] = i as u16;
            }
        }
        self.rebuild_lookup();
    }

    fn set_flags(&mut self, id: u16, flags: SlotFlags) {
        let idx = usize::from(self.id_to_index[usize::from(id)]);
        self.slots[idx].flags = flags;
    }

    fn rebuild_lookup(&mut self) {
        self.by_base.clear();
        self.by_base.extend(
            self.slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_present())
                .map(|(i, _)| i as u16),
        );
        let slots = &self.slots;
        self.by_base
            .sort_unstable_by_key(|&i| (slots[usize::from(i)].base_gfn, slots[usize::from(i)].id));
        self.by_base_end.clear();
        let mut max_end = 0;
        for &i in &self.by_base {
            max_end = max_end.max(slots[usize::from(i)].end_gfn());
            self.by_base_end.push(max_end);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SlotTable
// ═══════════════════════════════════════════════════════════════════════

/// The published slot table of one VM.
pub struct SlotTable {
    current: RcuCell<Memslots>,
    limits: Limits,
}

impl SlotTable {
    pub fn new(srcu: Arc<Srcu>, limits: Limits) -> Self {
        Self {
            current: RcuCell::new(Memslots::new(limits.user_slots, limits.total_slots), srcu),
            limits,
        }
    }

    /// The active table, valid while `guard` is held.
    pub fn read<'g>(&'g self, guard: &'g SrcuReadGuard<'_>) -> &'g Memslots {
        self.current.read(guard)
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Apply one region request.
    ///
    /// `_topology` is the VM's topology-lock guard; holding it makes this
    /// the only writer.  Returns the change applied, or `None` if the
    /// request matched the existing slot exactly.
    ///
    /// # Errors
    ///
    /// - [`SlotError::InvalidRequest`] for malformed or ambiguous requests.
    /// - [`SlotError::RegionConflict`] if the range overlaps another user slot.
    /// - [`SlotError::OutOfMemory`] if a bitmap or table copy cannot be allocated.
    /// - [`SlotError::Arch`] if `prepare_region` refuses the change.
    pub(crate) fn set_region(
        &self,
        _topology: &MutexGuard<'_, ()>,
        req: &UserMemoryRegion,
        arch: &dyn ArchMemory,
    ) -> Result<Option<ChangeKind>, SlotError> {
        let invalid = |reason| SlotError::InvalidRequest {
            slot: req.slot,
            reason,
        };
        vslots::validate_request(req, &self.limits).map_err(invalid)?;
        let id = req.slot as u16;
        let new_geom = Geometry::of_request(req);

        let guard = self.current.srcu().read_lock();
        let active = self.read(&guard);
        let old = active
            .get(id)
            .cloned()
            .ok_or(invalid(InvalidReason::SlotOutOfRange {
                slot: req.slot,
                limit: self.limits.total_slots,
            }))?;

        let Some(change) = vslots::classify_change(&old.geometry(), &new_geom).map_err(invalid)?
        else {
            debug!("slot {id}: request matches current state, nothing to do");
            return Ok(None);
        };

        if change.claims_space() {
            if let Some(other) = active.find_conflict(id, new_geom.base_gfn, new_geom.npages) {
                return Err(SlotError::RegionConflict {
                    slot: id,
                    other: other.id,
                    base_gfn: new_geom.base_gfn,
                    npages: new_geom.npages,
                });
            }
        }

        let new = build_new_slot(&old, id, &new_geom, change)?;

        // Both replacement tables are built up front; nothing below may fail
        // once the first one is visible.
        let transitional = if change.invalidates_old() {
            let mut t = active.try_clone().map_err(SlotError::oom("slot table"))?;
            t.set_flags(id, old.flags | SlotFlags::INVALID);
            Some(t)
        } else {
            None
        };
        let mut next = active.try_clone().map_err(SlotError::oom("slot table"))?;
        let mut generation = active.generation;
        drop(guard);

        arch.prepare_region(&new, req, change)
            .map_err(|source| SlotError::Arch {
                slot: id,
                change,
                source,
            })?;

        if let Some(mut t) = transitional {
            generation += 1;
            t.generation = generation;
            drop(self.current.publish(Box::new(t)));
            debug!("slot {id}: invalidated for {change} (generation {generation})");
            arch.flush_shadow_for_slot(&old);
        }

        next.install(new.clone());
        generation += 1;
        next.generation = generation;
        drop(self.current.publish(Box::new(next)));

        arch.commit_region(&old, &new, change);

        info!("{change} {new} (generation {generation})");
        Ok(Some(change))
    }
}

/// The slot as it will look after `change`, with its dirty bitmap
/// carried over, allocated, or dropped as the flags require.
fn build_new_slot(
    old: &MemorySlot,
    id: u16,
    geom: &Geometry,
    change: ChangeKind,
) -> Result<MemorySlot, SlotError> {
    if change == ChangeKind::Delete {
        return Ok(MemorySlot::empty(id));
    }

    let flags = SlotFlags::from_bits_truncate(geom.flags);
    let dirty_bitmap = if !flags.contains(SlotFlags::LOG_DIRTY_PAGES) {
        None
    } else if let Some(bitmap) = &old.dirty_bitmap {
        Some(Arc::clone(bitmap))
    } else {
        let bitmap = DirtyBitmap::try_new(geom.npages).map_err(SlotError::oom("dirty bitmap"))?;
        Some(Arc::new(bitmap))
    };

    Ok(MemorySlot {
        id,
        base_gfn: geom.base_gfn,
        npages: geom.npages,
        userspace_addr: geom.userspace_addr,
        flags,
        dirty_bitmap,
    })
}
