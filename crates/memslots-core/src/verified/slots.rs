//! Pure, verifiable functions for region-request validation and
//! classification.
//!
//! Every function in this module is:
//! - **Pure**: no table access, no locking, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Assertion-guarded**: `debug_assert!` preconditions and postconditions
//!   on every non-trivial function.
//!
//! # Mapping to `memslot.rs`
//!
//! | Verified function      | Delegated from in `memslot.rs`          |
//! |------------------------|-----------------------------------------|
//! | [`validate_request`]   | `VmMemory::set_region()`                |
//! | [`effective_flags`]    | `VmMemory::set_region()`                |
//! | [`classify_change`]    | `VmMemory::set_region()`                |
//! | [`ranges_overlap`]     | `Memslots::find_conflict()`             |
//! | [`gfn_to_hva`]         | `MemorySlot::gfn_to_hva()`              |
//! | [`relative_page`]      | `MemorySlot::relative_page()`           |

use std::fmt;

use memslots_abi::{
    page_aligned, MEM_LOG_DIRTY_PAGES, MEM_READONLY, MEM_VALID_FLAGS, PAGE_SHIFT, PAGE_SIZE,
    UserMemoryRegion,
};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// How a request changes the slot it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Empty slot becomes present.
    Create,
    /// Present slot becomes empty.
    Delete,
    /// Base frame changes, size and backing stay.
    Move,
    /// Only the log-dirty flag changes.
    FlagsOnly,
}

impl ChangeKind {
    /// Changes that must retire old translations before publishing.
    pub const fn invalidates_old(self) -> bool {
        matches!(self, ChangeKind::Delete | ChangeKind::Move)
    }

    /// Changes that claim new guest-frame space.
    pub const fn claims_space(self) -> bool {
        matches!(self, ChangeKind::Create | ChangeKind::Move)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Create => "create",
            ChangeKind::Delete => "delete",
            ChangeKind::Move => "move",
            ChangeKind::FlagsOnly => "flags-only",
        };
        f.write_str(name)
    }
}

/// The fields of a slot that classification looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub base_gfn: u64,
    pub npages: u64,
    pub userspace_addr: u64,
    /// Raw `MEM_*` bits (never the internal invalid marker).
    pub flags: u32,
}

impl Geometry {
    /// Geometry described by a request, with flags already normalised.
    pub fn of_request(req: &UserMemoryRegion) -> Self {
        Self {
            base_gfn: req.base_gfn(),
            npages: req.page_count(),
            userspace_addr: req.userspace_addr,
            flags: effective_flags(req),
        }
    }
}

/// Slot-table limits a request is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Ids below this are user-visible.
    pub user_slots: u16,
    /// Total slots (user + private).
    pub total_slots: u16,
    /// Largest page count per slot.
    pub max_pages: u64,
}

/// Why a request was rejected without touching the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    UnknownFlags(u32),
    UnalignedSize,
    UnalignedGuestAddress,
    UnalignedHostAddress,
    HostRangeWraps,
    SlotOutOfRange { slot: u32, limit: u16 },
    GuestRangeWraps,
    TooManyPages { npages: u64, max: u64 },
    ResizeOrRemap,
    ReadonlyToggle,
    DeleteMissing,
    PrivateSlot { slot: u32 },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::UnknownFlags(bits) => write!(f, "unknown flag bits {bits:#x}"),
            InvalidReason::UnalignedSize => f.write_str("memory size is not page aligned"),
            InvalidReason::UnalignedGuestAddress => {
                f.write_str("guest physical address is not page aligned")
            }
            InvalidReason::UnalignedHostAddress => {
                f.write_str("host virtual address is not page aligned")
            }
            InvalidReason::HostRangeWraps => f.write_str("host virtual range wraps"),
            InvalidReason::SlotOutOfRange { slot, limit } => {
                write!(f, "slot {slot} out of range (limit {limit})")
            }
            InvalidReason::GuestRangeWraps => f.write_str("guest physical range wraps"),
            InvalidReason::TooManyPages { npages, max } => {
                write!(f, "{npages} pages exceeds per-slot maximum {max}")
            }
            InvalidReason::ResizeOrRemap => {
                f.write_str("existing slot cannot change size or host address")
            }
            InvalidReason::ReadonlyToggle => {
                f.write_str("existing slot cannot toggle read-only")
            }
            InvalidReason::DeleteMissing => f.write_str("deleting a slot that does not exist"),
            InvalidReason::PrivateSlot { slot } => {
                write!(f, "slot {slot} is private to the VMM")
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Request validation
// ═══════════════════════════════════════════════════════════════════════

/// Check a request's shape before it is compared with the table.
///
/// Host address alignment is only enforced for user slots; private
/// slots are populated by the VMM itself.
pub fn validate_request(req: &UserMemoryRegion, limits: &Limits) -> Result<(), InvalidReason> {
    debug_assert!(limits.user_slots <= limits.total_slots);

    let unknown = req.flags & !MEM_VALID_FLAGS;
    if unknown != 0 {
        return Err(InvalidReason::UnknownFlags(unknown));
    }
    if !page_aligned(req.memory_size) {
        return Err(InvalidReason::UnalignedSize);
    }
    if !page_aligned(req.guest_phys_addr) {
        return Err(InvalidReason::UnalignedGuestAddress);
    }
    if req.slot < u32::from(limits.user_slots) {
        if !page_aligned(req.userspace_addr) {
            return Err(InvalidReason::UnalignedHostAddress);
        }
        if req.userspace_addr.checked_add(req.memory_size).is_none() {
            return Err(InvalidReason::HostRangeWraps);
        }
    }
    if req.slot >= u32::from(limits.total_slots) {
        return Err(InvalidReason::SlotOutOfRange {
            slot: req.slot,
            limit: limits.total_slots,
        });
    }
    if req.guest_phys_addr.checked_add(req.memory_size).is_none() {
        return Err(InvalidReason::GuestRangeWraps);
    }
    let npages = req.page_count();
    if npages > limits.max_pages {
        return Err(InvalidReason::TooManyPages {
            npages,
            max: limits.max_pages,
        });
    }
    Ok(())
}

/// Flags a request actually asks for: a zero-sized region never logs.
pub fn effective_flags(req: &UserMemoryRegion) -> u32 {
    if req.memory_size == 0 {
        req.flags & !MEM_LOG_DIRTY_PAGES
    } else {
        req.flags
    }
}

/// Classify `new` against the slot's current geometry `old`.
///
/// Returns `Ok(None)` when the request changes nothing.
pub fn classify_change(old: &Geometry, new: &Geometry) -> Result<Option<ChangeKind>, InvalidReason> {
    let kind = if new.npages > 0 {
        if old.npages == 0 {
            Some(ChangeKind::Create)
        } else if new.userspace_addr != old.userspace_addr || new.npages != old.npages {
            return Err(InvalidReason::ResizeOrRemap);
        } else if (new.flags ^ old.flags) & MEM_READONLY != 0 {
            return Err(InvalidReason::ReadonlyToggle);
        } else if new.base_gfn != old.base_gfn {
            Some(ChangeKind::Move)
        } else if new.flags != old.flags {
            Some(ChangeKind::FlagsOnly)
        } else {
            None
        }
    } else if old.npages > 0 {
        Some(ChangeKind::Delete)
    } else {
        return Err(InvalidReason::DeleteMissing);
    };

    // Postcondition: only Create may start from an empty slot, only
    // Delete may end in one.
    debug_assert!(kind != Some(ChangeKind::Create) || old.npages == 0);
    debug_assert!(kind != Some(ChangeKind::Delete) || new.npages == 0);
    Ok(kind)
}

// ═══════════════════════════════════════════════════════════════════════
//  Frame arithmetic
// ═══════════════════════════════════════════════════════════════════════

/// True if `[a_base, a_base + a_npages)` and `[b_base, b_base + b_npages)`
/// share at least one frame.  Empty ranges overlap nothing.
pub fn ranges_overlap(a_base: u64, a_npages: u64, b_base: u64, b_npages: u64) -> bool {
    if a_npages == 0 || b_npages == 0 {
        return false;
    }
    let a_end = a_base.saturating_add(a_npages);
    let b_end = b_base.saturating_add(b_npages);
    a_base < b_end && b_base < a_end
}

/// Page offset of `gfn` within a slot, or `None` if outside it.
pub fn relative_page(base_gfn: u64, npages: u64, gfn: u64) -> Option<u64> {
    let rel = gfn.checked_sub(base_gfn)?;
    (rel < npages).then_some(rel)
}

/// Host virtual address of `gfn` inside a slot.
///
/// # Panics
///
/// Debug builds panic if `gfn` precedes the slot base.
pub fn gfn_to_hva(base_gfn: u64, userspace_addr: u64, gfn: u64) -> u64 {
    debug_assert!(gfn >= base_gfn, "gfn {gfn:#x} below slot base {base_gfn:#x}");
    userspace_addr + ((gfn - base_gfn) << PAGE_SHIFT)
}

/// Inverse of [`gfn_to_hva`]: frame backing `hva`, if inside the slot.
pub fn hva_to_gfn(base_gfn: u64, npages: u64, userspace_addr: u64, hva: u64) -> Option<u64> {
    let offset = hva.checked_sub(userspace_addr)?;
    let rel = offset / PAGE_SIZE;
    (rel < npages).then_some(base_gfn + rel)
}
