//! Request-surface ABI for the memslots guest-physical memory core.
//!
//! This crate defines the constants, flag bits and `#[repr(C)]` records
//! exchanged between a VMM's command-dispatch layer and the memory core.
//! It is `no_std`-compatible with zero dependencies so that both the
//! management plane and the core can share one definition.
//!
//! # Region requests
//!
//! Every topology change is expressed as a single [`UserMemoryRegion`]:
//!
//! 1. `memory_size > 0` on an empty slot creates it
//! 2. a new `guest_phys_addr` on an existing slot moves it
//! 3. new `flags` on an existing slot toggle dirty logging
//! 4. `memory_size == 0` on an existing slot deletes it
//!
//! # Dirty bitmaps
//!
//! Dirty logs are one bit per guest page, relative to the owning slot's
//! base frame, stored as `u64` words with bit `n` at word `n / 64`, bit
//! `n % 64`.  Serialised with [`bitmap_to_le_bytes`] this is exactly the
//! little-endian-per-word layout KVM hands to user space.

#![cfg_attr(not(feature = "std"), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Page geometry
// ═══════════════════════════════════════════════════════════════════════

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes (4 KB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the offset-within-page bits of an address.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Guest frame number containing guest physical address `gpa`.
pub const fn gpa_to_gfn(gpa: u64) -> u64 {
    gpa >> PAGE_SHIFT
}

/// Guest physical address of the first byte of frame `gfn`.
pub const fn gfn_to_gpa(gfn: u64) -> u64 {
    gfn << PAGE_SHIFT
}

/// Offset of `addr` within its page.
pub const fn offset_in_page(addr: u64) -> u64 {
    addr & PAGE_OFFSET_MASK
}

/// True if `addr` sits on a page boundary.
pub const fn page_aligned(addr: u64) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

// ═══════════════════════════════════════════════════════════════════════
//  Slot limits
// ═══════════════════════════════════════════════════════════════════════

/// Default number of slots settable through the request surface.
pub const DEFAULT_USER_MEM_SLOTS: u16 = 32;

/// Default number of private slots reserved for the VMM itself
/// (TSS, identity map, APIC access page on x86).
pub const DEFAULT_PRIVATE_MEM_SLOTS: u16 = 3;

/// Hard ceiling on the total number of slots in one table.
///
/// Slot ids are carried in a `u16` inside the core, but the request
/// record uses `u32`; ids at or above this value are always invalid.
pub const MAX_MEM_SLOTS: u16 = 512;

/// Largest page count a single slot may describe (2^31 - 1).
pub const MAX_NR_PAGES: u64 = (1 << 31) - 1;

// ═══════════════════════════════════════════════════════════════════════
//  Region flags
// ═══════════════════════════════════════════════════════════════════════

/// Track guest writes to this slot in a dirty bitmap.
pub const MEM_LOG_DIRTY_PAGES: u32 = 1 << 0;

/// Guest writes to this slot are rejected; mappings are never writable.
pub const MEM_READONLY: u32 = 1 << 1;

/// Every flag a region request may carry.
pub const MEM_VALID_FLAGS: u32 = MEM_LOG_DIRTY_PAGES | MEM_READONLY;

const _: () = assert!(MEM_LOG_DIRTY_PAGES & MEM_READONLY == 0);
const _: () = assert!(DEFAULT_USER_MEM_SLOTS + DEFAULT_PRIVATE_MEM_SLOTS <= MAX_MEM_SLOTS);

// ═══════════════════════════════════════════════════════════════════════
//  Region request
// ═══════════════════════════════════════════════════════════════════════

/// One create/move/delete/flags-only request.
///
/// Field layout matches `struct kvm_userspace_memory_region` so a VMM
/// can forward either record unchanged.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UserMemoryRegion {
    /// Slot id; stable across moves.
    pub slot: u32,
    /// `MEM_*` flag bits.
    pub flags: u32,
    /// Guest physical base address.  Must be page aligned.
    pub guest_phys_addr: u64,
    /// Size in bytes.  Must be page aligned; zero deletes the slot.
    pub memory_size: u64,
    /// Host virtual base address of the backing memory.
    pub userspace_addr: u64,
}

const _: () = assert!(core::mem::size_of::<UserMemoryRegion>() == 32);

impl UserMemoryRegion {
    /// Build a request for `slot` covering `memory_size` bytes at `guest_phys_addr`.
    pub const fn new(slot: u32, guest_phys_addr: u64, memory_size: u64, userspace_addr: u64) -> Self {
        Self {
            slot,
            flags: 0,
            guest_phys_addr,
            memory_size,
            userspace_addr,
        }
    }

    /// Request that deletes `slot`.
    pub const fn delete(slot: u32) -> Self {
        Self::new(slot, 0, 0, 0)
    }

    /// Same request with `flags` replaced.
    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Number of whole guest pages described by `memory_size`.
    pub const fn page_count(&self) -> u64 {
        self.memory_size >> PAGE_SHIFT
    }

    /// First guest frame number covered.
    pub const fn base_gfn(&self) -> u64 {
        gpa_to_gfn(self.guest_phys_addr)
    }

    /// True if dirty logging is requested.
    pub const fn log_dirty(&self) -> bool {
        self.flags & MEM_LOG_DIRTY_PAGES != 0
    }

    /// True if the region is read-only for the guest.
    pub const fn readonly(&self) -> bool {
        self.flags & MEM_READONLY != 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Dirty log
// ═══════════════════════════════════════════════════════════════════════

/// Bits per dirty-bitmap word.
pub const BITS_PER_WORD: u64 = u64::BITS as u64;

/// Number of `u64` words needed to hold one bit for each of `npages` pages.
pub const fn bitmap_words(npages: u64) -> usize {
    npages.div_ceil(BITS_PER_WORD) as usize
}

/// Byte size of a dirty bitmap for `npages` pages (whole words).
pub const fn bitmap_bytes(npages: u64) -> usize {
    bitmap_words(npages) * core::mem::size_of::<u64>()
}

/// Word index and in-word mask for page `nr`.
pub const fn bit_position(nr: u64) -> (usize, u64) {
    ((nr / BITS_PER_WORD) as usize, 1u64 << (nr % BITS_PER_WORD))
}

/// Set bit `nr` in a plain bitmap.
///
/// # Panics
///
/// Panics if `nr` is beyond the end of `words`.
pub fn set_bit_le(words: &mut [u64], nr: u64) {
    let (word, mask) = bit_position(nr);
    words[word] |= mask;
}

/// Test bit `nr` in a plain bitmap.  Bits past the end read as clear.
pub fn test_bit_le(words: &[u64], nr: u64) -> bool {
    let (word, mask) = bit_position(nr);
    words.get(word).is_some_and(|w| w & mask != 0)
}

/// Number of set bits.
pub fn count_dirty(words: &[u64]) -> u64 {
    words.iter().map(|w| u64::from(w.count_ones())).sum()
}

/// Serialise `words` as little-endian bytes into `out`.
///
/// Returns the number of bytes written, or `None` if `out` is too small.
pub fn bitmap_to_le_bytes(words: &[u64], out: &mut [u8]) -> Option<usize> {
    let len = words.len() * core::mem::size_of::<u64>();
    if out.len() < len {
        return None;
    }
    for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(len)
}

/// Dirty-log retrieval request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyLogRequest {
    /// User slot id.
    pub slot: u32,
    pub _padding: u32,
}

/// Dirty-log retrieval response.
///
/// Only available with the `std` feature (requires heap allocation).
#[cfg(feature = "std")]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyLog {
    /// Bitmap copy, one bit per page relative to the slot base.
    pub bitmap: Vec<u64>,
    /// True if at least one bit is set.
    pub any_dirty: bool,
}

#[cfg(feature = "std")]
impl DirtyLog {
    /// Offsets (relative to the slot base) of every dirty page.
    pub fn dirty_pages(&self) -> Vec<u64> {
        let mut pages = Vec::new();
        for (i, &word) in self.bitmap.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = u64::from(w.trailing_zeros());
                pages.push(i as u64 * BITS_PER_WORD + bit);
                w &= w - 1;
            }
        }
        pages
    }

    /// The bitmap in the little-endian byte layout user space expects.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bitmap.len() * 8];
        let _ = bitmap_to_le_bytes(&self.bitmap, &mut out);
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  I/O buses
// ═══════════════════════════════════════════════════════════════════════

/// Maximum number of ranges registered on one I/O bus by default.
pub const NR_IOBUS_DEVS: usize = 1000;

/// Memory-mapped I/O bus index.
pub const MMIO_BUS: u32 = 0;

/// Port I/O bus index.
pub const PIO_BUS: u32 = 1;

/// Number of I/O buses per VM.
pub const NR_BUSES: usize = 2;
