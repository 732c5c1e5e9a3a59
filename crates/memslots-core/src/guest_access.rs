//! Guest-physical byte access.
//!
//! Reads and writes of arbitrary guest ranges are split at page
//! boundaries and each piece is resolved through the active slot table
//! to a host virtual address.  Writes mark the touched pages dirty in
//! the owning slot.
//!
//! [`GfnToHvaCache`] binds a guest range once and reuses the resolved
//! host address for as long as the slot table generation is unchanged.

use log::trace;
use memslots_abi::{gfn_to_gpa, gpa_to_gfn, offset_in_page, PAGE_SIZE};
use thiserror::Error;

use crate::host::HostError;
use crate::memslot::Memslots;
use crate::verified::access::{fits_in_page, pages_spanned, segments};
use crate::vm::VmMemory;

/// Why a guest byte access failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// No usable slot covers the address.
    #[error("gpa {gpa:#x} is not backed by a usable slot")]
    NoMapping { gpa: u64 },

    /// Write to a read-only slot.
    #[error("gpa {gpa:#x} is read-only")]
    ReadOnly { gpa: u64 },

    /// The host refused the copy.
    #[error("host access at gpa {gpa:#x} failed")]
    Host {
        gpa: u64,
        #[source]
        source: HostError,
    },

    /// A single-page access that runs past the end of the page.
    #[error("access of {len} bytes at offset {offset:#x} crosses the end of gfn {gfn:#x}")]
    PageOverflow { gfn: u64, offset: usize, len: usize },

    /// The range wraps the guest-physical address space.
    #[error("range {gpa:#x}+{len:#x} wraps the guest address space")]
    InvalidRange { gpa: u64, len: u64 },

    /// A cached access larger than the range the cache was bound to.
    #[error("access of {len} bytes exceeds cached range of {cached}")]
    CacheOverflow { len: usize, cached: u64 },
}

fn check_page(gfn: u64, offset: usize, len: usize) -> Result<(), AccessError> {
    if fits_in_page(offset, len) {
        Ok(())
    } else {
        Err(AccessError::PageOverflow { gfn, offset, len })
    }
}

fn check_range(gpa: u64, len: usize) -> Result<(), AccessError> {
    match pages_spanned(gpa, len as u64) {
        Some(_) => Ok(()),
        None => Err(AccessError::InvalidRange {
            gpa,
            len: len as u64,
        }),
    }
}

/// Resolve `gfn` for an access; `write` rejects read-only slots.
fn page_hva(slots: &Memslots, gfn: u64, offset: usize, write: bool) -> Result<u64, AccessError> {
    let gpa = gfn_to_gpa(gfn) + offset as u64;
    let slot = slots.find_usable(gfn).ok_or(AccessError::NoMapping { gpa })?;
    if write && slot.is_readonly() {
        return Err(AccessError::ReadOnly { gpa });
    }
    Ok(slot.gfn_to_hva(gfn) + offset as u64)
}

impl VmMemory {
    // ═══════════════════════════════════════════════════════════════════
    //  Address resolution
    // ═══════════════════════════════════════════════════════════════════

    /// Host address backing `gfn`, for write access.
    pub fn gfn_to_hva(&self, gfn: u64) -> Option<u64> {
        let guard = self.srcu.read_lock();
        self.slots
            .read(&guard)
            .find_usable(gfn)
            .filter(|s| !s.is_readonly())
            .map(|s| s.gfn_to_hva(gfn))
    }

    /// Host address backing `gfn` and whether it may be written.
    pub fn gfn_to_hva_prot(&self, gfn: u64) -> Option<(u64, bool)> {
        let guard = self.srcu.read_lock();
        self.slots
            .read(&guard)
            .find_usable(gfn)
            .map(|s| (s.gfn_to_hva(gfn), !s.is_readonly()))
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Page access
    // ═══════════════════════════════════════════════════════════════════

    fn read_page_in(
        &self,
        slots: &Memslots,
        gfn: u64,
        data: &mut [u8],
        offset: usize,
    ) -> Result<(), AccessError> {
        check_page(gfn, offset, data.len())?;
        let hva = page_hva(slots, gfn, offset, false)?;
        self.host.read(hva, data).map_err(|source| AccessError::Host {
            gpa: gfn_to_gpa(gfn) + offset as u64,
            source,
        })
    }

    fn write_page_in(
        &self,
        slots: &Memslots,
        gfn: u64,
        data: &[u8],
        offset: usize,
    ) -> Result<(), AccessError> {
        check_page(gfn, offset, data.len())?;
        let hva = page_hva(slots, gfn, offset, true)?;
        self.host.write(hva, data).map_err(|source| AccessError::Host {
            gpa: gfn_to_gpa(gfn) + offset as u64,
            source,
        })?;
        self.mark_page_dirty_in(slots, gfn);
        Ok(())
    }

    /// Read `data.len()` bytes at `offset` inside page `gfn`.
    pub fn read_guest_page(&self, gfn: u64, data: &mut [u8], offset: usize) -> Result<(), AccessError> {
        let guard = self.srcu.read_lock();
        self.read_page_in(self.slots.read(&guard), gfn, data, offset)
    }

    /// Write `data` at `offset` inside page `gfn` and mark it dirty.
    pub fn write_guest_page(&self, gfn: u64, data: &[u8], offset: usize) -> Result<(), AccessError> {
        let guard = self.srcu.read_lock();
        self.write_page_in(self.slots.read(&guard), gfn, data, offset)
    }

    /// Zero `len` bytes at `offset` inside page `gfn`.
    pub fn clear_guest_page(&self, gfn: u64, offset: usize, len: usize) -> Result<(), AccessError> {
        check_page(gfn, offset, len)?;
        let zeros = [0u8; PAGE_SIZE as usize];
        self.write_guest_page(gfn, &zeros[..len], offset)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Range access
    // ═══════════════════════════════════════════════════════════════════

    /// Read `buf.len()` bytes starting at `gpa`.
    ///
    /// Stops at the first page that fails; earlier pages are already
    /// copied into `buf`.
    pub fn read_guest(&self, gpa: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        check_range(gpa, buf.len())?;
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        for seg in segments(gpa, buf.len()) {
            let chunk = &mut buf[seg.buf_offset..seg.buf_offset + seg.len];
            self.read_page_in(slots, seg.gfn, chunk, seg.offset)?;
        }
        Ok(())
    }

    /// Write `data` starting at `gpa`, marking every page dirty.
    pub fn write_guest(&self, gpa: u64, data: &[u8]) -> Result<(), AccessError> {
        check_range(gpa, data.len())?;
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        for seg in segments(gpa, data.len()) {
            let chunk = &data[seg.buf_offset..seg.buf_offset + seg.len];
            self.write_page_in(slots, seg.gfn, chunk, seg.offset)?;
        }
        Ok(())
    }

    /// Zero `len` bytes starting at `gpa`.
    pub fn clear_guest(&self, gpa: u64, len: usize) -> Result<(), AccessError> {
        check_range(gpa, len)?;
        let zeros = [0u8; PAGE_SIZE as usize];
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        for seg in segments(gpa, len) {
            self.write_page_in(slots, seg.gfn, &zeros[..seg.len], seg.offset)?;
        }
        Ok(())
    }

    /// Read without ever faulting a page in.
    ///
    /// Fails with [`HostError::WouldBlock`] inside [`AccessError::Host`]
    /// if any page is not resident.
    pub fn read_guest_atomic(&self, gpa: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        check_range(gpa, buf.len())?;
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        for seg in segments(gpa, buf.len()) {
            let hva = page_hva(slots, seg.gfn, seg.offset, false)?;
            let chunk = &mut buf[seg.buf_offset..seg.buf_offset + seg.len];
            self.host
                .read_nofault(hva, chunk)
                .map_err(|source| AccessError::Host {
                    gpa: gfn_to_gpa(seg.gfn) + seg.offset as u64,
                    source,
                })?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Cached access
    // ═══════════════════════════════════════════════════════════════════

    /// Write through `cache`, revalidating it if the slot table changed.
    pub fn write_cached(&self, cache: &mut GfnToHvaCache, data: &[u8]) -> Result<(), AccessError> {
        if data.len() as u64 > cache.len {
            return Err(AccessError::CacheOverflow {
                len: data.len(),
                cached: cache.len,
            });
        }
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        if cache.generation != slots.generation() {
            trace!("gpa cache {:#x}: generation {} is stale", cache.gpa, cache.generation);
            cache.refresh(slots);
        }

        let (Some(hva), Some(id)) = (cache.hva, cache.slot) else {
            drop(guard);
            return self.write_guest(cache.gpa, data);
        };
        self.host.write(hva, data).map_err(|source| AccessError::Host {
            gpa: cache.gpa,
            source,
        })?;
        if let Some(slot) = slots.get(id) {
            let first = gpa_to_gfn(cache.gpa);
            let spanned = pages_spanned(cache.gpa, data.len() as u64).unwrap_or(cache.pages);
            for gfn in first..first + spanned {
                slot.mark_dirty(gfn);
            }
        }
        Ok(())
    }

    /// Read through `cache`, revalidating it if the slot table changed.
    pub fn read_cached(&self, cache: &mut GfnToHvaCache, buf: &mut [u8]) -> Result<(), AccessError> {
        if buf.len() as u64 > cache.len {
            return Err(AccessError::CacheOverflow {
                len: buf.len(),
                cached: cache.len,
            });
        }
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        if cache.generation != slots.generation() {
            cache.refresh(slots);
        }

        let Some(hva) = cache.hva else {
            drop(guard);
            return self.read_guest(cache.gpa, buf);
        };
        self.host.read(hva, buf).map_err(|source| AccessError::Host {
            gpa: cache.gpa,
            source,
        })
    }
}

/// A guest range bound to its host address at one table generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GfnToHvaCache {
    gpa: u64,
    len: u64,
    pages: u64,
    generation: u64,
    hva: Option<u64>,
    slot: Option<u16>,
}

impl GfnToHvaCache {
    /// Bind `[gpa, gpa + len)`.
    ///
    /// A range that crosses slots, or lands on a read-only or missing
    /// slot, is still bound but every access takes the segmented path.
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidRange`] if the range wraps the address space.
    pub fn init(vm: &VmMemory, gpa: u64, len: u64) -> Result<Self, AccessError> {
        let pages = pages_spanned(gpa, len).ok_or(AccessError::InvalidRange { gpa, len })?;
        let mut cache = Self {
            gpa,
            len,
            pages,
            ..Self::default()
        };
        let guard = vm.srcu.read_lock();
        cache.refresh(vm.slots.read(&guard));
        Ok(cache)
    }

    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Table generation the cache was resolved at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if accesses go straight to a cached host address.
    pub fn is_direct(&self) -> bool {
        self.hva.is_some()
    }

    fn refresh(&mut self, slots: &Memslots) {
        self.generation = slots.generation();
        self.hva = None;
        self.slot = None;

        let start = gpa_to_gfn(self.gpa);
        let needed = self.pages;
        let Some(slot) = slots.find_usable(start) else {
            return;
        };
        if slot.is_readonly() || slot.end_gfn() - start < needed {
            return;
        }
        self.hva = Some(slot.gfn_to_hva(start) + offset_in_page(self.gpa));
        self.slot = Some(slot.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use memslots_abi::{UserMemoryRegion, MEM_LOG_DIRTY_PAGES, MEM_READONLY};

    // ─── Page and range access ───────────────────────────────────────

    #[test]
    fn write_then_read_across_pages() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let gpa = gfn_to_gpa(0x100) + PAGE_SIZE - 3;
        h.vm.write_guest(gpa, b"hello, world").unwrap();
        let mut out = [0u8; 12];
        h.vm.read_guest(gpa, &mut out).unwrap();
        assert_eq!(&out, b"hello, world");

        let mut tail = [0u8; 9];
        h.vm.read_guest_page(0x101, &mut tail, 0).unwrap();
        assert_eq!(&tail, b"lo, world");
    }

    #[test]
    fn writes_mark_every_touched_page_dirty() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 8, MEM_LOG_DIRTY_PAGES);
        h.vm.write_guest(gfn_to_gpa(0x102) + 0x800, &[1u8; 0x1000]).unwrap();
        h.vm.write_guest_page(0x106, &[2], 10).unwrap();
        assert_eq!(h.vm.get_dirty_log(0).unwrap().dirty_pages(), vec![2, 3, 6]);
    }

    #[test]
    fn n_distinct_writes_set_n_bits() {
        let h = Harness::new();
        h.add_slot(0, 0x400, 256, MEM_LOG_DIRTY_PAGES);
        let pages = [0u64, 1, 63, 64, 65, 200, 255];
        for p in pages {
            h.vm.write_guest(gfn_to_gpa(0x400 + p), &[0xff]).unwrap();
        }
        let log = h.vm.get_dirty_log(0).unwrap();
        assert!(log.any_dirty);
        assert_eq!(log.dirty_pages(), pages.to_vec());
    }

    #[test]
    fn unlogged_slot_has_no_bitmap() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.vm.write_guest(gfn_to_gpa(0x100), &[1]).unwrap();
        assert!(h.vm.get_dirty_log(0).is_err());
    }

    #[test]
    fn clear_zeroes_range() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let gpa = gfn_to_gpa(0x100);
        h.vm.write_guest(gpa, &[0xaa; 0x2000]).unwrap();
        h.vm.clear_guest(gpa + 0x10, 0x1ff0).unwrap();
        h.vm.clear_guest_page(0x100, 0, 0x10).unwrap();
        let mut out = vec![0xffu8; 0x2000];
        h.vm.read_guest(gpa, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_only_slot_refuses_writes() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, MEM_READONLY);
        let gpa = gfn_to_gpa(0x101) + 4;
        assert_eq!(h.vm.write_guest(gpa, &[1]), Err(AccessError::ReadOnly { gpa }));
        let mut b = [0u8; 1];
        h.vm.read_guest(gpa, &mut b).unwrap();
        assert!(h.vm.gfn_to_hva(0x101).is_none());
        assert_eq!(h.vm.gfn_to_hva_prot(0x101), Some((h.hva(0x101), false)));
    }

    #[test]
    fn range_leaving_slot_fails_at_the_gap() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 1, 0);
        let err = h.vm.write_guest(gfn_to_gpa(0x100) + 0xff0, &[0; 0x20]).unwrap_err();
        assert_eq!(err, AccessError::NoMapping { gpa: gfn_to_gpa(0x101) });
    }

    #[test]
    fn page_access_must_end_inside_the_page() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 2, MEM_LOG_DIRTY_PAGES);
        h.vm.write_guest_page(0x100, &[0xaa; 4], 4092).unwrap();
        assert_eq!(
            h.vm.write_guest_page(0x100, &[0xbb; 8], 4092),
            Err(AccessError::PageOverflow { gfn: 0x100, offset: 4092, len: 8 })
        );
        let mut out = [0u8; 8];
        assert_eq!(
            h.vm.read_guest_page(0x100, &mut out, 4092),
            Err(AccessError::PageOverflow { gfn: 0x100, offset: 4092, len: 8 })
        );

        // Nothing spilled into the next page.
        let mut next = [0xffu8; 4];
        h.vm.read_guest_page(0x101, &mut next, 0).unwrap();
        assert_eq!(next, [0; 4]);
        let mut tail = [0u8; 4];
        h.vm.read_guest_page(0x100, &mut tail, 4092).unwrap();
        assert_eq!(tail, [0xaa; 4]);
        assert_eq!(h.vm.get_dirty_log(0).unwrap().dirty_pages(), vec![0]);
    }

    #[test]
    fn clear_page_rejects_oversized_length() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 2, 0);
        assert_eq!(
            h.vm.clear_guest_page(0x100, 0, 5000),
            Err(AccessError::PageOverflow { gfn: 0x100, offset: 0, len: 5000 })
        );
        assert_eq!(
            h.vm.clear_guest_page(0x100, usize::MAX, 1),
            Err(AccessError::PageOverflow { gfn: 0x100, offset: usize::MAX, len: 1 })
        );
        h.vm.clear_guest_page(0x100, 0, PAGE_SIZE as usize).unwrap();
    }

    #[test]
    fn wrapping_range_is_rejected() {
        let h = Harness::new();
        let gpa = u64::MAX - 3;
        assert_eq!(
            h.vm.write_guest(gpa, &[0; 8]),
            Err(AccessError::InvalidRange { gpa, len: 8 })
        );
        assert_eq!(
            GfnToHvaCache::init(&h.vm, gpa, 8),
            Err(AccessError::InvalidRange { gpa, len: 8 })
        );
    }

    #[test]
    fn atomic_read_never_faults_in() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 2, 0);
        h.host.swap_out(h.hva(0x101));
        let mut b = [0u8; 8];
        h.vm.read_guest_atomic(gfn_to_gpa(0x100), &mut b).unwrap();
        let err = h.vm.read_guest_atomic(gfn_to_gpa(0x101), &mut b).unwrap_err();
        assert!(matches!(
            err,
            AccessError::Host { source: HostError::WouldBlock { .. }, .. }
        ));
        assert!(!h.host.is_resident(h.hva(0x101)));
    }

    // ─── Cache ───────────────────────────────────────────────────────

    #[test]
    fn cache_goes_direct_inside_one_slot() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, MEM_LOG_DIRTY_PAGES);
        let gpa = gfn_to_gpa(0x101) + 0xff8;
        let mut cache = GfnToHvaCache::init(&h.vm, gpa, 16).unwrap();
        assert!(cache.is_direct());
        h.vm.write_cached(&mut cache, &[7u8; 16]).unwrap();
        let mut out = [0u8; 16];
        h.vm.read_cached(&mut cache, &mut out).unwrap();
        assert_eq!(out, [7u8; 16]);
        assert_eq!(h.vm.get_dirty_log(0).unwrap().dirty_pages(), vec![1, 2]);
    }

    #[test]
    fn cache_across_slots_uses_segmented_path() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 1, 0);
        h.add_slot(1, 0x101, 1, 0);
        let gpa = gfn_to_gpa(0x100) + 0xffc;
        let mut cache = GfnToHvaCache::init(&h.vm, gpa, 8).unwrap();
        assert!(!cache.is_direct());
        h.vm.write_cached(&mut cache, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut out = [0u8; 8];
        h.vm.read_guest(gpa, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn cache_revalidates_after_move() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let mut cache = GfnToHvaCache::init(&h.vm, gfn_to_gpa(0x100), 8).unwrap();
        let stamped = cache.generation();

        // Move the slot's guest range; the old gpa becomes unbacked.
        let moved = UserMemoryRegion::new(0, gfn_to_gpa(0x800), 4 * PAGE_SIZE, h.hva(0x100));
        h.vm.set_user_region(&moved).unwrap();

        let err = h.vm.write_cached(&mut cache, &[1]).unwrap_err();
        assert_eq!(err, AccessError::NoMapping { gpa: gfn_to_gpa(0x100) });
        assert!(cache.generation() > stamped);
        assert!(!cache.is_direct());
    }

    #[test]
    fn cache_rejects_oversized_access() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let mut cache = GfnToHvaCache::init(&h.vm, gfn_to_gpa(0x100), 4).unwrap();
        assert_eq!(
            h.vm.write_cached(&mut cache, &[0; 5]),
            Err(AccessError::CacheOverflow { len: 5, cached: 4 })
        );
    }
}
