//! Host memory manager interface and a simulated implementation.
//!
//! The core never touches host page tables.  Everything it needs from the
//! host (pinning a page, looking up the mapping behind an address, copying
//! bytes) goes through [`HostMemory`], and the host reports mapping
//! changes back through [`HostMappingListener`].
//!
//! [`SimulatedHost`] models a host process address space on top of a
//! `vm-memory` mmap: addresses in the simulated space are "host virtual
//! addresses", pages can be swapped out, poisoned, migrated or
//! write-protected, and device (PFN-mapped) ranges can be added.  Every
//! such change fires the same notifications a real kernel would.
//!
//! # Example
//!
//! ```no_run
//! use memslots_core::host::{HostMemory, SimulatedHost};
//!
//! let host = SimulatedHost::new(&[(0x7f00_0000_0000, 16 << 20)]).unwrap();
//! let pfn = host.pin_slow(0x7f00_0000_0000, true, false).unwrap();
//! host.put_page(pfn);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info};
use memslots_abi::{PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A host physical frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pfn(pub u64);

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn {:#x}", self.0)
    }
}

/// What backs a host mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// Ordinary pageable memory.
    Anonymous,
    /// Raw device memory; frames start at `pgoff` and cannot be pinned.
    PfnMap { pgoff: u64 },
}

/// One host mapping `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostVma {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub kind: VmaKind,
    /// Size of the host pages backing the mapping.
    pub page_size: u64,
}

impl HostVma {
    pub fn contains(&self, hva: u64) -> bool {
        (self.start..self.end).contains(&hva)
    }

    /// True if an access of the given direction is permitted.
    pub fn allows(&self, write: bool) -> bool {
        if write {
            self.writable
        } else {
            self.readable
        }
    }
}

/// Errors reported by the host memory manager.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The page is not resident and the caller asked not to wait.
    #[error("page at {hva:#x} is not resident")]
    WouldBlock { hva: u64 },

    /// The page has an uncorrectable hardware error.
    #[error("page at {hva:#x} is hardware-poisoned")]
    Poisoned { hva: u64 },

    /// No mapping, or the mapping does not allow the access.
    #[error("no usable mapping at {hva:#x}")]
    Fault { hva: u64 },

    /// Faulting the page in was interrupted by a pending signal.
    #[error("fault at {hva:#x} interrupted by a signal")]
    Interrupted { hva: u64 },

    /// The backing mmap could not be created.
    #[error("failed to create {size} bytes of host memory")]
    Create { size: usize },
}

// ═══════════════════════════════════════════════════════════════════════
//  Interfaces
// ═══════════════════════════════════════════════════════════════════════

/// The host memory manager as seen by the memory core.
pub trait HostMemory: Send + Sync {
    /// Pin the page at `hva` writable without sleeping.
    ///
    /// Succeeds only if the page is resident, healthy and writable.
    fn pin_fast(&self, hva: u64) -> Option<Pfn>;

    /// Pin the page at `hva`, faulting it in if needed.
    ///
    /// With `nowait`, a non-resident page yields [`HostError::WouldBlock`]
    /// instead of sleeping.
    fn pin_slow(&self, hva: u64, write: bool, nowait: bool) -> Result<Pfn, HostError>;

    /// The mapping containing `hva`, if any.
    fn find_vma(&self, hva: u64) -> Option<HostVma>;

    /// True if the page at `hva` is hardware-poisoned.
    fn is_hwpoison(&self, hva: u64) -> bool;

    /// Drop one pin on `pfn`.
    fn put_page(&self, pfn: Pfn);

    /// Record that `pfn` was written through a pin.
    fn set_page_dirty(&self, pfn: Pfn);

    /// Record that `pfn` was used through a pin.
    fn mark_page_accessed(&self, pfn: Pfn);

    /// Copy bytes out of host memory, faulting pages in as needed.
    fn read(&self, hva: u64, buf: &mut [u8]) -> Result<(), HostError>;

    /// Copy bytes out of host memory without sleeping.
    fn read_nofault(&self, hva: u64, buf: &mut [u8]) -> Result<(), HostError>;

    /// Copy bytes into host memory, faulting pages in as needed.
    fn write(&self, hva: u64, data: &[u8]) -> Result<(), HostError>;

    /// Host page size backing `hva`.
    fn page_size(&self, hva: u64) -> u64 {
        self.find_vma(hva).map_or(PAGE_SIZE, |v| v.page_size)
    }

    /// Subscribe to mapping-change notifications.
    fn register_notifier(&self, listener: Weak<dyn HostMappingListener>);
}

/// Mapping-change notifications delivered by the host.
///
/// `invalidate_range_start` is delivered before the mappings in the
/// range are torn down and `invalidate_range_end` after; single-page
/// events are delivered after the page table entry changed but before
/// the old page is freed.
pub trait HostMappingListener: Send + Sync {
    fn invalidate_page(&self, hva: u64);
    fn invalidate_range_start(&self, start: u64, end: u64);
    fn invalidate_range_end(&self, start: u64, end: u64);
    fn change_pte(&self, hva: u64, pfn: Pfn);
    fn clear_flush_young(&self, start: u64, end: u64) -> bool;
    fn test_young(&self, hva: u64) -> bool;
    fn release(&self);
}

// ═══════════════════════════════════════════════════════════════════════
//  SimulatedHost
// ═══════════════════════════════════════════════════════════════════════

type FaultHook = Arc<dyn Fn(u64) + Send + Sync>;

/// First frame number handed out to migrated pages.
const MIGRATED_PFN_BASE: u64 = 1 << 40;

#[derive(Default)]
struct HostState {
    vmas: BTreeMap<u64, HostVma>,
    swapped: HashSet<u64>,
    poisoned: HashSet<u64>,
    remapped: HashMap<u64, Pfn>,
    pins: HashMap<Pfn, u64>,
    dirty: HashSet<Pfn>,
    accessed: HashSet<Pfn>,
    next_pfn: u64,
}

impl HostState {
    fn vma(&self, hva: u64) -> Option<&HostVma> {
        self.vmas
            .range(..=hva)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.contains(hva))
    }

    fn pfn_of(&self, page: u64) -> Pfn {
        self.remapped
            .get(&page)
            .copied()
            .unwrap_or(Pfn(page >> PAGE_SHIFT))
    }

    fn pin(&mut self, page: u64) -> Pfn {
        let pfn = self.pfn_of(page);
        *self.pins.entry(pfn).or_default() += 1;
        pfn
    }

    /// Check every page of `[hva, hva + len)` for an anonymous access.
    fn check_access(&self, hva: u64, len: usize, write: bool) -> Result<(), HostError> {
        let end = hva + len as u64;
        let mut page = page_of(hva);
        while page < end {
            match self.vma(page) {
                Some(v) if v.kind == VmaKind::Anonymous && v.allows(write) => {}
                _ => return Err(HostError::Fault { hva: page.max(hva) }),
            }
            if self.poisoned.contains(&page) {
                return Err(HostError::Poisoned { hva: page.max(hva) });
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    fn first_swapped(&self, hva: u64, len: usize) -> Option<u64> {
        let end = hva + len as u64;
        let mut page = page_of(hva);
        while page < end {
            if self.swapped.contains(&page) {
                return Some(page);
            }
            page += PAGE_SIZE;
        }
        None
    }
}

fn page_of(hva: u64) -> u64 {
    hva & !PAGE_OFFSET_MASK
}

/// An in-process model of a host address space.
pub struct SimulatedHost {
    memory: GuestMemoryMmap,
    state: Mutex<HostState>,
    listeners: RwLock<Vec<Weak<dyn HostMappingListener>>>,
    fault_hook: RwLock<Option<FaultHook>>,
    signal_pending: AtomicBool,
}

impl SimulatedHost {
    /// Map anonymous read-write memory at each `(hva, len)`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Create`] if the backing mmap fails.
    pub fn new(ranges: &[(u64, usize)]) -> Result<Self, HostError> {
        let regions: Vec<(GuestAddress, usize)> =
            ranges.iter().map(|&(hva, len)| (GuestAddress(hva), len)).collect();
        let total: usize = ranges.iter().map(|&(_, len)| len).sum();
        let memory =
            GuestMemoryMmap::from_ranges(&regions).map_err(|_| HostError::Create { size: total })?;

        let mut state = HostState {
            next_pfn: MIGRATED_PFN_BASE,
            ..HostState::default()
        };
        for &(start, len) in ranges {
            state.vmas.insert(
                start,
                HostVma {
                    start,
                    end: start + len as u64,
                    readable: true,
                    writable: true,
                    kind: VmaKind::Anonymous,
                    page_size: PAGE_SIZE,
                },
            );
        }

        info!(
            "Simulated host created: {} ranges, {} MB",
            ranges.len(),
            total / (1024 * 1024)
        );

        Ok(Self {
            memory,
            state: Mutex::new(state),
            listeners: RwLock::new(Vec::new()),
            fault_hook: RwLock::new(None),
            signal_pending: AtomicBool::new(false),
        })
    }

    /// Map a device range whose frames start at `pgoff`.
    pub fn add_device_region(&self, start: u64, len: u64, pgoff: u64, writable: bool) {
        self.state.lock().vmas.insert(
            start,
            HostVma {
                start,
                end: start + len,
                readable: true,
                writable,
                kind: VmaKind::PfnMap { pgoff },
                page_size: PAGE_SIZE,
            },
        );
    }

    /// Report host pages of `page_size` bytes for the mapping at `start`.
    pub fn set_page_size(&self, start: u64, page_size: u64) {
        if let Some(v) = self.state.lock().vmas.get_mut(&start) {
            v.page_size = page_size;
        }
    }

    /// Evict the page at `hva`; the next blocking access faults it back in.
    pub fn swap_out(&self, hva: u64) {
        let page = page_of(hva);
        self.state.lock().swapped.insert(page);
        debug!("host: swapped out {page:#x}");
        self.notify(|l| l.invalidate_page(page));
    }

    /// Mark the page at `hva` as hardware-poisoned and unmap it.
    pub fn poison(&self, hva: u64) {
        let page = page_of(hva);
        self.state.lock().poisoned.insert(page);
        self.notify(|l| l.invalidate_page(page));
    }

    /// Move the page at `hva` to a new frame, retargeting its mapping.
    pub fn migrate(&self, hva: u64) -> Pfn {
        let page = page_of(hva);
        let pfn = {
            let mut state = self.state.lock();
            let pfn = Pfn(state.next_pfn);
            state.next_pfn += 1;
            state.remapped.insert(page, pfn);
            pfn
        };
        self.notify(|l| l.change_pte(page, pfn));
        pfn
    }

    /// Change write permission on `[start, start + len)`.
    pub fn protect(&self, start: u64, len: u64, writable: bool) {
        let end = start + len;
        self.notify(|l| l.invalidate_range_start(start, end));
        {
            let mut state = self.state.lock();
            for (_, v) in state.vmas.range_mut(..end) {
                if v.end > start {
                    v.writable = writable;
                }
            }
        }
        self.notify(|l| l.invalidate_range_end(start, end));
    }

    /// Remove every mapping starting inside `[start, start + len)`.
    pub fn unmap(&self, start: u64, len: u64) {
        let end = start + len;
        self.notify(|l| l.invalidate_range_start(start, end));
        {
            let mut state = self.state.lock();
            let doomed: Vec<u64> = state.vmas.range(start..end).map(|(&k, _)| k).collect();
            for k in doomed {
                state.vmas.remove(&k);
            }
        }
        self.notify(|l| l.invalidate_range_end(start, end));
    }

    /// Ask listeners whether `[start, start + len)` was used, clearing
    /// their accessed state.
    pub fn age(&self, start: u64, len: u64) -> bool {
        let mut young = false;
        self.notify(|l| young |= l.clear_flush_young(start, start + len));
        young
    }

    /// Ask listeners whether the page at `hva` was used.
    pub fn is_young(&self, hva: u64) -> bool {
        let mut young = false;
        self.notify(|l| young |= l.test_young(hva));
        young
    }

    /// Tear down the address space.
    pub fn release(&self) {
        self.notify(|l| l.release());
    }

    /// Run `hook(hva)` every time a blocking pin has to fault a page in.
    ///
    /// The hook runs without any host lock held, so it may call back
    /// into the host (e.g. to swap the page out again).
    pub fn set_fault_hook(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.fault_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_fault_hook(&self) {
        *self.fault_hook.write() = None;
    }

    /// Make blocking faults fail as interrupted while set.
    pub fn set_signal_pending(&self, pending: bool) {
        self.signal_pending.store(pending, Ordering::SeqCst);
    }

    pub fn is_resident(&self, hva: u64) -> bool {
        !self.state.lock().swapped.contains(&page_of(hva))
    }

    /// Frame currently backing `hva`.
    pub fn pfn_of(&self, hva: u64) -> Pfn {
        self.state.lock().pfn_of(page_of(hva))
    }

    pub fn pin_count(&self, pfn: Pfn) -> u64 {
        self.state.lock().pins.get(&pfn).copied().unwrap_or(0)
    }

    /// Pins held across all frames.
    pub fn outstanding_pins(&self) -> u64 {
        self.state.lock().pins.values().sum()
    }

    pub fn is_page_dirty(&self, pfn: Pfn) -> bool {
        self.state.lock().dirty.contains(&pfn)
    }

    pub fn is_page_accessed(&self, pfn: Pfn) -> bool {
        self.state.lock().accessed.contains(&pfn)
    }

    /// Real process address backing simulated `hva`, for handing to KVM.
    pub fn host_address(&self, hva: u64) -> Option<u64> {
        self.memory
            .get_host_address(GuestAddress(hva))
            .ok()
            .map(|p| p as u64)
    }

    fn notify(&self, mut f: impl FnMut(&dyn HostMappingListener)) {
        let live: Vec<Arc<dyn HostMappingListener>> =
            self.listeners.read().iter().filter_map(Weak::upgrade).collect();
        for l in &live {
            f(l.as_ref());
        }
    }

    /// Fault in every swapped page of `[hva, hva + len)`.
    fn fault_in(&self, hva: u64, len: usize) -> Result<(), HostError> {
        let Some(page) = self.state.lock().first_swapped(hva, len) else {
            return Ok(());
        };
        if self.signal_pending.load(Ordering::SeqCst) {
            return Err(HostError::Interrupted { hva: page });
        }
        let hook = self.fault_hook.read().clone();
        if let Some(hook) = hook {
            hook(page);
        }
        let mut state = self.state.lock();
        let end = hva + len as u64;
        let mut p = page_of(hva);
        while p < end {
            state.swapped.remove(&p);
            p += PAGE_SIZE;
        }
        Ok(())
    }
}

impl HostMemory for SimulatedHost {
    fn pin_fast(&self, hva: u64) -> Option<Pfn> {
        let page = page_of(hva);
        let mut state = self.state.lock();
        let ok = state
            .vma(hva)
            .is_some_and(|v| v.kind == VmaKind::Anonymous && v.writable)
            && !state.swapped.contains(&page)
            && !state.poisoned.contains(&page);
        ok.then(|| state.pin(page))
    }

    fn pin_slow(&self, hva: u64, write: bool, nowait: bool) -> Result<Pfn, HostError> {
        let page = page_of(hva);
        {
            let state = self.state.lock();
            state.check_access(hva, 1, write)?;
            if state.swapped.contains(&page) && nowait {
                return Err(HostError::WouldBlock { hva });
            }
        }
        self.fault_in(hva, 1)?;

        let mut state = self.state.lock();
        // The mapping may have changed while the fault was in flight.
        state.check_access(hva, 1, write)?;
        Ok(state.pin(page))
    }

    fn find_vma(&self, hva: u64) -> Option<HostVma> {
        self.state.lock().vma(hva).copied()
    }

    fn is_hwpoison(&self, hva: u64) -> bool {
        self.state.lock().poisoned.contains(&page_of(hva))
    }

    fn put_page(&self, pfn: Pfn) {
        let mut state = self.state.lock();
        match state.pins.get_mut(&pfn) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                state.pins.remove(&pfn);
            }
            None => debug_assert!(false, "put_page on unpinned {pfn}"),
        }
    }

    fn set_page_dirty(&self, pfn: Pfn) {
        self.state.lock().dirty.insert(pfn);
    }

    fn mark_page_accessed(&self, pfn: Pfn) {
        self.state.lock().accessed.insert(pfn);
    }

    fn read(&self, hva: u64, buf: &mut [u8]) -> Result<(), HostError> {
        self.state.lock().check_access(hva, buf.len(), false)?;
        self.fault_in(hva, buf.len())?;
        self.memory
            .read_slice(buf, GuestAddress(hva))
            .map_err(|_| HostError::Fault { hva })
    }

    fn read_nofault(&self, hva: u64, buf: &mut [u8]) -> Result<(), HostError> {
        {
            let state = self.state.lock();
            state.check_access(hva, buf.len(), false)?;
            if let Some(page) = state.first_swapped(hva, buf.len()) {
                return Err(HostError::WouldBlock { hva: page });
            }
        }
        self.memory
            .read_slice(buf, GuestAddress(hva))
            .map_err(|_| HostError::Fault { hva })
    }

    fn write(&self, hva: u64, data: &[u8]) -> Result<(), HostError> {
        self.state.lock().check_access(hva, data.len(), true)?;
        self.fault_in(hva, data.len())?;
        self.memory
            .write_slice(data, GuestAddress(hva))
            .map_err(|_| HostError::Fault { hva })
    }

    fn register_notifier(&self, listener: Weak<dyn HostMappingListener>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }
}
