//! One VM's guest-physical memory.
//!
//! [`VmMemory`] owns the slot table, the I/O buses, the invalidation
//! state and the vCPU set, and ties them to a [`HostMemory`] and an
//! [`ArchMemory`].  Translation, guest access, invalidation and
//! cross-CPU requests are implemented on it in their own modules.
//!
//! # Locking
//!
//! ```text
//!  topology lock          slot + bus writers only; readers never take it
//!    └─ mmu lock          (seq, count) updates and the zap-and-flush step
//!  SRCU read section      every reader of the slot or bus tables
//! ```
//!
//! The mmu lock is only ever taken inside the topology lock, never the
//! other way round, and no grace period is waited for while holding it.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{error, info, trace};
use memslots_abi::{DirtyLog, UserMemoryRegion, PAGE_SIZE};
use parking_lot::Mutex;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::arch::ArchMemory;
use crate::config::{ConfigError, MemoryConfig};
use crate::guest_access::AccessError;
use crate::host::{HostMappingListener, HostMemory};
use crate::iobus::{BusKind, IoBusError, IoBuses, IoDevice};
use crate::kvm::KvmMirrorError;
use crate::memslot::{Memslots, SlotError, SlotTable};
use crate::mmu_notifier::MmuNotifier;
use crate::requests::{EventFdKicker, VcpuKicker, VcpuSet};
use crate::srcu::{Srcu, SrcuReadGuard};
use crate::translate::{PinLedger, TranslateError};
use crate::verified::slots::{ChangeKind, InvalidReason};

#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("Translation failed: {0}")]
    Translate(#[from] TranslateError),

    #[error("I/O bus error: {0}")]
    IoBus(#[from] IoBusError),

    #[error("Guest memory access failed: {0}")]
    Access(#[from] AccessError),

    #[error("Invalid memory config: {0}")]
    Config(#[from] ConfigError),

    #[error("KVM mirror error: {0}")]
    Kvm(#[from] KvmMirrorError),

    #[error("VM is marked bugged; refusing further changes")]
    Bugged,
}

// ═══════════════════════════════════════════════════════════════════════
//  Statistics
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub(crate) struct VmStats {
    pub(crate) remote_tlb_flush: AtomicU64,
    pub(crate) fast_path: AtomicU64,
    pub(crate) slow_path: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) publishes: AtomicU64,
}

/// Point-in-time copy of a VM's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Remote TLB flushes that had to signal at least one vCPU.
    pub remote_tlb_flush: u64,
    /// Translations satisfied by the non-blocking pin.
    pub fast_path: u64,
    /// Translations that went through the full fault-in path.
    pub slow_path: u64,
    /// `map_gfn` attempts discarded because of a racing invalidation.
    pub retries: u64,
    /// Slot changes applied.
    pub publishes: u64,
    /// Generation of the active slot table.
    pub generation: u64,
}

// ═══════════════════════════════════════════════════════════════════════
//  VmMemory
// ═══════════════════════════════════════════════════════════════════════

pub struct VmMemory {
    pub(crate) config: MemoryConfig,
    pub(crate) srcu: Arc<Srcu>,
    pub(crate) slots: SlotTable,
    pub(crate) buses: IoBuses,
    pub(crate) topology: Mutex<()>,
    pub(crate) mmu: MmuNotifier,
    pub(crate) vcpus: VcpuSet,
    pub(crate) host: Arc<dyn HostMemory>,
    pub(crate) arch: Arc<dyn ArchMemory>,
    pub(crate) ledger: Arc<PinLedger>,
    pub(crate) stats: VmStats,
    bugged: AtomicBool,
    eventfds: Option<Arc<EventFdKicker>>,
}

impl VmMemory {
    /// Create an empty VM whose vCPUs are kicked through eventfds.
    pub fn new(
        config: MemoryConfig,
        host: Arc<dyn HostMemory>,
        arch: Arc<dyn ArchMemory>,
    ) -> Result<Arc<Self>, VmError> {
        let kicker = Arc::new(EventFdKicker::new());
        Self::build(config, host, arch, kicker.clone(), Some(kicker))
    }

    /// Create an empty VM with a caller-supplied vCPU kicker.
    pub fn with_kicker(
        config: MemoryConfig,
        host: Arc<dyn HostMemory>,
        arch: Arc<dyn ArchMemory>,
        kicker: Arc<dyn VcpuKicker>,
    ) -> Result<Arc<Self>, VmError> {
        Self::build(config, host, arch, kicker, None)
    }

    fn build(
        config: MemoryConfig,
        host: Arc<dyn HostMemory>,
        arch: Arc<dyn ArchMemory>,
        kicker: Arc<dyn VcpuKicker>,
        eventfds: Option<Arc<EventFdKicker>>,
    ) -> Result<Arc<Self>, VmError> {
        config.validate()?;
        let srcu = Arc::new(Srcu::new(config.grace_spin_budget));
        let vm = Arc::new(Self {
            slots: SlotTable::new(Arc::clone(&srcu), config.limits()),
            buses: IoBuses::new(Arc::clone(&srcu), config.max_bus_devices),
            srcu,
            topology: Mutex::new(()),
            mmu: MmuNotifier::new(),
            vcpus: VcpuSet::new(kicker),
            host,
            arch,
            ledger: Arc::new(PinLedger::default()),
            stats: VmStats::default(),
            bugged: AtomicBool::new(false),
            eventfds,
            config,
        });

        let listener: Weak<dyn HostMappingListener> = Arc::downgrade(&vm) as Weak<VmMemory>;
        vm.host.register_notifier(listener);
        info!(
            "VM memory created: {} user + {} private slots, {} devices per bus",
            vm.config.user_slots, vm.config.private_slots, vm.config.max_bus_devices
        );
        Ok(vm)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ─── Slot topology ───────────────────────────────────────────────

    /// Apply a region request from the user request surface.
    ///
    /// Only user slot ids are accepted; see [`set_region`](Self::set_region).
    pub fn set_user_region(&self, req: &UserMemoryRegion) -> Result<Option<ChangeKind>, VmError> {
        if req.slot >= u32::from(self.config.user_slots) {
            return Err(SlotError::InvalidRequest {
                slot: req.slot,
                reason: InvalidReason::PrivateSlot { slot: req.slot },
            }
            .into());
        }
        self.set_region(req)
    }

    /// Apply a region request to any slot, private ones included.
    pub fn set_region(&self, req: &UserMemoryRegion) -> Result<Option<ChangeKind>, VmError> {
        let topology = self.topology.lock();
        if self.is_bugged() {
            return Err(VmError::Bugged);
        }
        let change = self.slots.set_region(&topology, req, self.arch.as_ref())?;
        if change.is_some() {
            self.stats.publishes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(change)
    }

    /// Enter a read-side section over the slot and bus tables.
    pub fn read_lock(&self) -> SrcuReadGuard<'_> {
        self.srcu.read_lock()
    }

    /// The slot table active when `guard` was taken.
    pub fn memslots<'g>(&'g self, guard: &'g SrcuReadGuard<'_>) -> &'g Memslots {
        self.slots.read(guard)
    }

    /// True if `gfn` is backed by a valid user slot.
    pub fn is_visible_gfn(&self, gfn: u64) -> bool {
        let guard = self.srcu.read_lock();
        self.slots.read(&guard).is_visible_gfn(gfn)
    }

    /// Size of the host page backing `gfn`, or the base page size if
    /// nothing backs it.
    pub fn host_page_size(&self, gfn: u64) -> u64 {
        let guard = self.srcu.read_lock();
        match self.slots.read(&guard).find_usable(gfn) {
            Some(slot) => self.host.page_size(slot.gfn_to_hva(gfn)),
            None => PAGE_SIZE,
        }
    }

    // ─── Dirty logging ───────────────────────────────────────────────

    /// Copy the dirty log of user slot `slot` without clearing it.
    pub fn get_dirty_log(&self, slot: u16) -> Result<DirtyLog, VmError> {
        self.with_dirty_bitmap(slot, |bitmap| bitmap.snapshot())
    }

    /// Copy and clear the dirty log of user slot `slot`.
    ///
    /// vCPUs are asked to flush their TLBs if anything was dirty, so
    /// later writes through stale translations are logged again.
    pub fn clear_dirty_log(&self, slot: u16) -> Result<DirtyLog, VmError> {
        let log = self.with_dirty_bitmap(slot, |bitmap| bitmap.take())?;
        if log.any_dirty {
            self.flush_remote_tlbs();
        }
        Ok(log)
    }

    fn with_dirty_bitmap(
        &self,
        slot: u16,
        read: impl FnOnce(&crate::dirty::DirtyBitmap) -> Result<DirtyLog, std::collections::TryReserveError>,
    ) -> Result<DirtyLog, VmError> {
        if slot >= self.config.user_slots {
            return Err(SlotError::InvalidRequest {
                slot: u32::from(slot),
                reason: InvalidReason::SlotOutOfRange {
                    slot: u32::from(slot),
                    limit: self.config.user_slots,
                },
            }
            .into());
        }
        let guard = self.srcu.read_lock();
        let bitmap = self
            .slots
            .read(&guard)
            .get(slot)
            .and_then(|s| s.dirty_bitmap())
            .ok_or(SlotError::DirtyLogDisabled { slot })?;
        let log = read(bitmap).map_err(|_| SlotError::OutOfMemory { what: "dirty log" })?;
        Ok(log)
    }

    /// Record a write to `gfn` in its slot's dirty log.
    pub fn mark_page_dirty(&self, gfn: u64) {
        let guard = self.srcu.read_lock();
        self.mark_page_dirty_in(self.slots.read(&guard), gfn);
    }

    /// Like [`mark_page_dirty`](Self::mark_page_dirty) against an
    /// already-held table.  Invalid slots are still marked so a write
    /// racing with a move is not lost.
    pub(crate) fn mark_page_dirty_in(&self, slots: &Memslots, gfn: u64) {
        if let Some(slot) = slots.find(gfn) {
            slot.mark_dirty(gfn);
            trace!("gfn {gfn:#x} dirty in slot {}", slot.id());
        }
    }

    // ─── I/O buses ───────────────────────────────────────────────────

    pub fn register_io_device(
        &self,
        bus: BusKind,
        addr: u64,
        len: u64,
        dev: Arc<dyn IoDevice>,
    ) -> Result<(), VmError> {
        let topology = self.topology.lock();
        if self.is_bugged() {
            return Err(VmError::Bugged);
        }
        self.buses.register(&topology, bus, addr, len, dev)?;
        Ok(())
    }

    pub fn unregister_io_device(&self, bus: BusKind, dev: &Arc<dyn IoDevice>) -> Result<(), VmError> {
        let topology = self.topology.lock();
        if self.is_bugged() {
            return Err(VmError::Bugged);
        }
        self.buses.unregister(&topology, bus, dev)?;
        Ok(())
    }

    pub fn io_read(&self, bus: BusKind, addr: u64, data: &mut [u8]) -> Result<(), IoBusError> {
        self.buses.read(bus, addr, data)
    }

    pub fn io_write(&self, bus: BusKind, addr: u64, data: &[u8]) -> Result<(), IoBusError> {
        self.buses.write(bus, addr, data)
    }

    /// Number of ranges registered on `bus`.
    pub fn io_devices(&self, bus: BusKind) -> usize {
        self.buses.table(bus).len()
    }

    // ─── vCPU kick channel ───────────────────────────────────────────

    /// Create the eventfd vCPU `id`'s thread polls for kicks.
    ///
    /// Returns `None` if the VM was built with a custom kicker.
    pub fn register_kick_fd(&self, id: u32) -> Option<io::Result<EventFd>> {
        self.eventfds.as_ref().map(|k| k.register(id))
    }

    // ─── Health ──────────────────────────────────────────────────────

    /// Record a broken invariant.  Every later topology change fails
    /// with [`VmError::Bugged`].
    pub(crate) fn mark_bugged(&self, why: &str) {
        if !self.bugged.swap(true, Ordering::SeqCst) {
            error!("VM memory marked bugged: {why}");
        }
    }

    pub fn is_bugged(&self) -> bool {
        self.bugged.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let guard = self.srcu.read_lock();
        StatsSnapshot {
            remote_tlb_flush: self.stats.remote_tlb_flush.load(Ordering::Relaxed),
            fast_path: self.stats.fast_path.load(Ordering::Relaxed),
            slow_path: self.stats.slow_path.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            publishes: self.stats.publishes.load(Ordering::Relaxed),
            generation: self.slots.read(&guard).generation(),
        }
    }

    pub fn pin_ledger(&self) -> &PinLedger {
        &self.ledger
    }
}

impl Drop for VmMemory {
    fn drop(&mut self) {
        self.arch.flush_shadow_all();
        let outstanding = self.ledger.outstanding();
        if outstanding != 0 {
            error!("VM memory dropped with {outstanding} pinned frames outstanding");
        }
        info!("VM memory destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchEvent, SoftMmu};
    use crate::host::SimulatedHost;
    use crate::requests::CountingKicker;
    use crate::testing::{Harness, HOST_BASE};
    use memslots_abi::{MEM_LOG_DIRTY_PAGES, MEM_READONLY};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use std::thread;

    struct Probe {
        hits: AtomicU64,
    }

    impl IoDevice for Probe {
        fn read(&self, _addr: u64, data: &mut [u8]) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            data.fill(0xaa);
            true
        }

        fn write(&self, _addr: u64, _data: &[u8]) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn region(slot: u32, gfn: u64, npages: u64) -> UserMemoryRegion {
        UserMemoryRegion::new(slot, gfn * PAGE_SIZE, npages * PAGE_SIZE, HOST_BASE + gfn * PAGE_SIZE)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    #[test]
    fn new_vm_is_empty() {
        let h = Harness::new();
        let stats = h.vm.stats();
        assert_eq!(stats.generation, 0);
        assert_eq!(stats.publishes, 0);
        let guard = h.vm.read_lock();
        let slots = h.vm.memslots(&guard);
        assert_eq!(slots.iter().count(), 0);
        assert_eq!(slots.capacity(), 35);
        assert_eq!(h.vm.io_devices(BusKind::Mmio), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let host = Arc::new(SimulatedHost::new(&[(HOST_BASE, 1 << 20)]).unwrap());
        let config = MemoryConfig {
            user_slots: 0,
            ..MemoryConfig::default()
        };
        let err = VmMemory::with_kicker(config, host, Arc::new(SoftMmu::new()), Arc::new(CountingKicker::new()))
            .err()
            .unwrap();
        assert!(matches!(err, VmError::Config(ConfigError::NoUserSlots)));
    }

    #[test]
    fn drop_flushes_shadow_and_releases_devices() {
        let h = Harness::new();
        let dev = Arc::new(Probe { hits: AtomicU64::new(0) });
        h.vm.register_io_device(BusKind::Pio, 0x3f8, 8, dev.clone()).unwrap();
        h.add_slot(0, 0x10, 4, 0);
        h.mmu.install(0x10, crate::host::Pfn(1), true);
        assert_eq!(Arc::strong_count(&dev), 2);

        let Harness { vm, mmu, .. } = h;
        drop(vm);
        assert!(mmu.is_empty());
        assert!(mmu.events().contains(&ArchEvent::FlushAll));
        assert_eq!(Arc::strong_count(&dev), 1);
    }

    #[test]
    fn default_constructor_hands_out_kick_fds() {
        let host = Arc::new(SimulatedHost::new(&[(HOST_BASE, 1 << 20)]).unwrap());
        let vm = VmMemory::new(MemoryConfig::default(), host, Arc::new(SoftMmu::new())).unwrap();
        let fd = vm.register_kick_fd(0).unwrap().unwrap();
        let vcpu = vm.add_vcpu(0);
        assert!(vcpu.enter_guest());
        vm.flush_remote_tlbs();
        assert_eq!(fd.read().unwrap(), 1);
        assert_eq!(vm.stats().remote_tlb_flush, 1);
    }

    // ─── Region requests ─────────────────────────────────────────────

    #[test]
    fn user_surface_rejects_private_slots() {
        let h = Harness::new();
        let err = h.vm.set_user_region(&region(32, 0x10, 1)).unwrap_err();
        assert!(matches!(
            err,
            VmError::Slot(SlotError::InvalidRequest {
                reason: InvalidReason::PrivateSlot { slot: 32 },
                ..
            })
        ));
        assert_eq!(h.vm.set_region(&region(32, 0x10, 1)).unwrap(), Some(ChangeKind::Create));
    }

    #[test]
    fn private_slot_is_not_visible() {
        let h = Harness::new();
        h.add_slot(33, 0x10, 1, 0);
        assert!(!h.vm.is_visible_gfn(0x10));
        h.vm.translate(0x10).unwrap().release_clean();
        h.add_slot(0, 0x20, 1, 0);
        assert!(h.vm.is_visible_gfn(0x20));
    }

    #[test]
    fn delete_then_recreate_disjoint_succeeds_overlap_fails() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 16, 0);
        h.add_slot(1, 0x200, 16, 0);
        h.vm.set_user_region(&UserMemoryRegion::delete(0)).unwrap();
        assert_eq!(h.vm.set_user_region(&region(0, 0x400, 8)).unwrap(), Some(ChangeKind::Create));

        let before = h.vm.stats().generation;
        let err = h.vm.set_user_region(&region(2, 0x208, 16)).unwrap_err();
        assert!(matches!(err, VmError::Slot(SlotError::RegionConflict { other: 1, .. })));
        assert_eq!(h.vm.stats().generation, before);
        assert!(!h.vm.is_visible_gfn(0x218));
    }

    #[test]
    fn identical_request_does_not_publish() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let stats = h.vm.stats();
        assert_eq!(h.vm.set_user_region(&region(0, 0x100, 4)).unwrap(), None);
        assert_eq!(h.vm.stats(), stats);
    }

    #[test]
    fn host_page_size_follows_mapping() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.host.set_page_size(HOST_BASE, 2 << 20);
        assert_eq!(h.vm.host_page_size(0x101), 2 << 20);
        assert_eq!(h.vm.host_page_size(0x900), PAGE_SIZE);
    }

    // ─── Dirty log ───────────────────────────────────────────────────

    #[test]
    fn dirty_log_counts_distinct_pages_relative_to_base() {
        let h = Harness::new();
        h.add_slot(3, 0x1000, 128, MEM_LOG_DIRTY_PAGES);
        for gfn in [0x1000, 0x1001, 0x1040, 0x107f, 0x1001] {
            h.vm.mark_page_dirty(gfn);
        }
        let log = h.vm.get_dirty_log(3).unwrap();
        assert!(log.any_dirty);
        assert_eq!(log.dirty_pages(), vec![0, 1, 0x40, 0x7f]);
        // Retrieval does not clear.
        assert_eq!(h.vm.get_dirty_log(3).unwrap(), log);
    }

    #[test]
    fn clear_dirty_log_resets_and_flushes() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 8, MEM_LOG_DIRTY_PAGES);
        assert!(h.vm.add_vcpu(0).enter_guest());
        h.vm.mark_page_dirty(0x103);

        let log = h.vm.clear_dirty_log(0).unwrap();
        assert_eq!(log.dirty_pages(), vec![3]);
        assert_eq!(h.kicker.count(), 1);
        assert!(!h.vm.get_dirty_log(0).unwrap().any_dirty);

        let empty = h.vm.clear_dirty_log(0).unwrap();
        assert!(!empty.any_dirty);
        assert_eq!(h.kicker.count(), 1);
    }

    #[test]
    fn dirty_log_requires_logging_user_slot() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 8, 0);
        h.vm.mark_page_dirty(0x100);
        assert!(matches!(
            h.vm.get_dirty_log(0),
            Err(VmError::Slot(SlotError::DirtyLogDisabled { slot: 0 }))
        ));
        assert!(matches!(
            h.vm.get_dirty_log(40),
            Err(VmError::Slot(SlotError::InvalidRequest { .. }))
        ));
    }

    #[test]
    fn readonly_slot_never_logs() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 8, MEM_READONLY | MEM_LOG_DIRTY_PAGES);
        assert!(h.vm.write_guest(0x100 * PAGE_SIZE, &[1]).is_err());
        assert!(!h.vm.get_dirty_log(0).unwrap().any_dirty);
    }

    // ─── I/O buses ───────────────────────────────────────────────────

    #[test]
    fn io_dispatch_through_vm() {
        let h = Harness::new();
        let dev = Arc::new(Probe { hits: AtomicU64::new(0) });
        let handle: Arc<dyn IoDevice> = dev.clone();
        h.vm.register_io_device(BusKind::Mmio, 0xfee0_0000, 0x1000, handle.clone()).unwrap();

        let mut buf = [0u8; 4];
        h.vm.io_read(BusKind::Mmio, 0xfee0_0020, &mut buf).unwrap();
        assert_eq!(buf, [0xaa; 4]);
        assert!(h.vm.io_read(BusKind::Pio, 0xfee0_0020, &mut buf).is_err());

        h.vm.unregister_io_device(BusKind::Mmio, &handle).unwrap();
        assert!(matches!(
            h.vm.io_write(BusKind::Mmio, 0xfee0_0020, &buf),
            Err(IoBusError::Unhandled { .. })
        ));
        assert!(matches!(
            h.vm.unregister_io_device(BusKind::Mmio, &handle),
            Err(VmError::IoBus(IoBusError::NotFound { .. }))
        ));
        assert_eq!(dev.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bugged_vm_refuses_bus_changes() {
        let h = Harness::new();
        let handle: Arc<dyn IoDevice> = Arc::new(Probe { hits: AtomicU64::new(0) });
        h.vm.register_io_device(BusKind::Pio, 0x60, 1, handle.clone()).unwrap();
        h.vm.mark_bugged("test");
        assert!(matches!(
            h.vm.register_io_device(BusKind::Pio, 0x64, 1, handle.clone()),
            Err(VmError::Bugged)
        ));
        assert!(matches!(
            h.vm.unregister_io_device(BusKind::Pio, &handle),
            Err(VmError::Bugged)
        ));
        assert_eq!(h.vm.io_devices(BusKind::Pio), 1);
    }

    // ─── Concurrency ─────────────────────────────────────────────────

    #[test]
    fn readers_never_see_a_torn_table() {
        const CYCLES: usize = 1000;
        const READERS: usize = 4;
        let h = Harness::new();
        h.add_slot(0, 0x10, 16, MEM_LOG_DIRTY_PAGES);
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            for r in 0..READERS {
                let h = &h;
                let stop = &stop;
                s.spawn(move || {
                    let mut rng = ChaCha20Rng::seed_from_u64(r as u64);
                    let mut last_gen = 0;
                    while !stop.load(Ordering::SeqCst) {
                        {
                            let guard = h.vm.read_lock();
                            let slots = h.vm.memslots(&guard);
                            assert!(slots.generation() >= last_gen);
                            last_gen = slots.generation();

                            let present: Vec<_> = slots.iter().collect();
                            for (i, a) in present.iter().enumerate() {
                                for b in &present[i + 1..] {
                                    assert!(
                                        a.end_gfn() <= b.base_gfn() || b.end_gfn() <= a.base_gfn(),
                                        "overlap between {a} and {b}"
                                    );
                                }
                            }
                            if let Some(moving) = slots.get(1).filter(|s| s.is_present()) {
                                assert_eq!(moving.npages(), 8);
                                assert!(matches!(moving.base_gfn(), 0x100 | 0x200));
                                assert_eq!(moving.gfn_to_hva(moving.base_gfn()), HOST_BASE + moving.base_gfn() * PAGE_SIZE);
                            }
                            assert!(slots.find_usable(0x10).is_some());
                        }

                        let gfn = 0x10 + rng.gen_range(0..16);
                        h.vm.translate(gfn).unwrap().release_dirty();
                        if let Ok(frame) = h.vm.translate(0x100) {
                            frame.release_clean();
                        }
                    }
                });
            }

            for i in 0..CYCLES {
                let base = if i % 2 == 0 { 0x100 } else { 0x200 };
                h.add_slot(1, base, 8, 0);
                h.vm.set_user_region(&UserMemoryRegion::delete(1)).unwrap();
            }
            stop.store(true, Ordering::SeqCst);
        });

        assert_eq!(h.vm.stats().generation, 1 + 2 * CYCLES as u64 + CYCLES as u64);
        assert_eq!(h.host.outstanding_pins(), 0);
        assert_eq!(h.vm.pin_ledger().leaked(), 0);
    }
}
