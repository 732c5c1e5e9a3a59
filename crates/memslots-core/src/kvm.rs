//! Mirroring the slot table into a KVM virtual machine.
//!
//! [`KvmMirror`] is an [`ArchMemory`] that forwards every hook to an
//! inner implementation and, once a change is committed, replays it into
//! a `/dev/kvm` VM with `KVM_SET_USER_MEMORY_REGION`.  KVM's own dirty
//! log can be folded back into a slot's bitmap with
//! [`KvmMirror::sync_dirty_log`].
//!
//! Slot host addresses are translated to real process addresses with a
//! caller-supplied resolver, so a simulated address space (see
//! [`SimulatedHost::host_address`](crate::host::SimulatedHost::host_address))
//! can be mirrored too.

use std::sync::Arc;

use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_LOG_DIRTY_PAGES, KVM_MEM_READONLY};
use kvm_ioctls::{Kvm, VmFd};
use log::{debug, error};
use memslots_abi::{UserMemoryRegion, PAGE_SHIFT};
use thiserror::Error;

use crate::arch::{ArchError, ArchMemory};
use crate::host::Pfn;
use crate::memslot::{MemorySlot, Memslots, SlotFlags};
use crate::verified::slots::ChangeKind;

/// Maps a slot's host virtual address to a real process address.
pub type HvaResolver = Box<dyn Fn(u64) -> Option<u64> + Send + Sync>;

#[derive(Error, Debug)]
pub enum KvmMirrorError {
    #[error("Failed to create KVM instance: {0}")]
    KvmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to get dirty log of slot {slot}: {source}")]
    DirtyLog {
        slot: u16,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Slot {slot} is not logging dirty pages")]
    NotLogging { slot: u16 },
}

/// Replays committed slot changes into a KVM VM.
pub struct KvmMirror {
    _kvm: Kvm,
    vm_fd: VmFd,
    inner: Arc<dyn ArchMemory>,
    resolve: HvaResolver,
}

impl KvmMirror {
    /// Open `/dev/kvm` and create an empty VM to mirror into.
    pub fn new(inner: Arc<dyn ArchMemory>, resolve: HvaResolver) -> Result<Self, KvmMirrorError> {
        let kvm = Kvm::new().map_err(KvmMirrorError::KvmCreate)?;
        let vm_fd = kvm.create_vm().map_err(KvmMirrorError::VmCreate)?;
        Ok(Self {
            _kvm: kvm,
            vm_fd,
            inner,
            resolve,
        })
    }

    pub fn vm_fd(&self) -> &VmFd {
        &self.vm_fd
    }

    fn region(&self, slot: &MemorySlot) -> Option<kvm_userspace_memory_region> {
        let mut flags = 0;
        if slot.logs_dirty() {
            flags |= KVM_MEM_LOG_DIRTY_PAGES;
        }
        if slot.is_readonly() {
            flags |= KVM_MEM_READONLY;
        }
        Some(kvm_userspace_memory_region {
            slot: u32::from(slot.id()),
            flags,
            guest_phys_addr: slot.base_gfn() << PAGE_SHIFT,
            memory_size: slot.npages() << PAGE_SHIFT,
            userspace_addr: (self.resolve)(slot.userspace_addr())?,
        })
    }

    /// Merge KVM's dirty log for `slot` into the slot's bitmap.
    ///
    /// KVM clears its log on read, so each dirty page is reported once.
    /// Returns the number of pages KVM reported.
    pub fn sync_dirty_log(&self, slot: &MemorySlot) -> Result<u64, KvmMirrorError> {
        let bitmap = slot
            .dirty_bitmap()
            .ok_or(KvmMirrorError::NotLogging { slot: slot.id() })?;
        let words = self
            .vm_fd
            .get_dirty_log(u32::from(slot.id()), (slot.npages() << PAGE_SHIFT) as usize)
            .map_err(|source| KvmMirrorError::DirtyLog {
                slot: slot.id(),
                source,
            })?;
        bitmap.merge(&words);
        Ok(memslots_abi::count_dirty(&words))
    }
}

impl ArchMemory for KvmMirror {
    fn prepare_region(
        &self,
        candidate: &MemorySlot,
        req: &UserMemoryRegion,
        change: ChangeKind,
    ) -> Result<(), ArchError> {
        if change != ChangeKind::Delete && self.region(candidate).is_none() {
            return Err(ArchError::Rejected {
                slot: candidate.id(),
                reason: format!("host address {:#x} has no backing", candidate.userspace_addr()),
            });
        }
        self.inner.prepare_region(candidate, req, change)
    }

    fn commit_region(&self, old: &MemorySlot, new: &MemorySlot, change: ChangeKind) {
        self.inner.commit_region(old, new, change);

        let region = match change {
            ChangeKind::Delete => Some(kvm_userspace_memory_region {
                slot: u32::from(old.id()),
                ..Default::default()
            }),
            _ => self.region(new),
        };
        let Some(region) = region else {
            error!("slot {}: host address vanished before commit", new.id());
            return;
        };
        // SAFETY: the region points at host memory that outlives the slot;
        // deleting the slot from the table unmaps it from KVM first.
        let result = unsafe { self.vm_fd.set_user_memory_region(region) };
        match result {
            Ok(()) => debug!(
                "KVM slot {}: {change} gpa {:#x} size {:#x} flags {:?}",
                region.slot,
                region.guest_phys_addr,
                region.memory_size,
                new.flags() - SlotFlags::INVALID
            ),
            Err(e) => error!("KVM slot {}: failed to mirror {change}: {e}", region.slot),
        }
    }

    fn flush_shadow_for_slot(&self, slot: &MemorySlot) {
        self.inner.flush_shadow_for_slot(slot);
    }

    fn flush_shadow_all(&self) {
        self.inner.flush_shadow_all();
    }

    fn unmap_hva_range(&self, slots: &Memslots, start: u64, end: u64) -> bool {
        self.inner.unmap_hva_range(slots, start, end)
    }

    fn set_spte_hva(&self, slots: &Memslots, hva: u64, pfn: Pfn) {
        self.inner.set_spte_hva(slots, hva, pfn);
    }

    fn age_hva(&self, slots: &Memslots, start: u64, end: u64) -> bool {
        self.inner.age_hva(slots, start, end)
    }

    fn test_age_hva(&self, slots: &Memslots, hva: u64) -> bool {
        self.inner.test_age_hva(slots, hva)
    }
}
