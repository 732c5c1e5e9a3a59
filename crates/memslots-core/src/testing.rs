//! Shared fixture for unit tests: a VM over a simulated host with a
//! software MMU and a counting kicker.

use std::sync::Arc;

use memslots_abi::{UserMemoryRegion, PAGE_SIZE};

use crate::arch::SoftMmu;
use crate::config::MemoryConfig;
use crate::host::SimulatedHost;
use crate::requests::CountingKicker;
use crate::vm::VmMemory;

/// Start of the simulated host's anonymous mapping.
pub const HOST_BASE: u64 = 0x7f00_0000_0000;

const HOST_LEN: usize = 32 << 20;

pub struct Harness {
    pub vm: Arc<VmMemory>,
    pub host: Arc<SimulatedHost>,
    pub mmu: Arc<SoftMmu>,
    pub kicker: Arc<CountingKicker>,
}

impl Harness {
    pub fn new() -> Self {
        let host = Arc::new(SimulatedHost::new(&[(HOST_BASE, HOST_LEN)]).unwrap());
        let mmu = Arc::new(SoftMmu::new());
        let kicker = Arc::new(CountingKicker::new());
        let vm = VmMemory::with_kicker(
            MemoryConfig::default(),
            host.clone(),
            mmu.clone(),
            kicker.clone(),
        )
        .unwrap();
        Self {
            vm,
            host,
            mmu,
            kicker,
        }
    }

    /// Back `npages` frames at `gfn` with host memory at [`Harness::hva`].
    pub fn add_slot(&self, id: u32, gfn: u64, npages: u64, flags: u32) {
        self.add_raw_slot(id, gfn, npages, self.hva(gfn), flags);
    }

    /// Back `npages` frames at `gfn` with an arbitrary host address.
    pub fn add_raw_slot(&self, id: u32, gfn: u64, npages: u64, hva: u64, flags: u32) {
        let req = UserMemoryRegion::new(id, gfn * PAGE_SIZE, npages * PAGE_SIZE, hva).with_flags(flags);
        self.vm.set_region(&req).unwrap();
    }

    /// Host address [`Harness::add_slot`] uses for `gfn`.
    pub fn hva(&self, gfn: u64) -> u64 {
        HOST_BASE + gfn * PAGE_SIZE
    }
}
