//! Cross-CPU requests.
//!
//! A request is a bit in a vCPU's pending mask that the vCPU thread
//! services before its next guest entry.  Setting the bit is always
//! enough for a vCPU outside guest mode; a vCPU running guest code must
//! also be kicked out so it notices.
//!
//! ```text
//!  requester                       vCPU thread
//!  ─────────                       ───────────
//!  requests |= REQ                 mode = InGuest
//!  old = cmpxchg(mode,             if requests != 0 { mode = Outside; service }
//!        InGuest → Exiting)        ... run guest ...
//!  old != Outside → kick           mode = Outside
//! ```
//!
//! Both sides write first and read second with sequentially consistent
//! ordering, so either the vCPU sees the request before entering or the
//! requester sees it in guest mode and kicks it.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::vm::VmMemory;

bitflags! {
    /// Pending work for a vCPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VcpuRequest: u32 {
        /// Flush guest translations from the TLB.
        const TLB_FLUSH = 1 << 0;
        /// Reload the shadow MMU root.
        const MMU_RELOAD = 1 << 1;
    }
}

/// Where a vCPU thread is relative to guest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VcpuMode {
    OutsideGuest = 0,
    InGuest = 1,
    ExitingGuest = 2,
}

impl VcpuMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => VcpuMode::InGuest,
            2 => VcpuMode::ExitingGuest,
            _ => VcpuMode::OutsideGuest,
        }
    }
}

/// Forces a vCPU thread out of guest mode.
pub trait VcpuKicker: Send + Sync {
    fn kick(&self, vcpu: &Vcpu);
}

// ═══════════════════════════════════════════════════════════════════════
//  Vcpu
// ═══════════════════════════════════════════════════════════════════════

/// Request and mode state of one vCPU.
#[derive(Debug)]
pub struct Vcpu {
    id: u32,
    requests: AtomicU32,
    mode: AtomicU8,
    thread: Mutex<Option<ThreadId>>,
}

impl Vcpu {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            requests: AtomicU32::new(0),
            mode: AtomicU8::new(VcpuMode::OutsideGuest as u8),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> VcpuMode {
        VcpuMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Record that the calling thread runs this vCPU.
    pub fn bind_thread(&self) {
        *self.thread.lock() = Some(thread::current().id());
    }

    fn is_current_thread(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    pub fn make_request(&self, req: VcpuRequest) {
        self.requests.fetch_or(req.bits(), Ordering::SeqCst);
    }

    pub fn pending(&self) -> VcpuRequest {
        VcpuRequest::from_bits_truncate(self.requests.load(Ordering::SeqCst))
    }

    /// Consume `req` if it is pending.
    pub fn check_request(&self, req: VcpuRequest) -> bool {
        if !self.pending().intersects(req) {
            return false;
        }
        let old = self.requests.fetch_and(!req.bits(), Ordering::SeqCst);
        old & req.bits() != 0
    }

    /// Switch to guest mode unless a request is pending.
    ///
    /// Returns `false`, leaving the vCPU outside guest mode, if the
    /// caller must service requests first.
    pub fn enter_guest(&self) -> bool {
        self.mode.store(VcpuMode::InGuest as u8, Ordering::SeqCst);
        if self.requests.load(Ordering::SeqCst) != 0 {
            self.mode.store(VcpuMode::OutsideGuest as u8, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn exit_guest(&self) {
        self.mode.store(VcpuMode::OutsideGuest as u8, Ordering::SeqCst);
    }

    /// Move `InGuest` to `ExitingGuest`; returns the previous mode.
    fn exiting_guest_mode(&self) -> VcpuMode {
        let prev = self
            .mode
            .compare_exchange(
                VcpuMode::InGuest as u8,
                VcpuMode::ExitingGuest as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .unwrap_or_else(|v| v);
        VcpuMode::from_u8(prev)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VcpuSet
// ═══════════════════════════════════════════════════════════════════════

/// Every vCPU of one VM plus the kicker used to interrupt them.
pub struct VcpuSet {
    vcpus: RwLock<Vec<Arc<Vcpu>>>,
    kicker: Arc<dyn VcpuKicker>,
}

impl VcpuSet {
    pub fn new(kicker: Arc<dyn VcpuKicker>) -> Self {
        Self {
            vcpus: RwLock::new(Vec::new()),
            kicker,
        }
    }

    pub fn add(&self, id: u32) -> Arc<Vcpu> {
        let vcpu = Arc::new(Vcpu::new(id));
        self.vcpus.write().push(Arc::clone(&vcpu));
        vcpu
    }

    pub fn get(&self, id: u32) -> Option<Arc<Vcpu>> {
        self.vcpus.read().iter().find(|v| v.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.vcpus.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Post `req` to every vCPU and kick those running guest code.
    ///
    /// Returns true if at least one vCPU had to be kicked.
    pub fn make_all_cpus_request(&self, req: VcpuRequest) -> bool {
        let mut kicked = false;
        for vcpu in self.vcpus.read().iter() {
            vcpu.make_request(req);
            if vcpu.is_current_thread() {
                continue;
            }
            if vcpu.exiting_guest_mode() != VcpuMode::OutsideGuest {
                self.kicker.kick(vcpu);
                kicked = true;
            }
        }
        kicked
    }

    /// Kick `vcpu` out of guest mode if it is running guest code.
    pub fn kick(&self, vcpu: &Vcpu) {
        if !vcpu.is_current_thread() && vcpu.exiting_guest_mode() == VcpuMode::InGuest {
            self.kicker.kick(vcpu);
        }
    }
}

impl VmMemory {
    /// Make every vCPU flush its TLB before it next runs guest code.
    pub fn flush_remote_tlbs(&self) {
        let dirty = self.mmu.tlbs_dirty();
        if self.vcpus.make_all_cpus_request(VcpuRequest::TLB_FLUSH) {
            self.stats.remote_tlb_flush.fetch_add(1, Ordering::Relaxed);
        }
        self.mmu.clear_tlbs_dirty(dirty);
    }

    /// Make every vCPU reload its shadow MMU root.
    pub fn reload_remote_mmus(&self) {
        self.vcpus.make_all_cpus_request(VcpuRequest::MMU_RELOAD);
    }

    pub fn add_vcpu(&self, id: u32) -> Arc<Vcpu> {
        self.vcpus.add(id)
    }

    pub fn vcpu(&self, id: u32) -> Option<Arc<Vcpu>> {
        self.vcpus.get(id)
    }

    pub fn kick(&self, vcpu: &Vcpu) {
        self.vcpus.kick(vcpu);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Kickers
// ═══════════════════════════════════════════════════════════════════════

/// Kicks vCPU threads by signalling a per-vCPU eventfd they poll.
#[derive(Default)]
pub struct EventFdKicker {
    fds: RwLock<HashMap<u32, EventFd>>,
}

impl EventFdKicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the eventfd for `vcpu_id` and return a handle for its thread.
    pub fn register(&self, vcpu_id: u32) -> io::Result<EventFd> {
        let fd = EventFd::new(EFD_NONBLOCK)?;
        let handle = fd.try_clone()?;
        self.fds.write().insert(vcpu_id, fd);
        Ok(handle)
    }
}

impl VcpuKicker for EventFdKicker {
    fn kick(&self, vcpu: &Vcpu) {
        match self.fds.read().get(&vcpu.id()) {
            Some(fd) => {
                if let Err(e) = fd.write(1) {
                    warn!("failed to kick vcpu {}: {e}", vcpu.id());
                }
            }
            None => debug!("vcpu {} has no kick eventfd", vcpu.id()),
        }
    }
}

/// Counts kicks instead of delivering them.
#[derive(Debug, Default)]
pub struct CountingKicker {
    kicks: AtomicU64,
    kicked: Mutex<Vec<u32>>,
}

impl CountingKicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.kicks.load(Ordering::SeqCst)
    }

    /// Ids of kicked vCPUs, in order.
    pub fn kicked(&self) -> Vec<u32> {
        self.kicked.lock().clone()
    }
}

impl VcpuKicker for CountingKicker {
    fn kick(&self, vcpu: &Vcpu) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
        self.kicked.lock().push(vcpu.id());
    }
}
