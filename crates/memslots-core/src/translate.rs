//! Guest frame → host frame translation.
//!
//! A translation resolves a guest frame number to a host virtual address
//! through the active slot table, then pins the host page behind it:
//!
//! ```text
//!   gfn ──slot lookup──► hva ──fast pin──► pfn
//!                              │ miss
//!                              ▼
//!                          slow pin (may fault in, may block)
//!                              │ failure
//!                              ▼
//!              poisoned │ device mapping │ not resident │ no backing
//! ```
//!
//! Each successful translation returns a [`PinnedFrame`] that owns one
//! pin on the page and must be released exactly once.  Callers that
//! want to cache the result use [`VmMemory::map_gfn`], which re-checks
//! the invalidation sequence under the invalidation lock before the
//! commit closure runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{trace, warn};
use memslots_abi::PAGE_SHIFT;
use thiserror::Error;

use crate::host::{HostError, HostMemory, Pfn, VmaKind};
use crate::memslot::Memslots;
use crate::vm::VmMemory;

// ═══════════════════════════════════════════════════════════════════════
//  Request / result types
// ═══════════════════════════════════════════════════════════════════════

/// How far a translation may go to obtain the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateMode {
    /// Never sleep; only the fast path is tried.
    Atomic,
    /// May fault in resident pages, but reports non-resident ones as
    /// [`TranslateError::TransientUnavailable`] instead of waiting.
    Async,
    /// May sleep on host I/O.
    Blocking,
}

/// Parameters of one translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateRequest {
    /// The caller intends to write through the frame.
    pub write: bool,
    pub mode: TranslateMode,
    /// For reads: accept a writable frame if one is available cheaply.
    pub map_writable: bool,
}

impl TranslateRequest {
    /// Blocking read.
    pub const fn read() -> Self {
        Self {
            write: false,
            mode: TranslateMode::Blocking,
            map_writable: false,
        }
    }

    /// Blocking write.
    pub const fn write() -> Self {
        Self {
            write: true,
            mode: TranslateMode::Blocking,
            map_writable: false,
        }
    }

    pub const fn with_mode(mut self, mode: TranslateMode) -> Self {
        self.mode = mode;
        self
    }

    pub const fn allow_writable(mut self) -> Self {
        self.map_writable = true;
        self
    }

    /// True if the fast path may be tried.
    fn wants_fast_path(&self) -> bool {
        self.mode != TranslateMode::Blocking && (self.write || self.map_writable)
    }
}

/// Whether a frame is ordinary memory or raw device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A pinned, reference-counted page.
    Ordinary,
    /// Device memory; there is no page to pin, dirty or release.
    Device,
}

/// Why a translation failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    /// The frame is outside every usable slot.
    #[error("gfn {gfn:#x} is not backed by a usable slot")]
    NoMapping { gfn: u64 },

    /// Write intent against a read-only slot or mapping.
    #[error("write to read-only gfn {gfn:#x}")]
    PermissionDenied { gfn: u64 },

    /// The host page has an uncorrectable memory error.
    #[error("gfn {gfn:#x} is backed by a poisoned page")]
    Poisoned { gfn: u64 },

    /// The page is not resident and the caller asked not to wait.
    #[error("gfn {gfn:#x} is not resident, retry asynchronously")]
    TransientUnavailable { gfn: u64 },

    /// The page could not be pinned without sleeping.
    #[error("gfn {gfn:#x} cannot be pinned without sleeping")]
    AtomicMiss { gfn: u64 },

    /// The slot points at host addresses with nothing mapped.
    #[error("gfn {gfn:#x} has no host mapping at {hva:#x}")]
    NoBacking { gfn: u64, hva: u64 },

    /// Faulting the page in was interrupted.
    #[error("fault-in of gfn {gfn:#x} was interrupted")]
    Interrupted { gfn: u64 },
}

impl TranslateError {
    /// True for failures the caller may retry from a suitable context.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUnavailable { .. } | Self::AtomicMiss { .. } | Self::Interrupted { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Pin tokens
// ═══════════════════════════════════════════════════════════════════════

/// Running totals of [`PinnedFrame`] tokens handed out by one VM.
#[derive(Debug, Default)]
pub struct PinLedger {
    pinned: AtomicU64,
    released: AtomicU64,
    leaked: AtomicU64,
}

impl PinLedger {
    pub fn pinned(&self) -> u64 {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Tokens dropped without an explicit release.
    pub fn leaked(&self) -> u64 {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Tokens still alive.
    pub fn outstanding(&self) -> u64 {
        self.pinned() - self.released() - self.leaked()
    }
}

/// One pinned host frame, owned by the caller until released.
#[must_use = "a pinned frame must be released"]
pub struct PinnedFrame {
    gfn: u64,
    pfn: Pfn,
    writable: bool,
    kind: FrameKind,
    host: Arc<dyn HostMemory>,
    ledger: Arc<PinLedger>,
    live: bool,
}

impl PinnedFrame {
    fn new(
        gfn: u64,
        pfn: Pfn,
        writable: bool,
        kind: FrameKind,
        host: Arc<dyn HostMemory>,
        ledger: Arc<PinLedger>,
    ) -> Self {
        ledger.pinned.fetch_add(1, Ordering::SeqCst);
        Self {
            gfn,
            pfn,
            writable,
            kind,
            host,
            ledger,
            live: true,
        }
    }

    pub fn gfn(&self) -> u64 {
        self.gfn
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// True if the frame may be mapped writable.
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_device(&self) -> bool {
        self.kind == FrameKind::Device
    }

    /// Record a write through the frame.  No-op for device memory.
    pub fn mark_dirty(&self) {
        if self.kind == FrameKind::Ordinary {
            self.host.set_page_dirty(self.pfn);
        }
    }

    /// Record a use of the frame.  No-op for device memory.
    pub fn mark_accessed(&self) {
        if self.kind == FrameKind::Ordinary {
            self.host.mark_page_accessed(self.pfn);
        }
    }

    /// Drop the pin without recording a write.
    pub fn release_clean(mut self) {
        self.put();
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a write, then drop the pin.
    pub fn release_dirty(self) {
        self.mark_dirty();
        self.release_clean();
    }

    fn put(&mut self) {
        self.live = false;
        if self.kind == FrameKind::Ordinary {
            self.host.put_page(self.pfn);
        }
    }
}

impl fmt::Debug for PinnedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedFrame")
            .field("gfn", &format_args!("{:#x}", self.gfn))
            .field("pfn", &self.pfn)
            .field("writable", &self.writable)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        if self.live {
            warn!("pinned frame for gfn {:#x} ({}) dropped without release", self.gfn, self.pfn);
            self.put();
            self.ledger.leaked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  hva → pfn
// ═══════════════════════════════════════════════════════════════════════

/// Result of pinning one host page.
struct HostPin {
    pfn: Pfn,
    writable: bool,
    kind: FrameKind,
    fast: bool,
}

/// Pin the page at `hva` as `req` allows.
fn hva_to_pfn(
    host: &dyn HostMemory,
    gfn: u64,
    hva: u64,
    req: TranslateRequest,
) -> Result<HostPin, TranslateError> {
    if req.wants_fast_path() {
        if let Some(pfn) = host.pin_fast(hva) {
            return Ok(HostPin {
                pfn,
                writable: true,
                kind: FrameKind::Ordinary,
                fast: true,
            });
        }
    }
    if req.mode == TranslateMode::Atomic {
        return Err(TranslateError::AtomicMiss { gfn });
    }

    let nowait = req.mode == TranslateMode::Async;
    match host.pin_slow(hva, req.write, nowait) {
        Ok(pfn) => {
            if req.write || !req.map_writable {
                return Ok(HostPin {
                    pfn,
                    writable: req.write,
                    kind: FrameKind::Ordinary,
                    fast: false,
                });
            }
            // Read fault: take a writable pin instead if it is free.
            match host.pin_fast(hva) {
                Some(wpfn) => {
                    host.put_page(pfn);
                    Ok(HostPin {
                        pfn: wpfn,
                        writable: true,
                        kind: FrameKind::Ordinary,
                        fast: false,
                    })
                }
                None => Ok(HostPin {
                    pfn,
                    writable: false,
                    kind: FrameKind::Ordinary,
                    fast: false,
                }),
            }
        }
        Err(HostError::Poisoned { .. }) => Err(TranslateError::Poisoned { gfn }),
        Err(HostError::Interrupted { .. }) => Err(TranslateError::Interrupted { gfn }),
        Err(err) => {
            // Poison wins over whatever else made the fault fail.
            if !nowait && host.is_hwpoison(hva) {
                return Err(TranslateError::Poisoned { gfn });
            }
            let Some(vma) = host.find_vma(hva) else {
                return Err(TranslateError::NoBacking { gfn, hva });
            };
            if !vma.allows(req.write) {
                return Err(TranslateError::PermissionDenied { gfn });
            }
            match vma.kind {
                VmaKind::PfnMap { pgoff } => Ok(HostPin {
                    pfn: Pfn(pgoff + ((hva - vma.start) >> PAGE_SHIFT)),
                    writable: vma.writable && (req.write || req.map_writable),
                    kind: FrameKind::Device,
                    fast: false,
                }),
                VmaKind::Anonymous if matches!(err, HostError::WouldBlock { .. }) => {
                    Err(TranslateError::TransientUnavailable { gfn })
                }
                VmaKind::Anonymous => Err(TranslateError::NoBacking { gfn, hva }),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  gfn-level entry points
// ═══════════════════════════════════════════════════════════════════════

impl VmMemory {
    /// Translate `gfn` against `slots`.
    pub(crate) fn translate_in(
        &self,
        slots: &Memslots,
        gfn: u64,
        mut req: TranslateRequest,
    ) -> Result<PinnedFrame, TranslateError> {
        let slot = slots
            .find_usable(gfn)
            .ok_or(TranslateError::NoMapping { gfn })?;
        if slot.is_readonly() {
            if req.write {
                return Err(TranslateError::PermissionDenied { gfn });
            }
            req.map_writable = false;
        }
        let hva = slot.gfn_to_hva(gfn);

        let pin = hva_to_pfn(self.host.as_ref(), gfn, hva, req)?;
        if pin.fast {
            self.stats.fast_path.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.slow_path.fetch_add(1, Ordering::Relaxed);
        }
        trace!("gfn {gfn:#x} -> {} ({:?}, writable {})", pin.pfn, pin.kind, pin.writable);

        Ok(PinnedFrame::new(
            gfn,
            pin.pfn,
            pin.writable,
            pin.kind,
            Arc::clone(&self.host),
            Arc::clone(&self.ledger),
        ))
    }

    /// Translate `gfn` as `req` describes.
    ///
    /// # Errors
    ///
    /// See [`TranslateError`]; retryable variants are reported by
    /// [`TranslateError::is_retryable`].
    pub fn translate_with(
        &self,
        gfn: u64,
        req: TranslateRequest,
    ) -> Result<PinnedFrame, TranslateError> {
        let guard = self.srcu.read_lock();
        self.translate_in(self.slots.read(&guard), gfn, req)
    }

    /// Write-intent translation that never sleeps.
    pub fn translate_atomic(&self, gfn: u64) -> Result<PinnedFrame, TranslateError> {
        self.translate_with(gfn, TranslateRequest::write().with_mode(TranslateMode::Atomic))
    }

    /// Translation that reports non-resident pages instead of waiting.
    pub fn translate_async(
        &self,
        gfn: u64,
        write: bool,
        map_writable: bool,
    ) -> Result<PinnedFrame, TranslateError> {
        self.translate_with(
            gfn,
            TranslateRequest {
                write,
                mode: TranslateMode::Async,
                map_writable,
            },
        )
    }

    /// Blocking write-intent translation.
    pub fn translate(&self, gfn: u64) -> Result<PinnedFrame, TranslateError> {
        self.translate_with(gfn, TranslateRequest::write())
    }

    /// Blocking translation that also reports whether the frame may be
    /// mapped writable.
    pub fn translate_prot(
        &self,
        gfn: u64,
        write: bool,
        map_writable: bool,
    ) -> Result<(PinnedFrame, bool), TranslateError> {
        let frame = self.translate_with(
            gfn,
            TranslateRequest {
                write,
                mode: TranslateMode::Blocking,
                map_writable,
            },
        )?;
        let writable = frame.writable();
        Ok((frame, writable))
    }

    /// Pin up to `n` consecutive pages starting at `gfn` without sleeping.
    ///
    /// Stops at the first page that cannot be pinned.  Returns nothing if
    /// the slot holding `gfn` has fewer than `n` pages left or is
    /// read-only.
    pub fn pin_pages_atomic(&self, gfn: u64, n: usize) -> Vec<PinnedFrame> {
        let guard = self.srcu.read_lock();
        let slots = self.slots.read(&guard);
        let Some(slot) = slots.find_usable(gfn) else {
            return Vec::new();
        };
        let remaining = slot.end_gfn() - gfn;
        if slot.is_readonly() || remaining < n as u64 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(n);
        for i in 0..n as u64 {
            let Some(pfn) = self.host.pin_fast(slot.gfn_to_hva(gfn + i)) else {
                break;
            };
            frames.push(PinnedFrame::new(
                gfn + i,
                pfn,
                true,
                FrameKind::Ordinary,
                Arc::clone(&self.host),
                Arc::clone(&self.ledger),
            ));
        }
        self.stats
            .fast_path
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        frames
    }

    /// Translate `gfn` and run `commit` under the invalidation lock,
    /// retrying until no invalidation raced with the translation.
    ///
    /// `commit` is where a caller installs the frame into any cache that
    /// outlives this call; it never sees a frame whose host mapping was
    /// torn down after the translation began.  The frame is released
    /// after `commit` returns, dirty if `req.write`.
    ///
    /// `commit` runs inside a read-side section and must not change the
    /// slot table itself.
    pub fn map_gfn<R>(
        &self,
        gfn: u64,
        req: TranslateRequest,
        mut commit: impl FnMut(&PinnedFrame) -> R,
    ) -> Result<R, TranslateError> {
        loop {
            // One read section spans translation and commit, so a slot
            // change publishing meanwhile waits for `commit` to finish
            // before it flushes the slot's shadow state.
            let guard = self.srcu.read_lock();
            let slots = self.slots.read(&guard);
            let seq = self.mmu.read_seq();
            let frame = self.translate_in(slots, gfn, req)?;

            let mmu = self.mmu.lock();
            if self.mmu.retry(&mmu, seq) {
                drop(mmu);
                frame.release_clean();
                drop(guard);
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                trace!("gfn {gfn:#x}: invalidation raced with translation, retrying");
                thread::yield_now();
                continue;
            }
            let out = commit(&frame);
            drop(mmu);

            if req.write && frame.writable() {
                self.mark_page_dirty_in(slots, gfn);
                frame.release_dirty();
            } else {
                frame.release_clean();
            }
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, HOST_BASE};
    use memslots_abi::{UserMemoryRegion, MEM_LOG_DIRTY_PAGES, MEM_READONLY, PAGE_SIZE};
    use std::sync::atomic::AtomicBool;

    // ─── Resolution ──────────────────────────────────────────────────

    #[test]
    fn unmapped_gfn_is_no_mapping() {
        let h = Harness::new();
        let err = h.vm.translate(0x10).unwrap_err();
        assert_eq!(err, TranslateError::NoMapping { gfn: 0x10 });
        assert!(!err.is_retryable());
    }

    #[test]
    fn write_to_readonly_slot_is_denied() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, MEM_READONLY);
        assert_eq!(
            h.vm.translate(0x101).unwrap_err(),
            TranslateError::PermissionDenied { gfn: 0x101 }
        );
        let (frame, writable) = h.vm.translate_prot(0x101, false, true).unwrap();
        assert!(!writable, "read-only slot yielded a writable frame");
        frame.release_clean();
    }

    #[test]
    fn blocking_write_pins_the_slot_page() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let frame = h.vm.translate(0x102).unwrap();
        let hva = HOST_BASE + 0x100 * PAGE_SIZE + 2 * PAGE_SIZE;
        assert_eq!(frame.pfn(), h.host.pfn_of(hva));
        assert!(frame.writable());
        assert_eq!(h.host.pin_count(frame.pfn()), 1);
        frame.release_dirty();
        assert_eq!(h.host.outstanding_pins(), 0);
        assert!(h.host.is_page_dirty(h.host.pfn_of(hva)));
    }

    // ─── Paths ───────────────────────────────────────────────────────

    #[test]
    fn atomic_hits_fast_path_or_misses() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let frame = h.vm.translate_atomic(0x100).unwrap();
        frame.release_clean();
        assert_eq!(h.vm.stats().fast_path, 1);

        h.host.swap_out(h.hva(0x101));
        let err = h.vm.translate_atomic(0x101).unwrap_err();
        assert_eq!(err, TranslateError::AtomicMiss { gfn: 0x101 });
        assert!(err.is_retryable());
        assert!(!h.host.is_resident(h.hva(0x101)), "atomic path faulted a page in");
    }

    #[test]
    fn async_reports_non_resident_page() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.host.swap_out(h.hva(0x103));
        assert_eq!(
            h.vm.translate_async(0x103, false, false).unwrap_err(),
            TranslateError::TransientUnavailable { gfn: 0x103 }
        );
        let frame = h.vm.translate(0x103).unwrap();
        frame.release_clean();
        assert!(h.host.is_resident(h.hva(0x103)));
    }

    #[test]
    fn read_fault_upgrades_to_writable_when_allowed() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let (frame, writable) = h.vm.translate_prot(0x100, false, true).unwrap();
        assert!(writable);
        frame.release_clean();
        let (frame, writable) = h.vm.translate_prot(0x100, false, false).unwrap();
        assert!(!writable);
        frame.release_clean();
        assert_eq!(h.host.outstanding_pins(), 0);
    }

    #[test]
    fn host_readonly_mapping_denies_writes() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.host.protect(h.hva(0x100), 4 * PAGE_SIZE, false);
        assert_eq!(
            h.vm.translate(0x100).unwrap_err(),
            TranslateError::PermissionDenied { gfn: 0x100 }
        );
        let (frame, writable) = h.vm.translate_prot(0x100, false, true).unwrap();
        assert!(!writable);
        frame.release_clean();
    }

    #[test]
    fn poisoned_page_is_distinct() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.host.poison(h.hva(0x102));
        assert_eq!(
            h.vm.translate(0x102).unwrap_err(),
            TranslateError::Poisoned { gfn: 0x102 }
        );
    }

    #[test]
    fn poison_outranks_permission_fault() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.host.protect(h.hva(0x101), PAGE_SIZE, false);
        h.host.poison(h.hva(0x101));
        assert_eq!(
            h.vm.translate(0x101).unwrap_err(),
            TranslateError::Poisoned { gfn: 0x101 }
        );
        h.host.protect(h.hva(0x103), PAGE_SIZE, false);
        assert_eq!(
            h.vm.translate(0x103).unwrap_err(),
            TranslateError::PermissionDenied { gfn: 0x103 }
        );
    }

    #[test]
    fn interrupted_fault_is_retryable() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        h.host.swap_out(h.hva(0x100));
        h.host.set_signal_pending(true);
        let err = h.vm.translate(0x100).unwrap_err();
        assert_eq!(err, TranslateError::Interrupted { gfn: 0x100 });
        assert!(err.is_retryable());
    }

    #[test]
    fn slot_without_host_mapping_has_no_backing() {
        let h = Harness::new();
        h.add_raw_slot(0, 0x100, 4, 0x10_0000, 0);
        assert_eq!(
            h.vm.translate(0x100).unwrap_err(),
            TranslateError::NoBacking { gfn: 0x100, hva: 0x10_0000 }
        );
    }

    #[test]
    fn device_mapping_yields_device_frame() {
        let h = Harness::new();
        h.host.add_device_region(0xfe00_0000, 4 * PAGE_SIZE, 0xfe000, true);
        h.add_raw_slot(1, 0x800, 4, 0xfe00_0000, 0);
        let frame = h.vm.translate(0x802).unwrap();
        assert!(frame.is_device());
        assert_eq!(frame.pfn(), Pfn(0xfe002));
        frame.mark_dirty();
        frame.release_dirty();
        assert!(!h.host.is_page_dirty(Pfn(0xfe002)));
        assert_eq!(h.vm.pin_ledger().outstanding(), 0);
    }

    // ─── Batch pinning ───────────────────────────────────────────────

    #[test]
    fn pin_pages_atomic_stops_at_first_miss() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 8, 0);
        h.host.swap_out(h.hva(0x103));
        let frames = h.vm.pin_pages_atomic(0x100, 6);
        assert_eq!(frames.len(), 3);
        for f in frames {
            f.release_clean();
        }
        assert!(h.vm.pin_pages_atomic(0x105, 4).is_empty(), "ran past the slot end");
        assert_eq!(h.host.outstanding_pins(), 0);
    }

    // ─── Tokens ──────────────────────────────────────────────────────

    #[test]
    fn dropped_token_counts_as_leak_and_unpins() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 2, 0);
        let frame = h.vm.translate(0x100).unwrap();
        assert_eq!(h.vm.pin_ledger().outstanding(), 1);
        drop(frame);
        let ledger = h.vm.pin_ledger();
        assert_eq!(ledger.leaked(), 1);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(h.host.outstanding_pins(), 0);
    }

    #[test]
    fn release_clean_marks_nothing_dirty() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 2, 0);
        let frame = h.vm.translate(0x100).unwrap();
        let pfn = frame.pfn();
        frame.mark_accessed();
        frame.release_clean();
        assert!(h.host.is_page_accessed(pfn));
        assert!(!h.host.is_page_dirty(pfn));
        assert_eq!(h.vm.pin_ledger().released(), 1);
    }

    // ─── map_gfn ─────────────────────────────────────────────────────

    #[test]
    fn map_gfn_commits_and_marks_dirty() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, MEM_LOG_DIRTY_PAGES);
        let pfn = h
            .vm
            .map_gfn(0x102, TranslateRequest::write(), |f| {
                h.mmu.install(f.gfn(), f.pfn(), f.writable());
                f.pfn()
            })
            .unwrap();
        assert_eq!(h.mmu.lookup(0x102).unwrap().pfn, pfn);
        assert_eq!(h.vm.get_dirty_log(0).unwrap().dirty_pages(), vec![2]);
        assert_eq!(h.host.outstanding_pins(), 0);
    }

    #[test]
    fn invalidation_during_slow_path_forces_retry() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let hva = h.hva(0x101);
        h.host.swap_out(hva);

        // The first fault-in races with a reclaim of the same page.
        let fired = Arc::new(AtomicBool::new(false));
        let host = Arc::clone(&h.host);
        let once = Arc::clone(&fired);
        h.host.set_fault_hook(move |page| {
            if !once.swap(true, Ordering::SeqCst) {
                host.swap_out(page);
            }
        });

        let mut commits = 0;
        h.vm
            .map_gfn(0x101, TranslateRequest::write(), |f| {
                commits += 1;
                h.mmu.install(f.gfn(), f.pfn(), f.writable());
            })
            .unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(commits, 1);
        assert_eq!(h.vm.stats().retries, 1);
        assert!(h.mmu.lookup(0x101).is_some());
        assert_eq!(h.host.outstanding_pins(), 0);
    }

    /// Start `change` on another thread from inside the commit window and
    /// install the frame only once the change has published its first
    /// table.  The change must not finish before the install, and the
    /// installed entry must not survive it.
    fn slot_change_during_commit(change: UserMemoryRegion, old_gfn: u64) {
        let h = Harness::new();
        h.add_slot(1, 0x100, 4, 0);
        h.mmu.install(0x103, Pfn(0x42), true);
        let before = {
            let guard = h.vm.read_lock();
            h.vm.memslots(&guard).generation()
        };
        let vm: &VmMemory = &h.vm;
        let finished = &AtomicBool::new(false);

        thread::scope(|s| {
            let mut writer = None;
            h.vm.map_gfn(old_gfn, TranslateRequest::write(), |f| {
                writer = Some(s.spawn(move || {
                    let result = vm.set_region(&change);
                    finished.store(true, Ordering::SeqCst);
                    result
                }));
                loop {
                    let guard = vm.read_lock();
                    if vm.memslots(&guard).generation() > before {
                        break;
                    }
                    drop(guard);
                    thread::yield_now();
                }
                assert!(!finished.load(Ordering::SeqCst), "slot change finished inside commit");
                h.mmu.install(f.gfn(), f.pfn(), f.writable());
            })
            .unwrap();
            writer.unwrap().join().unwrap().unwrap();
        });

        assert!(!h.vm.is_visible_gfn(old_gfn));
        assert!(h.mmu.lookup(old_gfn).is_none(), "stale translation outlived slot change");
        assert!(h.mmu.lookup(0x103).is_none());
        assert_eq!(h.host.outstanding_pins(), 0);
    }

    #[test]
    fn delete_racing_commit_leaves_no_translation() {
        slot_change_during_commit(UserMemoryRegion::delete(1), 0x101);
    }

    #[test]
    fn move_racing_commit_leaves_no_translation() {
        let moved = UserMemoryRegion::new(1, 0x800 * PAGE_SIZE, 4 * PAGE_SIZE, HOST_BASE + 0x100 * PAGE_SIZE);
        slot_change_during_commit(moved, 0x101);
    }

    #[test]
    fn open_invalidation_window_blocks_commit() {
        let h = Harness::new();
        h.add_slot(0, 0x100, 4, 0);
        let seq = h.vm.mmu.read_seq();
        {
            let guard = h.vm.mmu.lock();
            h.vm.mmu.begin(&guard);
            assert!(h.vm.mmu.retry(&guard, seq));
            h.vm.mmu.end(&guard);
            assert!(h.vm.mmu.retry(&guard, seq), "sequence bump not observed");
        }
        let fresh = h.vm.mmu.read_seq();
        assert!(!h.vm.mmu.retry(&h.vm.mmu.lock(), fresh));
    }
}
