//! Guest-physical memory core for a KVM-style VMM.
//!
//! Maps guest frame numbers to host memory through a versioned table of
//! memory slots that execution threads read without locking, keeps
//! translations coherent with host reclaim, logs dirty pages for live
//! migration and dispatches MMIO/PIO accesses to emulated devices.
//!
//! # Architecture
//!
//! - [`vm`] — [`VmMemory`](vm::VmMemory), the per-VM owner of everything below
//! - [`memslot`] — Slot table, region requests, generations
//! - [`srcu`] — Grace-period reclamation for published tables
//! - [`translate`] — gfn → hva → pfn translation and pinned-frame tokens
//! - [`dirty`] — Per-slot dirty bitmaps
//! - [`mmu_notifier`] — Invalidation `(seq, count)` protocol
//! - [`requests`] — Cross-CPU requests and vCPU kicks
//! - [`iobus`] — MMIO/PIO range dispatch
//! - [`guest_access`] — Guest byte access and the gfn → hva cache
//! - [`host`] — Host memory manager interface and a simulated host
//! - [`arch`] — Architecture hooks and a software shadow MMU
//! - [`kvm`] — Mirroring slots into a `/dev/kvm` VM
//! - [`config`] — Memory configuration
//! - [`verified`] — Pure functions with checked pre/postconditions

pub mod arch;
pub mod config;
pub mod dirty;
pub mod guest_access;
pub mod host;
pub mod iobus;
pub mod kvm;
pub mod memslot;
pub mod mmu_notifier;
pub mod requests;
pub mod srcu;
pub mod translate;
pub mod verified;
pub mod vm;

#[cfg(test)]
mod testing;
