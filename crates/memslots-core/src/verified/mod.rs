//! Pure functions behind the memory core.
//!
//! Each sub-module holds the arithmetic and decision logic of one
//! subsystem with **no locking, no atomics, and no host interaction**.
//! The effectful modules (`memslot`, `iobus`, `guest_access`) delegate
//! here for every decision that can be stated as "values in, value out".
//!
//! Keeping the boundary sharp gives us:
//!
//! 1. Request classification and overlap rules that are unit-testable
//!    without building a VM.
//! 2. `debug_assert!` pre/postconditions that run on every debug build
//!    of the effectful shell.
//! 3. No transitive dependency on `kvm-ioctls`, `vm-memory`, etc.

pub mod access;
pub mod iobus;
pub mod slots;
