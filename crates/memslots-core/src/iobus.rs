//! MMIO and port-I/O bus dispatch.
//!
//! Each bus is a sorted array of `(addr, len, device)` ranges published
//! through an [`RcuCell`].  Registration builds a complete replacement
//! array and swaps it in; dispatch reads the current array under an SRCU
//! guard and never takes a lock.
//!
//! Ranges may be layered.  An access is offered to every range that
//! fully contains it, lowest start first, until a device claims it.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::MutexGuard;
use thiserror::Error;

use crate::srcu::{RcuCell, Srcu};
use crate::verified::iobus::{self as viobus, IoSpan};

/// Which bus an access travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Mmio,
    Pio,
}

impl BusKind {
    fn index(self) -> usize {
        match self {
            BusKind::Mmio => memslots_abi::MMIO_BUS as usize,
            BusKind::Pio => memslots_abi::PIO_BUS as usize,
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Mmio => f.write_str("mmio"),
            BusKind::Pio => f.write_str("pio"),
        }
    }
}

/// An emulated device attached to a bus.
///
/// `read` and `write` return `true` if the device handled the access.
/// A device that declines lets the dispatcher offer the access to the
/// next matching range.
pub trait IoDevice: Send + Sync {
    fn read(&self, addr: u64, data: &mut [u8]) -> bool;
    fn write(&self, addr: u64, data: &[u8]) -> bool;

    fn name(&self) -> &str {
        "device"
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoBusError {
    /// The bus already holds its maximum number of ranges.
    #[error("{bus} bus is full ({max} devices)")]
    BusFull { bus: BusKind, max: usize },

    /// The device is not registered on the bus.
    #[error("device not registered on the {bus} bus")]
    NotFound { bus: BusKind },

    /// No registered device claimed the access.
    #[error("unhandled {bus} access at {addr:#x} ({len} bytes)")]
    Unhandled { bus: BusKind, addr: u64, len: usize },

    /// Zero-length or wrapping range.
    #[error("invalid {bus} range {addr:#x}+{len}")]
    InvalidRange { bus: BusKind, addr: u64, len: u64 },

    /// The replacement table could not be allocated.
    #[error("out of memory growing the {bus} bus")]
    OutOfMemory { bus: BusKind },
}

#[derive(Clone)]
struct IoRange {
    span: IoSpan,
    dev: Arc<dyn IoDevice>,
}

/// One published version of a bus.
#[derive(Clone, Default)]
pub struct IoBusTable {
    ranges: Vec<IoRange>,
}

impl IoBusTable {
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Registered spans in dispatch order.
    pub fn spans(&self) -> impl Iterator<Item = IoSpan> + '_ {
        self.ranges.iter().map(|r| r.span)
    }

    fn dispatch(&self, key: &IoSpan, mut offer: impl FnMut(&dyn IoDevice) -> bool) -> bool {
        viobus::matches(&self.ranges, key, |r: &IoRange| r.span)
            .any(|i| offer(self.ranges[i].dev.as_ref()))
    }
}

/// Copy `ranges` into a vector with room for `capacity` entries,
/// failing instead of aborting if the allocation cannot be made.
fn try_copy(ranges: &[IoRange], capacity: usize, bus: BusKind) -> Result<Vec<IoRange>, IoBusError> {
    let mut copy = Vec::new();
    copy.try_reserve_exact(capacity)
        .map_err(|_| IoBusError::OutOfMemory { bus })?;
    copy.extend(ranges.iter().cloned());
    Ok(copy)
}

/// The MMIO and PIO buses of one VM.
pub struct IoBuses {
    buses: [RcuCell<IoBusTable>; memslots_abi::NR_BUSES],
    max_devs: usize,
}

impl IoBuses {
    pub fn new(srcu: Arc<Srcu>, max_devs: usize) -> Self {
        Self {
            buses: [
                RcuCell::new(IoBusTable::default(), Arc::clone(&srcu)),
                RcuCell::new(IoBusTable::default(), srcu),
            ],
            max_devs,
        }
    }

    /// Attach `dev` to `[addr, addr + len)` on `bus`.
    ///
    /// `_topology` is the VM's topology-lock guard.
    pub(crate) fn register(
        &self,
        _topology: &MutexGuard<'_, ()>,
        bus: BusKind,
        addr: u64,
        len: u64,
        dev: Arc<dyn IoDevice>,
    ) -> Result<(), IoBusError> {
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(IoBusError::InvalidRange { bus, addr, len });
        }
        let cell = &self.buses[bus.index()];
        let mut ranges = {
            let guard = cell.srcu().read_lock();
            let current = &cell.read(&guard).ranges;
            if current.len() >= self.max_devs {
                return Err(IoBusError::BusFull {
                    bus,
                    max: self.max_devs,
                });
            }
            try_copy(current, current.len() + 1, bus)?
        };
        debug!("{bus} bus: {} at {addr:#x}+{len:#x}", dev.name());
        ranges.push(IoRange {
            span: IoSpan::new(addr, len),
            dev,
        });
        ranges.sort_by(|a, b| viobus::sort_cmp(&a.span, &b.span));

        drop(cell.publish(Box::new(IoBusTable { ranges })));
        Ok(())
    }

    /// Detach every range `dev` is registered at on `bus`.
    pub(crate) fn unregister(
        &self,
        _topology: &MutexGuard<'_, ()>,
        bus: BusKind,
        dev: &Arc<dyn IoDevice>,
    ) -> Result<(), IoBusError> {
        let cell = &self.buses[bus.index()];
        let (ranges, before) = {
            let guard = cell.srcu().read_lock();
            let current = &cell.read(&guard).ranges;
            let mut ranges = try_copy(current, current.len(), bus)?;
            ranges.retain(|r| !Arc::ptr_eq(&r.dev, dev));
            (ranges, current.len())
        };
        if ranges.len() == before {
            return Err(IoBusError::NotFound { bus });
        }
        debug!("{bus} bus: removed {} ({} ranges)", dev.name(), before - ranges.len());

        // The retired table holds the last references to the device.
        drop(cell.publish(Box::new(IoBusTable { ranges })));
        Ok(())
    }

    /// Offer a read of `data.len()` bytes at `addr` to the devices on `bus`.
    pub fn read(&self, bus: BusKind, addr: u64, data: &mut [u8]) -> Result<(), IoBusError> {
        let cell = &self.buses[bus.index()];
        let guard = cell.srcu().read_lock();
        let key = IoSpan::new(addr, data.len() as u64);
        if cell.read(&guard).dispatch(&key, |dev| dev.read(addr, data)) {
            return Ok(());
        }
        trace!("unhandled {bus} read at {addr:#x}");
        Err(IoBusError::Unhandled {
            bus,
            addr,
            len: data.len(),
        })
    }

    /// Offer a write of `data` at `addr` to the devices on `bus`.
    pub fn write(&self, bus: BusKind, addr: u64, data: &[u8]) -> Result<(), IoBusError> {
        let cell = &self.buses[bus.index()];
        let guard = cell.srcu().read_lock();
        let key = IoSpan::new(addr, data.len() as u64);
        if cell.read(&guard).dispatch(&key, |dev| dev.write(addr, data)) {
            return Ok(());
        }
        trace!("unhandled {bus} write at {addr:#x}");
        Err(IoBusError::Unhandled {
            bus,
            addr,
            len: data.len(),
        })
    }

    /// Clone of the current table of `bus`.
    pub fn table(&self, bus: BusKind) -> IoBusTable {
        self.buses[bus.index()].snapshot()
    }
}
