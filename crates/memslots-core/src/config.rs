//! VM memory configuration.
//!
//! Loaded from JSON with every field optional:
//!
//! ```text
//! { "user_slots": 64, "max_bus_devices": 200, "mirror_to_kvm": true }
//! ```

use memslots_abi::{
    DEFAULT_PRIVATE_MEM_SLOTS, DEFAULT_USER_MEM_SLOTS, MAX_MEM_SLOTS, MAX_NR_PAGES, NR_IOBUS_DEVS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::srcu::DEFAULT_SPIN_BUDGET;
use crate::verified::slots::Limits;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse memory config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("at least one user slot is required")]
    NoUserSlots,

    #[error("{user} user + {private} private slots exceeds the limit of {max}")]
    TooManySlots { user: u16, private: u16, max: u16 },

    #[error("I/O buses must accept at least one device")]
    NoBusDevices,
}

/// Sizing and behaviour of one VM's memory core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Slot ids settable through [`set_user_region`](crate::vm::VmMemory::set_user_region).
    pub user_slots: u16,
    /// Additional ids reserved for the VMM itself.
    pub private_slots: u16,
    /// Largest page count of a single slot.
    pub max_pages: u64,
    /// Ranges per I/O bus.
    pub max_bus_devices: usize,
    /// Reader-drain polls before a grace period starts yielding.
    pub grace_spin_budget: u32,
    /// Replay committed slot changes into a `/dev/kvm` VM.
    pub mirror_to_kvm: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            user_slots: DEFAULT_USER_MEM_SLOTS,
            private_slots: DEFAULT_PRIVATE_MEM_SLOTS,
            max_pages: MAX_NR_PAGES,
            max_bus_devices: NR_IOBUS_DEVS,
            grace_spin_budget: DEFAULT_SPIN_BUDGET,
            mirror_to_kvm: false,
        }
    }
}

impl MemoryConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_slots == 0 {
            return Err(ConfigError::NoUserSlots);
        }
        let total = u32::from(self.user_slots) + u32::from(self.private_slots);
        if total > u32::from(MAX_MEM_SLOTS) {
            return Err(ConfigError::TooManySlots {
                user: self.user_slots,
                private: self.private_slots,
                max: MAX_MEM_SLOTS,
            });
        }
        if self.max_bus_devices == 0 {
            return Err(ConfigError::NoBusDevices);
        }
        Ok(())
    }

    /// Slot-table limits for a validated config.
    pub fn limits(&self) -> Limits {
        Limits {
            user_slots: self.user_slots,
            total_slots: self.user_slots + self.private_slots,
            max_pages: self.max_pages,
        }
    }
}
