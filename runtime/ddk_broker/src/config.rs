//! Broker configuration
//!
//! Compile-time bounds for the slot table and wait queues, plus the runtime
//! [`BrokerConfig`] describing the physical memory and interrupt lines the
//! broker manages.

use crate::{DdkError, Result};
use static_assertions::const_assert;

/// Page size shift (4KB pages)
pub const PAGE_SIZE_SHIFT: u32 = 12;

/// Page size in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_SHIFT;

/// Number of slots per interrupt object
///
/// Bounded by the width of the bitmask returned from a coalescing wait.
pub const MAX_SLOTS: usize = 64;

/// Pending timestamped events kept per slot before the oldest is dropped
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// Threads that may block on one interrupt object at the same time
pub const MAX_WAITERS: usize = 16;

const_assert!(MAX_SLOTS <= u64::BITS as usize);
const_assert!(EVENT_QUEUE_DEPTH > 0);
const_assert!(MAX_WAITERS > 0);
const_assert!(PAGE_SIZE.is_power_of_two());

/// Runtime configuration for a [`DdkBroker`](crate::DdkBroker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Physical base of the RAM handed to the page pool
    pub ram_base: usize,

    /// Size of that RAM in bytes (whole pages)
    pub ram_size: usize,

    /// Boot-time regions (base, size) withheld from the pool
    pub reserved: Vec<(usize, usize)>,

    /// Number of hardware interrupt vectors the controller exposes
    pub max_vectors: u32,

    /// Handles a single process may hold
    pub handle_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ram_base: 0x4000_0000,
            ram_size: 16 * 1024 * 1024,
            reserved: Vec::new(),
            // GICv2 supports up to 1020 interrupt IDs
            max_vectors: 1020,
            handle_capacity: 1024,
        }
    }
}

impl BrokerConfig {
    /// Check that the configuration describes a usable system
    pub fn validate(&self) -> Result<()> {
        if self.ram_size == 0 || self.ram_base % PAGE_SIZE != 0 || self.ram_size % PAGE_SIZE != 0 {
            return Err(DdkError::InvalidArgs);
        }
        let ram_end = self
            .ram_base
            .checked_add(self.ram_size)
            .ok_or(DdkError::InvalidArgs)?;

        for &(base, size) in &self.reserved {
            let end = base.checked_add(size).ok_or(DdkError::InvalidArgs)?;
            if base < self.ram_base || end > ram_end {
                return Err(DdkError::InvalidArgs);
            }
        }

        if self.max_vectors == 0 || self.handle_capacity == 0 {
            return Err(DdkError::InvalidArgs);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ram_size / PAGE_SIZE, 4096);
    }

    #[test]
    fn test_rejects_unaligned_ram() {
        let config = BrokerConfig {
            ram_base: 0x4000_0100,
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate(), Err(DdkError::InvalidArgs));

        let config = BrokerConfig {
            ram_size: PAGE_SIZE + 1,
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate(), Err(DdkError::InvalidArgs));
    }

    #[test]
    fn test_rejects_reservation_outside_ram() {
        let config = BrokerConfig {
            reserved: vec![(0x1000, PAGE_SIZE)],
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate(), Err(DdkError::InvalidArgs));
    }

    #[test]
    fn test_rejects_overflowing_ram() {
        let config = BrokerConfig {
            ram_base: usize::MAX - PAGE_SIZE + 1,
            ram_size: 2 * PAGE_SIZE,
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate(), Err(DdkError::InvalidArgs));
    }

    #[test]
    fn test_rejects_zero_capacities() {
        let config = BrokerConfig {
            max_vectors: 0,
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate(), Err(DdkError::InvalidArgs));

        let config = BrokerConfig {
            handle_capacity: 0,
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate(), Err(DdkError::InvalidArgs));
    }
}
