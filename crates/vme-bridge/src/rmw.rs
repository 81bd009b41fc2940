//! Atomic read-modify-write cycles
//!
//! The bridge has a single RMW latch: once armed for a PCI address, the
//! next read of that address through an outbound window becomes an
//! indivisible VME read/compare/write. [`RmwEngine`] serializes use of the
//! latch, samples the location until the enabled bits read back as the
//! swap data, and always disarms the latch afterwards.
//!
//! Data values are what a 32-bit load through the window sees.

use crate::chip::BridgeChip;
use crate::error::{Result, VmeError};
use crate::platform::MappedWindow;
use std::sync::{Mutex, PoisonError};
use vme_chip::attr::AddressSpace;

/// Attempts made when the caller does not say otherwise
pub const DEFAULT_RMW_ATTEMPTS: u32 = 16;

/// One compare-and-swap request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmwOperation {
    /// VME address of the target word
    pub address: u64,
    /// Address space of the target
    pub space: AddressSpace,
    /// Bits taking part in compare and swap
    pub enable: u32,
    /// Expected value of the enabled bits
    pub compare: u32,
    /// Replacement for the enabled bits
    pub swap: u32,
    /// Samples taken before giving up
    pub max_attempts: u32,
}

impl RmwOperation {
    /// Full-word compare-and-swap at `address`
    #[must_use]
    pub const fn new(address: u64, space: AddressSpace, compare: u32, swap: u32) -> Self {
        Self {
            address,
            space,
            enable: u32::MAX,
            compare,
            swap,
            max_attempts: DEFAULT_RMW_ATTEMPTS,
        }
    }

    /// Restrict compare and swap to `mask`
    #[must_use]
    pub const fn with_enable(mut self, mask: u32) -> Self {
        self.enable = mask;
        self
    }

    /// Bound the number of samples
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    fn converged(&self, sampled: u32) -> bool {
        sampled & self.enable == self.swap & self.enable
    }
}

/// A completed RMW
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmwOutcome {
    /// Samples taken, including the one that converged
    pub attempts: u32,
    /// Value read on the converging sample
    pub value: u32,
}

/// Owner of the bridge's RMW latch
#[derive(Debug, Default)]
pub struct RmwEngine {
    latch: Mutex<()>,
}

impl RmwEngine {
    /// New engine; one per bridge
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` on the word at `offset` of `mapping`, whose local address
    /// is `pci_address`
    ///
    /// # Errors
    ///
    /// - `Configuration` for a misaligned target or zero attempts
    /// - `RmwExhausted` if the enabled bits never read back as the swap data
    /// - register or window access errors
    pub fn run(
        &self,
        chip: &dyn BridgeChip,
        mapping: &dyn MappedWindow,
        offset: usize,
        pci_address: u64,
        op: &RmwOperation,
    ) -> Result<RmwOutcome> {
        if op.address % 4 != 0 {
            return Err(VmeError::configuration(format!(
                "RMW target {:#x} is not 32-bit aligned",
                op.address
            )));
        }
        if op.max_attempts == 0 {
            return Err(VmeError::configuration("RMW needs at least one attempt"));
        }

        let _latch = self.latch.lock().unwrap_or_else(PoisonError::into_inner);
        chip.arm_rmw(pci_address, op.enable, op.compare, op.swap)?;
        let sampled = Self::sample(mapping, offset, op);
        let disarmed = chip.disarm_rmw();

        let outcome = sampled?;
        disarmed?;
        tracing::debug!(
            "RMW {} {:#x}: {:#010x} after {} attempt(s)",
            op.space,
            op.address,
            outcome.value,
            outcome.attempts
        );
        Ok(outcome)
    }

    fn sample(mapping: &dyn MappedWindow, offset: usize, op: &RmwOperation) -> Result<RmwOutcome> {
        for attempt in 1..=op.max_attempts {
            let value = mapping.read32(offset)?;
            if op.converged(value) {
                return Ok(RmwOutcome {
                    attempts: attempt,
                    value,
                });
            }
            tracing::trace!("RMW attempt {attempt}: read {value:#010x}");
        }
        Err(VmeError::RmwExhausted {
            attempts: op.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_only_looks_at_enabled_bits() {
        let op = RmwOperation::new(0x100, AddressSpace::A24, 0, 0x0000_00AB).with_enable(0xFF);
        assert!(op.converged(0x1234_56AB));
        assert!(!op.converged(0x1234_56AA));

        let op = RmwOperation::new(0x100, AddressSpace::A24, 0, 7);
        assert_eq!(op.enable, u32::MAX);
        assert_eq!(op.max_attempts, DEFAULT_RMW_ATTEMPTS);
        assert!(!op.converged(0x8000_0007));
    }
}
