//! Register access to the bridge control-and-status region
//!
//! [`RegisterBus`] is the raw 32-bit transport (a mapped BAR, a character
//! device, or the simulator). [`ChipRegisters`] layers the variant's byte
//! order rule on top so that the rest of the driver only ever sees
//! host-order values.

use crate::error::{Result, VmeError};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vme_chip::pcie::ChipVariant;
use vme_chip::tsi148::SWIZZLE_BOUNDARY;

/// Raw 32-bit access to the control region.
///
/// Values are exactly what the bus delivered, with no byte swapping.
/// Offsets are bytes from the start of the region and must be 4-aligned.
pub trait RegisterBus: Debug + Send + Sync {
    /// Read the 32-bit register at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of range or the transport fails.
    fn read32(&self, offset: usize) -> Result<u32>;

    /// Write the 32-bit register at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of range or the transport fails.
    fn write32(&self, offset: usize, value: u32) -> Result<()>;

    /// Size of the region in bytes
    fn size(&self) -> usize;
}

/// Check an access against a region size.
pub(crate) fn check_bounds(offset: usize, len: usize, limit: usize) -> Result<()> {
    if offset % 4 != 0 || offset.checked_add(len).map_or(true, |end| end > limit) {
        return Err(VmeError::configuration(format!(
            "Register access out of bounds: offset={offset:#x}, size={len}, limit={limit:#x}"
        )));
    }
    Ok(())
}

/// How a variant's registers are laid out in PCI byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Every register is little-endian (Universe)
    LittleEndian,
    /// Little-endian up to the boundary, host order above it (Tsi148)
    SelfSwizzling {
        /// Highest offset still in PCI little-endian order
        boundary: usize,
    },
}

impl ByteOrder {
    /// Byte order rule of a variant.
    #[must_use]
    pub const fn for_variant(variant: ChipVariant) -> Self {
        match variant {
            ChipVariant::Tsi148 => Self::SelfSwizzling {
                boundary: SWIZZLE_BOUNDARY,
            },
            _ => Self::LittleEndian,
        }
    }

    /// Whether `offset` needs a little-endian conversion.
    #[must_use]
    pub const fn converts(self, offset: usize) -> bool {
        match self {
            Self::LittleEndian => true,
            Self::SelfSwizzling { boundary } => offset <= boundary,
        }
    }
}

/// Host-order view of a bridge's registers.
#[derive(Debug, Clone)]
pub struct ChipRegisters {
    bus: Arc<dyn RegisterBus>,
    order: ByteOrder,
}

impl ChipRegisters {
    /// Wrap a transport with a variant's byte-order rule
    pub fn new(bus: Arc<dyn RegisterBus>, variant: ChipVariant) -> Self {
        Self {
            bus,
            order: ByteOrder::for_variant(variant),
        }
    }

    /// Byte-order rule in effect
    pub const fn order(&self) -> ByteOrder {
        self.order
    }

    /// Read a register in host order
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn read(&self, offset: usize) -> Result<u32> {
        let raw = self.bus.read32(offset)?;
        let value = if self.order.converts(offset) {
            u32::from_le(raw)
        } else {
            raw
        };
        tracing::trace!("Read reg @ {offset:#05x} = {value:#010x}");
        Ok(value)
    }

    /// Write a register given in host order
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn write(&self, offset: usize, value: u32) -> Result<()> {
        tracing::trace!("Write reg @ {offset:#05x} = {value:#010x}");
        let raw = if self.order.converts(offset) {
            value.to_le()
        } else {
            value
        };
        self.bus.write32(offset, raw)
    }

    /// Read, keep the bits in `keep`, OR in `set`, write back
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn modify(&self, offset: usize, keep: u32, set: u32) -> Result<u32> {
        let value = (self.read(offset)? & keep) | set;
        self.write(offset, value)?;
        Ok(value)
    }

    /// Poll a register until `done` returns true, sleeping between samples
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the deadline passes, or transport errors.
    pub fn poll(
        &self,
        cfg: PollConfig<'_>,
        mut done: impl FnMut(u32) -> bool,
    ) -> Result<u32> {
        let PollConfig {
            reg,
            timeout,
            interval,
            operation,
        } = cfg;
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.read(reg)?;
            if done(value) {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(VmeError::timeout(operation, timeout));
            }
            std::thread::sleep(interval.min(deadline - now));
        }
    }
}

/// Parameters for polling a status register.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig<'a> {
    /// Register to sample
    pub reg: usize,
    /// Give up after this long
    pub timeout: Duration,
    /// Sleep between samples
    pub interval: Duration,
    /// Name used in the timeout error
    pub operation: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universe_converts_everywhere() {
        let order = ByteOrder::for_variant(ChipVariant::Universe);
        assert!(order.converts(0x004));
        assert!(order.converts(0xF00));
    }

    #[test]
    fn tsi148_swizzles_above_boundary() {
        let order = ByteOrder::for_variant(ChipVariant::Tsi148);
        assert!(order.converts(0x000));
        assert!(order.converts(0x100));
        assert!(!order.converts(0x104));
        assert!(!order.converts(0x448));
    }

    #[test]
    fn bounds_check() {
        assert!(check_bounds(0xFFC, 4, 0x1000).is_ok());
        assert!(check_bounds(0x1000, 4, 0x1000).is_err());
        assert!(check_bounds(0x002, 4, 0x1000).is_err());
        assert!(check_bounds(usize::MAX - 1, 4, 0x1000).is_err());
    }
}
