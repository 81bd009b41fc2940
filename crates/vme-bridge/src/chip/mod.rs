//! Per-variant bridge implementations
//!
//! [`BridgeChip`] is the full register-level operation set. The two
//! implementations differ only in register layout and a few quirks:
//!
//! - ca91c042 has one DMA channel, the Tsi148 two independent ones
//! - the Tsi148 byte-swaps registers above offset 0x100 itself
//!   (handled once in [`ChipRegisters`])
//! - each chip lacks some address spaces in some directions
//!
//! [`probe`] reads the PCI ID at register offset 0 and returns the right
//! implementation; nothing above this module looks at the variant again.

mod tsi148;
mod universe;

pub use tsi148::Tsi148Chip;
pub use universe::UniverseChip;

use crate::arbiter::{ArbiterConfig, RequesterConfig};
use crate::bus::{ChipRegisters, RegisterBus};
use crate::config::DmaTuning;
use crate::dma::{DmaSnapshot, DmaStatus, ResolvedSegment};
use crate::error::{BusSide, Result, VmeError};
use crate::platform::TickSource;
use crate::window::{InboundWindow, OutboundWindow, WindowDirection};
use std::fmt::Debug;
use std::sync::Arc;
use vme_chip::attr::{AccessFilter, AddressSpace};
use vme_chip::pcie::{split_pci_id, ChipVariant, TUNDRA_VENDOR_ID};

/// Faulting access latched by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    /// Bus that reported it
    pub side: BusSide,
    /// Faulting address, 0 if not logged
    pub address: u64,
}

impl From<BusFault> for VmeError {
    fn from(fault: BusFault) -> Self {
        Self::BusError {
            source_bus: fault.side,
            address: fault.address,
        }
    }
}

/// How a DMA channel is started
#[derive(Debug, Clone, Copy)]
pub enum DmaStart<'a> {
    /// Load one segment straight into the channel registers
    Direct(&'a ResolvedSegment),
    /// Point the channel at a descriptor chain
    Chained {
        /// Bus address of the first descriptor
        head: u64,
    },
}

/// Interrupt sources found pending (and already cleared) by one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingInterrupts {
    /// DMA channels that finished, bit per channel
    pub dma: u8,
    /// Mailboxes written, bit per mailbox
    pub mailbox: u8,
    /// Location monitors hit, bit per monitor
    pub location_monitor: u8,
    /// Acknowledged VME interrupts, indexed by level (1-7)
    pub vme: [Option<u8>; 8],
    /// Bus error reported through the error interrupt
    pub bus_error: Option<BusFault>,
    /// SYSFAIL asserted
    pub sysfail: bool,
    /// ACFAIL asserted
    pub acfail: bool,
}

impl PendingInterrupts {
    /// Nothing was pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Register-level operation set of one bridge instance
pub trait BridgeChip: Debug + Send + Sync {
    /// Which chip this is
    fn variant(&self) -> ChipVariant;

    /// Host-order register access
    fn registers(&self) -> &ChipRegisters;

    // ── Start of day ─────────────────────────────────────────────────────

    /// Write/read echo on scratch registers
    ///
    /// # Errors
    ///
    /// Returns `HardwareMismatch` if any pattern does not read back.
    fn self_test(&self) -> Result<()>;

    /// Whether this bridge sits in the system-controller slot
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn is_system_controller(&self) -> Result<bool>;

    /// Quiesce, then enable the interrupt sources for the slot role;
    /// returns the system-controller flag
    ///
    /// # Errors
    ///
    /// Returns `HardwareMismatch` if the enables do not read back.
    fn initialize(&self) -> Result<bool>;

    /// Disable every window and monitor, clear latches, mask interrupts
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn shutdown(&self) -> Result<()>;

    /// Enable the CR/CSR image for geographical slot `slot`
    ///
    /// # Errors
    ///
    /// `Configuration` for a slot outside 1-21, or register access errors.
    fn setup_slot(&self, slot: u8) -> Result<()>;

    /// Pulse VME SYSRESET
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn sys_reset(&self) -> Result<()>;

    /// Latched bus error, cleared when `clear` is set
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn check_bus_error(&self, clear: bool) -> Result<Option<BusFault>>;

    // ── Windows ──────────────────────────────────────────────────────────

    /// Alignment of base and size, `None` if the space is unavailable
    fn window_granularity(&self, direction: WindowDirection, space: AddressSpace) -> Option<u64>;

    /// Disable, program and re-enable an outbound window
    ///
    /// # Errors
    ///
    /// `Configuration` for options this chip lacks (checked before any
    /// write), `HardwareMismatch` if registers do not read back.
    fn write_outbound(&self, window: &OutboundWindow) -> Result<()>;

    /// Decode an outbound window
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn read_outbound(&self, index: usize) -> Result<OutboundWindow>;

    /// Disable, program and re-enable an inbound window
    ///
    /// # Errors
    ///
    /// As [`BridgeChip::write_outbound`].
    fn write_inbound(&self, window: &InboundWindow) -> Result<()>;

    /// Decode an inbound window
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn read_inbound(&self, index: usize) -> Result<InboundWindow>;

    // ── DMA ──────────────────────────────────────────────────────────────

    /// Independent DMA channels
    fn dma_channels(&self) -> usize {
        self.variant().dma_channels()
    }

    /// Bytes per chained descriptor
    fn descriptor_size(&self) -> usize;

    /// Largest byte count one descriptor may carry
    fn max_descriptor_bytes(&self) -> u32;

    /// Reject segments this engine cannot execute
    ///
    /// # Errors
    ///
    /// `Configuration` or `UnsupportedAddressSpace`.
    fn validate_segment(&self, segment: &ResolvedSegment) -> Result<()>;

    /// Write one descriptor into `out` (exactly [`BridgeChip::descriptor_size`] bytes)
    ///
    /// # Errors
    ///
    /// `Configuration` if an address does not fit the descriptor format.
    fn encode_descriptor(
        &self,
        segment: &ResolvedSegment,
        next: Option<u64>,
        out: &mut [u8],
    ) -> Result<()>;

    /// Program and start a channel; returns the tick read just before GO
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn start_dma(
        &self,
        channel: usize,
        start: DmaStart<'_>,
        tuning: &DmaTuning,
        ticks: &dyn TickSource,
    ) -> Result<u32>;

    /// Decoded channel status
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn dma_status(&self, channel: usize) -> Result<DmaStatus>;

    /// Diagnostic register snapshot
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn dma_snapshot(&self, channel: usize) -> Result<DmaSnapshot>;

    /// Hard-stop a channel
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn abort_dma(&self, channel: usize) -> Result<()>;

    /// Clear latched channel status before the next transfer
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn clear_dma(&self, channel: usize) -> Result<()>;

    // ── Interrupts ───────────────────────────────────────────────────────

    /// Read enabled status, clear it, acknowledge VME levels (7 down to 1)
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn take_pending(&self) -> Result<PendingInterrupts>;

    /// Assert a VME interrupt
    ///
    /// # Errors
    ///
    /// `Configuration` for vectors the chip cannot send, before any write.
    fn raise_vme_irq(&self, level: u8, vector: u8) -> Result<()>;

    /// Whether the raised interrupt is still waiting for its IACK
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn vme_irq_pending(&self) -> Result<bool>;

    /// Withdraw the raised interrupt
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn release_vme_irq(&self) -> Result<()>;

    /// Write mailbox 0 so that the chip interrupts the host
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn trigger_mailbox(&self) -> Result<()>;

    /// Arm the location monitor on `address` in `space`
    ///
    /// # Errors
    ///
    /// `UnsupportedAddressSpace` or `Configuration` for a misaligned base.
    fn setup_location_monitor(
        &self,
        address: u64,
        space: AddressSpace,
        access: AccessFilter,
    ) -> Result<()>;

    /// Disarm the location monitor
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn disable_location_monitor(&self) -> Result<()>;

    // ── RMW ──────────────────────────────────────────────────────────────

    /// Load the RMW latch for the next read of `pci_address`
    ///
    /// # Errors
    ///
    /// `Configuration` if the address cannot be latched.
    fn arm_rmw(&self, pci_address: u64, enable: u32, compare: u32, swap: u32) -> Result<()>;

    /// Disable the RMW latch
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn disarm_rmw(&self) -> Result<()>;

    // ── Arbiter / requester ──────────────────────────────────────────────

    /// Program the arbiter
    ///
    /// # Errors
    ///
    /// `Configuration` for unrepresentable settings.
    fn set_arbiter(&self, config: &ArbiterConfig) -> Result<()>;

    /// Decode the arbiter
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn arbiter(&self) -> Result<ArbiterConfig>;

    /// Program the requester
    ///
    /// # Errors
    ///
    /// `Configuration` for unrepresentable settings.
    fn set_requester(&self, config: &RequesterConfig) -> Result<()>;

    /// Decode the requester
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    fn requester(&self) -> Result<RequesterConfig>;
}

/// Identify the bridge behind `bus` and build its implementation
///
/// # Errors
///
/// Returns `HardwareMismatch` for a foreign vendor or an unknown device.
pub fn probe(bus: Arc<dyn RegisterBus>) -> Result<Arc<dyn BridgeChip>> {
    // Offset 0 is little-endian on both chips
    let id = u32::from_le(bus.read32(0)?);
    let (vendor, device) = split_pci_id(id);
    if vendor != TUNDRA_VENDOR_ID {
        return Err(VmeError::hardware_mismatch(format!(
            "Vendor {vendor:#06x} is not Tundra ({TUNDRA_VENDOR_ID:#06x})"
        )));
    }

    let variant = ChipVariant::from_device_id(device);
    tracing::info!("Probed {variant} (device {device:#06x})");
    match variant {
        ChipVariant::Universe => Ok(Arc::new(UniverseChip::new(bus))),
        ChipVariant::Tsi148 => Ok(Arc::new(Tsi148Chip::new(bus))),
        ChipVariant::Unknown(id) => Err(VmeError::hardware_mismatch(format!(
            "Unsupported Tundra device {id:#06x}"
        ))),
    }
}

/// Walking-one echo test on a pair of scratch registers, restoring zero.
pub(crate) fn walking_bit_echo(regs: &ChipRegisters, offsets: [usize; 2]) -> Result<()> {
    for offset in offsets {
        for bit in 0..32 {
            let pattern = 1u32 << bit;
            for value in [pattern, !pattern] {
                regs.write(offset, value)?;
                let echoed = regs.read(offset)?;
                if echoed != value {
                    return Err(VmeError::hardware_mismatch(format!(
                        "Register {offset:#05x} wrote {value:#010x}, read {echoed:#010x}"
                    )));
                }
            }
        }
        regs.write(offset, 0)?;
    }
    Ok(())
}

/// Reject an out-of-range VME interrupt level.
pub(crate) fn check_irq_level(level: u8) -> Result<()> {
    if !(1..=7).contains(&level) {
        return Err(VmeError::configuration(format!(
            "VME interrupt level {level} out of range 1-7"
        )));
    }
    Ok(())
}

/// Reject a geographical slot a VME64 backplane cannot have.
pub(crate) fn check_slot(slot: u8) -> Result<()> {
    if !(1..=21).contains(&slot) {
        return Err(VmeError::configuration(format!(
            "VME slot {slot} out of range 1-21"
        )));
    }
    Ok(())
}

/// Split a 64-bit address into (upper, lower) register words.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn split64(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Join (upper, lower) register words.
pub(crate) const fn join64(upper: u32, lower: u32) -> u64 {
    ((upper as u64) << 32) | lower as u64
}

/// Plain register file for chip-level unit tests: every offset echoes
/// what was last written, and writes are counted.
#[cfg(test)]
pub(crate) mod testing {
    use crate::bus::{check_bounds, RegisterBus};
    use crate::error::Result;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use vme_chip::pcie::CONTROL_REGION_SIZE;

    #[derive(Debug, Default)]
    pub(crate) struct RegisterFile {
        values: Mutex<HashMap<usize, u32>>,
        writes: Mutex<Vec<(usize, u32)>>,
    }

    impl RegisterFile {
        pub(crate) fn with(preset: &[(usize, u32)]) -> Self {
            let file = Self::default();
            file.values.lock().unwrap().extend(preset.iter().copied());
            file
        }

        pub(crate) fn writes(&self) -> Vec<(usize, u32)> {
            self.writes.lock().unwrap().clone()
        }

        pub(crate) fn clear_log(&self) {
            self.writes.lock().unwrap().clear();
        }
    }

    impl RegisterBus for RegisterFile {
        fn read32(&self, offset: usize) -> Result<u32> {
            check_bounds(offset, 4, CONTROL_REGION_SIZE)?;
            Ok(self.values.lock().unwrap().get(&offset).copied().unwrap_or(0))
        }

        fn write32(&self, offset: usize, value: u32) -> Result<()> {
            check_bounds(offset, 4, CONTROL_REGION_SIZE)?;
            self.values.lock().unwrap().insert(offset, value);
            self.writes.lock().unwrap().push((offset, value));
            Ok(())
        }

        fn size(&self) -> usize {
            CONTROL_REGION_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RegisterFile;
    use super::*;

    #[test]
    fn probe_picks_variant() {
        let universe = Arc::new(RegisterFile::with(&[(0, 0x0000_10E3u32.to_le())]));
        assert_eq!(probe(universe).unwrap().variant(), ChipVariant::Universe);
        let tsi148 = Arc::new(RegisterFile::with(&[(0, 0x0148_10E3u32.to_le())]));
        assert_eq!(probe(tsi148).unwrap().variant(), ChipVariant::Tsi148);
    }

    #[test]
    fn probe_rejects_foreign_devices() {
        let intel = Arc::new(RegisterFile::with(&[(0, 0x1234_8086u32.to_le())]));
        assert!(matches!(probe(intel), Err(VmeError::HardwareMismatch { .. })));
        let other = Arc::new(RegisterFile::with(&[(0, 0x0999_10E3u32.to_le())]));
        assert!(matches!(probe(other), Err(VmeError::HardwareMismatch { .. })));
    }

    #[test]
    fn address_halves() {
        assert_eq!(split64(0x1234_5678_9ABC_DEF0), (0x1234_5678, 0x9ABC_DEF0));
        assert_eq!(join64(0x1234_5678, 0x9ABC_DEF0), 0x1234_5678_9ABC_DEF0);
        assert!(check_irq_level(0).is_err());
        assert!(check_irq_level(8).is_err());
        assert!(check_irq_level(7).is_ok());
        assert!(check_slot(0).is_err());
        assert!(check_slot(22).is_err());
        assert!(check_slot(21).is_ok());
    }
}
