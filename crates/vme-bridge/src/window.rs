//! Address translation windows
//!
//! An outbound window forwards a PCI range onto the VME bus; an inbound
//! window exposes a VME range into PCI memory. Both chips have eight of
//! each. [`WindowTranslator`] validates a window completely (index, address
//! space, alignment, range) before the chip touches a single register, so
//! a rejected request leaves the previously configured window intact.

use crate::chip::BridgeChip;
use crate::error::{Result, VmeError};
use vme_chip::attr::{AccessFilter, AddressSpace, Protocol, SstRate, VmeAttributes};

/// Windows per direction on both supported chips
pub const WINDOW_COUNT: usize = 8;

/// Which way a window translates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDirection {
    /// PCI to VME
    Outbound,
    /// VME to PCI
    Inbound,
}

/// PCI range forwarded onto the VME bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundWindow {
    /// Window index 0-7
    pub index: usize,
    /// Window decodes PCI cycles
    pub enabled: bool,
    /// First PCI address
    pub pci_base: u64,
    /// Length in bytes
    pub size: u64,
    /// VME address `pci_base` maps to
    pub vme_base: u64,
    /// Cycle attributes
    pub attrs: VmeAttributes,
    /// Post writes (ca91c042)
    pub write_post: bool,
    /// Read prefetch in cache lines (Tsi148)
    pub prefetch: Option<u32>,
    /// 2eSST broadcast select (Tsi148)
    pub broadcast_select: u32,
}

impl OutboundWindow {
    /// Enabled window with default options
    #[must_use]
    pub const fn new(
        index: usize,
        pci_base: u64,
        size: u64,
        vme_base: u64,
        attrs: VmeAttributes,
    ) -> Self {
        Self {
            index,
            enabled: true,
            pci_base,
            size,
            vme_base,
            attrs,
            write_post: false,
            prefetch: None,
            broadcast_select: 0,
        }
    }

    /// Disabled window at `index`
    #[must_use]
    pub const fn disabled(index: usize) -> Self {
        Self {
            index,
            enabled: false,
            pci_base: 0,
            size: 0,
            vme_base: 0,
            attrs: VmeAttributes::sct(AddressSpace::A32, vme_chip::attr::DataWidth::D32),
            write_post: false,
            prefetch: None,
            broadcast_select: 0,
        }
    }

    /// PCI address of VME address `vme` in `space`, if the window maps it
    #[must_use]
    pub fn pci_address_of(&self, vme: u64, space: AddressSpace, len: u64) -> Option<u64> {
        if !self.enabled || self.attrs.space != space || vme < self.vme_base {
            return None;
        }
        let offset = vme - self.vme_base;
        (offset.checked_add(len)? <= self.size).then_some(self.pci_base + offset)
    }
}

/// VME range exposed into PCI memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundWindow {
    /// Window index 0-7
    pub index: usize,
    /// Window decodes VME cycles
    pub enabled: bool,
    /// First VME address
    pub vme_base: u64,
    /// Length in bytes
    pub size: u64,
    /// PCI address `vme_base` maps to
    pub pci_base: u64,
    /// Address space decoded
    pub space: AddressSpace,
    /// Fastest block protocol accepted
    pub protocol: Protocol,
    /// 2eSST rate (Tsi148)
    pub sst_rate: Option<SstRate>,
    /// Cycle types answered
    pub access: AccessFilter,
    /// Post writes (ca91c042)
    pub write_post: bool,
    /// Prefetch reads (ca91c042)
    pub prefetch: bool,
    /// Virtual FIFO size in bytes (Tsi148)
    pub prefetch_size: u32,
    /// Start prefetching once the FIFO is half empty (Tsi148)
    pub prefetch_threshold: bool,
    /// Lock PCI during VME RMW cycles (ca91c042)
    pub rmw_lock: bool,
}

impl InboundWindow {
    /// Enabled window with default options
    #[must_use]
    pub fn new(index: usize, vme_base: u64, size: u64, pci_base: u64, space: AddressSpace) -> Self {
        Self {
            index,
            enabled: true,
            vme_base,
            size,
            pci_base,
            space,
            protocol: Protocol::Sct,
            sst_rate: None,
            access: AccessFilter::default(),
            write_post: false,
            prefetch: false,
            prefetch_size: 64,
            prefetch_threshold: false,
            rmw_lock: false,
        }
    }
}

/// Validates and applies window configuration through a [`BridgeChip`]
#[derive(Debug, Clone, Copy)]
pub struct WindowTranslator<'a> {
    chip: &'a dyn BridgeChip,
}

impl<'a> WindowTranslator<'a> {
    /// Translator for `chip`
    pub fn new(chip: &'a dyn BridgeChip) -> Self {
        Self { chip }
    }

    fn check_index(index: usize) -> Result<()> {
        if index >= WINDOW_COUNT {
            return Err(VmeError::configuration(format!(
                "Window index {index} out of range 0-{}",
                WINDOW_COUNT - 1
            )));
        }
        Ok(())
    }

    fn check_range(
        &self,
        direction: WindowDirection,
        space: AddressSpace,
        local: u64,
        vme: u64,
        size: u64,
    ) -> Result<()> {
        let granularity =
            self.chip
                .window_granularity(direction, space)
                .ok_or(VmeError::UnsupportedAddressSpace {
                    space,
                    variant: self.chip.variant(),
                })?;

        if size == 0 {
            return Err(VmeError::configuration("Window size must be nonzero"));
        }
        for (what, value) in [("PCI base", local), ("VME base", vme), ("size", size)] {
            if value % granularity != 0 {
                return Err(VmeError::configuration(format!(
                    "{direction:?} {space} window {what} {value:#x} not aligned to {granularity:#x}"
                )));
            }
        }

        let vme_end = vme
            .checked_add(size - 1)
            .filter(|&end| end <= space.address_mask())
            .ok_or_else(|| {
                VmeError::configuration(format!(
                    "VME range {vme:#x}+{size:#x} exceeds {space} address space"
                ))
            })?;
        local.checked_add(size - 1).ok_or_else(|| {
            VmeError::configuration(format!("PCI range {local:#x}+{size:#x} overflows"))
        })?;

        tracing::trace!("{direction:?} {space} range ok, VME end {vme_end:#x}");
        Ok(())
    }

    /// Program an outbound window
    ///
    /// # Errors
    ///
    /// Returns `Configuration` or `UnsupportedAddressSpace` without touching
    /// the window if the request is invalid; `HardwareMismatch` if the chip
    /// did not latch the values.
    pub fn configure_outbound(&self, window: &OutboundWindow) -> Result<()> {
        Self::check_index(window.index)?;
        if window.enabled {
            self.check_range(
                WindowDirection::Outbound,
                window.attrs.space,
                window.pci_base,
                window.vme_base,
                window.size,
            )?;
        }
        tracing::debug!(
            "Outbound {}: PCI {:#x}+{:#x} -> {} {:#x} ({:?})",
            window.index,
            window.pci_base,
            window.size,
            window.attrs.space,
            window.vme_base,
            window.attrs.protocol
        );
        self.chip.write_outbound(window)
    }

    /// Read back an outbound window
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a bad index, or register access errors.
    pub fn query_outbound(&self, index: usize) -> Result<OutboundWindow> {
        Self::check_index(index)?;
        self.chip.read_outbound(index)
    }

    /// Program an inbound window
    ///
    /// # Errors
    ///
    /// As [`WindowTranslator::configure_outbound`].
    pub fn configure_inbound(&self, window: &InboundWindow) -> Result<()> {
        Self::check_index(window.index)?;
        if window.enabled {
            self.check_range(
                WindowDirection::Inbound,
                window.space,
                window.pci_base,
                window.vme_base,
                window.size,
            )?;
        }
        tracing::debug!(
            "Inbound {}: {} {:#x}+{:#x} -> PCI {:#x}",
            window.index,
            window.space,
            window.vme_base,
            window.size,
            window.pci_base
        );
        self.chip.write_inbound(window)
    }

    /// Read back an inbound window
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a bad index, or register access errors.
    pub fn query_inbound(&self, index: usize) -> Result<InboundWindow> {
        Self::check_index(index)?;
        self.chip.read_inbound(index)
    }

    /// Every enabled outbound window
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn enabled_outbound(&self) -> Result<Vec<OutboundWindow>> {
        let mut windows = Vec::new();
        for index in 0..WINDOW_COUNT {
            let window = self.chip.read_outbound(index)?;
            if window.enabled {
                windows.push(window);
            }
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vme_chip::attr::DataWidth;

    #[test]
    fn address_lookup_respects_space_and_bounds() {
        let window = OutboundWindow::new(
            0,
            0x8000_0000,
            0x1_0000,
            0x2000_0000,
            VmeAttributes::sct(AddressSpace::A32, DataWidth::D32),
        );
        assert_eq!(
            window.pci_address_of(0x2000_0010, AddressSpace::A32, 4),
            Some(0x8000_0010)
        );
        assert_eq!(window.pci_address_of(0x2000_FFFC, AddressSpace::A32, 4), Some(0x8000_FFFC));
        assert_eq!(window.pci_address_of(0x2000_FFFE, AddressSpace::A32, 4), None);
        assert_eq!(window.pci_address_of(0x2000_0010, AddressSpace::A24, 4), None);
        assert_eq!(window.pci_address_of(0x1FFF_FFFC, AddressSpace::A32, 4), None);
        assert_eq!(
            OutboundWindow::disabled(0).pci_address_of(0, AddressSpace::A32, 4),
            None
        );
    }
}
