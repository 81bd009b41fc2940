//! PCI identifiers for the Tundra bridge family.
//!
//! Source: ca91c042 and Tsi148 user manuals, PCI configuration space.

/// Tundra Semiconductor vendor ID (PCI-SIG assigned).
pub const TUNDRA_VENDOR_ID: u16 = 0x10E3;

/// Device IDs for the supported bridges.
pub mod device_id {
    /// ca91c042 "Universe II" PCI-VME64 bridge (`lspci: 10e3:0000`).
    pub const CA91C042: u16 = 0x0000;
    /// Tsi148 "Tempe" PCI-X to VME 2eSST bridge (`lspci: 10e3:0148`).
    pub const TSI148: u16 = 0x0148;
}

/// All supported device IDs.
pub const ALL_DEVICE_IDS: &[u16] = &[device_id::CA91C042, device_id::TSI148];

/// Expected PCI_CLASS register of a Universe II (bridge, other; rev 2).
pub const UNIVERSE_PCI_CLASS: u32 = 0x0680_0002;

/// Size of the bridge control/status register image both chips expose in BAR0.
pub const CONTROL_REGION_SIZE: usize = 0x1000;

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter(device: u16) -> String {
    format!("{TUNDRA_VENDOR_ID:04x}:{device:04x}")
}

/// Split a PCI_ID register value into `(vendor, device)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_pci_id(raw: u32) -> (u16, u16) {
    ((raw & 0xFFFF) as u16, (raw >> 16) as u16)
}

/// Bridge variant discovered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipVariant {
    /// ca91c042: one DMA channel, 8 windows each way, no A64.
    Universe,
    /// Tsi148: two DMA channels, A64 and 2eSST, self-swizzling LCSR.
    Tsi148,
    /// Unknown Tundra device.
    Unknown(u16),
}

impl ChipVariant {
    /// Identify variant from PCI device ID.
    #[must_use]
    pub const fn from_device_id(id: u16) -> Self {
        match id {
            device_id::CA91C042 => Self::Universe,
            device_id::TSI148 => Self::Tsi148,
            other => Self::Unknown(other),
        }
    }

    /// Number of independent DMA channels.
    #[must_use]
    pub const fn dma_channels(&self) -> usize {
        match self {
            Self::Universe => 1,
            Self::Tsi148 => 2,
            Self::Unknown(_) => 0,
        }
    }

    /// Marketing name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Universe => "ca91c042 (Universe II)",
            Self::Tsi148 => "Tsi148 (Tempe)",
            Self::Unknown(_) => "unknown Tundra bridge",
        }
    }
}

impl std::fmt::Display for ChipVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "unknown Tundra bridge {id:#06x}"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_from_device_id() {
        assert_eq!(ChipVariant::from_device_id(0x0000), ChipVariant::Universe);
        assert_eq!(ChipVariant::from_device_id(0x0148), ChipVariant::Tsi148);
        assert_eq!(ChipVariant::from_device_id(0x1234), ChipVariant::Unknown(0x1234));
        assert_eq!(ChipVariant::Tsi148.dma_channels(), 2);
        assert_eq!(ChipVariant::Universe.dma_channels(), 1);
    }

    #[test]
    fn pci_id_split() {
        assert_eq!(split_pci_id(0x0148_10E3), (TUNDRA_VENDOR_ID, device_id::TSI148));
        assert_eq!(lspci_filter(device_id::TSI148), "10e3:0148");
    }
}
