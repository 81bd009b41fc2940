//! VME bus attributes shared by both bridges.
//!
//! These are the bus-level concepts (address modifier groups, data
//! widths, block protocols). How each chip encodes them lives in
//! [`crate::universe`] and [`crate::tsi148`].

use std::fmt;

/// VME address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Short I/O, 16 address bits.
    A16,
    /// Standard, 24 address bits.
    A24,
    /// Extended, 32 address bits.
    A32,
    /// 64 address bits (VME64).
    A64,
    /// Configuration ROM / control and status registers.
    CrCsr,
    /// User-defined address modifier group 1.
    User1,
    /// User-defined address modifier group 2.
    User2,
    /// User-defined address modifier group 3.
    User3,
    /// User-defined address modifier group 4.
    User4,
}

impl AddressSpace {
    /// Every address space, in datasheet order.
    pub const ALL: [Self; 9] = [
        Self::A16,
        Self::A24,
        Self::A32,
        Self::A64,
        Self::CrCsr,
        Self::User1,
        Self::User2,
        Self::User3,
        Self::User4,
    ];

    /// Mask of the address bits that exist in this space.
    #[must_use]
    pub const fn address_mask(self) -> u64 {
        match self {
            Self::A16 => 0xFFFF,
            Self::A24 | Self::CrCsr => 0x00FF_FFFF,
            Self::A32 | Self::User1 | Self::User2 | Self::User3 | Self::User4 => 0xFFFF_FFFF,
            Self::A64 => u64::MAX,
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A16 => "A16",
            Self::A24 => "A24",
            Self::A32 => "A32",
            Self::A64 => "A64",
            Self::CrCsr => "CR/CSR",
            Self::User1 => "USER1",
            Self::User2 => "USER2",
            Self::User3 => "USER3",
            Self::User4 => "USER4",
        };
        f.write_str(s)
    }
}

/// Maximum VME data width of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataWidth {
    /// 8-bit.
    D8,
    /// 16-bit.
    D16,
    /// 32-bit.
    D32,
    /// 64-bit (MBLT and 2e protocols).
    D64,
}

impl DataWidth {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::D8 => 1,
            Self::D16 => 2,
            Self::D32 => 4,
            Self::D64 => 8,
        }
    }
}

/// VME transfer protocol, in order of increasing throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Single-cycle transfer.
    Sct,
    /// Block transfer.
    Blt,
    /// Multiplexed (64-bit) block transfer.
    Mblt,
    /// Two-edge VME.
    TwoEdgeVme,
    /// Two-edge source-synchronous.
    TwoEdgeSst,
    /// Two-edge source-synchronous broadcast.
    TwoEdgeSstBroadcast,
}

impl Protocol {
    /// Whether this is a block protocol (anything but SCT).
    #[must_use]
    pub const fn is_block(self) -> bool {
        !matches!(self, Self::Sct)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sct => "SCT",
            Self::Blt => "BLT",
            Self::Mblt => "MBLT",
            Self::TwoEdgeVme => "2eVME",
            Self::TwoEdgeSst => "2eSST",
            Self::TwoEdgeSstBroadcast => "2eSSTB",
        };
        f.write_str(s)
    }
}

/// 2eSST transfer rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SstRate {
    /// 160 MB/s.
    Mb160,
    /// 267 MB/s.
    Mb267,
    /// 320 MB/s.
    Mb320,
}

/// Privilege of an initiated cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Privilege {
    /// Non-privileged.
    #[default]
    User,
    /// Supervisory.
    Supervisor,
}

/// Program or data cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CycleKind {
    /// Data access.
    #[default]
    Data,
    /// Program (instruction fetch) access.
    Program,
}

/// Which incoming cycles a slave decoder responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessFilter {
    /// Respond to non-privileged cycles.
    pub user: bool,
    /// Respond to supervisory cycles.
    pub supervisor: bool,
    /// Respond to data cycles.
    pub data: bool,
    /// Respond to program cycles.
    pub program: bool,
}

impl Default for AccessFilter {
    fn default() -> Self {
        Self {
            user: true,
            supervisor: true,
            data: true,
            program: false,
        }
    }
}

/// Attributes of cycles this bridge initiates on the VME bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmeAttributes {
    /// Address space.
    pub space: AddressSpace,
    /// Maximum data width.
    pub width: DataWidth,
    /// Transfer protocol.
    pub protocol: Protocol,
    /// 2eSST rate, only meaningful with a 2eSST protocol.
    pub sst_rate: Option<SstRate>,
    /// Privilege.
    pub privilege: Privilege,
    /// Program/data.
    pub cycle: CycleKind,
}

impl VmeAttributes {
    /// Plain single-cycle data access.
    #[must_use]
    pub const fn sct(space: AddressSpace, width: DataWidth) -> Self {
        Self {
            space,
            width,
            protocol: Protocol::Sct,
            sst_rate: None,
            privilege: Privilege::User,
            cycle: CycleKind::Data,
        }
    }

    /// Same attributes with a different protocol.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Same attributes with a 2eSST rate.
    #[must_use]
    pub const fn with_sst_rate(mut self, rate: SstRate) -> Self {
        self.sst_rate = Some(rate);
        self
    }
}

impl Default for VmeAttributes {
    fn default() -> Self {
        Self::sct(AddressSpace::A32, DataWidth::D32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_masks() {
        assert_eq!(AddressSpace::A16.address_mask(), 0xFFFF);
        assert_eq!(AddressSpace::A24.address_mask(), 0xFF_FFFF);
        assert_eq!(AddressSpace::A64.address_mask(), u64::MAX);
    }

    #[test]
    fn block_protocols() {
        assert!(!Protocol::Sct.is_block());
        assert!(Protocol::Mblt.is_block());
        assert_eq!(Protocol::TwoEdgeSstBroadcast.to_string(), "2eSSTB");
    }
}
