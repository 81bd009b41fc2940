//! Register map of the Tundra ca91c042 ("Universe II").
//!
//! Offsets are relative to the start of the bridge's control-and-status
//! region (PCI BAR0, 4 KB). Every register is little-endian on PCI and the
//! chip never byte-swaps, so a plain `u32::from_le` is always correct.
//!
//! Slave images come in two banks of four: images 0-3 and 4-7 are not
//! contiguous, use [`lsi`] / [`vsi`] rather than computing offsets by hand.

use crate::attr::{AddressSpace, CycleKind, DataWidth, Privilege, Protocol};

// ── PCI configuration image ──────────────────────────────────────────────────

/// Vendor (low 16 bits) and device (high 16 bits) identifier.
pub const PCI_ID: usize = 0x000;
/// PCI command/status.
pub const PCI_CSR: usize = 0x004;
/// Class code and revision; reads [`crate::pcie::UNIVERSE_PCI_CLASS`].
pub const PCI_CLASS: usize = 0x008;

/// `PCI_CSR` bits.
pub mod pci_csr {
    /// Signalled target abort: a VME bus error terminated a coupled cycle.
    pub const S_TA: u32 = 1 << 27;
}

// ── PCI slave images (outbound) ──────────────────────────────────────────────

/// Number of PCI slave images.
pub const LSI_COUNT: usize = 8;

/// Base offset of PCI slave image `index` (0-7).
#[must_use]
pub const fn lsi(index: usize) -> usize {
    if index < 4 {
        0x100 + index * 0x14
    } else {
        0x1A0 + (index - 4) * 0x14
    }
}

/// Register offsets inside one slave image (PCI or VME side).
pub mod image {
    /// Control.
    pub const CTL: usize = 0x00;
    /// Base address.
    pub const BS: usize = 0x04;
    /// Bound address (exclusive end).
    pub const BD: usize = 0x08;
    /// Translation offset.
    pub const TO: usize = 0x0C;
}

/// `LSIx_CTL` bits.
pub mod lsi_ctl {
    /// Image enable.
    pub const EN: u32 = 1 << 31;
    /// Posted writes.
    pub const PWEN: u32 = 1 << 30;
    /// VME data width field (bits 22-23).
    pub const VDW_SHIFT: u32 = 22;
    /// VME address space field (bits 16-18).
    pub const VAS_SHIFT: u32 = 16;
    /// Program cycles.
    pub const PGM: u32 = 1 << 14;
    /// Supervisor cycles.
    pub const SUPER: u32 = 1 << 12;
    /// Block (BLT/MBLT) cycles.
    pub const VCT: u32 = 1 << 8;
    /// Value written on shutdown: disabled, D32 default.
    pub const SHUTDOWN: u32 = 0x0080_0000;
}

/// Slave image base/bound/offset granularity.
pub const IMAGE_ALIGN: u64 = 0x1000;

// ── Special cycle generator (RMW) ────────────────────────────────────────────

/// Special cycle control.
pub const SCYC_CTL: usize = 0x170;
/// PCI address of the special cycle.
pub const SCYC_ADDR: usize = 0x174;
/// Bit enable mask.
pub const SCYC_EN: usize = 0x178;
/// Compare data.
pub const SCYC_CMP: usize = 0x17C;
/// Swap data.
pub const SCYC_SWP: usize = 0x180;

/// `SCYC_CTL` values.
pub mod scyc_ctl {
    /// Special cycles disabled.
    pub const DISABLED: u32 = 0;
    /// Read-modify-write.
    pub const RMW: u32 = 1;
}

/// PCI command error log.
pub const L_CMDERR: usize = 0x18C;
/// Value clearing the error log.
pub const L_CMDERR_CLEAR: u32 = 0x0080_0000;

// ── DMA ──────────────────────────────────────────────────────────────────────

/// Transfer control.
pub const DCTL: usize = 0x200;
/// Transfer byte count.
pub const DTBC: usize = 0x204;
/// PCI address.
pub const DLA: usize = 0x208;
/// VME address.
pub const DVA: usize = 0x210;
/// Command packet pointer.
pub const DCPP: usize = 0x218;
/// General control/status.
pub const DGCS: usize = 0x220;

/// `DCTL` bits.
pub mod dctl {
    /// Direction: PCI to VME.
    pub const L2V: u32 = 1 << 31;
    /// VME data width field (bits 22-23).
    pub const VDW_SHIFT: u32 = 22;
    /// VME address space field (bits 16-18).
    pub const VAS_SHIFT: u32 = 16;
    /// Program cycles.
    pub const PGM: u32 = 1 << 14;
    /// Supervisor cycles.
    pub const SUPER: u32 = 1 << 12;
    /// Block cycles.
    pub const VCT: u32 = 1 << 8;
}

/// `DGCS` bits.
pub mod dgcs {
    /// Start.
    pub const GO: u32 = 1 << 31;
    /// Request stop after the current packet.
    pub const STOP_REQ: u32 = 1 << 30;
    /// Halt request.
    pub const HALT_REQ: u32 = 1 << 29;
    /// Linked-list (chained) mode.
    pub const CHAIN: u32 = 1 << 27;
    /// VME on-counter field (bits 20-23).
    pub const VON_SHIFT: u32 = 20;
    /// VME off-timer field (bits 16-19).
    pub const VOFF_SHIFT: u32 = 16;
    /// Transfer active.
    pub const ACT: u32 = 1 << 15;
    /// Stopped.
    pub const STOP: u32 = 1 << 14;
    /// Halted.
    pub const HALT: u32 = 1 << 13;
    /// Done.
    pub const DONE: u32 = 1 << 11;
    /// PCI (local) bus error.
    pub const LERR: u32 = 1 << 10;
    /// VME bus error.
    pub const VERR: u32 = 1 << 9;
    /// Error bits: local error, VME error, protocol error.
    pub const ERRORS: u32 = 0x700;
    /// Write-one-to-clear status bits (stop, halt, done, errors).
    pub const STATUS_CLEAR: u32 = 0xF00;
    /// Interrupt enables for stop, halt, done and errors.
    pub const INT_ENABLES: u32 = 0x0000_000F;
}

/// Command packet layout (32 bytes, little-endian words).
pub mod packet {
    /// Size of one command packet in bytes.
    pub const SIZE: usize = 32;
    /// Word index of DCTL.
    pub const DCTL: usize = 0;
    /// Word index of DTBC.
    pub const DTBC: usize = 1;
    /// Word index of the PCI address.
    pub const DLV: usize = 2;
    /// Word index of the VME address.
    pub const DVA: usize = 4;
    /// Word index of the next-packet pointer.
    pub const DCPP: usize = 6;
    /// DCPP end-of-list marker.
    pub const END: u32 = 1;
}

/// Maximum bytes in one DMA packet (24-bit count).
pub const DMA_MAX_BYTES: u32 = 0x00FF_FFFF;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// PCI interrupt enable.
pub const LINT_EN: usize = 0x300;
/// PCI interrupt status, write one to clear.
pub const LINT_STAT: usize = 0x304;
/// PCI interrupt map 0.
pub const LINT_MAP0: usize = 0x308;
/// PCI interrupt map 1.
pub const LINT_MAP1: usize = 0x30C;
/// VME interrupt enable (interrupter side).
pub const VINT_EN: usize = 0x310;
/// VME interrupt status.
pub const VINT_STAT: usize = 0x314;
/// Status/ID vector driven during our IACK.
pub const STATID: usize = 0x320;

/// Vector latched by the IACK cycle for VME level `level` (1-7).
#[must_use]
pub const fn v_statid(level: u8) -> usize {
    0x324 + (level as usize - 1) * 4
}

/// Mailbox `n` (0-3).
#[must_use]
pub const fn mbox(n: usize) -> usize {
    0x348 + n * 4
}

/// `LINT_EN` / `LINT_STAT` bits.
pub mod lint {
    /// VME IRQ levels 1-7 (bit n = level n).
    pub const VIRQ: u32 = 0x0000_00FE;
    /// DMA.
    pub const DMA: u32 = 1 << 8;
    /// PCI bus error.
    pub const LERR: u32 = 1 << 9;
    /// VME bus error.
    pub const VERR: u32 = 1 << 10;
    /// SYSFAIL.
    pub const SYSFAIL: u32 = 1 << 14;
    /// ACFAIL.
    pub const ACFAIL: u32 = 1 << 15;
    /// Mailboxes 0-3.
    pub const MBOX: u32 = 0x000F_0000;
    /// Location monitors 0-3.
    pub const LM: u32 = 0x00F0_0000;
    /// Every status bit.
    pub const ALL: u32 = 0x00FF_FFFF;
    /// Enables at start of day when system controller.
    pub const INIT_SYSCON: u32 = 0x00FF_07FE;
    /// Enables at start of day otherwise (no VME IRQ handling).
    pub const INIT_PERIPHERAL: u32 = 0x00FF_0700;
}

/// `VINT_EN` / `VINT_STAT` bit asserting VME level `level`.
#[must_use]
pub const fn vint_level(level: u8) -> u32 {
    1 << (level as u32 + 24)
}

// ── Bus control ──────────────────────────────────────────────────────────────

/// Master control (requester).
pub const MAST_CTL: usize = 0x400;
/// Miscellaneous control (arbiter, system controller).
pub const MISC_CTL: usize = 0x404;

/// `MAST_CTL` bits.
pub mod mast_ctl {
    /// Bits preserved when programming the requester.
    pub const KEEP: u32 = 0xFF0F_FFFF;
    /// Release on request.
    pub const VRM: u32 = 1 << 20;
    /// Fair requester.
    pub const VREL_FAIR: u32 = 1 << 21;
    /// Request level field (bits 22-23).
    pub const VRL_SHIFT: u32 = 22;
    /// Request level mask.
    pub const VRL_MASK: u32 = 3 << 22;
}

/// `MISC_CTL` bits.
pub mod misc_ctl {
    /// Bits preserved when programming the arbiter.
    pub const KEEP: u32 = 0x00FF_FFFF;
    /// VME bus timeout field (bits 28-31).
    pub const VBTO_SHIFT: u32 = 28;
    /// Priority arbitration.
    pub const VARB_PRIORITY: u32 = 1 << 26;
    /// Arbitration timeout field (bits 24-25).
    pub const VARBTO_MASK: u32 = 3 << 24;
    /// Arbitration timeout enabled (16 µs).
    pub const VARBTO_ON: u32 = 2 << 24;
    /// Software SYSRESET.
    pub const SW_SYSRST: u32 = 1 << 22;
    /// Bridge is system controller.
    pub const SYSCON: u32 = 1 << 17;
    /// Start-of-day: bits kept from the power-on value.
    pub const INIT_KEEP: u32 = 0x0832_BFFF;
    /// Start-of-day: bits forced on.
    pub const INIT_SET: u32 = 0x7604_0000;
}

// ── VME slave images (inbound) ───────────────────────────────────────────────

/// Number of VME slave images.
pub const VSI_COUNT: usize = 8;

/// Base offset of VME slave image `index` (0-7).
#[must_use]
pub const fn vsi(index: usize) -> usize {
    if index < 4 {
        0xF00 + index * 0x14
    } else {
        0xF90 + (index - 4) * 0x14
    }
}

/// `VSIx_CTL` bits.
pub mod vsi_ctl {
    /// Image enable.
    pub const EN: u32 = 1 << 31;
    /// Posted writes.
    pub const PWEN: u32 = 1 << 30;
    /// Prefetched reads.
    pub const PREN: u32 = 1 << 29;
    /// Respond to program cycles.
    pub const PGM: u32 = 1 << 23;
    /// Respond to data cycles.
    pub const DATA: u32 = 1 << 22;
    /// Respond to supervisor cycles.
    pub const SUPER: u32 = 1 << 21;
    /// Respond to user cycles.
    pub const USER: u32 = 1 << 20;
    /// Address space field (bits 16-18).
    pub const VAS_SHIFT: u32 = 16;
    /// 64-bit PCI transactions (MBLT capable).
    pub const LD64EN: u32 = 1 << 7;
    /// Lock PCI during VME RMW.
    pub const LLRMW: u32 = 1 << 6;
    /// Value written on shutdown.
    pub const SHUTDOWN: u32 = 0x00F0_0000;
}

// ── Location monitor and CR/CSR ──────────────────────────────────────────────

/// Location monitor control.
pub const LM_CTL: usize = 0xF64;
/// Location monitor base.
pub const LM_BS: usize = 0xF68;
/// CR/CSR image control.
pub const VCSR_CTL: usize = 0xF80;
/// `VCSR_CTL` enable.
pub const VCSR_CTL_EN: u32 = 1 << 31;
/// CR/CSR image translation offset.
pub const VCSR_TO: usize = 0xF84;
/// CR/CSR base address register (slot number in bits 27-31).
pub const VCSR_BS: usize = 0xFFC;
/// Shift of the slot number in `VCSR_BS`.
pub const VCSR_BS_SLOT_SHIFT: u32 = 27;

/// `LM_CTL` bits (access bits share positions with `VSIx_CTL`).
pub mod lm_ctl {
    /// Enable.
    pub const EN: u32 = 1 << 31;
}

// ── Encodings ────────────────────────────────────────────────────────────────

/// VAS field value for an outbound image, DMA or the location monitor.
///
/// `None` for spaces this chip cannot initiate: A64, USER3 and USER4.
#[must_use]
pub const fn vas(space: AddressSpace) -> Option<u32> {
    match space {
        AddressSpace::A16 => Some(0),
        AddressSpace::A24 => Some(1),
        AddressSpace::A32 => Some(2),
        AddressSpace::CrCsr => Some(5),
        AddressSpace::User1 => Some(6),
        AddressSpace::User2 => Some(7),
        AddressSpace::A64 | AddressSpace::User3 | AddressSpace::User4 => None,
    }
}

/// Inverse of [`vas`].
#[must_use]
pub const fn space_from_vas(field: u32) -> Option<AddressSpace> {
    match field & 7 {
        0 => Some(AddressSpace::A16),
        1 => Some(AddressSpace::A24),
        2 => Some(AddressSpace::A32),
        5 => Some(AddressSpace::CrCsr),
        6 => Some(AddressSpace::User1),
        7 => Some(AddressSpace::User2),
        _ => None,
    }
}

/// VDW field value.
#[must_use]
pub const fn vdw(width: DataWidth) -> u32 {
    match width {
        DataWidth::D8 => 0,
        DataWidth::D16 => 1,
        DataWidth::D32 => 2,
        DataWidth::D64 => 3,
    }
}

/// Inverse of [`vdw`].
#[must_use]
pub const fn width_from_vdw(field: u32) -> DataWidth {
    match field & 3 {
        0 => DataWidth::D8,
        1 => DataWidth::D16,
        2 => DataWidth::D32,
        _ => DataWidth::D64,
    }
}

/// Whether the chip can drive this protocol (SCT, BLT, MBLT).
#[must_use]
pub const fn supports_protocol(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Sct | Protocol::Blt | Protocol::Mblt)
}

/// Cycle attribute bits common to `LSIx_CTL` and `DCTL`: data width,
/// address space, privilege, program/data, block mode.
///
/// `None` if the space is not available.
#[must_use]
pub const fn cycle_bits(
    space: AddressSpace,
    width: DataWidth,
    protocol: Protocol,
    privilege: Privilege,
    cycle: CycleKind,
) -> Option<u32> {
    let Some(vas) = vas(space) else {
        return None;
    };
    let mut ctl = (vdw(width) << lsi_ctl::VDW_SHIFT) | (vas << lsi_ctl::VAS_SHIFT);
    if matches!(privilege, Privilege::Supervisor) {
        ctl |= lsi_ctl::SUPER;
    }
    if matches!(cycle, CycleKind::Program) {
        ctl |= lsi_ctl::PGM;
    }
    if protocol.is_block() {
        ctl |= lsi_ctl::VCT;
    }
    Some(ctl)
}

/// VON code: smallest `x` with `256 << x >= bytes`, capped at 7.
#[must_use]
pub fn von_code(bytes: u32) -> u32 {
    (0..8).find(|&x| (256u64 << x) >= u64::from(bytes)).unwrap_or(7)
}

/// VOFF code for a back-off of `us` microseconds: 0 when `us == 0`,
/// otherwise the smallest `x >= 1` with `16 << (x - 1) >= us`, capped at 7.
#[must_use]
pub fn voff_code(us: u32) -> u32 {
    if us == 0 {
        return 0;
    }
    (1..8).find(|&x| (16u64 << (x - 1)) >= u64::from(us)).unwrap_or(7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_image_banks() {
        assert_eq!(lsi(0), 0x100);
        assert_eq!(lsi(3), 0x13C);
        assert_eq!(lsi(4), 0x1A0);
        assert_eq!(lsi(7), 0x1DC);
        assert_eq!(vsi(3) + image::TO, 0xF48);
        assert_eq!(vsi(7), 0xFCC);
    }

    #[test]
    fn statid_and_mailboxes() {
        assert_eq!(v_statid(1), 0x324);
        assert_eq!(v_statid(7), 0x33C);
        assert_eq!(mbox(1), 0x34C);
        assert_eq!(vint_level(3), 1 << 27);
    }

    #[test]
    fn unsupported_spaces() {
        assert!(vas(AddressSpace::A64).is_none());
        assert!(vas(AddressSpace::User3).is_none());
        assert_eq!(vas(AddressSpace::CrCsr), Some(5));
        for space in AddressSpace::ALL {
            if let Some(field) = vas(space) {
                assert_eq!(space_from_vas(field), Some(space));
            }
        }
    }

    #[test]
    fn outbound_cycle_bits() {
        let ctl = cycle_bits(
            AddressSpace::A24,
            DataWidth::D16,
            Protocol::Blt,
            Privilege::Supervisor,
            CycleKind::Data,
        )
        .unwrap();
        assert_eq!(ctl, 0x0040_0000 | 0x0001_0000 | 0x1000 | 0x100);
    }

    #[test]
    fn dma_tuning_codes_round_up() {
        assert_eq!(von_code(0), 0);
        assert_eq!(von_code(256), 0);
        assert_eq!(von_code(257), 1);
        assert_eq!(von_code(2048), 3);
        assert_eq!(von_code(u32::MAX), 7);
        assert_eq!(voff_code(0), 0);
        assert_eq!(voff_code(16), 1);
        assert_eq!(voff_code(17), 2);
    }
}
