//! Register map of the Tundra Tsi148 PCI-X to VME64 bridge.
//!
//! Offsets are relative to the combined register group (CRG): the local
//! control and status registers (LCSR) at 0x000, the global CSRs at 0x600
//! and the CR/CSR block at 0xFF4.
//!
//! The PCI configuration header below 0x100 is little-endian. Everything
//! above 0x100 is presented by the chip already swapped into host order,
//! so those registers must not be converted again.

use crate::attr::{
    AccessFilter, AddressSpace, CycleKind, DataWidth, Privilege, Protocol, SstRate, VmeAttributes,
};

/// Offsets above this are swizzled by the chip itself.
pub const SWIZZLE_BOUNDARY: usize = 0x100;

// ── PCI configuration header ─────────────────────────────────────────────────

/// Vendor (low 16 bits) and device (high 16 bits) identifier.
pub const PCI_ID: usize = 0x000;

// ── Outbound translation ─────────────────────────────────────────────────────

/// Number of outbound translation windows.
pub const OUTBOUND_COUNT: usize = 8;
/// Outbound window granularity (64 KB).
pub const OUTBOUND_ALIGN: u64 = 0x1_0000;

/// Base offset of outbound window `index` (0-7).
#[must_use]
pub const fn outbound(index: usize) -> usize {
    0x100 + index * 0x20
}

/// Register offsets inside one outbound window.
pub mod ot {
    /// Start address, upper 32 bits.
    pub const SAU: usize = 0x00;
    /// Start address, lower 32 bits.
    pub const SAL: usize = 0x04;
    /// Inclusive end address, upper.
    pub const EAU: usize = 0x08;
    /// Inclusive end address, lower.
    pub const EAL: usize = 0x0C;
    /// Translation offset, upper.
    pub const OFU: usize = 0x10;
    /// Translation offset, lower.
    pub const OFL: usize = 0x14;
    /// 2eSST broadcast select.
    pub const BS: usize = 0x18;
    /// Attributes.
    pub const AT: usize = 0x1C;
}

/// `OTATx` bits.
pub mod otat {
    /// Window enable.
    pub const EN: u32 = 1 << 31;
    /// Read prefetch disable.
    pub const MRPFD: u32 = 1 << 18;
    /// Prefetch size field (bits 16-17).
    pub const PFS_SHIFT: u32 = 16;
    /// 2eSST rate field (bits 11-12).
    pub const SST_MASK: u32 = 0x1800;
    /// Transfer mode field (bits 8-10).
    pub const TM_SHIFT: u32 = 8;
    /// 32-bit data width (16-bit when clear).
    pub const DBW32: u32 = 1 << 6;
    /// Supervisor.
    pub const SUP: u32 = 1 << 5;
    /// Program.
    pub const PGM: u32 = 1 << 4;
    /// Address mode field (bits 0-3).
    pub const AMODE_MASK: u32 = 0xF;
}

// ── Read-modify-write ────────────────────────────────────────────────────────

/// RMW PCI address, upper.
pub const RMWAU: usize = 0x220;
/// RMW PCI address, lower.
pub const RMWAL: usize = 0x224;
/// RMW enable mask.
pub const RMWEN: usize = 0x228;
/// RMW compare data.
pub const RMWC: usize = 0x22C;
/// RMW swap data.
pub const RMWS: usize = 0x230;

// ── VME bus control ──────────────────────────────────────────────────────────

/// VME master control (requester).
pub const VMCTRL: usize = 0x234;
/// VME control (arbiter, SYSRESET).
pub const VCTRL: usize = 0x238;
/// VME status.
pub const VSTAT: usize = 0x23C;
/// PCI/X status.
pub const PSTAT: usize = 0x240;
/// Value clearing every PSTAT error flag.
pub const PSTAT_CLEAR: u32 = 0x0700_0700;

/// `VMCTRL` bits.
pub mod vmctrl {
    /// Bits preserved when programming the requester.
    pub const KEEP: u32 = 0xFFFF_0000;
    /// RMW enable.
    pub const RMWEN: u32 = 1 << 20;
    /// Time-off field (bits 12-14).
    pub const VTOFF_SHIFT: u32 = 12;
    /// Time-on field (bits 8-10).
    pub const VTON_SHIFT: u32 = 8;
    /// Release on request.
    pub const VREL: u32 = 1 << 3;
    /// Release mode bits read back (ROR and ROC variants).
    pub const VREL_ANY: u32 = 0x18;
    /// Fair requester.
    pub const VFAIR: u32 = 1 << 2;
    /// Request level mask.
    pub const VREQL_MASK: u32 = 3;
}

/// `VCTRL` bits.
pub mod vctrl {
    /// Bits preserved when programming the arbiter.
    pub const KEEP: u32 = 0xFFEF_FF00;
    /// No early release of the bus busy.
    pub const NERBB: u32 = 1 << 20;
    /// Software SYSRESET.
    pub const SRESET: u32 = 1 << 17;
    /// Arbiter timeout enable.
    pub const ATOEN: u32 = 1 << 7;
    /// Round-robin arbitration (priority when clear).
    pub const ROBIN: u32 = 1 << 6;
    /// Global timeout field (bits 0-3).
    pub const GTO_MASK: u32 = 0xF;
}

/// `VSTAT` bits.
pub mod vstat {
    /// Bridge is system controller.
    pub const SCONS: u32 = 1 << 8;
}

// ── Error logs ───────────────────────────────────────────────────────────────

/// VME exception address, upper.
pub const VEAU: usize = 0x260;
/// VME exception address, lower.
pub const VEAL: usize = 0x264;
/// VME exception attributes.
pub const VEAT: usize = 0x268;
/// PCI error address, upper.
pub const EDPAU: usize = 0x270;
/// PCI error address, lower.
pub const EDPAL: usize = 0x274;
/// PCI error attributes.
pub const EDPAT: usize = 0x280;

/// `VEAT` / `EDPAT` bits.
pub mod exception {
    /// Exception status.
    pub const VALID: u32 = 1 << 31;
    /// Write to clear the log.
    pub const CLEAR: u32 = 1 << 29;
}

// ── Inbound translation ──────────────────────────────────────────────────────

/// Number of inbound translation windows.
pub const INBOUND_COUNT: usize = 8;

/// Base offset of inbound window `index` (0-7).
#[must_use]
pub const fn inbound(index: usize) -> usize {
    0x300 + index * 0x20
}

/// Register offsets inside one inbound window.
pub mod it {
    /// Start address, upper.
    pub const SAU: usize = 0x00;
    /// Start address, lower.
    pub const SAL: usize = 0x04;
    /// Inclusive end address, upper.
    pub const EAU: usize = 0x08;
    /// Inclusive end address, lower.
    pub const EAL: usize = 0x0C;
    /// Translation offset, upper.
    pub const OFU: usize = 0x10;
    /// Translation offset, lower.
    pub const OFL: usize = 0x14;
    /// Attributes.
    pub const AT: usize = 0x1C;
}

/// `ITATx` bits.
pub mod itat {
    /// Window enable.
    pub const EN: u32 = 1 << 31;
    /// Virtual FIFO threshold.
    pub const TH: u32 = 1 << 18;
    /// Virtual FIFO size field (bits 16-17).
    pub const VFS_SHIFT: u32 = 16;
    /// 2eSST rate field (bits 12-14).
    pub const SST_SHIFT: u32 = 12;
    /// 2eSST broadcast.
    pub const SSTB: u32 = 1 << 11;
    /// 2eSST.
    pub const SST: u32 = 1 << 10;
    /// 2eVME.
    pub const TWO_EVME: u32 = 1 << 9;
    /// MBLT.
    pub const MBLT: u32 = 1 << 8;
    /// BLT.
    pub const BLT: u32 = 1 << 7;
    /// Address space field (bits 4-6).
    pub const AS_SHIFT: u32 = 4;
    /// Respond to supervisor cycles.
    pub const SUPR: u32 = 1 << 3;
    /// Respond to user cycles.
    pub const NPRIV: u32 = 1 << 2;
    /// Respond to program cycles.
    pub const PGM: u32 = 1 << 1;
    /// Respond to data cycles.
    pub const DATA: u32 = 1 << 0;
}

// ── GCSR / CRG / CR-CSR / location monitor ───────────────────────────────────

/// CRG image attributes.
pub const CSRAT: usize = 0x414;
/// CR/CSR translation offset, upper.
pub const CROU: usize = 0x418;
/// CR/CSR translation offset, lower.
pub const CROL: usize = 0x41C;
/// CR/CSR attributes.
pub const CRAT: usize = 0x420;
/// Location monitor base, upper.
pub const LMBAU: usize = 0x424;
/// Location monitor base, lower.
pub const LMBAL: usize = 0x428;
/// Location monitor attributes.
pub const LMAT: usize = 0x42C;

/// `LMAT` bits (access bits match `ITATx`).
pub mod lmat {
    /// Enable.
    pub const EN: u32 = 1 << 7;
}

/// `CRAT` enable.
pub const CRAT_EN: u32 = 1 << 7;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// 8-bit IACK cycle for level `level` (1-7); the vector is the low byte.
#[must_use]
pub const fn viack(level: u8) -> usize {
    0x200 + level as usize * 4
}

/// VME interrupt control (interrupter side).
pub const VICR: usize = 0x440;
/// Local interrupt enable (status).
pub const INTEN: usize = 0x448;
/// Local interrupt enable (output).
pub const INTEO: usize = 0x44C;
/// Local interrupt status.
pub const INTS: usize = 0x450;
/// Local interrupt clear.
pub const INTC: usize = 0x454;
/// Interrupt map 1.
pub const INTM1: usize = 0x458;
/// Interrupt map 2.
pub const INTM2: usize = 0x45C;

/// `VICR` bits.
pub mod vicr {
    /// Clear a pending IRQ.
    pub const IRQC: u32 = 1 << 15;
    /// IRQ still pending (not yet acknowledged).
    pub const IRQS: u32 = 1 << 11;
    /// Level field (bits 8-10).
    pub const IRQL_SHIFT: u32 = 8;
    /// Status/ID field.
    pub const STID_MASK: u32 = 0xFF;
}

/// `INTEN` / `INTEO` / `INTS` / `INTC` bits.
pub mod int {
    /// DMA channels (bit 24 = channel 0, bit 25 = channel 1).
    pub const DMA: u32 = 0x0300_0000;
    /// Shift of the DMA channel bits.
    pub const DMA_SHIFT: u32 = 24;
    /// Location monitors 0-3.
    pub const LM: u32 = 0x00F0_0000;
    /// Shift of the location monitor bits.
    pub const LM_SHIFT: u32 = 20;
    /// Mailboxes 0-3.
    pub const MBOX: u32 = 0x000F_0000;
    /// PCI bus error.
    pub const PERR: u32 = 1 << 13;
    /// VME bus error.
    pub const VERR: u32 = 1 << 12;
    /// ACFAIL.
    pub const ACFL: u32 = 1 << 9;
    /// SYSFAIL.
    pub const SYSFL: u32 = 1 << 8;
    /// VME IRQ levels 1-7 (bit n = level n).
    pub const VIRQ: u32 = 0x0000_00FE;
    /// Enables at start of day when system controller.
    pub const INIT_SYSCON: u32 = 0x03FF_20FE;
    /// Enables at start of day otherwise.
    pub const INIT_PERIPHERAL: u32 = 0x03FF_2000;
}

// ── DMA ──────────────────────────────────────────────────────────────────────

/// Number of DMA channels.
pub const DMA_CHANNELS: usize = 2;

/// Base offset of DMA channel `channel` (0-1).
#[must_use]
pub const fn dma(channel: usize) -> usize {
    0x500 + channel * 0x80
}

/// Register offsets inside one DMA channel.
pub mod dma_reg {
    /// Control.
    pub const DCTL: usize = 0x00;
    /// Status.
    pub const DSTA: usize = 0x04;
    /// Current source address, upper.
    pub const DCSAU: usize = 0x08;
    /// Current source address, lower.
    pub const DCSAL: usize = 0x0C;
    /// Current destination address, upper.
    pub const DCDAU: usize = 0x10;
    /// Current destination address, lower.
    pub const DCDAL: usize = 0x14;
    /// Current link address, upper.
    pub const DCLAU: usize = 0x18;
    /// Current link address, lower.
    pub const DCLAL: usize = 0x1C;
    /// Source address, upper.
    pub const DSAU: usize = 0x20;
    /// Source address, lower.
    pub const DSAL: usize = 0x24;
    /// Destination address, upper.
    pub const DDAU: usize = 0x28;
    /// Destination address, lower.
    pub const DDAL: usize = 0x2C;
    /// Source attributes.
    pub const DSAT: usize = 0x30;
    /// Destination attributes.
    pub const DDAT: usize = 0x34;
    /// Next link address, upper.
    pub const DNLAU: usize = 0x38;
    /// Next link address, lower.
    pub const DNLAL: usize = 0x3C;
    /// Byte count.
    pub const DCNT: usize = 0x40;
    /// 2eSST broadcast select.
    pub const DDBS: usize = 0x44;
}

/// `DCTLx` bits.
pub mod dctl {
    /// Abort.
    pub const ABT: u32 = 1 << 27;
    /// Pause.
    pub const PAU: u32 = 1 << 26;
    /// Go.
    pub const DGO: u32 = 1 << 25;
    /// Direct mode (chained when clear).
    pub const MOD: u32 = 1 << 23;
    /// VME block size field (bits 12-14).
    pub const VBKS_SHIFT: u32 = 12;
    /// VME back-off field (bits 8-10).
    pub const VBOT_SHIFT: u32 = 8;
    /// PCI block size field (bits 4-6).
    pub const PBKS_SHIFT: u32 = 4;
    /// PCI back-off field (bits 0-2).
    pub const PBOT_SHIFT: u32 = 0;
}

/// `DSTAx` bits.
pub mod dsta {
    /// VME bus error.
    pub const VBE: u32 = 1 << 28;
    /// Aborted.
    pub const ABT: u32 = 1 << 27;
    /// Paused.
    pub const PAU: u32 = 1 << 26;
    /// Done.
    pub const DON: u32 = 1 << 25;
    /// Busy.
    pub const BSY: u32 = 1 << 24;
    /// Error bits.
    pub const ERRORS: u32 = 0xF000_0000;
}

/// `DSATx` / `DDATx` source/destination type values.
pub mod dsat {
    /// PCI bus.
    pub const PCI: u32 = 0x0000_0000;
    /// VME bus (OR in the attribute word).
    pub const VME: u32 = 0x1000_0000;
    /// Incrementing 32-bit pattern.
    pub const PATTERN_WORD_INC: u32 = 0x2000_0000;
    /// Constant 32-bit pattern.
    pub const PATTERN_WORD: u32 = 0x2100_0000;
    /// Incrementing byte pattern.
    pub const PATTERN_BYTE_INC: u32 = 0x2200_0000;
    /// Constant byte pattern.
    pub const PATTERN_BYTE: u32 = 0x2300_0000;
    /// Type field mask.
    pub const TYPE_MASK: u32 = 0x3000_0000;
}

/// Linked-list descriptor layout (40 bytes, big-endian words).
pub mod descriptor {
    /// Size of one descriptor in bytes.
    pub const SIZE: usize = 40;
    /// Word index of DSAU.
    pub const DSAU: usize = 0;
    /// Word index of DSAL.
    pub const DSAL: usize = 1;
    /// Word index of DDAU.
    pub const DDAU: usize = 2;
    /// Word index of DDAL.
    pub const DDAL: usize = 3;
    /// Word index of DSAT.
    pub const DSAT: usize = 4;
    /// Word index of DDAT.
    pub const DDAT: usize = 5;
    /// Word index of DNLAU.
    pub const DNLAU: usize = 6;
    /// Word index of DNLAL.
    pub const DNLAL: usize = 7;
    /// Word index of DCNT.
    pub const DCNT: usize = 8;
    /// Word index of DDBS.
    pub const DDBS: usize = 9;
    /// DNLAL last-link flag.
    pub const LLA: u32 = 1;
}

// ── Global CSR / CR/CSR ──────────────────────────────────────────────────────

/// GCSR mailbox `n` (0-3).
#[must_use]
pub const fn gcsr_mbox(n: usize) -> usize {
    0x610 + n * 4
}

/// CR/CSR base address register (slot number in bits 3-7).
pub const CBAR: usize = 0xFFC;
/// Shift of the slot number in `CBAR`.
pub const CBAR_SLOT_SHIFT: u32 = 3;

// ── Encodings ────────────────────────────────────────────────────────────────

/// AMODE value of an address space.
#[must_use]
pub const fn amode(space: AddressSpace) -> u32 {
    match space {
        AddressSpace::A16 => 0x0,
        AddressSpace::A24 => 0x1,
        AddressSpace::A32 => 0x2,
        AddressSpace::A64 => 0x4,
        AddressSpace::CrCsr => 0x5,
        AddressSpace::User1 => 0x8,
        AddressSpace::User2 => 0x9,
        AddressSpace::User3 => 0xA,
        AddressSpace::User4 => 0xB,
    }
}

/// Inverse of [`amode`].
#[must_use]
pub const fn space_from_amode(field: u32) -> Option<AddressSpace> {
    match field & otat::AMODE_MASK {
        0x0 => Some(AddressSpace::A16),
        0x1 => Some(AddressSpace::A24),
        0x2 => Some(AddressSpace::A32),
        0x4 => Some(AddressSpace::A64),
        0x5 => Some(AddressSpace::CrCsr),
        0x8 => Some(AddressSpace::User1),
        0x9 => Some(AddressSpace::User2),
        0xA => Some(AddressSpace::User3),
        0xB => Some(AddressSpace::User4),
        _ => None,
    }
}

const fn transfer_mode(protocol: Protocol) -> u32 {
    match protocol {
        Protocol::Sct => 0,
        Protocol::Blt => 1,
        Protocol::Mblt => 2,
        Protocol::TwoEdgeVme => 3,
        Protocol::TwoEdgeSst => 4,
        Protocol::TwoEdgeSstBroadcast => 5,
    }
}

const fn protocol_from_transfer_mode(field: u32) -> Option<Protocol> {
    match field & 7 {
        0 => Some(Protocol::Sct),
        1 => Some(Protocol::Blt),
        2 => Some(Protocol::Mblt),
        3 => Some(Protocol::TwoEdgeVme),
        4 => Some(Protocol::TwoEdgeSst),
        5 => Some(Protocol::TwoEdgeSstBroadcast),
        _ => None,
    }
}

/// VME attribute word shared by `OTATx`, `DSATx` and `DDATx`.
///
/// The chip has only a 16/32-bit width select: D8 encodes as D16 and D64
/// as D32 (64-bit cycles come from the MBLT and 2e protocols).
#[must_use]
pub const fn attribute_word(attrs: &VmeAttributes) -> u32 {
    let mut word = amode(attrs.space) | (transfer_mode(attrs.protocol) << otat::TM_SHIFT);
    if matches!(attrs.privilege, Privilege::Supervisor) {
        word |= otat::SUP;
    }
    if matches!(attrs.cycle, CycleKind::Program) {
        word |= otat::PGM;
    }
    if matches!(attrs.width, DataWidth::D32 | DataWidth::D64) {
        word |= otat::DBW32;
    }
    word |= match attrs.sst_rate {
        None | Some(SstRate::Mb160) => 0,
        Some(SstRate::Mb267) => 0x800,
        Some(SstRate::Mb320) => 0x1000,
    };
    word
}

/// Inverse of [`attribute_word`]; `None` for reserved field values.
#[must_use]
pub const fn decode_attribute_word(word: u32) -> Option<VmeAttributes> {
    let Some(space) = space_from_amode(word) else {
        return None;
    };
    let Some(protocol) = protocol_from_transfer_mode(word >> otat::TM_SHIFT) else {
        return None;
    };
    let sst_rate = if matches!(
        protocol,
        Protocol::TwoEdgeSst | Protocol::TwoEdgeSstBroadcast
    ) {
        match word & otat::SST_MASK {
            0x800 => Some(SstRate::Mb267),
            0x1000 => Some(SstRate::Mb320),
            _ => Some(SstRate::Mb160),
        }
    } else {
        None
    };
    Some(VmeAttributes {
        space,
        width: if word & otat::DBW32 != 0 {
            DataWidth::D32
        } else {
            DataWidth::D16
        },
        protocol,
        sst_rate,
        privilege: if word & otat::SUP != 0 {
            Privilege::Supervisor
        } else {
            Privilege::User
        },
        cycle: if word & otat::PGM != 0 {
            CycleKind::Program
        } else {
            CycleKind::Data
        },
    })
}

/// Outbound prefetch bits for a prefetch of `lines` cache lines:
/// smallest `x` with `2 << x >= lines`, capped at 3.
#[must_use]
pub fn prefetch_bits(lines: u32) -> u32 {
    let x = (0..4).find(|&x| (2u32 << x) >= lines).unwrap_or(3);
    0x4_0000 | (x << otat::PFS_SHIFT)
}

/// Inbound window granularity; `None` for spaces a slave cannot decode.
#[must_use]
pub const fn inbound_granularity(space: AddressSpace) -> Option<u64> {
    match space {
        AddressSpace::A16 => Some(0x10),
        AddressSpace::A24 => Some(0x1000),
        AddressSpace::A32 | AddressSpace::A64 => Some(0x1_0000),
        _ => None,
    }
}

/// Inbound / location-monitor address space field value.
#[must_use]
pub const fn inbound_space(space: AddressSpace) -> Option<u32> {
    match space {
        AddressSpace::A16 => Some(0),
        AddressSpace::A24 => Some(1),
        AddressSpace::A32 => Some(2),
        AddressSpace::A64 => Some(4),
        _ => None,
    }
}

/// Inverse of [`inbound_space`].
#[must_use]
pub const fn space_from_inbound(field: u32) -> Option<AddressSpace> {
    match field & 7 {
        0 => Some(AddressSpace::A16),
        1 => Some(AddressSpace::A24),
        2 => Some(AddressSpace::A32),
        4 => Some(AddressSpace::A64),
        _ => None,
    }
}

/// Access bits shared by `ITATx` and `LMAT`.
#[must_use]
pub const fn access_bits(access: AccessFilter) -> u32 {
    let mut bits = 0;
    if access.user {
        bits |= itat::NPRIV;
    }
    if access.supervisor {
        bits |= itat::SUPR;
    }
    if access.data {
        bits |= itat::DATA;
    }
    if access.program {
        bits |= itat::PGM;
    }
    bits
}

/// Inverse of [`access_bits`].
#[must_use]
pub const fn access_from_bits(bits: u32) -> AccessFilter {
    AccessFilter {
        user: bits & itat::NPRIV != 0,
        supervisor: bits & itat::SUPR != 0,
        data: bits & itat::DATA != 0,
        program: bits & itat::PGM != 0,
    }
}

/// Inbound protocol bits accepting every block protocol up to `fastest`.
/// 2eSST broadcast is only accepted when asked for explicitly.
#[must_use]
pub const fn inbound_protocol_bits(fastest: Protocol) -> u32 {
    match fastest {
        Protocol::Sct => 0,
        Protocol::Blt => itat::BLT,
        Protocol::Mblt => itat::BLT | itat::MBLT,
        Protocol::TwoEdgeVme => itat::BLT | itat::MBLT | itat::TWO_EVME,
        Protocol::TwoEdgeSst => itat::BLT | itat::MBLT | itat::TWO_EVME | itat::SST,
        Protocol::TwoEdgeSstBroadcast => {
            itat::BLT | itat::MBLT | itat::TWO_EVME | itat::SST | itat::SSTB
        }
    }
}

/// Fastest protocol accepted by an `ITATx` value.
#[must_use]
pub const fn inbound_protocol(word: u32) -> Protocol {
    if word & itat::SSTB != 0 {
        Protocol::TwoEdgeSstBroadcast
    } else if word & itat::SST != 0 {
        Protocol::TwoEdgeSst
    } else if word & itat::TWO_EVME != 0 {
        Protocol::TwoEdgeVme
    } else if word & itat::MBLT != 0 {
        Protocol::Mblt
    } else if word & itat::BLT != 0 {
        Protocol::Blt
    } else {
        Protocol::Sct
    }
}

/// Inbound 2eSST rate field.
#[must_use]
pub const fn inbound_sst_bits(rate: Option<SstRate>) -> u32 {
    let code = match rate {
        None | Some(SstRate::Mb160) => 0,
        Some(SstRate::Mb267) => 1,
        Some(SstRate::Mb320) => 2,
    };
    code << itat::SST_SHIFT
}

/// Virtual FIFO size bits: smallest `x` with `64 << x >= bytes`, capped at 3.
#[must_use]
pub fn fifo_size_bits(bytes: u32) -> u32 {
    let x = (0..4).find(|&x| (64u32 << x) >= bytes).unwrap_or(3);
    x << itat::VFS_SHIFT
}

/// Block size code: smallest `x` with `32 << x >= bytes`, capped at 7.
#[must_use]
pub fn block_size_code(bytes: u32) -> u32 {
    (0..8).find(|&x| (32u64 << x) >= u64::from(bytes)).unwrap_or(7)
}

/// Back-off code: 0 when `us == 0`, otherwise the smallest `x >= 1` with
/// `1 << (x - 1) >= us`, capped at 7.
#[must_use]
pub fn backoff_code(us: u32) -> u32 {
    if us == 0 {
        return 0;
    }
    (1..8).find(|&x| (1u64 << (x - 1)) >= u64::from(us)).unwrap_or(7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_and_channel_offsets() {
        assert_eq!(outbound(0) + ot::AT, 0x11C);
        assert_eq!(outbound(7), 0x1E0);
        assert_eq!(inbound(0), 0x300);
        assert_eq!(inbound(7) + it::AT, 0x3FC);
        assert_eq!(dma(1) + dma_reg::DDBS, 0x5C4);
        assert_eq!(viack(7), 0x21C);
        assert_eq!(gcsr_mbox(0), 0x610);
    }

    #[test]
    fn attribute_word_matches_datasheet() {
        let attrs = VmeAttributes {
            space: AddressSpace::A32,
            width: DataWidth::D32,
            protocol: Protocol::TwoEdgeSst,
            sst_rate: Some(SstRate::Mb320),
            privilege: Privilege::Supervisor,
            cycle: CycleKind::Program,
        };
        assert_eq!(attribute_word(&attrs), 0x2 | 0x20 | 0x10 | 0x40 | 0x400 | 0x1000);
        assert_eq!(decode_attribute_word(attribute_word(&attrs)), Some(attrs));
    }

    #[test]
    fn reserved_amode_rejected() {
        assert!(decode_attribute_word(0x3).is_none());
        assert!(decode_attribute_word(0x700).is_none());
    }

    #[test]
    fn inbound_encodings() {
        assert_eq!(inbound_granularity(AddressSpace::A16), Some(0x10));
        assert!(inbound_granularity(AddressSpace::CrCsr).is_none());
        assert_eq!(inbound_protocol(inbound_protocol_bits(Protocol::Mblt)), Protocol::Mblt);
        assert_eq!(inbound_protocol_bits(Protocol::Blt), 0x80);
        assert_eq!(fifo_size_bits(64), 0);
        assert_eq!(fifo_size_bits(65), 1 << 16);
        assert_eq!(fifo_size_bits(10_000), 3 << 16);
    }

    #[test]
    fn dma_codes_round_up() {
        assert_eq!(block_size_code(32), 0);
        assert_eq!(block_size_code(2048), 6);
        assert_eq!(block_size_code(4096), 7);
        assert_eq!(block_size_code(1 << 20), 7);
        assert_eq!(backoff_code(0), 0);
        assert_eq!(backoff_code(1), 1);
        assert_eq!(backoff_code(3), 3);
        assert_eq!(prefetch_bits(2), 0x4_0000);
        assert_eq!(prefetch_bits(16), 0x4_0000 | (3 << 16));
    }
}
