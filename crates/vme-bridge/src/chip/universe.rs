//! ca91c042 ("Universe II")

use super::{
    check_irq_level, check_slot, walking_bit_echo, BridgeChip, BusFault, DmaStart,
    PendingInterrupts,
};
use crate::arbiter::{
    decode_universe_arbiter, decode_universe_requester, encode_universe_arbiter,
    encode_universe_requester, ArbiterConfig, RequesterConfig,
};
use crate::bus::{ChipRegisters, RegisterBus};
use crate::config::DmaTuning;
use crate::dma::{BusEndpoint, DmaSnapshot, DmaStatus, ResolvedSegment};
use crate::error::{BusSide, Result, VmeError};
use crate::platform::TickSource;
use crate::window::{InboundWindow, OutboundWindow, WindowDirection, WINDOW_COUNT};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use vme_chip::attr::{
    AccessFilter, AddressSpace, CycleKind, DataWidth, Privilege, Protocol, VmeAttributes,
};
use vme_chip::pcie::{ChipVariant, UNIVERSE_PCI_CLASS};
use vme_chip::universe::{self as reg, dgcs, image, lint, lsi_ctl, packet, vsi_ctl};

/// Status bits of `DGCS` that are cleared by writing one.
const DGCS_STATUS: u32 = dgcs::STOP | dgcs::HALT | dgcs::DONE | dgcs::ERRORS;

/// Control bits of `DGCS` safe to write back.
const fn dgcs_control(value: u32) -> u32 {
    value & !(DGCS_STATUS | dgcs::ACT | dgcs::GO | dgcs::STOP_REQ | dgcs::HALT_REQ)
}

/// Address that must fit the chip's 32-bit registers.
fn low32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        VmeError::configuration(format!("{what} {value:#x} does not fit 32 bits on ca91c042"))
    })
}

/// Exclusive bound register for `[base, base + size)`.
///
/// The bound register is 32 bits wide, so a window ending at exactly
/// 4 GiB is encoded as zero.
fn bound32(base: u64, size: u64, what: &str) -> Result<u32> {
    let end = base.saturating_add(size);
    if end == 1 << 32 {
        return Ok(0);
    }
    low32(end, what)
}

const fn inbound_vas(space: AddressSpace) -> Option<u32> {
    match space {
        AddressSpace::A64 | AddressSpace::CrCsr | AddressSpace::User3 | AddressSpace::User4 => {
            None
        }
        other => reg::vas(other),
    }
}

const fn slave_access_bits(access: AccessFilter) -> u32 {
    let mut bits = 0;
    if access.user {
        bits |= vsi_ctl::USER;
    }
    if access.supervisor {
        bits |= vsi_ctl::SUPER;
    }
    if access.data {
        bits |= vsi_ctl::DATA;
    }
    if access.program {
        bits |= vsi_ctl::PGM;
    }
    bits
}

/// ca91c042 implementation of [`BridgeChip`]
#[derive(Debug)]
pub struct UniverseChip {
    regs: ChipRegisters,
    raised_level: AtomicU8,
}

impl UniverseChip {
    /// Wrap the register bus of a ca91c042
    pub fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self {
            regs: ChipRegisters::new(bus, ChipVariant::Universe),
            raised_level: AtomicU8::new(0),
        }
    }

    fn check_channel(channel: usize) -> Result<()> {
        if channel != 0 {
            return Err(VmeError::configuration(format!(
                "ca91c042 has a single DMA channel, got {channel}"
            )));
        }
        Ok(())
    }

    /// `DCTL` value and (PCI, VME) addresses of a validated segment
    fn dma_terms(segment: &ResolvedSegment) -> Result<(u32, u32, u32)> {
        let (pci, vme, attrs, to_vme) = match (segment.source, segment.destination) {
            (BusEndpoint::Pci(pci), BusEndpoint::Vme { address, attrs }) => (pci, address, attrs, true),
            (BusEndpoint::Vme { address, attrs }, BusEndpoint::Pci(pci)) => (pci, address, attrs, false),
            _ => {
                return Err(VmeError::configuration(
                    "ca91c042 DMA moves data between PCI and VME only",
                ))
            }
        };

        if !reg::supports_protocol(attrs.protocol) {
            return Err(VmeError::configuration(format!(
                "ca91c042 DMA cannot use {}",
                attrs.protocol
            )));
        }
        let width = if attrs.protocol == Protocol::Mblt {
            DataWidth::D64
        } else {
            attrs.width
        };
        let mut dctl = reg::cycle_bits(attrs.space, width, attrs.protocol, attrs.privilege, attrs.cycle)
            .ok_or(VmeError::UnsupportedAddressSpace {
                space: attrs.space,
                variant: ChipVariant::Universe,
            })?;
        if to_vme {
            dctl |= reg::dctl::L2V;
        }
        Ok((dctl, low32(pci, "DMA PCI address")?, low32(vme, "DMA VME address")?))
    }
}

impl BridgeChip for UniverseChip {
    fn variant(&self) -> ChipVariant {
        ChipVariant::Universe
    }

    fn registers(&self) -> &ChipRegisters {
        &self.regs
    }

    // ── Start of day ─────────────────────────────────────────────────────

    fn self_test(&self) -> Result<()> {
        let class = self.regs.read(reg::PCI_CLASS)?;
        if class != UNIVERSE_PCI_CLASS {
            return Err(VmeError::hardware_mismatch(format!(
                "PCI_CLASS reads {class:#010x}, expected {UNIVERSE_PCI_CLASS:#010x}"
            )));
        }
        walking_bit_echo(&self.regs, [reg::SCYC_EN, reg::SCYC_CMP])
    }

    fn is_system_controller(&self) -> Result<bool> {
        Ok(self.regs.read(reg::MISC_CTL)? & reg::misc_ctl::SYSCON != 0)
    }

    fn initialize(&self) -> Result<bool> {
        self.shutdown()?;
        self.regs
            .modify(reg::MISC_CTL, reg::misc_ctl::INIT_KEEP, reg::misc_ctl::INIT_SET)?;
        let syscon = self.is_system_controller()?;

        let enables = if syscon {
            lint::INIT_SYSCON
        } else {
            lint::INIT_PERIPHERAL
        };
        self.regs.write(reg::LINT_MAP0, 0)?;
        self.regs.write(reg::LINT_MAP1, 0)?;
        self.regs.write(reg::LINT_STAT, lint::ALL)?;
        self.regs.write(reg::LINT_EN, enables)?;
        let echoed = self.regs.read(reg::LINT_EN)?;
        if echoed != enables {
            return Err(VmeError::hardware_mismatch(format!(
                "LINT_EN reads {echoed:#010x} after writing {enables:#010x}"
            )));
        }
        tracing::info!(
            "ca91c042 initialised ({})",
            if syscon { "system controller" } else { "peripheral" }
        );
        Ok(syscon)
    }

    fn shutdown(&self) -> Result<()> {
        for i in 0..WINDOW_COUNT {
            self.regs.write(reg::lsi(i) + image::CTL, lsi_ctl::SHUTDOWN)?;
            self.regs.write(reg::vsi(i) + image::CTL, vsi_ctl::SHUTDOWN)?;
        }
        self.regs.write(reg::LM_CTL, 0)?;
        self.regs.write(reg::VCSR_CTL, 0)?;
        self.regs.write(reg::SCYC_CTL, reg::scyc_ctl::DISABLED)?;
        self.regs.write(reg::VINT_EN, 0)?;
        self.regs.write(reg::LINT_EN, 0)?;
        self.regs.write(reg::LINT_STAT, lint::ALL)?;
        self.regs.write(reg::DGCS, DGCS_STATUS)?;
        self.regs.modify(reg::PCI_CSR, !0, reg::pci_csr::S_TA)?;
        self.regs.write(reg::L_CMDERR, reg::L_CMDERR_CLEAR)?;
        Ok(())
    }

    fn setup_slot(&self, slot: u8) -> Result<()> {
        check_slot(slot)?;
        self.regs
            .write(reg::VCSR_BS, u32::from(slot) << reg::VCSR_BS_SLOT_SHIFT)?;
        self.regs.write(reg::VCSR_TO, 0)?;
        self.regs.write(reg::VCSR_CTL, reg::VCSR_CTL_EN)
    }

    fn sys_reset(&self) -> Result<()> {
        self.regs.modify(reg::MISC_CTL, !0, reg::misc_ctl::SW_SYSRST)?;
        Ok(())
    }

    fn check_bus_error(&self, clear: bool) -> Result<Option<BusFault>> {
        if self.regs.read(reg::PCI_CSR)? & reg::pci_csr::S_TA != 0 {
            if clear {
                self.regs.modify(reg::PCI_CSR, !0, reg::pci_csr::S_TA)?;
            }
            return Ok(Some(BusFault {
                side: BusSide::Vme,
                address: 0,
            }));
        }
        if self.regs.read(reg::L_CMDERR)? & reg::L_CMDERR_CLEAR != 0 {
            if clear {
                self.regs.write(reg::L_CMDERR, reg::L_CMDERR_CLEAR)?;
            }
            return Ok(Some(BusFault {
                side: BusSide::Pci,
                address: 0,
            }));
        }
        Ok(None)
    }

    // ── Windows ──────────────────────────────────────────────────────────

    fn window_granularity(&self, direction: WindowDirection, space: AddressSpace) -> Option<u64> {
        let available = match direction {
            WindowDirection::Outbound => reg::vas(space).is_some(),
            WindowDirection::Inbound => inbound_vas(space).is_some(),
        };
        available.then_some(reg::IMAGE_ALIGN)
    }

    fn write_outbound(&self, w: &OutboundWindow) -> Result<()> {
        let base = reg::lsi(w.index);
        if !w.enabled {
            self.regs.modify(base + image::CTL, !lsi_ctl::EN, 0)?;
            return Ok(());
        }

        if w.broadcast_select != 0 || w.prefetch.is_some() {
            return Err(VmeError::configuration(
                "ca91c042 outbound windows have no broadcast select or prefetch",
            ));
        }
        if !reg::supports_protocol(w.attrs.protocol) {
            return Err(VmeError::configuration(format!(
                "ca91c042 outbound windows cannot use {}",
                w.attrs.protocol
            )));
        }
        let pci = low32(w.pci_base, "PCI base")?;
        let bound = bound32(w.pci_base, w.size, "PCI bound")?;
        let vme = low32(w.vme_base, "VME base")?;
        let width = if w.attrs.protocol == Protocol::Mblt {
            DataWidth::D64
        } else {
            w.attrs.width
        };
        let mut ctl = reg::cycle_bits(
            w.attrs.space,
            width,
            w.attrs.protocol,
            w.attrs.privilege,
            w.attrs.cycle,
        )
        .ok_or(VmeError::UnsupportedAddressSpace {
            space: w.attrs.space,
            variant: ChipVariant::Universe,
        })?;
        if w.write_post {
            ctl |= lsi_ctl::PWEN;
        }

        let offset = vme.wrapping_sub(pci);
        self.regs.write(base + image::CTL, 0)?;
        self.regs.write(base + image::BS, pci)?;
        self.regs.write(base + image::BD, bound)?;
        self.regs.write(base + image::TO, offset)?;
        for (reg_offset, expected) in [(image::BS, pci), (image::BD, bound), (image::TO, offset)] {
            let echoed = self.regs.read(base + reg_offset)?;
            if echoed != expected {
                return Err(VmeError::hardware_mismatch(format!(
                    "LSI{} register {:#05x} reads {echoed:#010x}, wrote {expected:#010x}",
                    w.index,
                    base + reg_offset
                )));
            }
        }
        self.regs.write(base + image::CTL, ctl)?;
        self.regs.write(base + image::CTL, ctl | lsi_ctl::EN)
    }

    fn read_outbound(&self, index: usize) -> Result<OutboundWindow> {
        let base = reg::lsi(index);
        let ctl = self.regs.read(base + image::CTL)?;
        let bs = self.regs.read(base + image::BS)?;
        let bd = self.regs.read(base + image::BD)?;
        let to = self.regs.read(base + image::TO)?;

        let Some(space) = reg::space_from_vas(ctl >> lsi_ctl::VAS_SHIFT) else {
            if ctl & lsi_ctl::EN == 0 {
                return Ok(OutboundWindow::disabled(index));
            }
            return Err(VmeError::hardware_mismatch(format!(
                "LSI{index}_CTL has reserved VAS: {ctl:#010x}"
            )));
        };
        let width = reg::width_from_vdw(ctl >> lsi_ctl::VDW_SHIFT);
        let protocol = match (ctl & lsi_ctl::VCT != 0, width) {
            (false, _) => Protocol::Sct,
            (true, DataWidth::D64) => Protocol::Mblt,
            (true, _) => Protocol::Blt,
        };
        let attrs = VmeAttributes {
            space,
            width,
            protocol,
            sst_rate: None,
            privilege: if ctl & lsi_ctl::SUPER != 0 {
                Privilege::Supervisor
            } else {
                Privilege::User
            },
            cycle: if ctl & lsi_ctl::PGM != 0 {
                CycleKind::Program
            } else {
                CycleKind::Data
            },
        };

        Ok(OutboundWindow {
            index,
            enabled: ctl & lsi_ctl::EN != 0,
            pci_base: u64::from(bs),
            size: u64::from(bd.wrapping_sub(bs)),
            vme_base: u64::from(bs.wrapping_add(to)) & space.address_mask(),
            attrs,
            write_post: ctl & lsi_ctl::PWEN != 0,
            prefetch: None,
            broadcast_select: 0,
        })
    }

    fn write_inbound(&self, w: &InboundWindow) -> Result<()> {
        let base = reg::vsi(w.index);
        if !w.enabled {
            self.regs.modify(base + image::CTL, !vsi_ctl::EN, 0)?;
            return Ok(());
        }

        if w.sst_rate.is_some() || !reg::supports_protocol(w.protocol) {
            return Err(VmeError::configuration(format!(
                "ca91c042 inbound windows cannot accept {}",
                w.protocol
            )));
        }
        let vas = inbound_vas(w.space).ok_or(VmeError::UnsupportedAddressSpace {
            space: w.space,
            variant: ChipVariant::Universe,
        })?;
        let vme = low32(w.vme_base, "VME base")?;
        let bound = bound32(w.vme_base, w.size, "VME bound")?;
        let pci = low32(w.pci_base, "PCI base")?;

        let mut ctl = (vas << vsi_ctl::VAS_SHIFT) | slave_access_bits(w.access);
        if w.write_post {
            ctl |= vsi_ctl::PWEN;
        }
        if w.prefetch {
            ctl |= vsi_ctl::PREN;
        }
        if w.rmw_lock {
            ctl |= vsi_ctl::LLRMW;
        }
        if w.protocol == Protocol::Mblt {
            ctl |= vsi_ctl::LD64EN;
        }

        let offset = pci.wrapping_sub(vme);
        self.regs.write(base + image::CTL, 0)?;
        self.regs.write(base + image::BS, vme)?;
        self.regs.write(base + image::BD, bound)?;
        self.regs.write(base + image::TO, offset)?;
        for (reg_offset, expected) in [(image::BS, vme), (image::BD, bound), (image::TO, offset)] {
            let echoed = self.regs.read(base + reg_offset)?;
            if echoed != expected {
                return Err(VmeError::hardware_mismatch(format!(
                    "VSI{} register {:#05x} reads {echoed:#010x}, wrote {expected:#010x}",
                    w.index,
                    base + reg_offset
                )));
            }
        }
        self.regs.write(base + image::CTL, ctl)?;
        self.regs.write(base + image::CTL, ctl | vsi_ctl::EN)
    }

    fn read_inbound(&self, index: usize) -> Result<InboundWindow> {
        let base = reg::vsi(index);
        let ctl = self.regs.read(base + image::CTL)?;
        let bs = self.regs.read(base + image::BS)?;
        let bd = self.regs.read(base + image::BD)?;
        let to = self.regs.read(base + image::TO)?;

        let Some(space) = reg::space_from_vas(ctl >> vsi_ctl::VAS_SHIFT) else {
            if ctl & vsi_ctl::EN == 0 {
                return Ok(InboundWindow {
                    enabled: false,
                    ..InboundWindow::new(index, 0, 0, 0, AddressSpace::A32)
                });
            }
            return Err(VmeError::hardware_mismatch(format!(
                "VSI{index}_CTL has reserved VAS: {ctl:#010x}"
            )));
        };

        Ok(InboundWindow {
            index,
            enabled: ctl & vsi_ctl::EN != 0,
            vme_base: u64::from(bs),
            size: u64::from(bd.wrapping_sub(bs)),
            pci_base: u64::from(bs.wrapping_add(to)),
            space,
            // BLT is always accepted; LD64EN adds MBLT
            protocol: if ctl & vsi_ctl::LD64EN != 0 {
                Protocol::Mblt
            } else {
                Protocol::Blt
            },
            sst_rate: None,
            access: AccessFilter {
                user: ctl & vsi_ctl::USER != 0,
                supervisor: ctl & vsi_ctl::SUPER != 0,
                data: ctl & vsi_ctl::DATA != 0,
                program: ctl & vsi_ctl::PGM != 0,
            },
            write_post: ctl & vsi_ctl::PWEN != 0,
            prefetch: ctl & vsi_ctl::PREN != 0,
            prefetch_size: 64,
            prefetch_threshold: false,
            rmw_lock: ctl & vsi_ctl::LLRMW != 0,
        })
    }

    // ── DMA ──────────────────────────────────────────────────────────────

    fn descriptor_size(&self) -> usize {
        packet::SIZE
    }

    fn max_descriptor_bytes(&self) -> u32 {
        reg::DMA_MAX_BYTES
    }

    fn validate_segment(&self, segment: &ResolvedSegment) -> Result<()> {
        if segment.length == 0 || segment.length > reg::DMA_MAX_BYTES {
            return Err(VmeError::configuration(format!(
                "ca91c042 DMA byte count {:#x} out of range 1-{:#x}",
                segment.length,
                reg::DMA_MAX_BYTES
            )));
        }
        let (_, pci, vme) = Self::dma_terms(segment)?;
        if pci & 7 != vme & 7 {
            return Err(VmeError::configuration(format!(
                "ca91c042 DMA needs PCI {pci:#x} and VME {vme:#x} to share 8-byte alignment"
            )));
        }
        Ok(())
    }

    fn encode_descriptor(
        &self,
        segment: &ResolvedSegment,
        next: Option<u64>,
        out: &mut [u8],
    ) -> Result<()> {
        let (dctl, pci, vme) = Self::dma_terms(segment)?;
        let link = match next {
            Some(addr) if addr % packet::SIZE as u64 == 0 => low32(addr, "Command packet")?,
            Some(addr) => {
                return Err(VmeError::configuration(format!(
                    "Command packet {addr:#x} not 32-byte aligned"
                )))
            }
            None => packet::END,
        };

        let mut words = [0u32; packet::SIZE / 4];
        words[packet::DCTL] = dctl;
        words[packet::DTBC] = segment.length;
        words[packet::DLV] = pci;
        words[packet::DVA] = vme;
        words[packet::DCPP] = link;
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    fn start_dma(
        &self,
        channel: usize,
        start: DmaStart<'_>,
        tuning: &DmaTuning,
        ticks: &dyn TickSource,
    ) -> Result<u32> {
        Self::check_channel(channel)?;
        let mut gcs = (reg::von_code(tuning.max_vme_block) << dgcs::VON_SHIFT)
            | (reg::voff_code(tuning.vme_backoff_us) << dgcs::VOFF_SHIFT);

        match start {
            DmaStart::Direct(segment) => {
                let (dctl, pci, vme) = Self::dma_terms(segment)?;
                self.regs.write(reg::DVA, vme)?;
                self.regs.write(reg::DLA, pci)?;
                self.regs.write(reg::DTBC, segment.length)?;
                self.regs.write(reg::DCTL, dctl)?;
                self.regs.write(reg::DCPP, 0)?;
            }
            DmaStart::Chained { head } => {
                self.regs.write(reg::DTBC, 0)?;
                self.regs.write(reg::DCPP, low32(head, "Command packet")?)?;
                gcs |= dgcs::CHAIN;
            }
        }

        self.regs.write(reg::DGCS, gcs)?;
        let tick = ticks.now();
        self.regs
            .write(reg::DGCS, gcs | dgcs::GO | dgcs::INT_ENABLES)?;
        Ok(tick)
    }

    fn dma_status(&self, channel: usize) -> Result<DmaStatus> {
        Self::check_channel(channel)?;
        let raw = self.regs.read(reg::DGCS)?;
        Ok(DmaStatus {
            raw,
            busy: raw & dgcs::ACT != 0,
            done: raw & dgcs::DONE != 0,
            error: raw & dgcs::ERRORS != 0,
            aborted: raw & (dgcs::STOP | dgcs::HALT) != 0,
        })
    }

    fn dma_snapshot(&self, channel: usize) -> Result<DmaSnapshot> {
        Self::check_channel(channel)?;
        Ok(DmaSnapshot {
            descriptor: u64::from(self.regs.read(reg::DCPP)?),
            control: self.regs.read(reg::DCTL)?,
            count: self.regs.read(reg::DTBC)?,
            source: u64::from(self.regs.read(reg::DLA)?),
            destination: u64::from(self.regs.read(reg::DVA)?),
        })
    }

    fn abort_dma(&self, channel: usize) -> Result<()> {
        Self::check_channel(channel)?;
        let gcs = dgcs_control(self.regs.read(reg::DGCS)?);
        self.regs.write(reg::DGCS, gcs | dgcs::STOP_REQ)
    }

    fn clear_dma(&self, channel: usize) -> Result<()> {
        Self::check_channel(channel)?;
        let gcs = dgcs_control(self.regs.read(reg::DGCS)?);
        self.regs.write(reg::DGCS, gcs | DGCS_STATUS)
    }

    // ── Interrupts ───────────────────────────────────────────────────────

    #[allow(clippy::cast_possible_truncation)]
    fn take_pending(&self) -> Result<PendingInterrupts> {
        let enable = self.regs.read(reg::LINT_EN)?;
        let stat = self.regs.read(reg::LINT_STAT)? & enable;
        if stat == 0 {
            return Ok(PendingInterrupts::default());
        }

        let mut pending = PendingInterrupts {
            dma: u8::from(stat & lint::DMA != 0),
            mailbox: ((stat & lint::MBOX) >> 16) as u8,
            location_monitor: ((stat & lint::LM) >> 20) as u8,
            sysfail: stat & lint::SYSFAIL != 0,
            acfail: stat & lint::ACFAIL != 0,
            ..PendingInterrupts::default()
        };
        for level in (1..=7u8).rev() {
            if stat & (1 << level) != 0 {
                let vector = self.regs.read(reg::v_statid(level))? & 0xFF;
                pending.vme[usize::from(level)] = Some(vector as u8);
            }
        }
        self.regs.write(reg::LINT_STAT, stat)?;

        // The log stays latched for whoever made the faulting access
        if stat & (lint::LERR | lint::VERR) != 0 {
            pending.bus_error = self.check_bus_error(false)?;
        }
        Ok(pending)
    }

    fn raise_vme_irq(&self, level: u8, vector: u8) -> Result<()> {
        check_irq_level(level)?;
        if vector & 1 != 0 {
            return Err(VmeError::configuration(format!(
                "ca91c042 can only send even vectors, got {vector:#04x}"
            )));
        }
        self.regs.write(reg::STATID, u32::from(vector) << 24)?;
        self.raised_level.store(level, Ordering::Relaxed);
        self.regs.write(reg::VINT_EN, reg::vint_level(level))
    }

    fn vme_irq_pending(&self) -> Result<bool> {
        let level = self.raised_level.load(Ordering::Relaxed);
        if level == 0 {
            return Ok(false);
        }
        Ok(self.regs.read(reg::VINT_STAT)? & reg::vint_level(level) != 0)
    }

    fn release_vme_irq(&self) -> Result<()> {
        self.raised_level.store(0, Ordering::Relaxed);
        self.regs.write(reg::VINT_EN, 0)
    }

    fn trigger_mailbox(&self) -> Result<()> {
        self.regs.write(reg::mbox(0), 1)
    }

    fn setup_location_monitor(
        &self,
        address: u64,
        space: AddressSpace,
        access: AccessFilter,
    ) -> Result<()> {
        let vas = inbound_vas(space).ok_or(VmeError::UnsupportedAddressSpace {
            space,
            variant: ChipVariant::Universe,
        })?;
        if address % reg::IMAGE_ALIGN != 0 {
            return Err(VmeError::configuration(format!(
                "Location monitor base {address:#x} not 4 KB aligned"
            )));
        }
        let base = low32(address, "Location monitor base")?;
        self.regs.write(reg::LM_CTL, 0)?;
        self.regs.write(reg::LM_BS, base)?;
        self.regs.write(
            reg::LM_CTL,
            reg::lm_ctl::EN | (vas << vsi_ctl::VAS_SHIFT) | slave_access_bits(access),
        )
    }

    fn disable_location_monitor(&self) -> Result<()> {
        self.regs.write(reg::LM_CTL, 0)
    }

    // ── RMW ──────────────────────────────────────────────────────────────

    fn arm_rmw(&self, pci_address: u64, enable: u32, compare: u32, swap: u32) -> Result<()> {
        let addr = low32(pci_address, "RMW address")?;
        // Data registers are compared in VME byte order
        self.regs.write(reg::SCYC_CTL, reg::scyc_ctl::DISABLED)?;
        self.regs.write(reg::SCYC_EN, enable.swap_bytes())?;
        self.regs.write(reg::SCYC_CMP, compare.swap_bytes())?;
        self.regs.write(reg::SCYC_SWP, swap.swap_bytes())?;
        self.regs.write(reg::SCYC_ADDR, addr)?;
        self.regs.write(reg::SCYC_CTL, reg::scyc_ctl::RMW)
    }

    fn disarm_rmw(&self) -> Result<()> {
        self.regs.write(reg::SCYC_CTL, reg::scyc_ctl::DISABLED)
    }

    // ── Arbiter / requester ──────────────────────────────────────────────

    fn set_arbiter(&self, config: &ArbiterConfig) -> Result<()> {
        let value = encode_universe_arbiter(self.regs.read(reg::MISC_CTL)?, config)?;
        self.regs.write(reg::MISC_CTL, value)
    }

    fn arbiter(&self) -> Result<ArbiterConfig> {
        Ok(decode_universe_arbiter(self.regs.read(reg::MISC_CTL)?))
    }

    fn set_requester(&self, config: &RequesterConfig) -> Result<()> {
        let value = encode_universe_requester(self.regs.read(reg::MAST_CTL)?, config)?;
        self.regs.write(reg::MAST_CTL, value)
    }

    fn requester(&self) -> Result<RequesterConfig> {
        Ok(decode_universe_requester(self.regs.read(reg::MAST_CTL)?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::RegisterFile;
    use super::*;
    use crate::platform::MonotonicTicks;
    use vme_chip::attr::VmeAttributes;

    fn chip() -> (Arc<RegisterFile>, UniverseChip) {
        let file = Arc::new(RegisterFile::default());
        let chip = UniverseChip::new(file.clone());
        (file, chip)
    }

    fn a32_blt() -> VmeAttributes {
        VmeAttributes::sct(AddressSpace::A32, DataWidth::D32).with_protocol(Protocol::Blt)
    }

    #[test]
    fn outbound_registers_and_decode() {
        let (_, chip) = chip();
        let window = OutboundWindow::new(5, 0x8000_0000, 0x10_0000, 0x2000_0000, a32_blt());
        chip.write_outbound(&window).unwrap();

        let base = reg::lsi(5);
        let regs = chip.registers();
        assert_eq!(regs.read(base + image::BS).unwrap(), 0x8000_0000);
        assert_eq!(regs.read(base + image::BD).unwrap(), 0x8010_0000);
        assert_eq!(regs.read(base + image::TO).unwrap(), 0xA000_0000);
        assert_eq!(chip.read_outbound(5).unwrap(), window);
    }

    #[test]
    fn outbound_rejects_tsi148_options() {
        let (file, chip) = chip();
        let mut window = OutboundWindow::new(0, 0x8000_0000, 0x1000, 0, a32_blt());
        window.prefetch = Some(4);
        assert!(matches!(
            chip.write_outbound(&window),
            Err(VmeError::Configuration { .. })
        ));
        window.prefetch = None;
        window.pci_base = 0x1_0000_0000;
        assert!(chip.write_outbound(&window).is_err());
        assert!(file.writes().is_empty());
    }

    #[test]
    fn mblt_forces_64_bit_width() {
        let (_, chip) = chip();
        let attrs = VmeAttributes::sct(AddressSpace::A24, DataWidth::D16).with_protocol(Protocol::Mblt);
        chip.write_outbound(&OutboundWindow::new(1, 0x9000_0000, 0x1000, 0x1000, attrs))
            .unwrap();
        let decoded = chip.read_outbound(1).unwrap();
        assert_eq!(decoded.attrs.protocol, Protocol::Mblt);
        assert_eq!(decoded.attrs.width, DataWidth::D64);
    }

    #[test]
    fn window_ending_at_four_gib_wraps_its_bound() {
        let (_, chip) = chip();
        let outbound = OutboundWindow::new(3, 0xF000_0000, 0x1000_0000, 0x1000_0000, a32_blt());
        chip.write_outbound(&outbound).unwrap();
        let regs = chip.registers();
        assert_eq!(regs.read(reg::lsi(3) + image::BD).unwrap(), 0);
        assert_eq!(chip.read_outbound(3).unwrap(), outbound);

        let inbound = InboundWindow::new(4, 0xFFFF_0000, 0x1_0000, 0x2000_0000, AddressSpace::A32);
        chip.write_inbound(&inbound).unwrap();
        assert_eq!(regs.read(reg::vsi(4) + image::BD).unwrap(), 0);
        let decoded = chip.read_inbound(4).unwrap();
        assert_eq!(
            (decoded.vme_base, decoded.size, decoded.pci_base),
            (0xFFFF_0000, 0x1_0000, 0x2000_0000)
        );

        let past = OutboundWindow::new(3, 0xF000_0000, 0x1000_1000, 0, a32_blt());
        assert!(matches!(
            chip.write_outbound(&past),
            Err(VmeError::Configuration { .. })
        ));
    }

    #[test]
    fn inbound_decode_reports_blt_and_access() {
        let (_, chip) = chip();
        let mut window = InboundWindow::new(2, 0x0040_0000, 0x1_0000, 0x1000_0000, AddressSpace::A24);
        window.protocol = Protocol::Blt;
        window.prefetch = true;
        window.access.program = true;
        chip.write_inbound(&window).unwrap();
        assert_eq!(chip.read_inbound(2).unwrap(), window);

        window.space = AddressSpace::CrCsr;
        assert!(matches!(
            chip.write_inbound(&window),
            Err(VmeError::UnsupportedAddressSpace { .. })
        ));
    }

    #[test]
    fn odd_vector_is_rejected_before_any_write() {
        let (file, chip) = chip();
        assert!(matches!(
            chip.raise_vme_irq(3, 0x41),
            Err(VmeError::Configuration { .. })
        ));
        assert!(file.writes().is_empty());

        chip.raise_vme_irq(3, 0x40).unwrap();
        assert_eq!(chip.registers().read(reg::STATID).unwrap(), 0x4000_0000);
        assert_eq!(chip.registers().read(reg::VINT_EN).unwrap(), reg::vint_level(3));
    }

    #[test]
    fn command_packet_layout() {
        let (_, chip) = chip();
        let segment = ResolvedSegment {
            source: BusEndpoint::Vme {
                address: 0x0010_0004,
                attrs: a32_blt(),
            },
            destination: BusEndpoint::Pci(0x4000_0004),
            length: 0x800,
        };
        chip.validate_segment(&segment).unwrap();

        let mut out = [0u8; packet::SIZE];
        chip.encode_descriptor(&segment, None, &mut out).unwrap();
        let word = |i: usize| u32::from_le_bytes(out[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(packet::DCTL) & reg::dctl::L2V, 0);
        assert_ne!(word(packet::DCTL) & reg::dctl::VCT, 0);
        assert_eq!(word(packet::DTBC), 0x800);
        assert_eq!(word(packet::DLV), 0x4000_0004);
        assert_eq!(word(packet::DVA), 0x0010_0004);
        assert_eq!(word(packet::DCPP), packet::END);

        chip.encode_descriptor(&segment, Some(0x4000_1020), &mut out).unwrap();
        let word = |i: usize| u32::from_le_bytes(out[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(packet::DCPP), 0x4000_1020);
        assert!(chip.encode_descriptor(&segment, Some(0x4000_1010), &mut out).is_err());
    }

    #[test]
    fn dma_alignment_and_patterns() {
        let (_, chip) = chip();
        let mut segment = ResolvedSegment {
            source: BusEndpoint::Pci(0x4000_0001),
            destination: BusEndpoint::Vme {
                address: 0x0010_0002,
                attrs: a32_blt(),
            },
            length: 16,
        };
        assert!(chip.validate_segment(&segment).is_err());
        segment.source = BusEndpoint::Pattern(crate::dma::DmaPattern::Byte(0xAA));
        assert!(chip.validate_segment(&segment).is_err());
        segment.source = BusEndpoint::Pci(0x4000_0002);
        segment.length = reg::DMA_MAX_BYTES + 1;
        assert!(chip.validate_segment(&segment).is_err());
    }

    #[test]
    fn direct_start_programs_channel() {
        let (_, chip) = chip();
        let segment = ResolvedSegment {
            source: BusEndpoint::Pci(0x4000_0000),
            destination: BusEndpoint::Vme {
                address: 0x0020_0000,
                attrs: a32_blt(),
            },
            length: 4096,
        };
        let tuning = DmaTuning::default();
        chip.start_dma(0, DmaStart::Direct(&segment), &tuning, &MonotonicTicks::new())
            .unwrap();

        let regs = chip.registers();
        assert_eq!(regs.read(reg::DLA).unwrap(), 0x4000_0000);
        assert_eq!(regs.read(reg::DVA).unwrap(), 0x0020_0000);
        assert_eq!(regs.read(reg::DTBC).unwrap(), 4096);
        assert_ne!(regs.read(reg::DCTL).unwrap() & reg::dctl::L2V, 0);
        let gcs = regs.read(reg::DGCS).unwrap();
        assert_ne!(gcs & dgcs::GO, 0);
        assert_eq!(gcs & dgcs::CHAIN, 0);
        assert_eq!((gcs >> dgcs::VON_SHIFT) & 0xF, reg::von_code(tuning.max_vme_block));
        assert!(chip.start_dma(1, DmaStart::Chained { head: 0 }, &tuning, &MonotonicTicks::new())
            .is_err());
    }

    #[test]
    fn pending_sources_are_decoded_and_cleared() {
        let (file, chip) = chip();
        let regs = chip.registers();
        regs.write(reg::LINT_EN, lint::INIT_SYSCON).unwrap();
        regs.write(reg::LINT_STAT, lint::DMA | (1 << 5) | (1 << 17) | (1 << 22) | lint::VERR)
            .unwrap();
        regs.write(reg::v_statid(5), 0x0000_0155).unwrap();
        regs.write(reg::PCI_CSR, reg::pci_csr::S_TA).unwrap();
        file.clear_log();

        let pending = chip.take_pending().unwrap();
        assert_eq!(pending.dma, 1);
        assert_eq!(pending.mailbox, 0b10);
        assert_eq!(pending.location_monitor, 0b100);
        assert_eq!(pending.vme[5], Some(0x55));
        assert_eq!(
            pending.bus_error.map(|f| f.side),
            Some(BusSide::Vme)
        );
        assert!(file
            .writes()
            .iter()
            .any(|&(offset, _)| offset == reg::LINT_STAT));
        assert_ne!(regs.read(reg::PCI_CSR).unwrap() & reg::pci_csr::S_TA, 0);
    }

    #[test]
    fn initialize_reports_role() {
        let (_, chip) = chip();
        chip.registers()
            .write(reg::MISC_CTL, reg::misc_ctl::SYSCON)
            .unwrap();
        assert!(chip.initialize().unwrap());
        assert_eq!(chip.registers().read(reg::LINT_EN).unwrap(), lint::INIT_SYSCON);
    }
}
