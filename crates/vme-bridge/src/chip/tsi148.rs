//! Tsi148 ("Tempe")

use super::{
    check_irq_level, check_slot, join64, split64, walking_bit_echo, BridgeChip, BusFault, DmaStart,
    PendingInterrupts,
};
use crate::arbiter::{
    decode_tsi148_arbiter, decode_tsi148_requester, encode_tsi148_arbiter,
    encode_tsi148_requester, ArbiterConfig, RequesterConfig,
};
use crate::bus::{ChipRegisters, RegisterBus};
use crate::config::DmaTuning;
use crate::dma::{BusEndpoint, DmaPattern, DmaSnapshot, DmaStatus, ResolvedSegment};
use crate::error::{BusSide, Result, VmeError};
use crate::platform::TickSource;
use crate::window::{InboundWindow, OutboundWindow, WindowDirection, WINDOW_COUNT};
use std::sync::Arc;
use vme_chip::attr::{AccessFilter, AddressSpace, Protocol, SstRate, VmeAttributes};
use vme_chip::pcie::ChipVariant;
use vme_chip::tsi148::{
    self as reg, descriptor, dma_reg, dsat, dsta, exception, int, it, itat, lmat, ot, otat, vicr,
    vmctrl,
};

/// Byte count carried by one descriptor
const MAX_DESCRIPTOR_BYTES: u32 = 0x0100_0000;

/// Location monitor base alignment (four 8-byte monitors)
const LM_ALIGN: u64 = 32;

const fn is_sst(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::TwoEdgeSst | Protocol::TwoEdgeSstBroadcast)
}

fn check_channel(channel: usize) -> Result<()> {
    if channel >= reg::DMA_CHANNELS {
        return Err(VmeError::configuration(format!(
            "Tsi148 DMA channel {channel} out of range 0-{}",
            reg::DMA_CHANNELS - 1
        )));
    }
    Ok(())
}

/// (upper, lower, attribute) words of one DMA endpoint
fn endpoint_words(endpoint: BusEndpoint) -> (u32, u32, u32) {
    match endpoint {
        BusEndpoint::Pci(address) => {
            let (hi, lo) = split64(address);
            (hi, lo, dsat::PCI)
        }
        BusEndpoint::Vme { address, attrs } => {
            let (hi, lo) = split64(address);
            (hi, lo, dsat::VME | reg::attribute_word(&attrs))
        }
        BusEndpoint::Pattern(pattern) => match pattern {
            DmaPattern::Byte(b) => (0, u32::from(b), dsat::PATTERN_BYTE),
            DmaPattern::ByteIncrement(b) => (0, u32::from(b), dsat::PATTERN_BYTE_INC),
            DmaPattern::Word(w) => (0, w, dsat::PATTERN_WORD),
            DmaPattern::WordIncrement(w) => (0, w, dsat::PATTERN_WORD_INC),
        },
    }
}

fn check_vme_range(address: u64, attrs: &VmeAttributes, length: u32) -> Result<()> {
    let last = address.checked_add(u64::from(length) - 1);
    if last.map_or(true, |last| last > attrs.space.address_mask()) {
        return Err(VmeError::configuration(format!(
            "VME range {address:#x}+{length:#x} exceeds {}",
            attrs.space
        )));
    }
    if attrs.sst_rate.is_some() && !is_sst(attrs.protocol) {
        return Err(VmeError::configuration(format!(
            "2eSST rate given for {} cycles",
            attrs.protocol
        )));
    }
    Ok(())
}

/// Tsi148 implementation of [`BridgeChip`]
#[derive(Debug)]
pub struct Tsi148Chip {
    regs: ChipRegisters,
}

impl Tsi148Chip {
    /// Wrap the register bus of a Tsi148
    pub fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self {
            regs: ChipRegisters::new(bus, ChipVariant::Tsi148),
        }
    }

    fn read64(&self, upper: usize, lower: usize) -> Result<u64> {
        Ok(join64(self.regs.read(upper)?, self.regs.read(lower)?))
    }

    fn write64(&self, upper: usize, lower: usize, value: u64) -> Result<()> {
        let (hi, lo) = split64(value);
        self.regs.write(upper, hi)?;
        self.regs.write(lower, lo)
    }

    fn take_fault(&self, side: BusSide, clear: bool) -> Result<Option<BusFault>> {
        let (upper, lower, attr) = match side {
            BusSide::Vme => (reg::VEAU, reg::VEAL, reg::VEAT),
            BusSide::Pci => (reg::EDPAU, reg::EDPAL, reg::EDPAT),
        };
        if self.regs.read(attr)? & exception::VALID == 0 {
            return Ok(None);
        }
        let address = self.read64(upper, lower)?;
        if clear {
            self.regs.write(attr, exception::CLEAR)?;
        }
        Ok(Some(BusFault { side, address }))
    }
}

impl BridgeChip for Tsi148Chip {
    fn variant(&self) -> ChipVariant {
        ChipVariant::Tsi148
    }

    fn registers(&self) -> &ChipRegisters {
        &self.regs
    }

    // ── Start of day ─────────────────────────────────────────────────────

    fn self_test(&self) -> Result<()> {
        walking_bit_echo(&self.regs, [reg::RMWEN, reg::RMWC])
    }

    fn is_system_controller(&self) -> Result<bool> {
        Ok(self.regs.read(reg::VSTAT)? & reg::vstat::SCONS != 0)
    }

    fn initialize(&self) -> Result<bool> {
        self.shutdown()?;
        let syscon = self.is_system_controller()?;

        let enables = if syscon {
            int::INIT_SYSCON
        } else {
            int::INIT_PERIPHERAL
        };
        self.regs.write(reg::INTEN, enables)?;
        self.regs.write(reg::INTEO, enables)?;
        let echoed = self.regs.read(reg::INTEO)?;
        if echoed != enables {
            return Err(VmeError::hardware_mismatch(format!(
                "INTEO reads {echoed:#010x} after writing {enables:#010x}"
            )));
        }
        // Route everything to INTA
        self.regs.write(reg::INTM1, 0)?;
        self.regs.write(reg::INTM2, 0)?;
        tracing::info!(
            "Tsi148 initialised ({})",
            if syscon { "system controller" } else { "peripheral" }
        );
        Ok(syscon)
    }

    fn shutdown(&self) -> Result<()> {
        for i in 0..WINDOW_COUNT {
            self.regs.write(reg::outbound(i) + ot::AT, 0)?;
            self.regs.write(reg::inbound(i) + it::AT, 0)?;
        }
        self.regs.write(reg::LMAT, 0)?;
        self.regs.write(reg::CSRAT, 0)?;
        self.regs.write(reg::CRAT, 0)?;
        self.regs.write(reg::EDPAT, !0)?;
        self.regs.write(reg::VEAT, !0)?;
        self.regs.write(reg::PSTAT, reg::PSTAT_CLEAR)?;
        if self.regs.read(reg::VICR)? & vicr::IRQS != 0 {
            self.regs.write(reg::VICR, vicr::IRQC)?;
        }
        self.regs.write(reg::INTEO, 0)?;
        self.regs.write(reg::INTC, !0)?;
        self.regs.write(reg::INTEN, !0)?;
        self.regs.write(reg::INTM1, 0)?;
        self.regs.write(reg::INTM2, 0)?;
        self.regs.modify(reg::VMCTRL, !vmctrl::RMWEN, 0)?;
        Ok(())
    }

    fn setup_slot(&self, slot: u8) -> Result<()> {
        check_slot(slot)?;
        self.regs
            .write(reg::CBAR, u32::from(slot) << reg::CBAR_SLOT_SHIFT)?;
        self.regs.write(reg::CROU, 0)?;
        self.regs.write(reg::CROL, 0)?;
        self.regs.write(reg::CRAT, reg::CRAT_EN)
    }

    fn sys_reset(&self) -> Result<()> {
        self.regs.modify(reg::VCTRL, !0, reg::vctrl::SRESET)?;
        Ok(())
    }

    fn check_bus_error(&self, clear: bool) -> Result<Option<BusFault>> {
        if let Some(fault) = self.take_fault(BusSide::Vme, clear)? {
            return Ok(Some(fault));
        }
        self.take_fault(BusSide::Pci, clear)
    }

    // ── Windows ──────────────────────────────────────────────────────────

    fn window_granularity(&self, direction: WindowDirection, space: AddressSpace) -> Option<u64> {
        match direction {
            WindowDirection::Outbound => Some(reg::OUTBOUND_ALIGN),
            WindowDirection::Inbound => reg::inbound_granularity(space),
        }
    }

    fn write_outbound(&self, w: &OutboundWindow) -> Result<()> {
        let base = reg::outbound(w.index);
        if !w.enabled {
            self.regs.modify(base + ot::AT, !otat::EN, 0)?;
            return Ok(());
        }

        if w.write_post {
            return Err(VmeError::configuration(
                "Tsi148 outbound windows have no write-post control",
            ));
        }
        check_vme_range(w.vme_base, &w.attrs, 1)?;
        let attr = reg::attribute_word(&w.attrs) | w.prefetch.map_or(0, reg::prefetch_bits);

        self.regs.write(base + ot::AT, 0)?;
        self.write64(base + ot::SAU, base + ot::SAL, w.pci_base)?;
        self.write64(
            base + ot::EAU,
            base + ot::EAL,
            w.pci_base + w.size - reg::OUTBOUND_ALIGN,
        )?;
        self.write64(
            base + ot::OFU,
            base + ot::OFL,
            w.vme_base.wrapping_sub(w.pci_base),
        )?;
        self.regs.write(base + ot::BS, w.broadcast_select)?;
        self.regs.write(base + ot::AT, attr)?;
        self.regs.write(base + ot::AT, attr | otat::EN)
    }

    fn read_outbound(&self, index: usize) -> Result<OutboundWindow> {
        let base = reg::outbound(index);
        let at = self.regs.read(base + ot::AT)?;
        let Some(attrs) = reg::decode_attribute_word(at) else {
            if at & otat::EN == 0 {
                return Ok(OutboundWindow::disabled(index));
            }
            return Err(VmeError::hardware_mismatch(format!(
                "OTAT{index} has a reserved encoding: {at:#010x}"
            )));
        };
        let start = self.read64(base + ot::SAU, base + ot::SAL)?;
        let end = self.read64(base + ot::EAU, base + ot::EAL)?;
        let offset = self.read64(base + ot::OFU, base + ot::OFL)?;

        Ok(OutboundWindow {
            index,
            enabled: at & otat::EN != 0,
            pci_base: start,
            size: (end + reg::OUTBOUND_ALIGN).wrapping_sub(start),
            vme_base: start.wrapping_add(offset) & attrs.space.address_mask(),
            attrs,
            write_post: false,
            prefetch: (at & otat::MRPFD != 0).then_some(2 << ((at >> otat::PFS_SHIFT) & 3)),
            broadcast_select: self.regs.read(base + ot::BS)?,
        })
    }

    fn write_inbound(&self, w: &InboundWindow) -> Result<()> {
        let base = reg::inbound(w.index);
        if !w.enabled {
            self.regs.modify(base + it::AT, !itat::EN, 0)?;
            return Ok(());
        }

        if w.write_post || w.prefetch || w.rmw_lock {
            return Err(VmeError::configuration(
                "Tsi148 inbound windows have no write-post, prefetch or RMW lock control",
            ));
        }
        if w.sst_rate.is_some() && !is_sst(w.protocol) {
            return Err(VmeError::configuration(format!(
                "2eSST rate given for a {} window",
                w.protocol
            )));
        }
        let space = reg::inbound_space(w.space).ok_or(VmeError::UnsupportedAddressSpace {
            space: w.space,
            variant: ChipVariant::Tsi148,
        })?;
        let granularity = reg::inbound_granularity(w.space).ok_or(
            VmeError::UnsupportedAddressSpace {
                space: w.space,
                variant: ChipVariant::Tsi148,
            },
        )?;

        let mut attr = (space << itat::AS_SHIFT)
            | reg::inbound_protocol_bits(w.protocol)
            | reg::inbound_sst_bits(w.sst_rate)
            | reg::fifo_size_bits(w.prefetch_size)
            | reg::access_bits(w.access);
        if w.prefetch_threshold {
            attr |= itat::TH;
        }

        self.regs.write(base + it::AT, 0)?;
        self.write64(base + it::SAU, base + it::SAL, w.vme_base)?;
        self.write64(
            base + it::EAU,
            base + it::EAL,
            w.vme_base + w.size - granularity,
        )?;
        self.write64(
            base + it::OFU,
            base + it::OFL,
            w.pci_base.wrapping_sub(w.vme_base),
        )?;
        self.regs.write(base + it::AT, attr)?;
        self.regs.write(base + it::AT, attr | itat::EN)
    }

    fn read_inbound(&self, index: usize) -> Result<InboundWindow> {
        let base = reg::inbound(index);
        let at = self.regs.read(base + it::AT)?;
        let space = reg::space_from_inbound(at >> itat::AS_SHIFT);
        let (Some(space), Some(granularity)) =
            (space, space.and_then(reg::inbound_granularity))
        else {
            if at & itat::EN == 0 {
                return Ok(InboundWindow {
                    enabled: false,
                    ..InboundWindow::new(index, 0, 0, 0, AddressSpace::A32)
                });
            }
            return Err(VmeError::hardware_mismatch(format!(
                "ITAT{index} has a reserved address space: {at:#010x}"
            )));
        };
        let start = self.read64(base + it::SAU, base + it::SAL)?;
        let end = self.read64(base + it::EAU, base + it::EAL)?;
        let offset = self.read64(base + it::OFU, base + it::OFL)?;

        let protocol = reg::inbound_protocol(at);
        let sst_rate = is_sst(protocol).then(|| match (at >> itat::SST_SHIFT) & 3 {
            1 => SstRate::Mb267,
            2 => SstRate::Mb320,
            _ => SstRate::Mb160,
        });

        Ok(InboundWindow {
            index,
            enabled: at & itat::EN != 0,
            vme_base: start,
            size: (end + granularity).wrapping_sub(start),
            pci_base: start.wrapping_add(offset),
            space,
            protocol,
            sst_rate,
            access: reg::access_from_bits(at),
            write_post: false,
            prefetch: false,
            prefetch_size: 64 << ((at >> itat::VFS_SHIFT) & 3),
            prefetch_threshold: at & itat::TH != 0,
            rmw_lock: false,
        })
    }

    // ── DMA ──────────────────────────────────────────────────────────────

    fn descriptor_size(&self) -> usize {
        descriptor::SIZE
    }

    fn max_descriptor_bytes(&self) -> u32 {
        MAX_DESCRIPTOR_BYTES
    }

    fn validate_segment(&self, segment: &ResolvedSegment) -> Result<()> {
        if segment.length == 0 || segment.length > MAX_DESCRIPTOR_BYTES {
            return Err(VmeError::configuration(format!(
                "Tsi148 DMA byte count {:#x} out of range 1-{MAX_DESCRIPTOR_BYTES:#x}",
                segment.length
            )));
        }
        if matches!(segment.destination, BusEndpoint::Pattern(_)) {
            return Err(VmeError::configuration(
                "A DMA pattern can only be a source",
            ));
        }
        for endpoint in [segment.source, segment.destination] {
            if let BusEndpoint::Vme { address, attrs } = endpoint {
                check_vme_range(address, &attrs, segment.length)?;
            }
        }
        Ok(())
    }

    fn encode_descriptor(
        &self,
        segment: &ResolvedSegment,
        next: Option<u64>,
        out: &mut [u8],
    ) -> Result<()> {
        let (next_hi, next_lo) = match next {
            Some(addr) if addr % 8 == 0 => split64(addr),
            Some(addr) => {
                return Err(VmeError::configuration(format!(
                    "Descriptor {addr:#x} not 8-byte aligned"
                )))
            }
            None => (0, descriptor::LLA),
        };
        let (src_hi, src_lo, src_attr) = endpoint_words(segment.source);
        let (dst_hi, dst_lo, dst_attr) = endpoint_words(segment.destination);

        let mut words = [0u32; descriptor::SIZE / 4];
        words[descriptor::DSAU] = src_hi;
        words[descriptor::DSAL] = src_lo;
        words[descriptor::DDAU] = dst_hi;
        words[descriptor::DDAL] = dst_lo;
        words[descriptor::DSAT] = src_attr;
        words[descriptor::DDAT] = dst_attr;
        words[descriptor::DNLAU] = next_hi;
        words[descriptor::DNLAL] = next_lo;
        words[descriptor::DCNT] = segment.length;
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
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
        check_channel(channel)?;
        let base = reg::dma(channel);
        let mut dctl = (reg::block_size_code(tuning.max_vme_block) << reg::dctl::VBKS_SHIFT)
            | (reg::backoff_code(tuning.vme_backoff_us) << reg::dctl::VBOT_SHIFT)
            | (reg::block_size_code(tuning.max_pci_block) << reg::dctl::PBKS_SHIFT)
            | (reg::backoff_code(tuning.pci_backoff_us) << reg::dctl::PBOT_SHIFT);

        match start {
            DmaStart::Direct(segment) => {
                let (src_hi, src_lo, src_attr) = endpoint_words(segment.source);
                let (dst_hi, dst_lo, dst_attr) = endpoint_words(segment.destination);
                self.regs.write(base + dma_reg::DSAU, src_hi)?;
                self.regs.write(base + dma_reg::DSAL, src_lo)?;
                self.regs.write(base + dma_reg::DDAU, dst_hi)?;
                self.regs.write(base + dma_reg::DDAL, dst_lo)?;
                self.regs.write(base + dma_reg::DSAT, src_attr)?;
                self.regs.write(base + dma_reg::DDAT, dst_attr)?;
                self.regs.write(base + dma_reg::DCNT, segment.length)?;
                self.regs.write(base + dma_reg::DDBS, 0)?;
                dctl |= reg::dctl::MOD;
            }
            DmaStart::Chained { head } => {
                self.write64(base + dma_reg::DNLAU, base + dma_reg::DNLAL, head)?;
            }
        }

        self.regs.write(base + dma_reg::DCTL, dctl)?;
        let tick = ticks.now();
        self.regs.write(base + dma_reg::DCTL, dctl | reg::dctl::DGO)?;
        Ok(tick)
    }

    fn dma_status(&self, channel: usize) -> Result<DmaStatus> {
        check_channel(channel)?;
        let raw = self.regs.read(reg::dma(channel) + dma_reg::DSTA)?;
        Ok(DmaStatus {
            raw,
            busy: raw & dsta::BSY != 0,
            done: raw & dsta::DON != 0,
            error: raw & dsta::ERRORS != 0,
            aborted: raw & dsta::ABT != 0,
        })
    }

    fn dma_snapshot(&self, channel: usize) -> Result<DmaSnapshot> {
        check_channel(channel)?;
        let base = reg::dma(channel);
        Ok(DmaSnapshot {
            descriptor: self.read64(base + dma_reg::DCLAU, base + dma_reg::DCLAL)?,
            control: self.regs.read(base + dma_reg::DCTL)?,
            count: self.regs.read(base + dma_reg::DCNT)?,
            source: self.read64(base + dma_reg::DCSAU, base + dma_reg::DCSAL)?,
            destination: self.read64(base + dma_reg::DCDAU, base + dma_reg::DCDAL)?,
        })
    }

    fn abort_dma(&self, channel: usize) -> Result<()> {
        check_channel(channel)?;
        self.regs
            .modify(reg::dma(channel) + dma_reg::DCTL, !reg::dctl::DGO, reg::dctl::ABT)?;
        Ok(())
    }

    fn clear_dma(&self, channel: usize) -> Result<()> {
        // DSTA clears itself when DGO is next set
        check_channel(channel)
    }

    // ── Interrupts ───────────────────────────────────────────────────────

    #[allow(clippy::cast_possible_truncation)]
    fn take_pending(&self) -> Result<PendingInterrupts> {
        let enable = self.regs.read(reg::INTEO)?;
        let stat = self.regs.read(reg::INTS)? & enable;
        if stat == 0 {
            return Ok(PendingInterrupts::default());
        }

        let mut pending = PendingInterrupts {
            dma: ((stat & int::DMA) >> int::DMA_SHIFT) as u8,
            mailbox: ((stat & int::MBOX) >> 16) as u8,
            location_monitor: ((stat & int::LM) >> int::LM_SHIFT) as u8,
            sysfail: stat & int::SYSFL != 0,
            acfail: stat & int::ACFL != 0,
            ..PendingInterrupts::default()
        };
        for level in (1..=7u8).rev() {
            if stat & (1 << level) != 0 {
                let vector = self.regs.read(reg::viack(level))? & 0xFF;
                pending.vme[usize::from(level)] = Some(vector as u8);
            }
        }
        self.regs.write(reg::INTC, stat)?;

        // The log stays latched for whoever made the faulting access
        if stat & (int::PERR | int::VERR) != 0 {
            pending.bus_error = self.check_bus_error(false)?;
        }
        Ok(pending)
    }

    fn raise_vme_irq(&self, level: u8, vector: u8) -> Result<()> {
        check_irq_level(level)?;
        self.regs.write(
            reg::VICR,
            (u32::from(level) << vicr::IRQL_SHIFT) | u32::from(vector),
        )
    }

    fn vme_irq_pending(&self) -> Result<bool> {
        Ok(self.regs.read(reg::VICR)? & vicr::IRQS != 0)
    }

    fn release_vme_irq(&self) -> Result<()> {
        if self.vme_irq_pending()? {
            self.regs.write(reg::VICR, vicr::IRQC)?;
        }
        Ok(())
    }

    fn trigger_mailbox(&self) -> Result<()> {
        self.regs.write(reg::gcsr_mbox(0), 1)
    }

    fn setup_location_monitor(
        &self,
        address: u64,
        space: AddressSpace,
        access: AccessFilter,
    ) -> Result<()> {
        let field = reg::inbound_space(space).ok_or(VmeError::UnsupportedAddressSpace {
            space,
            variant: ChipVariant::Tsi148,
        })?;
        if address % LM_ALIGN != 0 {
            return Err(VmeError::configuration(format!(
                "Location monitor base {address:#x} not 32-byte aligned"
            )));
        }
        self.regs.write(reg::LMAT, 0)?;
        self.write64(reg::LMBAU, reg::LMBAL, address)?;
        self.regs
            .write(reg::LMAT, lmat::EN | (field << 4) | reg::access_bits(access))
    }

    fn disable_location_monitor(&self) -> Result<()> {
        self.regs.write(reg::LMAT, 0)
    }

    // ── RMW ──────────────────────────────────────────────────────────────

    fn arm_rmw(&self, pci_address: u64, enable: u32, compare: u32, swap: u32) -> Result<()> {
        self.regs.modify(reg::VMCTRL, !vmctrl::RMWEN, 0)?;
        self.regs.write(reg::RMWEN, enable)?;
        self.regs.write(reg::RMWC, compare)?;
        self.regs.write(reg::RMWS, swap)?;
        self.write64(reg::RMWAU, reg::RMWAL, pci_address)?;
        self.regs.modify(reg::VMCTRL, !0, vmctrl::RMWEN)?;
        Ok(())
    }

    fn disarm_rmw(&self) -> Result<()> {
        self.regs.modify(reg::VMCTRL, !vmctrl::RMWEN, 0)?;
        Ok(())
    }

    // ── Arbiter / requester ──────────────────────────────────────────────

    fn set_arbiter(&self, config: &ArbiterConfig) -> Result<()> {
        let value = encode_tsi148_arbiter(self.regs.read(reg::VCTRL)?, config)?;
        self.regs.write(reg::VCTRL, value)
    }

    fn arbiter(&self) -> Result<ArbiterConfig> {
        Ok(decode_tsi148_arbiter(self.regs.read(reg::VCTRL)?))
    }

    fn set_requester(&self, config: &RequesterConfig) -> Result<()> {
        let value = encode_tsi148_requester(self.regs.read(reg::VMCTRL)?, config)?;
        self.regs.write(reg::VMCTRL, value)
    }

    fn requester(&self) -> Result<RequesterConfig> {
        Ok(decode_tsi148_requester(self.regs.read(reg::VMCTRL)?))
    }
}
