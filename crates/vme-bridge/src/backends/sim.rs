//! Behavioural model of both bridges
//!
//! [`SimulatedBridge`] sits behind every platform trait at once so the
//! driver can run end to end on a machine without a VME crate. It models
//! the parts of the chips the driver depends on:
//!
//! - register side effects (write-one-to-clear status, self-clearing reset
//!   bits, the slot-role strap, the PCI ID)
//! - outbound window decode into a sparse VME memory, with bus errors for
//!   undecoded or faulting addresses
//! - the RMW latch on the next read of the armed address
//! - DMA in direct and chained mode, reading the chains from host memory
//!   through the same bus addresses the driver hands out
//! - the interrupt line, asserted while any enabled status bit is set
//!
//! Byte order follows the silicon: registers the real chip presents
//! little-endian are little-endian here too.
//!
//! The test hooks (`hold_dma`, `assert_vme_irq`, `add_bus_fault`...) play
//! the part of the rest of the VME crate.

use crate::bus::{check_bounds, ByteOrder, RegisterBus};
use crate::chip::{join64, split64};
use crate::error::{BusSide, Result, VmeError};
use crate::platform::{BusMemory, DmaMemory, InterruptLine, MappedWindow};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use vme_chip::attr::AddressSpace;
use vme_chip::pcie::{ChipVariant, CONTROL_REGION_SIZE, TUNDRA_VENDOR_ID, UNIVERSE_PCI_CLASS};
use vme_chip::tsi148 as t;
use vme_chip::universe as u;
use vme_chip::PAGE_SIZE;

/// First fake bus address handed out for host memory
const BUS_BASE: u64 = 0x4000_0000;

/// Longest descriptor chain followed before the engine gives up
const MAX_CHAIN: usize = 1 << 16;

/// Address offsets of the four location monitors
const LM_STRIDE: u64 = 8;

type VmePage = Box<[u8; PAGE_SIZE]>;

// ── State ────────────────────────────────────────────────────────────────

struct SimState {
    variant: ChipVariant,
    system_controller: bool,
    /// Registers in host order
    regs: HashMap<usize, u32>,
    vme: HashMap<(AddressSpace, u64), VmePage>,
    faults: Vec<(AddressSpace, u64, u64)>,
    bus_to_virt: HashMap<u64, usize>,
    virt_to_bus: HashMap<usize, u64>,
    hold_dma: bool,
    held: Vec<usize>,
    dma_error: bool,
    auto_ack: bool,
    broken: HashSet<usize>,
    generated: Vec<(u8, u8)>,
    writes: u64,
    resets: u32,
    line_masked: bool,
}

impl fmt::Debug for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimState")
            .field("variant", &self.variant)
            .field("system_controller", &self.system_controller)
            .field("vme_pages", &self.vme.len())
            .field("held", &self.held)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

impl SimState {
    fn new(variant: ChipVariant, system_controller: bool) -> Self {
        let device = match variant {
            ChipVariant::Universe => vme_chip::pcie::device_id::CA91C042,
            ChipVariant::Tsi148 => vme_chip::pcie::device_id::TSI148,
            ChipVariant::Unknown(id) => id,
        };
        let mut state = Self {
            variant,
            system_controller,
            regs: HashMap::new(),
            vme: HashMap::new(),
            faults: Vec::new(),
            bus_to_virt: HashMap::new(),
            virt_to_bus: HashMap::new(),
            hold_dma: false,
            held: Vec::new(),
            dma_error: false,
            auto_ack: true,
            broken: HashSet::new(),
            generated: Vec::new(),
            writes: 0,
            resets: 0,
            line_masked: false,
        };
        state.set(0, (u32::from(device) << 16) | u32::from(TUNDRA_VENDOR_ID));
        match variant {
            ChipVariant::Tsi148 => {
                if system_controller {
                    state.set(t::VSTAT, t::vstat::SCONS);
                }
            }
            _ => {
                state.set(u::PCI_CLASS, UNIVERSE_PCI_CLASS);
                if system_controller {
                    state.set(u::MISC_CTL, u::misc_ctl::SYSCON);
                }
            }
        }
        state
    }

    fn is_tsi148(&self) -> bool {
        self.variant == ChipVariant::Tsi148
    }

    fn get(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn set(&mut self, offset: usize, value: u32) {
        self.regs.insert(offset, value);
    }

    fn get64(&self, upper: usize, lower: usize) -> u64 {
        join64(self.get(upper), self.get(lower))
    }

    fn set64(&mut self, upper: usize, lower: usize, value: u64) {
        let (hi, lo) = split64(value);
        self.set(upper, hi);
        self.set(lower, lo);
    }

    /// Latch interrupt status bits
    fn raise(&mut self, bits: u32) {
        if self.is_tsi148() {
            let latched = bits & self.get(t::INTEN);
            self.set(t::INTS, self.get(t::INTS) | latched);
        } else {
            self.set(u::LINT_STAT, self.get(u::LINT_STAT) | bits);
        }
    }

    fn asserted(&self) -> bool {
        if self.is_tsi148() {
            self.get(t::INTS) & self.get(t::INTEO) != 0
        } else {
            self.get(u::LINT_STAT) & self.get(u::LINT_EN) != 0
        }
    }

    // ── Register side effects ────────────────────────────────────────────

    fn read_reg(&mut self, offset: usize) -> u32 {
        if self.is_tsi148() && (t::viack(1)..=t::viack(7)).contains(&offset) {
            // IACK cycle: reading the vector drops the level's status
            let level = (offset - t::viack(0)) / 4;
            self.set(t::INTS, self.get(t::INTS) & !(1 << level));
        }
        self.get(offset)
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        if self.is_tsi148() {
            self.write_tsi148(offset, value);
        } else {
            self.write_universe(offset, value);
        }
    }

    fn write_universe(&mut self, offset: usize, value: u32) {
        match offset {
            u::PCI_ID | u::PCI_CLASS => {}
            u::PCI_CSR => {
                let kept = self.get(offset) & u::pci_csr::S_TA & !value;
                self.set(offset, (value & !u::pci_csr::S_TA) | kept);
            }
            u::L_CMDERR => {
                let kept = self.get(offset) & !(value & u::L_CMDERR_CLEAR);
                self.set(offset, kept);
            }
            u::LINT_STAT => self.set(offset, self.get(offset) & !value),
            u::MISC_CTL => {
                if value & u::misc_ctl::SW_SYSRST != 0 {
                    self.resets += 1;
                }
                let mut next = value & !(u::misc_ctl::SW_SYSRST | u::misc_ctl::SYSCON);
                if self.system_controller {
                    next |= u::misc_ctl::SYSCON;
                }
                self.set(offset, next);
            }
            u::DGCS => self.write_dgcs(value),
            u::VINT_EN => {
                self.set(offset, value);
                let levels = value & 0xFE00_0000;
                if levels != 0 {
                    let level = (31 - levels.leading_zeros() - 24) as u8;
                    let vector = (self.get(u::STATID) >> 24) as u8;
                    self.generated.push((level, vector));
                }
                let stat = if self.auto_ack { 0 } else { levels };
                self.set(u::VINT_STAT, stat);
            }
            u::VINT_STAT => self.set(offset, self.get(offset) & !value),
            o if (u::mbox(0)..=u::mbox(3)).contains(&o) => {
                self.set(o, value);
                self.raise(1 << (16 + (o - u::mbox(0)) / 4));
            }
            _ => self.set(offset, value),
        }
    }

    fn write_dgcs(&mut self, value: u32) {
        use u::dgcs;
        let old = self.get(u::DGCS);
        let status = dgcs::STOP | dgcs::HALT | dgcs::DONE | dgcs::ERRORS;
        let control = value & !(status | dgcs::ACT | dgcs::GO | dgcs::STOP_REQ | dgcs::HALT_REQ);
        let kept = old & (status | dgcs::ACT) & !(value & status);
        self.set(u::DGCS, control | kept);

        let busy = old & dgcs::ACT != 0;
        if value & dgcs::STOP_REQ != 0 && busy {
            self.abort_channel(0);
        } else if value & dgcs::GO != 0 && !busy {
            self.set(u::DGCS, self.get(u::DGCS) | dgcs::ACT);
            self.start_channel(0);
        }
    }

    fn write_tsi148(&mut self, offset: usize, value: u32) {
        match offset {
            t::PCI_ID | t::VSTAT | t::PSTAT => {}
            t::INTC => self.set(t::INTS, self.get(t::INTS) & !value),
            t::VEAT | t::EDPAT => {
                if value & t::exception::CLEAR != 0 {
                    self.set(offset, 0);
                }
            }
            t::VCTRL => {
                if value & t::vctrl::SRESET != 0 {
                    self.resets += 1;
                }
                self.set(offset, value & !t::vctrl::SRESET);
            }
            t::VICR => {
                if value & t::vicr::IRQC != 0 {
                    self.set(offset, self.get(offset) & !(t::vicr::IRQS | t::vicr::IRQC));
                    return;
                }
                let mut next = value & 0x7FF;
                let level = ((value >> t::vicr::IRQL_SHIFT) & 7) as u8;
                if level != 0 {
                    self.generated
                        .push((level, (value & t::vicr::STID_MASK) as u8));
                    if !self.auto_ack {
                        next |= t::vicr::IRQS;
                    }
                }
                self.set(offset, next);
            }
            o if (t::gcsr_mbox(0)..=t::gcsr_mbox(3)).contains(&o) => {
                self.set(o, value);
                self.raise(1 << (16 + (o - t::gcsr_mbox(0)) / 4));
            }
            o if (t::dma(0)..t::dma(t::DMA_CHANNELS)).contains(&o) => {
                let channel = (o - t::dma(0)) / (t::dma(1) - t::dma(0));
                match o - t::dma(channel) {
                    t::dma_reg::DCTL => self.write_dctl(channel, value),
                    t::dma_reg::DSTA => {}
                    _ => self.set(o, value),
                }
            }
            _ => self.set(offset, value),
        }
    }

    fn write_dctl(&mut self, channel: usize, value: u32) {
        use t::{dctl, dsta};
        let base = t::dma(channel);
        self.set(base + t::dma_reg::DCTL, value & !(dctl::DGO | dctl::ABT));
        let busy = self.get(base + t::dma_reg::DSTA) & dsta::BSY != 0;
        if value & dctl::ABT != 0 && busy {
            self.abort_channel(channel);
        } else if value & dctl::DGO != 0 && !busy {
            self.set(base + t::dma_reg::DSTA, dsta::BSY);
            self.start_channel(channel);
        }
    }

    // ── DMA engine ───────────────────────────────────────────────────────

    fn start_channel(&mut self, channel: usize) {
        if self.hold_dma {
            tracing::trace!("Sim DMA{channel} held");
            self.held.push(channel);
        } else {
            self.run_channel(channel);
        }
    }

    fn run_channel(&mut self, channel: usize) {
        let mut result = if self.is_tsi148() {
            self.run_tsi148(channel)
        } else {
            self.run_universe()
        };
        if std::mem::take(&mut self.dma_error) {
            result = Err(BusSide::Vme);
        }
        tracing::debug!("Sim DMA{channel} finished: {result:?}");

        if self.is_tsi148() {
            let status = match result {
                Ok(()) => t::dsta::DON,
                Err(_) => t::dsta::VBE,
            };
            self.set(t::dma(channel) + t::dma_reg::DSTA, status);
            self.raise(1 << (t::int::DMA_SHIFT + channel as u32));
        } else {
            let status = match result {
                Ok(()) => u::dgcs::DONE,
                Err(BusSide::Pci) => u::dgcs::LERR,
                Err(BusSide::Vme) => u::dgcs::VERR,
            };
            let dgcs = self.get(u::DGCS) & !u::dgcs::ACT;
            self.set(u::DGCS, dgcs | status);
            self.raise(u::lint::DMA);
        }
    }

    fn abort_channel(&mut self, channel: usize) {
        self.held.retain(|&c| c != channel);
        if self.is_tsi148() {
            self.set(t::dma(channel) + t::dma_reg::DSTA, t::dsta::ABT);
            self.raise(1 << (t::int::DMA_SHIFT + channel as u32));
        } else {
            let dgcs = self.get(u::DGCS) & !u::dgcs::ACT;
            self.set(u::DGCS, dgcs | u::dgcs::STOP);
            self.raise(u::lint::DMA);
        }
    }

    fn run_universe(&mut self) -> std::result::Result<(), BusSide> {
        if self.get(u::DGCS) & u::dgcs::CHAIN == 0 {
            let (ctl, count) = (self.get(u::DCTL), self.get(u::DTBC));
            let (pci, vme) = (self.get(u::DLA), self.get(u::DVA));
            return self.universe_packet(ctl, count, pci, vme);
        }

        let mut next = u64::from(self.get(u::DCPP));
        for _ in 0..MAX_CHAIN {
            let mut raw = [0u8; u::packet::SIZE];
            self.host_read(next, &mut raw)?;
            let word = |i: usize| {
                u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]])
            };
            #[allow(clippy::cast_possible_truncation)]
            self.set(u::DCPP, next as u32);
            self.universe_packet(
                word(u::packet::DCTL),
                word(u::packet::DTBC),
                word(u::packet::DLV),
                word(u::packet::DVA),
            )?;
            let link = word(u::packet::DCPP);
            if link & u::packet::END != 0 {
                return Ok(());
            }
            next = u64::from(link & !0x1F);
        }
        Err(BusSide::Pci)
    }

    fn universe_packet(
        &mut self,
        ctl: u32,
        count: u32,
        pci: u32,
        vme: u32,
    ) -> std::result::Result<(), BusSide> {
        let space = u::space_from_vas(ctl >> u::dctl::VAS_SHIFT).ok_or(BusSide::Vme)?;
        let mut data = vec![0u8; count as usize];
        if ctl & u::dctl::L2V != 0 {
            self.host_read(pci.into(), &mut data)?;
            self.vme_store(space, vme.into(), &data)?;
        } else {
            self.vme_load(space, vme.into(), &mut data)?;
            self.host_write(pci.into(), &data)?;
        }
        self.set(u::DTBC, 0);
        Ok(())
    }

    fn run_tsi148(&mut self, channel: usize) -> std::result::Result<(), BusSide> {
        use t::dma_reg as r;
        let base = t::dma(channel);
        if self.get(base + r::DCTL) & t::dctl::MOD != 0 {
            let step = TsiStep {
                source: self.get64(base + r::DSAU, base + r::DSAL),
                destination: self.get64(base + r::DDAU, base + r::DDAL),
                source_attr: self.get(base + r::DSAT),
                destination_attr: self.get(base + r::DDAT),
                count: self.get(base + r::DCNT),
            };
            return self.tsi148_step(channel, &step);
        }

        let mut next = self.get64(base + r::DNLAU, base + r::DNLAL);
        for _ in 0..MAX_CHAIN {
            let mut raw = [0u8; t::descriptor::SIZE];
            self.host_read(next, &mut raw)?;
            let word = |i: usize| {
                u32::from_be_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]])
            };
            use t::descriptor as d;
            self.set64(base + r::DCLAU, base + r::DCLAL, next);
            let step = TsiStep {
                source: join64(word(d::DSAU), word(d::DSAL)),
                destination: join64(word(d::DDAU), word(d::DDAL)),
                source_attr: word(d::DSAT),
                destination_attr: word(d::DDAT),
                count: word(d::DCNT),
            };
            self.tsi148_step(channel, &step)?;
            let link = word(d::DNLAL);
            if link & d::LLA != 0 {
                return Ok(());
            }
            next = join64(word(d::DNLAU), link & !0x7);
        }
        Err(BusSide::Pci)
    }

    fn tsi148_step(&mut self, channel: usize, step: &TsiStep) -> std::result::Result<(), BusSide> {
        use t::dma_reg as r;
        let base = t::dma(channel);
        self.set64(base + r::DCSAU, base + r::DCSAL, step.source);
        self.set64(base + r::DCDAU, base + r::DCDAL, step.destination);

        let count = step.count as usize;
        let data = match step.source_attr & t::dsat::TYPE_MASK {
            t::dsat::PCI => {
                let mut data = vec![0u8; count];
                self.host_read(step.source, &mut data)?;
                data
            }
            t::dsat::VME => {
                let attrs = t::decode_attribute_word(step.source_attr).ok_or(BusSide::Vme)?;
                let mut data = vec![0u8; count];
                self.vme_load(attrs.space, step.source, &mut data)?;
                data
            }
            #[allow(clippy::cast_possible_truncation)]
            _ => fill_pattern(step.source_attr, step.source as u32, count),
        };
        match step.destination_attr & t::dsat::TYPE_MASK {
            t::dsat::PCI => self.host_write(step.destination, &data)?,
            t::dsat::VME => {
                let attrs = t::decode_attribute_word(step.destination_attr).ok_or(BusSide::Vme)?;
                self.vme_store(attrs.space, step.destination, &data)?;
            }
            _ => return Err(BusSide::Vme),
        }
        self.set(base + r::DCNT, 0);
        Ok(())
    }

    // ── Host memory ──────────────────────────────────────────────────────

    fn host_ptr(&self, bus: u64) -> Option<*mut u8> {
        let page = PAGE_SIZE as u64;
        let virt_page = *self.bus_to_virt.get(&(bus / page))?;
        Some((virt_page * PAGE_SIZE + (bus % page) as usize) as *mut u8)
    }

    /// Walk `len` bytes from `bus` in page-sized pieces
    fn host_pieces(
        &self,
        bus: u64,
        len: usize,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> std::result::Result<(), BusSide> {
        let mut done = 0;
        while done < len {
            let address = bus + done as u64;
            let n = (PAGE_SIZE - (address % PAGE_SIZE as u64) as usize).min(len - done);
            let ptr = self.host_ptr(address).ok_or(BusSide::Pci)?;
            f(ptr, done, n);
            done += n;
        }
        Ok(())
    }

    fn host_read(&self, bus: u64, out: &mut [u8]) -> std::result::Result<(), BusSide> {
        let len = out.len();
        self.host_pieces(bus, len, |ptr, at, n| {
            // SAFETY: `ptr` lies in a page the driver translated through
            // `DmaMemory::bus_address`, which it keeps allocated and pinned
            // while a transfer referencing it runs; `n` stays inside the page.
            unsafe { std::ptr::copy_nonoverlapping(ptr, out[at..].as_mut_ptr(), n) };
        })
    }

    fn host_write(&self, bus: u64, data: &[u8]) -> std::result::Result<(), BusSide> {
        self.host_pieces(bus, data.len(), |ptr, at, n| {
            // SAFETY: as in `host_read`; the driver does not touch a buffer
            // while the engine owns it.
            unsafe { std::ptr::copy_nonoverlapping(data[at..].as_ptr(), ptr, n) };
        })
    }

    fn bus_address(&mut self, vaddr: usize) -> Result<u64> {
        let virt_page = vaddr / PAGE_SIZE;
        let page = PAGE_SIZE as u64;
        let bus_page = if let Some(&bus_page) = self.virt_to_bus.get(&virt_page) {
            bus_page
        } else {
            let bus_page = BUS_BASE / page + self.virt_to_bus.len() as u64;
            if (bus_page + 1) * page > 1 << 32 {
                return Err(VmeError::configuration(
                    "Simulated bus address space exhausted",
                ));
            }
            self.virt_to_bus.insert(virt_page, bus_page);
            self.bus_to_virt.insert(bus_page, virt_page);
            bus_page
        };
        Ok(bus_page * page + (vaddr % PAGE_SIZE) as u64)
    }

    // ── VME memory ───────────────────────────────────────────────────────

    fn faults_at(&self, space: AddressSpace, address: u64, len: usize) -> Option<u64> {
        let end = address.saturating_add(len as u64);
        self.faults
            .iter()
            .find(|&&(s, start, stop)| s == space && address < stop && start < end)
            .map(|&(_, start, _)| start.max(address))
    }

    fn vme_load(
        &self,
        space: AddressSpace,
        address: u64,
        out: &mut [u8],
    ) -> std::result::Result<(), BusSide> {
        if self.faults_at(space, address, out.len()).is_some() {
            return Err(BusSide::Vme);
        }
        let mask = space.address_mask();
        for (i, byte) in out.iter_mut().enumerate() {
            let a = address.wrapping_add(i as u64) & mask;
            let page = a / PAGE_SIZE as u64;
            *byte = self
                .vme
                .get(&(space, page))
                .map_or(0, |p| p[(a % PAGE_SIZE as u64) as usize]);
        }
        Ok(())
    }

    fn vme_store(
        &mut self,
        space: AddressSpace,
        address: u64,
        data: &[u8],
    ) -> std::result::Result<(), BusSide> {
        if self.faults_at(space, address, data.len()).is_some() {
            return Err(BusSide::Vme);
        }
        let mask = space.address_mask();
        for (i, &byte) in data.iter().enumerate() {
            let a = address.wrapping_add(i as u64) & mask;
            let page = self
                .vme
                .entry((space, a / PAGE_SIZE as u64))
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[(a % PAGE_SIZE as u64) as usize] = byte;
        }
        Ok(())
    }

    // ── Outbound decode ──────────────────────────────────────────────────

    /// Map a PCI address through the enabled outbound windows:
    /// (space, VME address, bytes left in the window)
    fn decode(&self, pci: u64) -> Option<(AddressSpace, u64, u64)> {
        let hit = if self.is_tsi148() {
            (0..t::OUTBOUND_COUNT).find_map(|i| {
                let w = t::outbound(i);
                let at = self.get(w + t::ot::AT);
                if at & t::otat::EN == 0 {
                    return None;
                }
                let start = self.get64(w + t::ot::SAU, w + t::ot::SAL);
                let end = self.get64(w + t::ot::EAU, w + t::ot::EAL) + t::OUTBOUND_ALIGN;
                let offset = self.get64(w + t::ot::OFU, w + t::ot::OFL);
                let space = t::decode_attribute_word(at)?.space;
                (start..end)
                    .contains(&pci)
                    .then(|| (space, pci.wrapping_add(offset), end - pci))
            })
        } else {
            (0..u::LSI_COUNT).find_map(|i| {
                let w = u::lsi(i);
                let ctl = self.get(w + u::image::CTL);
                if ctl & u::lsi_ctl::EN == 0 {
                    return None;
                }
                let start = u64::from(self.get(w + u::image::BS));
                let end = u64::from(self.get(w + u::image::BD));
                let offset = self.get(w + u::image::TO);
                let space = u::space_from_vas(ctl >> u::lsi_ctl::VAS_SHIFT)?;
                #[allow(clippy::cast_possible_truncation)]
                let vme = u64::from((pci as u32).wrapping_add(offset));
                (start..end).contains(&pci).then(|| (space, vme, end - pci))
            })
        };
        hit.map(|(space, vme, left)| (space, vme & space.address_mask(), left))
    }

    fn latch_bus_error(&mut self, side: BusSide, address: u64) {
        tracing::debug!("Sim {side} bus error at {address:#x}");
        if self.is_tsi148() {
            let (upper, lower, attr, bit) = match side {
                BusSide::Vme => (t::VEAU, t::VEAL, t::VEAT, t::int::VERR),
                BusSide::Pci => (t::EDPAU, t::EDPAL, t::EDPAT, t::int::PERR),
            };
            if self.get(attr) & t::exception::VALID == 0 {
                self.set64(upper, lower, address);
                self.set(attr, t::exception::VALID);
            }
            self.raise(bit);
        } else {
            match side {
                BusSide::Vme => {
                    self.set(u::PCI_CSR, self.get(u::PCI_CSR) | u::pci_csr::S_TA);
                    self.raise(u::lint::VERR);
                }
                BusSide::Pci => {
                    self.set(u::L_CMDERR, self.get(u::L_CMDERR) | u::L_CMDERR_CLEAR);
                    self.raise(u::lint::LERR);
                }
            }
        }
    }

    /// Armed RMW latch for `pci`: (enable, compare, swap) in host order
    fn rmw_latch(&self, pci: u64) -> Option<(u32, u32, u32)> {
        if self.is_tsi148() {
            let armed = self.get(t::VMCTRL) & t::vmctrl::RMWEN != 0
                && self.get64(t::RMWAU, t::RMWAL) == pci;
            armed.then(|| (self.get(t::RMWEN), self.get(t::RMWC), self.get(t::RMWS)))
        } else {
            let armed = self.get(u::SCYC_CTL) == u::scyc_ctl::RMW
                && u64::from(self.get(u::SCYC_ADDR)) == pci;
            armed.then(|| {
                (
                    self.get(u::SCYC_EN).swap_bytes(),
                    self.get(u::SCYC_CMP).swap_bytes(),
                    self.get(u::SCYC_SWP).swap_bytes(),
                )
            })
        }
    }

    fn window_load(&mut self, pci: u64, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let address = pci + done as u64;
            let Some((space, vme, left)) = self.decode(address) else {
                self.latch_bus_error(BusSide::Pci, address);
                out[done..].fill(0xFF);
                return;
            };
            let n = usize::try_from(left).map_or(out.len() - done, |l| l.min(out.len() - done));
            if self.vme_load(space, vme, &mut out[done..done + n]).is_err() {
                let at = self.faults_at(space, vme, n).unwrap_or(vme);
                self.latch_bus_error(BusSide::Vme, at);
                out[done..].fill(0xFF);
                return;
            }
            done += n;
        }
    }

    fn window_store(&mut self, pci: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let address = pci + done as u64;
            let Some((space, vme, left)) = self.decode(address) else {
                self.latch_bus_error(BusSide::Pci, address);
                return;
            };
            let n = usize::try_from(left).map_or(data.len() - done, |l| l.min(data.len() - done));
            if self.vme_store(space, vme, &data[done..done + n]).is_err() {
                let at = self.faults_at(space, vme, n).unwrap_or(vme);
                self.latch_bus_error(BusSide::Vme, at);
                return;
            }
            done += n;
        }
    }

    fn window_read32(&mut self, pci: u64) -> u32 {
        let mut raw = [0u8; 4];
        self.window_load(pci, &mut raw);
        let old = u32::from_ne_bytes(raw);
        match self.rmw_latch(pci) {
            Some((enable, compare, swap)) if (old & enable) == (compare & enable) => {
                let new = (old & !enable) | (swap & enable);
                self.window_store(pci, &new.to_ne_bytes());
                new
            }
            _ => old,
        }
    }

    fn touch_location_monitor(&mut self, space: AddressSpace, address: u64) -> bool {
        let (enabled, monitored, base) = if self.is_tsi148() {
            let lmat = self.get(t::LMAT);
            (
                lmat & t::lmat::EN != 0,
                t::space_from_inbound(lmat >> 4),
                self.get64(t::LMBAU, t::LMBAL),
            )
        } else {
            let ctl = self.get(u::LM_CTL);
            (
                ctl & u::lm_ctl::EN != 0,
                u::space_from_vas(ctl >> u::vsi_ctl::VAS_SHIFT),
                u64::from(self.get(u::LM_BS)),
            )
        };
        if !enabled || monitored != Some(space) || !(base..base + 4 * LM_STRIDE).contains(&address)
        {
            return false;
        }
        let monitor = (address - base) / LM_STRIDE;
        self.raise(1 << (20 + monitor));
        true
    }
}

/// One Tsi148 descriptor's worth of work
struct TsiStep {
    source: u64,
    destination: u64,
    source_attr: u32,
    destination_attr: u32,
    count: u32,
}

/// Bytes a Tsi148 pattern source produces
#[allow(clippy::cast_possible_truncation)]
fn fill_pattern(attr: u32, seed: u32, len: usize) -> Vec<u8> {
    match attr & (t::dsat::TYPE_MASK | 0x0300_0000) {
        t::dsat::PATTERN_BYTE => vec![seed as u8; len],
        t::dsat::PATTERN_BYTE_INC => (0..len).map(|i| (seed as u8).wrapping_add(i as u8)).collect(),
        t::dsat::PATTERN_WORD => seed.to_be_bytes().into_iter().cycle().take(len).collect(),
        _ => (0..len)
            .map(|i| seed.wrapping_add((i / 4) as u32).to_be_bytes()[i % 4])
            .collect(),
    }
}

// ── Public handle ────────────────────────────────────────────────────────

/// In-memory bridge, VME backplane and host DMA path
#[derive(Debug)]
pub struct SimulatedBridge {
    me: Weak<SimulatedBridge>,
    order: ByteOrder,
    state: Mutex<SimState>,
    line: Condvar,
}

impl SimulatedBridge {
    /// Bridge of `variant` in a slot with the given role
    ///
    /// An `Unknown` variant reports that device ID and nothing else.
    #[must_use]
    pub fn new(variant: ChipVariant, system_controller: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            order: ByteOrder::for_variant(variant),
            state: Mutex::new(SimState::new(variant, system_controller)),
            line: Condvar::new(),
        })
    }

    /// ca91c042 in the system-controller slot
    #[must_use]
    pub fn universe() -> Arc<Self> {
        Self::new(ChipVariant::Universe, true)
    }

    /// Tsi148 in the system-controller slot
    #[must_use]
    pub fn tsi148() -> Arc<Self> {
        Self::new(ChipVariant::Tsi148, true)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the state and wake anyone watching the line
    fn update<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let out = f(&mut self.state());
        self.line.notify_all();
        out
    }

    /// Simulated variant
    pub fn variant(&self) -> ChipVariant {
        self.state().variant
    }

    /// Queue DMA starts instead of running them
    pub fn hold_dma(&self, hold: bool) {
        self.state().hold_dma = hold;
    }

    /// Run every held channel now
    pub fn release_dma(&self) {
        self.update(|s| {
            s.hold_dma = false;
            for channel in std::mem::take(&mut s.held) {
                s.run_channel(channel);
            }
        });
    }

    /// Fail the next DMA with a VME bus error
    pub fn inject_dma_error(&self, fail: bool) {
        self.state().dma_error = fail;
    }

    /// Whether the interrupter drops its status on its own (default), or
    /// waits for [`SimulatedBridge::acknowledge_vme_irq`]
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state().auto_ack = auto_ack;
    }

    /// Another module's IACK cycle for the interrupt this bridge raised;
    /// returns the (level, vector) it carried
    pub fn acknowledge_vme_irq(&self) -> Option<(u8, u8)> {
        self.update(|s| {
            if s.is_tsi148() {
                let vicr = s.get(t::VICR);
                if vicr & t::vicr::IRQS == 0 {
                    return None;
                }
                s.set(t::VICR, vicr & !t::vicr::IRQS);
                let level = ((vicr >> t::vicr::IRQL_SHIFT) & 7) as u8;
                Some((level, (vicr & t::vicr::STID_MASK) as u8))
            } else {
                let stat = s.get(u::VINT_STAT);
                if stat == 0 {
                    return None;
                }
                s.set(u::VINT_STAT, 0);
                let level = (31 - stat.leading_zeros() - 24) as u8;
                Some((level, (s.get(u::STATID) >> 24) as u8))
            }
        })
    }

    /// Every (level, vector) this bridge has put on the backplane
    pub fn generated_irqs(&self) -> Vec<(u8, u8)> {
        self.state().generated.clone()
    }

    /// Another module interrupts at `level` and will answer IACK with `vector`
    pub fn assert_vme_irq(&self, level: u8, vector: u8) {
        self.update(|s| {
            let slot = if s.is_tsi148() {
                t::viack(level)
            } else {
                u::v_statid(level)
            };
            s.set(slot, u32::from(vector));
            s.raise(1 << level);
        });
    }

    /// Another master touches `address`; `true` if a monitor fired
    pub fn touch_location_monitor(&self, space: AddressSpace, address: u64) -> bool {
        self.update(|s| s.touch_location_monitor(space, address))
    }

    /// Latch a bus error as if an access had just failed
    pub fn inject_bus_error(&self, side: BusSide, address: u64) {
        self.update(|s| s.latch_bus_error(side, address));
    }

    /// Make `[start, start + len)` in `space` answer with BERR
    pub fn add_bus_fault(&self, space: AddressSpace, start: u64, len: u64) {
        self.state()
            .faults
            .push((space, start, start.saturating_add(len)));
    }

    /// Drop every write to register `offset`
    pub fn break_register(&self, offset: usize) {
        self.state().broken.insert(offset);
    }

    /// Register writes seen so far
    pub fn register_writes(&self) -> u64 {
        self.state().writes
    }

    /// Host-order value of a register, without side effects
    pub fn register(&self, offset: usize) -> u32 {
        self.state().get(offset)
    }

    /// SYSRESET pulses seen so far
    pub fn sys_resets(&self) -> u32 {
        self.state().resets
    }

    /// Read VME memory directly, as another master would
    ///
    /// # Errors
    ///
    /// Returns `BusError` for an address marked with [`SimulatedBridge::add_bus_fault`].
    pub fn vme_read(&self, space: AddressSpace, address: u64, out: &mut [u8]) -> Result<()> {
        self.state()
            .vme_load(space, address, out)
            .map_err(|side| VmeError::BusError {
                source_bus: side,
                address,
            })
    }

    /// Write VME memory directly, as another master would
    ///
    /// # Errors
    ///
    /// Returns `BusError` for an address marked with [`SimulatedBridge::add_bus_fault`].
    pub fn vme_write(&self, space: AddressSpace, address: u64, data: &[u8]) -> Result<()> {
        self.state()
            .vme_store(space, address, data)
            .map_err(|side| VmeError::BusError {
                source_bus: side,
                address,
            })
    }
}

impl RegisterBus for SimulatedBridge {
    fn read32(&self, offset: usize) -> Result<u32> {
        check_bounds(offset, 4, CONTROL_REGION_SIZE)?;
        let value = self.state().read_reg(offset);
        Ok(if self.order.converts(offset) {
            value.to_le()
        } else {
            value
        })
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, CONTROL_REGION_SIZE)?;
        let value = if self.order.converts(offset) {
            u32::from_le(value)
        } else {
            value
        };
        self.update(|s| {
            s.writes += 1;
            if !s.broken.contains(&offset) {
                s.write_reg(offset, value);
            }
        });
        Ok(())
    }

    fn size(&self) -> usize {
        CONTROL_REGION_SIZE
    }
}

impl BusMemory for SimulatedBridge {
    fn map(&self, pci_address: u64, size: usize) -> Result<Arc<dyn MappedWindow>> {
        let bridge = self
            .me
            .upgrade()
            .ok_or_else(|| VmeError::configuration("Simulated bridge is gone"))?;
        Ok(Arc::new(SimWindow {
            bridge,
            pci_base: pci_address,
            len: size,
        }))
    }
}

impl DmaMemory for SimulatedBridge {
    fn bus_address(&self, vaddr: usize) -> Result<u64> {
        self.state().bus_address(vaddr)
    }

    fn lock(&self, _ptr: *const u8, _len: usize) -> Result<()> {
        Ok(())
    }

    fn unlock(&self, _ptr: *const u8, _len: usize) {}
}

impl InterruptLine for SimulatedBridge {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if !state.line_masked && state.asserted() {
                state.line_masked = true;
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .line
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn unmask(&self) -> Result<()> {
        self.update(|s| s.line_masked = false);
        Ok(())
    }
}

/// Local side of an outbound window on the simulated bridge
#[derive(Debug)]
struct SimWindow {
    bridge: Arc<SimulatedBridge>,
    pci_base: u64,
    len: usize,
}

impl SimWindow {
    fn check(&self, offset: usize, len: usize) -> Result<u64> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(VmeError::configuration(format!(
                "Window access out of bounds: offset={offset:#x}, size={len}, mapped={:#x}",
                self.len
            )));
        }
        Ok(self.pci_base + offset as u64)
    }

    fn check_word(&self, offset: usize, width: usize) -> Result<u64> {
        if offset % width != 0 {
            return Err(VmeError::configuration(format!(
                "Unaligned {}-bit window access at offset {offset:#x}",
                width * 8
            )));
        }
        self.check(offset, width)
    }
}

impl MappedWindow for SimWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        let pci = self.check_word(offset, 4)?;
        Ok(self.bridge.update(|s| s.window_read32(pci)))
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        let pci = self.check_word(offset, 4)?;
        self.bridge
            .update(|s| s.window_store(pci, &value.to_ne_bytes()));
        Ok(())
    }

    fn read16(&self, offset: usize) -> Result<u16> {
        let pci = self.check_word(offset, 2)?;
        let mut raw = [0u8; 2];
        self.bridge.update(|s| s.window_load(pci, &mut raw));
        Ok(u16::from_ne_bytes(raw))
    }

    fn write16(&self, offset: usize, value: u16) -> Result<()> {
        let pci = self.check_word(offset, 2)?;
        self.bridge
            .update(|s| s.window_store(pci, &value.to_ne_bytes()));
        Ok(())
    }

    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        let pci = self.check(offset, buffer.len())?;
        self.bridge.update(|s| s.window_load(pci, buffer));
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let pci = self.check(offset, data.len())?;
        self.bridge.update(|s| s.window_store(pci, data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_present_pci_byte_order() {
        let sim = SimulatedBridge::tsi148();
        let id = sim.read32(t::PCI_ID).unwrap();
        assert_eq!(u32::from_le(id), 0x0148_10E3);

        // Above the swizzle boundary values pass through untouched
        sim.write32(t::INTEN, 0x1234_5678).unwrap();
        assert_eq!(sim.register(t::INTEN), 0x1234_5678);

        let sim = SimulatedBridge::universe();
        sim.write32(u::LINT_EN, 0x0000_0100u32.to_le()).unwrap();
        assert_eq!(sim.register(u::LINT_EN), 0x100);
    }

    #[test]
    fn status_is_write_one_to_clear() {
        let sim = SimulatedBridge::universe();
        sim.update(|s| s.raise(u::lint::DMA | u::lint::LERR));
        sim.write32(u::LINT_STAT, u::lint::DMA.to_le()).unwrap();
        assert_eq!(sim.register(u::LINT_STAT), u::lint::LERR);
    }

    #[test]
    fn role_strap_survives_writes() {
        let sim = SimulatedBridge::new(ChipVariant::Universe, false);
        sim.write32(u::MISC_CTL, (u::misc_ctl::SYSCON | u::misc_ctl::SW_SYSRST).to_le())
            .unwrap();
        assert_eq!(sim.register(u::MISC_CTL) & u::misc_ctl::SYSCON, 0);
        assert_eq!(sim.sys_resets(), 1);
    }

    #[test]
    fn undecoded_window_access_latches_pci_error() {
        let sim = SimulatedBridge::tsi148();
        let window = sim.map(0x8000_0000, 0x1000).unwrap();
        assert_eq!(window.read32(0x10).unwrap(), u32::MAX);
        assert_ne!(sim.register(t::EDPAT) & t::exception::VALID, 0);
        assert_eq!(sim.register(t::EDPAL), 0x8000_0010);
        assert!(window.read32(0x1000).is_err());
    }

    #[test]
    fn patterns_fill_as_programmed() {
        assert_eq!(fill_pattern(t::dsat::PATTERN_BYTE, 0xA5, 3), [0xA5; 3]);
        assert_eq!(fill_pattern(t::dsat::PATTERN_BYTE_INC, 0xFE, 3), [0xFE, 0xFF, 0x00]);
        assert_eq!(
            fill_pattern(t::dsat::PATTERN_WORD, 0x0102_0304, 6),
            [1, 2, 3, 4, 1, 2]
        );
        assert_eq!(
            fill_pattern(t::dsat::PATTERN_WORD_INC, 0x0000_00FF, 8),
            [0, 0, 0, 0xFF, 0, 0, 1, 0]
        );
    }

    #[test]
    fn bus_addresses_keep_page_offset() {
        let sim = SimulatedBridge::universe();
        let a = sim.bus_address(0x7000_1234).unwrap();
        let b = sim.bus_address(0x7000_1FFF).unwrap();
        assert_eq!(a & 0xFFF, 0x234);
        assert_eq!(b - a, 0xDCB);
        assert!(a >= BUS_BASE && a < 1 << 32);
    }

    #[test]
    fn line_waits_for_enabled_status() {
        let sim = SimulatedBridge::universe();
        assert!(!sim.wait(Duration::from_millis(1)).unwrap());
        sim.assert_vme_irq(3, 0x40);
        assert!(!sim.wait(Duration::from_millis(1)).unwrap());
        sim.update(|s| s.set(u::LINT_EN, 1 << 3));
        assert!(sim.wait(Duration::from_millis(1)).unwrap());
        // Masked until re-armed
        assert!(!sim.wait(Duration::from_millis(1)).unwrap());
        sim.unmask().unwrap();
        assert!(sim.wait(Duration::from_millis(1)).unwrap());
    }
}
