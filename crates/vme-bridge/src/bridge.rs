//! Top-level bridge owner
//!
//! [`VmeBridge`] is the driver instance: it probes the chip, runs the
//! start-of-day sequence, owns the interrupt dispatch thread and every
//! engine, and tears everything down again on drop.
//!
//! Start of day:
//!
//! 1. probe the PCI ID and pick the chip implementation
//! 2. register echo self-test (a mismatch is fatal)
//! 3. quiesce, enable interrupts for the slot role
//! 4. CR/CSR image for the configured slot
//! 5. start dispatching the shared interrupt line
//! 6. calibrate interrupt latency through mailbox 0
//! 7. program and verify the default requester

use crate::arbiter::{ArbiterConfig, RequesterConfig};
use crate::chip::{self, BridgeChip, BusFault};
use crate::config::BridgeConfig;
use crate::dma::DmaEngine;
use crate::error::{Result, VmeError};
use crate::irq::{InterruptController, IrqAck, IrqHit};
use crate::platform::{InterruptLine, MappedWindow, Platform};
use crate::rmw::{RmwEngine, RmwOperation, RmwOutcome};
use crate::window::{InboundWindow, OutboundWindow, WindowTranslator, WINDOW_COUNT};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use vme_chip::attr::{AccessFilter, AddressSpace};
use vme_chip::pcie::ChipVariant;

type Mapping = (OutboundWindow, Arc<dyn MappedWindow>);

/// Interrupt dispatch thread
#[derive(Debug)]
struct Dispatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    fn spawn(
        chip: Arc<dyn BridgeChip>,
        irq: Arc<InterruptController>,
        line: Arc<dyn InterruptLine>,
        interval: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("vme-irq".into())
            .spawn(move || {
                while !running.load(Ordering::Acquire) {
                    match line.wait(interval) {
                        Ok(true) => {
                            if let Err(e) = irq.dispatch(chip.as_ref()) {
                                tracing::warn!("Interrupt dispatch failed: {e}");
                            }
                            if let Err(e) = line.unmask() {
                                tracing::error!("Interrupt line lost: {e}");
                                break;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!("Interrupt line lost: {e}");
                            break;
                        }
                    }
                }
                tracing::debug!("Interrupt dispatch stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Interrupt dispatch thread panicked");
            }
        }
    }
}

/// One opened PCI-VME bridge
#[derive(Debug)]
pub struct VmeBridge {
    chip: Arc<dyn BridgeChip>,
    platform: Platform,
    config: BridgeConfig,
    irq: Arc<InterruptController>,
    dma: DmaEngine,
    rmw: RmwEngine,
    system_controller: bool,
    mappings: Mutex<HashMap<usize, Mapping>>,
    dispatcher: Dispatcher,
}

impl VmeBridge {
    /// Probe and initialize the bridge behind `platform`
    ///
    /// # Errors
    ///
    /// - `HardwareMismatch` for a foreign chip or a failed self-test; the
    ///   bridge is left untouched beyond the echo registers
    /// - register, thread or requester errors during start of day
    pub fn open(platform: Platform, config: BridgeConfig) -> Result<Self> {
        let chip = chip::probe(Arc::clone(&platform.registers))?;
        chip.self_test()?;
        let system_controller = chip.initialize()?;
        let (irq, dispatcher) = match Self::start_dispatch(&chip, &platform, &config) {
            Ok(started) => started,
            Err(e) => {
                if let Err(undo) = chip.shutdown() {
                    tracing::error!("Shutdown after failed start of day: {undo}");
                }
                return Err(e);
            }
        };
        let dma = DmaEngine::new(
            Arc::clone(&chip),
            Arc::clone(&platform.dma),
            Arc::clone(&platform.ticks),
            Arc::clone(&irq),
            config.dma,
        );

        let bridge = Self {
            chip,
            platform,
            config,
            irq,
            dma,
            rmw: RmwEngine::new(),
            system_controller,
            mappings: Mutex::new(HashMap::new()),
            dispatcher,
        };

        match bridge.recalibrate() {
            Ok(_) => {}
            Err(e @ VmeError::Timeout { .. }) => {
                tracing::warn!("{e}; DMA times are uncorrected");
            }
            Err(e) => return Err(e),
        }
        if bridge.config.apply_default_requester {
            bridge.apply_default_requester()?;
        }

        tracing::info!(
            "{} ready ({})",
            bridge.variant(),
            if system_controller {
                "system controller"
            } else {
                "peripheral"
            }
        );
        Ok(bridge)
    }

    /// Steps 4 and 5 of start of day; the caller undoes step 3 on failure
    fn start_dispatch(
        chip: &Arc<dyn BridgeChip>,
        platform: &Platform,
        config: &BridgeConfig,
    ) -> Result<(Arc<InterruptController>, Dispatcher)> {
        if let Some(slot) = config.slot {
            chip.setup_slot(slot)?;
        }
        let irq = Arc::new(InterruptController::new(
            chip.dma_channels(),
            Arc::clone(&platform.ticks),
        ));
        let dispatcher = Dispatcher::spawn(
            Arc::clone(chip),
            Arc::clone(&irq),
            Arc::clone(&platform.interrupt),
            config.dispatch_interval,
        )?;
        Ok((irq, dispatcher))
    }

    /// Chip variant
    pub fn variant(&self) -> ChipVariant {
        self.chip.variant()
    }

    /// Register-level chip access
    pub fn chip(&self) -> &dyn BridgeChip {
        self.chip.as_ref()
    }

    /// Whether this bridge sits in the system-controller slot
    pub const fn is_system_controller(&self) -> bool {
        self.system_controller
    }

    /// Settings the bridge was opened with
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Interrupt state
    pub fn interrupts(&self) -> &InterruptController {
        &self.irq
    }

    /// DMA channels
    pub const fn dma(&self) -> &DmaEngine {
        &self.dma
    }

    fn require_system_controller(&self) -> Result<()> {
        if self.system_controller {
            Ok(())
        } else {
            Err(VmeError::NotSystemController)
        }
    }

    fn require_peripheral(&self) -> Result<()> {
        if self.system_controller {
            Err(VmeError::NotPeripheralController)
        } else {
            Ok(())
        }
    }

    // ── Calibration ──────────────────────────────────────────────────────

    /// Re-measure the interrupt dispatch overhead subtracted from DMA times
    ///
    /// # Errors
    ///
    /// `Timeout` if the mailbox interrupt does not arrive; the previous
    /// correction stays in effect.
    pub fn recalibrate(&self) -> Result<u32> {
        self.irq
            .calibrate(self.chip.as_ref(), self.config.calibration_timeout)
    }

    // ── Windows ──────────────────────────────────────────────────────────

    fn translator(&self) -> WindowTranslator<'_> {
        WindowTranslator::new(self.chip.as_ref())
    }

    fn mappings(&self) -> MutexGuard<'_, HashMap<usize, Mapping>> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Program an outbound window
    ///
    /// No transfer through the window may be outstanding.
    ///
    /// # Errors
    ///
    /// As [`WindowTranslator::configure_outbound`].
    pub fn configure_outbound(&self, window: &OutboundWindow) -> Result<()> {
        self.translator().configure_outbound(window)?;
        self.mappings().remove(&window.index);
        Ok(())
    }

    /// Read back an outbound window
    ///
    /// # Errors
    ///
    /// As [`WindowTranslator::query_outbound`].
    pub fn query_outbound(&self, index: usize) -> Result<OutboundWindow> {
        self.translator().query_outbound(index)
    }

    /// Program an inbound window
    ///
    /// # Errors
    ///
    /// As [`WindowTranslator::configure_inbound`].
    pub fn configure_inbound(&self, window: &InboundWindow) -> Result<()> {
        self.translator().configure_inbound(window)
    }

    /// Read back an inbound window
    ///
    /// # Errors
    ///
    /// As [`WindowTranslator::query_inbound`].
    pub fn query_inbound(&self, index: usize) -> Result<InboundWindow> {
        self.translator().query_inbound(index)
    }

    /// Every enabled outbound window
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn outbound_windows(&self) -> Result<Vec<OutboundWindow>> {
        self.translator().enabled_outbound()
    }

    /// Disable every outbound and inbound window
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn disable_windows(&self) -> Result<()> {
        for index in 0..WINDOW_COUNT {
            self.configure_outbound(&OutboundWindow::disabled(index))?;
            let mut inbound = self.query_inbound(index)?;
            if inbound.enabled {
                inbound.enabled = false;
                self.configure_inbound(&inbound)?;
            }
        }
        Ok(())
    }

    /// Window and PCI address reaching `len` bytes at `address` in `space`
    fn locate(&self, address: u64, space: AddressSpace, len: u64) -> Result<(OutboundWindow, u64)> {
        self.outbound_windows()?
            .into_iter()
            .find_map(|w| w.pci_address_of(address, space, len).map(|pci| (w, pci)))
            .ok_or(VmeError::NoMatchingWindow { address, space })
    }

    /// Process mapping of a window's local side, made on first use
    fn mapping(&self, window: &OutboundWindow) -> Result<Arc<dyn MappedWindow>> {
        let mut mappings = self.mappings();
        if let Some((cached, mapping)) = mappings.get(&window.index) {
            if cached == window {
                return Ok(Arc::clone(mapping));
            }
        }
        let size = usize::try_from(window.size).map_err(|_| {
            VmeError::configuration(format!("Window of {:#x} bytes cannot be mapped", window.size))
        })?;
        let mapping = self.platform.memory.map(window.pci_base, size)?;
        tracing::debug!(
            "Mapped outbound {} at PCI {:#x}+{size:#x}",
            window.index,
            window.pci_base
        );
        mappings.insert(window.index, (*window, Arc::clone(&mapping)));
        Ok(mapping)
    }

    /// Mapping and offset for `len` bytes at `address`
    fn reach(
        &self,
        address: u64,
        space: AddressSpace,
        len: usize,
    ) -> Result<(Arc<dyn MappedWindow>, usize, u64)> {
        let (window, pci) = self.locate(address, space, len as u64)?;
        let mapping = self.mapping(&window)?;
        // Bounded by the window size, which fits usize once mapped
        let offset = usize::try_from(pci - window.pci_base)
            .map_err(|_| VmeError::configuration("Window offset exceeds address space"))?;
        Ok((mapping, offset, pci))
    }

    /// Fail with the latched bus error, if an access left one
    fn surface_bus_error(&self) -> Result<()> {
        match self.check_bus_error(true)? {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    // ── Single cycles ────────────────────────────────────────────────────

    /// 32-bit read through an outbound window, as the host's load sees it
    ///
    /// # Errors
    ///
    /// `NoMatchingWindow`, or `BusError` if the cycle failed.
    pub fn read32(&self, address: u64, space: AddressSpace) -> Result<u32> {
        let (mapping, offset, _) = self.reach(address, space, 4)?;
        let value = mapping.read32(offset)?;
        self.surface_bus_error()?;
        Ok(value)
    }

    /// 32-bit write through an outbound window
    ///
    /// # Errors
    ///
    /// `NoMatchingWindow`, or `BusError` if the cycle failed.
    pub fn write32(&self, address: u64, space: AddressSpace, value: u32) -> Result<()> {
        let (mapping, offset, _) = self.reach(address, space, 4)?;
        mapping.write32(offset, value)?;
        self.surface_bus_error()
    }

    /// 16-bit read through an outbound window
    ///
    /// The host load is a single D16 cycle whatever the window's maximum
    /// data width.
    ///
    /// # Errors
    ///
    /// `NoMatchingWindow`, `Configuration` for an odd address, or
    /// `BusError` if the cycle failed.
    pub fn read16(&self, address: u64, space: AddressSpace) -> Result<u16> {
        let (mapping, offset, _) = self.reach(address, space, 2)?;
        let value = mapping.read16(offset)?;
        self.surface_bus_error()?;
        Ok(value)
    }

    /// 16-bit write through an outbound window
    ///
    /// # Errors
    ///
    /// As [`VmeBridge::read16`].
    pub fn write16(&self, address: u64, space: AddressSpace, value: u16) -> Result<()> {
        let (mapping, offset, _) = self.reach(address, space, 2)?;
        mapping.write16(offset, value)?;
        self.surface_bus_error()
    }

    /// Copy from VME through an outbound window
    ///
    /// # Errors
    ///
    /// `NoMatchingWindow`, or `BusError` if any cycle failed.
    pub fn read_bytes(&self, address: u64, space: AddressSpace, buffer: &mut [u8]) -> Result<()> {
        let (mapping, offset, _) = self.reach(address, space, buffer.len())?;
        mapping.read_bytes(offset, buffer)?;
        self.surface_bus_error()
    }

    /// Copy to VME through an outbound window
    ///
    /// # Errors
    ///
    /// `NoMatchingWindow`, or `BusError` if any cycle failed.
    pub fn write_bytes(&self, address: u64, space: AddressSpace, data: &[u8]) -> Result<()> {
        let (mapping, offset, _) = self.reach(address, space, data.len())?;
        mapping.write_bytes(offset, data)?;
        self.surface_bus_error()
    }

    // ── RMW ──────────────────────────────────────────────────────────────

    /// Atomic compare-and-swap through an already configured outbound window
    ///
    /// # Errors
    ///
    /// `NoMatchingWindow` if no window reaches the target, `RmwExhausted`
    /// if it never converged, `BusError` if a cycle failed.
    pub fn do_rmw(&self, op: &RmwOperation) -> Result<RmwOutcome> {
        let (mapping, offset, pci) = self.reach(op.address, op.space, 4)?;
        let outcome = self
            .rmw
            .run(self.chip.as_ref(), mapping.as_ref(), offset, pci, op);
        self.surface_bus_error()?;
        outcome
    }

    // ── Bus errors ───────────────────────────────────────────────────────

    /// Latched bus error, if any; `clear` resets the latch for the next caller
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn check_bus_error(&self, clear: bool) -> Result<Option<BusFault>> {
        let fault = self.chip.check_bus_error(clear)?;
        if clear {
            self.irq.take_bus_error();
        }
        Ok(fault)
    }

    // ── Location monitor ─────────────────────────────────────────────────

    /// Arm the location monitor on `address` in `space`
    ///
    /// # Errors
    ///
    /// `UnsupportedAddressSpace` or `Configuration` for a misaligned base.
    pub fn setup_location_monitor(
        &self,
        address: u64,
        space: AddressSpace,
        access: AccessFilter,
    ) -> Result<()> {
        self.irq.reset_location_monitor();
        self.chip.setup_location_monitor(address, space, access)
    }

    /// Wait for the armed monitor to fire; returns the mask of monitors hit.
    /// The monitor is disarmed afterwards either way.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing touched the monitored locations.
    pub fn wait_location_monitor(&self, timeout: Duration) -> Result<u8> {
        let fired = self.irq.wait_location_monitor(timeout);
        self.chip.disable_location_monitor()?;
        fired
    }

    // ── VME interrupts ───────────────────────────────────────────────────

    /// Raise a VME interrupt and wait (bounded) for the acknowledge
    ///
    /// # Errors
    ///
    /// `NotPeripheralController` in the system-controller slot,
    /// `Configuration` for a bad level or vector.
    pub fn generate_irq(&self, level: u8, vector: u8, timeout: Duration) -> Result<IrqAck> {
        self.require_peripheral()?;
        self.irq.generate(
            self.chip.as_ref(),
            level,
            vector,
            timeout,
            self.config.ack_poll_interval,
        )
    }

    /// Wait until (level, vector) has been received; (0, 0) matches anything
    ///
    /// # Errors
    ///
    /// `NotSystemController` in a peripheral slot, `Timeout` if nothing
    /// matching arrived.
    pub fn get_irq_status(&self, level: u8, vector: u8, timeout: Duration) -> Result<IrqHit> {
        self.require_system_controller()?;
        self.irq.get_irq_status(level, vector, timeout)
    }

    /// Zero one occurrence counter, or all of them for (0, 0)
    ///
    /// # Errors
    ///
    /// `Configuration` for a bad selector.
    pub fn clr_irq_status(&self, level: u8, vector: u8) -> Result<()> {
        self.irq.clr_irq_status(level, vector)
    }

    // ── Arbiter / requester ──────────────────────────────────────────────

    /// Program the arbiter
    ///
    /// # Errors
    ///
    /// `NotSystemController` in a peripheral slot, `Configuration` for
    /// unrepresentable settings.
    pub fn set_arbiter(&self, config: &ArbiterConfig) -> Result<()> {
        self.require_system_controller()?;
        self.chip.set_arbiter(config)
    }

    /// Current arbiter settings
    ///
    /// # Errors
    ///
    /// `NotSystemController` in a peripheral slot.
    pub fn arbiter(&self) -> Result<ArbiterConfig> {
        self.require_system_controller()?;
        self.chip.arbiter()
    }

    /// Program the requester
    ///
    /// # Errors
    ///
    /// `Configuration` for unrepresentable settings.
    pub fn set_requester(&self, config: &RequesterConfig) -> Result<()> {
        self.chip.set_requester(config)
    }

    /// Current requester settings
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn requester(&self) -> Result<RequesterConfig> {
        self.chip.requester()
    }

    /// Program the start-of-day requester and check it reads back
    ///
    /// # Errors
    ///
    /// `HardwareMismatch` if the chip did not take the settings.
    pub fn apply_default_requester(&self) -> Result<()> {
        let wanted = RequesterConfig::default_for(self.variant());
        self.set_requester(&wanted)?;
        let got = self.requester()?;
        if got != wanted {
            return Err(VmeError::hardware_mismatch(format!(
                "Requester read back as {got:?}, wanted {wanted:?}"
            )));
        }
        Ok(())
    }

    // ── Reset ────────────────────────────────────────────────────────────

    /// Pulse VME SYSRESET
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn sys_reset(&self) -> Result<()> {
        tracing::warn!("Asserting VME SYSRESET");
        self.chip.sys_reset()
    }
}

impl Drop for VmeBridge {
    fn drop(&mut self) {
        self.dispatcher.stop();
        self.mappings().clear();
        if let Err(e) = self.chip.shutdown() {
            tracing::error!("Bridge shutdown failed: {e}");
        }
        tracing::debug!("{} closed", self.chip.variant());
    }
}
