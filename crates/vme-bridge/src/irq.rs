//! Interrupt dispatch and VME interrupt handling
//!
//! Every source shares one host interrupt line. [`InterruptController::dispatch`]
//! is the handler: it takes (and clears) whatever the chip reports, stamps
//! the time, and wakes waiters. It never sleeps.
//!
//! Waiters block on condition variables:
//!
//! - one [`CompletionSignal`] per DMA channel
//! - one for mailbox 0 (start-of-day latency calibration)
//! - one for the location monitor
//! - the VME interrupt counter table, one counter per (level, vector)

use crate::chip::{check_irq_level, BridgeChip, BusFault};
use crate::error::{Result, VmeError};
use crate::platform::TickSource;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default, Clone, Copy)]
struct SignalState {
    fired: bool,
    tick: u32,
    mask: u8,
}

/// One-shot wake-up carrying the dispatch timestamp
#[derive(Debug, Default)]
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Forget a previous firing
    pub fn reset(&self) {
        *lock(&self.state) = SignalState::default();
    }

    /// Record a firing and wake every waiter; masks accumulate
    pub fn fire(&self, tick: u32, mask: u8) {
        let mut state = lock(&self.state);
        if !state.fired {
            state.tick = tick;
        }
        state.fired = true;
        state.mask |= mask;
        self.cond.notify_all();
    }

    /// Wait until fired; returns (tick, mask)
    pub fn wait(&self, timeout: Duration) -> Option<(u32, u8)> {
        let state = lock(&self.state);
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.fired)
            .unwrap_or_else(PoisonError::into_inner);
        state.fired.then_some((state.tick, state.mask))
    }
}

/// Result of raising a VME interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqAck {
    /// No interrupt handler acknowledged within the timeout; the request
    /// was withdrawn
    pub timed_out: bool,
}

/// A (level, vector) with a nonzero occurrence count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqHit {
    /// VME level 1-7
    pub level: u8,
    /// Status/ID vector
    pub vector: u8,
    /// Occurrences since the counter was last cleared
    pub count: u32,
}

type CounterTable = [[u32; 256]; 8];

/// Host-side interrupt state of one bridge
#[derive(Debug)]
pub struct InterruptController {
    counters: Mutex<Box<CounterTable>>,
    counter_changed: Condvar,
    dma: Vec<CompletionSignal>,
    mailbox: CompletionSignal,
    location_monitor: CompletionSignal,
    bus_error: Mutex<Option<BusFault>>,
    overhead: AtomicU32,
    ticks: Arc<dyn TickSource>,
}

impl InterruptController {
    /// Controller for a chip with `dma_channels` channels
    pub fn new(dma_channels: usize, ticks: Arc<dyn TickSource>) -> Self {
        Self {
            counters: Mutex::new(Box::new([[0; 256]; 8])),
            counter_changed: Condvar::new(),
            dma: (0..dma_channels).map(|_| CompletionSignal::default()).collect(),
            mailbox: CompletionSignal::default(),
            location_monitor: CompletionSignal::default(),
            bus_error: Mutex::new(None),
            overhead: AtomicU32::new(0),
            ticks,
        }
    }

    // ── Handler ──────────────────────────────────────────────────────────

    /// Service the shared line once; returns whether anything was pending
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn dispatch(&self, chip: &dyn BridgeChip) -> Result<bool> {
        let tick = self.ticks.now();
        let pending = chip.take_pending()?;
        if pending.is_empty() {
            return Ok(false);
        }

        for (channel, signal) in self.dma.iter().enumerate() {
            if pending.dma & (1 << channel) != 0 {
                signal.fire(tick, 0);
            }
        }
        if pending.mailbox != 0 {
            self.mailbox.fire(tick, pending.mailbox);
        }
        if pending.location_monitor != 0 {
            self.location_monitor.fire(tick, pending.location_monitor);
        }

        let mut any_vme = false;
        {
            let mut counters = lock(&self.counters);
            for (level, vector) in pending.vme.iter().enumerate() {
                if let Some(vector) = *vector {
                    let slot = &mut counters[level][usize::from(vector)];
                    *slot = slot.saturating_add(1);
                    any_vme = true;
                }
            }
        }
        if any_vme {
            self.counter_changed.notify_all();
        }

        if let Some(fault) = pending.bus_error {
            *lock(&self.bus_error) = Some(fault);
        }
        if pending.sysfail {
            tracing::warn!("SYSFAIL asserted on the VME bus");
        }
        if pending.acfail {
            tracing::warn!("ACFAIL asserted on the VME bus");
        }
        Ok(true)
    }

    // ── DMA ──────────────────────────────────────────────────────────────

    /// Arm a channel's completion signal before GO
    pub fn reset_dma(&self, channel: usize) {
        if let Some(signal) = self.dma.get(channel) {
            signal.reset();
        }
    }

    /// Wait for a channel's completion interrupt; the dispatch tick if it fired
    pub fn wait_dma(&self, channel: usize, timeout: Duration) -> Option<u32> {
        self.dma
            .get(channel)?
            .wait(timeout)
            .map(|(tick, _)| tick)
    }

    // ── Calibration ──────────────────────────────────────────────────────

    /// Measure mailbox-to-dispatch latency and keep it as the DMA timing
    /// correction; returns the overhead in ticks
    ///
    /// # Errors
    ///
    /// `Timeout` if the mailbox interrupt never arrives.
    pub fn calibrate(&self, chip: &dyn BridgeChip, timeout: Duration) -> Result<u32> {
        self.mailbox.reset();
        let start = self.ticks.now();
        chip.trigger_mailbox()?;
        let (tick, _) = self
            .mailbox
            .wait(timeout)
            .ok_or_else(|| VmeError::timeout("Interrupt calibration", timeout))?;

        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let overhead = match tick.wrapping_sub(start) as i32 {
            n if n <= 0 => 1,
            n => n as u32,
        };
        self.overhead.store(overhead, Ordering::Relaxed);
        tracing::info!("Interrupt overhead calibrated at {overhead} ticks");
        Ok(overhead)
    }

    /// Calibrated dispatch overhead in ticks
    pub fn overhead_ticks(&self) -> u32 {
        self.overhead.load(Ordering::Relaxed)
    }

    // ── Location monitor ─────────────────────────────────────────────────

    /// Forget earlier location-monitor hits
    pub fn reset_location_monitor(&self) {
        self.location_monitor.reset();
    }

    /// Wait for a location-monitor hit; returns the monitor mask
    ///
    /// # Errors
    ///
    /// `Timeout` if no monitor fired.
    pub fn wait_location_monitor(&self, timeout: Duration) -> Result<u8> {
        self.location_monitor
            .wait(timeout)
            .map(|(_, mask)| mask)
            .ok_or_else(|| VmeError::timeout("Location monitor wait", timeout))
    }

    // ── Bus errors ───────────────────────────────────────────────────────

    /// Take the bus error latched by the error interrupt, if any
    pub fn take_bus_error(&self) -> Option<BusFault> {
        lock(&self.bus_error).take()
    }

    // ── VME interrupts ───────────────────────────────────────────────────

    /// Raise a VME interrupt and wait for its acknowledge
    ///
    /// On timeout the request is withdrawn and `timed_out` is reported
    /// rather than an error.
    ///
    /// # Errors
    ///
    /// `Configuration` for a bad level or a vector the chip cannot send.
    pub fn generate(
        &self,
        chip: &dyn BridgeChip,
        level: u8,
        vector: u8,
        timeout: Duration,
        interval: Duration,
    ) -> Result<IrqAck> {
        check_irq_level(level)?;
        chip.raise_vme_irq(level, vector)?;

        let deadline = Instant::now() + timeout;
        let acked = loop {
            if !chip.vme_irq_pending()? {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            std::thread::sleep(interval.min(deadline - now));
        };
        chip.release_vme_irq()?;

        if !acked {
            tracing::warn!("VME IRQ{level} vector {vector:#04x} not acknowledged");
        }
        Ok(IrqAck { timed_out: !acked })
    }

    fn find_hit(counters: &CounterTable, level: u8, vector: u8) -> Option<IrqHit> {
        if level == 0 && vector == 0 {
            for level in (1..=7u8).rev() {
                for (vector, &count) in counters[usize::from(level)].iter().enumerate() {
                    if count > 0 {
                        #[allow(clippy::cast_possible_truncation)]
                        return Some(IrqHit {
                            level,
                            vector: vector as u8,
                            count,
                        });
                    }
                }
            }
            return None;
        }
        let count = counters[usize::from(level)][usize::from(vector)];
        (count > 0).then_some(IrqHit {
            level,
            vector,
            count,
        })
    }

    fn check_selector(level: u8, vector: u8) -> Result<()> {
        if level == 0 && vector != 0 {
            return Err(VmeError::configuration(
                "Level 0 selects any interrupt and needs vector 0",
            ));
        }
        if level > 7 {
            return Err(VmeError::configuration(format!(
                "VME interrupt level {level} out of range 0-7"
            )));
        }
        Ok(())
    }

    /// Wait until (level, vector) has occurred; (0, 0) matches anything
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing matching arrived, `Configuration` for a bad
    /// selector.
    pub fn get_irq_status(&self, level: u8, vector: u8, timeout: Duration) -> Result<IrqHit> {
        Self::check_selector(level, vector)?;
        let counters = lock(&self.counters);
        let (counters, _) = self
            .counter_changed
            .wait_timeout_while(counters, timeout, |c| {
                Self::find_hit(c, level, vector).is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
        Self::find_hit(&counters, level, vector)
            .ok_or_else(|| VmeError::timeout(format!("IRQ{level}/{vector:#04x} wait"), timeout))
    }

    /// Zero one counter, or all of them for (0, 0)
    ///
    /// # Errors
    ///
    /// `Configuration` for a bad selector.
    pub fn clr_irq_status(&self, level: u8, vector: u8) -> Result<()> {
        Self::check_selector(level, vector)?;
        let mut counters = lock(&self.counters);
        if level == 0 {
            **counters = [[0; 256]; 8];
        } else {
            counters[usize::from(level)][usize::from(vector)] = 0;
        }
        Ok(())
    }

    /// Current count for (level, vector)
    pub fn irq_count(&self, level: u8, vector: u8) -> u32 {
        lock(&self.counters)
            .get(usize::from(level))
            .map_or(0, |row| row[usize::from(vector)])
    }
}
