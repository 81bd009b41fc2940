//! Platform services the driver consumes
//!
//! The bridge core never talks to the operating system directly. Everything
//! it needs from the host is behind one of these traits:
//!
//! - [`RegisterBus`](crate::bus::RegisterBus): the control-and-status region
//! - [`BusMemory`]: maps the local side of an outbound window
//! - [`DmaMemory`]: virtual to bus address translation and page pinning
//! - [`InterruptLine`]: the single shared interrupt
//! - [`TickSource`]: free-running timestamp counter
//!
//! [`Platform`] bundles one of each. Linux implementations live in
//! [`crate::backends`], as does the [`SimulatedBridge`](crate::backends::SimulatedBridge)
//! used by the test suite.

use crate::bus::RegisterBus;
use crate::error::{Result, VmeError};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process mapping of a PCI address range (the local side of an outbound window).
///
/// Word accessors move raw memory-order values: what a 32-bit load or
/// store at that address would see.
pub trait MappedWindow: Debug + Send + Sync {
    /// Mapped length in bytes
    fn len(&self) -> usize;

    /// Whether the mapping is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single 32-bit load at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds.
    fn read32(&self, offset: usize) -> Result<u32>;

    /// Single 32-bit store at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds.
    fn write32(&self, offset: usize, value: u32) -> Result<()>;

    /// Single 16-bit load at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds or unaligned.
    fn read16(&self, offset: usize) -> Result<u16>;

    /// Single 16-bit store at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds or unaligned.
    fn write16(&self, offset: usize, value: u16) -> Result<()>;

    /// Copy out of the window
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds.
    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()>;

    /// Copy into the window
    ///
    /// # Errors
    ///
    /// Returns error if the access is out of bounds.
    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Maps PCI bus addresses into the process.
pub trait BusMemory: Debug + Send + Sync {
    /// Map `size` bytes starting at PCI address `pci_address`
    ///
    /// # Errors
    ///
    /// Returns error if the range cannot be mapped.
    fn map(&self, pci_address: u64, size: usize) -> Result<Arc<dyn MappedWindow>>;
}

/// Address translation and pinning for DMA.
pub trait DmaMemory: Debug + Send + Sync {
    /// Bus address a DMA engine must use to reach virtual address `vaddr`
    ///
    /// `vaddr` must lie in memory that is pinned for as long as the
    /// returned address is used.
    ///
    /// # Errors
    ///
    /// Returns error if the page is not resident or translation is unavailable.
    fn bus_address(&self, vaddr: usize) -> Result<u64>;

    /// Keep `[ptr, ptr + len)` resident
    ///
    /// # Errors
    ///
    /// Returns error if the pages cannot be locked.
    fn lock(&self, ptr: *const u8, len: usize) -> Result<()> {
        // SAFETY: mlock only changes residency of the pages and fails with
        // ENOMEM for unmapped ranges; it never dereferences the pointer.
        unsafe { rustix::mm::mlock(ptr.cast_mut().cast(), len) }
            .map_err(|e| VmeError::os("mlock failed", e))
    }

    /// Release a range locked by [`DmaMemory::lock`]
    fn unlock(&self, ptr: *const u8, len: usize) {
        // SAFETY: same contract as `lock`; failure leaves pages locked,
        // which is harmless.
        if let Err(e) = unsafe { rustix::mm::munlock(ptr.cast_mut().cast(), len) } {
            tracing::warn!("munlock failed: {e}");
        }
    }
}

/// The bridge's single interrupt line.
pub trait InterruptLine: Debug + Send + Sync {
    /// Block until the line fires or `timeout` elapses; `true` if it fired
    ///
    /// # Errors
    ///
    /// Returns error if the interrupt source has gone away.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    /// Re-arm the line after the handler has cleared the chip's status
    ///
    /// # Errors
    ///
    /// Returns error if the interrupt source cannot be re-armed.
    fn unmask(&self) -> Result<()>;
}

/// Free-running 32-bit timestamp counter.
pub trait TickSource: Debug + Send + Sync {
    /// Current tick; wraps at 2^32
    fn now(&self) -> u32;

    /// Counter frequency in ticks per microsecond
    fn ticks_per_us(&self) -> u32;
}

/// Nanosecond ticks derived from [`Instant`]
#[derive(Debug)]
pub struct MonotonicTicks {
    epoch: Instant,
}

impl MonotonicTicks {
    /// Start counting from now
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> u32 {
        // Wrapping is the contract
        self.epoch.elapsed().as_nanos() as u32
    }

    fn ticks_per_us(&self) -> u32 {
        1000
    }
}

/// Everything the bridge needs from its host.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Control-and-status registers
    pub registers: Arc<dyn RegisterBus>,
    /// Outbound window mapper
    pub memory: Arc<dyn BusMemory>,
    /// DMA translation and pinning
    pub dma: Arc<dyn DmaMemory>,
    /// Shared interrupt line
    pub interrupt: Arc<dyn InterruptLine>,
    /// Timestamp counter
    pub ticks: Arc<dyn TickSource>,
}

impl Platform {
    /// Linux user-space platform for the bridge at `pcie_address`
    ///
    /// Registers come from BAR0 through sysfs, outbound windows from
    /// `/dev/mem`, translation from `/proc/self/pagemap` and the interrupt
    /// from the UIO device bound to the bridge.
    ///
    /// # Errors
    ///
    /// Returns error if any of the device nodes cannot be opened.
    pub fn linux(pcie_address: &str, uio_device: &str) -> Result<Self> {
        use crate::backends::{DevMem, MmioBus, PagemapTranslator, UioInterrupt};

        Ok(Self {
            registers: Arc::new(MmioBus::open(pcie_address)?),
            memory: Arc::new(DevMem::new()),
            dma: Arc::new(PagemapTranslator::open()?),
            interrupt: Arc::new(UioInterrupt::open(uio_device)?),
            ticks: Arc::new(MonotonicTicks::new()),
        })
    }

    /// Platform backed entirely by a simulated bridge
    #[must_use]
    pub fn simulated(sim: &Arc<crate::backends::SimulatedBridge>) -> Self {
        Self {
            registers: sim.clone(),
            memory: sim.clone(),
            dma: sim.clone(),
            interrupt: sim.clone(),
            ticks: Arc::new(MonotonicTicks::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ticks_advance() {
        let ticks = MonotonicTicks::new();
        let a = ticks.now();
        std::thread::sleep(Duration::from_millis(2));
        let b = ticks.now();
        assert!(b.wrapping_sub(a) >= 2_000_000);
        assert_eq!(ticks.ticks_per_us(), 1000);
    }
}
