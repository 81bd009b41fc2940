//! Driver configuration
//!
//! Plain structs with `Default` and `with_*` builders. Nothing is read
//! from files or the environment: the caller owns configuration.

use std::time::Duration;
use vme_chip::attr::{AddressSpace, DataWidth, Protocol, SstRate, VmeAttributes};

/// Per-transfer DMA bus tuning
///
/// Sizes are in bytes and back-offs in microseconds; each is rounded up to
/// the next code the chip can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTuning {
    /// Largest PCI burst (Tsi148)
    pub max_pci_block: u32,
    /// Largest VME tenure
    pub max_vme_block: u32,
    /// PCI back-off between bursts (Tsi148)
    pub pci_backoff_us: u32,
    /// VME back-off between tenures
    pub vme_backoff_us: u32,
}

impl Default for DmaTuning {
    fn default() -> Self {
        Self {
            max_pci_block: 4096,
            max_vme_block: 2048,
            pci_backoff_us: 0,
            vme_backoff_us: 0,
        }
    }
}

/// Bridge-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Default bound for DMA waits
    pub dma_timeout: Duration,
    /// Default bound for VME interrupt waits
    pub irq_timeout: Duration,
    /// Bound for the start-of-day interrupt latency calibration
    pub calibration_timeout: Duration,
    /// Sampling interval while waiting for an IACK of a generated interrupt
    pub ack_poll_interval: Duration,
    /// How often the dispatch thread re-checks for shutdown
    pub dispatch_interval: Duration,
    /// Geographical slot for the CR/CSR image, if any
    pub slot: Option<u8>,
    /// Program and verify the default requester at start of day
    pub apply_default_requester: bool,
    /// DMA defaults
    pub dma: DmaTuning,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dma_timeout: Duration::from_secs(5),
            irq_timeout: Duration::from_secs(1),
            calibration_timeout: Duration::from_millis(500),
            ack_poll_interval: Duration::from_millis(50),
            dispatch_interval: Duration::from_millis(20),
            slot: None,
            apply_default_requester: true,
            dma: DmaTuning::default(),
        }
    }
}

impl BridgeConfig {
    /// Set the DMA wait bound
    #[must_use]
    pub const fn with_dma_timeout(mut self, timeout: Duration) -> Self {
        self.dma_timeout = timeout;
        self
    }

    /// Set the VME interrupt wait bound
    #[must_use]
    pub const fn with_irq_timeout(mut self, timeout: Duration) -> Self {
        self.irq_timeout = timeout;
        self
    }

    /// Set the IACK sampling interval
    #[must_use]
    pub const fn with_ack_poll_interval(mut self, interval: Duration) -> Self {
        self.ack_poll_interval = interval;
        self
    }

    /// Configure the CR/CSR image for `slot`
    #[must_use]
    pub const fn with_slot(mut self, slot: u8) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Skip the start-of-day requester programming
    #[must_use]
    pub const fn without_default_requester(mut self) -> Self {
        self.apply_default_requester = false;
        self
    }

    /// Set DMA tuning defaults
    #[must_use]
    pub const fn with_dma_tuning(mut self, tuning: DmaTuning) -> Self {
        self.dma = tuning;
        self
    }
}

/// Settings for a [`VmeInterface`](crate::VmeInterface)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmeInterfaceConfig {
    /// First VME address reachable through the interface
    pub vme_base: u64,
    /// Length of the reachable range
    pub size: u64,
    /// Local PCI address of the outbound window
    pub pci_base: u64,
    /// Address space
    pub space: AddressSpace,
    /// Data width
    pub width: DataWidth,
    /// Protocol for transfers at or above the DMA threshold
    pub protocol: Protocol,
    /// 2eSST rate when `protocol` is 2eSST
    pub sst_rate: Option<SstRate>,
    /// Outbound window used for single cycles
    pub window: usize,
    /// DMA channel for block transfers
    pub dma_channel: usize,
    /// Transfers this long or longer go through DMA
    pub dma_threshold: usize,
}

impl VmeInterfaceConfig {
    /// A32/D32 single-cycle interface over `[vme_base, vme_base + size)`
    #[must_use]
    pub const fn new(vme_base: u64, size: u64, pci_base: u64) -> Self {
        Self {
            vme_base,
            size,
            pci_base,
            space: AddressSpace::A32,
            width: DataWidth::D32,
            protocol: Protocol::Sct,
            sst_rate: None,
            window: 0,
            dma_channel: 0,
            dma_threshold: 256,
        }
    }

    /// Use another address space
    #[must_use]
    pub const fn with_space(mut self, space: AddressSpace) -> Self {
        self.space = space;
        self
    }

    /// Use another data width
    #[must_use]
    pub const fn with_width(mut self, width: DataWidth) -> Self {
        self.width = width;
        self
    }

    /// Use a block protocol for large transfers
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Use outbound window `index`
    #[must_use]
    pub const fn with_window(mut self, index: usize) -> Self {
        self.window = index;
        self
    }

    /// Use DMA channel `channel`
    #[must_use]
    pub const fn with_dma_channel(mut self, channel: usize) -> Self {
        self.dma_channel = channel;
        self
    }

    /// Set the single-cycle/DMA cut-over
    #[must_use]
    pub const fn with_dma_threshold(mut self, bytes: usize) -> Self {
        self.dma_threshold = bytes;
        self
    }

    /// Single-cycle attributes of the outbound window
    #[must_use]
    pub const fn window_attributes(&self) -> VmeAttributes {
        VmeAttributes::sct(self.space, self.width)
    }

    /// Attributes used for DMA transfers
    #[must_use]
    pub const fn dma_attributes(&self) -> VmeAttributes {
        let attrs = VmeAttributes::sct(self.space, self.width).with_protocol(self.protocol);
        match self.sst_rate {
            Some(rate) => attrs.with_sst_rate(rate),
            None => attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_apply() {
        let cfg = BridgeConfig::default()
            .with_slot(3)
            .with_dma_timeout(Duration::from_millis(10))
            .without_default_requester();
        assert_eq!(cfg.slot, Some(3));
        assert_eq!(cfg.dma_timeout, Duration::from_millis(10));
        assert!(!cfg.apply_default_requester);
        assert_eq!(cfg.dma.max_vme_block, 2048);
    }

    #[test]
    fn interface_attributes() {
        let cfg = VmeInterfaceConfig::new(0x1000_0000, 0x1_0000, 0x8000_0000)
            .with_protocol(Protocol::Mblt)
            .with_width(DataWidth::D64);
        assert_eq!(cfg.window_attributes().protocol, Protocol::Sct);
        assert_eq!(cfg.dma_attributes().protocol, Protocol::Mblt);
        assert_eq!(cfg.dma_attributes().width, DataWidth::D64);
    }
}
