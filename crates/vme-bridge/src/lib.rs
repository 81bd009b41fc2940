//! User-space driver for Tundra PCI-VME bridges.
//!
//! One interface over both supported chips, the ca91c042 ("Universe II")
//! and the Tsi148: address translation windows, chained DMA with
//! interrupt-driven completion, VME interrupt generation and counting,
//! atomic RMW cycles, and arbiter/requester control.
//!
//! # Layers
//!
//! ```text
//! VmeBridge / VmeInterface      start of day, role gating, convenience I/O
//!   ├─ WindowTranslator         validate, then program windows
//!   ├─ DmaEngine                descriptor arena, pinning, submit/wait/abort
//!   ├─ InterruptController      shared-line dispatch, waiters, IRQ counters
//!   └─ RmwEngine                the single RMW latch
//! BridgeChip                    UniverseChip | Tsi148Chip, picked by probe
//! ChipRegisters                 byte-order rule per variant
//! Platform                      registers, mappings, DMA memory, IRQ line, ticks
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use vme_bridge::{BridgeConfig, DeviceManager, VmeInterface, VmeInterfaceConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mgr = DeviceManager::discover()?;
//! let bridge = mgr.open_first(BridgeConfig::default())?;
//!
//! // A32 range 0x0800_0000.. reached through PCI 0x9000_0000
//! let vme = VmeInterface::new(
//!     &bridge,
//!     VmeInterfaceConfig::new(0x0800_0000, 0x10_0000, 0x9000_0000),
//! )?;
//! let id = vme.read32(0)?;
//! let block = vme.read(0x1000, 64 * 1024)?;
//! println!("board id {id:#010x}, {} bytes", block.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod access;
pub mod arbiter;
pub mod backends;
mod bridge;
pub mod bus;
pub mod chip;
mod config;
mod discovery;
pub mod dma;
mod error;
pub mod irq;
pub mod platform;
pub mod rmw;
pub mod window;

/// Hardware identification constants (re-exported from vme-chip).
pub mod pcie_ids {
    pub use vme_chip::pcie::device_id;
    pub use vme_chip::pcie::{
        lspci_filter, ChipVariant, ALL_DEVICE_IDS, TUNDRA_VENDOR_ID, UNIVERSE_PCI_CLASS,
    };
}

pub use access::VmeInterface;
pub use arbiter::{ArbiterConfig, ArbitrationMode, BusTimeout, ReleaseMode, RequesterConfig};
pub use bridge::VmeBridge;
pub use chip::{BridgeChip, BusFault};
pub use config::{BridgeConfig, DmaTuning, VmeInterfaceConfig};
pub use discovery::{BridgeInfo, DeviceManager};
pub use dma::{DmaCompletion, DmaEndpoint, DmaPattern, DmaSegment, DmaTransfer};
pub use error::{BusSide, Result, VmeError};
pub use irq::{IrqAck, IrqHit};
pub use platform::Platform;
pub use rmw::{RmwOperation, RmwOutcome};
pub use vme_chip::attr::{
    AccessFilter, AddressSpace, DataWidth, Privilege, Protocol, SstRate, VmeAttributes,
};
pub use window::{InboundWindow, OutboundWindow, WindowDirection};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AddressSpace, BridgeConfig, DataWidth, DeviceManager, DmaSegment, OutboundWindow,
        Protocol, Result, RmwOperation, VmeAttributes, VmeBridge, VmeError, VmeInterface,
        VmeInterfaceConfig,
    };
}
