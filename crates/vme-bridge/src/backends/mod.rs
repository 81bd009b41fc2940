//! Platform implementations
//!
//! Linux user space, assembled by [`Platform::linux`](crate::Platform::linux):
//! - **mmap**: BAR0 through sysfs for registers, `/dev/mem` for outbound windows
//! - **chardev**: legacy register node, one syscall per access
//! - **pagemap**: virtual to physical translation for DMA
//! - **uio**: the shared interrupt line
//!
//! And one that needs no hardware at all:
//! - **sim**: behavioural model of either bridge, used by the test suite

pub mod chardev;
pub mod mmap;
pub mod pagemap;
pub mod sim;
pub mod uio;

pub use chardev::CharDeviceBus;
pub use mmap::{DevMem, MmapRegion, MmioBus};
pub use pagemap::PagemapTranslator;
pub use sim::SimulatedBridge;
pub use uio::UioInterrupt;
