//! Error types for VME bridge operations

use crate::dma::DmaSnapshot;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use vme_chip::attr::AddressSpace;
use vme_chip::pcie::ChipVariant;

/// Result type alias for VME bridge operations
pub type Result<T> = std::result::Result<T, VmeError>;

/// Which side of the bridge reported a bus error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSide {
    /// Local (PCI) bus
    Pci,
    /// VME backplane
    Vme,
}

impl fmt::Display for BusSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pci => "PCI",
            Self::Vme => "VME",
        })
    }
}

/// Errors that can occur during VME bridge operations
#[derive(Debug, Error)]
pub enum VmeError {
    /// Bad index, size, alignment or parameter combination
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What was wrong with the request
        reason: String,
    },

    /// Address space not available on this bridge for the requested use
    #[error("{space} not supported by {variant} here")]
    UnsupportedAddressSpace {
        /// Requested space
        space: AddressSpace,
        /// Active bridge
        variant: ChipVariant,
    },

    /// Operation requires the system-controller role
    #[error("Bridge is not VME system controller")]
    NotSystemController,

    /// Operation requires that the bridge is not system controller
    #[error("Bridge is VME system controller; operation needs a peripheral slot")]
    NotPeripheralController,

    /// No enabled outbound window maps the address
    #[error("No outbound window maps {space} address {address:#x}")]
    NoMatchingWindow {
        /// VME address
        address: u64,
        /// Address space
        space: AddressSpace,
    },

    /// A bus cycle terminated with an error
    #[error("{source_bus} bus error at {address:#x}")]
    BusError {
        /// Side that reported the error
        source_bus: BusSide,
        /// Faulting address, if the bridge logged one (0 otherwise)
        address: u64,
    },

    /// Bounded wait expired
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout {
        /// Operation that was waiting
        operation: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Start-of-day self-test or register read-back diverged
    #[error("Hardware mismatch: {reason}")]
    HardwareMismatch {
        /// What did not read back
        reason: String,
    },

    /// DMA finished without the done bit
    #[error("DMA channel {channel} failed (status {status:#010x}): {snapshot}")]
    DmaFailed {
        /// Channel index
        channel: usize,
        /// Raw status register
        status: u32,
        /// Engine registers at failure
        snapshot: DmaSnapshot,
    },

    /// DMA was hard-stopped; the destination may be partially written
    #[error("DMA channel {channel} aborted (status {status:#010x})")]
    DmaAborted {
        /// Channel index
        channel: usize,
        /// Raw status register
        status: u32,
    },

    /// RMW compare never matched
    #[error("RMW did not complete after {attempts} attempts")]
    RmwExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No Tundra bridge on the PCI bus
    #[error("No VME bridge detected")]
    NoDevicesFound,

    /// I/O error talking to the platform
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl VmeError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a hardware mismatch error
    pub fn hardware_mismatch(reason: impl Into<String>) -> Self {
        Self::HardwareMismatch {
            reason: reason.into(),
        }
    }

    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create an I/O error from a rustix errno with context
    pub(crate) fn os(context: &str, errno: rustix::io::Errno) -> Self {
        let source = std::io::Error::from(errno);
        Self::Io {
            source: std::io::Error::new(source.kind(), format!("{context}: {source}")),
        }
    }

    /// Whether a caller may reasonably retry (bus errors and timeouts)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BusError { .. } | Self::Timeout { .. } | Self::RmwExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let e = VmeError::UnsupportedAddressSpace {
            space: AddressSpace::A64,
            variant: ChipVariant::Universe,
        };
        assert!(e.to_string().contains("A64"));
        let e = VmeError::timeout("DMA wait", std::time::Duration::from_millis(1500));
        assert_eq!(e.to_string(), "DMA wait timed out after 1500ms");
        assert!(e.is_recoverable());
        assert!(!VmeError::NotSystemController.is_recoverable());
    }
}
