//! Runtime bridge discovery
//!
//! Scans PCI sysfs for Tundra devices with a supported device ID and
//! finds the UIO node bound to each. Nothing is hardcoded beyond the IDs.

use crate::bridge::VmeBridge;
use crate::config::BridgeConfig;
use crate::error::{Result, VmeError};
use crate::platform::Platform;
use std::path::{Path, PathBuf};
use vme_chip::pcie::{ChipVariant, ALL_DEVICE_IDS, TUNDRA_VENDOR_ID};

/// Where the kernel lists PCI functions
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// A bridge found on the PCI bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    /// Position in discovery order
    pub index: usize,
    /// PCI address (0000:03:00.0, etc.)
    pub pcie_address: String,
    /// Chip variant from the device ID
    pub variant: ChipVariant,
    /// UIO node bound to the function, if any
    pub uio: Option<PathBuf>,
}

/// Bridges present on this machine
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<BridgeInfo>,
}

/// Parse a sysfs ID file ("0x10e3\n")
fn read_id(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    u16::from_str_radix(text.strip_prefix("0x").unwrap_or(text), 16).ok()
}

/// `/dev/uioN` for the first `uio/uioN` entry under a PCI function
fn find_uio(function: &Path) -> Option<PathBuf> {
    let mut names: Vec<String> = std::fs::read_dir(function.join("uio"))
        .ok()?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("uio"))
        .collect();
    names.sort();
    names.first().map(|name| Path::new("/dev").join(name))
}

impl DeviceManager {
    /// Discover every bridge on the system
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no supported bridge is present.
    pub fn discover() -> Result<Self> {
        Self::discover_in(SYSFS_PCI_DEVICES)
    }

    /// Discover bridges under an alternative sysfs tree
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no supported bridge is present.
    pub fn discover_in(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tracing::info!("Discovering VME bridges under {}", root.display());

        let mut functions: Vec<PathBuf> = match std::fs::read_dir(root) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(e) => {
                tracing::debug!("Cannot list {}: {e}", root.display());
                Vec::new()
            }
        };
        functions.sort();

        let mut devices = Vec::new();
        for function in functions {
            if read_id(&function.join("vendor")) != Some(TUNDRA_VENDOR_ID) {
                continue;
            }
            let Some(device) = read_id(&function.join("device")) else {
                continue;
            };
            if !ALL_DEVICE_IDS.contains(&device) {
                tracing::debug!("Skipping Tundra device {device:#06x}");
                continue;
            }
            let Some(pcie_address) = function
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
            else {
                continue;
            };

            let info = BridgeInfo {
                index: devices.len(),
                variant: ChipVariant::from_device_id(device),
                uio: find_uio(&function),
                pcie_address,
            };
            tracing::info!(
                "Bridge {}: {} @ {} (UIO {})",
                info.index,
                info.variant,
                info.pcie_address,
                info.uio
                    .as_ref()
                    .map_or_else(|| "none".to_owned(), |p| p.display().to_string())
            );
            devices.push(info);
        }

        if devices.is_empty() {
            return Err(VmeError::NoDevicesFound);
        }
        Ok(Self { devices })
    }

    /// Number of bridges found
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All bridges found
    #[must_use]
    pub fn devices(&self) -> &[BridgeInfo] {
        &self.devices
    }

    /// Bridge by discovery index
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an index past the end.
    pub fn device(&self, index: usize) -> Result<&BridgeInfo> {
        self.devices.get(index).ok_or_else(|| {
            VmeError::configuration(format!(
                "Bridge index {index} out of range ({} found)",
                self.devices.len()
            ))
        })
    }

    /// PCI address of bridge `index`
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an index past the end.
    pub fn pcie_address(&self, index: usize) -> Result<&str> {
        Ok(&self.device(index)?.pcie_address)
    }

    /// Open bridge `index` through the Linux platform
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` without a UIO node, or any start-of-day error.
    pub fn open(&self, index: usize, config: BridgeConfig) -> Result<VmeBridge> {
        Self::open_info(self.device(index)?, config)
    }

    /// Open the first bridge found
    ///
    /// # Errors
    ///
    /// As [`DeviceManager::open`].
    pub fn open_first(&self, config: BridgeConfig) -> Result<VmeBridge> {
        let info = self.devices.first().ok_or(VmeError::NoDevicesFound)?;
        Self::open_info(info, config)
    }

    fn open_info(info: &BridgeInfo, config: BridgeConfig) -> Result<VmeBridge> {
        let uio = info.uio.as_ref().ok_or_else(|| {
            VmeError::device_not_found(
                Path::new(SYSFS_PCI_DEVICES)
                    .join(&info.pcie_address)
                    .join("uio"),
            )
        })?;
        tracing::debug!("Opening {} at {}", info.variant, info.pcie_address);
        let platform = Platform::linux(&info.pcie_address, &uio.to_string_lossy())?;
        VmeBridge::open(platform, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_function(root: &Path, address: &str, vendor: &str, device: &str, uio: Option<&str>) {
        let dir = root.join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
        fs::write(dir.join("device"), format!("{device}\n")).unwrap();
        if let Some(uio) = uio {
            fs::create_dir_all(dir.join("uio").join(uio)).unwrap();
        }
    }

    #[test]
    fn finds_supported_tundra_functions() {
        let root = std::env::temp_dir().join(format!("vme-sysfs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fake_function(&root, "0000:05:00.0", "0x10e3", "0x0148", Some("uio1"));
        fake_function(&root, "0000:03:00.0", "0x10e3", "0x0000", None);
        fake_function(&root, "0000:04:00.0", "0x10e3", "0x0513", None);
        fake_function(&root, "0000:06:00.0", "0x8086", "0x0148", None);

        let mgr = DeviceManager::discover_in(&root).unwrap();
        assert_eq!(mgr.device_count(), 2);
        let first = mgr.device(0).unwrap();
        assert_eq!(first.pcie_address, "0000:03:00.0");
        assert_eq!(first.variant, ChipVariant::Universe);
        assert_eq!(first.uio, None);
        let second = mgr.device(1).unwrap();
        assert_eq!(second.variant, ChipVariant::Tsi148);
        assert_eq!(second.uio.as_deref(), Some(Path::new("/dev/uio1")));
        assert_eq!(mgr.pcie_address(1).unwrap(), "0000:05:00.0");
        assert!(mgr.device(2).is_err());

        let err = mgr.open(0, BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, VmeError::DeviceNotFound { .. }));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn empty_tree_reports_no_devices() {
        let err = DeviceManager::discover_in("/nonexistent/vme-sysfs").unwrap_err();
        assert!(matches!(err, VmeError::NoDevicesFound));
    }

    #[test]
    #[ignore] // Requires hardware
    fn discover_real_bridge() {
        let mgr = DeviceManager::discover().unwrap();
        assert!(mgr.device_count() > 0);
    }
}
