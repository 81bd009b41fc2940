//! Legacy register transport through a character device
//!
//! Older kernel drivers expose the bridge registers as a device node where
//! a 4-byte `pread`/`pwrite` at offset `n` reads or writes register `n`.
//! Slower than [`MmioBus`](super::MmioBus) (one syscall per access) but
//! works where BAR0 cannot be mapped.

use crate::bus::{check_bounds, RegisterBus};
use crate::error::{Result, VmeError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use vme_chip::pcie::CONTROL_REGION_SIZE;

/// Default node created by the legacy driver
pub const DEFAULT_REGISTER_DEVICE: &str = "/dev/vme_regs";

/// Register access through `pread`/`pwrite`
#[derive(Debug)]
pub struct CharDeviceBus {
    file: File,
    path: PathBuf,
}

impl CharDeviceBus {
    /// Open a register device node
    ///
    /// # Errors
    ///
    /// Returns error if the node does not exist or cannot be opened read/write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VmeError::device_not_found(path));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        tracing::info!("Opened register device {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Device node path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegisterBus for CharDeviceBus {
    fn read32(&self, offset: usize) -> Result<u32> {
        check_bounds(offset, 4, CONTROL_REGION_SIZE)?;
        let mut buf = [0u8; 4];
        let n = rustix::io::pread(&self.file, &mut buf, offset as u64)
            .map_err(|e| VmeError::os("register pread failed", e))?;
        if n != buf.len() {
            return Err(VmeError::configuration(format!(
                "Short register read at {offset:#x}: {n} bytes"
            )));
        }
        Ok(u32::from_ne_bytes(buf))
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, CONTROL_REGION_SIZE)?;
        let n = rustix::io::pwrite(&self.file, &value.to_ne_bytes(), offset as u64)
            .map_err(|e| VmeError::os("register pwrite failed", e))?;
        if n != 4 {
            return Err(VmeError::configuration(format!(
                "Short register write at {offset:#x}: {n} bytes"
            )));
        }
        Ok(())
    }

    fn size(&self) -> usize {
        CONTROL_REGION_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node() {
        let err = CharDeviceBus::open("/dev/does-not-exist-vme").unwrap_err();
        assert!(matches!(err, VmeError::DeviceNotFound { .. }));
    }

    #[test]
    fn out_of_range_offset_is_rejected_before_io() {
        let bus = CharDeviceBus::open("/dev/zero").unwrap();
        assert!(bus.read32(CONTROL_REGION_SIZE).is_err());
        assert_eq!(bus.read32(0x10).unwrap(), 0);
    }
}
