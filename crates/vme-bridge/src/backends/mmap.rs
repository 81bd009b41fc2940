//! Memory-mapped access to the bridge
//!
//! [`MmapRegion`] owns one `mmap` of a device file. It backs both the
//! register region ([`MmioBus`], BAR0 through sysfs) and outbound window
//! mappings ([`DevMem`], physical addresses through `/dev/mem`).
//!
//! All accesses are bounds-checked; the only unsafe code is the mapping
//! itself and the volatile loads and stores into it.

use crate::bus::{check_bounds, RegisterBus};
use crate::error::{Result, VmeError};
use crate::platform::{BusMemory, MappedWindow};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use vme_chip::pcie::CONTROL_REGION_SIZE;

/// One shared mapping of a device file
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: PathBuf,
    offset: u64,
}

impl MmapRegion {
    /// Map `size` bytes of `path` starting at file offset `offset`
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The file cannot be opened read/write
    /// - `size` is zero
    /// - mmap fails
    pub fn open(path: &Path, offset: u64, size: usize) -> Result<Self> {
        tracing::debug!("Mapping {} @ {offset:#x} ({size:#x} bytes)", path.display());

        if size == 0 {
            return Err(VmeError::configuration(format!(
                "Refusing zero-length mapping of {}",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VmeError::device_not_found(path)
                } else {
                    VmeError::Io { source: e }
                }
            })?;

        // SAFETY: mmap preconditions hold:
        // - The descriptor is valid (just opened) and stays open in `_file`
        // - size is non-zero (checked above)
        // - MAP_SHARED with READ|WRITE is the required mode for device memory
        // - The kernel rejects offsets that are not page-aligned or out of range
        // - The mapping is released exactly once in Drop
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| VmeError::os("mmap failed", e))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| VmeError::configuration("mmap returned a null mapping"))?;

        tracing::info!("Mapped {} @ {offset:#x} at {ptr:p}", path.display());

        Ok(Self {
            ptr,
            size,
            _file: file,
            path: path.to_path_buf(),
            offset,
        })
    }

    /// Volatile 32-bit load
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        check_bounds(offset, 4, self.size)?;

        // SAFETY: Volatile read from mapped device memory.
        // - Bounds and 4-byte alignment validated above
        // - ptr is valid for `size` bytes for the lifetime of self
        // - read_volatile keeps the access a single bus cycle that the
        //   compiler may not merge, split or elide
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        Ok(value)
    }

    /// Volatile 32-bit store
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, self.size)?;

        // SAFETY: Volatile write to mapped device memory; same invariants as
        // read_u32. Stores have side effects on the device and must not be
        // reordered or elided.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }

    /// Volatile 16-bit load
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        self.check_half(offset)?;

        // SAFETY: as in read_u32, with 2-byte alignment validated above.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u16>().read_volatile() };
        Ok(value)
    }

    /// Volatile 16-bit store
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn write_u16(&self, offset: usize, value: u16) -> Result<()> {
        self.check_half(offset)?;

        // SAFETY: as in write_u32, with 2-byte alignment validated above.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u16>().write_volatile(value);
        }
        Ok(())
    }

    fn check_half(&self, offset: usize) -> Result<()> {
        if offset % 2 != 0 {
            return Err(VmeError::configuration(format!(
                "Unaligned 16-bit access at offset {offset:#x}"
            )));
        }
        self.check_range(offset, 2)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(VmeError::configuration(format!(
                "Out of bounds access: offset={offset:#x}, size={len}, limit={:#x}",
                self.size
            )));
        }
        Ok(())
    }

    /// Copy bytes out of the mapping
    ///
    /// # Errors
    ///
    /// Returns error if the read would exceed bounds
    pub fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        self.check_range(offset, buffer.len())?;

        // SAFETY: copy_nonoverlapping requirements hold:
        // - [offset, offset + len) is inside the mapping (checked above)
        // - buffer is a valid exclusive slice of len bytes
        // - Device memory and the caller's buffer cannot overlap
        // - u8 has alignment 1
        unsafe {
            let src = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    /// Copy bytes into the mapping
    ///
    /// # Errors
    ///
    /// Returns error if the write would exceed bounds
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;

        // SAFETY: as in read_bytes with source and destination exchanged.
        unsafe {
            let dst = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Mapped length in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// File this region maps
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!(
            "Unmapping {} @ {:#x} ({:#x} bytes)",
            self.path.display(),
            self.offset,
            self.size
        );

        // SAFETY: ptr and size are exactly what mmap returned and was given
        // in open(); this is the only munmap of the region.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: MmapRegion owns its mapping exclusively; the mapping stays valid
// while the value exists regardless of which thread holds it.
unsafe impl Send for MmapRegion {}

// SAFETY: Every access is a bounds-checked volatile load/store or a byte
// copy into device memory. The struct has no interior state besides the
// mapping itself; ordering between threads is the caller's concern, as it
// is for the hardware.
unsafe impl Sync for MmapRegion {}

impl MappedWindow for MmapRegion {
    fn len(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        self.read_u32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_u32(offset, value)
    }

    fn read16(&self, offset: usize) -> Result<u16> {
        self.read_u16(offset)
    }

    fn write16(&self, offset: usize, value: u16) -> Result<()> {
        self.write_u16(offset, value)
    }

    fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        Self::read_bytes(self, offset, buffer)
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        Self::write_bytes(self, offset, data)
    }
}

// ── Register bus ─────────────────────────────────────────────────────────────

/// Bridge registers through the sysfs BAR0 resource file
#[derive(Debug)]
pub struct MmioBus {
    region: MmapRegion,
    pcie_address: String,
}

impl MmioBus {
    /// Map BAR0 of the bridge at `pcie_address` (e.g. `0000:03:00.0`)
    ///
    /// # Errors
    ///
    /// Returns error if the resource file is missing or the BAR is smaller
    /// than the control region.
    pub fn open(pcie_address: &str) -> Result<Self> {
        let path = PathBuf::from(format!("/sys/bus/pci/devices/{pcie_address}/resource0"));
        let len = std::fs::metadata(&path)
            .map_err(|_| VmeError::device_not_found(&path))?
            .len();
        let size = usize::try_from(len).unwrap_or(usize::MAX);
        if size < CONTROL_REGION_SIZE {
            return Err(VmeError::configuration(format!(
                "BAR0 of {pcie_address} is {size:#x} bytes, need {CONTROL_REGION_SIZE:#x}"
            )));
        }

        let region = MmapRegion::open(&path, 0, CONTROL_REGION_SIZE)?;
        Ok(Self {
            region,
            pcie_address: pcie_address.to_string(),
        })
    }

    /// PCI address of the bridge
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }
}

impl RegisterBus for MmioBus {
    fn read32(&self, offset: usize) -> Result<u32> {
        self.region.read_u32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.region.write_u32(offset, value)
    }

    fn size(&self) -> usize {
        self.region.size()
    }
}

// ── Outbound windows ─────────────────────────────────────────────────────────

/// Maps physical PCI ranges through `/dev/mem`
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
}

impl DevMem {
    /// Use the standard `/dev/mem`
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/dev/mem"),
        }
    }

    /// Use another physical-memory device node
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DevMem {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMemory for DevMem {
    fn map(&self, pci_address: u64, size: usize) -> Result<Arc<dyn MappedWindow>> {
        let region = MmapRegion::open(&self.path, pci_address, size)?;
        Ok(Arc::new(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_mapping_is_rejected() {
        let err = MmapRegion::open(Path::new("/dev/null"), 0, 0).unwrap_err();
        assert!(matches!(err, VmeError::Configuration { .. }));
    }

    #[test]
    fn missing_device_is_reported() {
        let err = MmioBus::open("ffff:ff:1f.7").unwrap_err();
        assert!(matches!(err, VmeError::DeviceNotFound { .. }));
    }

    #[test]
    #[ignore] // Requires hardware
    fn map_first_bridge_bar0() {
        let devices = crate::discovery::DeviceManager::discover().unwrap();
        let bus = MmioBus::open(&devices.devices()[0].pcie_address).unwrap();
        assert_eq!(bus.size(), CONTROL_REGION_SIZE);
    }
}
