//! Virtual to physical translation through `/proc/self/pagemap`
//!
//! Without an IOMMU the bridge masters PCI with physical addresses. Each
//! pagemap entry is 64 bits: bit 63 = present, bits 0-54 = page frame
//! number. Reading PFNs needs `CAP_SYS_ADMIN`; without it the kernel
//! reports zero and translation fails rather than returning address 0.

use crate::error::{Result, VmeError};
use crate::platform::DmaMemory;
use std::fs::File;

const PRESENT: u64 = 1 << 63;
const PFN_MASK: u64 = (1 << 55) - 1;

/// Pagemap-based [`DmaMemory`]
#[derive(Debug)]
pub struct PagemapTranslator {
    file: File,
    page_size: usize,
}

impl PagemapTranslator {
    /// Open this process's pagemap
    ///
    /// # Errors
    ///
    /// Returns error if `/proc/self/pagemap` cannot be opened.
    pub fn open() -> Result<Self> {
        let file = File::open("/proc/self/pagemap")?;
        Ok(Self {
            file,
            page_size: rustix::param::page_size(),
        })
    }
}

/// Physical address from a pagemap entry, `None` if absent or hidden
#[must_use]
pub fn entry_to_physical(entry: u64, vaddr: usize, page_size: usize) -> Option<u64> {
    let pfn = entry & PFN_MASK;
    if entry & PRESENT == 0 || pfn == 0 {
        return None;
    }
    Some(pfn * page_size as u64 + (vaddr % page_size) as u64)
}

impl DmaMemory for PagemapTranslator {
    fn bus_address(&self, vaddr: usize) -> Result<u64> {
        let index = (vaddr / self.page_size) as u64;
        let mut entry = [0u8; 8];
        let n = rustix::io::pread(&self.file, &mut entry, index * 8)
            .map_err(|e| VmeError::os("pagemap read failed", e))?;
        if n != entry.len() {
            return Err(VmeError::configuration(format!(
                "Short pagemap read for {vaddr:#x}"
            )));
        }
        entry_to_physical(u64::from_ne_bytes(entry), vaddr, self.page_size).ok_or_else(|| {
            VmeError::configuration(format!(
                "No physical page for {vaddr:#x} (not resident or no CAP_SYS_ADMIN)"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_present_entries() {
        let entry = PRESENT | 0x1234;
        assert_eq!(
            entry_to_physical(entry, 0x7000_0abc, 4096),
            Some(0x1234 * 4096 + 0xabc)
        );
    }

    #[test]
    fn rejects_absent_or_hidden() {
        assert_eq!(entry_to_physical(0x1234, 0, 4096), None);
        assert_eq!(entry_to_physical(PRESENT, 0, 4096), None);
    }
}
