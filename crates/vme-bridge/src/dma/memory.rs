//! DMA-visible memory
//!
//! [`DmaPage`] is one pinned, page-aligned page for descriptor chains.
//! [`PinnedRegion`] pins a caller's buffer for the duration of a transfer
//! and records which bus addresses back it.

use crate::error::{Result, VmeError};
use crate::platform::DmaMemory;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;
use vme_chip::PAGE_SIZE;

/// One locked, zeroed, page-aligned page with a known bus address
#[derive(Debug)]
pub struct DmaPage {
    ptr: NonNull<u8>,
    layout: Layout,
    bus_address: u64,
    memory: Arc<dyn DmaMemory>,
}

impl DmaPage {
    /// Allocate, lock and translate a page
    ///
    /// # Errors
    ///
    /// Returns error if allocation, locking or translation fails.
    pub fn new(memory: &Arc<dyn DmaMemory>) -> Result<Self> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE)
            .map_err(|e| VmeError::configuration(format!("Invalid DMA page layout: {e}")))?;

        // SAFETY: layout has non-zero size and a power-of-two alignment; the
        // block is released in Drop (or below on error) with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| VmeError::configuration("Failed to allocate DMA page"))?;

        if let Err(e) = memory.lock(ptr.as_ptr(), PAGE_SIZE) {
            // SAFETY: allocated above with this layout and not yet shared.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            return Err(e);
        }

        let bus_address = match memory.bus_address(ptr.as_ptr() as usize) {
            Ok(addr) => addr,
            Err(e) => {
                memory.unlock(ptr.as_ptr(), PAGE_SIZE);
                // SAFETY: as above.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                return Err(e);
            }
        };

        tracing::trace!("DMA page {ptr:p} at bus {bus_address:#x}");
        Ok(Self {
            ptr,
            layout,
            bus_address,
            memory: Arc::clone(memory),
        })
    }

    /// Bus address of the first byte
    #[must_use]
    pub const fn bus_address(&self) -> u64 {
        self.bus_address
    }

    /// Page contents
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for PAGE_SIZE initialised bytes for the
        // lifetime of self; &self excludes concurrent mutation through us.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Mutable page contents
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in as_slice, with &mut self giving exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for DmaPage {
    fn drop(&mut self) {
        self.memory.unlock(self.ptr.as_ptr(), PAGE_SIZE);
        // SAFETY: ptr came from alloc_zeroed with self.layout in new() and
        // nothing references the page once self is dropped.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        tracing::trace!("Freed DMA page at bus {:#x}", self.bus_address);
    }
}

// SAFETY: DmaPage owns its allocation exclusively; mutation requires &mut.
unsafe impl Send for DmaPage {}

// SAFETY: shared access is read-only.
unsafe impl Sync for DmaPage {}

/// Bus-contiguous piece of a pinned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusChunk {
    /// Offset of the chunk within the buffer
    pub offset: usize,
    /// Bus address of the first byte
    pub bus_address: u64,
    /// Length in bytes
    pub len: usize,
}

/// Caller memory locked for one transfer
#[derive(Debug)]
pub struct PinnedRegion {
    ptr: *const u8,
    len: usize,
    chunks: Vec<BusChunk>,
    memory: Arc<dyn DmaMemory>,
}

impl PinnedRegion {
    /// Lock `[ptr, ptr + len)` and translate it page by page, merging
    /// physically adjacent pages into chunks of at most `max_chunk` bytes
    ///
    /// # Errors
    ///
    /// Returns error if the memory cannot be locked or translated.
    pub fn pin(
        memory: &Arc<dyn DmaMemory>,
        ptr: *const u8,
        len: usize,
        max_chunk: usize,
    ) -> Result<Self> {
        if len == 0 || max_chunk == 0 {
            return Err(VmeError::configuration("Cannot pin an empty buffer"));
        }
        memory.lock(ptr, len)?;
        let region = Self {
            ptr,
            len,
            chunks: Vec::new(),
            memory: Arc::clone(memory),
        };
        region.translate(max_chunk)
    }

    fn translate(mut self, max_chunk: usize) -> Result<Self> {
        let start = self.ptr as usize;
        let mut offset = 0;
        while offset < self.len {
            let vaddr = start + offset;
            let page_left = PAGE_SIZE - vaddr % PAGE_SIZE;
            let mut n = page_left.min(self.len - offset);
            let mut bus = self.memory.bus_address(vaddr)?;

            while n > 0 {
                match self.chunks.last_mut() {
                    Some(last)
                        if last.bus_address + last.len as u64 == bus && last.len < max_chunk =>
                    {
                        let take = n.min(max_chunk - last.len);
                        last.len += take;
                        offset += take;
                        bus += take as u64;
                        n -= take;
                    }
                    _ => {
                        let take = n.min(max_chunk);
                        self.chunks.push(BusChunk {
                            offset,
                            bus_address: bus,
                            len: take,
                        });
                        offset += take;
                        bus += take as u64;
                        n -= take;
                    }
                }
            }
        }
        tracing::debug!(
            "Pinned {} bytes at {:p} as {} bus chunk(s)",
            self.len,
            self.ptr,
            self.chunks.len()
        );
        Ok(self)
    }

    /// Bus-contiguous chunks in buffer order
    #[must_use]
    pub fn chunks(&self) -> &[BusChunk] {
        &self.chunks
    }

    /// Pinned length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is pinned
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        self.memory.unlock(self.ptr, self.len);
    }
}
