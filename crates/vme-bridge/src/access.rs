//! Read/write convenience API
//!
//! [`VmeInterface`] binds one outbound window and one DMA channel to a VME
//! range and picks the path per request: single cycles through the window
//! for short transfers, DMA for long ones or whenever a block protocol is
//! configured.

use crate::bridge::VmeBridge;
use crate::config::VmeInterfaceConfig;
use crate::dma::DmaSegment;
use crate::error::{Result, VmeError};
use crate::window::OutboundWindow;
use bytes::{Bytes, BytesMut};

/// Offset-addressed access to a configured VME range
#[derive(Debug)]
pub struct VmeInterface<'b> {
    bridge: &'b VmeBridge,
    config: VmeInterfaceConfig,
}

impl<'b> VmeInterface<'b> {
    /// Program the outbound window described by `config`
    ///
    /// # Errors
    ///
    /// As [`VmeBridge::configure_outbound`], plus `Configuration` for a DMA
    /// channel the bridge lacks.
    pub fn new(bridge: &'b VmeBridge, config: VmeInterfaceConfig) -> Result<Self> {
        if config.dma_channel >= bridge.dma().channels() {
            return Err(VmeError::configuration(format!(
                "DMA channel {} out of range ({} available)",
                config.dma_channel,
                bridge.dma().channels()
            )));
        }
        let window = OutboundWindow::new(
            config.window,
            config.pci_base,
            config.size,
            config.vme_base,
            config.window_attributes(),
        );
        bridge.configure_outbound(&window)?;
        Ok(Self { bridge, config })
    }

    /// Settings in effect
    pub const fn config(&self) -> &VmeInterfaceConfig {
        &self.config
    }

    fn address(&self, offset: u64, len: usize) -> Result<u64> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.config.size) {
            return Err(VmeError::configuration(format!(
                "Access {offset:#x}+{len:#x} outside the {:#x}-byte range",
                self.config.size
            )));
        }
        Ok(self.config.vme_base + offset)
    }

    fn use_dma(&self, len: usize) -> bool {
        len >= self.config.dma_threshold || self.config.protocol.is_block()
    }

    /// Read `len` bytes at `offset`
    ///
    /// # Errors
    ///
    /// `Configuration` for a range outside the interface, bus errors, or
    /// any DMA failure.
    pub fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let address = self.address(offset, len)?;
        let mut buffer = BytesMut::zeroed(len);
        if len == 0 {
            return Ok(buffer.freeze());
        }
        if self.use_dma(len) {
            let segment =
                DmaSegment::vme_to_user(address, self.config.dma_attributes(), &mut buffer);
            self.bridge
                .dma()
                .submit(vec![segment], self.config.dma_channel)?
                .wait(self.bridge.config().dma_timeout)?;
        } else {
            self.bridge
                .read_bytes(address, self.config.space, &mut buffer)?;
        }
        Ok(buffer.freeze())
    }

    /// Write `data` at `offset`
    ///
    /// # Errors
    ///
    /// As [`VmeInterface::read`].
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let address = self.address(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        if self.use_dma(data.len()) {
            let segment = DmaSegment::user_to_vme(data, address, self.config.dma_attributes());
            self.bridge
                .dma()
                .submit(vec![segment], self.config.dma_channel)?
                .wait(self.bridge.config().dma_timeout)?;
            Ok(())
        } else {
            self.bridge.write_bytes(address, self.config.space, data)
        }
    }

    /// Single 32-bit read at `offset`
    ///
    /// # Errors
    ///
    /// `Configuration` for a range outside the interface, or a bus error.
    pub fn read32(&self, offset: u64) -> Result<u32> {
        let address = self.address(offset, 4)?;
        self.bridge.read32(address, self.config.space)
    }

    /// Single 32-bit write at `offset`
    ///
    /// # Errors
    ///
    /// As [`VmeInterface::read32`].
    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        let address = self.address(offset, 4)?;
        self.bridge.write32(address, self.config.space, value)
    }

    /// Single 16-bit read at `offset`
    ///
    /// # Errors
    ///
    /// As [`VmeInterface::read32`], or `Configuration` for an odd offset.
    pub fn read16(&self, offset: u64) -> Result<u16> {
        let address = self.address(offset, 2)?;
        self.bridge.read16(address, self.config.space)
    }

    /// Single 16-bit write at `offset`
    ///
    /// # Errors
    ///
    /// As [`VmeInterface::read16`].
    pub fn write16(&self, offset: u64, value: u16) -> Result<()> {
        let address = self.address(offset, 2)?;
        self.bridge.write16(address, self.config.space, value)
    }
}
