//! DMA engine
//!
//! A transfer is a list of [`DmaSegment`]s. Submission resolves every
//! endpoint to a bus address (pinning caller buffers), splits segments
//! wherever the backing memory is not bus-contiguous or a descriptor would
//! exceed the chip's byte limit, then starts the channel:
//!
//! - one resolved segment: registers are loaded directly
//! - more: a descriptor chain is built in a [`DescriptorArena`]
//!
//! The returned [`DmaTransfer`] holds the channel lock, the chain and the
//! pins until it is waited on, aborted or dropped. Completion is signalled
//! by the interrupt dispatcher; nothing here polls the done bit while a
//! transfer is running.

mod descriptor;
mod memory;

pub use descriptor::DescriptorArena;
pub use memory::{BusChunk, DmaPage, PinnedRegion};

use crate::chip::{BridgeChip, DmaStart};
use crate::config::DmaTuning;
use crate::error::{Result, VmeError};
use crate::irq::InterruptController;
use crate::platform::{DmaMemory, TickSource};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use vme_chip::attr::VmeAttributes;

/// Constant or incrementing fill pattern (Tsi148 source only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPattern {
    /// The same byte repeated
    Byte(u8),
    /// Bytes counting up from the given value
    ByteIncrement(u8),
    /// The same 32-bit word repeated (big-endian on the bus)
    Word(u32),
    /// Words counting up from the given value
    WordIncrement(u32),
}

impl DmaPattern {
    /// Pattern continued `offset` bytes later
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn advance(self, offset: u64) -> Self {
        match self {
            Self::ByteIncrement(v) => Self::ByteIncrement(v.wrapping_add(offset as u8)),
            Self::WordIncrement(v) => Self::WordIncrement(v.wrapping_add((offset / 4) as u32)),
            other => other,
        }
    }
}

/// One side of a caller-level segment
#[derive(Debug)]
pub enum DmaEndpoint<'a> {
    /// Raw PCI bus address
    Pci {
        /// Bus address
        address: u64,
    },
    /// Caller buffer read by the engine
    User(&'a [u8]),
    /// Caller buffer written by the engine
    UserMut(&'a mut [u8]),
    /// VME address
    Vme {
        /// VME address
        address: u64,
        /// Cycle attributes
        attrs: VmeAttributes,
    },
    /// Generated data (source only)
    Pattern(DmaPattern),
}

impl DmaEndpoint<'_> {
    fn user_buffer(&self) -> Option<(*const u8, usize)> {
        match self {
            Self::User(buf) => Some((buf.as_ptr(), buf.len())),
            Self::UserMut(buf) => Some((buf.as_ptr(), buf.len())),
            _ => None,
        }
    }

    fn fixed(&self) -> Option<BusEndpoint> {
        match *self {
            Self::Pci { address } => Some(BusEndpoint::Pci(address)),
            Self::Vme { address, attrs } => Some(BusEndpoint::Vme { address, attrs }),
            Self::Pattern(pattern) => Some(BusEndpoint::Pattern(pattern)),
            Self::User(_) | Self::UserMut(_) => None,
        }
    }
}

/// Caller-level unit of work: copy `length` bytes from source to destination
#[derive(Debug)]
pub struct DmaSegment<'a> {
    /// Where the data comes from
    pub source: DmaEndpoint<'a>,
    /// Where it goes
    pub destination: DmaEndpoint<'a>,
    /// Bytes to move; caller buffers must be at least this long
    pub length: usize,
}

impl<'a> DmaSegment<'a> {
    /// Segment of `length` bytes
    #[must_use]
    pub const fn new(source: DmaEndpoint<'a>, destination: DmaEndpoint<'a>, length: usize) -> Self {
        Self {
            source,
            destination,
            length,
        }
    }

    /// Read VME memory into `buffer`
    #[must_use]
    pub fn vme_to_user(address: u64, attrs: VmeAttributes, buffer: &'a mut [u8]) -> Self {
        let length = buffer.len();
        Self::new(
            DmaEndpoint::Vme { address, attrs },
            DmaEndpoint::UserMut(buffer),
            length,
        )
    }

    /// Write `buffer` to VME memory
    #[must_use]
    pub fn user_to_vme(buffer: &'a [u8], address: u64, attrs: VmeAttributes) -> Self {
        Self::new(
            DmaEndpoint::User(buffer),
            DmaEndpoint::Vme { address, attrs },
            buffer.len(),
        )
    }
}

/// Endpoint reduced to something the engine can address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEndpoint {
    /// PCI bus address
    Pci(u64),
    /// VME address and cycle attributes
    Vme {
        /// VME address
        address: u64,
        /// Cycle attributes
        attrs: VmeAttributes,
    },
    /// Generated data
    Pattern(DmaPattern),
}

impl BusEndpoint {
    /// Same endpoint `offset` bytes further on
    #[must_use]
    pub const fn advance(self, offset: u64) -> Self {
        match self {
            Self::Pci(address) => Self::Pci(address + offset),
            Self::Vme { address, attrs } => Self::Vme {
                address: address + offset,
                attrs,
            },
            Self::Pattern(pattern) => Self::Pattern(pattern.advance(offset)),
        }
    }

    /// Address if this is not a pattern
    #[must_use]
    pub const fn address(&self) -> Option<u64> {
        match self {
            Self::Pci(address) | Self::Vme { address, .. } => Some(*address),
            Self::Pattern(_) => None,
        }
    }
}

/// One descriptor's worth of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSegment {
    /// Source
    pub source: BusEndpoint,
    /// Destination
    pub destination: BusEndpoint,
    /// Byte count
    pub length: u32,
}

/// Decoded channel status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaStatus {
    /// Raw status register
    pub raw: u32,
    /// Channel active
    pub busy: bool,
    /// Chain completed
    pub done: bool,
    /// Bus error terminated the chain
    pub error: bool,
    /// Channel was stopped
    pub aborted: bool,
}

/// Channel registers captured at a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaSnapshot {
    /// Current descriptor pointer
    pub descriptor: u64,
    /// Control register
    pub control: u32,
    /// Remaining byte count
    pub count: u32,
    /// Current source address
    pub source: u64,
    /// Current destination address
    pub destination: u64,
}

impl fmt::Display for DmaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "descriptor={:#x} control={:#010x} count={:#x} src={:#x} dst={:#x}",
            self.descriptor, self.control, self.count, self.source, self.destination
        )
    }
}

/// Outcome of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCompletion {
    /// Channel used
    pub channel: usize,
    /// Final status
    pub status: DmaStatus,
    /// Tick read just before GO
    pub start_tick: u32,
    /// Tick recorded by the interrupt dispatcher
    pub stop_tick: u32,
    /// Transfer time with interrupt latency removed
    pub elapsed: Duration,
    /// Bytes moved
    pub bytes: u64,
    /// Descriptors executed (1 in direct mode)
    pub descriptors: usize,
}

impl DmaCompletion {
    /// Throughput in MB/s, 0 when too fast to measure
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput_mb_s(&self) -> f64 {
        let us = self.elapsed.as_micros();
        if us == 0 {
            0.0
        } else {
            self.bytes as f64 / us as f64
        }
    }
}

/// Endpoint for the piece starting at `offset`, shrinking `n` so the piece
/// stays inside the current chunk of a pinned side.
fn piece(
    fixed: Option<BusEndpoint>,
    chunk: Option<&BusChunk>,
    offset: usize,
    n: &mut usize,
) -> Result<BusEndpoint> {
    match (fixed, chunk) {
        (Some(fixed), _) => Ok(fixed.advance(offset as u64)),
        (None, Some(chunk)) => {
            *n = (*n).min(chunk.offset + chunk.len - offset);
            Ok(BusEndpoint::Pci(
                chunk.bus_address + (offset - chunk.offset) as u64,
            ))
        }
        (None, None) => Err(VmeError::configuration(format!(
            "No pinned memory backs segment offset {offset:#x}"
        ))),
    }
}

/// DMA channels of one bridge
#[derive(Debug)]
pub struct DmaEngine {
    chip: Arc<dyn BridgeChip>,
    memory: Arc<dyn DmaMemory>,
    ticks: Arc<dyn TickSource>,
    irq: Arc<InterruptController>,
    channels: Vec<Mutex<()>>,
    tuning: DmaTuning,
}

/// How long a hard stop may take before the channel is declared wedged
const ABORT_SETTLE: Duration = Duration::from_millis(100);

impl DmaEngine {
    /// Engine over every channel of `chip`
    pub fn new(
        chip: Arc<dyn BridgeChip>,
        memory: Arc<dyn DmaMemory>,
        ticks: Arc<dyn TickSource>,
        irq: Arc<InterruptController>,
        tuning: DmaTuning,
    ) -> Self {
        let channels = (0..chip.dma_channels()).map(|_| Mutex::new(())).collect();
        Self {
            chip,
            memory,
            ticks,
            irq,
            channels,
            tuning,
        }
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Default tuning
    pub const fn tuning(&self) -> &DmaTuning {
        &self.tuning
    }

    /// Start a transfer with the default tuning
    ///
    /// Blocks while another transfer holds `channel`.
    ///
    /// # Errors
    ///
    /// `Configuration`/`UnsupportedAddressSpace` for segments the engine
    /// cannot execute, or pinning and register errors. Nothing is started
    /// on error.
    pub fn submit<'a>(
        &'a self,
        segments: Vec<DmaSegment<'a>>,
        channel: usize,
    ) -> Result<DmaTransfer<'a>> {
        self.submit_tuned(segments, channel, self.tuning)
    }

    /// Start a transfer with explicit tuning
    ///
    /// # Errors
    ///
    /// As [`DmaEngine::submit`].
    pub fn submit_tuned<'a>(
        &'a self,
        segments: Vec<DmaSegment<'a>>,
        channel: usize,
        tuning: DmaTuning,
    ) -> Result<DmaTransfer<'a>> {
        let lock = self.channels.get(channel).ok_or_else(|| {
            VmeError::configuration(format!(
                "DMA channel {channel} out of range ({} available)",
                self.channels.len()
            ))
        })?;
        if segments.is_empty() {
            return Err(VmeError::configuration("DMA transfer has no segments"));
        }

        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let max = self.chip.max_descriptor_bytes() as usize;
        let mut pinned = Vec::new();
        let mut resolved = Vec::new();
        for segment in &segments {
            self.resolve(segment, max, &mut pinned, &mut resolved)?;
        }
        for segment in &resolved {
            self.chip.validate_segment(segment)?;
        }
        let bytes = resolved.iter().map(|s| u64::from(s.length)).sum();

        let arena = if resolved.len() > 1 {
            Some(DescriptorArena::build(&self.memory, self.chip.as_ref(), &resolved)?)
        } else {
            None
        };
        let start = match &arena {
            Some(arena) => DmaStart::Chained { head: arena.head() },
            None => DmaStart::Direct(&resolved[0]),
        };

        self.chip.clear_dma(channel)?;
        self.irq.reset_dma(channel);
        let start_tick = self
            .chip
            .start_dma(channel, start, &tuning, self.ticks.as_ref())?;

        tracing::debug!(
            "DMA{channel}: {bytes} bytes in {} descriptor(s), {} mode",
            resolved.len(),
            if arena.is_some() { "chained" } else { "direct" }
        );

        Ok(DmaTransfer {
            engine: self,
            channel,
            _arena: arena,
            _pinned: pinned,
            _guard: guard,
            _buffers: PhantomData,
            start_tick,
            bytes,
            descriptors: resolved.len(),
            finished: false,
        })
    }

    /// Split one caller segment into bus-contiguous pieces
    fn resolve(
        &self,
        segment: &DmaSegment<'_>,
        max: usize,
        pinned: &mut Vec<PinnedRegion>,
        out: &mut Vec<ResolvedSegment>,
    ) -> Result<()> {
        let length = segment.length;
        if length == 0 {
            return Err(VmeError::configuration("DMA segment of zero bytes"));
        }
        if matches!(segment.destination, DmaEndpoint::Pattern(_) | DmaEndpoint::User(_)) {
            return Err(VmeError::configuration(
                "DMA destination must be writable (PCI, VME or a mutable buffer)",
            ));
        }
        if matches!(segment.source, DmaEndpoint::UserMut(_)) {
            return Err(VmeError::configuration(
                "Pass a DMA source buffer as DmaEndpoint::User",
            ));
        }

        let source_chunks = self.side_chunks(&segment.source, length, max, pinned)?;
        let destination_chunks = self.side_chunks(&segment.destination, length, max, pinned)?;
        let source_fixed = segment.source.fixed();
        let destination_fixed = segment.destination.fixed();

        // Walk both sides, cutting wherever either side's chunk ends
        let (mut si, mut di) = (0, 0);
        let mut offset = 0;
        while offset < length {
            let mut n = (length - offset).min(max);
            let source = piece(source_fixed, source_chunks.get(si), offset, &mut n)?;
            let destination =
                piece(destination_fixed, destination_chunks.get(di), offset, &mut n)?;

            offset += n;
            if source_chunks.get(si).is_some_and(|c| c.offset + c.len == offset) {
                si += 1;
            }
            if destination_chunks.get(di).is_some_and(|c| c.offset + c.len == offset) {
                di += 1;
            }
            out.push(ResolvedSegment {
                source,
                destination,
                length: u32::try_from(n)
                    .map_err(|_| VmeError::configuration("DMA piece exceeds 4 GiB"))?,
            });
        }
        Ok(())
    }

    /// Pin a caller buffer side and return its chunks (empty for fixed sides)
    fn side_chunks(
        &self,
        endpoint: &DmaEndpoint<'_>,
        length: usize,
        max: usize,
        pinned: &mut Vec<PinnedRegion>,
    ) -> Result<Vec<BusChunk>> {
        let Some((ptr, len)) = endpoint.user_buffer() else {
            return Ok(Vec::new());
        };
        if len < length {
            return Err(VmeError::configuration(format!(
                "DMA buffer of {len} bytes is shorter than the {length}-byte segment"
            )));
        }
        let region = PinnedRegion::pin(&self.memory, ptr, length, max)?;
        let chunks = region.chunks().to_vec();
        pinned.push(region);
        Ok(chunks)
    }

    fn completion(
        &self,
        channel: usize,
        status: DmaStatus,
        start_tick: u32,
        stop_tick: u32,
        bytes: u64,
        descriptors: usize,
    ) -> DmaCompletion {
        let ticks = stop_tick
            .wrapping_sub(start_tick)
            .saturating_sub(self.irq.overhead_ticks());
        let per_us = self.ticks.ticks_per_us().max(1);
        DmaCompletion {
            channel,
            status,
            start_tick,
            stop_tick,
            elapsed: Duration::from_nanos(u64::from(ticks) * 1000 / u64::from(per_us)),
            bytes,
            descriptors,
        }
    }

    /// Stop a channel and wait (bounded) for it to go idle
    fn hard_stop(&self, channel: usize) -> Result<DmaStatus> {
        self.chip.abort_dma(channel)?;
        let deadline = Instant::now() + ABORT_SETTLE;
        loop {
            let status = self.chip.dma_status(channel)?;
            if !status.busy {
                self.chip.clear_dma(channel)?;
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(VmeError::timeout(format!("DMA{channel} abort"), ABORT_SETTLE));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// A running transfer
///
/// Owns the channel until it is waited on, aborted or dropped. Dropping an
/// unfinished transfer hard-stops the channel before the caller's buffers
/// are released.
#[derive(Debug)]
pub struct DmaTransfer<'a> {
    engine: &'a DmaEngine,
    channel: usize,
    _arena: Option<DescriptorArena>,
    _pinned: Vec<PinnedRegion>,
    _guard: MutexGuard<'a, ()>,
    _buffers: PhantomData<&'a mut [u8]>,
    start_tick: u32,
    bytes: u64,
    descriptors: usize,
    finished: bool,
}

impl DmaTransfer<'_> {
    /// Channel in use
    #[must_use]
    pub const fn channel(&self) -> usize {
        self.channel
    }

    /// Tick read just before GO
    #[must_use]
    pub const fn start_tick(&self) -> u32 {
        self.start_tick
    }

    /// Total bytes in the transfer
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Descriptors in the transfer (1 in direct mode)
    #[must_use]
    pub const fn descriptors(&self) -> usize {
        self.descriptors
    }

    /// Block until the completion interrupt or `timeout`
    ///
    /// # Errors
    ///
    /// - `Timeout`: the channel was hard-stopped; the destination may be
    ///   partially written
    /// - `DmaAborted`: someone stopped the channel
    /// - `DmaFailed`: the chain ended without the done bit
    pub fn wait(mut self, timeout: Duration) -> Result<DmaCompletion> {
        let engine = self.engine;
        let channel = self.channel;
        let Some(stop_tick) = engine.irq.wait_dma(channel, timeout) else {
            self.finished = true;
            let status = engine.hard_stop(channel)?;
            tracing::warn!("DMA{channel} timed out, stopped with status {:#010x}", status.raw);
            return Err(VmeError::timeout(format!("DMA{channel} wait"), timeout));
        };
        self.finished = true;
        self.finish(stop_tick)
    }

    fn finish(&self, stop_tick: u32) -> Result<DmaCompletion> {
        let engine = self.engine;
        let channel = self.channel;
        let status = engine.chip.dma_status(channel)?;
        if status.done && !status.error {
            engine.chip.clear_dma(channel)?;
            return Ok(engine.completion(
                channel,
                status,
                self.start_tick,
                stop_tick,
                self.bytes,
                self.descriptors,
            ));
        }

        if status.aborted && !status.error {
            engine.chip.clear_dma(channel)?;
            return Err(VmeError::DmaAborted {
                channel,
                status: status.raw,
            });
        }
        let snapshot = engine.chip.dma_snapshot(channel)?;
        engine.chip.clear_dma(channel)?;
        Err(VmeError::DmaFailed {
            channel,
            status: status.raw,
            snapshot,
        })
    }

    /// Hard-stop the transfer
    ///
    /// Returns the completion if the chain had already finished.
    ///
    /// # Errors
    ///
    /// `DmaAborted` if the channel was still running; the destination may
    /// be partially written.
    pub fn abort(mut self) -> Result<DmaCompletion> {
        let engine = self.engine;
        let channel = self.channel;
        self.finished = true;

        if let Some(stop_tick) = engine.irq.wait_dma(channel, Duration::ZERO) {
            return self.finish(stop_tick);
        }
        let status = engine.hard_stop(channel)?;
        tracing::debug!("DMA{channel} aborted with status {:#010x}", status.raw);
        Err(VmeError::DmaAborted {
            channel,
            status: status.raw,
        })
    }
}

impl Drop for DmaTransfer<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.engine.irq.wait_dma(self.channel, Duration::ZERO).is_some() {
            return;
        }
        tracing::warn!("DMA{} dropped while running, stopping channel", self.channel);
        if let Err(e) = self.engine.hard_stop(self.channel) {
            tracing::error!("DMA{} did not stop: {e}", self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vme_chip::attr::{AddressSpace, DataWidth};

    #[test]
    fn descriptors_per_page() {
        assert_eq!(DescriptorArena::per_page(32), 127);
        assert_eq!(DescriptorArena::per_page(40), 101);
    }

    #[test]
    fn endpoints_advance() {
        let attrs = VmeAttributes::sct(AddressSpace::A24, DataWidth::D16);
        assert_eq!(
            BusEndpoint::Vme { address: 0x100, attrs }.advance(0x20),
            BusEndpoint::Vme { address: 0x120, attrs }
        );
        assert_eq!(BusEndpoint::Pci(0x1000).advance(4).address(), Some(0x1004));
        assert_eq!(
            BusEndpoint::Pattern(DmaPattern::WordIncrement(10)).advance(8),
            BusEndpoint::Pattern(DmaPattern::WordIncrement(12))
        );
        assert_eq!(
            DmaPattern::ByteIncrement(0xFF).advance(2),
            DmaPattern::ByteIncrement(1)
        );
        assert_eq!(DmaPattern::Byte(7).advance(100), DmaPattern::Byte(7));
    }

    #[test]
    fn snapshot_display() {
        let snapshot = DmaSnapshot {
            descriptor: 0x1000,
            control: 0x8000_0000,
            count: 4,
            source: 0x2000,
            destination: 0x3000,
        };
        let text = snapshot.to_string();
        assert!(text.contains("descriptor=0x1000"));
        assert!(text.contains("control=0x80000000"));
    }
}
