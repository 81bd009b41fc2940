//! Descriptor chains
//!
//! A chain lives in whole pages; each page holds `PAGE_SIZE / size - 1`
//! descriptors and the chain simply continues on the next page. Every
//! descriptor's bus address is known before encoding, so links are written
//! in a single pass and the last descriptor carries the end marker.

use super::ResolvedSegment;
use super::memory::DmaPage;
use crate::chip::BridgeChip;
use crate::error::{Result, VmeError};
use crate::platform::DmaMemory;
use std::sync::Arc;
use vme_chip::PAGE_SIZE;

/// Pages holding one transfer's descriptor chain
#[derive(Debug)]
pub struct DescriptorArena {
    pages: Vec<DmaPage>,
    descriptor_size: usize,
    count: usize,
}

impl DescriptorArena {
    /// Descriptors that fit on one page
    #[must_use]
    pub const fn per_page(descriptor_size: usize) -> usize {
        PAGE_SIZE / descriptor_size - 1
    }

    /// Allocate and encode a chain for `segments`
    ///
    /// # Errors
    ///
    /// Returns error if page allocation fails or the chip cannot encode a
    /// segment.
    pub fn build(
        memory: &Arc<dyn DmaMemory>,
        chip: &dyn BridgeChip,
        segments: &[ResolvedSegment],
    ) -> Result<Self> {
        if segments.is_empty() {
            return Err(VmeError::configuration("Empty descriptor chain"));
        }
        let size = chip.descriptor_size();
        let per_page = Self::per_page(size);

        let mut pages = Vec::with_capacity(segments.len().div_ceil(per_page));
        for _ in 0..segments.len().div_ceil(per_page) {
            pages.push(DmaPage::new(memory)?);
        }

        let mut arena = Self {
            pages,
            descriptor_size: size,
            count: segments.len(),
        };

        for (i, segment) in segments.iter().enumerate() {
            let next = (i + 1 < segments.len()).then(|| arena.address_of(i + 1));
            let (page, offset) = (i / per_page, (i % per_page) * size);
            let out = &mut arena.pages[page].as_mut_slice()[offset..offset + size];
            chip.encode_descriptor(segment, next, out)?;
        }

        tracing::debug!(
            "Built {} descriptor(s) on {} page(s), head {:#x}",
            arena.count,
            arena.pages.len(),
            arena.head()
        );
        Ok(arena)
    }

    /// Bus address of descriptor `i`
    #[must_use]
    pub fn address_of(&self, i: usize) -> u64 {
        let per_page = Self::per_page(self.descriptor_size);
        self.pages[i / per_page].bus_address() + ((i % per_page) * self.descriptor_size) as u64
    }

    /// Bus address of the first descriptor
    #[must_use]
    pub fn head(&self) -> u64 {
        self.address_of(0)
    }

    /// Number of descriptors
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether the chain is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded bytes of descriptor `i`
    #[must_use]
    pub fn descriptor(&self, i: usize) -> &[u8] {
        let per_page = Self::per_page(self.descriptor_size);
        let offset = (i % per_page) * self.descriptor_size;
        &self.pages[i / per_page].as_slice()[offset..offset + self.descriptor_size]
    }

    /// Pages used
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedBridge;
    use crate::chip::probe;
    use crate::dma::BusEndpoint;
    use vme_chip::attr::{AddressSpace, DataWidth, VmeAttributes};
    use vme_chip::pcie::ChipVariant;
    use vme_chip::{tsi148, universe};

    fn page_segments(n: usize) -> Vec<ResolvedSegment> {
        let attrs = VmeAttributes::sct(AddressSpace::A32, DataWidth::D32);
        (0..n)
            .map(|i| ResolvedSegment {
                source: BusEndpoint::Pci(0x1000_0000 + (i * PAGE_SIZE) as u64),
                destination: BusEndpoint::Vme {
                    address: 0x0200_0000 + (i * PAGE_SIZE) as u64,
                    attrs,
                },
                length: PAGE_SIZE as u32,
            })
            .collect()
    }

    /// Next-descriptor word(s) of an encoded descriptor
    fn link(variant: ChipVariant, encoded: &[u8]) -> u64 {
        let word = |i: usize| -> [u8; 4] { encoded[i * 4..i * 4 + 4].try_into().unwrap() };
        match variant {
            ChipVariant::Universe => u64::from(u32::from_le_bytes(word(universe::packet::DCPP))),
            _ => {
                let hi = u32::from_be_bytes(word(tsi148::descriptor::DNLAU));
                let lo = u32::from_be_bytes(word(tsi148::descriptor::DNLAL));
                (u64::from(hi) << 32) | u64::from(lo)
            }
        }
    }

    #[test]
    fn chain_continues_on_the_next_page() {
        for sim in [SimulatedBridge::universe(), SimulatedBridge::tsi148()] {
            let memory: Arc<dyn DmaMemory> = sim.clone();
            let chip = probe(sim.clone()).unwrap();
            let per_page = DescriptorArena::per_page(chip.descriptor_size());

            let arena =
                DescriptorArena::build(&memory, chip.as_ref(), &page_segments(per_page + 2))
                    .unwrap();
            assert_eq!(arena.len(), per_page + 2);
            assert_eq!(arena.pages(), 2);

            let first_on_next = arena.address_of(per_page);
            assert_eq!(first_on_next % PAGE_SIZE as u64, 0);
            assert_ne!(first_on_next, arena.head());
            assert_eq!(
                link(sim.variant(), arena.descriptor(per_page - 1)),
                first_on_next
            );
            assert_eq!(
                link(sim.variant(), arena.descriptor(per_page)),
                arena.address_of(per_page + 1)
            );

            let end = match sim.variant() {
                ChipVariant::Universe => u64::from(universe::packet::END),
                _ => u64::from(tsi148::descriptor::LLA),
            };
            assert_eq!(link(sim.variant(), arena.descriptor(per_page + 1)), end);
        }
    }

    #[test]
    fn empty_chain_is_refused() {
        let sim = SimulatedBridge::tsi148();
        let memory: Arc<dyn DmaMemory> = sim.clone();
        let chip = probe(sim).unwrap();
        let err = DescriptorArena::build(&memory, chip.as_ref(), &[]).unwrap_err();
        assert!(matches!(err, VmeError::Configuration { .. }));
    }
}
