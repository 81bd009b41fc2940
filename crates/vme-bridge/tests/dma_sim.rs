//! DMA engine tests against the simulated backplane
//!
//! Buffers are placed so their address and the VME address share the same
//! 8-byte phase, which the ca91c042 engine requires.

use std::sync::Arc;
use std::time::Duration;
use vme_bridge::backends::SimulatedBridge;
use vme_bridge::pcie_ids::ChipVariant;
use vme_bridge::{
    AddressSpace, BridgeConfig, DataWidth, DmaEndpoint, DmaPattern, DmaSegment, Platform,
    Protocol, VmeAttributes, VmeBridge, VmeError,
};

const VME_BASE: u64 = 0x0200_0000;
const WAIT: Duration = Duration::from_secs(10);

fn open(sim: &Arc<SimulatedBridge>) -> VmeBridge {
    VmeBridge::open(Platform::simulated(sim), BridgeConfig::default()).unwrap()
}

fn both_chips() -> [Arc<SimulatedBridge>; 2] {
    [SimulatedBridge::universe(), SimulatedBridge::tsi148()]
}

fn a32() -> VmeAttributes {
    VmeAttributes::sct(AddressSpace::A32, DataWidth::D32)
}

/// `len` bytes of `storage` starting on an 8-byte boundary
fn aligned(storage: &mut Vec<u8>, len: usize) -> &mut [u8] {
    storage.resize(len + 8, 0);
    let skip = (8 - storage.as_ptr() as usize % 8) % 8;
    &mut storage[skip..skip + len]
}

fn fill(buffer: &mut [u8], seed: usize) {
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = ((i * 7 + seed) % 253) as u8;
    }
}

/// Write a pattern to VME by DMA, check it landed, and read it back by DMA
fn loopback(sim: &SimulatedBridge, bridge: &VmeBridge, address: u64, len: usize) {
    let mut source_storage = Vec::new();
    let source = aligned(&mut source_storage, len);
    fill(source, len);

    let written = bridge
        .dma()
        .submit(vec![DmaSegment::user_to_vme(source, address, a32())], 0)
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert_eq!(written.bytes, len as u64);
    assert!(written.status.done);

    let mut on_bus = vec![0u8; len];
    sim.vme_read(AddressSpace::A32, address, &mut on_bus).unwrap();
    assert!(on_bus == *source, "{len}-byte write did not land");

    let mut back_storage = Vec::new();
    let back = aligned(&mut back_storage, len);
    bridge
        .dma()
        .submit(vec![DmaSegment::vme_to_user(address, a32(), back)], 0)
        .unwrap()
        .wait(WAIT)
        .unwrap();
    assert!(*back == *source, "{len}-byte read back differs");
}

#[test]
fn loopback_at_page_boundaries() {
    for sim in both_chips() {
        let bridge = open(&sim);
        for len in [1, 4, 4095, 4096, 4097] {
            loopback(&sim, &bridge, VME_BASE, len);
        }
    }
}

#[test]
fn loopback_at_largest_count() {
    for sim in both_chips() {
        let bridge = open(&sim);
        loopback(&sim, &bridge, VME_BASE, 0xFF_FFFF);
    }
}

#[test]
fn several_segments_make_a_chain() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let lengths = [100usize, 4096, 24];
        let mut storages: Vec<Vec<u8>> = vec![Vec::new(); lengths.len()];
        let mut sources: Vec<&mut [u8]> = Vec::new();
        for (storage, &len) in storages.iter_mut().zip(&lengths) {
            let buffer = aligned(storage, len);
            fill(buffer, len);
            sources.push(buffer);
        }

        let segments = sources
            .iter()
            .enumerate()
            .map(|(i, source)| {
                DmaSegment::user_to_vme(source, VME_BASE + 0x1_0000 * i as u64, a32())
            })
            .collect();
        let transfer = bridge.dma().submit(segments, 0).unwrap();
        assert!(transfer.descriptors() >= 3);
        let done = transfer.wait(WAIT).unwrap();
        assert_eq!(done.bytes, lengths.iter().sum::<usize>() as u64);
        assert!(done.descriptors >= 3);

        for (i, source) in sources.iter().enumerate() {
            let mut on_bus = vec![0u8; source.len()];
            sim.vme_read(AddressSpace::A32, VME_BASE + 0x1_0000 * i as u64, &mut on_bus)
                .unwrap();
            assert!(on_bus == **source, "segment {i} did not land");
        }
    }
}

#[test]
fn long_chain_spans_descriptor_pages() {
    const SEGMENTS: usize = 130;
    const PAGE: usize = 4096;

    for sim in both_chips() {
        let bridge = open(&sim);
        let mut storages: Vec<Vec<u8>> = vec![Vec::new(); SEGMENTS];
        let mut sources: Vec<&mut [u8]> = Vec::new();
        for (i, storage) in storages.iter_mut().enumerate() {
            let buffer = aligned(storage, PAGE);
            fill(buffer, i);
            sources.push(buffer);
        }

        let segments = sources
            .iter()
            .enumerate()
            .map(|(i, source)| {
                DmaSegment::user_to_vme(source, VME_BASE + (i * PAGE) as u64, a32())
            })
            .collect();
        let transfer = bridge.dma().submit(segments, 0).unwrap();
        assert!(transfer.descriptors() >= SEGMENTS);
        let done = transfer.wait(WAIT).unwrap();
        assert!(done.status.done);
        assert_eq!(done.bytes, (SEGMENTS * PAGE) as u64);

        let mut on_bus = vec![0u8; SEGMENTS * PAGE];
        sim.vme_read(AddressSpace::A32, VME_BASE, &mut on_bus)
            .unwrap();
        for (i, source) in sources.iter().enumerate() {
            assert!(
                on_bus[i * PAGE..(i + 1) * PAGE] == **source,
                "segment {i} did not land"
            );
        }

        let mut back_storage = Vec::new();
        let back = aligned(&mut back_storage, SEGMENTS * PAGE);
        let reads = back
            .chunks_mut(PAGE)
            .enumerate()
            .map(|(i, chunk)| {
                DmaSegment::vme_to_user(VME_BASE + (i * PAGE) as u64, a32(), chunk)
            })
            .collect();
        bridge.dma().submit(reads, 0).unwrap().wait(WAIT).unwrap();
        assert!(*back == on_bus[..]);
    }
}

#[test]
fn vme_to_vme_copy_on_tsi148() {
    let sim = SimulatedBridge::tsi148();
    let bridge = open(&sim);
    sim.vme_write(AddressSpace::A24, 0x10_0000, b"relocate me").unwrap();

    let segment = DmaSegment::new(
        DmaEndpoint::Vme {
            address: 0x10_0000,
            attrs: VmeAttributes::sct(AddressSpace::A24, DataWidth::D16),
        },
        DmaEndpoint::Vme {
            address: VME_BASE,
            attrs: a32().with_protocol(Protocol::Blt),
        },
        11,
    );
    bridge
        .dma()
        .submit(vec![segment], 1)
        .unwrap()
        .wait(WAIT)
        .unwrap();

    let mut copied = [0u8; 11];
    sim.vme_read(AddressSpace::A32, VME_BASE, &mut copied).unwrap();
    assert_eq!(&copied, b"relocate me");
}

#[test]
fn tsi148_fills_from_patterns() {
    let sim = SimulatedBridge::tsi148();
    let bridge = open(&sim);
    let cases = [
        (DmaPattern::Byte(0xA5), vec![0xA5; 6]),
        (DmaPattern::ByteIncrement(0xFE), vec![0xFE, 0xFF, 0, 1, 2, 3]),
        (DmaPattern::Word(0x0102_0304), vec![1, 2, 3, 4, 1, 2]),
        (DmaPattern::WordIncrement(0xFF), vec![0, 0, 0, 0xFF, 0, 0, 1, 0]),
    ];
    for (pattern, expected) in cases {
        let segment = DmaSegment::new(
            DmaEndpoint::Pattern(pattern),
            DmaEndpoint::Vme {
                address: VME_BASE,
                attrs: a32(),
            },
            expected.len(),
        );
        bridge
            .dma()
            .submit(vec![segment], 0)
            .unwrap()
            .wait(WAIT)
            .unwrap();
        let mut on_bus = vec![0u8; expected.len()];
        sim.vme_read(AddressSpace::A32, VME_BASE, &mut on_bus).unwrap();
        assert_eq!(on_bus, expected, "{pattern:?}");
    }
}

#[test]
fn universe_rejects_patterns() {
    let sim = SimulatedBridge::universe();
    let bridge = open(&sim);
    let segment = DmaSegment::new(
        DmaEndpoint::Pattern(DmaPattern::Byte(0)),
        DmaEndpoint::Vme {
            address: VME_BASE,
            attrs: a32(),
        },
        16,
    );
    let err = bridge.dma().submit(vec![segment], 0).unwrap_err();
    assert!(matches!(err, VmeError::Configuration { .. }));
}

#[test]
fn universe_needs_matching_alignment() {
    let sim = SimulatedBridge::universe();
    let bridge = open(&sim);
    let mut storage = Vec::new();
    let buffer = aligned(&mut storage, 64);
    let err = bridge
        .dma()
        .submit(vec![DmaSegment::user_to_vme(buffer, VME_BASE + 4, a32())], 0)
        .unwrap_err();
    assert!(matches!(err, VmeError::Configuration { .. }));
}

#[test]
fn malformed_requests_are_refused() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let dma = bridge.dma();
        assert!(dma.submit(Vec::new(), 0).is_err());

        let mut storage = Vec::new();
        let buffer = aligned(&mut storage, 16);
        let segment = DmaSegment::user_to_vme(buffer, VME_BASE, a32());
        assert!(dma.submit(vec![segment], dma.channels()).is_err());

        let segment = DmaSegment::new(
            DmaEndpoint::Pci { address: 0x4000_0000 },
            DmaEndpoint::Pattern(DmaPattern::Byte(1)),
            16,
        );
        assert!(dma.submit(vec![segment], 0).is_err());

        let short = [0u8; 8];
        let segment = DmaSegment::new(
            DmaEndpoint::User(&short),
            DmaEndpoint::Vme {
                address: VME_BASE,
                attrs: a32(),
            },
            16,
        );
        assert!(dma.submit(vec![segment], 0).is_err());
    }
}

#[test]
fn held_transfer_can_be_aborted() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let mut storage = Vec::new();
        let buffer = aligned(&mut storage, 256);

        sim.hold_dma(true);
        let transfer = bridge
            .dma()
            .submit(vec![DmaSegment::user_to_vme(buffer, VME_BASE, a32())], 0)
            .unwrap();
        let err = transfer.abort().unwrap_err();
        assert!(matches!(err, VmeError::DmaAborted { channel: 0, .. }), "{err}");

        // The channel is usable again
        sim.hold_dma(false);
        loopback(&sim, &bridge, VME_BASE, 64);
    }
}

#[test]
fn stalled_transfer_times_out() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let mut storage = Vec::new();
        let buffer = aligned(&mut storage, 256);

        sim.hold_dma(true);
        let err = bridge
            .dma()
            .submit(vec![DmaSegment::vme_to_user(VME_BASE, a32(), buffer)], 0)
            .unwrap()
            .wait(Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, VmeError::Timeout { .. }), "{err}");

        sim.hold_dma(false);
        loopback(&sim, &bridge, VME_BASE, 64);
    }
}

#[test]
fn released_transfer_completes() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let mut storage = Vec::new();
        let buffer = aligned(&mut storage, 128);
        fill(buffer, 9);
        let expected = buffer.to_vec();

        sim.hold_dma(true);
        let transfer = bridge
            .dma()
            .submit(vec![DmaSegment::user_to_vme(buffer, VME_BASE, a32())], 0)
            .unwrap();
        let releaser = {
            let sim = Arc::clone(&sim);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                sim.release_dma();
            })
        };
        transfer.wait(WAIT).unwrap();
        releaser.join().unwrap();

        let mut on_bus = vec![0u8; expected.len()];
        sim.vme_read(AddressSpace::A32, VME_BASE, &mut on_bus).unwrap();
        assert_eq!(on_bus, expected);
    }
}

#[test]
fn bus_error_fails_the_transfer() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let mut storage = Vec::new();
        let buffer = aligned(&mut storage, 64);

        sim.inject_dma_error(true);
        let err = bridge
            .dma()
            .submit(vec![DmaSegment::vme_to_user(VME_BASE, a32(), buffer)], 0)
            .unwrap()
            .wait(WAIT)
            .unwrap_err();
        assert!(matches!(err, VmeError::DmaFailed { channel: 0, .. }), "{err}");

        sim.add_bus_fault(AddressSpace::A32, VME_BASE + 0x100, 8);
        let buffer = aligned(&mut storage, 512);
        let err = bridge
            .dma()
            .submit(vec![DmaSegment::vme_to_user(VME_BASE, a32(), buffer)], 0)
            .unwrap()
            .wait(WAIT)
            .unwrap_err();
        assert!(matches!(err, VmeError::DmaFailed { .. }), "{err}");
    }
}

#[test]
fn concurrent_submits_are_serialized() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let ticks = std::sync::Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let (bridge, ticks) = (&bridge, &ticks);
                scope.spawn(move || {
                    let mut storage = Vec::new();
                    for round in 0..8u64 {
                        let buffer = aligned(&mut storage, 512);
                        let address = VME_BASE + (worker * 8 + round) * 0x1000;
                        let done = bridge
                            .dma()
                            .submit(vec![DmaSegment::user_to_vme(buffer, address, a32())], 0)
                            .unwrap()
                            .wait(WAIT)
                            .unwrap();
                        ticks
                            .lock()
                            .unwrap()
                            .push((done.start_tick, done.stop_tick));
                    }
                });
            }
        });

        let mut ticks = ticks.into_inner().unwrap();
        assert_eq!(ticks.len(), 32);
        ticks.sort_unstable();
        for pair in ticks.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            #[allow(clippy::cast_possible_wrap)]
            let gap = later.0.wrapping_sub(earlier.1) as i32;
            assert!(gap >= 0, "transfers overlapped: {earlier:?} then {later:?}");
        }
    }
}

#[test]
fn both_tsi148_channels_run() {
    let sim = SimulatedBridge::new(ChipVariant::Tsi148, true);
    let bridge = open(&sim);
    assert_eq!(bridge.dma().channels(), 2);

    let mut first = Vec::new();
    let mut second = Vec::new();
    let a = aligned(&mut first, 64);
    let b = aligned(&mut second, 64);
    fill(a, 1);
    fill(b, 2);
    let one = bridge
        .dma()
        .submit(vec![DmaSegment::user_to_vme(a, VME_BASE, a32())], 0)
        .unwrap();
    let two = bridge
        .dma()
        .submit(vec![DmaSegment::user_to_vme(b, VME_BASE + 0x100, a32())], 1)
        .unwrap();
    assert_eq!(one.wait(WAIT).unwrap().channel, 0);
    assert_eq!(two.wait(WAIT).unwrap().channel, 1);
}
