//! End-to-end bridge tests against the simulated backplane
//!
//! Every test runs the full start-of-day sequence on both chips and then
//! drives the public API the way an application would.

use std::sync::Arc;
use std::time::Duration;
use vme_bridge::backends::SimulatedBridge;
use vme_bridge::pcie_ids::ChipVariant;
use vme_bridge::{
    AccessFilter, AddressSpace, ArbiterConfig, ArbitrationMode, BridgeConfig, BusSide, BusTimeout,
    DataWidth, InboundWindow, OutboundWindow, Platform, RequesterConfig, RmwOperation,
    VmeAttributes, VmeBridge, VmeError, VmeInterface, VmeInterfaceConfig,
};

const PCI_BASE: u64 = 0x8000_0000;
const VME_BASE: u64 = 0x0100_0000;
const WINDOW_SIZE: u64 = 0x2_0000;

fn open(sim: &Arc<SimulatedBridge>) -> VmeBridge {
    VmeBridge::open(Platform::simulated(sim), BridgeConfig::default()).unwrap()
}

fn both_chips() -> [Arc<SimulatedBridge>; 2] {
    [SimulatedBridge::universe(), SimulatedBridge::tsi148()]
}

fn a32_window(index: usize) -> OutboundWindow {
    OutboundWindow::new(
        index,
        PCI_BASE,
        WINDOW_SIZE,
        VME_BASE,
        VmeAttributes::sct(AddressSpace::A32, DataWidth::D32),
    )
}

// ── Start of day ─────────────────────────────────────────────────────────

#[test]
fn start_of_day_on_both_chips() {
    for sim in both_chips() {
        let bridge = open(&sim);
        assert_eq!(bridge.variant(), sim.variant());
        assert!(bridge.is_system_controller());
        assert!(bridge.outbound_windows().unwrap().is_empty());
        assert_eq!(
            bridge.requester().unwrap(),
            RequesterConfig::default_for(sim.variant())
        );
        // Mailbox calibration completed within the default bound
        assert!(bridge.interrupts().overhead_ticks() > 0);
    }
}

#[test]
fn peripheral_slot_is_detected() {
    for variant in [ChipVariant::Universe, ChipVariant::Tsi148] {
        let sim = SimulatedBridge::new(variant, false);
        let bridge = open(&sim);
        assert!(!bridge.is_system_controller());
    }
}

#[test]
fn failed_self_test_aborts_open() {
    let sim = SimulatedBridge::universe();
    sim.break_register(vme_chip::universe::SCYC_EN);
    let err = VmeBridge::open(Platform::simulated(&sim), BridgeConfig::default()).unwrap_err();
    assert!(matches!(err, VmeError::HardwareMismatch { .. }), "{err}");

    let sim = SimulatedBridge::tsi148();
    sim.break_register(vme_chip::tsi148::RMWEN);
    let err = VmeBridge::open(Platform::simulated(&sim), BridgeConfig::default()).unwrap_err();
    assert!(matches!(err, VmeError::HardwareMismatch { .. }), "{err}");
}

#[test]
fn unknown_device_is_refused() {
    let sim = SimulatedBridge::new(ChipVariant::Unknown(0x0513), true);
    let err = VmeBridge::open(Platform::simulated(&sim), BridgeConfig::default()).unwrap_err();
    assert!(matches!(err, VmeError::HardwareMismatch { .. }));
}

/// Interrupt output enable and CR/CSR image enable of a simulated chip
fn enables(sim: &SimulatedBridge) -> (u32, u32) {
    match sim.variant() {
        ChipVariant::Universe => (
            sim.register(vme_chip::universe::LINT_EN),
            sim.register(vme_chip::universe::VCSR_CTL),
        ),
        _ => (
            sim.register(vme_chip::tsi148::INTEO),
            sim.register(vme_chip::tsi148::CRAT),
        ),
    }
}

#[test]
fn slot_image_follows_the_bridge() {
    for sim in both_chips() {
        let config = BridgeConfig::default().with_slot(5);
        let bridge = VmeBridge::open(Platform::simulated(&sim), config).unwrap();
        let (interrupts, image) = enables(&sim);
        assert_ne!(interrupts, 0);
        assert_ne!(image, 0);
        let slot = match sim.variant() {
            ChipVariant::Universe => sim.register(vme_chip::universe::VCSR_BS) >> 27,
            _ => sim.register(vme_chip::tsi148::CBAR) >> 3,
        };
        assert_eq!(slot, 5);

        drop(bridge);
        assert_eq!(enables(&sim), (0, 0));
    }
}

#[test]
fn failed_slot_setup_undoes_start_of_day() {
    for sim in both_chips() {
        let config = BridgeConfig::default().with_slot(22);
        let err = VmeBridge::open(Platform::simulated(&sim), config).unwrap_err();
        assert!(matches!(err, VmeError::Configuration { .. }), "{err}");
        assert_eq!(enables(&sim), (0, 0));

        // The chip is left in a state a later open can start from
        let bridge = open(&sim);
        assert!(bridge.is_system_controller());
    }
}

// ── Windows ──────────────────────────────────────────────────────────────

#[test]
fn outbound_window_reads_back() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let window = a32_window(2);
        bridge.configure_outbound(&window).unwrap();
        assert_eq!(bridge.query_outbound(2).unwrap(), window);
        assert_eq!(bridge.outbound_windows().unwrap(), vec![window]);

        bridge.disable_windows().unwrap();
        assert!(!bridge.query_outbound(2).unwrap().enabled);
    }
}

#[test]
fn rejected_window_leaves_previous_one_alone() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let window = a32_window(1);
        bridge.configure_outbound(&window).unwrap();
        let writes = sim.register_writes();

        let mut misaligned = window;
        misaligned.pci_base += 0x800;
        let err = bridge.configure_outbound(&misaligned).unwrap_err();
        assert!(matches!(err, VmeError::Configuration { .. }), "{err}");

        let mut too_far = window;
        too_far.attrs.space = AddressSpace::A16;
        assert!(bridge.configure_outbound(&too_far).is_err());

        assert!(bridge.configure_outbound(&a32_window(8)).is_err());

        assert_eq!(sim.register_writes(), writes);
        assert_eq!(bridge.query_outbound(1).unwrap(), window);
    }
}

#[test]
fn universe_has_no_a64_windows() {
    let sim = SimulatedBridge::universe();
    let bridge = open(&sim);
    let mut window = a32_window(0);
    window.attrs.space = AddressSpace::A64;
    let err = bridge.configure_outbound(&window).unwrap_err();
    assert!(matches!(
        err,
        VmeError::UnsupportedAddressSpace {
            space: AddressSpace::A64,
            variant: ChipVariant::Universe
        }
    ));
}

#[test]
fn inbound_window_reads_back() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let window = InboundWindow::new(3, 0x0040_0000, 0x1_0000, 0x1000_0000, AddressSpace::A24);
        bridge.configure_inbound(&window).unwrap();

        let read = bridge.query_inbound(3).unwrap();
        assert!(read.enabled);
        assert_eq!(read.space, AddressSpace::A24);
        assert_eq!(read.vme_base, 0x0040_0000);
        assert_eq!(read.size, 0x1_0000);
        assert_eq!(read.pci_base, 0x1000_0000);
    }
}

// ── Single cycles ────────────────────────────────────────────────────────

#[test]
fn single_cycles_reach_vme_memory() {
    for sim in both_chips() {
        let bridge = open(&sim);
        bridge.configure_outbound(&a32_window(0)).unwrap();

        bridge
            .write32(VME_BASE + 0x10, AddressSpace::A32, 0xCAFE_F00D)
            .unwrap();
        let mut raw = [0u8; 4];
        sim.vme_read(AddressSpace::A32, VME_BASE + 0x10, &mut raw)
            .unwrap();
        assert_eq!(u32::from_ne_bytes(raw), 0xCAFE_F00D);

        sim.vme_write(AddressSpace::A32, VME_BASE + 0x100, b"backplane")
            .unwrap();
        let mut buffer = [0u8; 9];
        bridge
            .read_bytes(VME_BASE + 0x100, AddressSpace::A32, &mut buffer)
            .unwrap();
        assert_eq!(&buffer, b"backplane");
    }
}

#[test]
fn d16_cycles_reach_vme_memory() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let a24 = OutboundWindow::new(
            1,
            PCI_BASE + 0x10_0000,
            0x1_0000,
            0x0050_0000,
            VmeAttributes::sct(AddressSpace::A24, DataWidth::D16),
        );
        bridge.configure_outbound(&a24).unwrap();
        bridge.configure_outbound(&a32_window(0)).unwrap();

        bridge
            .write16(0x0050_0022, AddressSpace::A24, 0xBEEF)
            .unwrap();
        let mut raw = [0u8; 2];
        sim.vme_read(AddressSpace::A24, 0x0050_0022, &mut raw)
            .unwrap();
        assert_eq!(u16::from_ne_bytes(raw), 0xBEEF);

        // Only the two addressed bytes are touched
        sim.vme_write(AddressSpace::A32, VME_BASE + 0x40, &[0x11, 0x22, 0x33, 0x44])
            .unwrap();
        let halfword = u16::from_ne_bytes([0xAA, 0xBB]);
        bridge
            .write16(VME_BASE + 0x42, AddressSpace::A32, halfword)
            .unwrap();
        let mut word = [0u8; 4];
        sim.vme_read(AddressSpace::A32, VME_BASE + 0x40, &mut word)
            .unwrap();
        assert_eq!(word, [0x11, 0x22, 0xAA, 0xBB]);
        assert_eq!(
            bridge.read16(VME_BASE + 0x40, AddressSpace::A32).unwrap(),
            u16::from_ne_bytes([0x11, 0x22])
        );

        let err = bridge
            .read16(0x0050_0023, AddressSpace::A24)
            .unwrap_err();
        assert!(matches!(err, VmeError::Configuration { .. }));
        let err = bridge.read16(0x0060_0000, AddressSpace::A24).unwrap_err();
        assert!(matches!(err, VmeError::NoMatchingWindow { .. }));
    }
}

#[test]
fn unmapped_address_has_no_window() {
    for sim in both_chips() {
        let bridge = open(&sim);
        bridge.configure_outbound(&a32_window(0)).unwrap();

        let err = bridge.read32(0x0900_0000, AddressSpace::A32).unwrap_err();
        assert!(matches!(err, VmeError::NoMatchingWindow { .. }));
        let err = bridge.read32(VME_BASE, AddressSpace::A24).unwrap_err();
        assert!(matches!(err, VmeError::NoMatchingWindow { .. }));
        // Straddling the end of the window
        let err = bridge
            .read32(VME_BASE + WINDOW_SIZE - 2, AddressSpace::A32)
            .unwrap_err();
        assert!(matches!(err, VmeError::NoMatchingWindow { .. }));
    }
}

#[test]
fn bus_error_is_reported_once() {
    for sim in both_chips() {
        let bridge = open(&sim);
        bridge.configure_outbound(&a32_window(0)).unwrap();
        sim.add_bus_fault(AddressSpace::A32, VME_BASE + 0x200, 0x10);

        let err = bridge
            .read32(VME_BASE + 0x204, AddressSpace::A32)
            .unwrap_err();
        let (source_bus, address) = match err {
            VmeError::BusError {
                source_bus,
                address,
            } => (source_bus, address),
            other => panic!("expected a bus error, got {other}"),
        };
        assert_eq!(source_bus, BusSide::Vme);
        if sim.variant() == ChipVariant::Tsi148 {
            assert_eq!(address, VME_BASE + 0x204);
        }

        // The latch was cleared by the failing access
        assert_eq!(bridge.check_bus_error(false).unwrap(), None);
        bridge.read32(VME_BASE + 0x300, AddressSpace::A32).unwrap();

        assert!(bridge
            .write32(VME_BASE + 0x208, AddressSpace::A32, 1)
            .is_err());
    }
}

#[test]
fn injected_bus_error_can_be_peeked_then_cleared() {
    for sim in both_chips() {
        let bridge = open(&sim);
        sim.inject_bus_error(BusSide::Vme, 0x1234_5678);

        let fault = bridge.check_bus_error(false).unwrap().unwrap();
        assert_eq!(fault.side, BusSide::Vme);
        assert!(bridge.check_bus_error(true).unwrap().is_some());
        assert_eq!(bridge.check_bus_error(true).unwrap(), None);
    }
}

// ── RMW ──────────────────────────────────────────────────────────────────

#[test]
fn rmw_swaps_on_first_attempt_when_compare_matches() {
    for sim in both_chips() {
        let bridge = open(&sim);
        bridge.configure_outbound(&a32_window(0)).unwrap();
        let target = VME_BASE + 0x40;
        sim.vme_write(AddressSpace::A32, target, &5u32.to_ne_bytes())
            .unwrap();

        let op = RmwOperation::new(target, AddressSpace::A32, 5, 9).with_max_attempts(1);
        let outcome = bridge.do_rmw(&op).unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.value, 9);
        assert_eq!(bridge.read32(target, AddressSpace::A32).unwrap(), 9);
    }
}

#[test]
fn rmw_gives_up_without_touching_a_mismatching_target() {
    for sim in both_chips() {
        let bridge = open(&sim);
        bridge.configure_outbound(&a32_window(0)).unwrap();
        let target = VME_BASE + 0x44;
        sim.vme_write(AddressSpace::A32, target, &0x10u32.to_ne_bytes())
            .unwrap();

        let op = RmwOperation::new(target, AddressSpace::A32, 1, 2).with_max_attempts(1);
        let err = bridge.do_rmw(&op).unwrap_err();
        assert!(matches!(err, VmeError::RmwExhausted { attempts: 1 }));
        assert_eq!(bridge.read32(target, AddressSpace::A32).unwrap(), 0x10);

        // Only the enabled bits take part
        let op = RmwOperation::new(target, AddressSpace::A32, 0x10, 0x20).with_enable(0xF0);
        assert_eq!(bridge.do_rmw(&op).unwrap().value, 0x20);
        assert_eq!(bridge.read32(target, AddressSpace::A32).unwrap(), 0x20);
    }
}

#[test]
fn rmw_rejects_misaligned_targets() {
    let sim = SimulatedBridge::tsi148();
    let bridge = open(&sim);
    bridge.configure_outbound(&a32_window(0)).unwrap();
    let op = RmwOperation::new(VME_BASE + 2, AddressSpace::A32, 0, 1);
    assert!(matches!(
        bridge.do_rmw(&op).unwrap_err(),
        VmeError::Configuration { .. }
    ));
}

// ── Interrupts ───────────────────────────────────────────────────────────

#[test]
fn received_interrupts_are_counted() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let timeout = Duration::from_secs(1);

        sim.assert_vme_irq(3, 0x42);
        let hit = bridge.get_irq_status(3, 0x42, timeout).unwrap();
        assert_eq!((hit.level, hit.vector, hit.count), (3, 0x42, 1));

        sim.assert_vme_irq(3, 0x42);
        let deadline = std::time::Instant::now() + timeout;
        while bridge.interrupts().irq_count(3, 0x42) < 2 {
            assert!(std::time::Instant::now() < deadline, "second IRQ lost");
            std::thread::sleep(Duration::from_millis(1));
        }

        let any = bridge.get_irq_status(0, 0, timeout).unwrap();
        assert_eq!((any.level, any.vector), (3, 0x42));

        bridge.clr_irq_status(3, 0x42).unwrap();
        assert_eq!(bridge.interrupts().irq_count(3, 0x42), 0);
    }
}

#[test]
fn cleared_counters_time_out() {
    for sim in both_chips() {
        let bridge = open(&sim);
        sim.assert_vme_irq(6, 0x11);
        bridge
            .get_irq_status(6, 0x11, Duration::from_secs(1))
            .unwrap();

        bridge.clr_irq_status(0, 0).unwrap();
        let err = bridge
            .get_irq_status(0, 0, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, VmeError::Timeout { .. }));
        assert!(bridge.clr_irq_status(0, 5).is_err());
    }
}

#[test]
fn universe_sends_only_even_vectors() {
    let sim = SimulatedBridge::new(ChipVariant::Universe, false);
    let bridge = open(&sim);
    let writes = sim.register_writes();

    let err = bridge
        .generate_irq(3, 0x41, Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, VmeError::Configuration { .. }));
    assert_eq!(sim.register_writes(), writes);
    assert!(sim.generated_irqs().is_empty());

    let ack = bridge
        .generate_irq(3, 0x40, Duration::from_millis(100))
        .unwrap();
    assert!(!ack.timed_out);
    assert_eq!(sim.generated_irqs(), vec![(3, 0x40)]);
}

#[test]
fn tsi148_sends_odd_vectors() {
    let sim = SimulatedBridge::new(ChipVariant::Tsi148, false);
    let bridge = open(&sim);
    let ack = bridge
        .generate_irq(3, 0x41, Duration::from_millis(100))
        .unwrap();
    assert!(!ack.timed_out);
    assert_eq!(sim.generated_irqs(), vec![(3, 0x41)]);
}

#[test]
fn unacknowledged_interrupt_is_withdrawn() {
    for variant in [ChipVariant::Universe, ChipVariant::Tsi148] {
        let sim = SimulatedBridge::new(variant, false);
        let bridge = VmeBridge::open(
            Platform::simulated(&sim),
            BridgeConfig::default().with_ack_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();
        sim.set_auto_ack(false);

        let ack = bridge
            .generate_irq(2, 0x10, Duration::from_millis(50))
            .unwrap();
        assert!(ack.timed_out);
        // Nothing left for a late IACK to pick up
        assert_eq!(sim.acknowledge_vme_irq(), None);
    }
}

#[test]
fn interrupt_acknowledged_by_another_board() {
    for variant in [ChipVariant::Universe, ChipVariant::Tsi148] {
        let sim = SimulatedBridge::new(variant, false);
        let bridge = VmeBridge::open(
            Platform::simulated(&sim),
            BridgeConfig::default().with_ack_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();
        sim.set_auto_ack(false);

        let handler = {
            let sim = Arc::clone(&sim);
            std::thread::spawn(move || loop {
                if let Some(ack) = sim.acknowledge_vme_irq() {
                    return ack;
                }
                std::thread::sleep(Duration::from_millis(2));
            })
        };
        let ack = bridge
            .generate_irq(5, 0x22, Duration::from_secs(2))
            .unwrap();
        assert!(!ack.timed_out);
        assert_eq!(handler.join().unwrap(), (5, 0x22));
    }
}

// ── Role gating ──────────────────────────────────────────────────────────

#[test]
fn operations_are_gated_by_slot_role() {
    for variant in [ChipVariant::Universe, ChipVariant::Tsi148] {
        let syscon = open(&SimulatedBridge::new(variant, true));
        assert!(matches!(
            syscon.generate_irq(1, 2, Duration::from_millis(10)),
            Err(VmeError::NotPeripheralController)
        ));

        let peripheral = open(&SimulatedBridge::new(variant, false));
        assert!(matches!(
            peripheral.get_irq_status(0, 0, Duration::from_millis(10)),
            Err(VmeError::NotSystemController)
        ));
        assert!(matches!(
            peripheral.arbiter(),
            Err(VmeError::NotSystemController)
        ));
        assert!(matches!(
            peripheral.set_arbiter(&ArbiterConfig::default()),
            Err(VmeError::NotSystemController)
        ));
        // Any slot has a requester
        peripheral
            .set_requester(&RequesterConfig::default_for(variant))
            .unwrap();
    }
}

// ── Arbiter / requester ──────────────────────────────────────────────────

#[test]
fn arbiter_settings_round_up_and_read_back() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let wanted = ArbiterConfig {
            mode: ArbitrationMode::Priority,
            timeout: BusTimeout::Micros(100),
            arbitration_timeout: false,
            no_early_release: false,
        };
        bridge.set_arbiter(&wanted).unwrap();
        let got = bridge.arbiter().unwrap();
        assert_eq!(got.mode, ArbitrationMode::Priority);
        assert_eq!(got.timeout, BusTimeout::Micros(128));
        assert!(!got.arbitration_timeout);

        let too_long = ArbiterConfig {
            timeout: BusTimeout::Micros(10_000_000),
            ..wanted
        };
        assert!(bridge.set_arbiter(&too_long).is_err());
        assert_eq!(bridge.arbiter().unwrap(), got);
    }
}

#[test]
fn requester_level_is_validated() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let mut config = RequesterConfig::default_for(sim.variant());
        config.level = 1;
        bridge.set_requester(&config).unwrap();
        assert_eq!(bridge.requester().unwrap().level, 1);

        config.level = 4;
        assert!(bridge.set_requester(&config).is_err());
        assert_eq!(bridge.requester().unwrap().level, 1);
    }
}

// ── Location monitor ─────────────────────────────────────────────────────

#[test]
fn location_monitor_fires_on_access() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let base = 0x0030_0000;
        bridge
            .setup_location_monitor(base, AddressSpace::A24, AccessFilter::default())
            .unwrap();

        assert!(!sim.touch_location_monitor(AddressSpace::A32, base + 8));
        assert!(sim.touch_location_monitor(AddressSpace::A24, base + 8));
        let mask = bridge
            .wait_location_monitor(Duration::from_secs(1))
            .unwrap();
        assert_eq!(mask, 0b0010);

        // Disarmed after the wait
        assert!(!sim.touch_location_monitor(AddressSpace::A24, base));
    }
}

#[test]
fn location_monitor_wait_times_out() {
    for sim in both_chips() {
        let bridge = open(&sim);
        bridge
            .setup_location_monitor(0x0030_0000, AddressSpace::A24, AccessFilter::default())
            .unwrap();
        let err = bridge
            .wait_location_monitor(Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, VmeError::Timeout { .. }));

        assert!(bridge
            .setup_location_monitor(0x0030_0004, AddressSpace::A24, AccessFilter::default())
            .is_err());
    }
}

// ── Reset ────────────────────────────────────────────────────────────────

#[test]
fn sys_reset_pulses_once() {
    for sim in both_chips() {
        let bridge = open(&sim);
        assert_eq!(sim.sys_resets(), 0);
        bridge.sys_reset().unwrap();
        assert_eq!(sim.sys_resets(), 1);
    }
}

// ── Convenience interface ────────────────────────────────────────────────

#[test]
fn interface_picks_single_cycles_or_dma() {
    for sim in both_chips() {
        let bridge = open(&sim);
        let vme = VmeInterface::new(
            &bridge,
            VmeInterfaceConfig::new(0x0800_0000, 0x10_0000, 0x9000_0000),
        )
        .unwrap();

        vme.write32(0x10, 0xDEAD_BEEF).unwrap();
        assert_eq!(vme.read32(0x10).unwrap(), 0xDEAD_BEEF);
        vme.write16(0x20, 0x1234).unwrap();
        assert_eq!(vme.read16(0x20).unwrap(), 0x1234);
        assert!(vme.read16(0x10_0000 - 1).is_err());

        vme.write(0x40, &[1, 2, 3]).unwrap();
        assert_eq!(&vme.read(0x40, 3).unwrap()[..], &[1, 2, 3]);

        let block: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        vme.write(0x1000, &block).unwrap();
        let mut raw = vec![0u8; block.len()];
        sim.vme_read(AddressSpace::A32, 0x0800_1000, &mut raw)
            .unwrap();
        assert_eq!(raw, block);
        assert_eq!(vme.read(0x1000, block.len()).unwrap(), block);

        assert!(vme.read(0x10_0000 - 2, 4).is_err());
        assert!(vme.read(0, 0).unwrap().is_empty());
    }
}

#[test]
fn interface_checks_its_channel() {
    let sim = SimulatedBridge::universe();
    let bridge = open(&sim);
    let err = VmeInterface::new(
        &bridge,
        VmeInterfaceConfig::new(0x0800_0000, 0x10_0000, 0x9000_0000).with_dma_channel(1),
    )
    .unwrap_err();
    assert!(matches!(err, VmeError::Configuration { .. }));
}
