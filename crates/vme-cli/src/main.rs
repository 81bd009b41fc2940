//! `vme`: command-line interface for Tundra PCI-VME bridges.
//!
//! ```text
//! USAGE:
//!   vme enumerate                         List all bridges
//!   vme info <device>                     Role, arbiter and requester of one bridge
//!   vme windows <device>                  Enabled outbound and inbound windows
//!   vme arbiter <device> [options]        Show or change the arbiter (system controller)
//!   vme requester <device> [--level N]    Show or change the requester
//!   vme peek <device> <space> <addr>      32-bit read through a scratch window
//!   vme poke <device> <space> <addr> <v>  32-bit write through a scratch window
//!   vme sys-reset <device>                Pulse VME SYSRESET
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use vme_bridge::{
    AddressSpace, ArbitrationMode, BridgeConfig, BusTimeout, DeviceManager, VmeBridge,
    VmeInterface, VmeInterfaceConfig,
};

/// Span of the scratch window used by peek/poke
const SCRATCH_SIZE: u64 = 0x1_0000;

#[derive(Parser)]
#[command(name = "vme", about = "Tundra PCI-VME bridge CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all supported bridges.
    Enumerate,
    /// Print role, arbiter and requester settings for one bridge.
    Info {
        /// PCIe address (e.g. 0000:03:00.0) or bridge index (e.g. 0).
        device: String,
    },
    /// Print the enabled translation windows.
    Windows {
        /// PCIe address or bridge index.
        device: String,
    },
    /// Show or change the VME arbiter (system controller only).
    Arbiter {
        /// PCIe address or bridge index.
        device: String,
        /// Arbitration scheme.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Bus timeout in microseconds; 0 disables it.
        #[arg(long, value_parser = parse_u32)]
        timeout_us: Option<u32>,
    },
    /// Show or change the bus requester.
    Requester {
        /// PCIe address or bridge index.
        device: String,
        /// Request level 0-3.
        #[arg(long)]
        level: Option<u8>,
    },
    /// Read one 32-bit word from the VME bus.
    Peek {
        #[command(flatten)]
        target: Target,
    },
    /// Write one 32-bit word to the VME bus.
    Poke {
        #[command(flatten)]
        target: Target,
        /// Value to write (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
    /// Pulse VME SYSRESET. Every board on the crate is reset.
    SysReset {
        /// PCIe address or bridge index.
        device: String,
    },
}

/// A single VME word reached through a scratch outbound window
#[derive(Args)]
struct Target {
    /// PCIe address or bridge index.
    device: String,
    /// Address space.
    #[arg(value_enum)]
    space: SpaceArg,
    /// VME address (decimal or 0x-prefixed hex).
    #[arg(value_parser = parse_u64)]
    address: u64,
    /// Free PCI memory the scratch window is placed at.
    #[arg(long, value_parser = parse_u64, default_value = "0x90000000")]
    pci_base: u64,
    /// Outbound window used as scratch.
    #[arg(long, default_value_t = 7)]
    window: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum SpaceArg {
    A16,
    A24,
    A32,
    A64,
}

impl From<SpaceArg> for AddressSpace {
    fn from(space: SpaceArg) -> Self {
        match space {
            SpaceArg::A16 => Self::A16,
            SpaceArg::A24 => Self::A24,
            SpaceArg::A32 => Self::A32,
            SpaceArg::A64 => Self::A64,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    RoundRobin,
    Priority,
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("{text}: {e}"))
}

fn parse_u32(text: &str) -> Result<u32, String> {
    let value = parse_u64(text)?;
    u32::try_from(value).map_err(|_| format!("{text} does not fit in 32 bits"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info { device } => cmd_info(&device)?,
        Cmd::Windows { device } => cmd_windows(&device)?,
        Cmd::Arbiter {
            device,
            mode,
            timeout_us,
        } => cmd_arbiter(&device, mode, timeout_us)?,
        Cmd::Requester { device, level } => cmd_requester(&device, level)?,
        Cmd::Peek { target } => cmd_peek(&target)?,
        Cmd::Poke { target, value } => cmd_poke(&target, value)?,
        Cmd::SysReset { device } => cmd_sys_reset(&device)?,
    }

    Ok(())
}

/// Open a bridge by index or PCIe address
fn open(device: &str) -> Result<VmeBridge> {
    let mgr = DeviceManager::discover()?;
    let index = match device.parse::<usize>() {
        Ok(index) => index,
        Err(_) => mgr
            .devices()
            .iter()
            .find(|d| d.pcie_address == device)
            .map(|d| d.index)
            .ok_or_else(|| anyhow::anyhow!("Bridge not found: {device}"))?,
    };
    mgr.open(index, BridgeConfig::default())
        .with_context(|| format!("Opening bridge {device}"))
}

fn cmd_enumerate() -> Result<()> {
    let mgr = DeviceManager::discover()?;

    println!("VME bridges: {}", mgr.device_count());
    println!();

    for info in mgr.devices() {
        println!("[{}] {} @ {}", info.index, info.variant, info.pcie_address);
        match &info.uio {
            Some(path) => println!("     UIO   {}", path.display()),
            None => println!("     UIO   (none bound; load uio_pci_generic)"),
        }
    }

    Ok(())
}

fn cmd_info(device: &str) -> Result<()> {
    let bridge = open(device)?;

    println!("Chip         : {}", bridge.variant());
    println!(
        "Slot role    : {}",
        if bridge.is_system_controller() {
            "system controller"
        } else {
            "peripheral"
        }
    );
    println!(
        "DMA channels : {} (IRQ overhead {} ticks)",
        bridge.dma().channels(),
        bridge.interrupts().overhead_ticks()
    );
    if bridge.is_system_controller() {
        println!("Arbiter      : {:?}", bridge.arbiter()?);
    }
    println!("Requester    : {:?}", bridge.requester()?);
    match bridge.check_bus_error(false)? {
        Some(fault) => println!("Bus error    : {} side at {:#x}", fault.side, fault.address),
        None => println!("Bus error    : none latched"),
    }

    Ok(())
}

fn cmd_windows(device: &str) -> Result<()> {
    let bridge = open(device)?;

    println!("Outbound:");
    for w in bridge.outbound_windows()? {
        println!(
            "  [{}] PCI {:#010x}+{:#x} -> {} {:#x}  {:?} {:?}",
            w.index, w.pci_base, w.size, w.attrs.space, w.vme_base, w.attrs.width, w.attrs.protocol
        );
    }
    println!("Inbound:");
    for index in 0..8 {
        let w = bridge.query_inbound(index)?;
        if w.enabled {
            println!(
                "  [{}] {} {:#x}+{:#x} -> PCI {:#010x}  {}",
                w.index, w.space, w.vme_base, w.size, w.pci_base, w.protocol
            );
        }
    }

    Ok(())
}

fn cmd_arbiter(device: &str, mode: Option<ModeArg>, timeout_us: Option<u32>) -> Result<()> {
    let bridge = open(device)?;
    let mut config = bridge.arbiter()?;

    if mode.is_some() || timeout_us.is_some() {
        if let Some(mode) = mode {
            config.mode = match mode {
                ModeArg::RoundRobin => ArbitrationMode::RoundRobin,
                ModeArg::Priority => ArbitrationMode::Priority,
            };
        }
        if let Some(us) = timeout_us {
            config.timeout = if us == 0 {
                BusTimeout::Disabled
            } else {
                BusTimeout::Micros(us)
            };
        }
        bridge.set_arbiter(&config)?;
        config = bridge.arbiter()?;
    }

    println!("Mode                : {:?}", config.mode);
    println!("Bus timeout         : {:?}", config.timeout);
    println!("Arbitration timeout : {}", config.arbitration_timeout);
    println!("No early release    : {}", config.no_early_release);
    Ok(())
}

fn cmd_requester(device: &str, level: Option<u8>) -> Result<()> {
    let bridge = open(device)?;
    let mut config = bridge.requester()?;

    if let Some(level) = level {
        config.level = level;
        bridge.set_requester(&config)?;
        config = bridge.requester()?;
    }

    println!("Level    : {}", config.level);
    println!("Fair     : {}", config.fair);
    println!("Release  : {:?}", config.release);
    println!("Time on  : {}", config.time_on);
    println!("Time off : {}", config.time_off);
    Ok(())
}

/// Interface over the 64 KB VME block holding the target word
fn scratch<'b>(bridge: &'b VmeBridge, target: &Target) -> Result<(VmeInterface<'b>, u64)> {
    if target.address % 4 != 0 {
        bail!("Address {:#x} is not 32-bit aligned", target.address);
    }
    let base = target.address & !(SCRATCH_SIZE - 1);
    let config = VmeInterfaceConfig::new(base, SCRATCH_SIZE, target.pci_base)
        .with_space(target.space.into())
        .with_window(target.window);
    let vme = VmeInterface::new(bridge, config)
        .with_context(|| format!("Placing scratch window {}", target.window))?;
    Ok((vme, target.address - base))
}

fn release_scratch(bridge: &VmeBridge, target: &Target) -> Result<()> {
    bridge.configure_outbound(&vme_bridge::OutboundWindow::disabled(target.window))?;
    Ok(())
}

fn cmd_peek(target: &Target) -> Result<()> {
    let bridge = open(&target.device)?;
    let value = {
        let (vme, offset) = scratch(&bridge, target)?;
        vme.read32(offset)
    };
    release_scratch(&bridge, target)?;
    let value = value?;
    println!(
        "{} {:#x}: {value:#010x}",
        AddressSpace::from(target.space),
        target.address
    );
    Ok(())
}

fn cmd_poke(target: &Target, value: u32) -> Result<()> {
    let bridge = open(&target.device)?;
    let written = {
        let (vme, offset) = scratch(&bridge, target)?;
        vme.write32(offset, value)
    };
    release_scratch(&bridge, target)?;
    written?;
    println!(
        "{} {:#x} <- {value:#010x}",
        AddressSpace::from(target.space),
        target.address
    );
    Ok(())
}

fn cmd_sys_reset(device: &str) -> Result<()> {
    let bridge = open(device)?;
    println!("Asserting SYSRESET on the {} ...", bridge.variant());
    bridge.sys_reset()?;
    println!("Done.");
    Ok(())
}
