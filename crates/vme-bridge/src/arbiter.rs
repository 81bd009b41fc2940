//! Bus arbiter and requester configuration
//!
//! The arbiter only matters in the system-controller slot; every bridge has
//! a requester. Both are plain register fields, so this module is a set of
//! encode/decode pairs per chip. Timeouts are logarithmic (16 µs doubling
//! per code) and always round up: a request for 100 µs programs 128 µs and
//! a request above the largest code is refused.

use crate::error::{Result, VmeError};
use vme_chip::{tsi148, universe};

/// Arbitration scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbitrationMode {
    /// Rotate between the four request levels
    #[default]
    RoundRobin,
    /// Fixed priority, level 3 highest
    Priority,
}

/// VME bus (global) timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTimeout {
    /// No timeout
    Disabled,
    /// Timeout of at least this many microseconds
    Micros(u32),
}

/// Base unit of the timeout scale.
const TIMEOUT_BASE_US: u32 = 16;

/// Smallest code `n >= 1` with `16 * 2^(n-1) >= us`, up to `max_code`.
fn timeout_code(timeout: BusTimeout, max_code: u32) -> Result<u32> {
    match timeout {
        BusTimeout::Disabled => Ok(0),
        BusTimeout::Micros(us) => (1..=max_code)
            .find(|&n| TIMEOUT_BASE_US << (n - 1) >= us)
            .ok_or_else(|| {
                VmeError::configuration(format!(
                    "Bus timeout {us} µs exceeds the {} µs maximum",
                    TIMEOUT_BASE_US << (max_code - 1)
                ))
            }),
    }
}

fn timeout_from_code(code: u32, max_code: u32) -> BusTimeout {
    if code == 0 {
        BusTimeout::Disabled
    } else {
        let n = code.min(max_code);
        BusTimeout::Micros(TIMEOUT_BASE_US << (n - 1))
    }
}

/// Arbiter settings (system controller only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// Scheduling between request levels
    pub mode: ArbitrationMode,
    /// Global bus timeout
    pub timeout: BusTimeout,
    /// Time out a bus grant nobody picks up
    pub arbitration_timeout: bool,
    /// Suppress early release of BBSY (Tsi148 only)
    pub no_early_release: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            mode: ArbitrationMode::RoundRobin,
            timeout: BusTimeout::Micros(64),
            arbitration_timeout: true,
            no_early_release: false,
        }
    }
}

/// When the requester gives up the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    /// Release when the transfer is done
    #[default]
    WhenDone,
    /// Hold the bus until another master requests it
    OnRequest,
}

/// Local bus-request behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequesterConfig {
    /// Request level 0-3
    pub level: u8,
    /// Fair requester: do not re-request while others are waiting
    pub fair: bool,
    /// Release mode
    pub release: ReleaseMode,
    /// Time-on timer code 0-7 (Tsi148 only)
    pub time_on: u8,
    /// Time-off timer code 0-7 (Tsi148 only)
    pub time_off: u8,
}

impl RequesterConfig {
    /// Start-of-day requester for a given chip: level 3, fair, release
    /// when done; on the Tsi148 the longest time-on and no time-off.
    #[must_use]
    pub const fn default_for(variant: vme_chip::pcie::ChipVariant) -> Self {
        let time_on = match variant {
            vme_chip::pcie::ChipVariant::Tsi148 => 7,
            _ => 0,
        };
        Self {
            level: 3,
            fair: true,
            release: ReleaseMode::WhenDone,
            time_on,
            time_off: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.level > 3 {
            return Err(VmeError::configuration(format!(
                "Request level {} out of range 0-3",
                self.level
            )));
        }
        if self.time_on > 7 || self.time_off > 7 {
            return Err(VmeError::configuration(format!(
                "Requester timer codes {}/{} out of range 0-7",
                self.time_on, self.time_off
            )));
        }
        Ok(())
    }
}

// ── ca91c042 ─────────────────────────────────────────────────────────────────

const UNIVERSE_MAX_VBTO: u32 = 7;
const TSI148_MAX_GTO: u32 = 8;

/// New `MISC_CTL` value for `cfg` given the current register
///
/// # Errors
///
/// Returns `Configuration` if the timeout is out of range or early-release
/// suppression is requested (the chip has no such control).
pub fn encode_universe_arbiter(misc_ctl: u32, cfg: &ArbiterConfig) -> Result<u32> {
    if cfg.no_early_release {
        return Err(VmeError::configuration(
            "ca91c042 cannot suppress early bus release",
        ));
    }
    let mut value = (misc_ctl & universe::misc_ctl::KEEP)
        | (timeout_code(cfg.timeout, UNIVERSE_MAX_VBTO)? << universe::misc_ctl::VBTO_SHIFT);
    if cfg.mode == ArbitrationMode::Priority {
        value |= universe::misc_ctl::VARB_PRIORITY;
    }
    if cfg.arbitration_timeout {
        value |= universe::misc_ctl::VARBTO_ON;
    }
    Ok(value)
}

/// Arbiter settings held in `MISC_CTL`
#[must_use]
pub fn decode_universe_arbiter(misc_ctl: u32) -> ArbiterConfig {
    ArbiterConfig {
        mode: if misc_ctl & universe::misc_ctl::VARB_PRIORITY != 0 {
            ArbitrationMode::Priority
        } else {
            ArbitrationMode::RoundRobin
        },
        timeout: timeout_from_code(
            (misc_ctl >> universe::misc_ctl::VBTO_SHIFT) & 0xF,
            UNIVERSE_MAX_VBTO,
        ),
        arbitration_timeout: misc_ctl & universe::misc_ctl::VARBTO_MASK != 0,
        no_early_release: false,
    }
}

/// New `MAST_CTL` value for `cfg`
///
/// # Errors
///
/// Returns `Configuration` for out-of-range fields or nonzero timers.
pub fn encode_universe_requester(mast_ctl: u32, cfg: &RequesterConfig) -> Result<u32> {
    cfg.validate()?;
    if cfg.time_on != 0 || cfg.time_off != 0 {
        return Err(VmeError::configuration(
            "ca91c042 requester has no time-on/time-off timers",
        ));
    }
    let mut value =
        (mast_ctl & universe::mast_ctl::KEEP) | (u32::from(cfg.level) << universe::mast_ctl::VRL_SHIFT);
    if cfg.release == ReleaseMode::OnRequest {
        value |= universe::mast_ctl::VRM;
    }
    if cfg.fair {
        value |= universe::mast_ctl::VREL_FAIR;
    }
    Ok(value)
}

/// Requester settings held in `MAST_CTL`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode_universe_requester(mast_ctl: u32) -> RequesterConfig {
    RequesterConfig {
        level: ((mast_ctl & universe::mast_ctl::VRL_MASK) >> universe::mast_ctl::VRL_SHIFT) as u8,
        fair: mast_ctl & universe::mast_ctl::VREL_FAIR != 0,
        release: if mast_ctl & universe::mast_ctl::VRM != 0 {
            ReleaseMode::OnRequest
        } else {
            ReleaseMode::WhenDone
        },
        time_on: 0,
        time_off: 0,
    }
}

// ── Tsi148 ───────────────────────────────────────────────────────────────────

/// New `VCTRL` value for `cfg`
///
/// # Errors
///
/// Returns `Configuration` if the timeout exceeds 2048 µs.
pub fn encode_tsi148_arbiter(vctrl: u32, cfg: &ArbiterConfig) -> Result<u32> {
    let mut value = (vctrl & tsi148::vctrl::KEEP) | timeout_code(cfg.timeout, TSI148_MAX_GTO)?;
    if cfg.mode == ArbitrationMode::RoundRobin {
        value |= tsi148::vctrl::ROBIN;
    }
    if cfg.arbitration_timeout {
        value |= tsi148::vctrl::ATOEN;
    }
    if cfg.no_early_release {
        value |= tsi148::vctrl::NERBB;
    }
    Ok(value)
}

/// Arbiter settings held in `VCTRL`
#[must_use]
pub fn decode_tsi148_arbiter(vctrl: u32) -> ArbiterConfig {
    ArbiterConfig {
        mode: if vctrl & tsi148::vctrl::ROBIN != 0 {
            ArbitrationMode::RoundRobin
        } else {
            ArbitrationMode::Priority
        },
        timeout: timeout_from_code(vctrl & tsi148::vctrl::GTO_MASK, TSI148_MAX_GTO),
        arbitration_timeout: vctrl & tsi148::vctrl::ATOEN != 0,
        no_early_release: vctrl & tsi148::vctrl::NERBB != 0,
    }
}

/// New `VMCTRL` value for `cfg`
///
/// # Errors
///
/// Returns `Configuration` for out-of-range fields.
pub fn encode_tsi148_requester(vmctrl: u32, cfg: &RequesterConfig) -> Result<u32> {
    cfg.validate()?;
    let mut value = (vmctrl & tsi148::vmctrl::KEEP)
        | (u32::from(cfg.time_off) << tsi148::vmctrl::VTOFF_SHIFT)
        | (u32::from(cfg.time_on) << tsi148::vmctrl::VTON_SHIFT)
        | u32::from(cfg.level);
    if cfg.release == ReleaseMode::OnRequest {
        value |= tsi148::vmctrl::VREL;
    }
    if cfg.fair {
        value |= tsi148::vmctrl::VFAIR;
    }
    Ok(value)
}

/// Requester settings held in `VMCTRL`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode_tsi148_requester(vmctrl: u32) -> RequesterConfig {
    RequesterConfig {
        level: (vmctrl & tsi148::vmctrl::VREQL_MASK) as u8,
        fair: vmctrl & tsi148::vmctrl::VFAIR != 0,
        release: if vmctrl & tsi148::vmctrl::VREL_ANY != 0 {
            ReleaseMode::OnRequest
        } else {
            ReleaseMode::WhenDone
        },
        time_on: ((vmctrl >> tsi148::vmctrl::VTON_SHIFT) & 7) as u8,
        time_off: ((vmctrl >> tsi148::vmctrl::VTOFF_SHIFT) & 7) as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vme_chip::pcie::ChipVariant;

    #[test]
    fn timeouts_round_up() {
        assert_eq!(timeout_code(BusTimeout::Disabled, 8).unwrap(), 0);
        assert_eq!(timeout_code(BusTimeout::Micros(0), 8).unwrap(), 1);
        assert_eq!(timeout_code(BusTimeout::Micros(16), 8).unwrap(), 1);
        assert_eq!(timeout_code(BusTimeout::Micros(17), 8).unwrap(), 2);
        assert_eq!(timeout_code(BusTimeout::Micros(100), 8).unwrap(), 4);
        assert_eq!(timeout_code(BusTimeout::Micros(2048), 8).unwrap(), 8);
        assert!(timeout_code(BusTimeout::Micros(2049), 8).is_err());
        assert!(timeout_code(BusTimeout::Micros(1025), 7).is_err());

        assert_eq!(timeout_from_code(0, 8), BusTimeout::Disabled);
        assert_eq!(timeout_from_code(1, 8), BusTimeout::Micros(TIMEOUT_BASE_US));
        assert_eq!(timeout_from_code(8, 8), BusTimeout::Micros(2048));
        assert_eq!(timeout_from_code(9, 7), BusTimeout::Micros(1024));
    }

    #[test]
    fn universe_arbiter_fields() {
        let cfg = ArbiterConfig {
            mode: ArbitrationMode::Priority,
            timeout: BusTimeout::Micros(100),
            arbitration_timeout: true,
            no_early_release: false,
        };
        let value = encode_universe_arbiter(0xFFFF_FFFF, &cfg).unwrap();
        assert_eq!(value, 0x00FF_FFFF | (4 << 28) | (1 << 26) | (2 << 24));
        let back = decode_universe_arbiter(value);
        assert_eq!(back.timeout, BusTimeout::Micros(128));
        assert_eq!(back.mode, ArbitrationMode::Priority);
        assert!(back.arbitration_timeout);
    }

    #[test]
    fn universe_rejects_tsi148_only_options() {
        let cfg = ArbiterConfig {
            no_early_release: true,
            ..ArbiterConfig::default()
        };
        assert!(encode_universe_arbiter(0, &cfg).is_err());

        let req = RequesterConfig::default_for(ChipVariant::Tsi148);
        assert!(encode_universe_requester(0, &req).is_err());
    }

    #[test]
    fn tsi148_arbiter_fields() {
        let cfg = ArbiterConfig {
            mode: ArbitrationMode::RoundRobin,
            timeout: BusTimeout::Disabled,
            arbitration_timeout: false,
            no_early_release: true,
        };
        let value = encode_tsi148_arbiter(0x0000_00FF, &cfg).unwrap();
        assert_eq!(value, (1 << 20) | (1 << 6));
        assert_eq!(decode_tsi148_arbiter(value), cfg);
    }

    #[test]
    fn requester_defaults_round_trip() {
        let req = RequesterConfig::default_for(ChipVariant::Tsi148);
        let value = encode_tsi148_requester(0xABCD_0000, &req).unwrap();
        assert_eq!(value, 0xABCD_0000 | (7 << 8) | (1 << 2) | 3);
        assert_eq!(decode_tsi148_requester(value), req);

        let req = RequesterConfig::default_for(ChipVariant::Universe);
        let value = encode_universe_requester(0, &req).unwrap();
        assert_eq!(value, (3 << 22) | (1 << 21));
        assert_eq!(decode_universe_requester(value), req);
    }

    #[test]
    fn requester_ranges() {
        let mut req = RequesterConfig::default_for(ChipVariant::Tsi148);
        req.level = 4;
        assert!(encode_tsi148_requester(0, &req).is_err());
        req.level = 0;
        req.time_off = 8;
        assert!(encode_tsi148_requester(0, &req).is_err());
    }
}
