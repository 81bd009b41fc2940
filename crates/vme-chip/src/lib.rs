//! Silicon model for the Tundra PCI-VME bridge family.
//!
//! This crate has **no dependencies** and **no hardware access**: it is a
//! pure model of the two supported bridges, the ca91c042 ("Universe II")
//! and the Tsi148 ("Tempe"). Register offsets and bit positions follow
//! the chip datasheets and are not implementation choices.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, chip variant identification |
//! | [`attr`] | VME address spaces, data widths, protocols, 2eSST rates |
//! | [`universe`] | ca91c042 register map and field encodings |
//! | [`tsi148`] | Tsi148 register map and field encodings |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod attr;
pub mod pcie;
pub mod tsi148;
pub mod universe;

/// Host page size assumed by the DMA descriptor layout.
pub const PAGE_SIZE: usize = 4096;
