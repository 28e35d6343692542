//! sdspi - SD/MMC cards on a shared SPI bus, presented as an ATA disk
//!
//! The crate is split the way the hardware is layered:
//!
//! - [`drivers::spi`]: chip-select, bus arbitration and paced byte transfers
//! - [`drivers::sd`]: the SD protocol in SPI mode (identification, CID/CSD,
//!   sector I/O)
//! - [`ata`]: the ATA/ATAPI entry points the disk subsystem calls, IDENTIFY
//!   synthesis and CHS geometry
//!
//! The host provides the controller (an `embedded-hal` SPI bus and delay plus
//! a [`drivers::spi::ChipSelect`], bundled as [`drivers::spi::SpiHost`]), a tick
//! counter ([`time::TickSource`]) and optionally a log sink
//! ([`logger::LogSink`]).

#![cfg_attr(not(test), no_std)]

pub mod ata;
pub mod drivers;
pub mod logger;
pub mod time;

#[cfg(test)]
mod testing;

pub use ata::{Geometry, IdeUnit, IoError, compute_geometry};
pub use drivers::sd::{CardInfo, CardType, SdCard, SdError};
pub use drivers::spi::{BusArbiter, ChipSelect, ChipSelectPins, SpiChannel, SpiError, SpiHost, SpiParts};
pub use time::TickSource;

/// Chip-select the unit uses unless told otherwise
pub const DEFAULT_SPI_CHANNEL: u8 = if cfg!(feature = "spi-channel-2") {
    drivers::spi::SPI_CHANNEL_2
} else {
    drivers::spi::SPI_CHANNEL_1
};
