//! Hardware drivers
//!
//! The SPI transaction layer and the SD card protocol that runs on it.

pub mod sd;
pub mod spi;
