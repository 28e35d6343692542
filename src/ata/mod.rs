//! ATA disk unit backed by an SD card
//!
//! The disk subsystem drives every unit through the ATA entry points. This
//! module answers them for a card on the SPI bus: it synthesizes IDENTIFY
//! data from the CID and a CHS geometry, and maps sector I/O onto the SD
//! protocol engine. Protocol errors are logged here and collapsed into the
//! host's [`IoError`] codes.

mod atapi;
pub mod geometry;
pub mod regs;

use crate::drivers::sd::{CardInfo, SECTOR_SIZE, SdCard};
use crate::drivers::spi::{BusArbiter, SpiChannel, SpiHost};
use crate::time::TickSource;
use core::fmt::Write;

pub use geometry::{Geometry, compute_geometry};
pub use regs::IoError;
use regs::*;

/// Only unit 0 exists on an SD interface
const SUPPORTED_UNIT: u8 = 0;

/// How the host copies data to and from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferMethod {
    LongwordMovem,
    LongwordMove,
    WordMove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDirection {
    Read,
    Write,
}

/// A SCSI command as handed over by the host
pub struct ScsiCmd<'a> {
    /// Command descriptor block
    pub command: &'a [u8],
    /// Data phase buffer
    pub data: &'a mut [u8],
    /// Bytes actually transferred
    pub actual: u32,
    /// SCSI status byte
    pub status: u8,
}

impl<'a> ScsiCmd<'a> {
    pub fn new(command: &'a [u8], data: &'a mut [u8]) -> Self {
        Self {
            command,
            data,
            actual: 0,
            status: 0,
        }
    }
}

/// One logical disk unit
pub struct IdeUnit<'a, H: SpiHost, T: TickSource> {
    /// Unit number the disk subsystem addresses; only 0 can be brought up
    unit_number: u8,
    /// Chip-select line the card is wired to
    channel: u8,
    /// Protocol engine for the card
    card: SdCard<'a, H, T>,
    /// CHS layout derived at `init_unit`; all zero while no card is up
    geometry: Geometry,
}

impl<'a, H: SpiHost, T: TickSource> IdeUnit<'a, H, T> {
    /// Create unit `unit_number` on chip-select `channel`
    ///
    /// Nothing touches the hardware until [`init_unit`](Self::init_unit).
    pub fn new(unit_number: u8, channel: u8, host: H, bus: &'a BusArbiter, clock: &'a T) -> Self {
        Self {
            unit_number,
            channel,
            card: SdCard::new(SpiChannel::new(host, bus), clock),
            geometry: Geometry::default(),
        }
    }

    /// Create a unit on [`DEFAULT_SPI_CHANNEL`](crate::DEFAULT_SPI_CHANNEL)
    pub fn with_default_channel(unit_number: u8, host: H, bus: &'a BusArbiter, clock: &'a T) -> Self {
        Self::new(unit_number, crate::DEFAULT_SPI_CHANNEL, host, bus, clock)
    }

    /// Bring up the card and derive the unit geometry
    pub fn init_unit(&mut self) -> bool {
        if self.unit_number != SUPPORTED_UNIT {
            log::error!("ATA: unit {} not supported", self.unit_number);
            return false;
        }

        self.geometry = Geometry::default();
        self.card.invalidate();

        if let Err(e) = self.card.spi_mut().initialize(self.channel) {
            log::error!("ATA: SPI channel {:#04x} setup failed: {}", self.channel, e);
            return false;
        }

        if let Err(e) = self.card.init() {
            log::error!("ATA: unit {} has no usable card: {}", self.unit_number, e);
            return false;
        }

        self.geometry = compute_geometry(self.card.info().total_sectors);
        log::info!(
            "ATA: unit {} C/H/S {}/{}/{}, {} sectors",
            self.unit_number,
            self.geometry.cylinders,
            self.geometry.heads,
            self.geometry.sectors_per_track,
            self.geometry.logical_sectors
        );
        true
    }

    /// Fill an IDENTIFY DEVICE buffer
    pub fn identify(&mut self, buffer: &mut [u16]) -> bool {
        if !self.card.info().is_present() {
            log::debug!("ATA: IDENTIFY without a card");
            return false;
        }
        if buffer.len() < IDENTIFY_WORDS {
            log::error!("ATA: IDENTIFY buffer too small ({} words)", buffer.len());
            return false;
        }

        let info = self.card.info();
        let g = &self.geometry;
        let buffer = &mut buffer[..IDENTIFY_WORDS];
        buffer.fill(0);

        buffer[IDENTIFY_GENERAL_CONFIG] = GENERAL_CONFIG_FIXED;
        buffer[IDENTIFY_CYLINDERS] = g.cylinders.min(u16::MAX as u32) as u16;
        buffer[IDENTIFY_HEADS] = g.heads as u16;
        buffer[IDENTIFY_SECTORS_PER_TRACK] = g.sectors_per_track as u16;
        buffer[IDENTIFY_CAPABILITIES] = Capabilities::LBA.bits();

        let lba_sectors = g.logical_sectors.min(LBA28_MAX_SECTORS);
        buffer[IDENTIFY_LBA_SECTORS] = lba_sectors as u16;
        buffer[IDENTIFY_LBA_SECTORS + 1] = (lba_sectors >> 16) as u16;

        let serial = serial_string(info);
        put_ata_string(
            &mut buffer[IDENTIFY_SERIAL..IDENTIFY_SERIAL + IDENTIFY_SERIAL_LEN / 2],
            serial.as_bytes(),
        );

        let firmware = firmware_string(info);
        put_ata_string(
            &mut buffer[IDENTIFY_FW_REV..IDENTIFY_FW_REV + IDENTIFY_FW_REV_LEN / 2],
            firmware.as_bytes(),
        );

        let model = model_string(info);
        put_ata_string(
            &mut buffer[IDENTIFY_MODEL..IDENTIFY_MODEL + IDENTIFY_MODEL_LEN / 2],
            model.as_bytes(),
        );

        true
    }

    /// Read `count` sectors at `lba` into `buffer`
    pub fn read(&mut self, buffer: &mut [u8], lba: u32, count: u32) -> Result<(), IoError> {
        let len = self.transfer_len(buffer.len(), count)?;
        if len == 0 {
            return Ok(());
        }

        self.card.read_sectors(lba, &mut buffer[..len]).map_err(|e| {
            log::error!("ATA: read LBA {} x{} aborted: {}", lba, count, e);
            IoError::Aborted
        })
    }

    /// Write `count` sectors from `buffer` at `lba`
    pub fn write(&mut self, buffer: &[u8], lba: u32, count: u32) -> Result<(), IoError> {
        let len = self.transfer_len(buffer.len(), count)?;
        if len == 0 {
            return Ok(());
        }

        self.card.write_sectors(lba, &buffer[..len]).map_err(|e| {
            log::error!("ATA: write LBA {} x{} aborted: {}", lba, count, e);
            IoError::Aborted
        })
    }

    fn transfer_len(&self, available: usize, count: u32) -> Result<usize, IoError> {
        if !self.card.info().is_present() {
            return Err(IoError::OpenFail);
        }

        match (count as usize).checked_mul(SECTOR_SIZE) {
            Some(len) if len <= available => Ok(len),
            _ => {
                log::error!("ATA: {} sectors do not fit a {} byte buffer", count, available);
                Err(IoError::BadLength)
            }
        }
    }

    /// Transfer method has no meaning on SPI
    pub fn set_xfer(&mut self, method: XferMethod) {
        log::trace!("ATA: ignoring transfer method {:?}", method);
    }

    /// PIO modes have no meaning on SPI
    pub fn set_pio(&mut self, _pio: u8) -> Result<(), IoError> {
        Ok(())
    }

    pub fn scsi_ata_passthrough(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn unit_number(&self) -> u8 {
        self.unit_number
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn card_info(&self) -> &CardInfo {
        self.card.info()
    }

    pub fn card(&self) -> &SdCard<'a, H, T> {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut SdCard<'a, H, T> {
        &mut self.card
    }
}

/// Product serial as right-aligned hex
fn serial_string(info: &CardInfo) -> heapless::String<IDENTIFY_SERIAL_LEN> {
    let mut s = heapless::String::new();
    let _ = write!(s, "{:>20}", HexSerial(info.cid.serial_number));
    s
}

struct HexSerial(u32);

impl core::fmt::Display for HexSerial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut hex = heapless::String::<8>::new();
        write!(hex, "{:08X}", self.0)?;
        f.pad(&hex)
    }
}

/// Product revision as two nibble digits
fn firmware_string(info: &CardInfo) -> heapless::String<IDENTIFY_FW_REV_LEN> {
    let (major, minor) = info.cid.revision();
    let mut s = heapless::String::new();
    let _ = write!(s, "{:X}{:X}", major, minor);
    s
}

fn model_string(info: &CardInfo) -> heapless::String<IDENTIFY_MODEL_LEN> {
    let mut s = heapless::String::new();
    let _ = write!(
        s,
        "mfg.{:02X}SD-CARD{}",
        info.cid.manufacturer_id,
        info.cid.product_name_str()
    );
    s
}

/// Store `text` as an ATA string: space padded, first character of each
/// pair in the high byte
fn put_ata_string(words: &mut [u16], text: &[u8]) {
    for (i, word) in words.iter_mut().enumerate() {
        let hi = text.get(2 * i).copied().unwrap_or(b' ');
        let lo = text.get(2 * i + 1).copied().unwrap_or(b' ');
        *word = u16::from_be_bytes([hi, lo]);
    }
}
