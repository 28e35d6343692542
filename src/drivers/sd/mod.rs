//! SD/MMC over SPI Driver
//!
//! This module speaks the SD card protocol in SPI mode over a
//! [`SpiChannel`]. It identifies the card (MMC, SD v1, SD v2, SDHC), reads
//! its CID and CSD, and moves 512-byte sectors in and out.
//!
//! Every operation takes the shared bus for its duration and hands it back
//! on every exit path, success or failure.

pub mod card_info;
pub mod regs;

use crate::drivers::spi::{Speed, SpiChannel, SpiHost};
use crate::time::{Timeout, TickSource, wait_ms};
use core::fmt;
use tock_registers::LocalRegisterCopy;

pub use card_info::{CardInfo, CardType, Cid, Csd, CsdLayout, SECTOR_SHIFT, SECTOR_SIZE};
use regs::*;

/// Card initialization (ACMD41/CMD1 polling) timeout (milliseconds)
const INIT_TIMEOUT_MS: u32 = 1000;

/// Wait for card ready / data token timeout (milliseconds)
const DATA_TIMEOUT_MS: u32 = 500;

/// Settle time after the power-up dummy clocks (milliseconds)
const RESET_SETTLE_MS: u32 = 20;

/// Dummy bytes clocked before CMD0 (80 clocks, at least 74 required)
const RESET_DUMMY_BYTES: usize = 10;

/// Bytes polled for an R1 response before giving up
const RESPONSE_POLLS: usize = 10;

/// Size of CID and CSD register blocks
const REGISTER_BLOCK_SIZE: usize = 16;

/// SD protocol error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// A poll loop ran past its deadline
    Timeout,
    /// Card answered outside the accepted set
    BadResponse,
    /// No card classified
    NoCard,
    /// Card metadata outside what the driver can handle
    Unsupported,
    /// Transfer reaches past the last sector of the card
    OutOfRange,
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SdError::Timeout => "timeout",
            SdError::BadResponse => "bad response",
            SdError::NoCard => "no card",
            SdError::Unsupported => "unsupported card",
            SdError::OutOfRange => "address out of range",
        };
        f.write_str(text)
    }
}

impl From<crate::drivers::spi::SpiError> for SdError {
    fn from(_: crate::drivers::spi::SpiError) -> Self {
        SdError::NoCard
    }
}

/// Map a failed R1 to an error: nothing received is a timeout, anything
/// else the card said is a bad response.
fn r1_error(response: u8) -> SdError {
    let r1 = R1::from_bits_retain(response);
    if r1.contains(R1::NO_RESPONSE) {
        SdError::Timeout
    } else {
        log::debug!("SD: R1 {:?}", r1);
        SdError::BadResponse
    }
}

/// SD card on an SPI channel
pub struct SdCard<'a, H: SpiHost, T: TickSource> {
    /// Channel the card sits on
    spi: SpiChannel<'a, H>,
    /// Tick source for every poll deadline
    clock: &'a T,
    /// Identification result; `CardType::None` until `init` succeeds
    info: CardInfo,
}

impl<'a, H: SpiHost, T: TickSource> SdCard<'a, H, T> {
    pub fn new(spi: SpiChannel<'a, H>, clock: &'a T) -> Self {
        Self {
            spi,
            clock,
            info: CardInfo::default(),
        }
    }

    /// Identify and initialize the card
    ///
    /// On failure the card is left unclassified. The bus is released
    /// either way.
    pub fn init(&mut self) -> Result<(), SdError> {
        self.info = CardInfo::default();
        self.spi.set_speed(Speed::Slow);

        let result = self.init_card();
        self.deselect();

        match result {
            Ok(info) => {
                self.info = info;
                self.spi.set_speed(Speed::Fast);
                log::info!("SD: {}", self.info);
                Ok(())
            }
            Err(e) => {
                log::error!("SD: card initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn init_card(&mut self) -> Result<CardInfo, SdError> {
        self.reset_card();

        log::debug!("SD: Sending CMD0 (GO_IDLE_STATE)");
        let r1 = self.send_command(MMC_CMD_GO_IDLE_STATE, 0);
        if r1 != R1_IDLE {
            log::debug!("SD: CMD0 answered {:#04x}, no card", r1);
            return Err(SdError::NoCard);
        }

        let clock = self.clock;
        let timeout = Timeout::from_ms(clock, INIT_TIMEOUT_MS);

        log::debug!("SD: Sending CMD8 (SEND_IF_COND)");
        let card_type = if self.send_command(SD_CMD_SEND_IF_COND, IF_COND_ARG) == R1_IDLE
            && self.read_u32() == IF_COND_ECHO
        {
            log::debug!("SD: SD 2.0+ card detected");
            self.init_sd_v2(&timeout)?
        } else {
            self.init_legacy(&timeout)?
        };

        log::debug!("SD: card type {}", card_type.name());

        let cid = Cid::decode(&self.read_register(MMC_CMD_SEND_CID)?);
        let csd = Csd::decode(&self.read_register(MMC_CMD_SEND_CSD)?, card_type.csd_layout());

        Ok(CardInfo {
            card_type,
            total_sectors: csd.total_sectors()?,
            block_size: csd.block_len_log2()?,
            cid,
            csd,
        })
    }

    /// Power-up sequence: clock the card with chip-select de-asserted so it
    /// enters native mode, then let it settle
    fn reset_card(&mut self) {
        self.spi.obtain();
        self.spi.deselect();
        self.spi.write(&[BUS_IDLE; RESET_DUMMY_BYTES]);
        wait_ms(self.clock, RESET_SETTLE_MS);
    }

    fn init_sd_v2(&mut self, timeout: &Timeout<'_, T>) -> Result<CardType, SdError> {
        log::debug!("SD: Starting ACMD41 loop (HCS)");
        self.poll_ready(SD_CMD_APP_SEND_OP_COND, OCR_HCS, timeout)?;

        let r1 = self.send_command(SD_CMD_READ_OCR, 0);
        if r1 != R1_READY {
            log::error!("SD: CMD58 failed: {:#04x}", r1);
            return Err(r1_error(r1));
        }

        let ocr = LocalRegisterCopy::<u32, OCR::Register>::new(self.read_u32());
        log::debug!("SD: OCR={:#010x}", ocr.get());

        if ocr.is_set(OCR::CCS) {
            Ok(CardType::Sdhc)
        } else {
            Ok(CardType::Sd2)
        }
    }

    fn init_legacy(&mut self, timeout: &Timeout<'_, T>) -> Result<CardType, SdError> {
        let (card_type, poll_cmd) = if self.send_command(SD_CMD_APP_SEND_OP_COND, 0) <= R1_IDLE {
            (CardType::Sd1, SD_CMD_APP_SEND_OP_COND)
        } else {
            (CardType::Mmc, MMC_CMD_SEND_OP_COND)
        };

        log::debug!("SD: {} card, polling CMD{}", card_type.name(), poll_cmd & !ACMD_FLAG);
        self.poll_ready(poll_cmd, 0, timeout)?;

        let r1 = self.send_command(MMC_CMD_SET_BLOCKLEN, SECTOR_SIZE as u32);
        if r1 != R1_READY {
            log::error!("SD: CMD16 failed: {:#04x}", r1);
            return Err(r1_error(r1));
        }

        Ok(card_type)
    }

    /// Repeat `cmd` until the card leaves idle state
    fn poll_ready(&mut self, cmd: u8, arg: u32, timeout: &Timeout<'_, T>) -> Result<(), SdError> {
        loop {
            if self.send_command(cmd, arg) == R1_READY {
                return Ok(());
            }
            if timeout.is_expired() {
                log::error!("SD: Card initialization timeout");
                return Err(SdError::Timeout);
            }
        }
    }

    /// Issue CMD9/CMD10 and read the 16-byte register block
    fn read_register(&mut self, cmd: u8) -> Result<[u8; REGISTER_BLOCK_SIZE], SdError> {
        let r1 = self.send_command(cmd, 0);
        if r1 != R1_READY {
            log::error!("SD: CMD{} failed: {:#04x}", cmd, r1);
            return Err(r1_error(r1));
        }

        let mut raw = [0u8; REGISTER_BLOCK_SIZE];
        self.receive_data_block(&mut raw)?;
        log::trace!("SD: CMD{} register {:02x?}", cmd, raw);
        Ok(raw)
    }

    // ========================================================================
    // Bus Bracketing
    // ========================================================================

    /// Wait until the card stops holding DO low
    fn wait_ready(&mut self, timeout_ms: u32) -> Result<(), SdError> {
        let clock = self.clock;
        let timeout = Timeout::from_ms(clock, timeout_ms);
        loop {
            if self.spi.read_byte() == BUS_IDLE {
                return Ok(());
            }
            if timeout.is_expired() {
                return Err(SdError::Timeout);
            }
        }
    }

    /// Take the bus, assert chip-select and wait for the card
    fn select(&mut self) -> Result<(), SdError> {
        self.spi.obtain();
        self.spi.select();
        // Dummy clock so the card drives DO
        self.spi.read_byte();

        if let Err(e) = self.wait_ready(DATA_TIMEOUT_MS) {
            log::debug!("SD: card not ready on select");
            self.deselect();
            return Err(e);
        }
        Ok(())
    }

    /// De-assert chip-select and give the bus back
    fn deselect(&mut self) {
        self.spi.shutdown();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Send a command and return its R1 byte
    ///
    /// Application commands (index | [`ACMD_FLAG`]) get their APP_CMD
    /// prefix here. A returned value with bit 7 set means no response was
    /// seen; treat it only as "failed", its exact value carries nothing.
    pub fn send_command(&mut self, cmd: u8, arg: u32) -> u8 {
        let mut cmd = cmd;
        if cmd & ACMD_FLAG != 0 {
            cmd &= !ACMD_FLAG;
            let r1 = self.send_command(MMC_CMD_APP_CMD, 0);
            if r1 > R1_IDLE {
                return r1;
            }
        }

        // Quiesce the bus between transactions, except when stopping a
        // multiple block read which is still in progress
        if cmd != MMC_CMD_STOP_TRANSMISSION {
            self.deselect();
            if self.select().is_err() {
                return BUS_IDLE;
            }
        }

        let crc = match cmd {
            MMC_CMD_GO_IDLE_STATE => CRC_GO_IDLE_STATE,
            SD_CMD_SEND_IF_COND => CRC_SEND_IF_COND,
            _ => CRC_DUMMY,
        };
        let arg = arg.to_be_bytes();
        let frame = [CMD_FRAME_START | cmd, arg[0], arg[1], arg[2], arg[3], crc];
        log::trace!("SD: CMD{} frame {:02x?}", cmd, frame);
        self.spi.write(&frame);

        if cmd == MMC_CMD_STOP_TRANSMISSION {
            // Discard the stuff byte
            self.spi.read_byte();
        }

        let mut response = BUS_IDLE;
        for _ in 0..RESPONSE_POLLS {
            response = self.spi.read_byte();
            if response & R1::NO_RESPONSE.bits() == 0 {
                break;
            }
        }
        response
    }

    fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.spi.read(&mut buf);
        u32::from_be_bytes(buf)
    }

    // ========================================================================
    // Data Blocks
    // ========================================================================

    /// Receive one data block into `buf`
    fn receive_data_block(&mut self, buf: &mut [u8]) -> Result<(), SdError> {
        let clock = self.clock;
        let timeout = Timeout::from_ms(clock, DATA_TIMEOUT_MS);
        let token = loop {
            let token = self.spi.read_byte();
            if token != BUS_IDLE {
                break token;
            }
            if timeout.is_expired() {
                log::debug!("SD: data token timeout");
                return Err(SdError::Timeout);
            }
        };

        if token != TOKEN_START_BLOCK {
            log::debug!("SD: data error token {:#04x}", token);
            return Err(SdError::BadResponse);
        }

        self.spi.read(buf);
        // CRC is not checked
        let mut crc = [0u8; 2];
        self.spi.read(&mut crc);
        Ok(())
    }

    /// Send one data block behind `token`
    ///
    /// With [`TOKEN_STOP_TRAN`] only the token goes out.
    fn transmit_data_block(&mut self, data: Option<&[u8]>, token: u8) -> Result<(), SdError> {
        if self.wait_ready(DATA_TIMEOUT_MS).is_err() {
            log::debug!("SD: card busy before token {:#04x}", token);
            return Err(SdError::Timeout);
        }

        self.spi.write(&[token]);
        if token == TOKEN_STOP_TRAN {
            return Ok(());
        }

        if let Some(data) = data {
            self.spi.write(data);
        }
        self.spi.write(&[BUS_IDLE, BUS_IDLE]);

        let response = self.spi.read_byte();
        if response & DATA_RESPONSE_MASK != DATA_RESPONSE_ACCEPTED {
            log::debug!("SD: data response {:#04x}", response);
            return Err(SdError::BadResponse);
        }
        Ok(())
    }

    /// Command argument for `lba`: byte offset on standard capacity cards,
    /// block index on SDHC. `None` if the byte offset does not fit 32 bits.
    pub fn block_address(&self, lba: u32) -> Option<u32> {
        if self.info.is_block_addressed() {
            Some(lba)
        } else {
            lba.checked_mul(1 << SECTOR_SHIFT)
        }
    }

    /// Command argument for a transfer of `count` sectors at `lba`
    ///
    /// The whole run must lie on the card and its last sector must still be
    /// addressable.
    fn command_address(&self, lba: u32, count: usize) -> Result<u32, SdError> {
        let end = u32::try_from(count)
            .ok()
            .and_then(|n| lba.checked_add(n))
            .filter(|&end| end <= self.info.total_sectors)
            .ok_or(SdError::OutOfRange)?;
        self.block_address(end - 1).ok_or(SdError::OutOfRange)?;
        self.block_address(lba).ok_or(SdError::OutOfRange)
    }

    /// Read `buf.len() / 512` sectors starting at `lba`
    pub fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), SdError> {
        if !self.info.is_present() {
            return Err(SdError::NoCard);
        }

        let count = buf.len() / SECTOR_SIZE;
        if count == 0 {
            return Ok(());
        }

        let result = self
            .command_address(lba, count)
            .and_then(|arg| self.read_sectors_internal(arg, &mut buf[..count * SECTOR_SIZE]));
        self.deselect();

        if let Err(e) = result {
            log::error!("SD: read of {} sectors at LBA {} failed: {}", count, lba, e);
        }
        result
    }

    fn read_sectors_internal(&mut self, arg: u32, buf: &mut [u8]) -> Result<(), SdError> {
        let multi = buf.len() > SECTOR_SIZE;
        let cmd = if multi {
            MMC_CMD_READ_MULTIPLE_BLOCK
        } else {
            MMC_CMD_READ_SINGLE_BLOCK
        };

        let r1 = self.send_command(cmd, arg);
        if r1 != R1_READY {
            return Err(r1_error(r1));
        }

        let mut result = Ok(());
        for block in buf.chunks_exact_mut(SECTOR_SIZE) {
            if let Err(e) = self.receive_data_block(block) {
                result = Err(e);
                break;
            }
        }

        if multi {
            self.send_command(MMC_CMD_STOP_TRANSMISSION, 0);
        }
        result
    }

    /// Write `buf.len() / 512` sectors starting at `lba`
    pub fn write_sectors(&mut self, lba: u32, buf: &[u8]) -> Result<(), SdError> {
        if !self.info.is_present() {
            return Err(SdError::NoCard);
        }

        let count = buf.len() / SECTOR_SIZE;
        if count == 0 {
            return Ok(());
        }

        let result = self
            .command_address(lba, count)
            .and_then(|arg| self.write_sectors_internal(arg, &buf[..count * SECTOR_SIZE]));
        self.deselect();

        if let Err(e) = result {
            log::error!("SD: write of {} sectors at LBA {} failed: {}", count, lba, e);
        }
        result
    }

    fn write_sectors_internal(&mut self, arg: u32, buf: &[u8]) -> Result<(), SdError> {
        let count = buf.len() / SECTOR_SIZE;

        if count == 1 {
            let r1 = self.send_command(MMC_CMD_WRITE_SINGLE_BLOCK, arg);
            if r1 != R1_READY {
                return Err(r1_error(r1));
            }
            return self.transmit_data_block(Some(buf), TOKEN_START_BLOCK);
        }

        if self.info.card_type.is_sd() {
            let r1 = self.send_command(SD_CMD_APP_SET_WR_BLK_ERASE_COUNT, count as u32);
            if r1 != R1_READY {
                log::warn!("SD: ACMD23 rejected: {:#04x}", r1);
            }
        }

        let r1 = self.send_command(MMC_CMD_WRITE_MULTIPLE_BLOCK, arg);
        if r1 != R1_READY {
            return Err(r1_error(r1));
        }

        let mut result = Ok(());
        for block in buf.chunks_exact(SECTOR_SIZE) {
            if let Err(e) = self.transmit_data_block(Some(block), TOKEN_START_MULTI_WRITE) {
                result = Err(e);
                break;
            }
        }

        let stop = self.transmit_data_block(None, TOKEN_STOP_TRAN);
        result.and(stop)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn info(&self) -> &CardInfo {
        &self.info
    }

    pub fn card_type(&self) -> CardType {
        self.info.card_type
    }

    /// Forget the card; the next use needs [`init`](Self::init) again
    pub fn invalidate(&mut self) {
        self.info = CardInfo::default();
    }

    pub fn spi(&self) -> &SpiChannel<'a, H> {
        &self.spi
    }

    pub fn spi_mut(&mut self) -> &mut SpiChannel<'a, H> {
        &mut self.spi
    }
}
