//! SPI transaction layer
//!
//! Several logical devices can hang off one physical SPI controller, each on
//! its own chip-select line. A [`SpiChannel`] is one such device: it owns a
//! handle to the controller, knows which chip-select to drive, and must hold
//! the shared [`BusArbiter`] token while it toggles chip-select or moves
//! bytes.
//!
//! The controller is anything that implements `embedded-hal`'s [`SpiBus`]
//! and [`DelayNs`]. Chip-select stays a separate [`ChipSelect`] hook because
//! one controller drives several lines and the channel picks which one.
//!
//! The token is a plain lock, not a queue. Whoever cannot obtain it spins.

use core::fmt;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, OutputPin};
use embedded_hal::spi::{Error as _, ErrorType, SpiBus};
use heapless::Vec;
use spin::{Mutex, MutexGuard};

/// Chip-select line 1
pub const SPI_CHANNEL_1: u8 = 0x01;

/// Chip-select line 2
pub const SPI_CHANNEL_2: u8 = 0x02;

/// Number of chip-select lines on the controller
const MAX_ATTACHED_CHANNELS: usize = 2;

/// Pacing delay after every byte in slow mode. A slow transfer takes about
/// 32 us at 250 kHz; the extra margin keeps the clock under the 400 kHz
/// identification ceiling.
const SLOW_BYTE_DELAY_US: u32 = 40;

/// Level of an idle MISO line, and what we clock out while reading
const IDLE_BYTE: u8 = 0xFF;

/// SPI layer error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiError {
    /// Channel id is not one of the chip-select lines
    InvalidChannel(u8),
    /// Another live channel already drives this chip-select
    ChannelInUse(u8),
    /// Arbiter cannot track any more channels
    RegistryFull,
}

impl fmt::Display for SpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpiError::InvalidChannel(id) => write!(f, "invalid SPI channel {:#04x}", id),
            SpiError::ChannelInUse(id) => write!(f, "SPI channel {:#04x} already in use", id),
            SpiError::RegistryFull => write!(f, "SPI bus registry full"),
        }
    }
}

/// Bus clock setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    /// Identification speed, every byte paced by the host delay
    Slow,
    /// Full controller speed
    Fast,
}

/// A validated chip-select line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(raw: u8) -> Result<Self, SpiError> {
        match raw {
            SPI_CHANNEL_1 | SPI_CHANNEL_2 => Ok(Self(raw)),
            _ => Err(SpiError::InvalidChannel(raw)),
        }
    }

    /// Chip-select mask driven while this channel is selected
    pub fn mask(self) -> u8 {
        self.0
    }
}

/// Chip-select lines of the controller
pub trait ChipSelect {
    /// Assert the lines set in `mask` and de-assert the rest. A mask of 0
    /// de-asserts all of them.
    fn set_active(&mut self, mask: u8);
}

/// Everything a channel needs from the board: the shift register, a delay
/// source for slow-mode pacing and the chip-select lines
pub trait SpiHost: SpiBus<u8> + DelayNs + ChipSelect {}

impl<T: SpiBus<u8> + DelayNs + ChipSelect> SpiHost for T {}

/// Builds a [`SpiHost`] out of separate bus, chip-select and delay drivers
pub struct SpiParts<S, CS, D> {
    /// Shift register
    pub bus: S,
    /// Chip-select lines
    pub cs: CS,
    /// Slow-mode pacing source
    pub delay: D,
}

impl<S, CS, D> SpiParts<S, CS, D> {
    pub fn new(bus: S, cs: CS, delay: D) -> Self {
        Self { bus, cs, delay }
    }
}

impl<S: ErrorType, CS, D> ErrorType for SpiParts<S, CS, D> {
    type Error = S::Error;
}

impl<S: SpiBus<u8>, CS, D> SpiBus<u8> for SpiParts<S, CS, D> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.bus.transfer(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.transfer_in_place(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.bus.flush()
    }
}

impl<S, CS, D: DelayNs> DelayNs for SpiParts<S, CS, D> {
    fn delay_ns(&mut self, ns: u32) {
        self.delay.delay_ns(ns);
    }

    fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }
}

impl<S, CS: ChipSelect, D> ChipSelect for SpiParts<S, CS, D> {
    fn set_active(&mut self, mask: u8) {
        self.cs.set_active(mask);
    }
}

/// One active-low GPIO per chip-select line
pub struct ChipSelectPins<P1, P2> {
    /// Drives [`SPI_CHANNEL_1`]
    pub cs1: P1,
    /// Drives [`SPI_CHANNEL_2`]
    pub cs2: P2,
}

impl<P1: OutputPin, P2: OutputPin> ChipSelect for ChipSelectPins<P1, P2> {
    fn set_active(&mut self, mask: u8) {
        drive_active_low(&mut self.cs1, mask & SPI_CHANNEL_1 != 0);
        drive_active_low(&mut self.cs2, mask & SPI_CHANNEL_2 != 0);
    }
}

fn drive_active_low<P: OutputPin>(pin: &mut P, active: bool) {
    let result = if active { pin.set_low() } else { pin.set_high() };
    if let Err(e) = result {
        log::warn!("SPI: chip-select pin error: {:?}", e.kind());
    }
}

/// The shared-bus resource
///
/// One instance exists per physical controller. Every channel on that
/// controller borrows it.
pub struct BusArbiter {
    /// Held by the channel that currently owns the bus
    token: Mutex<()>,
    /// Chip-select lines bound to a live channel
    attached: Mutex<Vec<ChannelId, MAX_ATTACHED_CHANNELS>>,
}

impl BusArbiter {
    pub const fn new() -> Self {
        Self {
            token: Mutex::new(()),
            attached: Mutex::new(Vec::new()),
        }
    }

    fn attach(&self, channel: ChannelId) -> Result<(), SpiError> {
        let mut attached = self.attached.lock();
        if attached.contains(&channel) {
            return Err(SpiError::ChannelInUse(channel.mask()));
        }
        attached
            .push(channel)
            .map_err(|_| SpiError::RegistryFull)
    }

    fn detach(&self, channel: ChannelId) {
        self.attached.lock().retain(|c| *c != channel);
    }

    /// Whether some channel currently owns the bus
    pub fn is_held(&self) -> bool {
        self.token.is_locked()
    }

    /// Number of channels currently attached
    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }
}

impl Default for BusArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical device on the shared SPI bus
pub struct SpiChannel<'a, H: SpiHost> {
    /// Controller this channel talks through
    host: H,
    /// Arbiter shared with the other channels on the controller
    bus: &'a BusArbiter,
    /// Bound chip-select line; `None` until `initialize` succeeds
    channel: Option<ChannelId>,
    /// Clock setting for the next transfer
    speed: Speed,
    /// Bus token, `Some` exactly while this channel owns the bus
    token: Option<MutexGuard<'a, ()>>,
}

impl<'a, H: SpiHost> SpiChannel<'a, H> {
    /// Create an unbound channel. Call [`initialize`](Self::initialize)
    /// before using it.
    pub fn new(host: H, bus: &'a BusArbiter) -> Self {
        Self {
            host,
            bus,
            channel: None,
            speed: Speed::Slow,
            token: None,
        }
    }

    /// Bind to chip-select `channel`, reset to slow speed and drop any bus
    /// ownership
    pub fn initialize(&mut self, channel: u8) -> Result<(), SpiError> {
        let id = ChannelId::new(channel)?;

        self.shutdown();

        if self.channel != Some(id) {
            if let Some(old) = self.channel.take() {
                self.bus.detach(old);
            }
            self.bus.attach(id)?;
            self.channel = Some(id);
        }

        self.speed = Speed::Slow;
        log::debug!("SPI: channel {:#04x} initialized", id.mask());
        Ok(())
    }

    /// Obtain the shared bus. No-op if this channel already holds it.
    pub fn obtain(&mut self) {
        if self.token.is_none() {
            let bus = self.bus;
            self.token = Some(bus.token.lock());
        }
    }

    /// Release the shared bus. No-op if this channel does not hold it.
    pub fn release(&mut self) {
        self.token = None;
    }

    /// Assert this channel's chip-select
    pub fn select(&mut self) {
        debug_assert!(self.owns_bus(), "chip-select toggled without the bus");
        let mask = self.channel.map_or(0, ChannelId::mask);
        self.host.set_active(mask);
    }

    /// De-assert chip-select and clock one dummy byte
    pub fn deselect(&mut self) {
        debug_assert!(self.owns_bus(), "chip-select toggled without the bus");
        if let Err(e) = self.host.flush() {
            log::warn!("SPI: flush failed: {:?}", e.kind());
        }
        self.host.set_active(0);
        self.write(&[IDLE_BYTE]);
    }

    pub fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Read exactly `buf.len()` bytes
    pub fn read(&mut self, buf: &mut [u8]) {
        match self.speed {
            Speed::Fast => self.shift_in(buf),
            Speed::Slow => {
                for byte in buf.chunks_mut(1) {
                    self.shift_in(byte);
                    self.host.delay_us(SLOW_BYTE_DELAY_US);
                }
            }
        }
    }

    /// Read a single byte
    pub fn read_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.read(&mut byte);
        byte[0]
    }

    /// Write all of `bytes`
    pub fn write(&mut self, bytes: &[u8]) {
        match self.speed {
            Speed::Fast => self.shift_out(bytes),
            Speed::Slow => {
                for byte in bytes.chunks(1) {
                    self.shift_out(byte);
                    self.host.delay_us(SLOW_BYTE_DELAY_US);
                }
            }
        }
    }

    // Cards expect MOSI high while they talk. A failed transfer reads as an
    // idle line so the protocol layer times out on it.
    fn shift_in(&mut self, buf: &mut [u8]) {
        buf.fill(IDLE_BYTE);
        if let Err(e) = self.host.transfer_in_place(buf) {
            log::warn!("SPI: read failed: {:?}", e.kind());
            buf.fill(IDLE_BYTE);
        }
    }

    fn shift_out(&mut self, bytes: &[u8]) {
        if let Err(e) = self.host.write(bytes) {
            log::warn!("SPI: write failed: {:?}", e.kind());
        }
    }

    /// Leave the bus clean: deselect (if we hold the bus) and release
    pub fn shutdown(&mut self) {
        if self.owns_bus() {
            self.deselect();
        }
        self.release();
    }

    /// Bound chip-select line, if any
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn owns_bus(&self) -> bool {
        self.token.is_some()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

impl<H: SpiHost> Drop for SpiChannel<'_, H> {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(id) = self.channel.take() {
            self.bus.detach(id);
        }
    }
}
