//! Test doubles: a steppable tick counter and a simulated card behind an
//! SPI controller.

use crate::drivers::sd::{Cid, Csd, CsdLayout, SECTOR_SIZE};
use crate::drivers::spi::ChipSelect;
use core::convert::Infallible;
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{ErrorType, SpiBus};
use crate::time::TickSource;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::vec::Vec;

/// Tick counter that advances by a fixed step on every read
pub struct FakeClock {
    value: Cell<u8>,
    step: u8,
}

impl FakeClock {
    /// Counter that advances by one on every `now()`
    pub fn new(start: u8) -> Self {
        Self {
            value: Cell::new(start),
            step: 1,
        }
    }

    /// Counter that only moves through [`set`](Self::set)
    pub fn frozen(start: u8) -> Self {
        Self {
            value: Cell::new(start),
            step: 0,
        }
    }

    pub fn set(&self, value: u8) {
        self.value.set(value);
    }

    /// Current value without advancing
    pub fn peek(&self) -> u8 {
        self.value.get()
    }
}

impl TickSource for FakeClock {
    fn now(&self) -> u8 {
        let v = self.value.get();
        self.value.set(v.wrapping_add(self.step));
        v
    }
}

/// Contents of a sector nobody has written
pub fn pattern_byte(lba: u32, offset: usize) -> u8 {
    (lba as usize).wrapping_mul(7).wrapping_add(offset) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    Sdhc,
    Sd2,
    Sd1,
    Mmc,
}

enum RxState {
    Command,
    WriteToken { lba: u32, multi: bool },
    WriteData { lba: u32, multi: bool },
}

/// Card in SPI mode, simulated at byte level
pub struct SimCard {
    kind: SimKind,
    cid: Cid,
    csd: Csd,

    // Knobs
    pub present: bool,
    pub if_cond_echo: u32,
    /// ACMD41/CMD1 attempts answered "idle" before the card is ready
    pub init_polls: u32,
    /// 1-based data block (counting every block sent) to reject
    pub fail_write_block: Option<usize>,
    /// Sector answered with an error token instead of data
    pub fail_read_lba: Option<u32>,
    /// Busy bytes the card drives after each accepted block
    pub busy_bytes: usize,
    /// Idle bytes before every response (NCR)
    pub ncr_bytes: usize,
    /// Read commands are acknowledged but no data token ever follows
    pub tokenless_read: bool,
    /// CMD58 answers with an illegal-command R1
    pub fail_read_ocr: bool,

    // Observations
    pub frames: Vec<[u8; 6]>,
    pub cs: Vec<u8>,
    pub selects: usize,
    pub delays: usize,
    pub write_attempts: usize,
    pub stop_tokens: usize,
    pub crc_errors: usize,
    commands: Vec<(u8, u32)>,

    // Card state
    selected: bool,
    idle: bool,
    polls_left: u32,
    app_pending: bool,
    busy: usize,
    frame: Vec<u8>,
    rx: RxState,
    data: Vec<u8>,
    read_stream: Option<u32>,
    out: VecDeque<u8>,
    storage: HashMap<u32, Vec<u8>>,
}

impl SimCard {
    pub fn new(kind: SimKind) -> Self {
        let csd = match kind {
            SimKind::Sdhc => Csd {
                layout: CsdLayout::V2,
                structure: 1,
                taac: 0x0E,
                tran_speed: 0x32,
                command_classes: 0x5B5,
                read_bl_len: 9,
                device_size: 30_386,
                erase_blk_en: true,
                sector_size: 0x7F,
                r2w_factor: 2,
                write_bl_len: 9,
                ..Csd::default()
            },
            _ => Csd {
                layout: CsdLayout::V1,
                taac: 0x26,
                tran_speed: 0x32,
                command_classes: 0x5F5,
                read_bl_len: 9,
                read_bl_partial: true,
                device_size: 3839,
                device_size_mult: 7,
                erase_blk_en: true,
                sector_size: 0x7F,
                r2w_factor: 2,
                write_bl_len: 9,
                ..Csd::default()
            },
        };

        Self {
            kind,
            cid: Cid {
                manufacturer_id: 0x27,
                oem_id: *b"PH",
                product_name: *b"SD16G",
                product_revision: 0x30,
                serial_number: 0x1234_5678,
                manufacture_year: 2019,
                manufacture_month: 7,
                crc: 0x2B,
            },
            csd,
            present: true,
            if_cond_echo: 0x1AA,
            init_polls: 3,
            fail_write_block: None,
            fail_read_lba: None,
            busy_bytes: 0,
            ncr_bytes: 1,
            tokenless_read: false,
            fail_read_ocr: false,
            frames: Vec::new(),
            cs: Vec::new(),
            selects: 0,
            delays: 0,
            write_attempts: 0,
            stop_tokens: 0,
            crc_errors: 0,
            commands: Vec::new(),
            selected: false,
            idle: true,
            polls_left: 0,
            app_pending: false,
            busy: 0,
            frame: Vec::new(),
            rx: RxState::Command,
            data: Vec::new(),
            read_stream: None,
            out: VecDeque::new(),
            storage: HashMap::new(),
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn csd(&self) -> Csd {
        self.csd
    }

    pub fn set_csd(&mut self, csd: Csd) {
        self.csd = csd;
    }

    /// Commands seen, as (index, argument); application commands carry
    /// bit 7 in the index
    pub fn commands(&self) -> &[(u8, u32)] {
        &self.commands
    }

    /// Data stored for `lba`, if it was ever written
    pub fn sector(&self, lba: u32) -> Option<Vec<u8>> {
        self.storage.get(&lba).cloned()
    }

    fn lba_of(&self, arg: u32) -> u32 {
        match self.kind {
            SimKind::Sdhc => arg,
            _ => arg >> 9,
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.out.extend(core::iter::repeat_n(0xFF, self.ncr_bytes));
        self.out.extend(bytes.iter().copied());
    }

    fn push_block(&mut self, lba: u32) {
        if self.tokenless_read {
            return;
        }
        if self.fail_read_lba == Some(lba) {
            self.out.push_back(0x08);
            return;
        }
        self.out.push_back(0xFE);
        match self.storage.get(&lba) {
            Some(data) => self.out.extend(data.iter().copied()),
            None => self.out.extend((0..SECTOR_SIZE).map(|i| pattern_byte(lba, i))),
        }
        self.out.extend([0x12, 0x34]);
    }

    fn push_register(&mut self, raw: [u8; 16]) {
        self.respond(&[0x00]);
        self.out.push_back(0xFF);
        self.out.push_back(0xFE);
        self.out.extend(raw);
        self.out.extend([0x00, 0x00]);
    }

    fn r1(&self) -> u8 {
        if self.idle { 0x01 } else { 0x00 }
    }

    fn poll_init(&mut self) -> u8 {
        if self.polls_left == 0 {
            self.idle = false;
            0x00
        } else {
            self.polls_left -= 1;
            0x01
        }
    }

    fn process_command(&mut self) {
        let frame: [u8; 6] = [
            self.frame[0],
            self.frame[1],
            self.frame[2],
            self.frame[3],
            self.frame[4],
            self.frame[5],
        ];
        self.frame.clear();
        self.frames.push(frame);

        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = core::mem::take(&mut self.app_pending);
        self.commands.push((if app { cmd | 0x80 } else { cmd }, arg));

        if !self.present {
            return;
        }

        let crc_ok = match cmd {
            0 => frame[5] == 0x95,
            8 => frame[5] == 0x87,
            _ => true,
        };
        if !crc_ok {
            self.crc_errors += 1;
            let r1 = self.r1() | 0x08;
            self.respond(&[r1]);
            return;
        }

        let sd_v2 = matches!(self.kind, SimKind::Sdhc | SimKind::Sd2);
        match (cmd, app) {
            (0, _) => {
                self.idle = true;
                self.polls_left = self.init_polls;
                self.read_stream = None;
                self.respond(&[0x01]);
            }
            (8, _) if sd_v2 => {
                let mut r7 = [self.r1(), 0, 0, 0, 0];
                r7[1..].copy_from_slice(&self.if_cond_echo.to_be_bytes());
                self.respond(&r7);
            }
            (55, _) => {
                if self.kind == SimKind::Mmc {
                    let r1 = self.r1() | 0x04;
                    self.respond(&[r1]);
                } else {
                    self.app_pending = true;
                    let r1 = self.r1();
                    self.respond(&[r1]);
                }
            }
            (41, true) => {
                let r1 = self.poll_init();
                self.respond(&[r1]);
            }
            (1, false) if self.kind == SimKind::Mmc => {
                let r1 = self.poll_init();
                self.respond(&[r1]);
            }
            (58, _) if self.fail_read_ocr => {
                let r1 = self.r1() | 0x04;
                self.respond(&[r1]);
            }
            (58, _) => {
                let mut ocr: u32 = 0x00FF_8000;
                if !self.idle {
                    ocr |= 1 << 31;
                }
                if self.kind == SimKind::Sdhc {
                    ocr |= 1 << 30;
                }
                let mut r3 = [self.r1(), 0, 0, 0, 0];
                r3[1..].copy_from_slice(&ocr.to_be_bytes());
                self.respond(&r3);
            }
            (16, _) => {
                let r1 = if arg == SECTOR_SIZE as u32 { 0x00 } else { 0x40 };
                self.respond(&[r1]);
            }
            (9, _) => {
                let raw = self.csd.encode();
                self.push_register(raw);
            }
            (10, _) => {
                let raw = self.cid.encode();
                self.push_register(raw);
            }
            (12, _) => {
                self.read_stream = None;
                self.out.clear();
                self.out.extend([0x5A, 0xFF, 0x00]);
            }
            (17, _) => {
                self.respond(&[0x00]);
                self.out.push_back(0xFF);
                let lba = self.lba_of(arg);
                self.push_block(lba);
            }
            (18, _) => {
                self.respond(&[0x00]);
                self.read_stream = Some(self.lba_of(arg));
            }
            (23, true) => self.respond(&[0x00]),
            (24, _) | (25, _) => {
                self.respond(&[0x00]);
                self.rx = RxState::WriteToken {
                    lba: self.lba_of(arg),
                    multi: cmd == 25,
                };
            }
            _ => {
                let r1 = self.r1() | 0x04;
                self.respond(&[r1]);
            }
        }
    }

    fn receive(&mut self, byte: u8) {
        match self.rx {
            RxState::Command => {
                if self.frame.is_empty() && byte & 0xC0 != 0x40 {
                    return;
                }
                self.frame.push(byte);
                if self.frame.len() == 6 {
                    self.process_command();
                }
            }
            RxState::WriteToken { lba, multi } => match (byte, multi) {
                (0xFE, false) | (0xFC, true) => {
                    self.write_attempts += 1;
                    self.data.clear();
                    self.rx = RxState::WriteData { lba, multi };
                }
                (0xFD, true) => {
                    self.stop_tokens += 1;
                    self.busy = self.busy_bytes;
                    self.rx = RxState::Command;
                }
                _ => {}
            },
            RxState::WriteData { lba, multi } => {
                self.data.push(byte);
                if self.data.len() < SECTOR_SIZE + 2 {
                    return;
                }

                if self.fail_write_block == Some(self.write_attempts) {
                    self.out.push_back(0x0D);
                } else {
                    self.data.truncate(SECTOR_SIZE);
                    self.storage.insert(lba, core::mem::take(&mut self.data));
                    self.out.push_back(0x05);
                    self.busy = self.busy_bytes;
                }

                self.rx = if multi {
                    RxState::WriteToken { lba: lba + 1, multi }
                } else {
                    RxState::Command
                };
            }
        }
    }

    fn transmit(&mut self) -> u8 {
        if let Some(b) = self.out.pop_front() {
            return b;
        }
        if self.busy > 0 {
            if self.busy != usize::MAX {
                self.busy -= 1;
            }
            return 0x00;
        }
        if let Some(lba) = self.read_stream {
            self.read_stream = Some(lba + 1);
            self.out.push_back(0xFF);
            self.push_block(lba);
            return self.transmit();
        }
        0xFF
    }
}

impl ChipSelect for SimCard {
    fn set_active(&mut self, mask: u8) {
        self.cs.push(mask);
        self.selected = mask != 0;
        if self.selected {
            self.selects += 1;
        } else {
            self.out.clear();
            self.frame.clear();
            self.rx = RxState::Command;
            self.read_stream = None;
        }
    }
}

impl ErrorType for SimCard {
    type Error = Infallible;
}

impl SpiBus<u8> for SimCard {
    /// MOSI is held high while reading, which the card ignores
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        for b in words.iter_mut() {
            *b = if self.selected { self.transmit() } else { 0xFF };
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        if self.selected {
            for &b in words {
                self.receive(b);
            }
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        self.write(write)?;
        self.read(read)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.read(words)
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl DelayNs for SimCard {
    fn delay_ns(&mut self, _ns: u32) {
        self.delays += 1;
    }

    fn delay_us(&mut self, _us: u32) {
        self.delays += 1;
    }
}
