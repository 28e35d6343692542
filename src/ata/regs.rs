//! ATA IDENTIFY DEVICE layout and host I/O codes

use bitflags::bitflags;

// ============================================================================
// IDENTIFY DEVICE Words
// ============================================================================

/// Size of the IDENTIFY buffer in 16-bit words
pub const IDENTIFY_WORDS: usize = 256;

/// General configuration
pub const IDENTIFY_GENERAL_CONFIG: usize = 0;

/// Default number of logical cylinders
pub const IDENTIFY_CYLINDERS: usize = 1;

/// Default number of logical heads
pub const IDENTIFY_HEADS: usize = 3;

/// Default number of logical sectors per track
pub const IDENTIFY_SECTORS_PER_TRACK: usize = 6;

/// Serial number, 20 ASCII characters
pub const IDENTIFY_SERIAL: usize = 10;
pub const IDENTIFY_SERIAL_LEN: usize = 20;

/// Firmware revision, 8 ASCII characters
pub const IDENTIFY_FW_REV: usize = 23;
pub const IDENTIFY_FW_REV_LEN: usize = 8;

/// Model number, 40 ASCII characters
pub const IDENTIFY_MODEL: usize = 27;
pub const IDENTIFY_MODEL_LEN: usize = 40;

/// Capabilities
pub const IDENTIFY_CAPABILITIES: usize = 49;

/// Total user addressable sectors for 28-bit commands (two words, low first)
pub const IDENTIFY_LBA_SECTORS: usize = 60;

/// Largest sector count a 28-bit LBA can express
pub const LBA28_MAX_SECTORS: u32 = 0x0FFF_FFFF;

/// General configuration: fixed (non-removable) device
pub const GENERAL_CONFIG_FIXED: u16 = 0x0040;

bitflags! {
    /// IDENTIFY word 49
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u16 {
        const DMA = 1 << 8;
        const LBA = 1 << 9;
        const IORDY_DISABLE = 1 << 10;
        const IORDY = 1 << 11;
    }
}

// ============================================================================
// Host I/O Error Codes
// ============================================================================

/// Error codes reported back to the disk subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum IoError {
    /// No usable card behind the unit
    OpenFail = -1,
    /// Transfer failed partway
    Aborted = -2,
    /// Operation not implemented for this device
    NoCmd = -3,
    /// Buffer too small for the requested transfer
    BadLength = -4,
}

impl IoError {
    /// Numeric code as the host expects it
    pub fn code(self) -> i8 {
        self as i8
    }
}

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            IoError::OpenFail => "open failed",
            IoError::Aborted => "I/O aborted",
            IoError::NoCmd => "command not supported",
            IoError::BadLength => "bad length",
        };
        write!(f, "{} ({})", text, self.code())
    }
}
