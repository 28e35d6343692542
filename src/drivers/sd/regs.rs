//! SD/MMC SPI-mode Protocol Definitions
//!
//! Command indices, data tokens and the bit layouts of the card registers
//! (OCR, CID, CSD) as defined by the SD Physical Layer Simplified
//! Specification, SPI mode chapter.

use bitflags::bitflags;
use tock_registers::register_bitfields;

// ============================================================================
// Commands
// ============================================================================

/// Set on a command index to mark it as an application command. The engine
/// sends APP_CMD first and strips the flag before transmission.
pub const ACMD_FLAG: u8 = 0x80;

/// GO_IDLE_STATE - software reset, enters SPI mode with CS asserted
pub const MMC_CMD_GO_IDLE_STATE: u8 = 0;

/// SEND_OP_COND - MMC initialization
pub const MMC_CMD_SEND_OP_COND: u8 = 1;

/// SEND_IF_COND - interface condition (SD v2.0+)
pub const SD_CMD_SEND_IF_COND: u8 = 8;

/// SEND_CSD - card specific data
pub const MMC_CMD_SEND_CSD: u8 = 9;

/// SEND_CID - card identification
pub const MMC_CMD_SEND_CID: u8 = 10;

/// STOP_TRANSMISSION - end a multiple block read
pub const MMC_CMD_STOP_TRANSMISSION: u8 = 12;

/// SET_BLOCKLEN
pub const MMC_CMD_SET_BLOCKLEN: u8 = 16;

/// READ_SINGLE_BLOCK
pub const MMC_CMD_READ_SINGLE_BLOCK: u8 = 17;

/// READ_MULTIPLE_BLOCK
pub const MMC_CMD_READ_MULTIPLE_BLOCK: u8 = 18;

/// WRITE_BLOCK
pub const MMC_CMD_WRITE_SINGLE_BLOCK: u8 = 24;

/// WRITE_MULTIPLE_BLOCK
pub const MMC_CMD_WRITE_MULTIPLE_BLOCK: u8 = 25;

/// APP_CMD - next command is application specific
pub const MMC_CMD_APP_CMD: u8 = 55;

/// READ_OCR
pub const SD_CMD_READ_OCR: u8 = 58;

/// SET_WR_BLK_ERASE_COUNT (ACMD23) - pre-erase hint for multi-block writes
pub const SD_CMD_APP_SET_WR_BLK_ERASE_COUNT: u8 = 23 | ACMD_FLAG;

/// SD_SEND_OP_COND (ACMD41)
pub const SD_CMD_APP_SEND_OP_COND: u8 = 41 | ACMD_FLAG;

/// Start bit + transmission bit of every command frame
pub const CMD_FRAME_START: u8 = 0x40;

/// Precomputed CRC7 (with end bit) for CMD0 with argument 0
pub const CRC_GO_IDLE_STATE: u8 = 0x95;

/// Precomputed CRC7 (with end bit) for CMD8 with argument 0x1AA
pub const CRC_SEND_IF_COND: u8 = 0x87;

/// CRC byte for everything else; the card ignores it in SPI mode
pub const CRC_DUMMY: u8 = 0x01;

/// CMD8 argument: 2.7-3.6 V and check pattern 0xAA
pub const IF_COND_ARG: u32 = 0x1AA;

/// R7 a v2 card returns for [`IF_COND_ARG`]
pub const IF_COND_ECHO: u32 = 0x0000_01AA;

// ============================================================================
// Tokens
// ============================================================================

/// Idle bus / card ready
pub const BUS_IDLE: u8 = 0xFF;

/// Start of a data block (single/multi read, single write)
pub const TOKEN_START_BLOCK: u8 = 0xFE;

/// Start of a data block in a multiple block write
pub const TOKEN_START_MULTI_WRITE: u8 = 0xFC;

/// Stop transmission token for a multiple block write
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

/// Mask for the data response token that follows a written block
pub const DATA_RESPONSE_MASK: u8 = 0x1F;

/// Data response: data accepted
pub const DATA_RESPONSE_ACCEPTED: u8 = 0x05;

// ============================================================================
// R1 Response
// ============================================================================

bitflags! {
    /// R1 status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1: u8 {
        /// Card is in idle state, running its initialization
        const IN_IDLE_STATE = 1 << 0;
        const ERASE_RESET = 1 << 1;
        const ILLEGAL_COMMAND = 1 << 2;
        const COM_CRC_ERROR = 1 << 3;
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        const ADDRESS_ERROR = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;
        /// Always 0 in a valid response; set means nothing was received
        const NO_RESPONSE = 1 << 7;
    }
}

/// R1 of a card that has finished initialization
pub const R1_READY: u8 = 0x00;

/// R1 of a card in idle state
pub const R1_IDLE: u8 = 0x01;

// ============================================================================
// Card Registers
// ============================================================================

register_bitfields! [
    u32,
    /// Operation Conditions Register (R3 payload of CMD58)
    pub OCR [
        /// 2.7-3.6 V window
        VDD_WINDOW OFFSET(15) NUMBITS(9) [],
        /// Card Capacity Status: set for block-addressed (SDHC/SDXC) cards
        CCS OFFSET(30) NUMBITS(1) [],
        /// Power-up finished
        BUSY OFFSET(31) NUMBITS(1) []
    ]
];

/// ACMD41 argument: Host Capacity Support
pub const OCR_HCS: u32 = 1 << 30;

register_bitfields! [
    u128,
    /// Card Identification register
    pub CID [
        /// Manufacturer ID
        MID OFFSET(120) NUMBITS(8) [],
        /// OEM/Application ID
        OID OFFSET(104) NUMBITS(16) [],
        /// Product name, 5 ASCII characters
        PNM OFFSET(64) NUMBITS(40) [],
        /// Product revision, BCD major.minor
        PRV OFFSET(56) NUMBITS(8) [],
        /// Product serial number
        PSN OFFSET(24) NUMBITS(32) [],
        /// Manufacturing year, offset from 2000
        MDT_YEAR OFFSET(12) NUMBITS(8) [],
        /// Manufacturing month
        MDT_MONTH OFFSET(8) NUMBITS(4) [],
        CRC OFFSET(1) NUMBITS(7) []
    ],

    /// CSD fields common to both layouts
    pub CSD [
        CSD_STRUCTURE OFFSET(126) NUMBITS(2) [],
        TAAC OFFSET(112) NUMBITS(8) [],
        NSAC OFFSET(104) NUMBITS(8) [],
        TRAN_SPEED OFFSET(96) NUMBITS(8) [],
        /// Card command classes
        CCC OFFSET(84) NUMBITS(12) [],
        READ_BL_LEN OFFSET(80) NUMBITS(4) [],
        READ_BL_PARTIAL OFFSET(79) NUMBITS(1) [],
        WRITE_BLK_MISALIGN OFFSET(78) NUMBITS(1) [],
        READ_BLK_MISALIGN OFFSET(77) NUMBITS(1) [],
        DSR_IMP OFFSET(76) NUMBITS(1) [],
        ERASE_BLK_EN OFFSET(46) NUMBITS(1) [],
        SECTOR_SIZE OFFSET(39) NUMBITS(7) [],
        WP_GRP_SIZE OFFSET(32) NUMBITS(7) [],
        WP_GRP_ENABLE OFFSET(31) NUMBITS(1) [],
        R2W_FACTOR OFFSET(26) NUMBITS(3) [],
        WRITE_BL_LEN OFFSET(22) NUMBITS(4) [],
        WRITE_BL_PARTIAL OFFSET(21) NUMBITS(1) [],
        FILE_FORMAT_GRP OFFSET(15) NUMBITS(1) [],
        COPY OFFSET(14) NUMBITS(1) [],
        PERM_WRITE_PROTECT OFFSET(13) NUMBITS(1) [],
        TMP_WRITE_PROTECT OFFSET(12) NUMBITS(1) [],
        FILE_FORMAT OFFSET(10) NUMBITS(2) [],
        CRC OFFSET(1) NUMBITS(7) []
    ],

    /// CSD version 1.0 (standard capacity SD, MMC) capacity fields
    pub CSD_V1 [
        C_SIZE OFFSET(62) NUMBITS(12) [],
        VDD_R_CURR_MIN OFFSET(59) NUMBITS(3) [],
        VDD_R_CURR_MAX OFFSET(56) NUMBITS(3) [],
        VDD_W_CURR_MIN OFFSET(53) NUMBITS(3) [],
        VDD_W_CURR_MAX OFFSET(50) NUMBITS(3) [],
        C_SIZE_MULT OFFSET(47) NUMBITS(3) []
    ],

    /// CSD version 2.0 (SDHC) capacity field
    pub CSD_V2 [
        C_SIZE OFFSET(48) NUMBITS(22) []
    ]
];
