//! Card metadata: type, CID and CSD
//!
//! Both registers arrive as 16-byte big-endian blobs. They are decoded field
//! by field through the bit layouts in [`super::regs`], never by overlaying
//! a struct on the buffer. Encoding is provided as well so callers (and
//! tests) can build register images from field values.

use super::SdError;
use super::regs::{CID, CSD, CSD_V1, CSD_V2};
use core::fmt;
use tock_registers::LocalRegisterCopy;

/// Sector size the driver exposes (bytes)
pub const SECTOR_SIZE: usize = 512;

/// log2 of [`SECTOR_SIZE`]
pub const SECTOR_SHIFT: u32 = 9;

/// Card family, as discovered during initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardType {
    /// Nothing classified (never initialized, or initialization failed)
    #[default]
    None,
    /// MultiMediaCard
    Mmc,
    /// SD version 1.x, standard capacity
    Sd1,
    /// SD version 2.0+, standard capacity
    Sd2,
    /// SD version 2.0+, high capacity (block addressed)
    Sdhc,
}

impl CardType {
    /// Block-addressed cards take an LBA as command argument; all others
    /// take a byte offset.
    pub fn is_block_addressed(self) -> bool {
        self == CardType::Sdhc
    }

    /// SD family cards understand application commands
    pub fn is_sd(self) -> bool {
        matches!(self, CardType::Sd1 | CardType::Sd2 | CardType::Sdhc)
    }

    /// CSD layout this card type uses
    pub fn csd_layout(self) -> CsdLayout {
        match self {
            CardType::Sdhc => CsdLayout::V2,
            _ => CsdLayout::V1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CardType::None => "none",
            CardType::Mmc => "MMC",
            CardType::Sd1 => "SD v1.x",
            CardType::Sd2 => "SD v2.0",
            CardType::Sdhc => "SDHC",
        }
    }
}

/// Card Identification register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cid {
    /// MID, assigned by the SD association
    pub manufacturer_id: u8,
    /// OID, two ASCII characters
    pub oem_id: [u8; 2],
    /// PNM, five ASCII characters
    pub product_name: [u8; 5],
    /// BCD, major in the high nibble
    pub product_revision: u8,
    /// PSN
    pub serial_number: u32,
    /// Full year (2000 + register value)
    pub manufacture_year: u16,
    /// 1 to 12
    pub manufacture_month: u8,
    /// Carried but not verified
    pub crc: u8,
}

impl Cid {
    pub fn decode(raw: &[u8; 16]) -> Self {
        let reg = LocalRegisterCopy::<u128, CID::Register>::new(u128::from_be_bytes(*raw));

        let oid = reg.read(CID::OID) as u16;
        let pnm = reg.read(CID::PNM) as u64;
        let mut product_name = [0u8; 5];
        product_name.copy_from_slice(&pnm.to_be_bytes()[3..]);

        Self {
            manufacturer_id: reg.read(CID::MID) as u8,
            oem_id: oid.to_be_bytes(),
            product_name,
            product_revision: reg.read(CID::PRV) as u8,
            serial_number: reg.read(CID::PSN) as u32,
            manufacture_year: 2000 + reg.read(CID::MDT_YEAR) as u16,
            manufacture_month: reg.read(CID::MDT_MONTH) as u8,
            crc: reg.read(CID::CRC) as u8,
        }
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut pnm = [0u8; 8];
        pnm[3..].copy_from_slice(&self.product_name);

        let mut reg = LocalRegisterCopy::<u128, CID::Register>::new(1);
        reg.modify(
            CID::MID.val(self.manufacturer_id as u128)
                + CID::OID.val(u16::from_be_bytes(self.oem_id) as u128)
                + CID::PNM.val(u64::from_be_bytes(pnm) as u128)
                + CID::PRV.val(self.product_revision as u128)
                + CID::PSN.val(self.serial_number as u128)
                + CID::MDT_YEAR.val(self.manufacture_year.saturating_sub(2000) as u128)
                + CID::MDT_MONTH.val(self.manufacture_month as u128)
                + CID::CRC.val(self.crc as u128),
        );
        reg.get().to_be_bytes()
    }

    /// Product name as text, non-printable bytes replaced by '?'
    pub fn product_name_str(&self) -> heapless::String<5> {
        self.product_name
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
            .collect()
    }

    /// (major, minor) revision nibbles
    pub fn revision(&self) -> (u8, u8) {
        (self.product_revision >> 4, self.product_revision & 0x0F)
    }
}

/// Which CSD capacity layout a register uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsdLayout {
    /// Standard capacity: C_SIZE (12 bit) with C_SIZE_MULT
    #[default]
    V1,
    /// High capacity: C_SIZE (22 bit), block length folded into the size
    V2,
}

/// Card Specific Data register
///
/// Fields that only exist in the version 1 layout are zero for version 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Csd {
    /// Which field layout the raw register was decoded with
    pub layout: CsdLayout,
    /// CSD_STRUCTURE as read from the register
    pub structure: u8,
    /// Data read access time 1
    pub taac: u8,
    /// Data read access time 2, in 100 clock cycles
    pub nsac: u8,
    /// Maximum transfer rate
    pub tran_speed: u8,
    /// CCC, one bit per supported command class
    pub command_classes: u16,
    /// log2 of the maximum read block length
    pub read_bl_len: u8,
    pub read_bl_partial: bool,
    pub write_blk_misalign: bool,
    pub read_blk_misalign: bool,
    /// Driver stage register implemented
    pub dsr_imp: bool,
    /// C_SIZE; 12 bits in the v1 layout, 22 bits in v2
    pub device_size: u32,
    /// v1 only; zero in v2
    pub vdd_r_curr_min: u8,
    /// v1 only; zero in v2
    pub vdd_r_curr_max: u8,
    /// v1 only; zero in v2
    pub vdd_w_curr_min: u8,
    /// v1 only; zero in v2
    pub vdd_w_curr_max: u8,
    /// C_SIZE_MULT, v1 only
    pub device_size_mult: u8,
    pub erase_blk_en: bool,
    /// Erase sector size, in write blocks minus one
    pub sector_size: u8,
    /// Write protect group size, in erase sectors minus one
    pub wp_grp_size: u8,
    pub wp_grp_enable: bool,
    /// log2 of the write time relative to the read time
    pub r2w_factor: u8,
    /// log2 of the maximum write block length
    pub write_bl_len: u8,
    pub write_bl_partial: bool,
    pub file_format_grp: bool,
    pub copy: bool,
    pub perm_write_protect: bool,
    pub tmp_write_protect: bool,
    pub file_format: u8,
    /// Carried but not verified
    pub crc: u8,
}

impl Csd {
    pub fn decode(raw: &[u8; 16], layout: CsdLayout) -> Self {
        let value = u128::from_be_bytes(*raw);
        let reg = LocalRegisterCopy::<u128, CSD::Register>::new(value);

        let mut csd = Self {
            layout,
            structure: reg.read(CSD::CSD_STRUCTURE) as u8,
            taac: reg.read(CSD::TAAC) as u8,
            nsac: reg.read(CSD::NSAC) as u8,
            tran_speed: reg.read(CSD::TRAN_SPEED) as u8,
            command_classes: reg.read(CSD::CCC) as u16,
            read_bl_len: reg.read(CSD::READ_BL_LEN) as u8,
            read_bl_partial: reg.is_set(CSD::READ_BL_PARTIAL),
            write_blk_misalign: reg.is_set(CSD::WRITE_BLK_MISALIGN),
            read_blk_misalign: reg.is_set(CSD::READ_BLK_MISALIGN),
            dsr_imp: reg.is_set(CSD::DSR_IMP),
            erase_blk_en: reg.is_set(CSD::ERASE_BLK_EN),
            sector_size: reg.read(CSD::SECTOR_SIZE) as u8,
            wp_grp_size: reg.read(CSD::WP_GRP_SIZE) as u8,
            wp_grp_enable: reg.is_set(CSD::WP_GRP_ENABLE),
            r2w_factor: reg.read(CSD::R2W_FACTOR) as u8,
            write_bl_len: reg.read(CSD::WRITE_BL_LEN) as u8,
            write_bl_partial: reg.is_set(CSD::WRITE_BL_PARTIAL),
            file_format_grp: reg.is_set(CSD::FILE_FORMAT_GRP),
            copy: reg.is_set(CSD::COPY),
            perm_write_protect: reg.is_set(CSD::PERM_WRITE_PROTECT),
            tmp_write_protect: reg.is_set(CSD::TMP_WRITE_PROTECT),
            file_format: reg.read(CSD::FILE_FORMAT) as u8,
            crc: reg.read(CSD::CRC) as u8,
            ..Self::default()
        };

        match layout {
            CsdLayout::V1 => {
                let v1 = LocalRegisterCopy::<u128, CSD_V1::Register>::new(value);
                csd.device_size = v1.read(CSD_V1::C_SIZE) as u32;
                csd.device_size_mult = v1.read(CSD_V1::C_SIZE_MULT) as u8;
                csd.vdd_r_curr_min = v1.read(CSD_V1::VDD_R_CURR_MIN) as u8;
                csd.vdd_r_curr_max = v1.read(CSD_V1::VDD_R_CURR_MAX) as u8;
                csd.vdd_w_curr_min = v1.read(CSD_V1::VDD_W_CURR_MIN) as u8;
                csd.vdd_w_curr_max = v1.read(CSD_V1::VDD_W_CURR_MAX) as u8;
            }
            CsdLayout::V2 => {
                let v2 = LocalRegisterCopy::<u128, CSD_V2::Register>::new(value);
                csd.device_size = v2.read(CSD_V2::C_SIZE) as u32;
            }
        }

        csd
    }

    pub fn encode(&self) -> [u8; 16] {
        // Bit 0 is the fixed end bit
        let mut reg = LocalRegisterCopy::<u128, CSD::Register>::new(1);
        reg.modify(
            CSD::CSD_STRUCTURE.val(self.structure as u128)
                + CSD::TAAC.val(self.taac as u128)
                + CSD::NSAC.val(self.nsac as u128)
                + CSD::TRAN_SPEED.val(self.tran_speed as u128)
                + CSD::CCC.val(self.command_classes as u128)
                + CSD::READ_BL_LEN.val(self.read_bl_len as u128)
                + CSD::READ_BL_PARTIAL.val(self.read_bl_partial as u128)
                + CSD::WRITE_BLK_MISALIGN.val(self.write_blk_misalign as u128)
                + CSD::READ_BLK_MISALIGN.val(self.read_blk_misalign as u128)
                + CSD::DSR_IMP.val(self.dsr_imp as u128)
                + CSD::ERASE_BLK_EN.val(self.erase_blk_en as u128)
                + CSD::SECTOR_SIZE.val(self.sector_size as u128)
                + CSD::WP_GRP_SIZE.val(self.wp_grp_size as u128)
                + CSD::WP_GRP_ENABLE.val(self.wp_grp_enable as u128)
                + CSD::R2W_FACTOR.val(self.r2w_factor as u128)
                + CSD::WRITE_BL_LEN.val(self.write_bl_len as u128)
                + CSD::WRITE_BL_PARTIAL.val(self.write_bl_partial as u128)
                + CSD::FILE_FORMAT_GRP.val(self.file_format_grp as u128)
                + CSD::COPY.val(self.copy as u128)
                + CSD::PERM_WRITE_PROTECT.val(self.perm_write_protect as u128)
                + CSD::TMP_WRITE_PROTECT.val(self.tmp_write_protect as u128)
                + CSD::FILE_FORMAT.val(self.file_format as u128)
                + CSD::CRC.val(self.crc as u128),
        );
        let common = reg.get();

        let capacity = match self.layout {
            CsdLayout::V1 => {
                let mut v1 = LocalRegisterCopy::<u128, CSD_V1::Register>::new(0);
                v1.modify(
                    CSD_V1::C_SIZE.val(self.device_size as u128)
                        + CSD_V1::C_SIZE_MULT.val(self.device_size_mult as u128)
                        + CSD_V1::VDD_R_CURR_MIN.val(self.vdd_r_curr_min as u128)
                        + CSD_V1::VDD_R_CURR_MAX.val(self.vdd_r_curr_max as u128)
                        + CSD_V1::VDD_W_CURR_MIN.val(self.vdd_w_curr_min as u128)
                        + CSD_V1::VDD_W_CURR_MAX.val(self.vdd_w_curr_max as u128),
                );
                v1.get()
            }
            CsdLayout::V2 => {
                let mut v2 = LocalRegisterCopy::<u128, CSD_V2::Register>::new(0);
                v2.modify(CSD_V2::C_SIZE.val(self.device_size as u128));
                v2.get()
            }
        };

        (common | capacity).to_be_bytes()
    }

    /// log2 of the native block length
    ///
    /// Read and write block lengths must agree and lie in 512..=2048 bytes.
    pub fn block_len_log2(&self) -> Result<u8, SdError> {
        if self.read_bl_len != self.write_bl_len {
            log::warn!(
                "SD: CSD read/write block length mismatch ({} vs {})",
                self.read_bl_len,
                self.write_bl_len
            );
            return Err(SdError::Unsupported);
        }
        if !(9..=11).contains(&self.read_bl_len) {
            log::warn!("SD: CSD block length 2^{} not supported", self.read_bl_len);
            return Err(SdError::Unsupported);
        }
        Ok(self.read_bl_len)
    }

    /// Capacity in 512-byte sectors
    pub fn total_sectors(&self) -> Result<u32, SdError> {
        let bl_len = self.block_len_log2()? as u32;
        let blocks = self.device_size as u64 + 1;

        let sectors = match self.layout {
            CsdLayout::V1 => {
                blocks << (self.device_size_mult as u32 + 2 + bl_len - SECTOR_SHIFT)
            }
            CsdLayout::V2 => blocks << (19 - bl_len),
        };

        u32::try_from(sectors).map_err(|_| {
            log::warn!("SD: card too large for 32-bit sector numbers");
            SdError::Unsupported
        })
    }
}

/// Everything known about the card in the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardInfo {
    /// `CardType::None` until identification succeeds
    pub card_type: CardType,
    /// Capacity in 512-byte sectors
    pub total_sectors: u32,
    /// log2 of the native block length
    pub block_size: u8,
    /// Identification register as read at init
    pub cid: Cid,
    /// Specific data register as read at init
    pub csd: Csd,
}

impl CardInfo {
    pub fn is_present(&self) -> bool {
        self.card_type != CardType::None
    }

    pub fn is_block_addressed(&self) -> bool {
        self.card_type.is_block_addressed()
    }

    pub fn capacity_bytes(&self) -> u64 {
        (self.total_sectors as u64) << SECTOR_SHIFT
    }
}

impl fmt::Display for CardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = self.cid.revision();
        write!(
            f,
            "{} mfg {:#04x} '{}' rev {}.{} s/n {:08x} ({:04}-{:02}), {} sectors ({} MB)",
            self.card_type.name(),
            self.cid.manufacturer_id,
            self.cid.product_name_str(),
            major,
            minor,
            self.cid.serial_number,
            self.cid.manufacture_year,
            self.cid.manufacture_month,
            self.total_sectors,
            self.capacity_bytes() / (1024 * 1024)
        )
    }
}
