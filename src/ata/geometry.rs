//! CHS geometry for a disk known only by its sector count
//!
//! Picks cylinders/heads/sectors the same way WinUAE does for hardfiles, so
//! a card partitioned in the emulator sees the same geometry here.

use crate::drivers::sd::SECTOR_SIZE;

/// Sectors-per-track candidates, tried in order
const SPT_CANDIDATES: [u32; 3] = [63, 127, 255];

const MIN_HEADS: u32 = 4;
const MAX_HEADS: u32 = 16;

/// Disks up to this many sectors must stay within 1023 cylinders
const SMALL_DISK_SECTORS: u32 = 1024 * 1024;

/// Synthesized disk geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    /// cylinders * heads * sectors_per_track
    pub logical_sectors: u32,
    pub block_size: u32,
    pub block_shift: u8,
}

fn cylinders_fit(total: u32, cylinders: u32, heads: u32) -> bool {
    if total <= SMALL_DISK_SECTORS {
        cylinders <= 1023
    } else {
        cylinders < 16383 || (cylinders < 32767 && heads >= 5) || cylinders <= 65535
    }
}

fn choose_chs(total: u32) -> (u32, u32, u32) {
    for spt in SPT_CANDIDATES {
        for heads in MIN_HEADS..=MAX_HEADS {
            let cylinders = total / (heads * spt);
            if cylinders_fit(total, cylinders, heads) {
                return (cylinders, heads, spt);
            }
        }
    }

    // Too big for any CHS layout
    (total / (MAX_HEADS * 255), MAX_HEADS, 255)
}

/// Compute the geometry for a disk of `total_sectors` 512-byte sectors
pub fn compute_geometry(total_sectors: u32) -> Geometry {
    let (cylinders, heads, sectors_per_track) = choose_chs(total_sectors);

    Geometry {
        cylinders,
        heads,
        sectors_per_track,
        logical_sectors: cylinders * heads * sectors_per_track,
        block_size: SECTOR_SIZE as u32,
        block_shift: 0,
    }
}
