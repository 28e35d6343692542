//! ATAPI entry points
//!
//! The card is always a fixed disk. The disk subsystem still calls these
//! for every unit, so they exist and refuse.

use super::{IdeUnit, IoError, ScsiCmd, XferDirection};
use crate::drivers::spi::SpiHost;
use crate::time::TickSource;

impl<H: SpiHost, T: TickSource> IdeUnit<'_, H, T> {
    /// Medium presence changed; never reports a change
    pub fn atapi_update_presence(&mut self, _present: bool) -> bool {
        false
    }

    pub fn atapi_start_stop_unit(&mut self, _start: bool, _load_eject: bool) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_test_unit_ready(&mut self) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_check_wp(&mut self) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_translate(
        &mut self,
        _data: &mut [u8],
        _lba: u32,
        _count: u32,
        _actual: &mut u32,
        _direction: XferDirection,
    ) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_translate_play_audio_index(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_packet(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_scsi_mode_sense_6(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_scsi_mode_select_6(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_scsi_read_write_6(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_packet_unaligned(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }

    pub fn atapi_autosense(&mut self, _cmd: &mut ScsiCmd<'_>) -> Result<(), IoError> {
        Err(IoError::NoCmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::spi::BusArbiter;
    use crate::testing::{FakeClock, SimCard, SimKind};

    #[test]
    fn test_atapi_operations_are_refused() {
        let bus = BusArbiter::new();
        let clock = FakeClock::new(0);
        let mut unit = IdeUnit::with_default_channel(0, SimCard::new(SimKind::Sdhc), &bus, &clock);
        assert!(unit.init_unit());

        let cdb = [0u8; 6];
        let mut data = [0u8; 16];
        let mut cmd = ScsiCmd::new(&cdb, &mut data);
        let mut actual = 0;
        let mut buf = [0u8; 512];

        assert!(!unit.atapi_update_presence(true));
        assert!(!unit.atapi_update_presence(false));
        assert_eq!(unit.atapi_start_stop_unit(true, true), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_test_unit_ready(), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_check_wp(), Err(IoError::NoCmd));
        assert_eq!(
            unit.atapi_translate(&mut buf, 0, 1, &mut actual, XferDirection::Read),
            Err(IoError::NoCmd)
        );
        assert_eq!(actual, 0);
        assert_eq!(unit.atapi_translate_play_audio_index(&mut cmd), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_packet(&mut cmd), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_scsi_mode_sense_6(&mut cmd), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_scsi_mode_select_6(&mut cmd), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_scsi_read_write_6(&mut cmd), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_packet_unaligned(&mut cmd), Err(IoError::NoCmd));
        assert_eq!(unit.atapi_autosense(&mut cmd), Err(IoError::NoCmd));
        assert!(!bus.is_held());
    }
}
