//! Sense data: the three-byte short sense plus its 18-byte fixed-format
//! encoding (SenseData in spec section 3).

use super::constants::{ascq, asc, sense_key};

/// Response code for a current (non-deferred) fixed-format sense.
const FIXED_SENSE_CURRENT: u8 = 0x70;
/// Additional sense length field for an 18-byte fixed sense response.
const FIXED_SENSE_ADDITIONAL_LENGTH: u8 = 10;

/// The `(key, asc, ascq)` triple the engine tracks per LU; `NO_SENSE`
/// means nothing pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortSense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl ShortSense {
    pub const NO_SENSE: ShortSense = ShortSense {
        key: sense_key::NO_SENSE,
        asc: asc::NO_ADDITIONAL_SENSE,
        ascq: ascq::NONE,
    };

    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    pub fn is_no_sense(&self) -> bool {
        self.key == sense_key::NO_SENSE
    }

    pub fn is_unit_attention(&self) -> bool {
        self.key == sense_key::UNIT_ATTENTION
    }

    /// Render the 18-byte fixed-format sense buffer for this short sense.
    pub fn to_fixed_sense(&self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        buf[0] = FIXED_SENSE_CURRENT;
        buf[2] = self.key;
        buf[7] = FIXED_SENSE_ADDITIONAL_LENGTH;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }
}

/// Named sense codes the engine must be able to produce (spec section
/// 4.1's sense code set).
pub mod codes {
    use super::ShortSense;
    use super::{ascq, asc, sense_key};

    pub const NO_SENSE: ShortSense = ShortSense::NO_SENSE;
    pub const LUN_NOT_READY: ShortSense =
        ShortSense::new(sense_key::NOT_READY, asc::LUN_NOT_READY, ascq::NONE);
    pub const BECOMING_READY: ShortSense =
        ShortSense::new(sense_key::NOT_READY, asc::LUN_NOT_READY, ascq::BECOMING_READY);
    pub const INIT_CMD_REQUIRED: ShortSense =
        ShortSense::new(sense_key::NOT_READY, asc::LUN_NOT_READY, 0x02);
    pub const NO_MEDIUM: ShortSense = ShortSense::new(
        sense_key::NOT_READY,
        asc::MEDIUM_NOT_PRESENT,
        ascq::MEDIUM_NOT_PRESENT_TRAY_CLOSED,
    );
    pub const NOT_READY_REMOVAL_PREVENTED: ShortSense = ShortSense::new(
        sense_key::NOT_READY,
        asc::NOT_READY_REMOVAL_PREVENTED,
        ascq::REMOVAL_PREVENTED,
    );
    pub const TARGET_FAILURE: ShortSense =
        ShortSense::new(sense_key::HARDWARE_ERROR, asc::TARGET_FAILURE, ascq::NONE);
    pub const INVALID_OPCODE: ShortSense =
        ShortSense::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_OPCODE, ascq::NONE);
    pub const LBA_OUT_OF_RANGE: ShortSense = ShortSense::new(
        sense_key::ILLEGAL_REQUEST,
        asc::LBA_OUT_OF_RANGE,
        ascq::NONE,
    );
    pub const INVALID_FIELD: ShortSense =
        ShortSense::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD, ascq::NONE);
    pub const INVALID_PARAM: ShortSense =
        ShortSense::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_PARAM, ascq::NONE);
    pub const INVALID_PARAM_LEN: ShortSense = ShortSense::new(
        sense_key::ILLEGAL_REQUEST,
        asc::INVALID_PARAM_LEN,
        ascq::NONE,
    );
    pub const LUN_NOT_SUPPORTED: ShortSense = ShortSense::new(
        sense_key::ILLEGAL_REQUEST,
        asc::LUN_NOT_SUPPORTED,
        ascq::NONE,
    );
    pub const INCOMPATIBLE_FORMAT: ShortSense = ShortSense::new(
        sense_key::ILLEGAL_REQUEST,
        asc::INCOMPATIBLE_FORMAT,
        ascq::NONE,
    );
    pub const ILLEGAL_REQ_REMOVAL_PREVENTED: ShortSense = ShortSense::new(
        sense_key::ILLEGAL_REQUEST,
        asc::NOT_READY_REMOVAL_PREVENTED,
        ascq::REMOVAL_PREVENTED,
    );
    pub const CAPACITY_CHANGED: ShortSense = ShortSense::new(
        sense_key::UNIT_ATTENTION,
        asc::CAPACITY_CHANGED,
        ascq::CAPACITY_DATA_HAS_CHANGED,
    );
    pub const RESET: ShortSense =
        ShortSense::new(sense_key::UNIT_ATTENTION, asc::POWER_ON_RESET, ascq::NONE);
    pub const MEDIUM_CHANGED: ShortSense = ShortSense::new(
        sense_key::UNIT_ATTENTION,
        asc::MEDIUM_MAY_HAVE_CHANGED,
        ascq::NONE,
    );
    pub const REPORTED_LUNS_CHANGED: ShortSense = ShortSense::new(
        sense_key::UNIT_ATTENTION,
        asc::REPORTED_LUNS_DATA_HAS_CHANGED,
        ascq::REPORTED_LUNS_CHANGED,
    );
    pub const DEVICE_INTERNAL_RESET: ShortSense = ShortSense::new(
        sense_key::UNIT_ATTENTION,
        asc::POWER_ON_RESET,
        ascq::DEVICE_INTERNAL_RESET,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sense_layout() {
        let s = codes::LBA_OUT_OF_RANGE;
        let buf = s.to_fixed_sense();
        assert_eq!(buf[0], FIXED_SENSE_CURRENT);
        assert_eq!(buf[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(buf[7], 10);
        assert_eq!(buf[12], asc::LBA_OUT_OF_RANGE);
        assert_eq!(buf[13], 0);
    }

    #[test]
    fn no_sense_is_all_zero_key() {
        assert!(ShortSense::NO_SENSE.is_no_sense());
        assert!(!codes::RESET.is_no_sense());
        assert!(codes::RESET.is_unit_attention());
    }
}
