//! SCSI-2/MMC-3 command, status, and sense constants for CD/DVD-ROM
//! emulation.

/// SCSI command opcodes handled by the engine (SPC-3 / MMC-3).
pub mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const READ_6: u8 = 0x08;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    pub const READ_CAPACITY: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const SEEK_10: u8 = 0x2B;
    pub const WRITE_AND_VERIFY_10: u8 = 0x2E;
    pub const READ_TOC: u8 = 0x43;
    pub const GET_CONFIGURATION: u8 = 0x46;
    pub const GET_EVENT_STATUS_NOTIFICATION: u8 = 0x4A;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const MODE_SENSE_10: u8 = 0x5A;
    pub const READ_16: u8 = 0x88;
    pub const REPORT_LUNS: u8 = 0xA0;
    pub const REPORT_KEY: u8 = 0xA4;
    pub const READ_12: u8 = 0xA8;
    pub const SEND_KEY: u8 = 0xA3;
    pub const READ_DISC_INFORMATION: u8 = 0x51;
    pub const READ_TRACK_INFORMATION: u8 = 0x52;
    pub const MECHANISM_STATUS: u8 = 0xBD;
    pub const GET_PERFORMANCE: u8 = 0xAC;
    pub const READ_CD: u8 = 0xBE;
    pub const SEND_EVENT: u8 = 0xA9;
}

/// SCSI status codes returned in the CSW.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Sense key codes.
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional sense codes (ASC).
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const LUN_NOT_READY: u8 = 0x04;
    pub const INVALID_OPCODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD: u8 = 0x24;
    pub const LUN_NOT_SUPPORTED: u8 = 0x25;
    pub const INVALID_PARAM: u8 = 0x26;
    pub const INCOMPATIBLE_FORMAT: u8 = 0x30;
    pub const MEDIUM_MAY_HAVE_CHANGED: u8 = 0x28;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const CAPACITY_CHANGED: u8 = 0x2A;
    pub const NOT_READY_REMOVAL_PREVENTED: u8 = 0x53;
    pub const INVALID_PARAM_LEN: u8 = 0x1A;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const TARGET_FAILURE: u8 = 0x44;
    pub const REPORTED_LUNS_DATA_HAS_CHANGED: u8 = 0x3F;
}

/// Additional sense code qualifiers (ASCQ).
pub mod ascq {
    pub const NONE: u8 = 0x00;
    pub const BECOMING_READY: u8 = 0x01;
    pub const MEDIUM_NOT_PRESENT_TRAY_CLOSED: u8 = 0x01;
    pub const MEDIUM_NOT_PRESENT_TRAY_OPEN: u8 = 0x02;
    pub const REMOVAL_PREVENTED: u8 = 0x02;
    pub const REPORTED_LUNS_CHANGED: u8 = 0x0E;
    pub const DEVICE_INTERNAL_RESET: u8 = 0x04;
    pub const CAPACITY_DATA_HAS_CHANGED: u8 = 0x09;
}

/// Peripheral device type codes (INQUIRY byte 0, low 5 bits).
pub mod device_type {
    pub const DISK: u8 = 0x00;
    pub const CDROM: u8 = 0x05;
}

/// Peripheral qualifier codes (INQUIRY byte 0, high 3 bits).
pub mod periph_qualifier {
    pub const CONNECTED: u8 = 0x00;
    pub const NOT_CONNECTED: u8 = 0x01;
    pub const UNSUPPORTED: u8 = 0x03;
}

/// Mode page codes for MODE SENSE / MODE SELECT.
pub mod mode_page {
    pub const RW_ERROR_RECOVERY: u8 = 0x01;
    pub const POWER_CONDITION: u8 = 0x1A;
    pub const FAULT_FAILURE_REPORTING: u8 = 0x1C;
    pub const CAPABILITIES_MECH_STATUS: u8 = 0x2A;
    pub const ALL_PAGES: u8 = 0x3F;
}

/// GET_CONFIGURATION feature codes.
pub mod feature {
    pub const PROFILE_LIST: u16 = 0x0000;
    pub const CORE: u16 = 0x0001;
    pub const MORPHING: u16 = 0x0002;
    pub const REMOVABLE_MEDIUM: u16 = 0x0003;
    pub const RANDOM_READABLE: u16 = 0x0010;
    pub const CD_READ: u16 = 0x001E;
    pub const DVD_READ: u16 = 0x001F;
    pub const POWER_MANAGEMENT: u16 = 0x0100;
    pub const TIMEOUT: u16 = 0x0105;
}

/// MMC profile numbers reported by GET_CONFIGURATION's current-profile
/// field.
pub mod profile {
    pub const DVD_ROM: u16 = 0x0010;
    pub const CD_ROM: u16 = 0x0008;
}

/// Opcodes that must not clear a pending Unit Attention sense before they
/// run (spec section 4.1 request gating order, step 2).
pub const UA_SUPPRESS_OPCODES: &[u8] = &[
    opcode::INQUIRY,
    opcode::REPORT_LUNS,
    opcode::GET_CONFIGURATION,
    opcode::GET_EVENT_STATUS_NOTIFICATION,
    opcode::REQUEST_SENSE,
];

pub fn opcode_suppresses_ua(op: u8) -> bool {
    UA_SUPPRESS_OPCODES.contains(&op)
}

/// Derive the CDB length in bytes from its opcode group (high 3 bits of
/// byte 0): `0 -> 6, 1|2 -> 10, 4 -> 16, 5 -> 12`, anything else invalid.
pub fn cdb_length(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}
