//! SCSI sense data: the three-field (key, ASC, ASCQ) error record returned by
//! `REQUEST SENSE` and updated by any command that fails.

/// Sense keys (SPC-3 table 27).
pub mod key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Codes used by this dispatcher.
pub mod asc {
    pub const NO_ADDITIONAL: u8 = 0x00;
    pub const PERIPHERAL_DEVICE_WRITE_FAULT: u8 = 0x03;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
}

/// Additional Sense Code Qualifiers used by this dispatcher.
pub mod ascq {
    pub const NA: u8 = 0x00;
}

const RESPONSE_CODE_CURRENT_FIXED: u8 = 0x70;

/// The 18-byte fixed-format sense response template (SPC-3 table 27), with
/// everything but RESPONSE CODE and ADDITIONAL SENSE LENGTH zeroed; key/ASC/
/// ASCQ are overlaid from the live [`SenseData`] on every `REQUEST SENSE`.
const REQUEST_SENSE_TEMPLATE: [u8; 18] = [
    RESPONSE_CODE_CURRENT_FIXED,
    0x00, // obsolete
    0x00, // sense key (overlaid)
    0, 0, 0, 0,    // information
    0x0a, // additional sense length
    0, 0, 0, 0, // command-specific information
    0x00, // ASC (overlaid)
    0x00, // ASCQ (overlaid)
    0x00, // field replaceable unit code
    0x00, 0x00, 0x00, // sense-key-specific
];

/// The last SCSI error observed by this LUN, reported (not cleared) by
/// `REQUEST SENSE`.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenseData {
    key: u8,
    asc: u8,
    ascq: u8,
}

impl Default for SenseData {
    fn default() -> Self {
        Self::good()
    }
}

impl SenseData {
    /// `(NO_SENSE, NO_ADDITIONAL, NA)` — the power-on default.
    pub const fn good() -> Self {
        SenseData {
            key: key::NO_SENSE,
            asc: asc::NO_ADDITIONAL,
            ascq: ascq::NA,
        }
    }

    /// Overwrites the sense triple, e.g. on a failing command.
    pub fn set(&mut self, key: u8, asc: u8, ascq: u8) {
        self.key = key;
        self.asc = asc;
        self.ascq = ascq;
    }

    /// Resets to [`SenseData::good`].
    pub fn set_good(&mut self) {
        *self = Self::good();
    }

    /// Renders the 18-byte fixed-format `REQUEST SENSE` response.
    pub fn to_request_sense_bytes(&self) -> [u8; 18] {
        let mut bytes = REQUEST_SENSE_TEMPLATE;
        bytes[2] = self.key;
        bytes[12] = self.asc;
        bytes[13] = self.ascq;
        bytes
    }
}
