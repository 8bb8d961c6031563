//! Identify and log page data structures (NVM Express 1.0e).
//!
//! The controller returns these through admin commands into a 4 KiB data
//! buffer. The structs cover the leading portion of each page that the
//! driver consumes; the remainder is reserved or vendor specific and is
//! left in the raw buffer.

use zerocopy::byteorder::{LittleEndian, U128, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of the SMART / Health Information log page in bytes.
pub const SMART_LOG_SIZE: usize = 512;
/// Size of the self-test log header plus the newest result in bytes.
pub const SELF_TEST_LOG_SIZE: usize = 32;

/// OACS bit indicating Device Self-test support.
pub const OACS_SELF_TEST: u16 = 1 << 4;

/// Leading fields of the Identify Controller data structure.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct IdentifyController {
    /// PCI vendor ID.
    pub vid: U16<LittleEndian>,
    /// PCI subsystem vendor ID.
    pub ssvid: U16<LittleEndian>,
    /// Serial number, ASCII padded with spaces.
    pub sn: [u8; 20],
    /// Model number, ASCII padded with spaces.
    pub mn: [u8; 40],
    /// Firmware revision, ASCII padded with spaces.
    pub fr: [u8; 8],
    /// Recommended arbitration burst.
    pub rab: u8,
    /// IEEE OUI identifier.
    pub ieee: [u8; 3],
    _reserved0: u8,
    /// Maximum data transfer size as a power of two of memory pages.
    /// Zero means no limit.
    pub mdts: u8,
    _reserved1: [u8; 178],
    /// Optional Admin Command Support.
    pub oacs: U16<LittleEndian>,
    /// Abort command limit.
    pub acl: u8,
    /// Asynchronous event request limit.
    pub aerl: u8,
    /// Firmware update capabilities.
    pub frmw: u8,
    /// Log page attributes.
    pub lpa: u8,
    /// Error log page entries.
    pub elpe: u8,
    /// Number of power states supported.
    pub npss: u8,
    _reserved2: [u8; 248],
    /// Submission queue entry size limits.
    pub sqes: u8,
    /// Completion queue entry size limits.
    pub cqes: u8,
    _reserved3: [u8; 2],
    /// Number of namespaces. Valid namespace IDs run from 1 to this value.
    pub nn: U32<LittleEndian>,
}

/// One LBA format descriptor from Identify Namespace.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct LbaFormat {
    /// Metadata bytes per block. This driver only supports zero.
    pub ms: U16<LittleEndian>,
    /// Block size as a power of two.
    pub lbads: u8,
    /// Relative performance hint.
    pub rp: u8,
}

/// Leading fields of the Identify Namespace data structure.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct IdentifyNamespace {
    /// Namespace size in blocks.
    pub nsze: U64<LittleEndian>,
    /// Namespace capacity in blocks.
    pub ncap: U64<LittleEndian>,
    /// Namespace utilisation in blocks.
    pub nuse: U64<LittleEndian>,
    /// Namespace features.
    pub nsfeat: u8,
    /// Index of the last valid entry in [`Self::lbaf`], zero based.
    pub nlbaf: u8,
    /// Formatted LBA size. The low nibble selects the active format.
    pub flbas: u8,
    /// Metadata capabilities.
    pub mc: u8,
    /// Data protection capabilities.
    pub dpc: u8,
    /// Data protection settings.
    pub dps: u8,
    _reserved: [u8; 98],
    /// LBA format descriptors.
    pub lbaf: [LbaFormat; 16],
}

impl IdentifyNamespace {
    /// Returns the block size of the active format as a power of two.
    #[inline]
    #[must_use]
    pub fn lba_shift(&self) -> u8 {
        self.lbaf[usize::from(self.flbas & 0xf)].lbads
    }
}

/// SMART / Health Information log page (log identifier 02h).
///
/// Bits of `critical_warning`: spare below threshold, temperature out of
/// range, media degraded, all media read-only, volatile backup failed.
/// The 128-bit counters are cumulative over the life of the controller;
/// data units count in 512 000 byte units.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SmartLog {
    /// Critical warning bits, zero when healthy.
    pub critical_warning: u8,
    /// Composite temperature in Kelvin.
    pub composite_temp: U16<LittleEndian>,
    /// Remaining spare capacity as a percentage.
    pub avail_spare: u8,
    /// Spare capacity threshold percentage.
    pub spare_thresh: u8,
    /// Estimated life used as a percentage. May exceed 100.
    pub percent_used: u8,
    _reserved0: [u8; 26],
    pub data_units_read: U128<LittleEndian>,
    pub data_units_written: U128<LittleEndian>,
    pub host_reads: U128<LittleEndian>,
    pub host_writes: U128<LittleEndian>,
    pub ctrl_busy_minutes: U128<LittleEndian>,
    pub power_cycles: U128<LittleEndian>,
    pub power_on_hours: U128<LittleEndian>,
    pub unsafe_shutdowns: U128<LittleEndian>,
    pub media_errors: U128<LittleEndian>,
    pub error_log_entries: U128<LittleEndian>,
}

impl SmartLog {
    /// Returns the composite temperature in degrees Celsius.
    #[inline]
    #[must_use]
    pub fn temperature_celsius(&self) -> i32 {
        i32::from(self.composite_temp.get()) - 273
    }
}

/// One self-test result descriptor.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SelfTestResult {
    /// Test result in the low nibble, test type in the high nibble.
    pub status: u8,
    /// Segment that first failed, valid for vendor diagnostics.
    pub segment: u8,
    /// Bits flagging which of the fields below are valid.
    pub valid_info: u8,
    _reserved: u8,
    /// Power-on hours when the test finished.
    pub power_on_hours: U64<LittleEndian>,
    /// Namespace of the first failure, when valid.
    pub nsid: U32<LittleEndian>,
    /// First failing LBA, when valid.
    pub failing_lba: U64<LittleEndian>,
    /// Status code type of the failed command, when valid.
    pub status_code_type: u8,
    /// Status code of the failed command, when valid.
    pub status_code: u8,
    /// Vendor specific.
    pub vendor: U16<LittleEndian>,
}

impl SelfTestResult {
    /// Returns the result code. Zero passed, 0xf means the slot is unused.
    #[inline]
    #[must_use]
    pub fn result(&self) -> u8 {
        self.status & 0xf
    }

    /// Returns the test type that produced this result.
    #[inline]
    #[must_use]
    pub fn test_type(&self) -> u8 {
        self.status >> 4
    }
}

/// Self-test log page header and newest result (log identifier 06h).
///
/// The full page holds twenty result descriptors; the driver reads the
/// header and the most recent one.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SelfTestLog {
    /// Operation in progress: 0 none, 1 short, 2 extended.
    pub current_operation: u8,
    /// Completion percentage of the running test in bits 6:0.
    pub current_completion: u8,
    _reserved: [u8; 2],
    /// Most recent result.
    pub newest: SelfTestResult,
}

impl SelfTestLog {
    /// Returns true while a self-test is running.
    #[inline]
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.current_operation != 0
    }

    /// Returns the completion percentage of the running test.
    #[inline]
    #[must_use]
    pub fn completion_percent(&self) -> u8 {
        self.current_completion & 0x7f
    }
}

/// Decodes a space-padded ASCII identification field for display.
#[must_use]
pub fn id_string(raw: &[u8]) -> &str {
    core::str::from_utf8(raw)
        .unwrap_or("?")
        .trim_end_matches(|c| c == ' ' || c == '\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_sizes() {
        assert_eq!(size_of::<IdentifyController>(), 520);
        assert_eq!(size_of::<IdentifyNamespace>(), 192);
        assert_eq!(size_of::<LbaFormat>(), 4);
        assert_eq!(size_of::<SmartLog>(), 192);
        assert_eq!(size_of::<SelfTestResult>(), 28);
        assert_eq!(size_of::<SelfTestLog>(), SELF_TEST_LOG_SIZE);
    }

    #[test]
    fn controller_field_offsets() {
        let mut raw = [0u8; 4096];
        raw[24..30].copy_from_slice(b"Disk 9");
        raw[77] = 5;
        raw[256..258].copy_from_slice(&0x0010u16.to_le_bytes());
        raw[516..520].copy_from_slice(&3u32.to_le_bytes());

        let (ident, _) = IdentifyController::read_from_prefix(&raw).unwrap();
        assert_eq!(&ident.mn[..6], b"Disk 9");
        assert_eq!(ident.mdts, 5);
        assert_eq!(ident.oacs.get(), OACS_SELF_TEST);
        assert_eq!(ident.nn.get(), 3);
    }

    #[test]
    fn namespace_block_shift_follows_flbas() {
        let mut raw = [0u8; 4096];
        raw[0..8].copy_from_slice(&0x10000u64.to_le_bytes());
        raw[26] = 0x01;
        raw[128 + 2] = 9;
        raw[132 + 2] = 12;

        let (ident, _) = IdentifyNamespace::read_from_prefix(&raw).unwrap();
        assert_eq!(ident.nsze.get(), 0x10000);
        assert_eq!(ident.lba_shift(), 12);
    }

    #[test]
    fn smart_log_field_offsets() {
        let mut raw = [0u8; SMART_LOG_SIZE];
        raw[0] = 0x01;
        raw[1..3].copy_from_slice(&303u16.to_le_bytes());
        raw[5] = 9;
        raw[32..48].copy_from_slice(&0x1234u128.to_le_bytes());

        let (log, _) = SmartLog::read_from_prefix(&raw).unwrap();
        assert_eq!(log.critical_warning, 0x01);
        assert_eq!(log.temperature_celsius(), 30);
        assert_eq!(log.percent_used, 9);
        assert_eq!(log.data_units_read.get(), 0x1234);
    }

    #[test]
    fn self_test_log_reports_newest_result() {
        let mut raw = [0u8; SELF_TEST_LOG_SIZE];
        raw[0] = 2;
        raw[1] = 85;
        raw[4] = 0x21;
        raw[20..28].copy_from_slice(&0xdeadu64.to_le_bytes());

        let (log, _) = SelfTestLog::read_from_prefix(&raw).unwrap();
        assert!(log.in_progress());
        assert_eq!(log.completion_percent(), 85);
        assert_eq!(log.newest.result(), 1);
        assert_eq!(log.newest.test_type(), 2);
        assert_eq!(log.newest.failing_lba.get(), 0xdead);
    }

    #[test]
    fn id_strings_drop_padding() {
        assert_eq!(id_string(b"Ember NVMe  \0\0"), "Ember NVMe");
        assert_eq!(id_string(b"    "), "");
    }
}
