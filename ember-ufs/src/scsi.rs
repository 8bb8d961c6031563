//! SCSI command blocks and sense data handling.
//!
//! UFS carries a small SCSI command set. The driver only needs TEST UNIT
//! READY and the 10-byte read and write commands; writes always set the
//! force unit access bit because nothing ever issues a cache flush.

use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{UfsError, UfsResult};

/// TEST UNIT READY opcode.
pub const TEST_UNIT_READY: u8 = 0x00;
/// READ (10) opcode.
pub const READ_10: u8 = 0x28;
/// WRITE (10) opcode.
pub const WRITE_10: u8 = 0x2a;

/// Force unit access bit in byte 1 of READ (10) and WRITE (10).
pub const FUA: u8 = 0x08;

/// Largest transfer one 10-byte command can carry.
pub const MAX_BLOCKS_PER_CMD: u64 = 65535;

/// SCSI status codes.
pub mod status {
    /// Command completed successfully.
    pub const GOOD: u8 = 0x00;
    /// Sense data is available.
    pub const CHECK_CONDITION: u8 = 0x02;
    /// The logical unit is busy.
    pub const BUSY: u8 = 0x08;
}

/// Sense key values the driver distinguishes.
pub mod sense_key {
    /// The device state changed, for example after power on.
    pub const UNIT_ATTENTION: u8 = 0x06;
}

/// Response code for current fixed format sense data.
pub const SENSE_FORMAT_FIXED: u8 = 0x70;
/// Length of fixed format sense data.
pub const SENSE_LEN: usize = 18;

/// Returns a TEST UNIT READY CDB.
#[must_use]
pub fn test_unit_ready_cdb() -> [u8; 16] {
    [0; 16]
}

/// Returns a READ (10) CDB for `blocks` blocks at `lba`.
#[must_use]
pub fn read10_cdb(lba: u32, blocks: u16) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = READ_10;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

/// Returns a WRITE (10) CDB for `blocks` blocks at `lba`.
///
/// The force unit access bit is set: there is no flush path, so data must
/// be durable when the command completes.
#[must_use]
pub fn write10_cdb(lba: u32, blocks: u16) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = WRITE_10;
    cdb[1] = FUA;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

/// Fixed format sense data (JESD220E Table 10.17).
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FixedSense {
    /// Valid bit and response code.
    pub response_code: u8,
    _obsolete: u8,
    /// Filemark, EOM and ILI bits and the sense key.
    pub flags: u8,
    pub information: [u8; 4],
    pub additional_len: u8,
    _command_specific: [u8; 4],
    /// Additional sense code.
    pub asc: u8,
    /// Additional sense code qualifier.
    pub ascq: u8,
    /// Field replaceable unit code.
    pub fruc: u8,
    pub sense_key_specific: [u8; 3],
}

impl FixedSense {
    /// Returns the response code without the valid bit.
    #[inline]
    #[must_use]
    pub fn code(&self) -> u8 {
        self.response_code & 0x7f
    }

    /// Returns the sense key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> u8 {
        self.flags & 0x0f
    }
}

/// The sense data segment of a response UPIU: a length field followed by
/// fixed format sense data.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SenseData {
    /// Length of the sense data that follows.
    pub len: U16<BigEndian>,
    /// The sense data itself.
    pub sense: FixedSense,
}

/// Validates a sense data segment and maps the sense key to an error.
///
/// `data_segment_len` is the segment length reported in the response UPIU
/// header. A unit attention key maps to [`UfsError::UnitAttention`] so the
/// caller can retry; everything else is a hard failure.
pub(crate) fn check_sense(data_segment_len: u16, data: &SenseData) -> UfsResult<()> {
    if (data_segment_len as usize) < size_of::<SenseData>() {
        log::warn!(
            "check_sense: short sense segment of {} bytes",
            data_segment_len
        );
        return Err(UfsError::Protocol);
    }
    if data.len.get() as usize != SENSE_LEN {
        log::warn!("check_sense: bad sense length {}", data.len.get());
        return Err(UfsError::Protocol);
    }
    if data.sense.code() != SENSE_FORMAT_FIXED {
        log::warn!("check_sense: unknown sense format {:#x}", data.sense.code());
        return Err(UfsError::Protocol);
    }
    if data.sense.key() == sense_key::UNIT_ATTENTION {
        log::debug!(
            "check_sense: unit attention, asc {:#x} ascq {:#x}",
            data.sense.asc,
            data.sense.ascq
        );
        return Err(UfsError::UnitAttention);
    }
    log::warn!(
        "check_sense: sense key {:#x}, asc {:#x} ascq {:#x}",
        data.sense.key(),
        data.sense.asc,
        data.sense.ascq
    );
    Err(UfsError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn sense(key: u8) -> SenseData {
        let mut data = SenseData::new_zeroed();
        data.len = U16::new(SENSE_LEN as u16);
        data.sense.response_code = 0x80 | SENSE_FORMAT_FIXED;
        data.sense.flags = key;
        data
    }

    #[test]
    fn cdb_encoding() {
        let cdb = read10_cdb(0x01020304, 0x0506);
        assert_eq!(cdb[0], READ_10);
        assert_eq!(cdb[1], 0);
        assert_eq!(&cdb[2..6], &[1, 2, 3, 4]);
        assert_eq!(&cdb[7..9], &[5, 6]);
        assert_eq!(&cdb[9..], &[0; 7]);

        let cdb = write10_cdb(0xff, 1);
        assert_eq!(cdb[0], WRITE_10);
        assert_eq!(cdb[1], FUA);
        assert_eq!(&cdb[2..6], &[0, 0, 0, 0xff]);
        assert_eq!(&cdb[7..9], &[0, 1]);
    }

    #[test]
    fn sense_layout() {
        assert_eq!(size_of::<FixedSense>(), SENSE_LEN);
        assert_eq!(size_of::<SenseData>(), 20);
    }

    #[test]
    fn sense_unit_attention_is_retryable() {
        assert_eq!(check_sense(20, &sense(sense_key::UNIT_ATTENTION)), Err(UfsError::UnitAttention));
    }

    #[test]
    fn sense_other_keys_fail() {
        // Medium error.
        assert_eq!(check_sense(20, &sense(0x03)), Err(UfsError::Io));
        // Hardware error.
        assert_eq!(check_sense(20, &sense(0x04)), Err(UfsError::Io));
    }

    #[test]
    fn sense_malformed_segments() {
        assert_eq!(check_sense(19, &sense(0)), Err(UfsError::Protocol));

        let mut short = sense(0);
        short.len = U16::new(17);
        assert_eq!(check_sense(20, &short), Err(UfsError::Protocol));

        let mut descriptor_format = sense(0);
        descriptor_format.sense.response_code = 0x72;
        assert_eq!(check_sense(20, &descriptor_format), Err(UfsError::Protocol));
    }
}
