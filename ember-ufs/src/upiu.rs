//! UPIU wire formats (JESD220E).
//!
//! UPIUs travel through the UTP command descriptor in host memory. All
//! multi-byte fields are big-endian; the structs below use explicit
//! byte-order types so they can be copied to and from DMA memory directly.

use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// UPIU transaction codes.
pub mod trans {
    /// NOP OUT, host to device.
    pub const NOP_OUT: u8 = 0x00;
    /// Command, host to device.
    pub const COMMAND: u8 = 0x01;
    /// Query request, host to device.
    pub const QUERY_REQUEST: u8 = 0x16;
    /// NOP IN, device to host.
    pub const NOP_IN: u8 = 0x20;
    /// Response, device to host.
    pub const RESPONSE: u8 = 0x21;
    /// Query response, device to host.
    pub const QUERY_RESPONSE: u8 = 0x36;
}

/// Command UPIU flag bits.
pub mod flags {
    /// Data transfer from device to host.
    pub const READ: u8 = 0x40;
    /// Data transfer from host to device.
    pub const WRITE: u8 = 0x20;
}

/// SCSI command set, carried in the low nibble of the command set field.
pub const CMD_SET_SCSI: u8 = 0x00;

/// Query function values.
pub mod query_func {
    /// Standard read request.
    pub const STANDARD_READ: u8 = 0x01;
    /// Standard write request.
    pub const STANDARD_WRITE: u8 = 0x81;
}

/// Query opcodes.
pub mod query_op {
    /// Read a descriptor.
    pub const READ_DESCRIPTOR: u8 = 0x01;
    /// Write a descriptor.
    pub const WRITE_DESCRIPTOR: u8 = 0x02;
    /// Read an attribute.
    pub const READ_ATTR: u8 = 0x03;
    /// Write an attribute.
    pub const WRITE_ATTR: u8 = 0x04;
    /// Read a flag.
    pub const READ_FLAG: u8 = 0x05;
    /// Set a flag.
    pub const SET_FLAG: u8 = 0x06;

    /// Returns the query function byte for `op`.
    #[must_use]
    pub const fn function(op: u8) -> u8 {
        match op {
            READ_DESCRIPTOR | READ_ATTR | READ_FLAG => super::query_func::STANDARD_READ,
            _ => super::query_func::STANDARD_WRITE,
        }
    }
}

/// The basic header shared by every UPIU.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct UpiuHeader {
    /// Transaction code, one of [`trans`].
    pub trans_type: u8,
    /// Transaction flags.
    pub flags: u8,
    /// Logical unit number.
    pub lun: u8,
    /// Task tag, matching the transfer request slot.
    pub task_tag: u8,
    /// Initiator ID and command set type.
    pub cmd_set: u8,
    /// Query function, reserved elsewhere.
    pub function: u8,
    /// Response code, set by the device.
    pub response: u8,
    /// SCSI status, set by the device.
    pub status: u8,
    /// Total extra header segment length.
    pub ehs_len: u8,
    /// Device information.
    pub dev_info: u8,
    /// Length of the data segment that follows the header.
    pub data_segment_len: U16<BigEndian>,
}

/// Command UPIU carrying a SCSI CDB.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CommandUpiu {
    pub header: UpiuHeader,
    /// Expected data transfer length in bytes.
    pub transfer_len: U32<BigEndian>,
    /// SCSI command descriptor block, zero padded.
    pub cdb: [u8; 16],
}

/// Response UPIU returned for command UPIUs.
///
/// A sense data segment may follow the header; its offset within the
/// response area is [`size_of::<ResponseUpiu>()`](core::mem::size_of).
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ResponseUpiu {
    pub header: UpiuHeader,
    /// Residual transfer count in bytes.
    pub residual: U32<BigEndian>,
    _reserved: [u8; 16],
}

/// Query request and query response UPIU.
///
/// Requests and responses share one layout; a data segment may follow for
/// descriptor transfers.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct QueryUpiu {
    pub header: UpiuHeader,
    /// Query opcode, one of [`query_op`].
    pub opcode: u8,
    /// Descriptor, attribute or flag identifier.
    pub idn: u8,
    /// Index, used to select a unit for per-unit descriptors.
    pub index: u8,
    /// Selector.
    pub selector: u8,
    _reserved1: [u8; 2],
    /// Data segment length for descriptor transfers.
    pub data_len: U16<BigEndian>,
    /// Attribute value; for flags only the lowest byte is significant.
    pub attr_val: U32<BigEndian>,
    _reserved2: [u8; 8],
}

impl QueryUpiu {
    /// Returns the flag value carried in the attribute field.
    #[inline]
    #[must_use]
    pub fn flag_val(&self) -> u8 {
        (self.attr_val.get() & 0xff) as u8
    }
}
