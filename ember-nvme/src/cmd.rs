//! NVMe command formats (NVM Express 1.0e).
//!
//! Commands are 64-byte submission queue entries and 16-byte completion
//! queue entries. All multi-byte fields are little-endian; the structs use
//! explicit byte-order types so they can be copied to and from the DMA
//! rings directly.

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Admin command opcodes.
pub mod opc {
    /// Create IO Submission Queue.
    pub const CREATE_IO_SQ: u8 = 0x01;
    /// Get Log Page.
    pub const GET_LOG_PAGE: u8 = 0x02;
    /// Create IO Completion Queue.
    pub const CREATE_IO_CQ: u8 = 0x05;
    /// Identify.
    pub const IDENTIFY: u8 = 0x06;
    /// Set Features.
    pub const SET_FEATURES: u8 = 0x09;
    /// Device Self-test.
    pub const DEVICE_SELF_TEST: u8 = 0x14;
}

/// NVM command opcodes.
pub mod io_opc {
    /// Write.
    pub const WRITE: u8 = 0x01;
    /// Read.
    pub const READ: u8 = 0x02;
}

/// Identify CNS values.
pub mod cns {
    /// Identify Namespace.
    pub const NAMESPACE: u32 = 0x00;
    /// Identify Controller.
    pub const CONTROLLER: u32 = 0x01;
    /// Active namespace ID list.
    pub const ACTIVE_NAMESPACES: u32 = 0x02;
}

/// Set Features feature identifiers.
pub mod feature {
    /// Number of Queues.
    pub const NUMBER_OF_QUEUES: u32 = 0x07;
}

/// Get Log Page identifiers.
pub mod log_page {
    /// SMART / Health Information.
    pub const SMART: u8 = 0x02;
    /// Device Self-test.
    pub const SELF_TEST: u8 = 0x06;
}

/// Device Self-test action codes, carried in CDW10.
pub mod self_test {
    /// Start a short self-test.
    pub const SHORT: u32 = 0x1;
    /// Start an extended self-test.
    pub const EXTENDED: u32 = 0x2;
    /// Abort the running self-test.
    pub const ABORT: u32 = 0xf;
}

/// Namespace ID addressing every namespace.
pub const NSID_ALL: u32 = 0xffff_ffff;

/// Byte offset of the status word within a completion entry.
pub const STATUS_FIELD_OFFSET: usize = 14;
/// Bit position of the phase bit within the status word.
pub const PHASE_BIT: u16 = 0;

/// A 64-byte submission queue entry.
///
/// The data pointer is always a PRP pair here; this driver does not use
/// SGLs. CDW10 through CDW15 carry per-opcode arguments.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SubmissionEntry {
    /// Command opcode.
    pub opcode: u8,
    /// Fused operation and data transfer hints, unused by this driver.
    pub flags: u8,
    /// Command identifier, unique among commands outstanding on one queue.
    pub cid: U16<LittleEndian>,
    /// Namespace identifier, zero when the command does not address one.
    pub nsid: U32<LittleEndian>,
    _reserved: [u8; 8],
    /// Metadata pointer, unused by this driver.
    pub mptr: U64<LittleEndian>,
    /// First PRP entry.
    pub prp1: U64<LittleEndian>,
    /// Second PRP entry or PRP list pointer.
    pub prp2: U64<LittleEndian>,
    pub cdw10: U32<LittleEndian>,
    pub cdw11: U32<LittleEndian>,
    pub cdw12: U32<LittleEndian>,
    pub cdw13: U32<LittleEndian>,
    pub cdw14: U32<LittleEndian>,
    pub cdw15: U32<LittleEndian>,
}

/// A 16-byte completion queue entry.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CompletionEntry {
    /// Command-specific result.
    pub result: U32<LittleEndian>,
    _reserved: [u8; 4],
    /// Submission queue head pointer at completion time.
    pub sq_head: U16<LittleEndian>,
    /// Submission queue the command came from.
    pub sq_id: U16<LittleEndian>,
    /// Command identifier copied from the submission entry.
    pub cid: U16<LittleEndian>,
    /// Phase bit in bit 0, status code in bits 15:1.
    pub status: U16<LittleEndian>,
}

impl CompletionEntry {
    /// Returns the status code with the phase bit stripped. Zero is success.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.get() >> 1
    }
}

/// Builds an Identify command reading into `buf_addr`.
#[must_use]
pub fn identify(cns: u32, nsid: u32, buf_addr: u64) -> SubmissionEntry {
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opc::IDENTIFY;
    entry.nsid = U32::new(nsid);
    entry.prp1 = U64::new(buf_addr);
    entry.cdw10 = U32::new(cns);
    entry
}

/// Builds a Set Features command.
#[must_use]
pub fn set_features(feature: u32, value: u32) -> SubmissionEntry {
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opc::SET_FEATURES;
    entry.cdw10 = U32::new(feature);
    entry.cdw11 = U32::new(value);
    entry
}

/// Builds a Create IO Completion Queue command.
///
/// The queue is physically contiguous and never signals an interrupt.
#[must_use]
pub fn create_io_cq(qid: u16, depth: u16, ring_addr: u64) -> SubmissionEntry {
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opc::CREATE_IO_CQ;
    entry.prp1 = U64::new(ring_addr);
    entry.cdw10 = U32::new(u32::from(depth - 1) << 16 | u32::from(qid));
    entry.cdw11 = U32::new(1);
    entry
}

/// Builds a Create IO Submission Queue command.
#[must_use]
pub fn create_io_sq(qid: u16, depth: u16, cq_id: u16, ring_addr: u64) -> SubmissionEntry {
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opc::CREATE_IO_SQ;
    entry.prp1 = U64::new(ring_addr);
    entry.cdw10 = U32::new(u32::from(depth - 1) << 16 | u32::from(qid));
    entry.cdw11 = U32::new(u32::from(cq_id) << 16 | 1);
    entry
}

/// Builds a Get Log Page command reading `len` bytes into `buf_addr`.
///
/// `len` must be a nonzero multiple of four; the dword count is zero based
/// and split across CDW10 and CDW11.
#[must_use]
pub fn get_log_page(lid: u8, nsid: u32, len: usize, buf_addr: u64) -> SubmissionEntry {
    debug_assert!(len != 0 && len % 4 == 0, "log length must be whole dwords");
    let numd = (len / 4 - 1) as u32;
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opc::GET_LOG_PAGE;
    entry.nsid = U32::new(nsid);
    entry.prp1 = U64::new(buf_addr);
    entry.cdw10 = U32::new((numd & 0xffff) << 16 | u32::from(lid));
    entry.cdw11 = U32::new(numd >> 16);
    entry
}

/// Builds a Device Self-test command with one of the [`self_test`] codes.
#[must_use]
pub fn device_self_test(code: u32) -> SubmissionEntry {
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opc::DEVICE_SELF_TEST;
    entry.nsid = U32::new(NSID_ALL);
    entry.cdw10 = U32::new(code);
    entry
}

/// Builds a Read or Write command without its data pointer.
///
/// The caller fills `prp1` and `prp2` once it knows where the PRP list
/// for the command lives. The block count is zero based and must not
/// exceed 65536.
#[must_use]
pub fn read_write(opcode: u8, nsid: u32, lba: u64, blocks: u32) -> SubmissionEntry {
    debug_assert!(blocks != 0 && blocks <= 1 << 16, "block count out of range");
    let mut entry = SubmissionEntry::new_zeroed();
    entry.opcode = opcode;
    entry.nsid = U32::new(nsid);
    entry.cdw10 = U32::new(lba as u32);
    entry.cdw11 = U32::new((lba >> 32) as u32);
    entry.cdw12 = U32::new(blocks - 1);
    entry
}
