//! UTP transfer request descriptors and DMA memory layout (JESD223D).
//!
//! The driver owns one block of DMA memory holding the transfer request
//! list followed by a single UTP command descriptor: request slots never
//! run concurrently, so one command descriptor is shared by every slot.
//!
//! ```text
//! offset 0      transfer request list, 32 slots of 32 bytes
//! offset 1024   command UPIU area, 512 bytes
//! offset 1536   response UPIU area, 512 bytes
//! offset 2048   PRDT, 1024 entries of 16 bytes
//! ```

use ember_pal::DmaBuffer;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Number of transfer request slots.
pub const REQ_SLOTS: usize = 32;
/// Size of the transfer request list in bytes.
pub const REQ_LIST_SIZE: usize = 1024;
/// Size of a UPIU area. Large enough for the biggest descriptor and a
/// power of two so the layout stays aligned.
pub const UPIU_SIZE: usize = 512;
/// Maximum bytes covered by one PRDT entry (256 KiB).
pub const PRDT_DBC_MAX: usize = 0x40000;
/// Size of one PRDT entry.
pub const PRDT_ENTRY_SIZE: usize = 16;
/// Number of PRDT entries. A READ (10) of 65535 blocks of 4 KiB needs
/// 1024 entries of 256 KiB.
pub const MAX_PRDT_ENTRIES: usize = 1024;
/// Size of one UTP command descriptor: two UPIU areas and the PRDT.
pub const UCD_SIZE: usize = 2 * UPIU_SIZE + MAX_PRDT_ENTRIES * PRDT_ENTRY_SIZE;
/// Total DMA memory for the request list plus one command descriptor.
pub const DMA_SIZE: usize = REQ_LIST_SIZE + UCD_SIZE;
/// Request list base alignment required by the controller.
pub const DMA_ALIGN: usize = 1024;

/// The request slot used for every transfer.
pub const DEFAULT_TAG: u8 = 0;

/// Returns the offset of the command UPIU area for `tag`.
#[inline]
#[must_use]
pub const fn cmd_upiu_offset(tag: u8) -> usize {
    REQ_LIST_SIZE + tag as usize * UCD_SIZE
}

/// Returns the offset of the response UPIU area for `tag`.
#[inline]
#[must_use]
pub const fn resp_upiu_offset(tag: u8) -> usize {
    cmd_upiu_offset(tag) + UPIU_SIZE
}

/// Returns the offset of the PRDT for `tag`.
#[inline]
#[must_use]
pub const fn prdt_offset(tag: u8) -> usize {
    cmd_upiu_offset(tag) + 2 * UPIU_SIZE
}

/// Returns the offset of the transfer request descriptor for `tag`.
#[inline]
#[must_use]
pub const fn utrd_offset(tag: u8) -> usize {
    tag as usize * size_of::<TransferReqDesc>()
}

/// Fields packed into the first dword of a transfer request descriptor.
pub mod dword0 {
    /// Interrupt command: completion sets an interrupt status bit.
    pub const INTERRUPT: u32 = 1 << 24;
    /// Command type for UFS storage.
    pub const CT_UFS_STORAGE: u32 = 1 << 28;

    /// Data direction field shift.
    pub const DDIR_SHIFT: u32 = 25;
    /// No data transfer.
    pub const DDIR_NONE: u32 = 0;
    /// Data from host memory to the device.
    pub const DDIR_TO_DEVICE: u32 = 1;
    /// Data from the device to host memory.
    pub const DDIR_FROM_DEVICE: u32 = 2;
}

/// Overall command status values.
pub mod ocs {
    /// Command completed successfully.
    pub const SUCCESS: u8 = 0x0;
    /// Value seeded by the driver before submission, so a descriptor the
    /// controller never processed is not mistaken for a success.
    pub const INVALID: u8 = 0xf;
}

/// UTP transfer request descriptor. All fields little-endian.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TransferReqDesc {
    /// Command type, data direction and interrupt bits, see [`dword0`].
    pub dw0: U32<LittleEndian>,
    /// Data unit number, lower 32 bits.
    pub dunl: U32<LittleEndian>,
    /// Overall command status, written back by the controller.
    pub ocs: u8,
    _reserved: [u8; 3],
    /// Data unit number, upper 32 bits.
    pub dunu: U32<LittleEndian>,
    /// Command descriptor base address, lower 32 bits. 128-byte aligned.
    pub ucdba: U32<LittleEndian>,
    /// Command descriptor base address, upper 32 bits.
    pub ucdbau: U32<LittleEndian>,
    /// Response UPIU length in dwords.
    pub resp_len: U16<LittleEndian>,
    /// Response UPIU offset from the command descriptor base, in dwords.
    pub resp_offset: U16<LittleEndian>,
    /// Number of PRDT entries.
    pub prdt_len: U16<LittleEndian>,
    /// PRDT offset from the command descriptor base, in dwords.
    pub prdt_offset: U16<LittleEndian>,
}

impl TransferReqDesc {
    /// Builds a descriptor for slot `tag` with the shared command
    /// descriptor layout filled in and the status seeded invalid.
    #[must_use]
    pub fn for_slot(tag: u8, ddir: u32, prdt_entries: u16, list_bus_addr: u64) -> Self {
        let mut desc = Self::new_zeroed();
        desc.dw0 = U32::new(
            dword0::INTERRUPT | dword0::CT_UFS_STORAGE | (ddir << dword0::DDIR_SHIFT),
        );
        desc.ocs = ocs::INVALID;
        let ucd = list_bus_addr + cmd_upiu_offset(tag) as u64;
        desc.ucdba = U32::new(ucd as u32);
        desc.ucdbau = U32::new((ucd >> 32) as u32);
        desc.resp_len = U16::new((UPIU_SIZE >> 2) as u16);
        desc.resp_offset = U16::new((UPIU_SIZE >> 2) as u16);
        desc.prdt_len = U16::new(prdt_entries);
        desc.prdt_offset = U16::new(((2 * UPIU_SIZE) >> 2) as u16);
        desc
    }
}

/// Physical region descriptor table entry. All fields little-endian.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct PrdtEntry {
    /// Data buffer address. Must be 4-byte aligned.
    pub base_addr: U64<LittleEndian>,
    _reserved: [u8; 4],
    /// Byte count, stored as length minus one.
    pub byte_count: U32<LittleEndian>,
}

/// Fills the PRDT for `tag` with entries covering `len` bytes at
/// `buf_addr`, splitting at the per-entry limit.
///
/// Returns the number of entries written. The caller bounds `len` so the
/// table cannot overflow.
pub fn build_prdt(dma: &mut DmaBuffer, tag: u8, buf_addr: u64, len: usize) -> u16 {
    let table = prdt_offset(tag);
    let mut entries = 0usize;
    let mut addr = buf_addr;
    let mut left = len;
    while left > 0 {
        let chunk = left.min(PRDT_DBC_MAX);
        debug_assert!(entries < MAX_PRDT_ENTRIES, "PRDT overflow");
        let mut entry = PrdtEntry::new_zeroed();
        entry.base_addr = U64::new(addr);
        entry.byte_count = U32::new((chunk - 1) as u32);
        dma.write(table + entries * PRDT_ENTRY_SIZE, entry);
        addr += chunk as u64;
        left -= chunk;
        entries += 1;
    }
    entries as u16
}
