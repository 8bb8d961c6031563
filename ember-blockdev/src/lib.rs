//! Block device interface.
//!
//! Storage drivers expose each logical unit or namespace through the
//! [`BlockDevice`] trait. Transfers are described in whole logical blocks
//! and carried in DMA-visible buffers, since the controllers move the data
//! themselves. Devices that can report wear and run self-tests also
//! implement [`DeviceHealth`].
//!
//! # Modules
//!
//! - [`health`]: Device health reporting and self-test control.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod health;

pub use health::{DeviceHealth, SelfTestAction, SelfTestSupport};

use ember_pal::DmaBuffer;

/// A device addressed in fixed-size logical blocks.
pub trait BlockDevice {
    /// Error type returned by transfers.
    type Error: core::fmt::Debug + core::fmt::Display;

    /// Returns the logical block size in bytes.
    fn block_size(&self) -> u32;

    /// Returns the total number of logical blocks.
    fn block_count(&self) -> u64;

    /// Reads `count` blocks starting at `lba` into `buf`.
    ///
    /// Returns the number of blocks transferred, which on full success is
    /// always `count`. A driver that splits the request and fails partway
    /// may report the blocks that did transfer as a smaller `Ok` value;
    /// an error means nothing is known to have transferred.
    fn read_blocks(
        &mut self,
        lba: u64,
        count: u64,
        buf: &mut DmaBuffer,
    ) -> Result<u64, Self::Error>;

    /// Writes `count` blocks starting at `lba` from `buf`.
    ///
    /// Returns the number of blocks transferred, with the same partial
    /// progress rules as [`read_blocks`](Self::read_blocks).
    fn write_blocks(&mut self, lba: u64, count: u64, buf: &DmaBuffer) -> Result<u64, Self::Error>;
}

/// Returns true if `count` blocks starting at `lba` lie within a device of
/// `capacity` blocks.
#[must_use]
pub fn transfer_in_bounds(lba: u64, count: u64, capacity: u64) -> bool {
    lba < capacity && count <= capacity - lba
}

/// Validates a transfer request against device geometry and buffer size.
///
/// Drivers call this at their entry points before splitting the request
/// into controller commands. Returns false, after logging the reason, when
/// the request cannot be issued.
#[must_use]
pub fn check_transfer(lba: u64, count: u64, capacity: u64, block_size: u32, buf_len: usize) -> bool {
    if !transfer_in_bounds(lba, count, capacity) {
        log::warn!(
            "check_transfer: {} blocks at {} exceed capacity {}",
            count,
            lba,
            capacity
        );
        return false;
    }
    match count.checked_mul(u64::from(block_size)) {
        Some(bytes) if bytes <= buf_len as u64 => true,
        _ => {
            log::warn!(
                "check_transfer: buffer of {} bytes too small for {} blocks of {}",
                buf_len,
                count,
                block_size
            );
            false
        }
    }
}
