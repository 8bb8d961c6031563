//! Memory barriers for ordering CPU accesses against device DMA.
//!
//! Descriptor memory is written by the CPU and consumed by the controller
//! (and vice versa) without any cache maintenance, so the only ordering
//! guarantees are the ones established here. Submission paths publish
//! descriptors with [`write_barrier`] before ringing a doorbell; completion
//! paths acquire entries with [`read_barrier`] after observing a status
//! update.

use core::sync::atomic::{Ordering, fence};

/// Read barrier.
///
/// Ensures all reads before this call complete before any reads after it.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier.
///
/// Ensures all writes before this call complete before any writes after it.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Full memory barrier.
///
/// Ensures all memory accesses before this call complete before any after it.
#[inline]
pub fn full_barrier() {
    fence(Ordering::SeqCst);
}
