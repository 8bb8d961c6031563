//! Memory-mapped I/O primitives for device drivers.
//!
//! This crate provides the low-level building blocks shared by the storage
//! host controller drivers: volatile register access, memory barriers, and
//! DMA descriptor rings.
//!
//! # Modules
//!
//! - [`barrier`]: Memory barriers ordering CPU accesses against device DMA.
//! - [`queue`]: Generic submission and completion rings for DMA-based
//!   command interfaces.
//! - [`region`]: The [`MmioBus`] register access trait and its
//!   [`MmioRegion`] implementation for directly mapped device windows.
//!
//! # Example
//!
//! ```ignore
//! use ember_mmio::{MmioBus, MmioRegion};
//!
//! // SAFETY: 0x4000_0000 is a valid device register window.
//! let regs = unsafe { MmioRegion::new(0x4000_0000, 0x100) };
//! let version = regs.read32(0x08);
//! regs.write32(0x20, 0xffff_ffff);
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod queue;
pub mod region;

pub use queue::{CompletionQueue, QueueEntry, SubmissionQueue};
pub use region::{MmioBus, MmioRegion};
