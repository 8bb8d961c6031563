//! Platform abstractions for the storage drivers.
//!
//! The drivers never talk to the platform directly. Time comes in through
//! the [`Clock`] trait, and DMA-visible memory comes in as a pre-mapped
//! [`DmaRegion`] the platform carved out at boot. Keeping both behind
//! small interfaces lets the same driver code run on hardware and against
//! software device models in tests.
//!
//! # Modules
//!
//! - [`clock`]: The [`Clock`] time source trait and [`Deadline`] timeouts.
//! - [`dma`]: Watermark allocation of device-visible memory.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod dma;

pub use clock::{Clock, Deadline};
pub use dma::{DmaBuffer, DmaRegion};
