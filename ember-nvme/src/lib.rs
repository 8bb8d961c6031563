//! Polled NVMe controller driver.
//!
//! This crate drives an NVM Express 1.x controller over its register
//! window, from reset through namespace discovery to block transfers and
//! health log reads. It is built for boot environments: no interrupts, no
//! allocation beyond a caller-provided DMA region, completions polled on
//! a single IO queue pair.
//!
//! # Modules
//!
//! - [`ctlr`]: The [`NvmeCtlr`] driver and its [`NvmeBlockDev`] block
//!   device handles.
//! - [`cmd`]: Submission and completion entry layouts and command
//!   builders.
//! - [`error`]: The [`NvmeError`] type shared by the whole crate.
//! - [`identify`]: Identify structure and log page layouts.
//! - [`prp`]: Physical region page data pointers and list construction.
//! - [`regs`]: Controller register offsets and bit assignments.
//!
//! # Example
//!
//! ```ignore
//! use ember_blockdev::BlockDevice;
//! use ember_nvme::NvmeCtlr;
//!
//! let mut ctlr = NvmeCtlr::new(bus, clock, &mut dma)?;
//! ctlr.setup()?;
//! log::info!("nvme: {} namespaces", ctlr.namespace_count());
//!
//! let mut disk = ctlr.block_dev(1)?;
//! disk.read_blocks(0, 1, &mut buf)?;
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cmd;
pub mod ctlr;
pub mod error;
pub mod identify;
pub mod prp;
pub mod regs;

pub use ctlr::{ControllerInfo, NvmeBlockDev, NvmeCtlr, StaticNamespace, DMA_SIZE, MAX_NAMESPACES};
pub use error::{NvmeError, NvmeResult};
pub use identify::{SelfTestLog, SelfTestResult, SmartLog};
