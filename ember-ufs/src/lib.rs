//! Polled UFS host controller driver.
//!
//! This crate drives a JESD223D host controller attached to a JESD220E
//! device, from controller reset to READ(10)/WRITE(10) block transfers.
//! It is built for boot environments: no interrupts, no allocation beyond
//! a caller-provided DMA region, one request in flight at a time.
//!
//! # Modules
//!
//! - [`ctlr`]: The [`UfsCtlr`] driver and its [`UfsBlockDev`] block device
//!   handles.
//! - [`desc`]: Device and unit descriptor layouts and well-known
//!   descriptor, attribute and flag identifiers.
//! - [`error`]: The [`UfsError`] type shared by the whole crate.
//! - [`regs`]: Host controller register offsets and bit assignments.
//! - [`scsi`]: The small command subset the driver issues and sense data
//!   decoding.
//! - [`uic`]: UniPro access primitives, MIB attribute identifiers and
//!   transfer mode descriptions.
//! - [`upiu`]: UFS protocol information unit layouts.
//! - [`utp`]: Transfer request descriptor and PRDT layouts plus the DMA
//!   area map.
//!
//! # Example
//!
//! ```ignore
//! use ember_blockdev::BlockDevice;
//! use ember_ufs::{UfsConfig, UfsCtlr};
//!
//! let mut ctlr = UfsCtlr::new(bus, clock, &mut dma, UfsConfig::default())?;
//! ctlr.setup_retry()?;
//! let luns = ctlr.scan()?;
//! log::info!("ufs: {} logical units", luns);
//!
//! let mut disk = ctlr.block_dev(0)?;
//! disk.read_blocks(0, 1, &mut buf)?;
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod ctlr;
pub mod desc;
pub mod error;
pub mod regs;
pub mod scsi;
pub mod uic;
pub mod upiu;
pub mod utp;

pub use ctlr::{NoHooks, UfsBlockDev, UfsConfig, UfsCtlr, UfsHooks, MAX_LUNS};
pub use desc::RefClkFreq;
pub use error::{UfsError, UfsResult};
pub use uic::{GearSettings, TransferMode};
