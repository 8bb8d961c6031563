//! NVMe driver errors.

/// Errors returned by the NVMe controller driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use]
pub enum NvmeError {
    /// The controller completed a command with a nonzero status.
    Device,
    /// A request argument was rejected before being issued.
    InvalidParameter,
    /// The addressed namespace is not attached.
    NoNamespace,
    /// A controller response or data structure was malformed.
    Protocol,
    /// An operation did not complete in time.
    Timeout,
    /// The controller lacks a capability the driver needs.
    Unsupported,
    /// Not enough DMA memory to set up the controller.
    OutOfMemory,
}

impl NvmeError {
    /// Returns a static description of the error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device error",
            Self::InvalidParameter => "invalid parameter",
            Self::NoNamespace => "no such namespace",
            Self::Protocol => "protocol error",
            Self::Timeout => "timed out",
            Self::Unsupported => "not supported",
            Self::OutOfMemory => "out of DMA memory",
        }
    }
}

impl core::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for NVMe driver operations.
pub type NvmeResult<T> = Result<T, NvmeError>;
