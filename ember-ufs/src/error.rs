//! UFS driver errors.

/// Errors returned by the UFS host controller driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use]
pub enum UfsError {
    /// The controller or device reported a failure.
    Io,
    /// The device reported SCSI BUSY status.
    Busy,
    /// A request argument was rejected before being issued.
    InvalidParameter,
    /// A response violated the transport protocol.
    Protocol,
    /// An operation did not complete in time.
    Timeout,
    /// The device reported a unit attention condition.
    UnitAttention,
    /// The addressed logical unit is not enabled.
    LunDisabled,
    /// Not enough DMA memory to set up the controller.
    OutOfMemory,
}

impl UfsError {
    /// Returns a static description of the error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Io => "I/O error",
            Self::Busy => "device busy",
            Self::InvalidParameter => "invalid parameter",
            Self::Protocol => "protocol error",
            Self::Timeout => "timed out",
            Self::UnitAttention => "unit attention",
            Self::LunDisabled => "logical unit disabled",
            Self::OutOfMemory => "out of DMA memory",
        }
    }
}

impl core::fmt::Display for UfsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for UFS driver operations.
pub type UfsResult<T> = Result<T, UfsError>;
