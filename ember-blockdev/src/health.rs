//! Device health reporting and self-test control.

/// A self-test action to request from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelfTestAction {
    /// Start a short self-test.
    Short,
    /// Start an extended self-test.
    Extended,
    /// Abort the self-test in progress.
    Abort,
}

/// The self-test operations a device supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelfTestSupport {
    /// Short self-tests can be started.
    pub short_test: bool,
    /// Extended self-tests can be started.
    pub extended_test: bool,
}

impl SelfTestSupport {
    /// Returns true if any self-test can be started.
    #[inline]
    #[must_use]
    pub const fn any(&self) -> bool {
        self.short_test || self.extended_test
    }
}

/// Health reporting for devices that track their own wear and can run
/// self-tests.
///
/// The log formats are device specific; callers get the raw log page and
/// are expected to know the device class they are talking to.
pub trait DeviceHealth {
    /// Error type returned by health operations.
    type Error: core::fmt::Debug + core::fmt::Display;

    /// Reads the device health log into `out`.
    ///
    /// `out` must be exactly the size of the device's health log page.
    fn health_info(&mut self, out: &mut [u8]) -> Result<(), Self::Error>;

    /// Reads the self-test result log into `out`.
    ///
    /// `out` must be exactly the size of the device's self-test log page.
    fn self_test_log(&mut self, out: &mut [u8]) -> Result<(), Self::Error>;

    /// Starts or aborts a device self-test.
    fn self_test_control(&mut self, action: SelfTestAction) -> Result<(), Self::Error>;

    /// Reports which self-test operations the device supports.
    fn self_test_support(&self) -> SelfTestSupport;
}
