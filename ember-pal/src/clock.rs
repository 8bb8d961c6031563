//! Time source and timeout tracking.

/// A monotonic microsecond time source.
///
/// Controller bring-up is full of bounded waits, and the drivers express
/// all of them through this trait so tests can substitute a synthetic
/// clock.
pub trait Clock {
    /// Returns the current time in microseconds.
    ///
    /// The value must be monotonic; the absolute epoch does not matter.
    fn now_us(&self) -> u64;

    /// Busy-waits for at least `us` microseconds.
    fn delay_us(&self, us: u64);

    /// Busy-waits for at least `ms` milliseconds.
    fn delay_ms(&self, ms: u64) {
        self.delay_us(ms.saturating_mul(1000));
    }
}

/// A point in time after which an operation has timed out.
///
/// Poll loops snapshot [`Deadline::expired`] *before* sampling the
/// condition, so that a condition which became true while the CPU was
/// descheduled still counts as success:
///
/// ```ignore
/// let deadline = Deadline::after_ms(&clock, 100);
/// loop {
///     let timed_out = deadline.expired(&clock);
///     if ready() {
///         break;
///     }
///     if timed_out {
///         return Err(Error::Timeout);
///     }
/// }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    expires_at: u64,
}

impl Deadline {
    /// Returns a deadline `us` microseconds from now.
    #[must_use]
    pub fn after_us<C: Clock + ?Sized>(clock: &C, us: u64) -> Self {
        Self {
            expires_at: clock.now_us().saturating_add(us),
        }
    }

    /// Returns a deadline `ms` milliseconds from now.
    #[must_use]
    pub fn after_ms<C: Clock + ?Sized>(clock: &C, ms: u64) -> Self {
        Self::after_us(clock, ms.saturating_mul(1000))
    }

    /// Returns true once the deadline has passed.
    #[must_use]
    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now_us() > self.expires_at
    }
}
