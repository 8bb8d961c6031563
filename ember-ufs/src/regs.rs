//! UFS host controller register map (JESD223D).
//!
//! Offsets are relative to the controller's register window. Only the
//! registers this driver touches are listed; the interrupt enable register
//! is included so platforms can mask everything before handing over the
//! controller.

/// Controller Capabilities.
pub const CAP: usize = 0x00;
/// Interrupt Status. Bits are write-one-to-clear.
pub const IS: usize = 0x20;
/// Interrupt Enable.
pub const IE: usize = 0x24;
/// Host Controller Status.
pub const HCS: usize = 0x30;
/// Host Controller Enable.
pub const HCE: usize = 0x34;
/// Host UIC Error Code PHY Adapter Layer.
pub const UECPA: usize = 0x38;
/// Host UIC Error Code Data Link Layer.
pub const UECDL: usize = 0x3c;
/// Host UIC Error Code Network Layer.
pub const UECN: usize = 0x40;
/// Host UIC Error Code Transport Layer.
pub const UECT: usize = 0x44;
/// Host UIC Error Code DME.
pub const UECDME: usize = 0x48;
/// UTP Transfer Request List Base Address (lower 32 bits).
pub const UTRLBA: usize = 0x50;
/// UTP Transfer Request List Base Address (upper 32 bits).
pub const UTRLBAU: usize = 0x54;
/// UTP Transfer Request List Door Bell Register. One bit per slot.
pub const UTRLDBR: usize = 0x58;
/// UTP Transfer Request List Clear Register. Write zero to clear a slot.
pub const UTRLCLR: usize = 0x5c;
/// UTP Transfer Request List Run Stop Register.
pub const UTRLRSR: usize = 0x60;
/// UIC Command.
pub const UICCMD: usize = 0x90;
/// UIC Command Argument 1.
pub const UICCMDARG1: usize = 0x94;
/// UIC Command Argument 2.
pub const UICCMDARG2: usize = 0x98;
/// UIC Command Argument 3.
pub const UICCMDARG3: usize = 0x9c;

/// Interrupt Status register bits.
pub mod is {
    /// UTP Transfer Request Completion Status.
    pub const UTRCS: u32 = 1 << 0;
    /// UIC Error.
    pub const UE: u32 = 1 << 2;
    /// UIC Power Mode Status.
    pub const UPMS: u32 = 1 << 4;
    /// UIC Link Lost Status.
    pub const ULLS: u32 = 1 << 7;
    /// UIC Link Startup Status.
    pub const ULSS: u32 = 1 << 8;
    /// UIC Command Completion Status.
    pub const UCCS: u32 = 1 << 10;
    /// Device Fatal Error Status.
    pub const DFES: u32 = 1 << 11;
    /// Host Controller Fatal Error Status.
    pub const HCFES: u32 = 1 << 16;
    /// System Bus Fatal Error Status.
    pub const SBFES: u32 = 1 << 17;

    /// Errors the driver cannot recover from.
    pub const FATAL: u32 = ULLS | DFES | HCFES | SBFES;
    /// Every error condition the driver watches while polling.
    pub const ALL_ERROR: u32 = UE | FATAL;
}

/// Host Controller Status register bits.
pub mod hcs {
    /// Device Present.
    pub const DP: u32 = 1 << 0;
    /// UIC Command Ready.
    pub const UCRDY: u32 = 1 << 3;

    /// UIC Power Mode Change Request Status field shift.
    pub const UPMCRS_SHIFT: u32 = 8;
    /// UIC Power Mode Change Request Status field mask.
    pub const UPMCRS_MASK: u32 = 0x7;
    /// Power mode change completed locally.
    pub const UPMCRS_PWR_LOCAL: u32 = 1;

    /// Extracts the power mode change status from a HCS value.
    #[inline]
    #[must_use]
    pub const fn upmcrs(hcs: u32) -> u32 {
        (hcs >> UPMCRS_SHIFT) & UPMCRS_MASK
    }
}

/// Data Link Layer error code bits.
pub mod uecdl {
    /// PA_INIT error, reported when link startup fails mid-sequence.
    pub const PA_INIT_ERROR: u32 = 1 << 13;
}
