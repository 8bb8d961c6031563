//! UIC layer definitions: DME commands, UniPro attributes and transfer
//! modes.
//!
//! DME commands are issued through the UICCMD register block and address
//! UniPro MIB attributes, either on the local PHY adapter or on the peer
//! (the device side of the link) for the `PEER_*` variants.

/// DME command opcodes written to the UICCMD register.
pub mod dme {
    /// Read a local MIB attribute.
    pub const GET: u32 = 0x01;
    /// Write a local MIB attribute.
    pub const SET: u32 = 0x02;
    /// Read a peer MIB attribute.
    pub const PEER_GET: u32 = 0x03;
    /// Write a peer MIB attribute.
    pub const PEER_SET: u32 = 0x04;
    /// Start the UniPro link.
    pub const LINK_STARTUP: u32 = 0x16;
}

/// PHY adapter layer MIB attribute identifiers.
pub mod pa {
    /// Number of active transmit data lanes.
    pub const ACTIVE_TX_DATA_LANES: u32 = 0x1560;
    /// Number of connected transmit data lanes.
    pub const CONNECTED_TX_DATA_LANES: u32 = 0x1561;
    /// Transmit gear.
    pub const TX_GEAR: u32 = 0x1568;
    /// Transmit termination enable.
    pub const TX_TERMINATION: u32 = 0x1569;
    /// High speed series (A or B).
    pub const HS_SERIES: u32 = 0x156a;
    /// Power mode change request.
    pub const PWR_MODE: u32 = 0x1571;
    /// Number of active receive data lanes.
    pub const ACTIVE_RX_DATA_LANES: u32 = 0x1580;
    /// Number of connected receive data lanes.
    pub const CONNECTED_RX_DATA_LANES: u32 = 0x1581;
    /// Receive gear.
    pub const RX_GEAR: u32 = 0x1583;
    /// Receive termination enable.
    pub const RX_TERMINATION: u32 = 0x1584;
    /// Maximum receive gear in PWM mode.
    pub const MAX_RX_PWM_GEAR: u32 = 0x1586;
    /// Maximum receive gear in high speed mode.
    pub const MAX_RX_HS_GEAR: u32 = 0x1587;
    /// UniPro version of the peer, as seen by the local PA layer.
    pub const REMOTE_VER_INFO: u32 = 0x15a0;
    /// UniPro version of the local PA layer.
    pub const LOCAL_VER_INFO: u32 = 0x15a9;

    /// Power mode user data attribute `index` (0 to 5).
    #[inline]
    #[must_use]
    pub const fn pwr_mode_user_data(index: u32) -> u32 {
        0x15b0 + index
    }
}

/// DME local layer timer attribute identifiers.
pub mod dl {
    /// FC0 protection timeout value.
    pub const FC0_PROT_TIMEOUT: u32 = 0xd041;
    /// TC0 replay timeout value.
    pub const TC0_REPLAY_TIMEOUT: u32 = 0xd042;
    /// AFC0 request timeout value.
    pub const AFC0_REQ_TIMEOUT: u32 = 0xd043;
}

/// Data link layer timer values programmed during a power mode change.
pub mod timer {
    /// FC0 protection timeout, in link time units.
    pub const FC0_PROT_TIMEOUT: u32 = 8191;
    /// TC0 replay timeout, in link time units.
    pub const TC0_REPLAY_TIMEOUT: u32 = 65535;
    /// AFC0 request timeout, in link time units.
    pub const AFC0_REQ_TIMEOUT: u32 = 32767;
}

/// UniPro version field values carried in the `*_VER_INFO` attributes.
pub mod ver {
    /// Mask for the minor version field.
    pub const MASK: u32 = 0xf;
    /// UniPro 1.8.
    pub const UNIPRO_1_8: u32 = 5;
}

/// Encodes a MIB attribute and gen selector into UICCMDARG1.
#[inline]
#[must_use]
pub const fn mib_attr_sel(id: u32, selector: u32) -> u32 {
    (id << 16) | (selector & 0xffff)
}

/// Encodes an attribute set type into UICCMDARG2.
#[inline]
#[must_use]
pub const fn attr_set_type(set_type: u32) -> u32 {
    (set_type & 0xff) << 16
}

/// Normal attribute set type: write the attribute value itself.
pub const ATTR_SET_NORMAL: u32 = 0;

/// Result code mask in UICCMDARG2 after a DME command completes.
pub const RESULT_MASK: u32 = 0xff;

/// Power modes requested through the `PA_PWR_MODE` attribute. The request
/// value carries the receive mode in the high nibble and the transmit mode
/// in the low nibble.
pub mod power_mode {
    /// High speed.
    pub const FAST: u32 = 1;
    /// PWM.
    pub const SLOW: u32 = 2;
    /// High speed with automatic power saving.
    pub const FAST_AUTO: u32 = 4;
    /// PWM with automatic power saving.
    pub const SLOW_AUTO: u32 = 5;
}

/// High speed rate series.
pub mod hs_series {
    /// Rate A.
    pub const A: u32 = 1;
    /// Rate B.
    pub const B: u32 = 2;
}

/// Returns true if `mode` uses the high speed PHY.
#[inline]
#[must_use]
pub const fn is_fast_mode(mode: u32) -> bool {
    mode == power_mode::FAST || mode == power_mode::FAST_AUTO
}

/// Settings for one direction of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GearSettings {
    /// Requested power mode, one of [`power_mode`].
    pub power_mode: u32,
    /// Number of data lanes to activate.
    pub lanes: u32,
    /// Gear to run the lanes at.
    pub gear: u32,
}

/// A negotiated transfer mode for both directions of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferMode {
    /// High speed rate series, one of [`hs_series`].
    pub hs_series: u32,
    /// Receive direction settings.
    pub rx: GearSettings,
    /// Transmit direction settings.
    pub tx: GearSettings,
}

impl TransferMode {
    /// Returns the `PA_PWR_MODE` request value for this mode.
    #[inline]
    #[must_use]
    pub const fn pwr_mode_request(&self) -> u32 {
        (self.rx.power_mode << 4) | self.tx.power_mode
    }

    /// Returns true if either direction uses the high speed PHY.
    #[inline]
    #[must_use]
    pub const fn any_fast(&self) -> bool {
        is_fast_mode(self.rx.power_mode) || is_fast_mode(self.tx.power_mode)
    }

    /// Returns this mode with both directions switched to automatic high
    /// speed, keeping gears and lanes unchanged.
    #[must_use]
    pub const fn as_fast_auto(&self) -> Self {
        let mut mode = *self;
        mode.rx.power_mode = power_mode::FAST_AUTO;
        mode.tx.power_mode = power_mode::FAST_AUTO;
        mode
    }
}
