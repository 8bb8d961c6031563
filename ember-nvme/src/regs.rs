//! NVMe controller register map (NVM Express 1.0e).
//!
//! Offsets are relative to the controller's register window. Only the
//! registers this driver touches are listed; the interrupt mask set
//! register is included so platforms can mask everything before handing
//! over the controller.

/// Controller Capabilities. 64 bits.
pub const CAP: usize = 0x00;
/// Version.
pub const VS: usize = 0x08;
/// Interrupt Mask Set. Writing one masks the corresponding vector.
pub const INTMS: usize = 0x0c;
/// Controller Configuration.
pub const CC: usize = 0x14;
/// Controller Status.
pub const CSTS: usize = 0x1c;
/// Admin Queue Attributes.
pub const AQA: usize = 0x24;
/// Admin Submission Queue Base Address. 64 bits.
pub const ASQ: usize = 0x28;
/// Admin Completion Queue Base Address. 64 bits.
pub const ACQ: usize = 0x30;
/// First doorbell register. The rest follow at the stride from CAP.DSTRD.
pub const DOORBELL_BASE: usize = 0x1000;

/// Controller Capabilities fields.
pub mod cap {
    /// NVM command set bit within the CSS field.
    pub const CSS_NVM: u64 = 1 << 0;

    /// Maximum Queue Entries Supported, zero based.
    #[inline]
    #[must_use]
    pub const fn mqes(cap: u64) -> u32 {
        (cap & 0xffff) as u32
    }

    /// Worst-case enable or disable latency in milliseconds.
    ///
    /// CAP.TO counts in 500 ms units.
    #[inline]
    #[must_use]
    pub const fn to_ms(cap: u64) -> u64 {
        ((cap >> 24) & 0xff) * 500
    }

    /// Distance between consecutive doorbell registers in bytes.
    #[inline]
    #[must_use]
    pub const fn dstrd_bytes(cap: u64) -> usize {
        4 << ((cap >> 32) & 0xf)
    }

    /// Command Sets Supported field.
    #[inline]
    #[must_use]
    pub const fn css(cap: u64) -> u64 {
        (cap >> 37) & 0xff
    }

    /// Minimum Memory Page Size field. Zero means 4 KiB pages.
    #[inline]
    #[must_use]
    pub const fn mpsmin(cap: u64) -> u64 {
        (cap >> 48) & 0xf
    }
}

/// Controller Configuration register bits.
pub mod cc {
    /// Enable.
    pub const EN: u32 = 1 << 0;
    /// Shutdown Notification field mask.
    pub const SHN_MASK: u32 = 0x3 << 14;
    /// Normal shutdown notification.
    pub const SHN_NORMAL: u32 = 0x1 << 14;
    /// Abrupt shutdown notification.
    pub const SHN_ABRUPT: u32 = 0x2 << 14;
    /// IO Submission Queue Entry Size field shift. Log2 of the entry size.
    pub const IOSQES_SHIFT: u32 = 16;
    /// IO Completion Queue Entry Size field shift. Log2 of the entry size.
    pub const IOCQES_SHIFT: u32 = 20;
}

/// Controller Status register bits.
pub mod csts {
    /// Ready.
    pub const RDY: u32 = 1 << 0;
    /// Controller Fatal Status.
    pub const CFS: u32 = 1 << 1;
    /// Shutdown Status field mask.
    pub const SHST_MASK: u32 = 0x3 << 2;
    /// Shutdown processing complete.
    pub const SHST_COMPLETE: u32 = 0x2 << 2;
}

/// Returns the offset of the tail doorbell for submission queue `qid`.
#[inline]
#[must_use]
pub const fn sq_doorbell(qid: u16, stride: usize) -> usize {
    DOORBELL_BASE + 2 * qid as usize * stride
}

/// Returns the offset of the head doorbell for completion queue `qid`.
#[inline]
#[must_use]
pub const fn cq_doorbell(qid: u16, stride: usize) -> usize {
    DOORBELL_BASE + (2 * qid as usize + 1) * stride
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_fields_decode() {
        // MQES 63, TO 3, DSTRD 1, CSS NVM, MPSMIN 0.
        let value = 63 | (3 << 24) | (1 << 32) | (1 << 37);
        assert_eq!(cap::mqes(value), 63);
        assert_eq!(cap::to_ms(value), 1500);
        assert_eq!(cap::dstrd_bytes(value), 8);
        assert_eq!(cap::css(value) & cap::CSS_NVM, cap::CSS_NVM);
        assert_eq!(cap::mpsmin(value), 0);
    }

    #[test]
    fn doorbell_offsets_follow_stride() {
        assert_eq!(sq_doorbell(0, 4), 0x1000);
        assert_eq!(cq_doorbell(0, 4), 0x1004);
        assert_eq!(sq_doorbell(1, 4), 0x1008);
        assert_eq!(cq_doorbell(1, 4), 0x100c);
        assert_eq!(sq_doorbell(1, 8), 0x1010);
        assert_eq!(cq_doorbell(1, 8), 0x1018);
    }
}
