//! Register access for memory-mapped devices.
//!
//! Drivers are generic over [`MmioBus`] so that the same command sequencing
//! runs against a directly mapped register window ([`MmioRegion`]) or a
//! software model of the device in tests.

use core::fmt;

/// Volatile 32-bit register access to a device window.
///
/// Offsets are in bytes, relative to the start of the window, and must be
/// 4-byte aligned. Implementations must issue each access exactly as
/// requested; the sequencing of controller bring-up depends on it.
pub trait MmioBus {
    /// Reads the 32-bit register at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Writes the 32-bit register at `offset`.
    fn write32(&self, offset: usize, value: u32);

    /// Reads a 64-bit register as two 32-bit accesses, low word first.
    fn read64_pair(&self, offset: usize) -> u64 {
        let lo = u64::from(self.read32(offset));
        let hi = u64::from(self.read32(offset + 4));
        (hi << 32) | lo
    }

    /// Writes a 64-bit register as two 32-bit accesses, low word first.
    fn write64_pair(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// A memory-mapped I/O region with volatile register accessors.
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Creates a new MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `base` is a valid MMIO base address
    /// mapped with device memory attributes, and that the region of `size`
    /// bytes starting at `base` is valid for volatile reads and writes.
    #[must_use]
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the base address of the region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Returns the size of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl MmioBus for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size, "MMIO read out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO read not aligned");
        // SAFETY: Caller of `new` ensured base is valid MMIO, offset is
        // within bounds.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size, "MMIO write out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO write not aligned");
        // SAFETY: Caller of `new` ensured base is valid MMIO, offset is
        // within bounds.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    #[test]
    fn region_read_write() {
        let mut backing = [0u32; 8];
        let base = backing.as_mut_ptr() as usize;
        // SAFETY: `backing` outlives the region and is valid for volatile
        // access.
        let region = unsafe { MmioRegion::new(base, 32) };

        region.write32(0, 0xdead_beef);
        region.write32(4, 0x1234_5678);
        assert_eq!(region.read32(0), 0xdead_beef);
        assert_eq!(region.read32(4), 0x1234_5678);
        assert_eq!(backing[1], 0x1234_5678);
    }

    #[test]
    fn region_pair_access() {
        let mut backing = [0u32; 4];
        let base = backing.as_mut_ptr() as usize;
        // SAFETY: `backing` outlives the region and is valid for volatile
        // access.
        let region = unsafe { MmioRegion::new(base, 16) };

        region.write64_pair(8, 0x1122_3344_5566_7788);
        assert_eq!(backing[2], 0x5566_7788);
        assert_eq!(backing[3], 0x1122_3344);
        assert_eq!(region.read64_pair(8), 0x1122_3344_5566_7788);
    }

    /// Records the order of 32-bit accesses behind the pair helpers.
    struct OrderedBus {
        ops: RefCell<[(usize, u32); 4]>,
        count: RefCell<usize>,
    }

    impl MmioBus for OrderedBus {
        fn read32(&self, offset: usize) -> u32 {
            let mut count = self.count.borrow_mut();
            self.ops.borrow_mut()[*count] = (offset, 0);
            *count += 1;
            0
        }

        fn write32(&self, offset: usize, value: u32) {
            let mut count = self.count.borrow_mut();
            self.ops.borrow_mut()[*count] = (offset, value);
            *count += 1;
        }
    }

    #[test]
    fn pair_write_is_low_word_first() {
        let bus = OrderedBus {
            ops: RefCell::new([(0, 0); 4]),
            count: RefCell::new(0),
        };
        bus.write64_pair(0x28, 0xaabb_ccdd_0011_2233);
        let ops = bus.ops.borrow();
        assert_eq!(ops[0], (0x28, 0x0011_2233));
        assert_eq!(ops[1], (0x2c, 0xaabb_ccdd));
    }
}
