//! Device-visible memory.
//!
//! The platform hands each driver one contiguous, cache-coherent region up
//! front. [`DmaRegion`] carves it into buffers with a simple watermark
//! allocator; nothing is ever freed, which matches how the drivers use it:
//! every buffer is carved once at controller setup and lives until
//! shutdown.

use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A contiguous region of DMA-coherent memory to carve buffers from.
pub struct DmaRegion {
    base: usize,
    bus_addr: u64,
    size: usize,
    offset: usize,
}

impl DmaRegion {
    /// Creates a region over pre-mapped DMA memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `size` bytes starting at `base` are
    /// valid for reads and writes for the lifetime of the region and of
    /// every buffer carved from it, that the memory is coherent between
    /// the CPU and the device, and that `bus_addr` is the device-visible
    /// address of the same memory.
    #[must_use]
    pub const unsafe fn new(base: usize, bus_addr: u64, size: usize) -> Self {
        Self {
            base,
            bus_addr,
            size,
            offset: 0,
        }
    }

    /// Returns the number of bytes still available for carving.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.size - self.offset
    }

    /// Carves a buffer of `len` bytes aligned to `align`.
    ///
    /// `align` must be a power of two. Returns `None` once the region is
    /// exhausted; carved memory is never returned to the region.
    pub fn alloc(&mut self, len: usize, align: usize) -> Option<DmaBuffer> {
        debug_assert!(align.is_power_of_two(), "DMA alignment not a power of two");
        let start = self.offset.checked_next_multiple_of(align)?;
        let end = start.checked_add(len)?;
        if end > self.size {
            return None;
        }
        self.offset = end;
        Some(DmaBuffer {
            base: self.base + start,
            bus_addr: self.bus_addr + start as u64,
            len,
        })
    }
}

/// A buffer of DMA-coherent memory carved from a [`DmaRegion`].
///
/// All accesses are volatile: the device may read or write the memory at
/// any time, so the compiler must not cache or elide them.
pub struct DmaBuffer {
    base: usize,
    bus_addr: u64,
    len: usize,
}

impl DmaBuffer {
    /// Returns the CPU address of the buffer.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Returns the device-visible address of the buffer.
    #[inline]
    #[must_use]
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Returns the length of the buffer in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer has length zero.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes a plain-data value at `offset`.
    #[inline]
    pub fn write<T: IntoBytes + Immutable>(&mut self, offset: usize, value: T) {
        debug_assert!(offset + size_of::<T>() <= self.len, "DMA write out of bounds");
        debug_assert!(
            (self.base + offset).is_multiple_of(align_of::<T>()),
            "DMA write not aligned"
        );
        // SAFETY: Caller of `DmaRegion::new` ensured the memory is valid;
        // offset is within bounds and the pointer is aligned for T.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut T, value) }
    }

    /// Reads a plain-data value at `offset`.
    #[inline]
    #[must_use]
    pub fn read<T: FromBytes>(&self, offset: usize) -> T {
        debug_assert!(offset + size_of::<T>() <= self.len, "DMA read out of bounds");
        debug_assert!(
            (self.base + offset).is_multiple_of(align_of::<T>()),
            "DMA read not aligned"
        );
        // SAFETY: Caller of `DmaRegion::new` ensured the memory is valid;
        // offset is within bounds, the pointer is aligned for T, and
        // `FromBytes` makes every bit pattern a valid T.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const T) }
    }

    /// Fills `len` bytes starting at `offset` with `value`.
    pub fn fill(&mut self, offset: usize, len: usize, value: u8) {
        debug_assert!(offset + len <= self.len, "DMA fill out of bounds");
        for i in 0..len {
            // SAFETY: Caller of `DmaRegion::new` ensured the memory is
            // valid; offset + i is within bounds.
            unsafe { core::ptr::write_volatile((self.base + offset + i) as *mut u8, value) }
        }
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len, "DMA write out of bounds");
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: Caller of `DmaRegion::new` ensured the memory is
            // valid; offset + i is within bounds.
            unsafe { core::ptr::write_volatile((self.base + offset + i) as *mut u8, *byte) }
        }
    }

    /// Copies bytes out of the buffer at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len, "DMA read out of bounds");
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: Caller of `DmaRegion::new` ensured the memory is
            // valid; offset + i is within bounds.
            *byte = unsafe { core::ptr::read_volatile((self.base + offset + i) as *const u8) };
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::boxed::Box;
    use zerocopy::byteorder::{LittleEndian, U32};

    #[repr(align(4096))]
    struct Backing([u8; 64 * 1024]);

    fn region() -> DmaRegion {
        let backing: &'static mut Backing = Box::leak(Box::new(Backing([0; 64 * 1024])));
        let base = backing.0.as_mut_ptr() as usize;
        // SAFETY: The leaked backing store is valid for the rest of the
        // test process; tests treat the CPU address as the bus address.
        unsafe { DmaRegion::new(base, base as u64, 64 * 1024) }
    }

    #[test]
    fn alloc_respects_alignment() {
        let mut region = region();
        let a = region.alloc(10, 4).unwrap();
        let b = region.alloc(100, 1024).unwrap();
        let c = region.alloc(4096, 4096).unwrap();

        assert!(a.bus_addr().is_multiple_of(4));
        assert!(b.bus_addr().is_multiple_of(1024));
        assert!(c.bus_addr().is_multiple_of(4096));
        assert!(b.bus_addr() >= a.bus_addr() + 10);
        assert!(c.bus_addr() >= b.bus_addr() + 100);
    }

    #[test]
    fn alloc_exhausts() {
        let mut region = region();
        assert!(region.alloc(60 * 1024, 4096).is_some());
        assert!(region.alloc(8 * 1024, 4096).is_none());
        // A smaller carve still fits in the tail.
        assert!(region.alloc(1024, 1024).is_some());
        assert!(region.remaining() < 4 * 1024);
    }

    #[test]
    fn typed_access_round_trips() {
        let mut region = region();
        let mut buf = region.alloc(64, 8).unwrap();

        buf.write(0, U32::<LittleEndian>::new(0xaabb_ccdd));
        buf.write(4, 0x11u8);
        assert_eq!(buf.read::<U32<LittleEndian>>(0).get(), 0xaabb_ccdd);
        assert_eq!(buf.read::<u8>(0), 0xdd);
        assert_eq!(buf.read::<u8>(4), 0x11);
    }

    #[test]
    fn fill_and_byte_copies() {
        let mut region = region();
        let mut buf = region.alloc(32, 4).unwrap();

        buf.fill(0, 32, 0xa5);
        buf.write_bytes(8, &[1, 2, 3, 4]);

        let mut out = [0u8; 12];
        buf.read_bytes(4, &mut out);
        assert_eq!(out, [0xa5, 0xa5, 0xa5, 0xa5, 1, 2, 3, 4, 0xa5, 0xa5, 0xa5, 0xa5]);
    }
}
