//! Generic DMA command rings.
//!
//! Controllers that consume commands from in-memory rings share the same
//! shape: the driver appends fixed-size entries to a submission ring and
//! advances a tail doorbell, the device posts fixed-size entries to a
//! completion ring and the driver consumes them by polling a phase bit that
//! inverts on every wrap. [`SubmissionQueue`] and [`CompletionQueue`]
//! implement that bookkeeping for any [`QueueEntry`] type.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::barrier;

/// A fixed-size ring entry.
///
/// Implemented automatically for any plain-data type that can be copied to
/// and from device-visible memory.
pub trait QueueEntry: Copy + Default + Sized + FromBytes + IntoBytes + Immutable + KnownLayout {
    /// Size of one entry in bytes.
    const SIZE: usize = core::mem::size_of::<Self>();
}

impl<E> QueueEntry for E where
    E: Copy + Default + Sized + FromBytes + IntoBytes + Immutable + KnownLayout
{
}

/// A submission ring written by the driver and consumed by the device.
///
/// The driver owns the tail index; the head index tracks how far the device
/// has fetched entries and is updated from completion reports.
pub struct SubmissionQueue<E: QueueEntry> {
    entries: *mut E,
    bus_addr: u64,
    depth: u16,
    tail: u16,
    head: u16,
}

impl<E: QueueEntry> SubmissionQueue<E> {
    /// Returns the number of bytes of DMA memory needed for `depth` entries.
    #[must_use]
    pub const fn memory_size(depth: u16) -> usize {
        depth as usize * E::SIZE
    }

    /// Creates a submission queue over device-visible memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `entries` points to at least
    /// [`Self::memory_size`] bytes of DMA-coherent memory that stays valid
    /// and otherwise unused for the lifetime of the queue, and that
    /// `bus_addr` is the device-visible address of the same memory.
    pub const unsafe fn new(entries: *mut E, bus_addr: u64, depth: u16) -> Self {
        Self {
            entries,
            bus_addr,
            depth,
            tail: 0,
            head: 0,
        }
    }

    /// Returns the device-visible address of the ring.
    #[inline]
    #[must_use]
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Returns the number of entries in the ring.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u16 {
        self.depth
    }

    /// Returns true if no further entry can be submitted.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.depth == self.head
    }

    /// Returns true if the device has consumed every submitted entry.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    /// Returns the current tail index.
    #[inline]
    #[must_use]
    pub fn tail(&self) -> u16 {
        self.tail
    }

    /// Appends an entry to the ring.
    ///
    /// Returns the slot the entry was written to, or `None` if the ring is
    /// full. The entry is published with a write barrier so it is visible
    /// to the device before any subsequent doorbell write.
    pub fn submit(&mut self, entry: E) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        let slot = self.tail;
        // SAFETY: Caller of `new` ensured the ring memory is valid; `slot`
        // is always below `depth`.
        unsafe { core::ptr::write_volatile(self.entries.add(slot as usize), entry) };
        barrier::write_barrier();
        self.tail = (self.tail + 1) % self.depth;
        Some(slot)
    }

    /// Returns the value to write to the tail doorbell.
    #[inline]
    #[must_use]
    pub fn doorbell_value(&self) -> u32 {
        u32::from(self.tail)
    }

    /// Records the head index reported by the device.
    pub fn update_head(&mut self, head: u16) {
        debug_assert!(head < self.depth, "submission queue head out of range");
        self.head = head;
    }
}

// SAFETY: The raw entry pointer is only dereferenced through &mut self.
unsafe impl<E: QueueEntry> Send for SubmissionQueue<E> {}

/// A completion ring written by the device and consumed by the driver.
///
/// New entries are detected by a phase bit inside a 16-bit status word at a
/// fixed offset within each entry. The device inverts the phase it writes
/// on every pass over the ring, so an entry is new when its phase bit
/// matches the phase the driver currently expects.
pub struct CompletionQueue<E: QueueEntry> {
    entries: *const E,
    bus_addr: u64,
    depth: u16,
    head: u16,
    /// Phase value that marks the next new entry.
    phase: bool,
    phase_bit_offset: u16,
    status_field_offset: usize,
}

impl<E: QueueEntry> CompletionQueue<E> {
    /// Returns the number of bytes of DMA memory needed for `depth` entries.
    #[must_use]
    pub const fn memory_size(depth: u16) -> usize {
        depth as usize * E::SIZE
    }

    /// Creates a completion queue over device-visible memory.
    ///
    /// `status_field_offset` is the byte offset of the 16-bit status word
    /// within an entry and `phase_bit_offset` the bit position of the phase
    /// bit inside it. The ring memory must be zeroed before the device is
    /// told about it, so the first pass is detected with phase one.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `entries` points to at least
    /// [`Self::memory_size`] bytes of DMA-coherent memory that stays valid
    /// and otherwise unused for the lifetime of the queue, and that
    /// `bus_addr` is the device-visible address of the same memory.
    pub const unsafe fn new(
        entries: *const E,
        bus_addr: u64,
        depth: u16,
        phase_bit_offset: u16,
        status_field_offset: usize,
    ) -> Self {
        Self {
            entries,
            bus_addr,
            depth,
            head: 0,
            phase: true,
            phase_bit_offset,
            status_field_offset,
        }
    }

    /// Returns the device-visible address of the ring.
    #[inline]
    #[must_use]
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Returns the number of entries in the ring.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u16 {
        self.depth
    }

    /// Returns the current head index.
    #[inline]
    #[must_use]
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Returns true if the entry at the head has been posted by the device.
    #[must_use]
    pub fn has_completion(&self) -> bool {
        barrier::read_barrier();
        let entry = self.entries as usize + self.head as usize * E::SIZE;
        // SAFETY: Caller of `new` ensured the ring memory is valid and the
        // status word lies within the entry.
        let status =
            unsafe { core::ptr::read_volatile((entry + self.status_field_offset) as *const u16) };
        (status >> self.phase_bit_offset) & 1 == u16::from(self.phase)
    }

    /// Consumes the entry at the head of the ring.
    ///
    /// Returns `None` if the device has not posted one yet. The expected
    /// phase inverts each time the head wraps back to slot zero.
    pub fn pop(&mut self) -> Option<E> {
        if !self.has_completion() {
            return None;
        }
        // SAFETY: Caller of `new` ensured the ring memory is valid; `head`
        // is always below `depth`.
        let entry = unsafe { core::ptr::read_volatile(self.entries.add(self.head as usize)) };
        self.head = (self.head + 1) % self.depth;
        if self.head == 0 {
            self.phase = !self.phase;
        }
        Some(entry)
    }

    /// Returns the value to write to the head doorbell.
    #[inline]
    #[must_use]
    pub fn doorbell_value(&self) -> u32 {
        u32::from(self.head)
    }
}

// SAFETY: The raw entry pointer is only dereferenced through &self reads.
unsafe impl<E: QueueEntry> Send for CompletionQueue<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::byteorder::{LittleEndian, U16};
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
    #[repr(C)]
    struct TestEntry {
        tag: U16<LittleEndian>,
        status: U16<LittleEndian>,
    }

    #[test]
    fn submission_wraps_and_fills() {
        let mut backing = [TestEntry::default(); 4];
        // SAFETY: `backing` outlives the queue and is exclusively owned by
        // it for the duration of the test.
        let mut sq = unsafe { SubmissionQueue::new(backing.as_mut_ptr(), 0x1000, 4) };

        assert!(sq.is_empty());
        assert_eq!(sq.submit(TestEntry { tag: U16::new(1), status: U16::new(0) }), Some(0));
        assert_eq!(sq.submit(TestEntry { tag: U16::new(2), status: U16::new(0) }), Some(1));
        assert_eq!(sq.submit(TestEntry { tag: U16::new(3), status: U16::new(0) }), Some(2));
        // Depth 4 holds at most 3 outstanding entries.
        assert!(sq.is_full());
        assert_eq!(sq.submit(TestEntry::default()), None);
        assert_eq!(sq.doorbell_value(), 3);

        sq.update_head(2);
        assert!(!sq.is_full());
        assert_eq!(sq.submit(TestEntry { tag: U16::new(4), status: U16::new(0) }), Some(3));
        assert_eq!(sq.doorbell_value(), 0);
        assert_eq!(backing[3].tag.get(), 4);
    }

    #[test]
    fn completion_phase_toggles_on_wrap() {
        let mut backing = [TestEntry::default(); 2];
        let base = backing.as_mut_ptr();
        // SAFETY: `backing` outlives the queue; status word is at offset 2,
        // phase bit 0.
        let mut cq = unsafe { CompletionQueue::new(base as *const TestEntry, 0x2000, 2, 0, 2) };

        assert!(!cq.has_completion());

        // First pass: the device posts with phase one.
        backing[0] = TestEntry { tag: U16::new(7), status: U16::new(1) };
        assert!(cq.has_completion());
        assert_eq!(cq.pop().map(|e| e.tag.get()), Some(7));
        assert!(!cq.has_completion());

        backing[1] = TestEntry { tag: U16::new(8), status: U16::new(1) };
        assert_eq!(cq.pop().map(|e| e.tag.get()), Some(8));
        assert_eq!(cq.doorbell_value(), 0);

        // Second pass: stale phase-one entries must not be seen as new.
        assert!(!cq.has_completion());
        backing[0] = TestEntry { tag: U16::new(9), status: U16::new(0) };
        assert_eq!(cq.pop().map(|e| e.tag.get()), Some(9));
    }
}
