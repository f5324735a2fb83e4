//! Views over the memory regions mmap'ed from the endpoint file
//! descriptor: the two event rings and the send/recv payload queues.
//!
//! The layouts are fixed by the driver ABI (see [`crate::abi`]); these
//! types only add cursor bookkeeping on top of raw mappings. They are
//! also usable over plain heap allocations, which is how the unit tests
//! drive them.

use std::ptr;

use crate::abi::{EVENT_SLOT_SIZE, SENDQ_ENTRY_SHIFT};
use crate::events::Event;

/// Consumer cursor over one event ring.
///
/// The driver produces slots in order and never overwrites a slot whose
/// type byte is still non-zero; the library consumes a slot by zeroing
/// the whole record after processing, which hands it back to the driver.
pub struct EventRing {
    base: *mut u8,
    slots: usize,
    next: usize,
}

// The mapping is owned by the endpoint fd and outlives the ring view.
unsafe impl Send for EventRing {}

impl EventRing {
    /// Wraps a mapped ring of `slots` records starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at `slots * EVENT_SLOT_SIZE` bytes valid for
    /// reads and writes for the lifetime of the ring.
    #[must_use]
    pub unsafe fn new(base: *mut u8, slots: usize) -> Self {
        Self {
            base,
            slots,
            next: 0,
        }
    }

    /// Index of the next slot to be consumed.
    #[must_use]
    pub fn next_index(&self) -> u32 {
        self.next as u32
    }

    /// Takes the next record if its slot is filled, zeroing the slot so
    /// the driver may reuse it.
    pub fn pop(&mut self) -> Option<Event> {
        let slot_ptr = unsafe { self.base.add(self.next * EVENT_SLOT_SIZE) };

        // the driver writes the type byte last, so one volatile read of
        // it decides whether the rest of the slot is valid
        let ty = unsafe { ptr::read_volatile(slot_ptr.add(EVENT_SLOT_SIZE - 1)) };
        if ty == crate::abi::evt::NONE {
            return None;
        }

        let mut slot = [0u8; EVENT_SLOT_SIZE];
        unsafe {
            ptr::copy_nonoverlapping(slot_ptr, slot.as_mut_ptr(), EVENT_SLOT_SIZE);
            ptr::write_bytes(slot_ptr, 0, EVENT_SLOT_SIZE);
        }

        self.next = (self.next + 1) % self.slots;
        Event::parse(&slot)
    }
}

/// View of the mapped send queue, sliced into fixed-size staging slots.
pub struct SendQueue {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for SendQueue {}

impl SendQueue {
    /// Wraps a mapped send queue of `len` bytes.
    ///
    /// # Safety
    ///
    /// `base` must point at `len` bytes valid for reads and writes for
    /// the lifetime of the queue.
    #[must_use]
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Mutable bytes of slot `index`.
    pub fn slot_mut(&mut self, index: u16) -> &mut [u8] {
        let off = (index as usize) << SENDQ_ENTRY_SHIFT;
        let size = 1 << SENDQ_ENTRY_SHIFT;
        assert!(off + size <= self.len, "sendq slot out of range");
        unsafe { std::slice::from_raw_parts_mut(self.base.add(off), size) }
    }
}

/// View of the mapped recv queue, addressed by byte offsets taken from
/// events.
pub struct RecvQueue {
    base: *const u8,
    len: usize,
}

unsafe impl Send for RecvQueue {}

impl RecvQueue {
    /// Wraps a mapped recv queue of `len` bytes.
    ///
    /// # Safety
    ///
    /// `base` must point at `len` bytes valid for reads for the lifetime
    /// of the queue.
    #[must_use]
    pub unsafe fn new(base: *const u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Payload bytes at `offset`.
    pub fn data(&self, offset: u32, len: usize) -> &[u8] {
        let off = offset as usize;
        assert!(off + len <= self.len, "recvq range out of bounds");
        unsafe { std::slice::from_raw_parts(self.base.add(off), len) }
    }
}

#[cfg(test)]
mod tests {
    use crate::abi::evt;

    use super::*;

    #[test]
    fn ring_pop_wraps_and_clears() {
        let slots = 4;
        let mut backing = vec![0u8; slots * EVENT_SLOT_SIZE];
        let mut ring = unsafe { EventRing::new(backing.as_mut_ptr(), slots) };

        assert!(ring.pop().is_none());

        // fill slots 0 and 1 with frag-done events
        for (i, off) in [(0usize, 128u32), (1, 256)] {
            let slot = &mut backing[i * EVENT_SLOT_SIZE..(i + 1) * EVENT_SLOT_SIZE];
            slot[0..4].copy_from_slice(&off.to_le_bytes());
            slot[EVENT_SLOT_SIZE - 1] = evt::SEND_MEDIUMSQ_FRAG_DONE;
        }

        assert_eq!(
            ring.pop(),
            Some(Event::MediumSqFragDone { sendq_offset: 128 })
        );
        assert_eq!(
            ring.pop(),
            Some(Event::MediumSqFragDone { sendq_offset: 256 })
        );
        assert!(ring.pop().is_none());
        assert_eq!(ring.next_index(), 2);
        // consumed slots are zeroed back for the producer
        assert!(backing[..2 * EVENT_SLOT_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn sendq_slot_addressing() {
        let mut backing = vec![0u8; 4 << SENDQ_ENTRY_SHIFT];
        let mut sq = unsafe { SendQueue::new(backing.as_mut_ptr(), backing.len()) };
        sq.slot_mut(2)[0] = 0xab;
        assert_eq!(backing[2 << SENDQ_ENTRY_SHIFT], 0xab);
    }
}
