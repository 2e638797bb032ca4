//! Ring view: a thin accessor over one NIC TX or RX descriptor ring (§4.2).

use bitflags::bitflags;

use crate::buffer::BufIdx;

bitflags! {
    /// Per-slot flags. `BUF_CHANGED` is the only one the engine sets; it
    /// tells the NIC that `buf_idx` was swapped and the NIC must reread the
    /// buffer pointer rather than reuse whatever it cached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u16 {
        const BUF_CHANGED = 0b0000_0001;
    }
}

/// One ring descriptor: which buffer is bound to this slot, how many bytes
/// of it are valid, and flags for the NIC to notice on the next sync.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub buf_idx: BufIdx,
    pub len: u16,
    pub flags: SlotFlags,
}

impl Slot {
    pub fn new(buf_idx: BufIdx) -> Self {
        Slot {
            buf_idx,
            len: 0,
            flags: SlotFlags::empty(),
        }
    }
}

/// A TX or RX descriptor ring. The NIC owns slots between `tail` and `head`;
/// the engine owns slots from `head` up to (but not including) `tail` of the
/// next wrap. `cur` is the engine's private read/write cursor within its own
/// owned region — distinct from `head`, which is only advanced to publish
/// progress back to the NIC.
pub struct Ring {
    slots: Vec<Slot>,
    pub head: u32,
    pub cur: u32,
    pub tail: u32,
}

impl Ring {
    /// Build an RX ring: nothing has been delivered yet, so the NIC owns the
    /// whole ring (`cur == tail == 0`) until the first `rx_sync` publishes
    /// slots by advancing `tail`.
    pub fn new_rx(slots: Vec<Slot>) -> Self {
        Ring {
            slots,
            head: 0,
            cur: 0,
            tail: 0,
        }
    }

    /// Build a TX ring: the engine owns the whole ring to start, minus one
    /// slot held back so that `cur == tail` unambiguously means "no room
    /// left" rather than colliding with the all-empty encoding.
    pub fn new_tx(slots: Vec<Slot>) -> Self {
        let n = slots.len() as u32;
        let tail = if n == 0 { 0 } else { n - 1 };
        Ring {
            slots,
            head: 0,
            cur: 0,
            tail,
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slot(&self, i: u32) -> &Slot {
        &self.slots[i as usize]
    }

    pub fn slot_mut(&mut self, i: u32) -> &mut Slot {
        &mut self.slots[i as usize]
    }

    /// True when the engine has nothing left to process/produce this sweep.
    pub fn is_empty(&self) -> bool {
        self.cur == self.tail
    }

    /// The next slot index after `i`, wrapping around the ring.
    pub fn next(&self, i: u32) -> u32 {
        let n = self.num_slots();
        if n == 0 {
            0
        } else {
            (i + 1) % n
        }
    }

    /// Consume the slot at `cur`, handing it back to the NIC: advances `cur`
    /// and `head` together to their common successor, mirroring how the
    /// reference codebase's RX/TX drain loops bump both at once
    /// (`r->head = r->cur = nm_ring_next(r, r->cur)`) rather than treating
    /// "I've read it" and "the NIC may reuse it" as separate steps.
    pub fn consume(&mut self) {
        self.cur = self.next(self.cur);
        self.head = self.cur;
    }

    /// Exchange the slot's bound buffer with `new_buf`, returning the
    /// buffer the slot held before. Marks the slot `BUF_CHANGED` so the NIC
    /// rereads the pointer on its next sync. This is the sole mechanism that
    /// moves a frame between the free pool and NIC ownership without a copy.
    pub fn swap(&mut self, i: u32, new_buf: BufIdx) -> BufIdx {
        let slot = self.slot_mut(i);
        let old = slot.buf_idx;
        slot.buf_idx = new_buf;
        slot.flags |= SlotFlags::BUF_CHANGED;
        old
    }
}
