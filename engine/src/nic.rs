//! The NIC contract (§6): the minimal interface the engine needs from
//! whatever owns the actual ring memory and buffer storage. The physical (or
//! virtual) driver on the other side of this trait is an external
//! collaborator — out of scope for this crate (§1) — so the engine is
//! written generically against [`NicDevice`] rather than against one
//! concrete device, the same way the reference codebase keeps its hardware
//! drivers behind a small `NetworkDevice` trait so the rest of the stack
//! never names a specific chipset.

use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::buffer::BufIdx;
use crate::ring::Ring;

#[derive(Debug, Error)]
pub enum NicError {
    #[error("cannot open NIC device: {0}")]
    DeviceOpen(#[source] std::io::Error),
    #[error("{0} ioctl refused: {1}")]
    Ioctl(&'static str, #[source] std::io::Error),
    #[error("cannot map NIC memory: {0}")]
    Mmap(#[source] std::io::Error),
    #[error("cannot unmap NIC memory: {0}")]
    Munmap(#[source] std::io::Error),
    #[error("NIC granted {granted} extra buffers, needed {requested}")]
    InsufficientBuffers { requested: usize, granted: usize },
}

/// Which direction a ring runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDir {
    Tx,
    Rx,
}

/// Everything the engine needs from the device on the other side of the
/// ring/buffer contract: ring access, buffer access by index, the two sync
/// operations, and the extra-buffer hand-off used to seed the free pool.
pub trait NicDevice {
    /// Number of TX rings exposed by this NIC.
    fn num_tx_rings(&self) -> u32;
    /// Number of RX rings exposed by this NIC.
    fn num_rx_rings(&self) -> u32;

    fn tx_ring(&mut self, i: u32) -> &mut Ring;
    fn rx_ring(&mut self, i: u32) -> &mut Ring;

    /// Immutable view of the bytes backing buffer `idx`.
    fn buffer(&self, idx: BufIdx) -> &[u8];
    /// Mutable view of the bytes backing buffer `idx`.
    fn buffer_mut(&mut self, idx: BufIdx) -> &mut [u8];

    /// The extra buffers granted at registration time, to seed the free
    /// pool. Only meaningful immediately after construction.
    fn take_extra_buffers(&mut self) -> Vec<BufIdx>;

    /// Ask the NIC to publish newly received frames into the RX ring(s).
    fn rx_sync(&mut self) -> Result<(), NicError>;
    /// Ask the NIC to drain pending slots from the TX ring(s).
    fn tx_sync(&mut self) -> Result<(), NicError>;

    /// A file descriptor suitable for an external event loop to poll for
    /// readability (§4.10 `fd`).
    fn as_raw_fd(&self) -> RawFd;
}

#[cfg(unix)]
pub mod netmap;

/// An in-memory stand-in for a NIC, used by the test suite (§9.4) in place
/// of a real netmap device node. Ring slots and buffer storage live in plain
/// `Vec`s; `rx_sync`/`tx_sync` are no-ops since there is no real hardware to
/// kick. Two [`FakeNic`]s can be wired together by a test to exchange frames
/// between two independently-addressed [`crate::engine::Engine`]s, the same
/// way the reference codebase's own test scenarios run two engines against
/// loopback-adjacent interfaces.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use crate::buffer::FRAME_SIZE;
    use std::collections::VecDeque;

    pub struct FakeNic {
        bufs: Vec<[u8; FRAME_SIZE]>,
        tx: Vec<Ring>,
        rx: Vec<Ring>,
        extra: Vec<BufIdx>,
        /// Frames pushed here by a test (simulating link delivery) become
        /// visible in the RX ring on the next `rx_sync`.
        pub inbox: VecDeque<(BufIdx, u16)>,
        /// Frames drained from the TX ring land here on `tx_sync`, for a
        /// test to inspect or hand to the peer `FakeNic`'s inbox.
        pub outbox: VecDeque<(BufIdx, u16)>,
        /// How far into the TX ring the last `tx_sync` already harvested;
        /// the engine advances `head`/`cur` together as it fills slots
        /// (mirroring `w_rx`'s combined cursor bump), so `tx_sync` must track
        /// its own read position separately rather than compare `head` to
        /// `cur`.
        tx_synced: u32,
    }

    impl FakeNic {
        /// `num_extra` buffers are handed to the pool; `ring_slots` sizes
        /// the single TX and single RX ring this fake exposes.
        pub fn new(num_extra: usize, ring_slots: u32) -> Self {
            let total = num_extra + ring_slots as usize * 2;
            let bufs = vec![[0u8; FRAME_SIZE]; total];
            let mut next_idx = 0u32;

            let mut alloc_slots = |n: u32| -> Vec<crate::ring::Slot> {
                (0..n)
                    .map(|_| {
                        let s = crate::ring::Slot::new(next_idx);
                        next_idx += 1;
                        s
                    })
                    .collect()
            };
            let tx_ring = Ring::new_tx(alloc_slots(ring_slots));
            let rx_ring = Ring::new_rx(alloc_slots(ring_slots));
            let extra: Vec<BufIdx> = (next_idx..next_idx + num_extra as u32).collect();

            FakeNic {
                bufs,
                tx: vec![tx_ring],
                rx: vec![rx_ring],
                extra,
                inbox: VecDeque::new(),
                outbox: VecDeque::new(),
                tx_synced: 0,
            }
        }

        /// Simulate "the wire delivered this frame": copy `data` into a
        /// fresh buffer and queue it for the next `rx_sync`.
        pub fn deliver(&mut self, data: &[u8]) {
            let idx = self.bufs.len() as BufIdx;
            let mut buf = [0u8; FRAME_SIZE];
            buf[..data.len()].copy_from_slice(data);
            self.bufs.push(buf);
            self.inbox.push_back((idx, data.len() as u16));
        }
    }

    impl NicDevice for FakeNic {
        fn num_tx_rings(&self) -> u32 {
            self.tx.len() as u32
        }
        fn num_rx_rings(&self) -> u32 {
            self.rx.len() as u32
        }
        fn tx_ring(&mut self, i: u32) -> &mut Ring {
            &mut self.tx[i as usize]
        }
        fn rx_ring(&mut self, i: u32) -> &mut Ring {
            &mut self.rx[i as usize]
        }
        fn buffer(&self, idx: BufIdx) -> &[u8] {
            &self.bufs[idx as usize]
        }
        fn buffer_mut(&mut self, idx: BufIdx) -> &mut [u8] {
            &mut self.bufs[idx as usize]
        }
        fn take_extra_buffers(&mut self) -> Vec<BufIdx> {
            std::mem::take(&mut self.extra)
        }
        fn rx_sync(&mut self) -> Result<(), NicError> {
            // Publish queued inbound frames into the RX ring's tail, one
            // slot per frame, by binding each to the slot at `tail` and
            // advancing `tail`. A real NIC does the analogous thing in
            // hardware between sync calls.
            let ring = &mut self.rx[0];
            while let Some((idx, len)) = self.inbox.pop_front() {
                let tail = ring.tail;
                if ring.next(tail) == ring.head {
                    // Ring full: stop delivering, matching a real NIC that
                    // would simply not have room either.
                    self.inbox.push_front((idx, len));
                    break;
                }
                let slot = ring.slot_mut(tail);
                slot.buf_idx = idx;
                slot.len = len;
                ring.tail = ring.next(tail);
            }
            Ok(())
        }
        fn tx_sync(&mut self) -> Result<(), NicError> {
            // Drain every slot the engine has queued since the last sync
            // (its `head` has already moved past them) into the outbox, as
            // if the link had sent them, then reopen that much room by
            // pulling `tail` back up to one slot behind `head` again.
            let ring = &mut self.tx[0];
            let mut i = self.tx_synced;
            while i != ring.head {
                let slot = *ring.slot(i);
                self.outbox.push_back((slot.buf_idx, slot.len));
                i = ring.next(i);
            }
            self.tx_synced = ring.head;
            ring.tail = if ring.num_slots() == 0 {
                0
            } else {
                (ring.head + ring.num_slots() - 1) % ring.num_slots()
            };
            Ok(())
        }
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn delivered_frame_appears_after_rx_sync() {
            let mut nic = FakeNic::new(0, 4);
            nic.deliver(b"hello");
            assert!(nic.rx_ring(0).is_empty());
            nic.rx_sync().unwrap();
            assert!(!nic.rx_ring(0).is_empty());
            let cur = nic.rx_ring(0).cur;
            let idx = nic.rx_ring(0).slot(cur).buf_idx;
            assert_eq!(&nic.buffer(idx)[..5], b"hello");
        }

        #[test]
        fn filled_tx_slot_drains_to_outbox_and_reopens_room() {
            let mut nic = FakeNic::new(0, 4);
            let ring = nic.tx_ring(0);
            let cur = ring.cur;
            ring.slot_mut(cur).len = 3;
            ring.consume();
            assert!(nic.outbox.is_empty());
            nic.tx_sync().unwrap();
            assert_eq!(nic.outbox.len(), 1);
            let ring = nic.tx_ring(0);
            assert_eq!(ring.head, 1);
            // Room reopens to one slot behind the new head (4-slot ring).
            assert_eq!(ring.tail, 0);
            assert!(!ring.is_empty());
        }
    }
}
