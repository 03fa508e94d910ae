//! Packet buffers.
//!
//! A fixed-size block with a sliding head pointer: headroom is reserved at
//! allocation, headers are pushed on transmit and pulled on receive, and
//! payload is appended at the tail. Each buffer has a single owner and is
//! freed (by drop) by its terminal consumer. Buffers come from a fixed
//! pool sized for the NIC rings plus packets in flight.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::param::NMBUF;

/// Buffer storage size; enough for an Ethernet frame with headroom.
pub const MBUF_SIZE: usize = 2048;

pub struct MbufData {
    /// Offset of the first data byte within `buf`.
    head: usize,
    /// Length of the data.
    len: usize,
    buf: [u8; MBUF_SIZE],
}

pub(super) struct MbufSlot {
    used: AtomicBool,
    data: UnsafeCell<MbufData>,
}

// SAFETY: a slot's data is only touched by the owner of the Mbuf handed
// out for it.
unsafe impl Sync for MbufSlot {}

/// The pool all packet buffers come from.
pub struct MbufPool {
    slots: [MbufSlot; NMBUF],
}

impl MbufPool {
    pub const fn new() -> Self {
        Self {
            slots: [const {
                MbufSlot {
                    used: AtomicBool::new(false),
                    data: UnsafeCell::new(MbufData {
                        head: 0,
                        len: 0,
                        buf: [0; MBUF_SIZE],
                    }),
                }
            }; NMBUF],
        }
    }

    /// Allocate a buffer with the given headroom reserved, or fail with
    /// out-of-memory when the pool is empty.
    pub fn alloc(&self, headroom: usize) -> Option<Mbuf> {
        if headroom > MBUF_SIZE {
            return None;
        }
        for slot in &self.slots {
            if slot
                .used
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: the slot is exclusively ours now.
                let data = unsafe { &mut *slot.data.get() };
                data.head = headroom;
                data.len = 0;
                return Some(Mbuf {
                    slot: NonNull::from(slot),
                });
            }
        }
        None
    }
}

/// An owned packet buffer. Freed back to its pool on drop.
pub struct Mbuf {
    slot: NonNull<MbufSlot>,
}

// SAFETY: single owner; the pool slot is reserved for this handle.
unsafe impl Send for Mbuf {}

impl Mbuf {
    fn inner(&self) -> &MbufData {
        // SAFETY: the slot is exclusively ours while the Mbuf lives.
        unsafe { &*(*self.slot.as_ptr()).data.get() }
    }

    fn inner_mut(&mut self) -> &mut MbufData {
        // SAFETY: as above, and we are the unique handle.
        unsafe { &mut *(*self.slot.as_ptr()).data.get() }
    }

    pub fn len(&self) -> usize {
        self.inner().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current data bytes.
    pub fn data(&self) -> &[u8] {
        let inner = self.inner();
        &inner.buf[inner.head..inner.head + inner.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let inner = self.inner_mut();
        &mut inner.buf[inner.head..inner.head + inner.len]
    }

    /// Raw pointer to the first data byte, for DMA descriptors.
    pub fn head_ptr(&self) -> *const u8 {
        let inner = self.inner();
        inner.buf[inner.head..].as_ptr()
    }

    /// Grow at the head: prepend a header. Returns the new prefix.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        let inner = self.inner_mut();
        assert!(inner.head >= n, "mbuf: push past headroom");
        inner.head -= n;
        inner.len += n;
        let head = inner.head;
        &mut inner.buf[head..head + n]
    }

    /// Shrink at the head: strip a header.
    pub fn pull(&mut self, n: usize) {
        let inner = self.inner_mut();
        assert!(inner.len >= n, "mbuf: pull past end");
        inner.head += n;
        inner.len -= n;
    }

    /// Grow at the tail: append payload space. Returns the new suffix.
    pub fn put(&mut self, n: usize) -> &mut [u8] {
        let inner = self.inner_mut();
        assert!(inner.head + inner.len + n <= MBUF_SIZE, "mbuf: put past end");
        let start = inner.head + inner.len;
        inner.len += n;
        &mut inner.buf[start..start + n]
    }

    /// Set the data length directly; used by the receive ring, where the
    /// hardware reports the frame length.
    pub fn set_len(&mut self, len: usize) {
        let inner = self.inner_mut();
        assert!(inner.head + len <= MBUF_SIZE, "mbuf: bad length");
        inner.len = len;
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        // SAFETY: the slot was reserved for this handle.
        unsafe { (*self.slot.as_ptr()).used.store(false, Ordering::Release) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pull_put_move_the_window() {
        let pool = Box::leak(Box::new(MbufPool::new()));
        let mut m = pool.alloc(64).unwrap();
        assert_eq!(m.len(), 0);

        m.put(4).copy_from_slice(b"data");
        assert_eq!(m.data(), b"data");

        m.push(2).copy_from_slice(b"hh");
        assert_eq!(m.data(), b"hhdata");

        m.pull(2);
        assert_eq!(m.data(), b"data");
    }

    #[test]
    fn pool_exhaustion_and_reuse() {
        let pool = Box::leak(Box::new(MbufPool::new()));
        let mut held = Vec::new();
        for _ in 0..NMBUF {
            held.push(pool.alloc(0).unwrap());
        }
        assert!(pool.alloc(0).is_none());
        held.pop();
        assert!(pool.alloc(0).is_some());
    }

    #[test]
    #[should_panic(expected = "push past headroom")]
    fn push_past_headroom_panics() {
        let pool = Box::leak(Box::new(MbufPool::new()));
        let mut m = pool.alloc(2).unwrap();
        let _ = m.push(4);
    }
}
