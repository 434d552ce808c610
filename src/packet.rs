// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet buffer pool.
//!
//! The userspace NIC driver hands out packets from a fixed, pre-allocated
//! per-socket pool; nothing on the data path allocates. A [`Packet`] handle
//! owns one buffer and returns it to the pool when dropped, so every exit
//! path (TX'd, forwarded and released downstream, or dropped in place)
//! recycles the storage without bookkeeping at the call sites.

use crossbeam_queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Default packet buffer size, large enough for a jumbo datagram.
pub const DEFAULT_PACKET_BUF_SIZE: usize = 9600;

/// Fixed-population pool of packet buffers on a lock-free free list.
#[derive(Debug)]
pub struct PacketPool {
    name: String,
    free: SegQueue<Box<[u8]>>,
    buf_size: usize,
    capacity: usize,
}

impl PacketPool {
    /// Create a pool with `capacity` buffers of `buf_size` bytes each, all
    /// allocated up front.
    pub fn new(name: &str, capacity: usize, buf_size: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.to_string(),
            free: SegQueue::new(),
            buf_size,
            capacity,
        });

        for _ in 0..capacity {
            pool.free.push(vec![0u8; buf_size].into_boxed_slice());
        }

        pool
    }

    /// Take a buffer from the free list. Returns `None` when the pool is
    /// exhausted (the caller counts and drops, it does not wait).
    pub fn alloc(self: &Arc<Self>) -> Option<Packet> {
        self.free.pop().map(|data| Packet {
            data,
            len: 0,
            pool: Arc::clone(self),
        })
    }

    /// Allocate a buffer and fill it with `frame`. Returns `None` if the
    /// pool is empty or the frame exceeds the buffer size.
    pub fn alloc_from(self: &Arc<Self>, frame: &[u8]) -> Option<Packet> {
        if frame.len() > self.buf_size {
            return None;
        }
        let mut pkt = self.alloc()?;
        pkt.data[..frame.len()].copy_from_slice(frame);
        pkt.len = frame.len();
        Some(pkt)
    }

    fn release(&self, buffer: Box<[u8]>) {
        self.free.push(buffer);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}

/// One NIC packet buffer. Dereferences to the received bytes; returns its
/// storage to the owning pool on drop.
#[derive(Debug)]
pub struct Packet {
    data: Box<[u8]>,
    len: usize,
    pool: Arc<PacketPool>,
}

impl Packet {
    /// Length of valid data in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the valid data length after writing into the buffer directly.
    ///
    /// # Panics
    /// Panics if `len` exceeds the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "packet length exceeds buffer size");
        self.len = len;
    }

    /// Whole backing buffer, regardless of valid length.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.data[..self.len]
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..self.len]
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        // Move the buffer out and hand it back to the free list.
        let buffer = std::mem::replace(&mut self.data, Box::new([]));
        self.pool.release(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_auto_release() {
        let pool = PacketPool::new("mbuf_pool_00", 2, 128);
        assert_eq!(pool.available(), 2);

        let pkt = pool.alloc().expect("buffer available");
        assert_eq!(pool.available(), 1);
        drop(pkt);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = PacketPool::new("tiny", 1, 64);
        let held = pool.alloc().expect("first alloc");
        assert!(pool.alloc().is_none());
        drop(held);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn test_alloc_from_copies_frame() {
        let pool = PacketPool::new("copy", 1, 64);
        let pkt = pool.alloc_from(&[1, 2, 3, 4]).expect("alloc");
        assert_eq!(&pkt[..], &[1, 2, 3, 4]);
        assert_eq!(pkt.len(), 4);
    }

    #[test]
    fn test_alloc_from_rejects_oversize() {
        let pool = PacketPool::new("small", 1, 4);
        assert!(pool.alloc_from(&[0u8; 8]).is_none());
        // The failed attempt must not leak a buffer.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_set_len_and_write() {
        let pool = PacketPool::new("write", 1, 32);
        let mut pkt = pool.alloc().unwrap();
        pkt.buf_mut()[..3].copy_from_slice(&[9, 8, 7]);
        pkt.set_len(3);
        assert_eq!(&pkt[..], &[9, 8, 7]);
    }
}
