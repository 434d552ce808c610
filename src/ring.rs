// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Named, bounded, lock-free rings.
//!
//! Rings are the only channel between worker cores: ownership of a packet
//! or shared-buffer slot transfers by enqueue, and no stage touches a
//! buffer it has handed downstream. Every ring has a power-of-two capacity
//! and a name; the first stage that declares a ring as its downstream
//! creates it, later stages discover it by name lookup.
//!
//! The underlying queue is `crossbeam_queue::ArrayQueue`, which is safe for
//! multiple producers and consumers; the pipeline graph uses most rings as
//! SPSC, which it supports trivially.

use crossbeam_queue::ArrayQueue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("ring '{0}' not found")]
    NotFound(String),

    #[error("ring capacity must be non-zero")]
    ZeroCapacity,
}

/// A bounded lock-free FIFO of `T`, identified by name.
///
/// Cheap to clone; clones share the same queue.
pub struct Ring<T> {
    name: Arc<str>,
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Clone for Ring<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> Ring<T> {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: Arc::from(name),
            queue: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking enqueue. On a full ring the value is handed back so the
    /// caller can retry or drop it.
    #[inline]
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        self.queue.push(value)
    }

    /// Non-blocking dequeue.
    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Name-keyed ring registry with lookup-or-create semantics.
///
/// The registry mutex is taken only during bootstrap (ring creation and
/// discovery); the data path holds `Ring` clones and never touches it.
pub struct RingDirectory<T> {
    rings: Mutex<HashMap<String, Ring<T>>>,
}

impl<T> Default for RingDirectory<T> {
    fn default() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RingDirectory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a ring, creating it with `capacity` if this is the first
    /// declaration. Returns the ring and whether this call created it.
    pub fn lookup_or_create(&self, name: &str, capacity: usize) -> Result<(Ring<T>, bool), RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        let mut rings = self.rings.lock().expect("ring directory poisoned");
        if let Some(ring) = rings.get(name) {
            return Ok((ring.clone(), false));
        }
        let ring = Ring::new(name, capacity);
        rings.insert(name.to_string(), ring.clone());
        Ok((ring, true))
    }

    /// Look up an existing ring by name.
    pub fn lookup(&self, name: &str) -> Result<Ring<T>, RingError> {
        let rings = self.rings.lock().expect("ring directory poisoned");
        rings
            .get(name)
            .cloned()
            .ok_or_else(|| RingError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rings.lock().expect("ring directory poisoned").contains_key(name)
    }
}

/// Round up to the next power of two, with a floor of 2.
pub fn nearest_power_of_two(value: usize) -> usize {
    let mut nearest = 2;
    while nearest < value {
        nearest *= 2;
    }
    nearest
}

/// Data ring between an upstream core and one downstream consumer:
/// `"{upstream_core_name}_{consumer_idx:02}_{socket}"`.
pub fn data_ring_name(upstream_core_name: &str, consumer_idx: usize, socket_id: u32) -> String {
    format!("{}_{:02}_{}", upstream_core_name, consumer_idx, socket_id)
}

/// RX-facing free list of NIC packet buffers for a socket.
pub fn packet_release_ring_name(socket_id: u32) -> String {
    format!("packet_release_{}", socket_id)
}

/// Free list of shared-buffer slot addresses for a socket.
pub fn clear_frames_ring_name(socket_id: u32) -> String {
    format!("clear_frames_{}", socket_id)
}
