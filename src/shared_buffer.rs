// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Huge-page shared buffer arena.
//!
//! One arena per NUMA socket: a contiguous anonymous mapping carved into
//! equal fixed-size slots, each sized to hold one super-frame (headers plus
//! payload plus compressor headroom). Slots are identified by their start
//! address and circulate through the pipeline by ring transfer; the arena
//! itself has no internal synchronization.
//!
//! The mapping is requested with `MAP_HUGETLB` first and falls back to
//! normal pages with a warning when the system has no huge pages reserved.
//! Failure of the fallback reservation is fatal.

use crate::logging::{Facility, Logger};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedBufferError {
    #[error("buffer size {buffer_size} exceeds region size {mem_size}")]
    BufferExceedsRegion { mem_size: usize, buffer_size: usize },

    #[error("region size must be non-zero")]
    ZeroSize,

    #[error("failed to reserve {mem_size} bytes for shared buffer '{name}': {source}")]
    ReserveFailed {
        name: String,
        mem_size: usize,
        source: nix::Error,
    },
}

/// A fixed-size region of the shared buffer, exclusively owned by whichever
/// stage currently holds the handle.
///
/// `Slot` is a raw view into the arena: the ring discipline guarantees that
/// at most one stage holds a given slot at any time, and the arena outlives
/// every stage that references it (both are CoreManager invariants).
pub struct Slot {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a Slot transfers between pinned worker threads by ring enqueue;
// the holder has exclusive access to the bytes until it enqueues the slot
// onwards, so there is never concurrent aliasing.
unsafe impl Send for Slot {}

impl Slot {
    /// Build a slot over raw memory. Caller must guarantee the region stays
    /// valid for the life of the handle and is not aliased by another slot.
    pub(crate) unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Start address, the slot's identity.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: exclusive ownership per the type invariant.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive ownership per the type invariant.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

/// Contiguous huge-page region carved into equal slots.
#[derive(Debug)]
pub struct SharedBuffer {
    name: String,
    base: NonNull<u8>,
    mem_size: usize,
    buffer_size: usize,
    num_buffers: usize,
    socket_id: u32,
    huge_pages: bool,
}

// SAFETY: the arena itself is only a mapping plus metadata; all mutation
// goes through Slot handles whose exclusivity the ring discipline enforces.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Reserve `mem_size` bytes on `socket_id`, carved into
    /// `mem_size / buffer_size` slots.
    pub fn new(
        mem_size: usize,
        buffer_size: usize,
        socket_id: u32,
        logger: &Logger,
    ) -> Result<Self, SharedBufferError> {
        if mem_size == 0 || buffer_size == 0 {
            return Err(SharedBufferError::ZeroSize);
        }
        let num_buffers = mem_size / buffer_size;
        if num_buffers == 0 {
            return Err(SharedBufferError::BufferExceedsRegion {
                mem_size,
                buffer_size,
            });
        }

        let name = shared_mem_name(socket_id);
        let len = NonZeroUsize::new(mem_size).ok_or(SharedBufferError::ZeroSize)?;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;

        let huge_flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        let (base, huge_pages) = match unsafe { mmap_anonymous(None, len, prot, huge_flags) } {
            Ok(ptr) => (ptr.cast::<u8>(), true),
            Err(_) => {
                logger.warning(
                    Facility::SharedBuffer,
                    &format!(
                        "no huge pages available for {} ({} bytes), falling back to normal pages",
                        name, mem_size
                    ),
                );
                let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
                match unsafe { mmap_anonymous(None, len, prot, flags) } {
                    Ok(ptr) => (ptr.cast::<u8>(), false),
                    Err(source) => {
                        return Err(SharedBufferError::ReserveFailed {
                            name,
                            mem_size,
                            source,
                        })
                    }
                }
            }
        };

        logger.debug(
            Facility::SharedBuffer,
            &format!(
                "created shared buffer {} of size {} on socket {} ({} slots of {} bytes, huge pages: {})",
                name, mem_size, socket_id, num_buffers, buffer_size, huge_pages
            ),
        );

        Ok(Self {
            name,
            base,
            mem_size,
            buffer_size,
            num_buffers,
            socket_id,
            huge_pages,
        })
    }

    /// Handle to the slot starting at index `buffer`.
    ///
    /// # Panics
    /// Panics if `buffer >= num_buffers`.
    pub fn slot(&self, buffer: usize) -> Slot {
        assert!(buffer < self.num_buffers, "slot index out of range");
        // SAFETY: in-range slot, region owned by self, slots never overlap.
        unsafe {
            let ptr = self.base.as_ptr().add(buffer * self.buffer_size);
            Slot::from_raw_parts(NonNull::new_unchecked(ptr), self.buffer_size)
        }
    }

    /// Start address of slot `buffer`, without constructing a handle.
    pub fn address_of(&self, buffer: usize) -> usize {
        assert!(buffer < self.num_buffers, "slot index out of range");
        self.base.as_ptr() as usize + buffer * self.buffer_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn on_huge_pages(&self) -> bool {
        self.huge_pages
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // SAFETY: base/mem_size came from mmap and are unmapped exactly once.
        unsafe {
            let _ = munmap(self.base.cast(), self.mem_size);
        }
    }
}

/// Region name, keyed by socket: `"smb_{socket:02}"`.
pub fn shared_mem_name(socket_id: u32) -> String {
    format!("smb_{:02}", socket_id)
}
