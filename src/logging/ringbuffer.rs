// Lock-free multi-producer ring buffer for log entries
//
// Producers (worker cores) reserve a sequence number with a fetch-add and
// copy their record into the corresponding slot; a single consumer thread
// drains in sequence order. Writers never block: if the consumer falls
// behind, old entries are overwritten and the overrun counter incremented.

use super::entry::{LogEntry, EMPTY, READY, WRITING};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-aligned wrapper to prevent false sharing between the write and
/// read cursors.
#[repr(align(64))]
struct CacheAligned<T>(T);

pub struct MpscRingBuffer {
    entries: Box<[UnsafeCell<LogEntry>]>,
    capacity: usize,
    write_seq: CacheAligned<AtomicU64>,
    read_seq: CacheAligned<AtomicU64>,
    overruns: AtomicU64,
}

// SAFETY: concurrent producers each own a distinct slot reserved via the
// write_seq fetch-add, and the per-slot state machine (EMPTY -> WRITING ->
// READY -> EMPTY) keeps the single consumer from observing a slot
// mid-write. A lapped slot is re-entered as WRITING, which the consumer
// skips past rather than reading torn data.
unsafe impl Sync for MpscRingBuffer {}

impl MpscRingBuffer {
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");

        let entries: Vec<UnsafeCell<LogEntry>> = (0..capacity)
            .map(|_| UnsafeCell::new(LogEntry::default()))
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            capacity,
            write_seq: CacheAligned(AtomicU64::new(0)),
            read_seq: CacheAligned(AtomicU64::new(0)),
            overruns: AtomicU64::new(0),
        }
    }

    /// Write an entry (lock-free, any producer thread). Never blocks; drops
    /// the oldest entries on overflow.
    pub fn write(&self, mut entry: LogEntry) {
        let seq = self.write_seq.0.fetch_add(1, Ordering::Relaxed);
        let pos = (seq as usize) & (self.capacity - 1);

        let read_seq = self.read_seq.0.load(Ordering::Acquire);
        if seq >= read_seq + self.capacity as u64 {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }

        entry.sequence = seq;

        unsafe {
            let slot = &mut *self.entries[pos].get();
            slot.state.store(WRITING, Ordering::Release);
            slot.timestamp_ns = entry.timestamp_ns;
            slot.sequence = entry.sequence;
            slot.severity = entry.severity;
            slot.facility = entry.facility;
            slot.lcore_id = entry.lcore_id;
            slot.message_len = entry.message_len;
            slot.message = entry.message;
            slot.state.store(READY, Ordering::Release);
        }
    }

    /// Read the next entry (single consumer only). Returns `None` when the
    /// buffer is empty or the next slot is still being written.
    pub fn read(&self) -> Option<LogEntry> {
        let read_seq = self.read_seq.0.load(Ordering::Relaxed);
        let write_seq = self.write_seq.0.load(Ordering::Acquire);

        if read_seq >= write_seq {
            return None;
        }

        let pos = (read_seq as usize) & (self.capacity - 1);

        let mut spins = 0;
        loop {
            let state = unsafe { (*self.entries[pos].get()).state.load(Ordering::Acquire) };
            if state == READY {
                break;
            }
            if spins > 1000 {
                // Writer stalled mid-copy; try again on the next drain pass.
                return None;
            }
            spins += 1;
            std::hint::spin_loop();
        }

        let entry = unsafe { (*self.entries[pos].get()).clone() };

        unsafe {
            (*self.entries[pos].get()).state.store(EMPTY, Ordering::Release);
        }
        self.read_seq.0.store(read_seq + 1, Ordering::Release);

        Some(entry)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
