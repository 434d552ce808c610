// Fixed-size log entry record

use super::{Facility, Severity};
use std::sync::atomic::AtomicU8;
use std::time::{SystemTime, UNIX_EPOCH};

/// Slot states for the ring buffer entry state machine.
pub(crate) const EMPTY: u8 = 0;
pub(crate) const WRITING: u8 = 1;
pub(crate) const READY: u8 = 2;

/// Maximum message bytes stored inline; longer messages are truncated.
pub const MAX_MESSAGE_LEN: usize = 208;

/// A fixed-size log record.
///
/// Entries are copied field-by-field into pre-allocated ring slots, so the
/// layout is all plain integers plus an inline message buffer. No heap
/// allocation happens on the write path.
pub struct LogEntry {
    pub(crate) state: AtomicU8,
    pub timestamp_ns: u64,
    pub sequence: u64,
    pub severity: Severity,
    pub facility: Facility,
    /// lcore that produced the record, 255 when unknown
    pub lcore_id: u8,
    pub message_len: u8,
    pub message: [u8; MAX_MESSAGE_LEN],
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            timestamp_ns: 0,
            sequence: 0,
            severity: Severity::Debug,
            facility: Facility::Unknown,
            lcore_id: 255,
            message_len: 0,
            message: [0u8; MAX_MESSAGE_LEN],
        }
    }
}

impl Clone for LogEntry {
    fn clone(&self) -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
            severity: self.severity,
            facility: self.facility,
            lcore_id: self.lcore_id,
            message_len: self.message_len,
            message: self.message,
        }
    }
}

impl LogEntry {
    pub fn new(severity: Severity, facility: Facility, message: &str) -> Self {
        let mut entry = Self {
            timestamp_ns: wall_clock_ns(),
            severity,
            facility,
            ..Default::default()
        };
        entry.set_message(message);
        entry
    }

    /// Store a message, truncating at a UTF-8 boundary if necessary.
    pub fn set_message(&mut self, message: &str) {
        let bytes = message.as_bytes();
        let mut len = bytes.len().min(MAX_MESSAGE_LEN);
        while len > 0 && !message.is_char_boundary(len) {
            len -= 1;
        }
        self.message[..len].copy_from_slice(&bytes[..len]);
        self.message_len = len as u8;
    }

    pub fn message(&self) -> &str {
        std::str::from_utf8(&self.message[..self.message_len as usize]).unwrap_or("<invalid utf8>")
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
