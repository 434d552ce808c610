// Logger handle for writing records into the shared ring

use super::entry::LogEntry;
use super::ringbuffer::MpscRingBuffer;
use super::{Facility, Severity};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Cloneable, lock-free logging handle.
///
/// Filtering happens on the write side so suppressed records cost one atomic
/// load and nothing else. The minimum level is shared across all clones, so
/// a runtime `loglevel` change applies to every core at once.
pub struct Logger {
    ring: Arc<MpscRingBuffer>,
    min_severity: Arc<AtomicU8>,
}

impl Logger {
    pub fn new(ring: Arc<MpscRingBuffer>, min_severity: Severity) -> Self {
        Self {
            ring,
            min_severity: Arc::new(AtomicU8::new(min_severity.as_u8())),
        }
    }

    /// Change the minimum severity for this logger and all of its clones.
    pub fn set_min_severity(&self, severity: Severity) {
        self.min_severity.store(severity.as_u8(), Ordering::Relaxed);
    }

    pub fn min_severity(&self) -> Severity {
        Severity::from_u8(self.min_severity.load(Ordering::Relaxed)).unwrap_or(Severity::Debug)
    }

    #[inline]
    pub fn enabled(&self, severity: Severity) -> bool {
        severity.as_u8() <= self.min_severity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if !self.enabled(severity) {
            return;
        }
        self.ring.write(LogEntry::new(severity, facility, message));
    }

    #[inline]
    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            min_severity: Arc::clone(&self.min_severity),
        }
    }
}
