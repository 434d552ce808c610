// Lock-free logging for the pipeline cores.
//
// Worker cores run busy-polling loops that must never block on I/O, so log
// records are written into a lock-free ring buffer and drained by a
// background consumer thread. Overruns overwrite the oldest entries and are
// counted rather than reported per-message.

mod consumer;
mod entry;
mod facility;
mod logger;
mod ringbuffer;
mod severity;

pub use consumer::{ConsumerHandle, LogSink, StderrSink};
pub use entry::LogEntry;
pub use facility::Facility;
pub use logger::Logger;
pub use ringbuffer::MpscRingBuffer;
pub use severity::Severity;

use std::sync::Arc;

/// Default number of entries in the shared log ring.
pub const DEFAULT_LOG_RING_CAPACITY: usize = 4096;

/// Set up the standard logging pair: a cloneable [`Logger`] handle for the
/// pipeline cores and a consumer thread draining to stderr.
pub fn stderr_logging(min_severity: Severity) -> (Logger, ConsumerHandle) {
    let ring = Arc::new(MpscRingBuffer::new(DEFAULT_LOG_RING_CAPACITY));
    let logger = Logger::new(Arc::clone(&ring), min_severity);
    let consumer = consumer::spawn(ring, Box::new(StderrSink::new()));
    (logger, consumer)
}

/// A logger with no consumer attached. Writes land in a small ring and are
/// overwritten; useful for tests and embedders that install their own drain.
pub fn null_logger() -> Logger {
    Logger::new(Arc::new(MpscRingBuffer::new(64)), Severity::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_logger_never_blocks() {
        let logger = null_logger();
        for i in 0..1000 {
            logger.info(Facility::Test, &format!("message {}", i));
        }
    }
}
