// Log consumer thread - drains the ring buffer and formats entries

use super::entry::LogEntry;
use super::ringbuffer::MpscRingBuffer;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Output sink for log entries.
pub trait LogSink: Send {
    fn write_entry(&mut self, entry: &LogEntry);
    fn flush(&mut self);
}

/// Standard error sink.
pub struct StderrSink {
    stderr: std::io::Stderr,
}

impl StderrSink {
    pub fn new() -> Self {
        Self {
            stderr: std::io::stderr(),
        }
    }
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StderrSink {
    fn write_entry(&mut self, entry: &LogEntry) {
        // Format: [TIMESTAMP] [SEVERITY] [Facility] message
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(
            self.stderr,
            "[{}] [{}] [{}] {}",
            timestamp,
            entry.severity.as_str(),
            entry.facility.as_str(),
            entry.message()
        );
    }

    fn flush(&mut self) {
        let _ = self.stderr.flush();
    }
}

/// Handle to a running consumer thread. Stops and joins on [`stop`] or drop.
pub struct ConsumerHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Stop the consumer after a final drain pass.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a consumer thread draining `ring` into `sink`.
pub(crate) fn spawn(ring: Arc<MpscRingBuffer>, mut sink: Box<dyn LogSink>) -> ConsumerHandle {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    let handle = std::thread::Builder::new()
        .name("log-consumer".to_string())
        .spawn(move || {
            while running_clone.load(Ordering::Acquire) {
                let mut drained = false;
                while let Some(entry) = ring.read() {
                    sink.write_entry(&entry);
                    drained = true;
                }
                if drained {
                    sink.flush();
                } else {
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
            // Final drain so shutdown messages are not lost.
            while let Some(entry) = ring.read() {
                sink.write_entry(&entry);
            }
            sink.flush();
        })
        .expect("failed to spawn log consumer thread");

    ConsumerHandle {
        running,
        handle: Some(handle),
    }
}
