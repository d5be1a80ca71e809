//! Bounded diagnostic log buffer
//!
//! Every step the controller takes is recorded here so a UI can show it
//! after the fact. Entries are also mirrored to the `log` facade.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use parking_lot::Mutex;

/// Default number of retained entries
pub const DEFAULT_MAX_ENTRIES: usize = 200;

/// Severity of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Line reported by the tunneling engine itself
    Engine,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Engine => write!(f, "ENGINE"),
        }
    }
}

/// One timestamped line
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}

/// Thread-safe FIFO buffer holding at most `max_entries` lines
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    max_entries: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LogBuffer {
    /// Create a buffer. A zero capacity is raised to one.
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Maximum number of retained entries
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Append a line, evicting the oldest if full
    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();

        match level {
            LogLevel::Debug => log::debug!("{}", message),
            LogLevel::Info => log::info!("{}", message),
            LogLevel::Warning => log::warn!("{}", message),
            LogLevel::Error => log::error!("{}", message),
            LogLevel::Engine => log::info!(target: "tunkeep::engine", "{}", message),
        }

        // Stamped under the lock so timestamps follow buffer order
        let mut entries = self.entries.lock();
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message,
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.append(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.append(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    pub fn engine(&self, message: impl Into<String>) {
        self.append(LogLevel::Engine, message);
    }

    /// Copy of the current entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Rendered copy of the current entries, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_eviction() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.info(format!("line {}", i));
        }

        let messages: Vec<String> = buf.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_entry_format() {
        let buf = LogBuffer::default();
        buf.engine("handshake done");

        let line = &buf.snapshot()[0];
        assert!(line.starts_with('['));
        assert!(line.ends_with("] ENGINE: handshake done"));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let buf = LogBuffer::new(10);
        buf.info("first");
        let snap = buf.snapshot();
        buf.info("second");
        buf.clear();

        assert_eq!(snap.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_concurrent_appends_stay_bounded() {
        let buf = Arc::new(LogBuffer::new(50));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        buf.debug(format!("{}:{}", t, i));
                        assert!(buf.len() <= 50);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let entries = buf.entries();
        assert_eq!(entries.len(), 50);

        // Per-writer order survives eviction
        for t in 0..8 {
            let seq: Vec<u32> = entries
                .iter()
                .filter_map(|e| {
                    let (w, i) = e.message.split_once(':')?;
                    (w == t.to_string()).then(|| i.parse().ok()).flatten()
                })
                .collect();
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_timestamps_follow_buffer_order() {
        let buf = Arc::new(LogBuffer::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        buf.info(format!("{}:{}", t, i));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let entries = buf.entries();
        assert_eq!(entries.len(), 800);
        assert!(entries
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let buf = LogBuffer::new(0);
        buf.warn("kept");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.len(), 1);
    }
}
