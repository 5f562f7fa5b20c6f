//! Per-job log tails.
//!
//! Every line a job logs through its context is kept in the job's log tail
//! and mirrored to `tracing`. Sub-jobs that are not isolated write into their
//! parent's tail so the whole call chain reads as a single stream.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink holding the most recent log lines of a job.
pub trait LogTail: Send + Sync + fmt::Debug {
    /// Append a line.
    fn append(&self, entry: LogEntry);

    /// All retained lines, oldest first.
    fn entries(&self) -> Vec<LogEntry>;

    /// Number of retained lines.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines at or above `level`.
    fn entries_at_least(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level >= level)
            .collect()
    }
}

/// Bounded in-memory log tail; the oldest lines are dropped first.
#[derive(Debug)]
pub struct MemoryLogTail {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MemoryLogTail {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryLogTail {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl LogTail for MemoryLogTail {
    fn append(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tail_keeps_most_recent() {
        let tail = MemoryLogTail::new(2);
        tail.append(LogEntry::new(LogLevel::Info, "one"));
        tail.append(LogEntry::new(LogLevel::Info, "two"));
        tail.append(LogEntry::new(LogLevel::Warn, "three"));

        let messages: Vec<_> = tail.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn test_filter_by_level() {
        let tail = MemoryLogTail::default();
        tail.append(LogEntry::new(LogLevel::Debug, "noise"));
        tail.append(LogEntry::new(LogLevel::Error, "boom"));

        let errors = tail.entries_at_least(LogLevel::Warn);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
        assert!(!tail.is_empty());
    }
}
