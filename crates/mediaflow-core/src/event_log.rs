use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use mediaflow_types::{LogEntry, LogLevel};
use tokio::sync::broadcast;

const LOG_TARGET: &str = "mediaflow.log";

/// User-facing orchestration log: a bounded ring of recent entries plus a
/// live broadcast. Every entry is mirrored to `tracing`.
#[derive(Clone)]
pub struct EventLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    tx: broadcast::Sender<LogEntry>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        };
        match level {
            LogLevel::Info => tracing::info!(target: LOG_TARGET, "{}", entry.message),
            LogLevel::Warning => tracing::warn!(target: LOG_TARGET, "{}", entry.message),
            LogLevel::Error => tracing::error!(target: LOG_TARGET, "{}", entry.message),
        }
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push_front(entry.clone());
            entries.truncate(self.capacity);
        }
        let _ = self.tx.send(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_newest_entries() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.info(format!("entry {i}"));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "entry 4");
        assert_eq!(recent[2].message, "entry 2");
    }

    #[tokio::test]
    async fn subscribers_receive_new_entries() {
        let log = EventLog::new(10);
        let mut rx = log.subscribe();
        log.warn("slow upstream");
        let entry = rx.recv().await.expect("entry");
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.message, "slow upstream");
    }
}
