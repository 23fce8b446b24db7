//! Diagnostics log for connection and streaming events
//!
//! A bounded, append-only ring of human-readable entries shown to the
//! operator. Entries are never modified after creation; once the ring is full
//! the oldest entry is evicted. Every append is also mirrored to the `log`
//! facade.
//!
//! A message identical to one appended within the dedup window (default 1 s)
//! is dropped, not stored. Eviction therefore only applies to distinct
//! messages: 101 copies of one message in a burst leave a single entry.
//!
//! Appends go through one mutex, so concurrent writers (capture thread,
//! connection task, CLI) see a single order with no lost updates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of entries retained
pub const DEFAULT_CAPACITY: usize = 100;

/// Identical messages within this window are collapsed into one entry
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Info,
    Success,
    Error,
    Websocket,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Info => "info",
            LogCategory::Success => "success",
            LogCategory::Error => "error",
            LogCategory::Websocket => "websocket",
        }
    }

    fn level(&self) -> log::Level {
        match self {
            LogCategory::Error => log::Level::Warn,
            LogCategory::Websocket => log::Level::Debug,
            LogCategory::Info | LogCategory::Success => log::Level::Info,
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One diagnostics event
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Strictly increasing within one log
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    /// Last time each recent message was appended (for dedup)
    recent: VecDeque<(Instant, String)>,
}

/// Bounded ring of [`LogEntry`] values.
pub struct DiagnosticsLog {
    inner: Mutex<Inner>,
    capacity: usize,
    dedup_window: Duration,
}

impl DiagnosticsLog {
    pub fn new(capacity: usize) -> Self {
        Self::with_dedup_window(capacity, DEFAULT_DEDUP_WINDOW)
    }

    /// A zero window disables duplicate suppression.
    pub fn with_dedup_window(capacity: usize, dedup_window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                next_id: 1,
                recent: VecDeque::new(),
            }),
            capacity,
            dedup_window,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry. Returns its id, or `None` if it was suppressed as a
    /// duplicate of a message appended within the dedup window.
    pub fn append(
        &self,
        category: LogCategory,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Option<u64> {
        let message = message.into();
        let now = Instant::now();

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !self.dedup_window.is_zero() {
            let window = self.dedup_window;
            inner
                .recent
                .retain(|(at, _)| now.duration_since(*at) < window);
            if inner.recent.iter().any(|(_, m)| *m == message) {
                log::trace!("Diagnostics: suppressed duplicate '{}'", message);
                return None;
            }
            inner.recent.push_back((now, message.clone()));
        }

        let id = inner.next_id;
        inner.next_id += 1;

        log::log!(category.level(), "[{}] {}", category, message);

        inner.entries.push_back(LogEntry {
            id,
            timestamp: Utc::now(),
            category,
            message,
            metadata,
        });

        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }

        Some(id)
    }

    pub fn info(&self, message: impl Into<String>) -> Option<u64> {
        self.append(LogCategory::Info, message, None)
    }

    pub fn success(&self, message: impl Into<String>) -> Option<u64> {
        self.append(LogCategory::Success, message, None)
    }

    pub fn error(&self, message: impl Into<String>) -> Option<u64> {
        self.append(LogCategory::Error, message, None)
    }

    pub fn websocket(&self, message: impl Into<String>) -> Option<u64> {
        self.append(LogCategory::Websocket, message, None)
    }

    /// Copy of the current entries, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        match self.inner.lock() {
            Ok(inner) => inner.entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().entries.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries of one category, oldest first
    pub fn by_category(&self, category: LogCategory) -> Vec<LogEntry> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.recent.clear();
        }
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
