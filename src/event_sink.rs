//! Process-wide diagnostic event log
//!
//! One `EventSink` is built at startup and handed to every component that
//! reports progress. It keeps a bounded FIFO of [`LogEntry`] values, fans new
//! entries out to subscribers and mirrors them into `tracing`.
//!
//! ## Coalescing
//! A repeat of the immediately preceding `(level, category, message)` does not
//! append: the existing entry's message gains a ` (xN)` counter, its timestamp
//! is refreshed and subscribers are notified again with the updated entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::config::DEFAULT_LOG_CAPACITY;
use crate::listeners::{ListenerSet, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warn,
    Error,
    System,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::System => "system",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Network,
    Recognition,
    Health,
    System,
    User,
    Diagnostic,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogCategory::Network => "network",
            LogCategory::Recognition => "recognition",
            LogCategory::Health => "health",
            LogCategory::System => "system",
            LogCategory::User => "user",
            LogCategory::Diagnostic => "diagnostic",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Unique, strictly increasing per sink
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Snapshot filter for [`EventSink::entries`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub category: Option<LogCategory>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn level(level: LogLevel) -> Self {
        Self {
            level: Some(level),
            ..Default::default()
        }
    }

    pub fn category(category: LogCategory) -> Self {
        Self {
            category: Some(category),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        self.level.map_or(true, |l| l == entry.level)
            && self.category.map_or(true, |c| c == entry.category)
    }
}

struct RepeatTracker {
    level: LogLevel,
    category: LogCategory,
    message: String,
    count: u32,
    entry_id: u64,
}

struct Buffer {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    last: Option<RepeatTracker>,
}

pub struct EventSink {
    capacity: usize,
    buffer: Mutex<Buffer>,
    listeners: ListenerSet<LogEntry>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(Buffer {
                entries: VecDeque::with_capacity(capacity),
                next_id: 0,
                last: None,
            }),
            listeners: ListenerSet::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append (or coalesce) an entry and notify subscribers. Never fails.
    pub fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
        stack: Option<String>,
    ) -> u64 {
        let message = message.into();
        let now = Utc::now();

        let (entry, is_repeat) = {
            let mut buffer = self.lock();

            let repeat_id = match buffer.last.as_mut() {
                Some(last)
                    if last.level == level
                        && last.category == category
                        && last.message == message =>
                {
                    last.count += 1;
                    Some((last.entry_id, last.count))
                }
                _ => None,
            };

            match repeat_id.and_then(|(id, count)| {
                buffer
                    .entries
                    .iter_mut()
                    .rev()
                    .find(|e| e.id == id)
                    .map(|e| (e, count))
            }) {
                Some((existing, count)) => {
                    existing.message = format!("{} (x{})", message, count);
                    existing.timestamp = now;
                    (existing.clone(), true)
                }
                None => {
                    buffer.next_id += 1;
                    let entry = LogEntry {
                        id: buffer.next_id,
                        timestamp: now,
                        level,
                        category,
                        message: message.clone(),
                        details,
                        stack,
                    };

                    buffer.entries.push_back(entry.clone());
                    while buffer.entries.len() > self.capacity {
                        buffer.entries.pop_front();
                    }
                    buffer.last = Some(RepeatTracker {
                        level,
                        category,
                        message,
                        count: 1,
                        entry_id: entry.id,
                    });
                    crate::metrics::EVENT_LOG_ENTRIES.set(buffer.entries.len() as i64);
                    (entry, false)
                }
            }
        };

        if !is_repeat {
            mirror_to_tracing(&entry);
        }

        for failure in self.listeners.notify(&entry) {
            tracing::warn!(
                listener = failure.listener_id,
                error = %failure.message,
                "Event sink listener failed"
            );
        }

        entry.id
    }

    pub fn debug(&self, category: LogCategory, message: impl Into<String>) -> u64 {
        self.log(LogLevel::Debug, category, message, None, None)
    }

    pub fn info(&self, category: LogCategory, message: impl Into<String>) -> u64 {
        self.log(LogLevel::Info, category, message, None, None)
    }

    pub fn success(&self, category: LogCategory, message: impl Into<String>) -> u64 {
        self.log(LogLevel::Success, category, message, None, None)
    }

    pub fn warn(&self, category: LogCategory, message: impl Into<String>) -> u64 {
        self.log(LogLevel::Warn, category, message, None, None)
    }

    pub fn system(&self, category: LogCategory, message: impl Into<String>) -> u64 {
        self.log(LogLevel::System, category, message, None, None)
    }

    /// Log an error together with its `source()` chain as the stack field.
    pub fn error(
        &self,
        category: LogCategory,
        message: impl Into<String>,
        err: Option<&(dyn std::error::Error + 'static)>,
    ) -> u64 {
        let stack = err.map(|e| {
            let mut chain = e.to_string();
            let mut source = e.source();
            while let Some(cause) = source {
                chain.push_str("\n  caused by: ");
                chain.push_str(&cause.to_string());
                source = cause.source();
            }
            chain
        });
        self.log(LogLevel::Error, category, message, None, stack)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Defensive copy of the buffer, oldest first.
    pub fn entries(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let buffer = self.lock();
        let mut matched: Vec<LogEntry> = buffer
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let removed = {
            let mut buffer = self.lock();
            let removed = buffer.entries.len();
            buffer.entries.clear();
            buffer.last = None;
            removed
        };

        self.log(
            LogLevel::System,
            LogCategory::System,
            "Logs cleared",
            Some(serde_json::json!({ "removed": removed })),
            None,
        );
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    let category = entry.category.to_string();
    match entry.level {
        LogLevel::Debug => {
            tracing::debug!(entry_id = entry.id, category = %category, "{}", entry.message)
        }
        LogLevel::Info | LogLevel::Success | LogLevel::System => {
            tracing::info!(entry_id = entry.id, category = %category, "{}", entry.message)
        }
        LogLevel::Warn => {
            tracing::warn!(entry_id = entry.id, category = %category, "{}", entry.message)
        }
        LogLevel::Error => {
            tracing::error!(entry_id = entry.id, category = %category, "{}", entry.message)
        }
    }
}
