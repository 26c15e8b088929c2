//! Refresh progress log.
//!
//! Every pipeline step reports a human-readable line such as
//!
//! ```text
//! [14:02:11] (DOB) Requesting records...
//! [14:02:13] (DOB) Folded 1,204 records at the same site
//! ```
//!
//! Lines are appended to a bounded history, broadcast to live subscribers
//! (the `/logs` SSE stream), and mirrored to `tracing`. A subscriber that
//! connects late first replays the history and then follows the live channel;
//! [`ProgressLog::subscribe`] takes both under one lock so nothing is missed
//! or repeated between the two.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A single progress line.
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub level: LogLevel,
    /// Short tag of the emitting module, e.g. `DOB` or `Permits`.
    pub label: String,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] ({}) {}",
            self.at.format("%H:%M:%S"),
            self.label,
            self.message
        )
    }
}

/// Append-only progress buffer with publish/subscribe.
pub struct ProgressLog {
    history: Mutex<VecDeque<LogLine>>,
    limit: usize,
    tx: broadcast::Sender<LogLine>,
}

impl ProgressLog {
    /// `history_limit` bounds the replay buffer; `capacity` bounds how far a
    /// live subscriber may lag before it starts missing lines.
    pub fn new(history_limit: usize, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            history: Mutex::new(VecDeque::new()),
            limit: history_limit.max(1),
            tx,
        }
    }

    pub fn emit(&self, level: LogLevel, label: &str, message: impl Into<String>) {
        let line = LogLine {
            at: Local::now(),
            level,
            label: label.to_string(),
            message: message.into(),
        };

        match level {
            LogLevel::Info => tracing::info!(source = %line.label, "{}", line.message),
            LogLevel::Warn => tracing::warn!(source = %line.label, "{}", line.message),
            LogLevel::Error => tracing::error!(source = %line.label, "{}", line.message),
        }

        let mut history = self.lock();
        if history.len() == self.limit {
            history.pop_front();
        }
        history.push_back(line.clone());
        // No receivers is fine.
        let _ = self.tx.send(line);
    }

    pub fn info(&self, label: &str, message: impl Into<String>) {
        self.emit(LogLevel::Info, label, message);
    }

    pub fn warn(&self, label: &str, message: impl Into<String>) {
        self.emit(LogLevel::Warn, label, message);
    }

    pub fn error(&self, label: &str, message: impl Into<String>) {
        self.emit(LogLevel::Error, label, message);
    }

    /// Snapshot of the history plus a receiver for every later line.
    pub fn subscribe(&self) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let history = self.lock();
        let rx = self.tx.subscribe();
        (history.iter().cloned().collect(), rx)
    }

    pub fn history(&self) -> Vec<LogLine> {
        self.lock().iter().cloned().collect()
    }

    /// The history rendered one line per entry.
    pub fn history_text(&self) -> String {
        let mut out = String::new();
        for line in self.lock().iter() {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogLine>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new(10_000, 256)
    }
}

/// Format a count with thousands separators: `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// `part` as a whole-number percentage of `total`; `0` when `total` is zero.
pub fn percent(part: usize, total: usize) -> u64 {
    if total == 0 {
        0
    } else {
        ((part as f64 / total as f64) * 100.0).round() as u64
    }
}
