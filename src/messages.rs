//! Protocol event journal.
//!
//! Transfer and registry events (file served, file received, rejected source,
//! hash mismatch) are reported to an injected [`MessageSink`]. This is separate
//! from `tracing` diagnostics: a sink is the user-facing record of what the
//! node did, and callers choose where it goes.
//!
//! - [`MemorySink`]: bounded ring buffer with monotonic ids, readable with
//!   [`MemorySink::read_since`]
//! - [`FileSink`]: appends one line per message to a file
//! - [`TracingSink`]: forwards to the `tracing` pipeline

use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warn,
    Msg,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Msg => "MSG",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability for recording protocol events. Must not block for long; it is
/// called from connection handlers.
pub trait MessageSink: Send + Sync {
    fn add(&self, text: &str, severity: Severity);
}

/// A recorded message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub severity: Severity,
    pub text: String,
}

fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    ms
}

/// In-memory ring buffer. Oldest entries are dropped once `max_entries` is reached.
pub struct MemorySink {
    entries: Mutex<VecDeque<Message>>,
    next_id: AtomicU64,
    max_entries: usize,
}

impl MemorySink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(1024))),
            next_id: AtomicU64::new(1),
            max_entries: max_entries.max(1),
        }
    }

    /// Entries with `id > since_id`, oldest first, up to `limit`.
    pub fn read_since(&self, since_id: u64, limit: usize) -> Vec<Message> {
        self.entries
            .lock()
            .iter()
            .filter(|m| m.id > since_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(500)
    }
}

impl MessageSink for MemorySink {
    fn add(&self, text: &str, severity: Severity) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = Message {
            id,
            timestamp: now_ms(),
            severity,
            text: text.to_string(),
        };
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(msg);
    }
}

/// Appends `<unix_ms> <SEVERITY> <text>` lines to a file.
pub struct FileSink {
    file: Mutex<std::fs::File>,
}

impl FileSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MessageSink for FileSink {
    fn add(&self, text: &str, severity: Severity) {
        let line = format!("{} {} {}\n", now_ms(), severity, text.replace('\n', " "));
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            tracing::warn!("message sink write failed: {e}");
        }
    }
}

/// Forwards messages to `tracing` under the `aero::messages` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn add(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Error => tracing::error!(target: "aero::messages", "{text}"),
            Severity::Warn => tracing::warn!(target: "aero::messages", "{text}"),
            Severity::Msg => tracing::info!(target: "aero::messages", "{text}"),
        }
    }
}
