//! Diagnostics sinks.
//!
//! Pipeline stages report progress and non-fatal problems through a
//! [`DiagnosticsSink`] passed down the call chain rather than through global
//! logger state. [`LogSink`] forwards to the `log` facade, [`CollectingSink`]
//! keeps entries in memory (tests, result bundles), [`NullSink`] discards.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Detailed tracing of fit internals
    Debug,
    /// Progress information
    Info,
    /// Non-fatal problems (dropped peaks, failed fits)
    Warn,
}

/// One diagnostic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity
    pub level: Level,
    /// Pipeline stage that emitted the message (e.g. `"find_peaks"`)
    pub stage: String,
    /// Human-readable message
    pub message: String,
}

/// Receiver of diagnostics; shared across worker threads.
pub trait DiagnosticsSink: Send + Sync {
    /// Record one diagnostic.
    fn record(&self, diagnostic: Diagnostic);

    /// Record at [`Level::Debug`].
    fn debug(&self, stage: &str, message: String) {
        self.record(Diagnostic { level: Level::Debug, stage: stage.to_string(), message });
    }

    /// Record at [`Level::Info`].
    fn info(&self, stage: &str, message: String) {
        self.record(Diagnostic { level: Level::Info, stage: stage.to_string(), message });
    }

    /// Record at [`Level::Warn`].
    fn warn(&self, stage: &str, message: String) {
        self.record(Diagnostic { level: Level::Warn, stage: stage.to_string(), message });
    }
}

/// Forwards every diagnostic to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn record(&self, d: Diagnostic) {
        match d.level {
            Level::Debug => log::debug!("{}: {}", d.stage, d.message),
            Level::Info => log::info!("{}: {}", d.stage, d.message),
            Level::Warn => log::warn!("{}: {}", d.stage, d.message),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn record(&self, _diagnostic: Diagnostic) {}
}

/// Stores diagnostics in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain recorded entries.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Whether any entry at `level` mentions `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|d| d.level == level && d.message.contains(needle))
    }
}

impl DiagnosticsSink for CollectingSink {
    fn record(&self, diagnostic: Diagnostic) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(diagnostic);
    }
}

/// Forwards to an inner sink while keeping a copy of every entry.
pub struct RecordingSink<'a> {
    inner: &'a dyn DiagnosticsSink,
    recorded: CollectingSink,
}

impl<'a> RecordingSink<'a> {
    /// Wrap `inner`.
    pub fn new(inner: &'a dyn DiagnosticsSink) -> Self {
        Self { inner, recorded: CollectingSink::new() }
    }

    /// Drain the copies recorded so far.
    pub fn take(&self) -> Vec<Diagnostic> {
        self.recorded.take()
    }
}

impl DiagnosticsSink for RecordingSink<'_> {
    fn record(&self, diagnostic: Diagnostic) {
        self.recorded.record(diagnostic.clone());
        self.inner.record(diagnostic);
    }
}
