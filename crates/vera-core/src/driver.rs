//! Uniform driver surface shared by every simulation driver.
//!
//! A driver owns an immutable options record and a results value, runs to
//! completion (or cancellation) on `run()`, and reports through three
//! channels: a non-blocking atomic cancel flag checked at iteration
//! boundaries, optional progress/text callbacks, and an append-only
//! [`Logger`] of entries keyed by device uid.
//!
//! The harness is deliberately free of any UI toolkit: callbacks are plain
//! boxed functions, and the externally observable behaviour of a driver is
//! single-threaded even when it forks worker threads internally.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One append-only record: what happened, how bad, and on which device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub severity: Severity,
    /// Uid of the device the message refers to, if any.
    pub device_uid: Option<u64>,
    pub message: String,
}

/// Append-only log of warnings and errors produced during a driver run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Logger {
    entries: Vec<LogEntry>,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_info(&mut self, message: impl Into<String>) {
        self.entries.push(LogEntry {
            severity: Severity::Info,
            device_uid: None,
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.entries.push(LogEntry {
            severity: Severity::Warning,
            device_uid: None,
            message: message.into(),
        });
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.entries.push(LogEntry {
            severity: Severity::Error,
            device_uid: None,
            message: message.into(),
        });
    }

    /// Record an entry against a specific device.
    pub fn add_device_entry(
        &mut self,
        severity: Severity,
        device_uid: u64,
        message: impl Into<String>,
    ) {
        self.entries.push(LogEntry {
            severity,
            device_uid: Some(device_uid),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn errors(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Merge another logger's entries into this one.
    pub fn extend(&mut self, other: Logger) {
        self.entries.extend(other.entries);
    }
}

impl fmt::Display for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            let tag = match e.severity {
                Severity::Info => "INFO",
                Severity::Warning => "WARN",
                Severity::Error => "ERROR",
            };
            match e.device_uid {
                Some(uid) => writeln!(f, "[{tag}] (uid {uid}) {}", e.message)?,
                None => writeln!(f, "[{tag}] {}", e.message)?,
            }
        }
        Ok(())
    }
}

/// Progress callback: `(current, total)`.
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;
/// Text callback for human-readable status lines.
pub type TextFn = Box<dyn Fn(&str) + Send + Sync>;

/// Shared plumbing embedded by every driver: cancellation flag, callbacks
/// and the run logger.
pub struct DriverHarness {
    cancel: Arc<AtomicBool>,
    progress_fn: Option<ProgressFn>,
    text_fn: Option<TextFn>,
    pub logger: Logger,
}

impl Default for DriverHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverHarness {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            progress_fn: None,
            text_fn: None,
            logger: Logger::new(),
        }
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, f: ProgressFn) -> Self {
        self.progress_fn = Some(f);
        self
    }

    /// Attach a text callback.
    pub fn with_text(mut self, f: TextFn) -> Self {
        self.text_fn = Some(f);
        self
    }

    /// Handle that can cancel the driver from another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Worker-side harness: shares this harness's cancel flag but owns a
    /// fresh logger (merged back by the caller) and no callbacks.
    pub fn child(&self) -> DriverHarness {
        DriverHarness {
            cancel: Arc::clone(&self.cancel),
            progress_fn: None,
            text_fn: None,
            logger: Logger::new(),
        }
    }

    /// Request cancellation. Idempotent: repeated calls observe the same
    /// effect as one.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Checked by drivers at iteration boundaries.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn report_progress(&self, current: usize, total: usize) {
        if let Some(f) = &self.progress_fn {
            f(current, total);
        }
    }

    pub fn report_text(&self, msg: &str) {
        if let Some(f) = &self.text_fn {
            f(msg);
        }
    }
}

impl fmt::Debug for DriverHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHarness")
            .field("cancelled", &self.is_cancelled())
            .field("log_entries", &self.logger.entries().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_idempotent() {
        let h = DriverHarness::new();
        assert!(!h.is_cancelled());
        h.cancel();
        let after_first = h.is_cancelled();
        h.cancel();
        assert_eq!(after_first, h.is_cancelled());
        assert!(h.is_cancelled());
    }

    #[test]
    fn test_cancel_handle_shared() {
        let h = DriverHarness::new();
        let handle = h.cancel_handle();
        handle.store(true, Ordering::Relaxed);
        assert!(h.is_cancelled());
    }

    #[test]
    fn test_progress_callback() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let h = DriverHarness::new().with_progress(Box::new(move |cur, _total| {
            c.store(cur, Ordering::Relaxed);
        }));
        h.report_progress(7, 10);
        assert_eq!(counter.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_logger_device_entries() {
        let mut log = Logger::new();
        log.add_device_entry(Severity::Warning, 42, "tap limit reached");
        log.add_error("no slack");
        assert!(log.has_errors());
        assert_eq!(log.warnings().count(), 1);
        assert_eq!(log.entries()[0].device_uid, Some(42));
    }
}
