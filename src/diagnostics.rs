//! Durable diagnostic log
//!
//! Crash-level faults (failed ChangeLog fan-out, listener probe failures,
//! panics) are appended to `crash.log` so they survive the process even when
//! tracing output is lost. Writing is best-effort and never fails the caller.

use chrono::{SecondsFormat, Utc};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CRASH_LOG_FILE: &str = "crash.log";

#[derive(Debug)]
pub struct DiagnosticLog {
    path: Option<PathBuf>,
    // serializes appends from concurrent fan-out tasks
    lock: Mutex<()>,
}

fn format_record(session_id: &str, context: &str, detail: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "ts={}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    let _ = writeln!(out, "pid={}", std::process::id());
    let _ = writeln!(out, "session={}", session_id);
    let _ = writeln!(out, "context={}", context);
    let _ = writeln!(out, "detail={}", detail);
    out.push('\n');
    out
}

fn append(path: &Path, record: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(record.as_bytes())
}

impl DiagnosticLog {
    /// Log appending to `<dir>/crash.log`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: Some(dir.as_ref().join(CRASH_LOG_FILE)),
            lock: Mutex::new(()),
        }
    }

    /// Log that drops every record (tests, read-only CLI commands)
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record for an error, including its context chain
    pub fn record(&self, session_id: &str, context: &str, error: &anyhow::Error) {
        self.record_text(session_id, context, &format!("{:#}", error));
    }

    pub fn record_text(&self, session_id: &str, context: &str, detail: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let record = format_record(session_id, context, detail);
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = append(path, &record) {
            tracing::warn!(path = %path.display(), "Failed to write diagnostic log: {}", e);
        }
    }
}

/// Append panics to the diagnostic log before the default hook runs
pub fn install_panic_hook(dir: PathBuf, session_id: String) {
    let default_hook = std::panic::take_hook();
    let log = DiagnosticLog::new(dir);
    std::panic::set_hook(Box::new(move |info| {
        let mut detail = info.to_string();
        let backtrace = std::backtrace::Backtrace::force_capture();
        let _ = write!(&mut detail, "\nbacktrace:\n{backtrace}");
        log.record_text(&session_id, "panic", &detail);
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_records_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = DiagnosticLog::new(dir.path().join("diag"));

        let err = Err::<(), _>(anyhow::anyhow!("timeout"))
            .context("create ChangeLog for Y")
            .unwrap_err();
        log.record("X", "propagate", &err);
        log.record_text("X", "listener", "probe failed");

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.contains("session=X"));
        assert!(content.contains("context=propagate"));
        assert!(content.contains("detail=create ChangeLog for Y: timeout"));
        assert!(content.contains("context=listener"));
        assert_eq!(content.matches("ts=").count(), 2);
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let log = DiagnosticLog::disabled();
        assert!(log.path().is_none());
        log.record_text("X", "ctx", "nothing happens");
    }
}
