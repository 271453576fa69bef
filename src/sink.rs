//! Append-only JSONL event sink
//!
//! Writes one record per line to the configured log using raw `std::fs`
//! I/O, never the instrumented dispatch table, so logging cannot recurse
//! into the wrappers that produced the record. Write failures drop the
//! record silently: visibility must never break the observed program.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::event::{CallResult, Category, ErrorInfo, Event};
use crate::{pkgid, session};

/// Sink configuration, normally derived from the environment by `preload`
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub path: PathBuf,
    pub session: String,
    /// `package-only` filtering drops this tool's own records
    pub package_only: bool,
    /// when false, package-manager sentinel records are dropped too
    pub include_pm: bool,
}

impl SinkConfig {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            session: session::new_session_id(),
            package_only: true,
            include_pm: false,
        }
    }
}

/// Single-writer JSONL sink. Sibling processes may share the log path;
/// record-level isolation relies on `O_APPEND` small-write atomicity, so
/// the formatter keeps records under 4 KiB.
pub struct EventSink {
    config: SinkConfig,
    pid: u32,
    ppid: u32,
    file: Mutex<Option<File>>,
}

impl EventSink {
    pub fn new(config: SinkConfig) -> Self {
        let ppid = nix::unistd::getppid().as_raw().max(0) as u32;
        Self {
            config,
            pid: std::process::id(),
            ppid,
            file: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &str {
        &self.config.session
    }

    pub fn log_path(&self) -> &Path {
        &self.config.path
    }

    /// Build a fully-populated record stamped with this sink's session
    pub fn record(
        &self,
        pkg: String,
        op: &str,
        category: Category,
        args: Value,
        result: CallResult,
        error: Option<ErrorInfo>,
        stack: Option<String>,
    ) -> Event {
        Event {
            ts: session::now_ms(),
            session: self.config.session.clone(),
            pid: self.pid,
            ppid: self.ppid,
            pkg,
            op: op.to_string(),
            category,
            args,
            result,
            error,
            stack,
        }
    }

    /// Append one record, subject to the filter policy
    pub fn write(&self, event: &Event) {
        if self.filtered(event) {
            return;
        }
        self.write_raw(event);
    }

    /// Append one record unconditionally (startup and tamper records)
    pub fn write_raw(&self, event: &Event) {
        let line = event.to_line();
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_none() {
            *guard = self.open();
        }
        if let Some(file) = guard.as_mut() {
            if file.write_all(line.as_bytes()).is_err() {
                // dropped record; the log stays parseable
                *guard = None;
            }
        }
    }

    fn filtered(&self, event: &Event) -> bool {
        if !self.config.package_only {
            return false;
        }
        if event.pkg == pkgid::SELF {
            return true;
        }
        !self.config.include_pm && event.pkg.starts_with("<pm:")
    }

    fn open(&self) -> Option<File> {
        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok()?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sink_at(dir: &TempDir, package_only: bool, include_pm: bool) -> EventSink {
        let mut cfg = SinkConfig::new(&dir.path().join("log.jsonl"));
        cfg.package_only = package_only;
        cfg.include_pm = include_pm;
        EventSink::new(cfg)
    }

    fn write_for(sink: &EventSink, pkg: &str) {
        let ev = sink.record(
            pkg.to_string(),
            "fs.writeFileSync",
            Category::Fs,
            json!({}),
            CallResult::Ok,
            None,
            None,
        );
        sink.write(&ev);
    }

    fn lines(sink: &EventSink) -> Vec<String> {
        match std::fs::read_to_string(sink.log_path()) {
            Ok(s) => s.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_writes_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let sink = sink_at(&dir, true, false);
        write_for(&sink, "a");
        write_for(&sink, "b");
        assert_eq!(lines(&sink).len(), 2);
    }

    #[test]
    fn test_lines_parse_with_required_fields() {
        let dir = TempDir::new().unwrap();
        let sink = sink_at(&dir, true, false);
        write_for(&sink, "a");
        let line = &lines(&sink)[0];
        let v: Value = serde_json::from_str(line).unwrap();
        for field in ["ts", "session", "pid", "ppid", "pkg", "op", "category", "args", "result"] {
            assert!(v.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn test_package_only_drops_self_records() {
        let dir = TempDir::new().unwrap();
        let sink = sink_at(&dir, true, false);
        write_for(&sink, pkgid::SELF);
        assert!(lines(&sink).is_empty());
    }

    #[test]
    fn test_pm_records_dropped_unless_included() {
        let dir = TempDir::new().unwrap();
        let sink = sink_at(&dir, true, false);
        write_for(&sink, pkgid::PM_NPM);
        assert!(lines(&sink).is_empty());

        let dir2 = TempDir::new().unwrap();
        let sink2 = sink_at(&dir2, true, true);
        write_for(&sink2, pkgid::PM_NPM);
        assert_eq!(lines(&sink2).len(), 1);
    }

    #[test]
    fn test_filter_disabled_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let sink = sink_at(&dir, false, false);
        write_for(&sink, pkgid::SELF);
        write_for(&sink, pkgid::PM_PNPM);
        assert_eq!(lines(&sink).len(), 2);
    }

    #[test]
    fn test_write_raw_bypasses_filter() {
        let dir = TempDir::new().unwrap();
        let sink = sink_at(&dir, true, false);
        let ev = sink.record(
            pkgid::SELF.to_string(),
            "startup",
            Category::Tamper,
            json!({"logFile": sink.log_path()}),
            CallResult::Ok,
            None,
            None,
        );
        sink.write_raw(&ev);
        assert_eq!(lines(&sink).len(), 1);
    }

    #[test]
    fn test_parent_directory_created_lazily() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c/log.jsonl");
        let sink = EventSink::new(SinkConfig::new(&nested));
        write_for(&sink, "x");
        assert!(nested.exists());
    }

    #[test]
    fn test_unwritable_path_drops_silently() {
        let sink = EventSink::new(SinkConfig::new(Path::new("/dev/null/impossible/log.jsonl")));
        // must not panic
        write_for(&sink, "x");
    }
}
