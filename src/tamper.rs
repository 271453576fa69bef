//! Wrapper tamper detection
//!
//! A hostile install script can reassign an instrumented member to shed
//! observation. The detector asserts that a small check set still bears
//! the wrapper marker and emits a tamper record for each member that
//! does not. Detection only; execution is never blocked.

use std::sync::Arc;

use serde_json::json;

use crate::event::{CallResult, Category};
use crate::patch::PatchTable;
use crate::pkgid;
use crate::sink::EventSink;

/// Members asserted by every check pass
pub const CHECK_SET: [(&str, &str); 4] = [
    ("fs", "writeFileSync"),
    ("child_process", "spawn"),
    ("http", "request"),
    ("dns", "lookup"),
];

/// Hardening mode; checks run only under `Detect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hardening {
    Detect,
    Off,
}

impl Hardening {
    pub fn parse(value: &str) -> Self {
        if value == "off" {
            Hardening::Off
        } else {
            Hardening::Detect
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Hardening::Detect => "detect",
            Hardening::Off => "off",
        }
    }
}

pub struct TamperDetector {
    table: Arc<PatchTable>,
    sink: Arc<EventSink>,
    hardening: Hardening,
}

impl TamperDetector {
    pub fn new(table: Arc<PatchTable>, sink: Arc<EventSink>, hardening: Hardening) -> Self {
        Self {
            table,
            sink,
            hardening,
        }
    }

    /// Run one pass over the check set. Returns the number of tamper
    /// records emitted; zero when everything is in place or hardening
    /// is off.
    pub fn check_now(&self) -> usize {
        if self.hardening != Hardening::Detect {
            return 0;
        }
        let mut emitted = 0;
        for (namespace, member) in CHECK_SET {
            if self.table.is_marked(namespace, member) {
                continue;
            }
            let target = format!("{namespace}.{member}");
            let record = self.sink.record(
                pkgid::SELF.to_string(),
                "tamper",
                Category::Tamper,
                json!({ "target": target, "reason": "wrapper_missing" }),
                CallResult::Ok,
                None,
                None,
            );
            // tamper records are part of the log header contract and
            // bypass the filter policy
            self.sink.write_raw(&record);
            emitted += 1;
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkConfig;
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(
        hardening: Hardening,
    ) -> (TempDir, TamperDetector, Arc<PatchTable>, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log.jsonl");
        let sink = Arc::new(EventSink::new(SinkConfig::new(&log)));
        let table = PatchTable::install(Arc::clone(&sink));
        let detector = TamperDetector::new(Arc::clone(&table), sink, hardening);
        (dir, detector, table, log)
    }

    fn records(log: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_intact_wrappers_emit_nothing() {
        let (_dir, detector, _table, log) = setup(Hardening::Detect);
        assert_eq!(detector.check_now(), 0);
        assert!(records(&log).is_empty());
    }

    #[test]
    fn test_replaced_member_emits_tamper_record() {
        let (_dir, detector, table, log) = setup(Hardening::Detect);
        table.replace("fs", "writeFileSync", Arc::new(|_| Ok(Value::Null)));
        assert_eq!(detector.check_now(), 1);
        let recs = records(&log);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0]["op"], "tamper");
        assert_eq!(recs[0]["category"], "tamper");
        assert_eq!(recs[0]["args"]["target"], "fs.writeFileSync");
        assert_eq!(recs[0]["args"]["reason"], "wrapper_missing");
    }

    #[test]
    fn test_every_check_set_member_is_asserted() {
        let (_dir, detector, table, log) = setup(Hardening::Detect);
        for (ns, member) in CHECK_SET {
            table.replace(ns, member, Arc::new(|_| Ok(Value::Null)));
        }
        assert_eq!(detector.check_now(), CHECK_SET.len());
        let targets: Vec<String> = records(&log)
            .iter()
            .map(|r| r["args"]["target"].as_str().unwrap().to_string())
            .collect();
        for (ns, member) in CHECK_SET {
            assert!(targets.contains(&format!("{ns}.{member}")));
        }
    }

    #[test]
    fn test_hardening_off_disables_detection() {
        let (_dir, detector, table, log) = setup(Hardening::Off);
        table.replace("dns", "lookup", Arc::new(|_| Ok(Value::Null)));
        assert_eq!(detector.check_now(), 0);
        assert!(records(&log).is_empty());
    }

    #[test]
    fn test_hardening_parse() {
        assert_eq!(Hardening::parse("off"), Hardening::Off);
        assert_eq!(Hardening::parse("detect"), Hardening::Detect);
        assert_eq!(Hardening::parse("anything"), Hardening::Detect);
    }
}
