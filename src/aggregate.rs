//! Post-run aggregation of the event log
//!
//! Streams the JSONL log line by line and folds it into a per-package
//! summary with top-N detail tables for written paths, spawned commands
//! and contacted hosts. Malformed lines are skipped; aggregation of the
//! same log is deterministic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{truncate, MAX_ARGV_ELEM};
use crate::preflight::csv_escape;
use crate::{hostapi, pkgid, roots};

/// Detail tables keep this many entries by default
pub const DEFAULT_TOP_N: usize = 10;
/// Contributing packages listed per detail entry
const TOP_PACKAGES_PER_ENTRY: usize = 3;

/// Per-package operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCounters {
    pub fs_read: u64,
    pub fs_write: u64,
    pub proc: u64,
    pub dns: u64,
    pub net: u64,
}

impl PackageCounters {
    pub fn total(&self) -> u64 {
        self.fs_read + self.fs_write + self.proc + self.dns + self.net
    }
}

/// One package's share of a detail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopContributor {
    pub pkg: String,
    pub count: u64,
}

/// One row of a top-N detail table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    pub key: String,
    pub count: u64,
    pub packages: Vec<TopContributor>,
}

/// Aggregated view of one event log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_events: u64,
    pub by_package: BTreeMap<String, PackageCounters>,
    pub root_by_package: BTreeMap<String, Option<String>>,
    pub top_write_paths: Vec<TopEntry>,
    pub top_commands: Vec<TopEntry>,
    pub top_dns_hosts: Vec<TopEntry>,
    pub top_net_hosts: Vec<TopEntry>,
}

fn unknown_pkg() -> String {
    pkgid::UNKNOWN.to_string()
}

/// Lenient record mirror: unknown fields are ignored, missing ones
/// defaulted, so foreign or future log lines still aggregate.
#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default = "unknown_pkg")]
    pkg: String,
    #[serde(default)]
    op: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    args: Value,
}

/// Count table preserving first-seen order so ties break deterministically
#[derive(Debug, Default)]
struct KeyedCounts {
    order: Vec<String>,
    counts: HashMap<String, u64>,
    pkg_order: HashMap<String, Vec<String>>,
    pkg_counts: HashMap<String, HashMap<String, u64>>,
}

impl KeyedCounts {
    fn bump(&mut self, key: &str, pkg: &str) {
        if !self.counts.contains_key(key) {
            self.order.push(key.to_string());
        }
        *self.counts.entry(key.to_string()).or_insert(0) += 1;

        let order = self.pkg_order.entry(key.to_string()).or_default();
        let counts = self.pkg_counts.entry(key.to_string()).or_default();
        if !counts.contains_key(pkg) {
            order.push(pkg.to_string());
        }
        *counts.entry(pkg.to_string()).or_insert(0) += 1;
    }

    fn top(&self, n: usize) -> Vec<TopEntry> {
        let mut indexed: Vec<(usize, &String)> = self.order.iter().enumerate().collect();
        indexed.sort_by_key(|(i, key)| (Reverse(self.counts[*key]), *i));
        indexed
            .into_iter()
            .take(n)
            .map(|(_, key)| TopEntry {
                key: key.clone(),
                count: self.counts[key],
                packages: self.top_packages(key),
            })
            .collect()
    }

    fn top_packages(&self, key: &str) -> Vec<TopContributor> {
        let (order, counts) = match (self.pkg_order.get(key), self.pkg_counts.get(key)) {
            (Some(o), Some(c)) => (o, c),
            _ => return Vec::new(),
        };
        let mut indexed: Vec<(usize, &String)> = order.iter().enumerate().collect();
        indexed.sort_by_key(|(i, pkg)| (Reverse(counts[*pkg]), *i));
        indexed
            .into_iter()
            .take(TOP_PACKAGES_PER_ENTRY)
            .map(|(_, pkg)| TopContributor {
                pkg: pkg.clone(),
                count: counts[pkg],
            })
            .collect()
    }
}

enum FsClass {
    Read,
    Write,
}

/// Read-vs-write classification of an fs operation name. Anything
/// unrecognized counts as a read so no fs activity disappears from the
/// summary.
fn classify_fs(op: &str) -> FsClass {
    let member = op.rsplit('.').next().unwrap_or(op);
    if member.starts_with("write") || member.starts_with("append") || member.contains("WriteStream")
    {
        FsClass::Write
    } else {
        FsClass::Read
    }
}

fn args_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// `file + " " + argv.join(" ")`, else `command`, else `file`
fn synthesize_command(args: &Value) -> Option<String> {
    let file = args_str(args, "file");
    let argv: Option<Vec<&str>> = args
        .get("argv")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect());
    let command = match (file, argv) {
        (Some(f), Some(a)) if !a.is_empty() => format!("{} {}", f, a.join(" ")),
        _ => match args_str(args, "command") {
            Some(c) => c.to_string(),
            None => file?.to_string(),
        },
    };
    Some(truncate(&command, MAX_ARGV_ELEM))
}

fn net_host(args: &Value) -> Option<String> {
    if let Some(host) = args_str(args, "host").or_else(|| args_str(args, "hostname")) {
        return Some(host.to_string());
    }
    let href = args_str(args, "href")?;
    hostapi::split_href(href, 80).map(|(host, _, _)| host)
}

/// Fold one log file into a [`Summary`]. A missing log is an empty log.
pub fn aggregate_log(path: &Path, top_n: usize) -> Result<Summary> {
    let mut by_package: BTreeMap<String, PackageCounters> = BTreeMap::new();
    let mut total_events = 0u64;
    let mut write_paths = KeyedCounts::default();
    let mut commands = KeyedCounts::default();
    let mut dns_hosts = KeyedCounts::default();
    let mut net_hosts = KeyedCounts::default();

    if path.exists() {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open log {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.unwrap_or_default();
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => continue, // malformed line, skipped
            };
            total_events += 1;
            let counters = by_package.entry(record.pkg.clone()).or_default();
            match record.category.as_str() {
                "fs" => match classify_fs(&record.op) {
                    FsClass::Read => counters.fs_read += 1,
                    FsClass::Write => {
                        counters.fs_write += 1;
                        if let Some(p) = args_str(&record.args, "path") {
                            write_paths.bump(p, &record.pkg);
                        }
                    }
                },
                "proc" => {
                    counters.proc += 1;
                    if let Some(cmd) = synthesize_command(&record.args) {
                        commands.bump(&cmd, &record.pkg);
                    }
                }
                "dns" => {
                    counters.dns += 1;
                    if let Some(host) = args_str(&record.args, "host") {
                        dns_hosts.bump(host, &record.pkg);
                    }
                }
                "net" => {
                    counters.net += 1;
                    if let Some(host) = net_host(&record.args) {
                        net_hosts.bump(&host, &record.pkg);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(Summary {
        total_events,
        by_package,
        root_by_package: BTreeMap::new(),
        top_write_paths: write_paths.top(top_n),
        top_commands: commands.top(top_n),
        top_dns_hosts: dns_hosts.top(top_n),
        top_net_hosts: net_hosts.top(top_n),
    })
}

/// Aggregate and attach the direct-root mapping for the project tree
pub fn summarize(log: &Path, project_root: &Path, top_n: usize) -> Result<Summary> {
    let mut summary = aggregate_log(log, top_n)?;
    let queried: Vec<String> = summary.by_package.keys().cloned().collect();
    summary.root_by_package = roots::resolve_for_project(project_root, &queried)
        .into_iter()
        .collect();
    Ok(summary)
}

fn sorted_rows(summary: &Summary) -> Vec<(&String, &PackageCounters)> {
    let mut rows: Vec<_> = summary.by_package.iter().collect();
    rows.sort_by_key(|(_, c)| Reverse(c.total()));
    rows
}

/// Plain-text rendering of the summary
pub fn render_text(summary: &Summary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "events: {}", summary.total_events);
    let _ = writeln!(
        out,
        "{:<24} {:<28} {:>7} {:>8} {:>9} {:>6} {:>5} {:>5}",
        "root", "package", "total", "fs_read", "fs_write", "proc", "dns", "net"
    );
    for (pkg, counters) in sorted_rows(summary) {
        let root = summary
            .root_by_package
            .get(pkg)
            .and_then(|r| r.as_deref())
            .unwrap_or("-");
        let _ = writeln!(
            out,
            "{:<24} {:<28} {:>7} {:>8} {:>9} {:>6} {:>5} {:>5}",
            root,
            pkg,
            counters.total(),
            counters.fs_read,
            counters.fs_write,
            counters.proc,
            counters.dns,
            counters.net
        );
    }
    for (title, table) in [
        ("top write paths", &summary.top_write_paths),
        ("top commands", &summary.top_commands),
        ("top dns hosts", &summary.top_dns_hosts),
        ("top net hosts", &summary.top_net_hosts),
    ] {
        if table.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{title}:");
        for entry in table {
            let pkgs: Vec<String> = entry
                .packages
                .iter()
                .map(|c| format!("{}({})", c.pkg, c.count))
                .collect();
            let _ = writeln!(out, "{:>7}  {}  [{}]", entry.count, entry.key, pkgs.join(" "));
        }
    }
    out
}

/// CSV rendering: `root,package,total,fs_read,fs_write,proc,dns,net`,
/// rows by descending total.
pub fn summary_csv(summary: &Summary) -> String {
    let mut out = String::from("root,package,total,fs_read,fs_write,proc,dns,net\n");
    for (pkg, counters) in sorted_rows(summary) {
        let root = summary
            .root_by_package
            .get(pkg)
            .and_then(|r| r.clone())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            csv_escape(&root),
            csv_escape(pkg),
            counters.total(),
            counters.fs_read,
            counters.fs_write,
            counters.proc,
            counters.dns,
            counters.net
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn record(pkg: &str, op: &str, category: &str, args: Value) -> String {
        json!({
            "ts": 1, "session": "s", "pid": 1, "ppid": 0,
            "pkg": pkg, "op": op, "category": category,
            "args": args, "result": "ok"
        })
        .to_string()
    }

    fn write_log(lines: &[String]) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        (dir, path)
    }

    #[test]
    fn test_empty_log_yields_empty_summary() {
        let (_dir, path) = write_log(&[]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        assert_eq!(s.total_events, 0);
        assert!(s.by_package.is_empty());
        assert!(s.top_write_paths.is_empty());
    }

    #[test]
    fn test_missing_log_is_empty_log() {
        let dir = TempDir::new().unwrap();
        let s = aggregate_log(&dir.path().join("absent.jsonl"), DEFAULT_TOP_N).unwrap();
        assert_eq!(s.total_events, 0);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let (_dir, path) = write_log(&[
            "{not json".to_string(),
            record("a", "fs.readFileSync", "fs", json!({})),
        ]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        assert_eq!(s.total_events, 1);
        assert_eq!(s.by_package["a"].fs_read, 1);
    }

    #[test]
    fn test_fs_classification() {
        for (op, read, write) in [
            ("fs.readFileSync", 1, 0),
            ("fs.writeFileSync", 0, 1),
            ("fs.appendFileSync", 0, 1),
            ("fs.createReadStream", 1, 0),
            ("fs.createWriteStream", 0, 1),
            ("fs.promises.readFile", 1, 0),
            ("fs.promises.writeFile", 0, 1),
            // unclassified fs ops stay visible as reads
            ("fs.chmodSync", 1, 0),
            ("fs.statSync", 1, 0),
        ] {
            let (_dir, path) = write_log(&[record("p", op, "fs", json!({}))]);
            let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
            assert_eq!(s.by_package["p"].fs_read, read, "{op}");
            assert_eq!(s.by_package["p"].fs_write, write, "{op}");
        }
    }

    #[test]
    fn test_write_path_detail_table() {
        // scenario: /tmp/x written by a(2) and b(1)
        let (_dir, path) = write_log(&[
            record("a", "fs.writeFileSync", "fs", json!({"path": "/tmp/x"})),
            record("a", "fs.writeFileSync", "fs", json!({"path": "/tmp/x"})),
            record("b", "fs.writeFileSync", "fs", json!({"path": "/tmp/x"})),
        ]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        let entry = &s.top_write_paths[0];
        assert_eq!(entry.key, "/tmp/x");
        assert_eq!(entry.count, 3);
        assert_eq!(
            entry.packages,
            vec![
                TopContributor { pkg: "a".into(), count: 2 },
                TopContributor { pkg: "b".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn test_top_n_and_tie_order() {
        let mut lines = Vec::new();
        lines.push(record("p", "fs.writeFileSync", "fs", json!({"path": "/first"})));
        lines.push(record("p", "fs.writeFileSync", "fs", json!({"path": "/second"})));
        let (_dir, path) = write_log(&lines);
        let s = aggregate_log(&path, 1).unwrap();
        assert_eq!(s.top_write_paths.len(), 1);
        // equal counts: first inserted wins
        assert_eq!(s.top_write_paths[0].key, "/first");
    }

    #[test]
    fn test_command_synthesis_forms() {
        assert_eq!(
            synthesize_command(&json!({"file": "node", "argv": ["-e", "0"]})).as_deref(),
            Some("node -e 0")
        );
        assert_eq!(
            synthesize_command(&json!({"command": "rm -rf /"})).as_deref(),
            Some("rm -rf /")
        );
        assert_eq!(synthesize_command(&json!({"file": "ls"})).as_deref(), Some("ls"));
        assert_eq!(synthesize_command(&json!({})), None);
    }

    #[test]
    fn test_command_truncated_to_cap() {
        let long = "a".repeat(500);
        let out = synthesize_command(&json!({ "command": long })).unwrap();
        assert_eq!(out.chars().count(), MAX_ARGV_ELEM + 1);
    }

    #[test]
    fn test_proc_detail_table() {
        let (_dir, path) = write_log(&[record(
            "evil",
            "child_process.spawnSync",
            "proc",
            json!({"file": "curl", "argv": ["http://x"]}),
        )]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        assert_eq!(s.by_package["evil"].proc, 1);
        assert_eq!(s.top_commands[0].key, "curl http://x");
    }

    #[test]
    fn test_dns_and_net_host_tables() {
        let (_dir, path) = write_log(&[
            record("a", "dns.lookup", "dns", json!({"host": "x.test"})),
            record("a", "net.createConnection", "net", json!({"host": "y.test", "port": 1})),
            record("a", "http.request", "net", json!({"href": "https://z.test/path"})),
        ]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        assert_eq!(s.by_package["a"].dns, 1);
        assert_eq!(s.by_package["a"].net, 2);
        assert_eq!(s.top_dns_hosts[0].key, "x.test");
        let net_keys: Vec<&str> = s.top_net_hosts.iter().map(|e| e.key.as_str()).collect();
        assert!(net_keys.contains(&"y.test"));
        assert!(net_keys.contains(&"z.test"));
    }

    #[test]
    fn test_tamper_records_count_only_total() {
        let (_dir, path) = write_log(&[record(
            "<malwatch>",
            "tamper",
            "tamper",
            json!({"target": "fs.writeFileSync"}),
        )]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        assert_eq!(s.total_events, 1);
        assert_eq!(s.by_package["<malwatch>"].total(), 0);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let (_dir, path) = write_log(&[
            record("a", "fs.writeFileSync", "fs", json!({"path": "/x"})),
            record("b", "dns.lookup", "dns", json!({"host": "h"})),
        ]);
        let first = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        let second = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_summary_csv_shape() {
        let (_dir, path) = write_log(&[
            record("busy", "fs.writeFileSync", "fs", json!({"path": "/x"})),
            record("busy", "fs.writeFileSync", "fs", json!({"path": "/x"})),
            record("quiet", "dns.lookup", "dns", json!({"host": "h"})),
        ]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        let csv = summary_csv(&s);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "root,package,total,fs_read,fs_write,proc,dns,net");
        // busy (total 2) sorts before quiet (total 1)
        assert!(lines[1].starts_with(",busy,2,0,2,0,0,0"));
        assert!(lines[2].starts_with(",quiet,1,0,0,0,1,0"));
    }

    #[test]
    fn test_render_text_contains_counts() {
        let (_dir, path) = write_log(&[record(
            "lodash",
            "fs.writeFileSync",
            "fs",
            json!({"path": "/x"}),
        )]);
        let s = aggregate_log(&path, DEFAULT_TOP_N).unwrap();
        let text = render_text(&s);
        assert!(text.contains("events: 1"));
        assert!(text.contains("lodash"));
        assert!(text.contains("top write paths"));
    }
}
