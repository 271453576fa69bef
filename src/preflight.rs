//! Preflight scanner: lifecycle scripts in the installed tree
//!
//! After a scripts-disabled install, every manifest under `node_modules`
//! is enumerated (flat npm layout and pnpm's content-addressed store) and
//! filtered down to the packages that declare one of the requested
//! lifecycle script keys. The report is what an operator reviews before
//! re-running the install with scripts enabled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::truncate;
use crate::pkgid;

/// Script keys scanned by default
pub const DEFAULT_SCRIPT_KEYS: [&str; 4] = ["preinstall", "install", "postinstall", "prepare"];
/// Manifest cap per scan
pub const DEFAULT_MAX_PACKAGES: usize = 5000;
/// Script values are truncated to this many characters
pub const MAX_SCRIPT_LEN: usize = 1000;

/// Install subcommands that execute lifecycle scripts
const INSTALL_LIKE: [&str; 4] = ["install", "i", "add", "ci"];

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub script_keys: Vec<String>,
    pub max_packages: usize,
    pub include_pm: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            script_keys: DEFAULT_SCRIPT_KEYS.iter().map(|s| s.to_string()).collect(),
            max_packages: DEFAULT_MAX_PACKAGES,
            include_pm: false,
        }
    }
}

/// One package that declares at least one requested script
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptEntry {
    pub name: String,
    pub version: String,
    pub path: String,
    pub scripts: BTreeMap<String, String>,
}

/// Result of one preflight scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub ts: u64,
    pub cwd: String,
    pub pm_command: String,
    pub node_modules_root: String,
    pub total_packages_scanned: usize,
    pub packages_with_scripts: usize,
    pub script_keys: Vec<String>,
    pub packages: Vec<ScriptEntry>,
    pub parse_errors: usize,
    pub truncated: bool,
}

/// Append `--ignore-scripts` to install-like commands; a no-op for
/// everything else and idempotent by construction.
pub fn ensure_ignore_scripts(command: &[String]) -> Vec<String> {
    let mut out = command.to_vec();
    let install_like = command
        .iter()
        .skip(1)
        .any(|tok| INSTALL_LIKE.contains(&tok.as_str()));
    if install_like && !command.iter().any(|tok| tok == "--ignore-scripts") {
        out.push("--ignore-scripts".to_string());
    }
    out
}

/// Resolve the install target directory: an explicit `--prefix`/`-C`/
/// `--dir` value wins, then a directory argument carrying a manifest,
/// then the working directory.
pub fn resolve_project_root(command: &[String], cwd: &Path) -> PathBuf {
    let mut iter = command.iter().skip(1).peekable();
    while let Some(tok) = iter.next() {
        for flag in ["--prefix", "-C", "--dir"] {
            if tok == flag {
                if let Some(value) = iter.peek() {
                    return cwd.join(value.as_str());
                }
            } else if let Some(value) = tok.strip_prefix(&format!("{flag}=")) {
                return cwd.join(value);
            }
        }
    }
    for tok in command.iter().skip(1) {
        if tok.starts_with('-') || INSTALL_LIKE.contains(&tok.as_str()) {
            continue;
        }
        let candidate = cwd.join(tok);
        if candidate.is_dir() && candidate.join("package.json").is_file() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn sorted_entries(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut entries: Vec<(String, PathBuf)> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
            .collect(),
        Err(_) => Vec::new(),
    };
    entries.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));
    entries
}

fn collect_flat(node_modules: &Path, out: &mut Vec<PathBuf>, cap: usize) {
    for (name, path) in sorted_entries(node_modules) {
        if out.len() > cap {
            return;
        }
        if name == ".bin" || name == ".pnpm" || !path.is_dir() {
            continue;
        }
        if name.starts_with('@') {
            for (_, sub) in sorted_entries(&path) {
                if out.len() > cap {
                    return;
                }
                let manifest = sub.join("package.json");
                if manifest.is_file() {
                    out.push(manifest);
                }
            }
        } else {
            let manifest = path.join("package.json");
            if manifest.is_file() {
                out.push(manifest);
            }
        }
    }
}

fn collect_pnpm_store(node_modules: &Path, out: &mut Vec<PathBuf>, cap: usize) {
    let store = node_modules.join(".pnpm");
    if !store.is_dir() {
        return;
    }
    for (_, entry) in sorted_entries(&store) {
        if out.len() > cap {
            return;
        }
        let inner = entry.join("node_modules");
        if inner.is_dir() {
            collect_flat(&inner, out, cap);
        }
    }
}

/// Enumerate manifests under `node_modules` in deterministic order,
/// collecting at most `cap + 1` paths so callers can detect truncation.
pub fn manifest_paths(node_modules: &Path, cap: usize) -> Vec<PathBuf> {
    let mut out = Vec::new();
    collect_flat(node_modules, &mut out, cap);
    collect_pnpm_store(node_modules, &mut out, cap);
    out
}

/// Name from the manifest, falling back to the directory name
fn manifest_name(manifest: &Value, path: &Path) -> String {
    if let Some(name) = manifest.get("name").and_then(Value::as_str) {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Outcome of scanning one installed tree
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub packages: Vec<ScriptEntry>,
    pub total_scanned: usize,
    pub parse_errors: usize,
    pub truncated: bool,
}

/// Scan `<root>/node_modules` for packages with matching lifecycle
/// scripts. A missing tree is an empty result, not an error.
pub fn scan(project_root: &Path, options: &ScanOptions) -> ScanOutcome {
    let node_modules = project_root.join("node_modules");
    let mut paths = manifest_paths(&node_modules, options.max_packages);
    let truncated = paths.len() > options.max_packages;
    paths.truncate(options.max_packages);

    let mut outcome = ScanOutcome {
        truncated,
        ..Default::default()
    };
    for path in &paths {
        outcome.total_scanned += 1;
        let manifest: Value = match std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(v) => v,
            None => {
                outcome.parse_errors += 1;
                continue;
            }
        };
        let name = manifest_name(&manifest, path);
        if !options.include_pm && pkgid::is_pm(&name) {
            continue;
        }
        let mut scripts = BTreeMap::new();
        if let Some(declared) = manifest.get("scripts").and_then(Value::as_object) {
            for key in &options.script_keys {
                if let Some(value) = declared.get(key).and_then(Value::as_str) {
                    scripts.insert(key.clone(), truncate(value, MAX_SCRIPT_LEN));
                }
            }
        }
        if scripts.is_empty() {
            continue;
        }
        let version = manifest
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        outcome.packages.push(ScriptEntry {
            name,
            version,
            path: path.to_string_lossy().into_owned(),
            scripts,
        });
    }
    outcome
}

/// Assemble the report for one install invocation
pub fn build_report(
    command: &[String],
    project_root: &Path,
    cwd: &Path,
    options: &ScanOptions,
    outcome: ScanOutcome,
) -> PreflightReport {
    PreflightReport {
        ts: crate::session::now_ms(),
        cwd: cwd.to_string_lossy().into_owned(),
        pm_command: command.join(" "),
        node_modules_root: project_root
            .join("node_modules")
            .to_string_lossy()
            .into_owned(),
        total_packages_scanned: outcome.total_scanned,
        packages_with_scripts: outcome.packages.len(),
        script_keys: options.script_keys.clone(),
        packages: outcome.packages,
        parse_errors: outcome.parse_errors,
        truncated: outcome.truncated,
    }
}

/// CSV rendering of the report, one row per (package, script key)
pub fn report_csv(report: &PreflightReport) -> String {
    let mut out = String::from("name,version,script,command,path\n");
    for entry in &report.packages {
        for (key, value) in &entry.scripts {
            let row = [
                entry.name.as_str(),
                entry.version.as_str(),
                key.as_str(),
                value.as_str(),
                entry.path.as_str(),
            ];
            let escaped: Vec<String> = row.iter().map(|f| csv_escape(f)).collect();
            out.push_str(&escaped.join(","));
            out.push('\n');
        }
    }
    out
}

/// Quote a CSV field when it contains a quote, comma, CR or LF
pub fn csv_escape(field: &str) -> String {
    if field.contains('"') || field.contains(',') || field.contains('\r') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
