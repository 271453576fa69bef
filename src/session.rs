//! Session identity and default output locations
//!
//! Every observed run gets an opaque session id that is stamped on each
//! record, and a run directory under the project (`.npm-malwatch/`) that
//! holds logs, preflight reports and sandbox scratch files.

use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory created under the project root for all tool output
pub const RUN_DIR: &str = ".npm-malwatch";

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate an opaque session id: timestamp, pid and random entropy
pub fn new_session_id() -> String {
    let entropy: u64 = rand::thread_rng().gen();
    format!("{:x}-{}-{:08x}", now_ms(), std::process::id(), entropy as u32)
}

/// `<cwd>/.npm-malwatch`
pub fn run_dir(cwd: &Path) -> PathBuf {
    cwd.join(RUN_DIR)
}

/// Default event log path: `<cwd>/.npm-malwatch/<ts>-<pid>.jsonl`
pub fn default_log_path(cwd: &Path) -> PathBuf {
    run_dir(cwd).join(format!("{}-{}.jsonl", now_ms(), std::process::id()))
}

/// Default preflight report path: `<cwd>/.npm-malwatch/preflight-<ts>-<pid>.json`
pub fn default_preflight_path(cwd: &Path) -> PathBuf {
    run_dir(cwd).join(format!(
        "preflight-{}-{}.json",
        now_ms(),
        std::process::id()
    ))
}

/// Default sandbox scratch dir: `<cwd>/.npm-malwatch/sandbox-<ts>-<pid>/`
pub fn sandbox_run_dir(cwd: &Path) -> PathBuf {
    run_dir(cwd).join(format!("sandbox-{}-{}", now_ms(), std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_contains_pid() {
        let id = new_session_id();
        assert!(id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_default_paths_live_under_run_dir() {
        let cwd = Path::new("/proj");
        assert!(default_log_path(cwd).starts_with("/proj/.npm-malwatch"));
        assert!(default_preflight_path(cwd).starts_with("/proj/.npm-malwatch"));
        assert!(sandbox_run_dir(cwd).starts_with("/proj/.npm-malwatch"));
    }

    #[test]
    fn test_log_path_extension() {
        let p = default_log_path(Path::new("/x"));
        assert_eq!(p.extension().unwrap(), "jsonl");
    }

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
