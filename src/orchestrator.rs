//! Run orchestration: observed and preflight modes
//!
//! The orchestrator prepares the observation environment, launches the
//! child with inherited standard streams, waits for it, and turns the
//! log into reports. It propagates the child's exit code; its own
//! failures map to the error kinds below.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::{self, Summary};
use crate::preflight::{self, ScanOptions};
use crate::preload::{self, AgentConfig};
use crate::session;
use crate::tamper::Hardening;

/// Failures surfaced to the CLI layer
#[derive(Error, Debug)]
pub enum MalwatchError {
    #[error("failed to launch child: {0}")]
    ChildLaunch(String),

    #[error("usage: {0}")]
    Usage(String),

    #[error("container runtime unavailable: {0}")]
    SandboxUnavailable(String),
}

/// Summary output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Options for observed mode
#[derive(Debug, Clone)]
pub struct ObserveOptions {
    pub command: Vec<String>,
    pub log: Option<PathBuf>,
    pub filter: String,
    pub include_pm: bool,
    pub hardening: Hardening,
    pub top_n: usize,
    pub format: OutputFormat,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            log: None,
            filter: preload::FILTER_PACKAGE_ONLY.to_string(),
            include_pm: false,
            hardening: Hardening::Detect,
            top_n: aggregate::DEFAULT_TOP_N,
            format: OutputFormat::Text,
        }
    }
}

/// The child environment for one observed session
pub fn build_child_env(config: &AgentConfig, bootstrap: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        preload::ENV_LOG.to_string(),
        config.log.to_string_lossy().into_owned(),
    );
    env.insert(preload::ENV_SESSION.to_string(), config.session.clone());
    env.insert(preload::ENV_FILTER.to_string(), config.filter.clone());
    env.insert(
        preload::ENV_INCLUDE_PM.to_string(),
        if config.include_pm { "1" } else { "0" }.to_string(),
    );
    env.insert(
        preload::ENV_HARDENING.to_string(),
        config.hardening.as_str().to_string(),
    );
    let existing = std::env::var(preload::EARLY_HOOK_VAR).unwrap_or_default();
    env.insert(
        preload::EARLY_HOOK_VAR.to_string(),
        preload::augment_hook_value(&existing, bootstrap),
    );
    env
}

fn spawn_and_wait(command: &[String], env: &HashMap<String, String>) -> Result<i32> {
    let program = command
        .first()
        .ok_or_else(|| MalwatchError::Usage("missing command".to_string()))?;
    info!(program = %program, "launching observed child");
    let status = Command::new(program)
        .args(&command[1..])
        .envs(env)
        .status()
        .map_err(|e| MalwatchError::ChildLaunch(format!("{program}: {e}")))?;
    // a signal death still yields a summary; report it as failure
    Ok(status.code().unwrap_or(1))
}

/// Observed mode: launch the child under instrumentation, then
/// aggregate. Returns the child's exit code.
pub fn run_observed(options: &ObserveOptions) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot resolve working directory")?;
    let log = options
        .log
        .clone()
        .unwrap_or_else(|| session::default_log_path(&cwd));
    let config = AgentConfig {
        log: log.clone(),
        session: session::new_session_id(),
        filter: options.filter.clone(),
        include_pm: options.include_pm,
        hardening: options.hardening,
    };
    let bootstrap = preload::write_bootstrap(&session::run_dir(&cwd), &config)
        .context("cannot write bootstrap")?;
    let env = build_child_env(&config, &bootstrap);

    let code = spawn_and_wait(&options.command, &env)?;

    let summary = aggregate::summarize(&log, &cwd, options.top_n)?;
    emit_summary(&summary, options.format)?;
    let csv_path = log.with_extension("csv");
    std::fs::write(&csv_path, aggregate::summary_csv(&summary))
        .with_context(|| format!("cannot write {}", csv_path.display()))?;
    info!(log = %log.display(), csv = %csv_path.display(), "observation complete");
    Ok(code)
}

fn emit_summary(summary: &Summary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", aggregate::render_text(summary)),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?)
        }
    }
    Ok(())
}

/// Options for preflight mode
#[derive(Debug, Clone)]
pub struct PreflightOptions {
    pub command: Vec<String>,
    pub scan: ScanOptions,
    pub report: Option<PathBuf>,
}

/// Preflight mode: run the install with scripts disabled, then report
/// which packages would have run lifecycle scripts. The report is
/// written even when the install fails.
pub fn run_preflight(options: &PreflightOptions) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot resolve working directory")?;
    let command = preflight::ensure_ignore_scripts(&options.command);
    let code = spawn_and_wait(&command, &HashMap::new())?;
    if code != 0 {
        warn!(code, "install exited non-zero; scanning anyway");
    }

    let project_root = preflight::resolve_project_root(&command, &cwd);
    let outcome = preflight::scan(&project_root, &options.scan);
    let report = preflight::build_report(&command, &project_root, &cwd, &options.scan, outcome);

    let report_path = options
        .report
        .clone()
        .unwrap_or_else(|| session::default_preflight_path(&cwd));
    if let Some(parent) = report_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("cannot write {}", report_path.display()))?;
    let csv_path = report_path.with_extension("csv");
    std::fs::write(&csv_path, preflight::report_csv(&report))
        .with_context(|| format!("cannot write {}", csv_path.display()))?;

    println!(
        "preflight: {} of {} scanned packages declare {:?} scripts ({} parse errors{})",
        report.packages_with_scripts,
        report.total_packages_scanned,
        report.script_keys,
        report.parse_errors,
        if report.truncated { ", truncated" } else { "" },
    );
    println!("report: {}", report_path.display());
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample_config(dir: &Path) -> AgentConfig {
        AgentConfig {
            log: dir.join("log.jsonl"),
            session: "sess".into(),
            filter: preload::FILTER_PACKAGE_ONLY.into(),
            include_pm: true,
            hardening: Hardening::Off,
        }
    }

    #[test]
    fn test_child_env_carries_session_settings() {
        let config = sample_config(Path::new("/tmp/t"));
        let env = build_child_env(&config, Path::new("/tmp/t/bootstrap.cjs"));
        assert_eq!(env[preload::ENV_LOG], "/tmp/t/log.jsonl");
        assert_eq!(env[preload::ENV_SESSION], "sess");
        assert_eq!(env[preload::ENV_FILTER], "package-only");
        assert_eq!(env[preload::ENV_INCLUDE_PM], "1");
        assert_eq!(env[preload::ENV_HARDENING], "off");
    }

    #[test]
    fn test_child_env_appends_early_hook() {
        let config = sample_config(Path::new("/tmp/t"));
        let env = build_child_env(&config, Path::new("/tmp/t/bootstrap.cjs"));
        assert!(env[preload::EARLY_HOOK_VAR].ends_with("--require /tmp/t/bootstrap.cjs"));
    }

    #[test]
    fn test_spawn_and_wait_propagates_exit_code() {
        let code =
            spawn_and_wait(&strs(&["sh", "-c", "exit 7"]), &HashMap::new()).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_spawn_missing_program_is_launch_error() {
        let err = spawn_and_wait(&strs(&["/no/such/program"]), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }

    #[test]
    fn test_spawn_empty_command_is_usage_error() {
        let err = spawn_and_wait(&[], &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing command"));
    }
}
