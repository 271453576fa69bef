//! Agent activation
//!
//! The observed child activates instrumentation at startup from the
//! `NPM_MALWATCH_*` environment the orchestrator prepared: sink, patch
//! table, startup record, then an immediate tamper pass. A cooperating
//! host calls [`Agent::shutdown`] at exit for the final pass; dropping a
//! non-global agent does the same.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde_json::json;

use crate::event::{CallResult, Category};
use crate::patch::PatchTable;
use crate::pkgid;
use crate::sink::{EventSink, SinkConfig};
use crate::tamper::{Hardening, TamperDetector};

/// Environment variable carrying the absolute log path
pub const ENV_LOG: &str = "NPM_MALWATCH_LOG";
/// Opaque session id
pub const ENV_SESSION: &str = "NPM_MALWATCH_SESSION";
/// `package-only` (default) or anything else to disable filtering
pub const ENV_FILTER: &str = "NPM_MALWATCH_FILTER";
/// `"1"` to keep package-manager records
pub const ENV_INCLUDE_PM: &str = "NPM_MALWATCH_INCLUDE_PM";
/// `detect` (default) or `off`
pub const ENV_HARDENING: &str = "NPM_MALWATCH_HARDENING";
/// The observed runtime's early-hook variable
pub const EARLY_HOOK_VAR: &str = "NODE_OPTIONS";

pub const FILTER_PACKAGE_ONLY: &str = "package-only";

/// Agent configuration, normally read from the environment
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub log: PathBuf,
    pub session: String,
    pub filter: String,
    pub include_pm: bool,
    pub hardening: Hardening,
}

impl AgentConfig {
    /// Read the orchestrator-provided environment. `None` when no log
    /// path is set, i.e. this process is not being observed.
    pub fn from_env() -> Option<Self> {
        let log = PathBuf::from(std::env::var_os(ENV_LOG)?);
        let session = std::env::var(ENV_SESSION)
            .unwrap_or_else(|_| crate::session::new_session_id());
        let filter = std::env::var(ENV_FILTER).unwrap_or_else(|_| FILTER_PACKAGE_ONLY.to_string());
        let include_pm = std::env::var(ENV_INCLUDE_PM).map(|v| v == "1").unwrap_or(false);
        let hardening = Hardening::parse(
            std::env::var(ENV_HARDENING)
                .unwrap_or_else(|_| "detect".to_string())
                .as_str(),
        );
        Some(Self {
            log,
            session,
            filter,
            include_pm,
            hardening,
        })
    }
}

/// A live instrumentation agent
pub struct Agent {
    pub table: Arc<PatchTable>,
    pub sink: Arc<EventSink>,
    detector: TamperDetector,
    finished: std::sync::atomic::AtomicBool,
}

impl Agent {
    /// Activate instrumentation: open the sink, write the startup
    /// record, install the patch table, run the post-install tamper
    /// pass.
    pub fn activate(config: AgentConfig) -> Self {
        let mut sink_config = SinkConfig::new(&config.log);
        sink_config.session = config.session.clone();
        sink_config.package_only = config.filter == FILTER_PACKAGE_ONLY;
        sink_config.include_pm = config.include_pm;
        let sink = Arc::new(EventSink::new(sink_config));

        let startup = sink.record(
            pkgid::SELF.to_string(),
            "startup",
            Category::Tamper,
            json!({
                "logFile": config.log.to_string_lossy(),
                "filter": config.filter,
                "hardening": config.hardening.as_str(),
            }),
            CallResult::Ok,
            None,
            None,
        );
        sink.write_raw(&startup);

        let table = PatchTable::install(Arc::clone(&sink));
        let detector = TamperDetector::new(Arc::clone(&table), Arc::clone(&sink), config.hardening);
        detector.check_now();

        Self {
            table,
            sink,
            detector,
            finished: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Final tamper pass; idempotent
    pub fn shutdown(&self) {
        if self
            .finished
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.detector.check_now();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static AGENT: OnceLock<Agent> = OnceLock::new();

/// Process-global activation from the environment. Installing twice is a
/// no-op; the first agent wins. Returns `None` when the observation
/// environment is absent.
pub fn install_from_env() -> Option<&'static Agent> {
    let config = AgentConfig::from_env()?;
    Some(AGENT.get_or_init(|| Agent::activate(config)))
}

/// Loader stub injected through the runtime's early-hook variable. The
/// stub carries the session configuration inline so hook-honoring
/// runtimes can activate observation before any user code runs.
pub fn write_bootstrap(dir: &Path, config: &AgentConfig) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("bootstrap.cjs");
    let body = format!(
        "// npm-malwatch bootstrap; loaded via the early-hook variable\n\
         process.env.{ENV_LOG} = process.env.{ENV_LOG} || {log:?};\n\
         process.env.{ENV_SESSION} = process.env.{ENV_SESSION} || {session:?};\n\
         if (process.env.NPM_MALWATCH_AGENT) require(process.env.NPM_MALWATCH_AGENT);\n",
        log = config.log.to_string_lossy(),
        session = config.session,
    );
    std::fs::write(&path, body)?;
    Ok(path)
}

/// Append `--require <bootstrap>` to an existing early-hook value
pub fn augment_hook_value(existing: &str, bootstrap: &Path) -> String {
    let flag = format!("--require {}", bootstrap.display());
    if existing.trim().is_empty() {
        flag
    } else {
        format!("{existing} {flag}")
    }
}
