//! CLI argument parsing for npm-malwatch

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Summary output format
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text tables (default)
    Text,
    /// JSON for machine parsing
    Json,
}

impl From<OutputFormat> for crate::orchestrator::OutputFormat {
    fn from(value: OutputFormat) -> Self {
        match value {
            OutputFormat::Text => crate::orchestrator::OutputFormat::Text,
            OutputFormat::Json => crate::orchestrator::OutputFormat::Json,
        }
    }
}

/// Hardening mode for the in-child agent
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HardeningMode {
    /// Verify wrapper markers and record tampering
    Detect,
    /// Skip tamper checks
    Off,
}

impl From<HardeningMode> for crate::tamper::Hardening {
    fn from(value: HardeningMode) -> Self {
        match value {
            HardeningMode::Detect => crate::tamper::Hardening::Detect,
            HardeningMode::Off => crate::tamper::Hardening::Off,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "npm-malwatch")]
#[command(version)]
#[command(about = "Record file, process, DNS and network activity of package installs", long_about = None)]
pub struct Cli {
    /// Event log path (default: .npm-malwatch/<ts>-<pid>.jsonl)
    #[arg(long = "log", value_name = "PATH")]
    pub log: Option<PathBuf>,

    /// Record filter: package-only drops this tool's own records
    #[arg(long = "filter", value_name = "MODE", default_value = "package-only")]
    pub filter: String,

    /// Keep package-manager records in the log and summary
    #[arg(long = "include-pm")]
    pub include_pm: bool,

    /// Wrapper tamper detection
    #[arg(long = "hardening", value_enum, default_value = "detect")]
    pub hardening: HardeningMode,

    /// Detail-table depth in the summary
    #[arg(long = "top", value_name = "N", default_value = "10")]
    pub top: usize,

    /// Summary output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Command to observe, after `--`
    #[arg(last = true, value_name = "COMMAND")]
    pub observed: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an install with scripts disabled and report which packages
    /// declare lifecycle scripts
    Preflight {
        /// Lifecycle script keys to report
        #[arg(
            long = "script-keys",
            value_name = "KEYS",
            value_delimiter = ',',
            default_values_t = crate::preflight::DEFAULT_SCRIPT_KEYS.map(String::from)
        )]
        script_keys: Vec<String>,

        /// Manifest scan cap
        #[arg(long = "max-packages", value_name = "N", default_value = "5000")]
        max_packages: usize,

        /// Report path (default: .npm-malwatch/preflight-<ts>-<pid>.json)
        #[arg(long = "report", value_name = "PATH")]
        report: Option<PathBuf>,

        /// Include package-manager packages in the report
        #[arg(long = "include-pm")]
        include_pm: bool,

        /// Install command, after `--`
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Run the command in a locked-down container with observation
    Sandbox {
        /// Container runtime binary
        #[arg(long = "runtime", value_name = "BIN", default_value = "docker")]
        runtime: String,

        /// Container image
        #[arg(long = "image", value_name = "IMAGE", default_value = "node:20-bookworm-slim")]
        image: String,

        /// Package manager to ensure inside the container
        #[arg(long = "pm", value_name = "PM", default_value = "npm")]
        package_manager: String,

        /// Process cap inside the container
        #[arg(long = "pids", value_name = "N", default_value = "256")]
        pids: u32,

        /// Memory cap
        #[arg(long = "memory", value_name = "SIZE", default_value = "1g")]
        memory: String,

        /// CPU cap
        #[arg(long = "cpus", value_name = "N", default_value = "1")]
        cpus: String,

        /// Skip in-container observation
        #[arg(long = "no-observe")]
        no_observe: bool,

        /// Keep the work and cache volumes after the run
        #[arg(long = "keep-volumes")]
        keep_volumes: bool,

        /// Command to run inside the sandbox, after `--`
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}
