//! Sandboxed runs under a container runtime
//!
//! Generates a locked-down `docker`/`podman` invocation: read-only
//! rootfs, all capabilities dropped, no-new-privileges, bounded pids,
//! memory and cpu, tmpfs for transient paths, the project source bound
//! read-only at `/src`, and named volumes for the work tree and caches.
//! An init script seeds `/work` from `/src` on first use and makes sure
//! the requested package manager exists before running the user command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::aggregate;
use crate::orchestrator::{MalwatchError, OutputFormat};
use crate::preload::{self, AgentConfig};
use crate::roots;
use crate::session;
use crate::tamper::Hardening;

/// In-container mount points
const SRC_MOUNT: &str = "/src";
const WORK_MOUNT: &str = "/work";
const CACHE_MOUNT: &str = "/cache";
const TOOL_MOUNT: &str = "/malwatch";

/// Options for sandbox mode
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub command: Vec<String>,
    pub runtime: String,
    pub image: String,
    pub package_manager: String,
    pub pids_limit: u32,
    pub memory: String,
    pub cpus: String,
    pub observe: bool,
    pub keep_volumes: bool,
    pub include_pm: bool,
    pub top_n: usize,
    pub format: OutputFormat,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            runtime: "docker".to_string(),
            image: "node:20-bookworm-slim".to_string(),
            package_manager: "npm".to_string(),
            pids_limit: 256,
            memory: "1g".to_string(),
            cpus: "1".to_string(),
            observe: true,
            keep_volumes: false,
            include_pm: false,
            top_n: aggregate::DEFAULT_TOP_N,
            format: OutputFormat::Text,
        }
    }
}

/// One prepared sandbox invocation
pub struct SandboxPlan {
    pub run_dir: PathBuf,
    pub log: PathBuf,
    pub work_volume: String,
    pub cache_volume: String,
    pub args: Vec<String>,
}

/// The init script executed as the container entrypoint
pub fn init_script(package_manager: &str, command: &[String]) -> String {
    let user_command = shell_join(command);
    format!(
        "#!/bin/sh\n\
         set -eu\n\
         if [ ! -f {WORK_MOUNT}/.seeded ]; then\n\
         \tcp -a {SRC_MOUNT}/. {WORK_MOUNT}/\n\
         \ttouch {WORK_MOUNT}/.seeded\n\
         fi\n\
         mkdir -p {CACHE_MOUNT}/npm {CACHE_MOUNT}/prefix\n\
         export npm_config_cache={CACHE_MOUNT}/npm\n\
         export XDG_CACHE_HOME={CACHE_MOUNT}\n\
         cd {WORK_MOUNT}\n\
         if ! command -v {pm} >/dev/null 2>&1; then\n\
         \tcorepack enable {pm} 2>/dev/null || npm install -g --prefix {CACHE_MOUNT}/prefix {pm}\n\
         \texport PATH=\"{CACHE_MOUNT}/prefix/bin:$PATH\"\n\
         fi\n\
         exec {user_command}\n",
        pm = package_manager,
    )
}

fn shell_join(command: &[String]) -> String {
    command
        .iter()
        .map(|tok| {
            if tok.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c)) {
                tok.clone()
            } else {
                format!("'{}'", tok.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the container argument vector for one run
pub fn container_args(
    options: &SandboxOptions,
    plan_src: &Path,
    run_dir: &Path,
    work_volume: &str,
    cache_volume: &str,
    env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--read-only".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--pids-limit".into(),
        options.pids_limit.to_string(),
        "--memory".into(),
        options.memory.clone(),
        "--cpus".into(),
        options.cpus.clone(),
        "--tmpfs".into(),
        "/tmp".into(),
        "--tmpfs".into(),
        "/run".into(),
        "-v".into(),
        format!("{}:{}:ro", plan_src.display(), SRC_MOUNT),
        "-v".into(),
        format!("{work_volume}:{WORK_MOUNT}"),
        "-v".into(),
        format!("{cache_volume}:{CACHE_MOUNT}"),
        "-v".into(),
        format!("{}:{}", run_dir.display(), TOOL_MOUNT),
    ];
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(options.image.clone());
    args.push("sh".into());
    args.push(format!("{TOOL_MOUNT}/init.sh"));
    args
}

/// Prepare the run directory, init script and argument vector
pub fn plan(options: &SandboxOptions, cwd: &Path) -> Result<SandboxPlan> {
    if options.command.is_empty() {
        return Err(MalwatchError::Usage("missing command".to_string()).into());
    }
    let run_dir = session::sandbox_run_dir(cwd);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("cannot create {}", run_dir.display()))?;
    let session_id = session::new_session_id();
    let work_volume = format!("malwatch-work-{session_id}");
    let cache_volume = format!("malwatch-cache-{session_id}");
    let log = run_dir.join("events.jsonl");

    std::fs::write(
        run_dir.join("init.sh"),
        init_script(&options.package_manager, &options.command),
    )
    .context("cannot write init script")?;

    let mut env = BTreeMap::new();
    if options.observe {
        let config = AgentConfig {
            log: PathBuf::from(format!("{TOOL_MOUNT}/events.jsonl")),
            session: session_id.clone(),
            filter: preload::FILTER_PACKAGE_ONLY.to_string(),
            include_pm: options.include_pm,
            hardening: Hardening::Detect,
        };
        preload::write_bootstrap(&run_dir, &config).context("cannot write bootstrap")?;
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
        env.insert(
            preload::EARLY_HOOK_VAR.to_string(),
            format!("--require {TOOL_MOUNT}/bootstrap.cjs"),
        );
    }

    let args = container_args(options, cwd, &run_dir, &work_volume, &cache_volume, &env);
    Ok(SandboxPlan {
        run_dir,
        log,
        work_volume,
        cache_volume,
        args,
    })
}

fn run_runtime(runtime: &str, args: &[String]) -> Result<i32> {
    info!(runtime, ?args, "invoking container runtime");
    let status = Command::new(runtime)
        .args(args)
        .status()
        .map_err(|e| MalwatchError::SandboxUnavailable(format!("{runtime}: {e}")))?;
    Ok(status.code().unwrap_or(1))
}

fn remove_volumes(runtime: &str, volumes: &[&str]) {
    let mut args = vec!["volume", "rm", "-f"];
    args.extend(volumes.iter().copied());
    match Command::new(runtime).args(&args).output() {
        Ok(out) if !out.status.success() => {
            warn!(?volumes, "volume cleanup exited non-zero");
        }
        Err(e) => warn!(?volumes, error = %e, "volume cleanup failed"),
        _ => {}
    }
}

/// Dump the project manifest and every installed manifest from the work
/// volume through a helper container, for root resolution when nothing
/// is visible host-side.
fn dump_work_manifests(
    options: &SandboxOptions,
    work_volume: &str,
) -> Result<Vec<(String, Value)>> {
    let marker = "=== ";
    let script = format!(
        "for f in {WORK_MOUNT}/package.json \
         $(find {WORK_MOUNT}/node_modules -name package.json -not -path '*/.bin/*' 2>/dev/null); \
         do [ -f \"$f\" ] || continue; echo '{marker}'\"$f\"; cat \"$f\"; echo; done"
    );
    let mount = format!("{work_volume}:{WORK_MOUNT}:ro");
    let output = Command::new(&options.runtime)
        .args([
            "run",
            "--rm",
            "-v",
            mount.as_str(),
            options.image.as_str(),
            "sh",
            "-c",
            script.as_str(),
        ])
        .output()
        .map_err(|e| MalwatchError::SandboxUnavailable(format!("{}: {e}", options.runtime)))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let mut manifests = Vec::new();
    for chunk in text.split(marker).skip(1) {
        if let Some((path, body)) = chunk.split_once('\n') {
            if let Ok(value) = serde_json::from_str::<Value>(body) {
                manifests.push((path.trim().to_string(), value));
            }
        }
    }
    Ok(manifests)
}

fn roots_via_container(
    options: &SandboxOptions,
    work_volume: &str,
    queried: &[String],
) -> BTreeMap<String, Option<String>> {
    let manifests = match dump_work_manifests(options, work_volume) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "in-container manifest dump failed");
            return BTreeMap::new();
        }
    };
    let project_manifest = format!("{WORK_MOUNT}/package.json");
    let direct: std::collections::BTreeSet<String> = manifests
        .iter()
        .filter(|(path, _)| path == &project_manifest)
        .flat_map(|(_, m)| {
            ["dependencies", "devDependencies", "optionalDependencies", "peerDependencies"]
                .iter()
                .filter_map(|k| m.get(*k).and_then(Value::as_object))
                .flat_map(|o| o.keys().cloned())
                .collect::<Vec<_>>()
        })
        .collect();
    let installed: Vec<&Value> = manifests
        .iter()
        .filter(|(path, _)| path != &project_manifest)
        .map(|(_, m)| m)
        .collect();
    let graph = roots::graph_from_manifests(installed);
    roots::resolve(&graph, &direct, queried).into_iter().collect()
}

fn report_observed_run(options: &SandboxOptions, plan: &SandboxPlan, cwd: &Path) -> Result<()> {
    let mut summary = aggregate::aggregate_log(&plan.log, options.top_n)?;
    let queried: Vec<String> = summary.by_package.keys().cloned().collect();
    summary.root_by_package = roots::resolve_for_project(cwd, &queried)
        .into_iter()
        .collect();
    if summary.root_by_package.values().all(Option::is_none) && !queried.is_empty() {
        summary.root_by_package = roots_via_container(options, &plan.work_volume, &queried);
    }
    match options.format {
        OutputFormat::Text => print!("{}", aggregate::render_text(&summary)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    let csv_path = plan.log.with_extension("csv");
    std::fs::write(&csv_path, aggregate::summary_csv(&summary)).ok();
    Ok(())
}

/// Sandbox mode end to end. Returns the container's exit code.
pub fn run_sandbox(options: &SandboxOptions) -> Result<i32> {
    let cwd = std::env::current_dir().context("cannot resolve working directory")?;
    let plan = plan(options, &cwd)?;

    let result = run_runtime(&options.runtime, &plan.args).and_then(|code| {
        if options.observe {
            report_observed_run(options, &plan, &cwd)?;
        }
        Ok(code)
    });

    // ephemeral volumes go away even when the run failed
    if !options.keep_volumes {
        remove_volumes(
            &options.runtime,
            &[plan.work_volume.as_str(), plan.cache_volume.as_str()],
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample_args(observe: bool) -> Vec<String> {
        let options = SandboxOptions {
            command: strs(&["npm", "install"]),
            observe,
            ..Default::default()
        };
        let mut env = BTreeMap::new();
        if observe {
            env.insert("NPM_MALWATCH_LOG".to_string(), "/malwatch/events.jsonl".to_string());
        }
        container_args(
            &options,
            Path::new("/proj"),
            Path::new("/proj/.npm-malwatch/sandbox-1-1"),
            "malwatch-work-x",
            "malwatch-cache-x",
            &env,
        )
    }

    #[test]
    fn test_container_args_lockdown_flags() {
        let args = sample_args(false);
        for flag in ["--read-only", "--cap-drop", "--security-opt", "--pids-limit", "--memory", "--cpus"] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
        assert!(args.contains(&"no-new-privileges".to_string()));
        assert!(args.contains(&"ALL".to_string()));
    }

    #[test]
    fn test_container_args_mounts() {
        let args = sample_args(false);
        assert!(args.contains(&"/proj:/src:ro".to_string()));
        assert!(args.contains(&"malwatch-work-x:/work".to_string()));
        assert!(args.contains(&"malwatch-cache-x:/cache".to_string()));
    }

    #[test]
    fn test_container_args_env_only_when_observing() {
        let observed = sample_args(true);
        assert!(observed
            .iter()
            .any(|a| a.starts_with("NPM_MALWATCH_LOG=")));
        let bare = sample_args(false);
        assert!(!bare.iter().any(|a| a.contains("NPM_MALWATCH")));
    }

    #[test]
    fn test_container_command_is_init_script() {
        let args = sample_args(false);
        let n = args.len();
        assert_eq!(args[n - 2], "sh");
        assert_eq!(args[n - 1], "/malwatch/init.sh");
    }

    #[test]
    fn test_init_script_seeds_work_once() {
        let script = init_script("npm", &strs(&["npm", "install"]));
        assert!(script.contains("if [ ! -f /work/.seeded ]"));
        assert!(script.contains("cp -a /src/. /work/"));
        assert!(script.contains("exec npm install"));
    }

    #[test]
    fn test_init_script_ensures_package_manager() {
        let script = init_script("pnpm", &strs(&["pnpm", "install"]));
        assert!(script.contains("command -v pnpm"));
        assert!(script.contains("corepack enable pnpm"));
        assert!(script.contains("npm install -g --prefix /cache/prefix pnpm"));
    }

    #[test]
    fn test_shell_join_quotes_unsafe_tokens() {
        let joined = shell_join(&strs(&["sh", "-c", "echo hi; rm x"]));
        assert_eq!(joined, "sh -c 'echo hi; rm x'");
    }

    #[test]
    fn test_plan_rejects_empty_command() {
        let options = SandboxOptions::default();
        let dir = tempfile::TempDir::new().unwrap();
        assert!(plan(&options, dir.path()).is_err());
    }

    #[test]
    fn test_plan_writes_init_and_bootstrap() {
        let options = SandboxOptions {
            command: strs(&["npm", "ci"]),
            ..Default::default()
        };
        let dir = tempfile::TempDir::new().unwrap();
        let plan = plan(&options, dir.path()).unwrap();
        assert!(plan.run_dir.join("init.sh").is_file());
        assert!(plan.run_dir.join("bootstrap.cjs").is_file());
        assert!(plan.work_volume.starts_with("malwatch-work-"));
    }
}
