use clap::Parser;

use npm_malwatch::cli::{Cli, Commands};
use npm_malwatch::orchestrator::{self, MalwatchError, ObserveOptions, PreflightOptions};
use npm_malwatch::preflight::ScanOptions;
use npm_malwatch::sandbox::{self, SandboxOptions};

fn main() {
    // diagnostics go to stderr; stdout is reserved for summaries
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();
    let cli = Cli::parse();

    let result = match cli.command {
        None => {
            if cli.observed.is_empty() {
                eprintln!("npm-malwatch: missing command. Usage: npm-malwatch [OPTIONS] -- COMMAND [ARGS...]");
                std::process::exit(2);
            }
            orchestrator::run_observed(&ObserveOptions {
                command: cli.observed,
                log: cli.log,
                filter: cli.filter,
                include_pm: cli.include_pm,
                hardening: cli.hardening.into(),
                top_n: cli.top,
                format: cli.format.into(),
            })
        }
        Some(Commands::Preflight {
            script_keys,
            max_packages,
            report,
            include_pm,
            command,
        }) => {
            if command.is_empty() {
                eprintln!("npm-malwatch: missing install command. Usage: npm-malwatch preflight [OPTIONS] -- COMMAND [ARGS...]");
                std::process::exit(2);
            }
            orchestrator::run_preflight(&PreflightOptions {
                command,
                scan: ScanOptions {
                    script_keys,
                    max_packages,
                    include_pm,
                },
                report,
            })
        }
        Some(Commands::Sandbox {
            runtime,
            image,
            package_manager,
            pids,
            memory,
            cpus,
            no_observe,
            keep_volumes,
            command,
        }) => {
            if command.is_empty() {
                eprintln!("npm-malwatch: missing command. Usage: npm-malwatch sandbox [OPTIONS] -- COMMAND [ARGS...]");
                std::process::exit(2);
            }
            sandbox::run_sandbox(&SandboxOptions {
                command,
                runtime,
                image,
                package_manager,
                pids_limit: pids,
                memory,
                cpus,
                observe: !no_observe,
                keep_volumes,
                include_pm: cli.include_pm,
                top_n: cli.top,
                format: cli.format.into(),
            })
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("npm-malwatch: {err:#}");
            let code = match err.downcast_ref::<MalwatchError>() {
                Some(MalwatchError::Usage(_)) => 2,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}
