//! Agent sandbox supervisor CLI.
//!
//! `warden init` scaffolds a deployment, `warden run` supervises the agent
//! until a stop condition fires, and `warden validate` / `warden scan` are
//! operator checks that never touch the agent.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use warden::core::patterns::{PATTERN_SET_VERSION, PatternSet};
use warden::core::types::StopReason;
use warden::exit_codes;
use warden::io::config::{DEFAULT_CONFIG_FILE, load_config};
use warden::io::init::{InitOptions, init_workspace};
use warden::io::provider::{API_KEY_ENV, AnthropicProvider, ModelProvider, OfflineProvider};
use warden::logging;
use warden::supervisor::{Supervisor, SupervisorOptions, ThreadSleeper, build_protected_paths};

#[derive(Parser)]
#[command(name = "warden", version, about = "Supervisor for a sandboxed autonomous agent")]
struct Cli {
    /// Path to the supervisor config.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the config if missing, create the workspace repository, and lock protected files.
    Init {
        /// Rewrite the config file even if it exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the config, and report protected-file status.
    Validate,
    /// Supervise the agent until quota, error budget, interrupt, or iteration limit.
    Run {
        /// Stop after this many iterations.
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Run the violation patterns over a text file and print every match.
    Scan {
        /// File to scan.
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Run { max_iterations } => cmd_run(&cli.config, max_iterations),
        Command::Scan { file } => cmd_scan(&file),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    let cfg = load_config(config_path)?;
    logging::init(&cfg.logging.level, None)?;
    let report = init_workspace(config_path, &cfg, &InitOptions { force })?;
    if report.config_written {
        println!("wrote {}", config_path.display());
    }
    if report.repo_created {
        println!("created repository in {}", cfg.workspace_root.display());
    }
    for path in &report.locked {
        println!("locked {}", path.display());
    }
    for path in &report.missing_protected {
        println!("missing protected file {}", path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let protected = build_protected_paths(&cfg, config_path)?;
    println!("config ok: {}", config_path.display());
    println!("allowed model: {}", cfg.model.allowed);
    println!("pattern set version: {PATTERN_SET_VERSION}");
    for path in protected.iter() {
        let status = match fs::symlink_metadata(path) {
            Ok(meta) => format!("mode {:o}", meta.permissions().mode() & 0o777),
            Err(_) => "missing".to_string(),
        };
        println!("protected {} ({status})", path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(config_path: &Path, max_iterations: Option<u64>) -> Result<i32> {
    let cfg = load_config(config_path)?;
    logging::init(&cfg.logging.level, cfg.logging.file.as_deref())?;

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;

    let provider: Box<dyn ModelProvider> = if std::env::var_os(API_KEY_ENV).is_some() {
        Box::new(AnthropicProvider::from_config(&cfg.model)?)
    } else {
        warn!("{API_KEY_ENV} is not set; running in offline mode");
        Box::new(OfflineProvider)
    };
    let sleeper = ThreadSleeper;
    let mut supervisor =
        Supervisor::new(cfg, config_path, provider.as_ref(), &sleeper, interrupt)?;
    let outcome = supervisor.run(&SupervisorOptions { max_iterations }, |_| {})?;
    if outcome.detained {
        warn!("agent is detained; remove DETAINED.md and restore permissions to release it");
    }
    println!("stopped after {} iterations: {}", outcome.iterations, outcome.stop);
    Ok(match outcome.stop {
        StopReason::QuotaExceeded { .. } => exit_codes::QUOTA_EXCEEDED,
        StopReason::ErrorBudgetExhausted { .. } => exit_codes::ERROR_BUDGET_EXHAUSTED,
        StopReason::Interrupted | StopReason::IterationLimit { .. } => exit_codes::OK,
    })
}

fn cmd_scan(file: &Path) -> Result<i32> {
    let text = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let matches = PatternSet::violations()?.matches(&text);
    if matches.is_empty() {
        println!("clean");
        return Ok(exit_codes::OK);
    }
    for rule in &matches {
        println!("{}: {}", rule.category, rule.pattern);
    }
    Ok(exit_codes::VIOLATIONS_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["warden", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["warden", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_limit_and_global_config() {
        let cli = Cli::parse_from(["warden", "run", "--max-iterations", "3", "--config", "/etc/w.toml"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                max_iterations: Some(3)
            }
        ));
        assert_eq!(cli.config, PathBuf::from("/etc/w.toml"));
    }

    #[test]
    fn parse_scan() {
        let cli = Cli::parse_from(["warden", "scan", "out.txt"]);
        assert!(matches!(cli.command, Command::Scan { ref file } if file == Path::new("out.txt")));
    }
}
