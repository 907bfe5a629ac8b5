//! `fleet` command line.
//!
//! Every command prints a `key=value` line format by default and JSON with
//! `--json`. Failures exit with the stable codes in [`fleet::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use fleet::core::types::{HealthState, ReasonCode};
use fleet::error::{FleetError, exit_code_for};
use fleet::exit_codes;
use fleet::guardian::{GuardOptions, Guardian};
use fleet::io::config::{FleetConfig, load_config, resolve_home};
use fleet::io::provider::EnvCredentials;
use fleet::io::review::GhReviewRequests;
use fleet::monitor::{ThreadSleep, WatchdogOptions, run_watchdog};
use fleet::orchestrator::{JobHandle, JobSummary, Orchestrator, StartRequest};
use fleet::report::build_report;
use fleet::sweep::{SweepOptions, Sweeper};

/// Exceptions shown per category in human summaries.
const SUMMARY_ITEMS_PER_GROUP: usize = 10;

#[derive(Parser)]
#[command(
    name = "fleet",
    version,
    about = "Dispatch and supervise coding agents; keep fleet worktrees bounded"
)]
struct Cli {
    /// Fleet home (jobs, locks, default scratch root).
    #[arg(long, global = true, env = "FLEET_HOME")]
    home: Option<PathBuf>,
    /// Config file (default: <home>/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print JSON instead of key=value lines.
    #[arg(long, global = true)]
    json: bool,
    /// More diagnostics on stderr (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a job (idempotent per id).
    Start {
        id: String,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        worktree: PathBuf,
        #[arg(long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Sample a job's health. Exit 2 when stalled, 3 when dead or failed.
    Check { id: String },
    /// Show one job or all jobs. Read-only.
    Status { id: Option<String> },
    /// Terminate, rotate the log and relaunch under the saved contract.
    Restart { id: String },
    /// Terminate a job and its monitor; records an aborted outcome.
    Stop { id: String },
    /// Force a terminal outcome (e.g. after a host restart).
    Finalize {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Remove artifacts of terminal jobs past retention.
    Prune {
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Probe a provider and resolve its model and credentials. Creates nothing.
    Preflight {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Scheduled monitor loop over non-terminal jobs.
    Watchdog {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        once: bool,
        /// Seconds between ticks (default: jobs.poll_interval_secs).
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        max_ticks: Option<u32>,
    },
    /// Classify scratch worktrees without fetching or acting.
    Inventory,
    /// Fetch, classify and act on scratch worktrees.
    Sweep {
        #[arg(long)]
        dry_run: bool,
    },
    /// Rescue and reset dirty or off-trunk canonical clones.
    Guard {
        #[arg(long)]
        dry_run: bool,
    },
    /// Aggregate job outcomes by state and reason.
    Report,
}

fn main() {
    let cli = Cli::parse();
    fleet::logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let home = resolve_home(cli.home.as_deref())?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| home.join("config.toml"));
    let config = load_config(&config_path)?;
    let json = cli.json;

    match cli.command {
        Command::Start {
            id,
            provider,
            worktree,
            prompt,
            prompt_file,
            model,
        } => {
            let prompt = match (prompt, prompt_file) {
                (Some(prompt), _) => prompt,
                (None, Some(path)) => fs::read_to_string(&path)
                    .with_context(|| format!("read {}", path.display()))?,
                (None, None) => anyhow::bail!("--prompt or --prompt-file is required"),
            };
            let handle = orchestrator(&home, config).start(&StartRequest {
                id,
                provider,
                prompt,
                worktree,
                model,
            })?;
            print_handle(json, &handle)?;
            Ok(exit_codes::OK)
        }
        Command::Check { id } => {
            let orchestrator = orchestrator(&home, config);
            let health = orchestrator.check(&id)?;
            emit(json, &CheckOutput { id: &id, health }, || {
                match health {
                    HealthState::Terminal(state) => format!("id={id} health=terminal state={state}"),
                    other => format!("id={id} health={}", other.label()),
                }
            })?;
            let exit_code = orchestrator
                .store()
                .load_outcome(&id)?
                .and_then(|outcome| outcome.exit_code);
            Ok(check_exit_code(&id, health, exit_code))
        }
        Command::Status { id } => {
            let jobs = orchestrator(&home, config).status(id.as_deref())?;
            emit(json, &jobs, || {
                jobs.iter().map(status_line).collect::<Vec<_>>().join("\n")
            })?;
            Ok(exit_codes::OK)
        }
        Command::Restart { id } => {
            let handle = orchestrator(&home, config).restart(&id)?;
            print_handle(json, &handle)?;
            Ok(exit_codes::OK)
        }
        Command::Stop { id } => {
            let outcome = orchestrator(&home, config).stop(&id)?;
            emit(json, &outcome, || {
                format!("id={} state={}", outcome.id, outcome.state)
            })?;
            Ok(exit_codes::OK)
        }
        Command::Finalize { id, reason } => {
            let reason = reason.map(|r| r.parse::<ReasonCode>()).transpose()?;
            let outcome = orchestrator(&home, config).finalize(&id, reason)?;
            emit(json, &outcome, || {
                format!(
                    "id={} state={} exit_code={} reason={}",
                    outcome.id,
                    outcome.state,
                    opt(outcome.exit_code),
                    opt(outcome.reason)
                )
            })?;
            Ok(exit_codes::OK)
        }
        Command::Prune { older_than_hours } => {
            let hours = older_than_hours.unwrap_or(config.jobs.retention_hours);
            let removed = orchestrator(&home, config)
                .prune(Duration::from_secs(hours * 3600), Utc::now())?;
            emit(json, &removed, || {
                removed
                    .iter()
                    .map(|id| format!("pruned id={id}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(exit_codes::OK)
        }
        Command::Preflight { provider, model } => {
            let preflight = orchestrator(&home, config).preflight(&provider, model.as_deref())?;
            let credential = preflight.credential.as_ref().map(|c| c.source.clone());
            emit(
                json,
                &PreflightOutput {
                    provider: &preflight.provider,
                    model: &preflight.model,
                    credential_source: credential.as_deref(),
                },
                || {
                    format!(
                        "provider={} model={} credential={}",
                        preflight.provider,
                        preflight.model,
                        opt(credential.as_deref())
                    )
                },
            )?;
            Ok(exit_codes::OK)
        }
        Command::Watchdog {
            job,
            once,
            interval,
            max_ticks,
        } => {
            let options = WatchdogOptions {
                job,
                interval: Duration::from_secs(interval.unwrap_or(config.jobs.poll_interval_secs)),
                max_ticks: if once { Some(1) } else { max_ticks },
            };
            let orchestrator = orchestrator(&home, config);
            let outcome = run_watchdog(&orchestrator, &options, &ThreadSleep, |reports| {
                for report in reports {
                    let line = if json {
                        serde_json::to_string(report).unwrap_or_default()
                    } else {
                        let health = report.health.map_or("unknown", |h| h.label());
                        let action = serde_json::to_value(&report.action)
                            .ok()
                            .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(str::to_string))
                            .unwrap_or_default();
                        format!("id={} health={health} action={action}", report.id)
                    };
                    println!("{line}");
                }
            })?;
            if !json {
                println!("ticks={}", outcome.ticks);
            }
            Ok(exit_codes::OK)
        }
        Command::Inventory => {
            let reviews = GhReviewRequests::new(config.network_timeout());
            let sweeper = Sweeper::new(&home, &config, &reviews)?;
            let entries = sweeper.inventory(SystemTime::now())?;
            emit(json, &entries, || {
                entries
                    .iter()
                    .map(|e| {
                        format!(
                            "repo={} name={} disposition={} rule={}{}",
                            e.worktree.repo,
                            e.worktree.name,
                            opt(e.disposition),
                            opt(e.rule),
                            e.error
                                .as_ref()
                                .map(|err| format!(" error={err:?}"))
                                .unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(exit_codes::OK)
        }
        Command::Sweep { dry_run } => {
            let reviews = GhReviewRequests::new(config.network_timeout());
            let sweeper = Sweeper::new(&home, &config, &reviews)?;
            let report = sweeper.sweep(SweepOptions {
                dry_run,
                now: SystemTime::now(),
            })?;
            emit(json, &report, || report.summary.render(SUMMARY_ITEMS_PER_GROUP))?;
            Ok(if report.summary.is_all_clear() {
                exit_codes::OK
            } else {
                exit_codes::EXCEPTIONS
            })
        }
        Command::Guard { dry_run } => {
            let reviews = GhReviewRequests::new(config.network_timeout());
            let guardian = Guardian::new(&home, &config, &reviews)?;
            let report = guardian.guard(GuardOptions {
                dry_run,
                now: SystemTime::now(),
            })?;
            emit(json, &report, || report.summary.render(SUMMARY_ITEMS_PER_GROUP))?;
            Ok(if report.push_failed() {
                exit_codes::PUSH_FAILURE
            } else if report.summary.is_all_clear() {
                exit_codes::OK
            } else {
                exit_codes::EXCEPTIONS
            })
        }
        Command::Report => {
            let report = build_report(&orchestrator(&home, config))?;
            emit(json, &report, || report.summary.render(SUMMARY_ITEMS_PER_GROUP))?;
            Ok(exit_codes::OK)
        }
    }
}

fn orchestrator(home: &Path, config: FleetConfig) -> Orchestrator {
    Orchestrator::new(home, config, Arc::new(EnvCredentials))
}

/// `check` exit code: 0 healthy or succeeded, 2 stalled, 3 dead, failed or aborted.
fn check_exit_code(id: &str, health: HealthState, exit_code: Option<i32>) -> i32 {
    match FleetError::from_health(id, health, exit_code) {
        Some(err) => {
            eprintln!("{err}");
            err.exit_code()
        }
        None => exit_codes::OK,
    }
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    id: &'a str,
    #[serde(flatten)]
    health: HealthState,
}

#[derive(Serialize)]
struct PreflightOutput<'a> {
    provider: &'a str,
    model: &'a str,
    credential_source: Option<&'a str>,
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("serialize output")?
        );
    } else {
        let text = human();
        if !text.is_empty() {
            println!("{text}");
        }
    }
    Ok(())
}

fn print_handle(json: bool, handle: &JobHandle) -> Result<()> {
    emit(json, handle, || {
        format!(
            "id={} state={} pid={} provider={} model={} retries={} log={}",
            handle.id,
            handle.state,
            opt(handle.pid),
            handle.provider,
            handle.model,
            handle.retry_count,
            handle.log_path.display()
        )
    })
}

fn status_line(job: &JobSummary) -> String {
    format!(
        "id={} state={} alive={} pid={} provider={} model={} retries={} mutations={} heartbeat={} exit_code={} reason={}",
        job.id,
        job.state,
        job.alive,
        opt(job.pid),
        opt(job.provider.as_deref()),
        opt(job.model.as_deref()),
        job.retry_count,
        job.mutation_count,
        opt(job.last_heartbeat_at.map(|t| t.to_rfc3339())),
        opt(job.exit_code),
        opt(job.reason)
    )
}

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
