//! Command-line surface.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::config::{JobConfig, RunConfig, StoreCredentials, RUN_ID_VAR};
use crate::logging;
use crate::orchestrator::{IntervalOrchestrator, RunOutcome, StatusReport};
use crate::store::SqliteConnector;
use crate::supervisor::{ProcessSupervisor, ShellLauncher};

#[derive(Parser)]
#[command(name = "cdm-pacer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive a data migration job across a token range, one resumable interval at a time")]
#[command(long_about = None)]
pub struct Cli {
    /// Directory for cdm-pacer.log and per-interval job output
    #[arg(long, global = true, env = "CDM_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// TOML file with the job command, supervisor policy and rate schedule
    #[arg(long, global = true, env = "CDM_JOB_CONFIG")]
    pub job_config: Option<PathBuf>,

    /// Debug-level logging (a level in RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run intervals until the key space is exhausted or an interval fails
    Run(RunArgs),
    /// Create the tables and seed missing default parameters
    Init(InitArgs),
    /// Show the cursor, recent intervals and an ETA
    Status(StatusArgs),
    /// Print the command the next interval would run
    Render(RenderArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Record intervals without launching the job (also DRY_RUN=1)
    #[arg(long)]
    pub dry_run: bool,

    /// Give up on an interval after this many stall restarts
    #[arg(long)]
    pub max_restarts: Option<u32>,
}

#[derive(Args)]
pub struct InitArgs {}

#[derive(Args)]
pub struct StatusArgs {
    /// How many recent interval records to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct RenderArgs {}

/// Run the parsed command. `Ok(false)` means it completed but the run did not reach DONE.
pub async fn execute(cli: Cli) -> anyhow::Result<bool> {
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    logging::init(&cli.log_dir, level)?;
    let job = JobConfig::load(cli.job_config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run(args, &job, cli.log_dir).await,
        Commands::Init(_) => init(&job, cli.log_dir).await,
        Commands::Status(args) => status(args, &job, cli.log_dir).await,
        Commands::Render(_) => render(&job, cli.log_dir).await,
    }
}

fn orchestrator(
    job: &JobConfig,
    connector: SqliteConnector,
    run_id: String,
    log_dir: PathBuf,
    max_restarts: Option<u32>,
) -> anyhow::Result<IntervalOrchestrator> {
    let mut policy = job.supervisor.to_policy()?;
    if max_restarts.is_some() {
        policy.max_restarts = max_restarts;
    }
    let supervisor = ProcessSupervisor::new(Arc::new(ShellLauncher::default()), policy, log_dir);
    Ok(IntervalOrchestrator::new(Arc::new(connector), supervisor, run_id)
        .with_template(job.template()?)
        .with_rates(job.schedule.to_scheduler()?))
}

async fn run(args: RunArgs, job: &JobConfig, log_dir: PathBuf) -> anyhow::Result<bool> {
    let config = RunConfig::from_env()?;
    let connector = SqliteConnector::from_credentials(&config.credentials);
    let orchestrator = orchestrator(job, connector, config.run_id, log_dir, args.max_restarts)?
        .dry_run(args.dry_run || config.dry_run);

    match orchestrator.run().await {
        RunOutcome::Done { .. } => Ok(true),
        RunOutcome::IntervalFailed { .. } => Ok(false),
        RunOutcome::Aborted { error, intervals } => Err(anyhow::Error::new(error))
            .with_context(|| format!("run '{}' stopped after {} intervals", orchestrator.run_id(), intervals)),
    }
}

async fn init(job: &JobConfig, log_dir: PathBuf) -> anyhow::Result<bool> {
    let credentials = StoreCredentials::from_env()?;
    let connector = SqliteConnector::from_credentials(&credentials).create_if_missing(true);
    let orchestrator = orchestrator(job, connector, String::new(), log_dir, None)?;
    let seeded = orchestrator
        .initialize()
        .await
        .with_context(|| format!("failed to initialize {}", credentials.bundle_path.display()))?;
    if seeded.is_empty() {
        println!("Store ready; existing parameters left untouched");
    } else {
        println!("Store ready; seeded {}", seeded.join(", "));
    }
    Ok(true)
}

async fn status(args: StatusArgs, job: &JobConfig, log_dir: PathBuf) -> anyhow::Result<bool> {
    let config = RunConfig::from_env()?;
    let connector = SqliteConnector::from_credentials(&config.credentials);
    let orchestrator = orchestrator(job, connector, config.run_id, log_dir, None)?;
    let report = orchestrator.status(args.limit).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_status(&report));
    }
    Ok(true)
}

async fn render(job: &JobConfig, log_dir: PathBuf) -> anyhow::Result<bool> {
    let credentials = StoreCredentials::from_env()?;
    credentials.require_bundle()?;
    let run_id = std::env::var(RUN_ID_VAR).unwrap_or_default();
    let connector = SqliteConnector::from_credentials(&credentials);
    let orchestrator = orchestrator(job, connector, run_id, log_dir, None)?;
    match orchestrator.preview().await? {
        Some(preview) => {
            println!(
                "# interval {}..{} (hour {}, read rate {})",
                preview.interval.start, preview.interval.job_end, preview.hour_key, preview.read_rate_limit
            );
            println!("{}", preview.command);
        }
        None => println!("# nothing left to migrate"),
    }
    Ok(true)
}

fn format_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let params = &report.params;
    let _ = writeln!(out, "Run: {}", report.run_id);
    let _ = writeln!(out, "Parameters:");
    for (id, value) in params.iter() {
        let _ = writeln!(out, "  {:<24} {}", id, value);
    }
    let _ = writeln!(
        out,
        "Cursor: {} ({}){}",
        params.last_end_token,
        report
            .cursor_pct
            .map_or_else(|| "unknown".to_string(), |pct| format!("{:.2}%", pct)),
        if report.done { " DONE" } else { "" }
    );
    let _ = writeln!(out, "Intervals remaining: {}", params.remaining_intervals());
    if report.recent.is_empty() {
        let _ = writeln!(out, "No intervals recorded for this run");
    } else {
        let _ = writeln!(out, "Recent intervals:");
        for record in &report.recent {
            let _ = writeln!(
                out,
                "  {} {:<7} {}..{} elapsed {}",
                record.start_time.format("%Y-%m-%d %H:%M:%S"),
                record.status,
                record.start_token,
                record.end_token,
                record
                    .elapsed_time
                    .map_or_else(|| "-".to_string(), |secs| format!("{}s", secs))
            );
        }
    }
    match &report.eta {
        Some(eta) => {
            let _ = writeln!(out, "ETA: {}", eta);
        }
        None if report.done => {}
        None => {
            let _ = writeln!(out, "ETA: unknown (no successful intervals yet)");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MigrationParams;
    use crate::progress;
    use crate::progress::HistoryEstimate;
    use crate::store::{IntervalRecord, IntervalStatus};
    use chrono::{TimeZone, Utc};
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from(["cdm-pacer", "run", "--dry-run", "--max-restarts", "3", "--log-dir", "/tmp/x"]).unwrap();
        assert_eq!(cli.log_dir, PathBuf::from("/tmp/x"));
        match cli.command {
            Commands::Run(args) => {
                assert!(args.dry_run);
                assert_eq!(args.max_restarts, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_format_status_lists_records_and_eta() {
        let params = MigrationParams::from_rows(vec![
            ("start_token".to_string(), "0".to_string()),
            ("end_token".to_string(), "1000".to_string()),
            ("token_increment".to_string(), "250".to_string()),
            ("last_end_token".to_string(), "500".to_string()),
        ])
        .unwrap();
        let recent = vec![IntervalRecord {
            run_id: "r1".to_string(),
            start_time: Utc.with_ymd_and_hms(2024, 7, 10, 17, 0, 0).unwrap(),
            start_token: 250,
            end_token: 500,
            token_increment: 250,
            read_rate_limit: 40000,
            write_rate_limit: 40000,
            status: IntervalStatus::Success,
            end_time: None,
            elapsed_time: Some(120),
        }];
        let report = StatusReport {
            run_id: "r1".to_string(),
            done: false,
            cursor_pct: progress::cursor_pct(&params),
            eta: HistoryEstimate::from_records(&recent, &params),
            recent,
            params,
        };
        let text = format_status(&report);
        assert!(text.contains("Cursor: 500 (50.00%)"));
        assert!(text.contains("2024-07-10 17:00:00 SUCCESS 250..500 elapsed 120s"));
        assert!(text.contains("ETA: 3 intervals left at 120s each"));
    }
}
