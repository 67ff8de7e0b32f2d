//! Command-line interface for callpipe.
//!
//! One subcommand per pipeline step, plus operator commands for inspecting
//! and resetting step ledgers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use crate::adapters::{AsrBackend, FixtureSource, RecordingSource, SpinocoClient};
use crate::config::{self, ResolvedConfig};
use crate::core::manifest::Manifest;
use crate::core::progress::ProgressSnapshot;
use crate::core::run_dir::{read_json, MANIFEST_FILE, PROGRESS_FILE};
use crate::core::{AbortHandle, StateStore};
use crate::domain::ids::{
    call_id_of_recording, is_valid_call_id, is_valid_recording_id, is_valid_run_id,
    timestamp_from_call_id,
};
use crate::domain::{RunMode, WorkStatus};
use crate::steps::ingest::{self, WATERMARK_KEY};
use crate::steps::{anonymize, transcribe, StepKind, StepOptions, StepSummary};

/// callpipe - idempotent call recording pipeline
#[derive(Parser, Debug)]
#[command(name = "callpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: .callpipe/config.yaml in this or a parent directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by the step commands
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// How the run selects work
    #[arg(long, value_enum, default_value = "incr")]
    pub mode: RunMode,

    /// Use this run id instead of a fresh one
    #[arg(long)]
    pub run_id: Option<String>,

    /// Only process these ids (comma-separated), even if already done
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Failures allowed before a unit is given up on
    #[arg(long)]
    pub max_retry: Option<u32>,

    /// Process at most this many units
    #[arg(long)]
    pub limit: Option<usize>,

    /// Units processed in parallel
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download new call recordings
    Ingest {
        #[command(flatten)]
        run: RunArgs,

        /// List calls changed after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_since_arg)]
        since: Option<DateTime<Utc>>,
    },

    /// Transcribe the audio of an ingest run
    Transcribe {
        #[command(flatten)]
        run: RunArgs,

        /// Ingest run to consume
        #[arg(long)]
        input_run: String,
    },

    /// Redact personal data from a transcribe run
    Anonymize {
        #[command(flatten)]
        run: RunArgs,

        /// Transcribe run to consume
        #[arg(long)]
        input_run: String,
    },

    /// Show a step's ledger and recent runs, or one run's manifest
    Status {
        #[arg(value_enum)]
        step: StepKind,

        /// Show this run instead of the ledger
        #[arg(long)]
        run_id: Option<String>,

        /// Number of recent runs listed
        #[arg(long, default_value = "10")]
        recent: usize,
    },

    /// Delete ledger records so units are processed again
    Reset {
        #[arg(value_enum)]
        step: StepKind,

        /// Work ids to forget (comma-separated)
        #[arg(long, value_delimiter = ',', required_unless_present = "all")]
        ids: Vec<String>,

        /// Forget every record of the step
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub async fn execute(self) -> Result<i32> {
        let cfg = config::load(self.config.as_deref())?;

        match self.command {
            Commands::Ingest { run, since } => {
                let mut options = step_options(StepKind::Ingest, run)?;
                options.since = since;
                let source = recording_source(&cfg)?;
                let abort = abort_on_ctrl_c();
                report(ingest::run(cfg, options, source, abort).await?)
            }
            Commands::Transcribe { run, input_run } => {
                let mut options = step_options(StepKind::Transcribe, run)?;
                options.input_run = Some(input_run);
                let backend = Arc::new(AsrBackend::from_settings(&cfg.transcribe)?);
                let abort = abort_on_ctrl_c();
                report(transcribe::run(cfg, options, backend, abort).await?)
            }
            Commands::Anonymize { run, input_run } => {
                let mut options = step_options(StepKind::Anonymize, run)?;
                options.input_run = Some(input_run);
                let abort = abort_on_ctrl_c();
                report(anonymize::run(cfg, options, abort).await?)
            }
            Commands::Status {
                step,
                run_id,
                recent,
            } => {
                match run_id {
                    Some(run_id) => show_run(&cfg, step, &run_id)?,
                    None => show_ledger(&cfg, step, recent)?,
                }
                Ok(0)
            }
            Commands::Reset { step, ids, all } => {
                reset(&cfg, step, &ids, all)?;
                Ok(0)
            }
            Commands::Config => {
                show_config(&cfg)?;
                Ok(0)
            }
        }
    }
}

fn parse_since_arg(value: &str) -> Result<DateTime<Utc>, String> {
    ingest::parse_since(value).map_err(|e| format!("{e:#}"))
}

fn step_options(step: StepKind, args: RunArgs) -> Result<StepOptions> {
    if let Some(run_id) = &args.run_id {
        if !is_valid_run_id(run_id) {
            anyhow::bail!("Invalid run id {run_id:?}: expected a 26-character ULID");
        }
    }

    let only = only_ids(step, args.only);

    Ok(StepOptions {
        mode: args.mode,
        run_id: args.run_id,
        only: (!only.is_empty()).then_some(only),
        max_retry: args.max_retry,
        limit: args.limit,
        concurrency: args.concurrency,
        input_run: None,
        since: None,
    })
}

/// Normalize `--only` ids to the step's unit ids.
///
/// Anonymize works per call, so a recording id selects the call it belongs
/// to. Ids of the wrong shape are kept (the runner reports them as unknown)
/// but flagged here.
fn only_ids(step: StepKind, raw: Vec<String>) -> BTreeSet<String> {
    raw.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(|id| match step {
            StepKind::Anonymize => match call_id_of_recording(&id) {
                Some(call_id) => call_id.to_string(),
                None => {
                    if !is_valid_call_id(&id) {
                        warn!(%id, "Not a call id");
                    }
                    id
                }
            },
            StepKind::Ingest | StepKind::Transcribe => {
                if !is_valid_recording_id(&id) {
                    warn!(%id, "Not a recording id");
                }
                id
            }
        })
        .collect()
}

/// Fixture directory if configured, otherwise the Spinoco API
fn recording_source(cfg: &ResolvedConfig) -> Result<Arc<dyn RecordingSource>> {
    if let Some(dir) = &cfg.ingest.fixtures_dir {
        return Ok(Arc::new(FixtureSource::load(dir)?));
    }

    let token = std::env::var(&cfg.ingest.token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .with_context(|| format!("API token not set: export {}", cfg.ingest.token_env))?;

    Ok(Arc::new(SpinocoClient::new(
        &cfg.ingest.api_base_url,
        &token,
        cfg.ingest.page_size,
        std::time::Duration::from_secs(cfg.ingest.request_timeout_s),
    )?))
}

/// Ctrl-C stops scheduling; units already running finish and are recorded
fn abort_on_ctrl_c() -> AbortHandle {
    let abort = AbortHandle::default();
    let handle = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight units");
            handle.abort();
        }
    });
    abort
}

fn report(summary: StepSummary) -> Result<i32> {
    let c = &summary.counts;
    eprintln!(
        "\n[{} run {} {}: total {}, ok {}, failed {}, skipped {}, quarantined {}]",
        summary.step_id,
        summary.run_id,
        summary.status,
        c.total,
        c.ok,
        c.failed,
        c.skipped,
        c.quarantined
    );
    if c.planned > 0 {
        eprintln!("[dry run: {} units would be processed]", c.planned);
    }
    eprintln!("[run directory: {}]", summary.run_dir.display());
    // The run id on stdout lets scripts chain steps
    println!("{}", summary.run_id);

    Ok(summary.exit_code())
}

fn max_retry_for(cfg: &ResolvedConfig, step: StepKind) -> u32 {
    match step {
        StepKind::Ingest => cfg.ingest.max_retry,
        StepKind::Transcribe => cfg.transcribe.max_retry,
        StepKind::Anonymize => cfg.anonymize.max_retry,
    }
}

fn open_store(cfg: &ResolvedConfig, step: StepKind) -> Result<StateStore> {
    let path = cfg.state_path(step.step_id());
    if !path.exists() {
        anyhow::bail!("No state for {} yet ({})", step, path.display());
    }
    StateStore::open(&path, max_retry_for(cfg, step))
        .with_context(|| format!("Failed to open {}", path.display()))
}

/// Ledger counts plus a table of recent runs
fn show_ledger(cfg: &ResolvedConfig, step: StepKind, recent: usize) -> Result<()> {
    let store = open_store(cfg, step)?;

    println!("Step: {}", step);
    println!("State: {}", cfg.state_path(step.step_id()).display());
    println!();
    println!("{:<18} {:>8}", "STATUS", "UNITS");
    println!("{}", "-".repeat(27));
    for (status, count) in store.stats()? {
        println!("{:<18} {:>8}", status.as_str(), count);
    }
    if step == StepKind::Ingest {
        if let Some(ms) = store.get_meta(WATERMARK_KEY)? {
            println!();
            println!("Watermark: {}", watermark_display(&ms));
        }
    }

    let failing = store.list_by_status(
        &[
            WorkStatus::FailedTransient,
            WorkStatus::FailedPermanent,
            WorkStatus::Quarantined,
        ],
        Some(recent),
    )?;
    if !failing.is_empty() {
        println!();
        println!("{:<32} {:<18} {:<20} {:>5}  ERROR", "UNIT", "STATUS", "CALL TIME", "TRIES");
        println!("{}", "-".repeat(90));
        for record in failing {
            let call_time = timestamp_from_call_id(&record.work_id)
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!(
                "{:<32} {:<18} {:<20} {:>5}  {}",
                record.work_id,
                record.status.as_str(),
                call_time,
                record.retry_count,
                record.last_error.as_deref().unwrap_or("")
            );
        }
    }

    let runs = recent_runs(&cfg.runs_dir().join(step.step_id()), recent)?;
    println!();
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }
    println!("{:<28} {:<10} {:<8} {:>6} {:>6} {:>6} {:>6}", "RUN ID", "STATUS", "MODE", "TOTAL", "OK", "FAIL", "SKIP");
    println!("{}", "-".repeat(78));
    for (run_id, manifest) in runs {
        match manifest {
            Some(m) => println!(
                "{:<28} {:<10} {:<8} {:>6} {:>6} {:>6} {:>6}",
                run_id,
                m.status.as_str(),
                m.run_mode.as_str(),
                m.counts.total,
                m.counts.ok,
                m.counts.failures(),
                m.counts.skipped
            ),
            None => println!("{:<28} {:<10}", run_id, "running"),
        }
    }

    Ok(())
}

fn watermark_display(raw: &str) -> String {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| raw.to_string())
}

/// Newest first; ULID run ids sort by creation time
fn recent_runs(step_dir: &Path, limit: usize) -> Result<Vec<(String, Option<Manifest>)>> {
    if !step_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut run_ids: Vec<String> = std::fs::read_dir(step_dir)
        .with_context(|| format!("Failed to read {}", step_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    run_ids.sort_unstable_by(|a, b| b.cmp(a));
    run_ids.truncate(limit);

    Ok(run_ids
        .into_iter()
        .map(|run_id| {
            let manifest = read_json(&step_dir.join(&run_id).join(MANIFEST_FILE)).ok();
            (run_id, manifest)
        })
        .collect())
}

/// Manifest summary of one run, or its progress if it is still going
fn show_run(cfg: &ResolvedConfig, step: StepKind, run_id: &str) -> Result<()> {
    let dir = cfg.runs_dir().join(step.step_id()).join(run_id);
    if !dir.is_dir() {
        anyhow::bail!("Run {} of {} not found at {}", run_id, step, dir.display());
    }

    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        let progress: Option<ProgressSnapshot> = read_json(&dir.join(PROGRESS_FILE)).ok();
        println!("Run ID: {}", run_id);
        println!("Status: running");
        if let Some(p) = progress {
            println!("Phase: {} ({:.1}%)", p.phase, p.pct);
            println!("Message: {}", p.msg);
            if let Some(eta) = p.eta_s {
                println!("ETA: {}s", eta);
            }
        }
        return Ok(());
    }

    let m: Manifest = read_json(&manifest_path)?;
    println!("Run ID: {}", m.step_run_id);
    println!("Step: {} ({} {})", m.step_id, m.schema, m.schema_version);
    println!("Mode: {}", m.run_mode);
    println!("Status: {}", m.status);
    if let Some(input_run) = &m.input_run {
        println!("Input run: {}", input_run);
    }
    println!("Started: {}", m.started_at_utc);
    println!("Finished: {}", m.finished_at_utc);
    println!(
        "Counts: total {}, ok {}, failed {}, skipped {}, quarantined {}",
        m.counts.total, m.counts.ok, m.counts.failed, m.counts.skipped, m.counts.quarantined
    );
    println!("Output: {}", dir.join(&m.outputs.primary).display());
    for note in &m.notes {
        println!("Note: {}", note);
    }
    if !m.errors.is_empty() {
        println!("\nErrors:");
        for e in &m.errors {
            println!("  {} [{}]: {}", e.unit_id, e.error_key, e.message);
        }
    }

    Ok(())
}

fn reset(cfg: &ResolvedConfig, step: StepKind, ids: &[String], all: bool) -> Result<()> {
    let store = open_store(cfg, step)?;
    let removed = if all {
        store.reset_all()?
    } else {
        store.reset(ids)?
    };
    eprintln!("[{}: {} record(s) removed]", step, removed);
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Runs:  {}", cfg.runs_dir().display());
    for step in StepKind::ALL {
        println!("  State: {}", cfg.state_path(step.step_id()).display());
    }
    println!();
    print!(
        "{}",
        serde_yaml::to_string(cfg).context("Failed to render configuration")?
    );
    Ok(())
}
