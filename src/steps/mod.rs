//! Pipeline steps and the flow they share.
//!
//! Every step follows the same shape:
//! 1. open its run directory and state store ([`StepContext::begin`])
//! 2. read the upstream run's manifest, if it has one
//! 3. build a work list and hand it to the [`StepRunner`]
//! 4. write data files, then metrics, error file, manifest and marker
//!    ([`StepContext::finish`])
//!
//! A fatal precondition still ends in a manifest (status `error`) so an
//! operator can see what happened from the run directory alone.

pub mod anonymize;
pub mod ingest;
pub mod transcribe;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::config::ResolvedConfig;
use crate::core::manifest::{
    ErrorFile, FailedUnit, InputRef, Manifest, Outputs, Producer, RunMetrics, UnitError,
};
use crate::core::run_dir::{read_json, write_json_atomic, RunDir};
use crate::core::{AbortHandle, ProgressReporter, RunReport, RunnerConfig, StateStore, StepRunner};
use crate::domain::{Run, RunCounts, RunMode, RunStatus};

/// Semver of every output schema this build writes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Env var carrying an orchestrator's flow run id into manifests
pub const FLOW_RUN_ID_ENV: &str = "CALLPIPE_FLOW_RUN_ID";

/// The pipeline's steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum StepKind {
    Ingest,
    Transcribe,
    Anonymize,
}

impl StepKind {
    pub const ALL: [StepKind; 3] = [StepKind::Ingest, StepKind::Transcribe, StepKind::Anonymize];

    /// Directory and state file name
    pub fn step_id(&self) -> &'static str {
        match self {
            Self::Ingest => "01_ingest_spinoco",
            Self::Transcribe => "02_transcribe_asr_adapter",
            Self::Anonymize => "03_anonymize",
        }
    }

    /// Schema name of the run's data
    pub fn schema(&self) -> &'static str {
        match self {
            Self::Ingest => "bh.v1.raw_audio",
            Self::Transcribe => "bh.v1.transcripts",
            Self::Anonymize => "bh.v1.transcripts_redacted",
        }
    }

    /// Step whose runs this one consumes
    pub fn upstream(&self) -> Option<StepKind> {
        match self {
            Self::Ingest => None,
            Self::Transcribe => Some(Self::Ingest),
            Self::Anonymize => Some(Self::Transcribe),
        }
    }

    /// CLI subcommand name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Transcribe => "transcribe",
            Self::Anonymize => "anonymize",
        }
    }

    pub fn from_step_id(step_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.step_id() == step_id)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.step_id())
    }
}

/// Per-invocation options common to all steps
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub mode: RunMode,
    /// Reuse a run id instead of generating one
    pub run_id: Option<String>,
    pub only: Option<BTreeSet<String>>,
    /// Overrides the step's configured `max_retry`
    pub max_retry: Option<u32>,
    pub limit: Option<usize>,
    /// Overrides `runner.concurrency`
    pub concurrency: Option<usize>,
    /// Upstream run to consume
    pub input_run: Option<String>,
    /// Ingest only: list calls changed after this instant
    pub since: Option<DateTime<Utc>>,
}

/// What a finished step reports back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub run_dir: PathBuf,
}

impl StepSummary {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// Step-specific parts of the manifest
#[derive(Debug, Default)]
pub struct StepOutputs {
    pub outputs: Outputs,
    pub input_refs: Vec<InputRef>,
    /// Extra numbers for `metrics.json` and the manifest
    pub metrics: Map<String, Value>,
    pub notes: Vec<String>,
}

/// A run in progress: its directory, ledger and bookkeeping
pub struct StepContext {
    pub kind: StepKind,
    pub config: ResolvedConfig,
    pub options: StepOptions,
    pub run: Run,
    pub run_dir: RunDir,
    pub progress: Arc<ProgressReporter>,
    abort: AbortHandle,
    store: Option<Arc<StateStore>>,
    upstream: Option<(RunDir, Manifest)>,
}

impl StepContext {
    /// Create the run directory and progress file. The state store is
    /// opened separately so that a locked or broken ledger still gets a
    /// manifest.
    pub fn begin(
        kind: StepKind,
        config: ResolvedConfig,
        options: StepOptions,
        abort: AbortHandle,
    ) -> Result<Self> {
        let run = Run::start(kind.step_id(), options.run_id.clone(), options.mode);
        let run_dir = RunDir::create(&config.runs_dir(), kind.step_id(), &run.run_id)?;
        let progress = Arc::new(ProgressReporter::new(
            run_dir.progress_path(),
            Duration::from_millis(config.runner.progress_interval_ms),
        ));
        progress.report("start", 0, 1, format!("{} run {}", kind.command(), run.run_id));

        info!(
            step = kind.step_id(),
            run_id = %run.run_id,
            mode = %run.mode,
            dir = %run_dir.path().display(),
            "Starting run"
        );

        Ok(Self {
            kind,
            config,
            options,
            run,
            run_dir,
            progress,
            abort,
            store: None,
            upstream: None,
        })
    }

    /// Open the step's ledger
    pub fn open_store(&mut self, configured_max_retry: u32) -> Result<Arc<StateStore>> {
        let max_retry = self.options.max_retry.unwrap_or(configured_max_retry);
        let path = self.config.state_path(self.kind.step_id());
        let store = Arc::new(
            StateStore::open(&path, max_retry)
                .with_context(|| format!("Failed to open state store {}", path.display()))?,
        );
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Load the manifest of the upstream run named by `--input-run`
    pub fn load_upstream(&mut self) -> Result<(RunDir, Manifest)> {
        let upstream = self
            .kind
            .upstream()
            .with_context(|| format!("{} has no upstream step", self.kind))?;
        let input_run = self
            .options
            .input_run
            .clone()
            .with_context(|| format!("--input-run is required for {}", self.kind.command()))?;

        let dir = RunDir::existing(&self.config.runs_dir(), upstream.step_id(), &input_run)?;
        let manifest: Manifest = read_json(&dir.manifest_path())
            .with_context(|| format!("Upstream run {} has no readable manifest", input_run))?;

        if !manifest.is_consumable() {
            anyhow::bail!(
                "Upstream run {} ended with status {}, refusing to consume it",
                input_run,
                manifest.status
            );
        }

        self.upstream = Some((dir.clone(), manifest.clone()));
        Ok((dir, manifest))
    }

    /// Runner configured from options and config
    pub fn runner(&self, store: Arc<StateStore>) -> StepRunner {
        let config = RunnerConfig {
            concurrency: self
                .options
                .concurrency
                .unwrap_or(self.config.runner.concurrency)
                .max(1),
            mode: self.options.mode,
            only: self.options.only.clone(),
            limit: self.options.limit,
        };
        StepRunner::new(store, config)
            .with_progress(Arc::clone(&self.progress))
            .with_abort(self.abort.clone())
    }

    /// Command an operator runs to retry this run's failures
    pub fn retry_command(&self) -> String {
        match &self.options.input_run {
            Some(input_run) => format!("callpipe {} --input-run {}", self.kind.command(), input_run),
            None => format!("callpipe {}", self.kind.command()),
        }
    }

    /// Write metrics, error file, manifest and success marker for a run
    /// that reached the runner
    pub fn finish<T>(mut self, report: &RunReport<T>, step: StepOutputs) -> Result<StepSummary> {
        let counts = report.counts;
        let status = report.status;
        let runtime_s = report.elapsed.as_secs_f64();

        let mut errors: Vec<UnitError> = report
            .failures
            .iter()
            .map(|f| UnitError {
                unit_id: f.work_id.clone(),
                error_key: f.error_key().to_string(),
                message: f.message.clone(),
            })
            .collect();
        if report.aborted {
            errors.push(UnitError {
                unit_id: self.run.run_id.clone(),
                error_key: "aborted".to_string(),
                message: format!(
                    "run aborted before all units were scheduled ({} skipped)",
                    counts.skipped
                ),
            });
        }

        let mut notes = step.notes;
        if !report.unknown_ids.is_empty() {
            notes.push(format!(
                "requested ids not in the work list: {}",
                report.unknown_ids.join(",")
            ));
        }
        if !report.planned.is_empty() {
            notes.push(format!("dry run would process: {}", report.planned.join(",")));
        }

        let mut metrics = RunMetrics::new(&self.run.run_id, counts, runtime_s);
        metrics.step = step.metrics.clone();
        write_json_atomic(&self.run_dir.metrics_path(), &metrics)?;

        if !report.failures.is_empty() {
            let failed = report
                .failures
                .iter()
                .map(|f| FailedUnit {
                    work_id: f.work_id.clone(),
                    error: f.message.clone(),
                    retryable: f.retryable(),
                })
                .collect();
            let error_file = ErrorFile::new(&self.run.run_id, &self.retry_command(), failed);
            write_json_atomic(&self.run_dir.error_path(), &error_file)?;
        }

        let mut manifest_metrics = step.metrics;
        manifest_metrics.insert("runtime_s".to_string(), metrics.runtime_s.into());
        manifest_metrics.insert(
            "throughput_units_per_min".to_string(),
            metrics.throughput_units_per_min.into(),
        );

        self.write_manifest(
            status,
            counts,
            StepOutputs {
                outputs: step.outputs,
                input_refs: step.input_refs,
                metrics: manifest_metrics,
                notes,
            },
            errors,
        )
    }

    /// End the run with status `error` because it could not get going
    pub fn fail(mut self, cause: &anyhow::Error) -> Result<StepSummary> {
        let message = format!("{cause:#}");
        error!(step = self.kind.step_id(), run_id = %self.run.run_id, error = %message, "Run failed");

        let mut error_file = ErrorFile::new(&self.run.run_id, &self.retry_command(), Vec::new());
        error_file.fatal = Some(message.clone());
        write_json_atomic(&self.run_dir.error_path(), &error_file)?;

        let errors = vec![UnitError {
            unit_id: self.run.run_id.clone(),
            error_key: "fatal".to_string(),
            message,
        }];
        self.write_manifest(RunStatus::Error, RunCounts::default(), StepOutputs::default(), errors)
    }

    fn write_manifest(
        &mut self,
        status: RunStatus,
        counts: RunCounts,
        step: StepOutputs,
        errors: Vec<UnitError>,
    ) -> Result<StepSummary> {
        if !self.run.finish(status) {
            anyhow::bail!("Run {} was already finished", self.run.run_id);
        }

        let mut input_refs = step.input_refs;
        if let Some((dir, manifest)) = &self.upstream {
            input_refs.insert(0, InputRef::new("run", dir.path().display().to_string()));
            input_refs.insert(1, InputRef::new("schema", &manifest.schema));
        }

        let manifest = Manifest {
            schema: self.kind.schema().to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            step_id: self.kind.step_id().to_string(),
            step_run_id: self.run.run_id.clone(),
            flow_run_id: std::env::var(FLOW_RUN_ID_ENV).ok().filter(|v| !v.is_empty()),
            producer: Producer::current(),
            run_mode: self.run.mode,
            input_run: self.options.input_run.clone(),
            started_at_utc: self.run.started_at,
            finished_at_utc: Utc::now(),
            status,
            input_refs,
            outputs: step.outputs,
            counts,
            metrics: step.metrics,
            errors,
            notes: step.notes,
        };
        manifest
            .validate()
            .with_context(|| format!("Refusing to write invalid manifest for {}", self.run.run_id))?;

        write_json_atomic(&self.run_dir.manifest_path(), &manifest)?;
        self.run_dir.set_success_marker(status == RunStatus::Success)?;
        self.progress.report("done", 1, 1, format!("status {status}"));

        if let Some(store) = &self.store {
            match store.stats() {
                Ok(stats) => info!(?stats, "Ledger after run"),
                Err(e) => warn!(error = %e, "Failed to read ledger stats"),
            }
        }

        info!(
            step = self.kind.step_id(),
            run_id = %self.run.run_id,
            %status,
            ok = counts.ok,
            failed = counts.failed,
            skipped = counts.skipped,
            quarantined = counts.quarantined,
            "Run complete"
        );

        Ok(StepSummary {
            step_id: self.kind.step_id().to_string(),
            run_id: self.run.run_id.clone(),
            status,
            counts,
            run_dir: self.run_dir.path().to_path_buf(),
        })
    }
}

/// Read an upstream JSONL file named in its manifest outputs
pub(crate) fn upstream_file(dir: &RunDir, manifest: &Manifest, key: &str) -> Result<PathBuf> {
    let relative = if manifest.outputs.primary.ends_with(key) {
        manifest.outputs.primary.clone()
    } else {
        manifest
            .outputs
            .aux
            .values()
            .find(|path| path.ends_with(key))
            .cloned()
            .with_context(|| format!("Upstream manifest lists no {} output", key))?
    };
    Ok(dir.resolve(&relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_step_kind_chain() {
        assert_eq!(StepKind::Ingest.upstream(), None);
        assert_eq!(StepKind::Transcribe.upstream(), Some(StepKind::Ingest));
        assert_eq!(StepKind::Anonymize.upstream(), Some(StepKind::Transcribe));
        assert_eq!(
            StepKind::from_step_id("02_transcribe_asr_adapter"),
            Some(StepKind::Transcribe)
        );
        assert_eq!(StepKind::from_step_id("99_nope"), None);
    }

    #[test]
    fn test_fatal_precondition_writes_error_manifest() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::with_home(temp.path());
        let options = StepOptions {
            input_run: Some("01J0000000000000000000000A".to_string()),
            ..StepOptions::default()
        };

        let mut ctx =
            StepContext::begin(StepKind::Transcribe, config, options, AbortHandle::default())
                .unwrap();
        let err = ctx.load_upstream().unwrap_err();
        let dir = ctx.run_dir.clone();
        let summary = ctx.fail(&err).unwrap();

        assert_eq!(summary.status, RunStatus::Error);
        assert_eq!(summary.exit_code(), 1);

        let manifest: Manifest = read_json(&dir.manifest_path()).unwrap();
        assert_eq!(manifest.status, RunStatus::Error);
        assert_eq!(manifest.errors[0].error_key, "fatal");
        assert_eq!(manifest.input_run.as_deref(), Some("01J0000000000000000000000A"));
        assert!(!dir.success_marker().exists());

        let error_file: ErrorFile = read_json(&dir.error_path()).unwrap();
        assert!(error_file.fatal.is_some());
    }

    #[test]
    fn test_retry_command_names_input_run() {
        let temp = TempDir::new().unwrap();
        let options = StepOptions {
            input_run: Some("RUN1".to_string()),
            ..StepOptions::default()
        };
        let ctx = StepContext::begin(
            StepKind::Anonymize,
            ResolvedConfig::with_home(temp.path()),
            options,
            AbortHandle::default(),
        )
        .unwrap();
        assert_eq!(ctx.retry_command(), "callpipe anonymize --input-run RUN1");
    }
}
