//! Step runner: drives one run over a bounded work list.
//!
//! For every unit the runner asks the state store whether it needs work,
//! runs the step's action on the ones that do (at most N at a time), and
//! records each outcome through the matching state-store mutator. The final
//! run status follows from the tallies.
//!
//! Units the store says are done are counted as skipped without touching
//! the action or the store. A targeted run (`only`) restricts the work list
//! to the listed ids and force-processes them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    Outcome, OutcomeKind, RunCounts, RunMode, RunStatus, WorkStatus, WorkUnit,
};

use super::progress::ProgressReporter;
use super::state_store::{StateError, StateStore};

/// Default number of units processed in parallel
pub const DEFAULT_CONCURRENCY: usize = 3;

/// The per-unit work of a step (download, transcribe, redact)
#[async_trait]
pub trait UnitAction: Send + Sync + 'static {
    /// Step-specific data carried by each work unit
    type Payload: Send + Sync + 'static;

    /// What a successful unit produces
    type Output: Send + 'static;

    /// Process one unit. Every failure must be mapped to an [`Outcome`].
    async fn process(&self, unit: &WorkUnit<Self::Payload>) -> Outcome<Self::Output>;
}

/// Runner settings fixed for one run
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker pool size (at least 1)
    pub concurrency: usize,

    pub mode: RunMode,

    /// Targeted retry: only these ids, processed regardless of stored state
    pub only: Option<BTreeSet<String>>,

    /// Cap on units actually processed; the rest count as skipped
    pub limit: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            mode: RunMode::Incr,
            only: None,
            limit: None,
        }
    }
}

/// Stops scheduling new units; in-flight units still finish and are recorded
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A unit that ended failed or quarantined
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub work_id: String,
    pub kind: OutcomeKind,
    pub message: String,
    /// Status recorded in the state store
    pub status: WorkStatus,
}

impl UnitFailure {
    /// Whether the next normal run will pick it up again
    pub fn retryable(&self) -> bool {
        self.status == WorkStatus::FailedTransient
    }

    /// Short key for manifests
    pub fn error_key(&self) -> &'static str {
        match self.kind {
            OutcomeKind::Transient => "transient",
            OutcomeKind::Quarantine => "quarantined",
            _ => "permanent",
        }
    }
}

/// Everything a step needs to write its outputs and manifest
#[derive(Debug)]
pub struct RunReport<T> {
    pub counts: RunCounts,
    pub status: RunStatus,
    /// Payloads of units that succeeded in this run, ordered by id
    pub completed: Vec<(String, T)>,
    /// Failed and quarantined units, ordered by id
    pub failures: Vec<UnitFailure>,
    /// Ids a dry run would have processed
    pub planned: Vec<String>,
    /// `only` ids that are not in the work list
    pub unknown_ids: Vec<String>,
    pub aborted: bool,
    pub elapsed: Duration,
}

enum UnitResult<T> {
    Done {
        work_id: String,
        output: T,
    },
    Skipped,
    Failed(UnitFailure),
}

/// Drives runs against one step's state store
pub struct StepRunner {
    store: Arc<StateStore>,
    config: RunnerConfig,
    abort: AbortHandle,
    progress: Arc<ProgressReporter>,
}

impl StepRunner {
    pub fn new(store: Arc<StateStore>, config: RunnerConfig) -> Self {
        Self {
            store,
            config,
            abort: AbortHandle::default(),
            progress: Arc::new(ProgressReporter::disabled()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run `action` over `units`.
    ///
    /// Returns an error only when the state store fails; the ledger can no
    /// longer be trusted then, so the run stops scheduling and the caller
    /// treats it as fatal.
    #[instrument(skip_all, fields(units = units.len(), mode = %self.config.mode))]
    pub async fn run<A: UnitAction>(
        &self,
        units: Vec<WorkUnit<A::Payload>>,
        action: Arc<A>,
    ) -> Result<RunReport<A::Output>, StateError> {
        let started = Instant::now();
        let (units, unknown_ids) = self.select(units);
        let mut counts = RunCounts::with_total(units.len());

        // Plan: cheap sequential pass over the ledger
        let mut to_run = Vec::new();
        let mut over_limit = 0;
        for unit in units {
            let forced = self.config.only.is_some();
            if !self.store.should_process(&unit.id, &unit.content_hash, forced)? {
                debug!(work_id = %unit.id, "Up to date, skipping");
                counts.skipped += 1;
                continue;
            }
            if self.config.limit.is_some_and(|limit| to_run.len() >= limit) {
                over_limit += 1;
                counts.skipped += 1;
                continue;
            }
            to_run.push(unit);
        }

        if over_limit > 0 {
            info!(over_limit, "Limit reached, remaining units left for a later run");
        }

        if self.config.mode.is_dry() {
            let planned: Vec<String> = to_run.into_iter().map(|u| u.id).collect();
            counts.skipped += planned.len();
            counts.planned = planned.len();
            info!(planned = planned.len(), "Dry run, nothing processed");

            return Ok(RunReport {
                status: counts.classify(false),
                counts,
                completed: Vec::new(),
                failures: Vec::new(),
                planned,
                unknown_ids,
                aborted: false,
                elapsed: started.elapsed(),
            });
        }

        let scheduled_total = to_run.len();
        info!(
            scheduled = scheduled_total,
            up_to_date = counts.skipped,
            concurrency = self.config.concurrency,
            "Processing work units"
        );
        self.progress
            .report("process", 0, scheduled_total, format!("0/{scheduled_total} units"));

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let done = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        let mut not_scheduled = 0;

        let mut pending = to_run.into_iter();
        while let Some(unit) = pending.next() {
            if self.abort.is_aborted() {
                not_scheduled = 1 + pending.len();
                warn!(not_scheduled, "Run aborted, not scheduling remaining units");
                break;
            }

            // Closed only if dropped, which cannot happen while we hold it
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            // Abort may have been requested while waiting for a worker
            if self.abort.is_aborted() {
                not_scheduled = 1 + pending.len();
                warn!(not_scheduled, "Run aborted, not scheduling remaining units");
                break;
            }

            let store = Arc::clone(&self.store);
            let action = Arc::clone(&action);
            let abort = self.abort.clone();
            let progress = Arc::clone(&self.progress);
            let done = Arc::clone(&done);

            tasks.spawn(async move {
                let result = process_unit(&store, action, unit).await;
                drop(permit);

                if result.is_err() {
                    abort.abort();
                }
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress.report(
                    "process",
                    finished,
                    scheduled_total,
                    format!("{finished}/{scheduled_total} units"),
                );
                result
            });
        }

        counts.skipped += not_scheduled;

        let mut completed = Vec::new();
        let mut failures = Vec::new();
        let mut store_error = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(UnitResult::Done { work_id, output })) => {
                    counts.record(OutcomeKind::Ok);
                    completed.push((work_id, output));
                }
                Ok(Ok(UnitResult::Skipped)) => counts.record(OutcomeKind::Skip),
                Ok(Ok(UnitResult::Failed(failure))) => {
                    counts.record(failure.kind);
                    failures.push(failure);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "State store failure, aborting run");
                    counts.failed += 1;
                    store_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(error = %join_error, "Worker task failed");
                    counts.failed += 1;
                }
            }
        }

        if let Some(e) = store_error {
            return Err(e);
        }

        completed.sort_by(|a, b| a.0.cmp(&b.0));
        failures.sort_by(|a, b| a.work_id.cmp(&b.work_id));

        let aborted = not_scheduled > 0 || self.abort.is_aborted();
        let status = counts.classify(aborted);
        info!(
            ok = counts.ok,
            failed = counts.failed,
            skipped = counts.skipped,
            quarantined = counts.quarantined,
            %status,
            "Run finished"
        );

        Ok(RunReport {
            counts,
            status,
            completed,
            failures,
            planned: Vec::new(),
            unknown_ids,
            aborted,
            elapsed: started.elapsed(),
        })
    }

    /// Apply the `only` filter, reporting ids that match nothing
    fn select<P>(&self, units: Vec<WorkUnit<P>>) -> (Vec<WorkUnit<P>>, Vec<String>) {
        let Some(only) = &self.config.only else {
            return (units, Vec::new());
        };

        let selected: Vec<WorkUnit<P>> = units
            .into_iter()
            .filter(|unit| only.contains(&unit.id))
            .collect();

        let unknown: Vec<String> = only
            .iter()
            .filter(|id| !selected.iter().any(|unit| &unit.id == *id))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            warn!(?unknown, "Requested ids are not in the work list, ignoring them");
        }

        (selected, unknown)
    }
}

/// Register, run the action, record the outcome
async fn process_unit<A: UnitAction>(
    store: &StateStore,
    action: Arc<A>,
    unit: WorkUnit<A::Payload>,
) -> Result<UnitResult<A::Output>, StateError> {
    let work_id = unit.id.clone();
    let content_hash = unit.content_hash.clone();

    store.register(&work_id, &unit.upstream_ref)?;

    // Separate task so a panicking action becomes a permanent failure
    let outcome = match tokio::spawn(async move { action.process(&unit).await }).await {
        Ok(outcome) => outcome,
        Err(join_error) => Outcome::Permanent(format!("action panicked: {join_error}")),
    };

    let failure = |kind: OutcomeKind, message: String, status: WorkStatus| {
        UnitResult::Failed(UnitFailure {
            work_id: work_id.clone(),
            kind,
            message,
            status,
        })
    };

    let result = match outcome {
        Outcome::Ok(output) => {
            store.mark_ok(&work_id, Utc::now(), &content_hash)?;
            UnitResult::Done {
                work_id: work_id.clone(),
                output,
            }
        }
        Outcome::Transient(message) => {
            let status = store.mark_failed(&work_id, &content_hash, &message, true)?;
            warn!(%work_id, %message, %status, "Transient failure");
            failure(OutcomeKind::Transient, message, status)
        }
        Outcome::Permanent(message) => {
            let status = store.mark_failed(&work_id, &content_hash, &message, false)?;
            warn!(%work_id, %message, "Permanent failure");
            failure(OutcomeKind::Permanent, message, status)
        }
        Outcome::Skip(reason) => {
            store.mark_skipped(&work_id, &reason)?;
            debug!(%work_id, %reason, "Skipped");
            UnitResult::Skipped
        }
        Outcome::Quarantine(reason) => {
            store.quarantine(&work_id, &content_hash, &reason)?;
            failure(OutcomeKind::Quarantine, reason, WorkStatus::Quarantined)
        }
    };

    Ok(result)
}
