//! Run state and outcome tallies.
//!
//! A Run is one execution of one step. Its final status is derived from the
//! per-outcome counts once every work unit has been attempted.

use std::fmt;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::ids;
use super::work::OutcomeKind;

/// How a run selects its work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Full history; ignores stored watermarks
    Backfill,

    /// Only what changed since the last successful run
    #[default]
    Incr,

    /// Plan only: no actions invoked, no state written
    Dry,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Backfill => "backfill",
            RunMode::Incr => "incr",
            RunMode::Dry => "dry",
        }
    }

    pub fn is_dry(&self) -> bool {
        matches!(self, RunMode::Dry)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Still running
    Pending,

    /// No failures
    Success,

    /// Some units failed, some did not
    Partial,

    /// Every unit failed, or the run could not process at all
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }

    /// Process exit code for a finished run
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success | RunStatus::Partial => 0,
            RunStatus::Pending | RunStatus::Error => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome tallies of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
    pub quarantined: usize,

    /// Units a dry run would have processed (already included in `skipped`)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub planned: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl RunCounts {
    /// Start a tally for a work list of `total` units
    pub fn with_total(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Ok => self.ok += 1,
            OutcomeKind::Transient | OutcomeKind::Permanent => self.failed += 1,
            OutcomeKind::Skip => self.skipped += 1,
            OutcomeKind::Quarantine => self.quarantined += 1,
        }
    }

    /// Failures in the run-status sense: failed plus quarantined
    pub fn failures(&self) -> usize {
        self.failed + self.quarantined
    }

    /// Every unit ended in exactly one bucket
    pub fn is_balanced(&self) -> bool {
        self.ok + self.failed + self.skipped + self.quarantined == self.total
    }

    /// Final status for these counts.
    ///
    /// `aborted` covers both a stopped run and a fatal precondition.
    pub fn classify(&self, aborted: bool) -> RunStatus {
        let failures = self.failures();
        if aborted || (failures > 0 && failures == self.total) {
            RunStatus::Error
        } else if failures > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }
}

/// One execution of one step
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub run_id: String,
    pub step_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
}

impl Run {
    /// Start a run, generating a run id unless one is given
    pub fn start(step_id: impl Into<String>, run_id: Option<String>, mode: RunMode) -> Self {
        Self {
            run_id: run_id.unwrap_or_else(ids::new_run_id),
            step_id: step_id.into(),
            mode,
            started_at: Utc::now(),
            status: RunStatus::Pending,
        }
    }

    /// Set the final status. Returns false if the run was already finished.
    pub fn finish(&mut self, status: RunStatus) -> bool {
        if self.status != RunStatus::Pending {
            return false;
        }
        self.status = status;
        true
    }
}
