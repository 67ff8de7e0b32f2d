//! Work units and their per-step processing status.
//!
//! A work unit is the smallest retryable item of a step: one recording for
//! ingest and transcribe, one call for anonymize.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a work unit in a step's state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStatus {
    /// Registered, no outcome recorded yet
    Pending,

    /// Processed successfully for the recorded content hash
    Ok,

    /// Failed, will be retried by the next run
    FailedTransient,

    /// Failed for good; only a targeted retry or new input reprocesses it
    FailedPermanent,

    /// Input is invalid (e.g. a corrupt download) and must not be retried blindly
    Quarantined,

    /// Source was absent in the last run
    Skipped,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 6] = [
        WorkStatus::Pending,
        WorkStatus::Ok,
        WorkStatus::FailedTransient,
        WorkStatus::FailedPermanent,
        WorkStatus::Quarantined,
        WorkStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Ok => "ok",
            WorkStatus::FailedTransient => "failed-transient",
            WorkStatus::FailedPermanent => "failed-permanent",
            WorkStatus::Quarantined => "quarantined",
            WorkStatus::Skipped => "skipped",
        }
    }

    /// Whether a normal (non-forced) run picks the unit up regardless of its hash
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkStatus::Pending | WorkStatus::FailedTransient | WorkStatus::Skipped
        )
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown work status: {s}"))
    }
}

/// One unit of work handed to the step runner
#[derive(Debug, Clone)]
pub struct WorkUnit<P = ()> {
    /// Stable id (recording id or call id)
    pub id: String,

    /// What the action reads: a path or a remote id
    pub upstream_ref: String,

    /// Fingerprint of everything that determines the unit's output
    pub content_hash: String,

    /// Step-specific data the action needs
    pub payload: P,
}

impl<P> WorkUnit<P> {
    pub fn new(
        id: impl Into<String>,
        upstream_ref: impl Into<String>,
        content_hash: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            id: id.into(),
            upstream_ref: upstream_ref.into(),
            content_hash: content_hash.into(),
            payload,
        }
    }
}

/// Persisted state of one work unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRecord {
    pub work_id: String,
    pub upstream_ref: String,
    pub status: WorkStatus,
    pub retry_count: u32,
    pub content_hash: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Result of running the action on one unit.
///
/// Actions never return errors; every failure is mapped to one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    /// Worth retrying on the next run (network, timeout)
    Transient(String),
    /// Retrying with the same input will not help
    Permanent(String),
    /// Source absent in this run's scope; not a failure
    Skip(String),
    /// Input is invalid and is parked for an operator
    Quarantine(String),
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Ok(_) => OutcomeKind::Ok,
            Outcome::Transient(_) => OutcomeKind::Transient,
            Outcome::Permanent(_) => OutcomeKind::Permanent,
            Outcome::Skip(_) => OutcomeKind::Skip,
            Outcome::Quarantine(_) => OutcomeKind::Quarantine,
        }
    }
}

/// Payload-free view of an [`Outcome`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    Transient,
    Permanent,
    Skip,
    Quarantine,
}
