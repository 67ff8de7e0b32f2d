//! Run manifest, metrics and error file.
//!
//! The manifest is the only thing a downstream step reads from an upstream
//! run: it names the data files (`outputs`) and says how the run ended. It
//! is written once, after every work unit has been attempted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{RunCounts, RunMode, RunStatus};

/// Manifest validation failures
#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("schema_version {0:?} is not MAJOR.MINOR.PATCH")]
    BadVersion(String),

    #[error("status success must not list errors ({0} present)")]
    SuccessWithErrors(usize),

    #[error("status {0} requires at least one error entry")]
    MissingErrors(RunStatus),

    #[error("counts do not add up to total: {0:?}")]
    UnbalancedCounts(RunCounts),

    #[error("a pending run has no manifest")]
    NotFinished,
}

/// Who produced a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub host: String,
    pub user: String,
    pub processor_version: String,
}

impl Producer {
    /// Describe the current process
    pub fn current() -> Self {
        let from_env = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
                .unwrap_or_else(|| "unknown".to_string())
        };

        Self {
            host: from_env(&["HOSTNAME", "COMPUTERNAME"]),
            user: from_env(&["USER", "USERNAME"]),
            processor_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Something the run read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl InputRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Data files of a run, relative to its directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    pub primary: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aux: BTreeMap<String, String>,
}

/// One failed unit as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitError {
    pub unit_id: String,
    pub error_key: String,
    pub message: String,
}

/// End-of-run summary consumed by the next step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema: String,
    pub schema_version: String,
    pub step_id: String,
    pub step_run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_run_id: Option<String>,
    pub producer: Producer,
    pub run_mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_run: Option<String>,
    pub started_at_utc: DateTime<Utc>,
    pub finished_at_utc: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub input_refs: Vec<InputRef>,
    pub outputs: Outputs,
    pub counts: RunCounts,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<UnitError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Manifest {
    /// Check the invariants every written manifest must hold
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_semver(&self.schema_version) {
            return Err(ManifestError::BadVersion(self.schema_version.clone()));
        }

        match self.status {
            RunStatus::Pending => return Err(ManifestError::NotFinished),
            RunStatus::Success if !self.errors.is_empty() => {
                return Err(ManifestError::SuccessWithErrors(self.errors.len()));
            }
            RunStatus::Partial | RunStatus::Error if self.errors.is_empty() => {
                return Err(ManifestError::MissingErrors(self.status));
            }
            _ => {}
        }

        if !self.counts.is_balanced() {
            return Err(ManifestError::UnbalancedCounts(self.counts));
        }

        Ok(())
    }

    /// Whether downstream steps may consume this run
    pub fn is_consumable(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::Partial)
    }
}

/// Throughput and timing of a run, plus step-specific numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub step_run_id: String,
    pub counts: RunCounts,
    pub runtime_s: f64,
    pub throughput_units_per_min: f64,
    #[serde(flatten)]
    pub step: Map<String, Value>,
}

impl RunMetrics {
    pub fn new(step_run_id: impl Into<String>, counts: RunCounts, runtime_s: f64) -> Self {
        let processed = (counts.ok + counts.failures()) as f64;
        let throughput = if runtime_s > 0.0 {
            processed / runtime_s * 60.0
        } else {
            0.0
        };

        Self {
            step_run_id: step_run_id.into(),
            counts,
            runtime_s: round2(runtime_s),
            throughput_units_per_min: round2(throughput),
            step: Map::new(),
        }
    }
}

/// One failed unit in the error file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub work_id: String,
    pub error: String,
    pub retryable: bool,
}

/// Operator-facing list of what failed and how to retry it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFile {
    pub step_run_id: String,
    pub failed: Vec<FailedUnit>,
    /// Ready to paste; empty when there is nothing to retry by id
    pub retry_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

impl ErrorFile {
    /// Build the error file, with a retry command naming every failed id
    pub fn new(step_run_id: impl Into<String>, command_prefix: &str, failed: Vec<FailedUnit>) -> Self {
        let retry_command = if failed.is_empty() {
            String::new()
        } else {
            let ids: Vec<&str> = failed.iter().map(|f| f.work_id.as_str()).collect();
            format!("{} --only {}", command_prefix, ids.join(","))
        };

        Self {
            step_run_id: step_run_id.into(),
            failed,
            retry_command,
            fatal: None,
        }
    }
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
