//! Core step machinery shared by every pipeline step.
//!
//! This module contains:
//! - StateStore: per-step SQLite ledger of work unit status
//! - StepRunner: bounded worker pool and outcome classification
//! - Manifest: end-of-run summary, metrics and error file
//! - RunDir: run directory layout and atomic file writes
//! - ProgressReporter: throttled, best-effort progress file
//! - Fingerprint: content hashes for change detection

pub mod fingerprint;
pub mod manifest;
pub mod progress;
pub mod run_dir;
pub mod runner;
pub mod state_store;

// Re-export commonly used types
pub use fingerprint::{content_hash, hash_bytes};
pub use manifest::{
    ErrorFile, FailedUnit, InputRef, Manifest, ManifestError, Outputs, Producer, RunMetrics,
    UnitError,
};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use run_dir::RunDir;
pub use runner::{AbortHandle, RunReport, RunnerConfig, StepRunner, UnitAction, UnitFailure};
pub use state_store::{StateError, StateStore};
