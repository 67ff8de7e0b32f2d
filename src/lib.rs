//! callpipe - idempotent call recording pipeline
//!
//! Downloads call recordings, transcribes them and redacts personal data,
//! one step at a time. Every step can be re-run at any point: a per-step
//! ledger remembers which work units are done, so a rerun only touches what
//! is new, changed or retryable.
//!
//! # Architecture
//!
//! - Each step writes an immutable run directory ending in a manifest
//! - The next step consumes a run by id and reads only what that manifest
//!   lists
//! - Call and recording ids are derived from upstream data, never allocated
//!
//! # Modules
//!
//! - `adapters`: Spinoco API, fixture source, speech-to-text backends
//! - `core`: State store, step runner, manifests, run directories
//! - `domain`: Ids, work units, run status
//! - `steps`: ingest, transcribe, anonymize
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Download new recordings
//! callpipe ingest
//!
//! # Transcribe and redact them
//! callpipe transcribe --input-run <ingest-run-id>
//! callpipe anonymize --input-run <transcribe-run-id>
//!
//! # Retry two failed recordings
//! callpipe transcribe --input-run <ingest-run-id> --only <id1>,<id2>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod steps;

// Re-export main types at crate root for convenience
pub use crate::core::{StateStore, StepRunner, UnitAction};
pub use domain::{Outcome, Run, RunMode, RunStatus, WorkStatus, WorkUnit};
pub use steps::{StepKind, StepOptions, StepSummary};
