//! Domain types for the call pipeline.
//!
//! This module contains the core data structures:
//! - Ids: call, recording and run identifiers
//! - Work: work units, their status and action outcomes
//! - Run: run mode, status and outcome counts

pub mod ids;
pub mod run;
pub mod work;

// Re-export commonly used types
pub use ids::IdError;
pub use run::{Run, RunCounts, RunMode, RunStatus};
pub use work::{Outcome, OutcomeKind, StateRecord, WorkStatus, WorkUnit};
