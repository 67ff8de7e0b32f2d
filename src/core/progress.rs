//! Live progress file for operators.
//!
//! Best-effort: a failed write is logged and otherwise ignored, and writes
//! are throttled so a fast run does not hammer the disk.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::run_dir::write_json_atomic;

/// Snapshot written to `progress.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: String,
    /// 0 to 100, one decimal
    pub pct: f64,
    pub msg: String,
    pub updated_at_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_s: Option<u64>,
}

struct Throttle {
    last_write: Option<Instant>,
    /// Phase and `done` of the snapshot on disk
    last_done: Option<(String, usize)>,
    started: Instant,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_write: None,
            last_done: None,
            started: Instant::now(),
        }
    }
}

/// Throttled writer of progress snapshots
pub struct ProgressReporter {
    path: Option<PathBuf>,
    min_interval: Duration,
    state: Mutex<Throttle>,
}

impl ProgressReporter {
    pub fn new(path: PathBuf, min_interval: Duration) -> Self {
        Self {
            path: Some(path),
            min_interval,
            state: Mutex::new(Throttle::new()),
        }
    }

    /// Reporter that writes nothing
    pub fn disabled() -> Self {
        Self {
            path: None,
            min_interval: Duration::ZERO,
            state: Mutex::new(Throttle::new()),
        }
    }

    /// Report `done` of `total` units in `phase`.
    ///
    /// Always written at 0 % and 100 %; in between at most once per interval.
    /// Workers may report out of order, so a snapshot behind the one on disk
    /// for the same phase is dropped. The write happens under the lock.
    pub fn report(&self, phase: &str, done: usize, total: usize, msg: impl Into<String>) {
        let Some(path) = &self.path else {
            return;
        };

        let Ok(mut state) = self.state.lock() else {
            return;
        };

        let stale = matches!(
            &state.last_done,
            Some((last_phase, last)) if last_phase.as_str() == phase && done < *last
        );
        if stale {
            return;
        }

        let now = Instant::now();
        let boundary = done == 0 || done >= total;
        let due = state
            .last_write
            .map_or(true, |last| now.duration_since(last) >= self.min_interval);
        if !boundary && !due {
            return;
        }

        let snapshot = ProgressSnapshot {
            phase: phase.to_string(),
            pct: percent(done, total),
            msg: msg.into(),
            updated_at_utc: Utc::now(),
            eta_s: eta(now.duration_since(state.started), done, total),
        };

        state.last_write = Some(now);
        state.last_done = Some((phase.to_string(), done));
        if let Err(e) = write_json_atomic(path, &snapshot) {
            warn!(path = %path.display(), error = %e, "Failed to write progress file");
        }
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = done.min(total) as f64 * 100.0 / total as f64;
    (pct * 10.0).round() / 10.0
}

fn eta(elapsed: Duration, done: usize, total: usize) -> Option<u64> {
    if done == 0 || done >= total {
        return None;
    }
    let per_unit = elapsed.as_secs_f64() / done as f64;
    Some((per_unit * (total - done) as f64).round() as u64)
}
