//! Per-step SQLite ledger of work unit status.
//!
//! One database file per step, one row per work unit. Every mutation touches
//! exactly one row inside one statement or transaction, so workers handling
//! different units never observe each other's partial updates. The
//! connection sits behind a mutex, which also serializes writes to the file.
//!
//! A sibling `.lock` file holds an exclusive advisory lock for as long as the
//! store is open, so two processes of the same step cannot share a ledger.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{StateRecord, WorkStatus};

/// Version of the table layout below
pub const SCHEMA_VERSION: &str = "1";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS schema_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS work_units (
  work_id TEXT PRIMARY KEY,
  upstream_ref TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'pending',
  retry_count INTEGER NOT NULL DEFAULT 0,
  content_hash TEXT,
  last_error TEXT,
  last_error_at TEXT,
  skip_reason TEXT,
  last_processed_at TEXT,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_units_status ON work_units(status);

CREATE TABLE IF NOT EXISTS step_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#;

const RECORD_COLUMNS: &str = "work_id, upstream_ref, status, retry_count, content_hash, \
     last_error, last_error_at, skip_reason, last_processed_at, updated_at";

/// Errors from the state store
#[derive(Debug, Error)]
pub enum StateError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State store {0} is locked by another process")]
    Locked(PathBuf),

    #[error("State store schema version {found} is not supported (expected {expected})")]
    SchemaMismatch { found: String, expected: String },

    #[error("Corrupt state record {work_id}: {detail}")]
    Corrupt { work_id: String, detail: String },

    #[error("State store connection lock poisoned")]
    Poisoned,
}

/// SQLite-backed state store for one step
pub struct StateStore {
    conn: Mutex<Connection>,
    max_retry: u32,
    /// Held for the store's lifetime; dropping it releases the lock
    _lock: Option<File>,
}

impl StateStore {
    /// Open (or create) the ledger at `path`
    pub fn open(path: &Path, max_retry: u32) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        FileExt::try_lock_exclusive(&lock).map_err(|_| StateError::Locked(path.to_path_buf()))?;

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
            max_retry,
            _lock: Some(lock),
        };
        store.migrate()?;

        info!(path = %path.display(), max_retry, "Opened state store");
        Ok(store)
    }

    /// Ephemeral store for tests and dry experiments
    pub fn open_in_memory(max_retry: u32) -> Result<Self, StateError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            max_retry,
            _lock: None,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StateError> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )?;

        let found: String = conn.query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        if found != SCHEMA_VERSION {
            return Err(StateError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION.to_string(),
            });
        }

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }

    /// Current record of a unit, if it was ever seen
    pub fn get_status(&self, work_id: &str) -> Result<Option<StateRecord>, StateError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM work_units WHERE work_id = ?1"),
                params![work_id],
                RawRecord::from_row,
            )
            .optional()?;

        raw.map(RawRecord::into_record).transpose()
    }

    /// Create a `pending` record if the unit has none. Returns true if created.
    ///
    /// Existing records are left untouched, so a crash after registering but
    /// before recording an outcome never changes what the last run recorded.
    pub fn register(&self, work_id: &str, upstream_ref: &str) -> Result<bool, StateError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO work_units (work_id, upstream_ref, status, retry_count, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3)
             ON CONFLICT(work_id) DO NOTHING",
            params![work_id, upstream_ref, ts(Utc::now())],
        )?;
        Ok(inserted == 1)
    }

    /// Record a success. Calling twice with the same arguments yields the same row.
    pub fn mark_ok(
        &self,
        work_id: &str,
        processed_at: DateTime<Utc>,
        content_hash: &str,
    ) -> Result<(), StateError> {
        let conn = self.conn()?;
        let at = ts(processed_at);
        conn.execute(
            "INSERT INTO work_units
               (work_id, status, retry_count, content_hash, last_processed_at, updated_at)
             VALUES (?1, 'ok', 0, ?2, ?3, ?3)
             ON CONFLICT(work_id) DO UPDATE SET
               status = 'ok',
               retry_count = 0,
               content_hash = excluded.content_hash,
               last_error = NULL,
               last_error_at = NULL,
               skip_reason = NULL,
               last_processed_at = excluded.last_processed_at,
               updated_at = excluded.updated_at",
            params![work_id, content_hash, at],
        )?;
        debug!(work_id, "Marked ok");
        Ok(())
    }

    /// Record a failed attempt and return the resulting status.
    ///
    /// The retry count always increments. A transient failure stays
    /// `failed-transient` while the count is within `max_retry`; past that,
    /// or for a permanent failure, the unit becomes `failed-permanent`.
    pub fn mark_failed(
        &self,
        work_id: &str,
        content_hash: &str,
        error: &str,
        transient: bool,
    ) -> Result<WorkStatus, StateError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT retry_count FROM work_units WHERE work_id = ?1",
                params![work_id],
                |row| row.get(0),
            )
            .optional()?;
        let retry_count = previous.unwrap_or(0) + 1;

        let status = if transient && retry_count <= i64::from(self.max_retry) {
            WorkStatus::FailedTransient
        } else {
            WorkStatus::FailedPermanent
        };

        let now = ts(Utc::now());
        tx.execute(
            "INSERT INTO work_units
               (work_id, status, retry_count, content_hash, last_error, last_error_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(work_id) DO UPDATE SET
               status = excluded.status,
               retry_count = excluded.retry_count,
               content_hash = excluded.content_hash,
               last_error = excluded.last_error,
               last_error_at = excluded.last_error_at,
               skip_reason = NULL,
               updated_at = excluded.updated_at",
            params![work_id, status.as_str(), retry_count, content_hash, error, now],
        )?;
        tx.commit()?;

        if status == WorkStatus::FailedPermanent && transient {
            warn!(work_id, retry_count, max_retry = self.max_retry, "Retry budget exhausted");
        }
        Ok(status)
    }

    /// Record that the unit's source was absent. Not a failure: retry_count is kept.
    pub fn mark_skipped(&self, work_id: &str, reason: &str) -> Result<(), StateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO work_units (work_id, status, skip_reason, updated_at)
             VALUES (?1, 'skipped', ?2, ?3)
             ON CONFLICT(work_id) DO UPDATE SET
               status = 'skipped',
               skip_reason = excluded.skip_reason,
               updated_at = excluded.updated_at",
            params![work_id, reason, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Park a unit whose input is invalid. retry_count is kept.
    pub fn quarantine(
        &self,
        work_id: &str,
        content_hash: &str,
        reason: &str,
    ) -> Result<(), StateError> {
        let conn = self.conn()?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO work_units
               (work_id, status, content_hash, last_error, last_error_at, updated_at)
             VALUES (?1, 'quarantined', ?2, ?3, ?4, ?4)
             ON CONFLICT(work_id) DO UPDATE SET
               status = 'quarantined',
               content_hash = excluded.content_hash,
               last_error = excluded.last_error,
               last_error_at = excluded.last_error_at,
               skip_reason = NULL,
               updated_at = excluded.updated_at",
            params![work_id, content_hash, reason, now],
        )?;
        warn!(work_id, reason, "Quarantined");
        Ok(())
    }

    /// Decide whether a normal run must (re)process the unit.
    ///
    /// True for unseen, pending, failed-transient and skipped units, for any
    /// unit whose recorded hash differs from `content_hash`, and always when
    /// `force` is set.
    pub fn should_process(
        &self,
        work_id: &str,
        content_hash: &str,
        force: bool,
    ) -> Result<bool, StateError> {
        if force {
            return Ok(true);
        }

        let Some(record) = self.get_status(work_id)? else {
            return Ok(true);
        };

        if record.status.is_retryable() {
            return Ok(true);
        }

        Ok(record.content_hash.as_deref() != Some(content_hash))
    }

    /// Records in any of `statuses`, ordered by id
    pub fn list_by_status(
        &self,
        statuses: &[WorkStatus],
        limit: Option<usize>,
    ) -> Result<Vec<StateRecord>, StateError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM work_units WHERE status IN ({placeholders})
             ORDER BY work_id LIMIT {limit}"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(RawRecord::into_record).collect()
    }

    /// Number of records per status
    pub fn stats(&self) -> Result<BTreeMap<WorkStatus, usize>, StateError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM work_units GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = BTreeMap::new();
        for (status, count) in rows {
            let status = status.parse::<WorkStatus>().map_err(|detail| StateError::Corrupt {
                work_id: "*".to_string(),
                detail,
            })?;
            stats.insert(status, count as usize);
        }
        Ok(stats)
    }

    /// Delete the records of the given units. Operator action only.
    pub fn reset(&self, work_ids: &[String]) -> Result<usize, StateError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for work_id in work_ids {
            deleted += tx.execute("DELETE FROM work_units WHERE work_id = ?1", params![work_id])?;
        }
        tx.commit()?;

        info!(requested = work_ids.len(), deleted, "Reset work units");
        Ok(deleted)
    }

    /// Delete every record. Operator action only.
    pub fn reset_all(&self) -> Result<usize, StateError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM work_units", [])?;
        info!(deleted, "Reset all work units");
        Ok(deleted)
    }

    /// Read a step-level value such as an ingest watermark
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StateError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM step_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO step_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }
}

/// Row as stored, before parsing status and timestamps
struct RawRecord {
    work_id: String,
    upstream_ref: String,
    status: String,
    retry_count: i64,
    content_hash: Option<String>,
    last_error: Option<String>,
    last_error_at: Option<String>,
    skip_reason: Option<String>,
    last_processed_at: Option<String>,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            work_id: row.get(0)?,
            upstream_ref: row.get(1)?,
            status: row.get(2)?,
            retry_count: row.get(3)?,
            content_hash: row.get(4)?,
            last_error: row.get(5)?,
            last_error_at: row.get(6)?,
            skip_reason: row.get(7)?,
            last_processed_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<StateRecord, StateError> {
        let work_id = self.work_id;
        let corrupt = |detail: String| StateError::Corrupt {
            work_id: work_id.clone(),
            detail,
        };

        let status = self.status.parse::<WorkStatus>().map_err(&corrupt)?;
        let parse = |value: &str| parse_ts(value).map_err(&corrupt);

        Ok(StateRecord {
            upstream_ref: self.upstream_ref,
            status,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| corrupt(format!("negative retry_count {}", self.retry_count)))?,
            content_hash: self.content_hash,
            last_error: self.last_error,
            last_error_at: self.last_error_at.as_deref().map(parse).transpose()?,
            skip_reason: self.skip_reason,
            last_processed_at: self.last_processed_at.as_deref().map(parse).transpose()?,
            updated_at: parse(&self.updated_at)?,
            work_id,
        })
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {value:?}: {e}"))
}
