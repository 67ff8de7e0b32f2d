//! Fixture-backed recording source for demos and tests.
//!
//! Reads `calls.json` (array of calls) and `recordings.json` (object mapping
//! call guid to its recordings) from a directory. Downloads produce a small
//! fake OGG stream. Recording ids steer failure paths:
//! - containing `fail`: bytes that are not OGG
//! - containing `gone`: reported unavailable
//! - containing `flaky`: transient error

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CallTask, RecordingSource, RemoteRecording, SourceError};

/// Minimal bytes that pass the OGG header check
pub const FAKE_OGG: &[u8] = b"OggS\x00\x02\x00\x00\x00\x00\x00\x00\x00\x00vorbis-fixture";

pub struct FixtureSource {
    calls: Vec<CallTask>,
    recordings: HashMap<String, Vec<RemoteRecording>>,
}

impl FixtureSource {
    /// Load fixtures from `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let calls_path = dir.join("calls.json");
        let calls: Vec<CallTask> = serde_json::from_str(
            &std::fs::read_to_string(&calls_path)
                .with_context(|| format!("Failed to read {}", calls_path.display()))?,
        )
        .with_context(|| format!("Failed to parse {}", calls_path.display()))?;

        let recordings_path = dir.join("recordings.json");
        let recordings = if recordings_path.exists() {
            serde_json::from_str(
                &std::fs::read_to_string(&recordings_path)
                    .with_context(|| format!("Failed to read {}", recordings_path.display()))?,
            )
            .with_context(|| format!("Failed to parse {}", recordings_path.display()))?
        } else {
            HashMap::new()
        };

        Ok(Self { calls, recordings })
    }

    /// Build directly from values
    pub fn from_parts(
        calls: Vec<CallTask>,
        recordings: HashMap<String, Vec<RemoteRecording>>,
    ) -> Self {
        Self { calls, recordings }
    }
}

#[async_trait]
impl RecordingSource for FixtureSource {
    fn name(&self) -> &str {
        "fixtures"
    }

    async fn list_calls(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<CallTask>, SourceError> {
        let since_ms = since.map(|s| s.timestamp_millis());
        Ok(self
            .calls
            .iter()
            .filter(|call| since_ms.map_or(true, |ms| call.last_update_ms > ms))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn list_recordings(&self, call_guid: &str) -> Result<Vec<RemoteRecording>, SourceError> {
        Ok(self.recordings.get(call_guid).cloned().unwrap_or_default())
    }

    async fn download(&self, recording_id: &str, dest: &Path) -> Result<u64, SourceError> {
        let id = recording_id.to_lowercase();
        if id.contains("gone") {
            return Err(SourceError::Unavailable(recording_id.to_string()));
        }
        if id.contains("flaky") {
            return Err(SourceError::Transient(format!(
                "simulated connection reset for {recording_id}"
            )));
        }

        let bytes: &[u8] = if id.contains("fail") {
            b"INVALID_OGG_DATA"
        } else {
            FAKE_OGG
        };

        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| SourceError::Transient(format!("Failed to write {}: {e}", dest.display())))?;
        Ok(bytes.len() as u64)
    }
}
