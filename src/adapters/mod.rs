//! Interfaces to the systems the pipeline talks to.
//!
//! Steps never depend on a concrete backend: ingest gets a
//! [`RecordingSource`], transcribe gets a [`Transcriber`]. Both are picked
//! once at startup from configuration.

pub mod asr;
pub mod fixtures;
pub mod spinoco;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// Re-export the backends
pub use asr::{AsrBackend, CommandTranscriber, ImportTranscriber};
pub use fixtures::FixtureSource;
pub use spinoco::SpinocoClient;

/// A call as listed by the telephony API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTask {
    /// Upstream call guid
    pub id: String,

    /// Epoch milliseconds of the last change to the call
    #[serde(rename = "lastUpdate")]
    pub last_update_ms: i64,

    /// Everything else, kept for audit
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A recording of a call as listed by the telephony API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecording {
    pub id: String,

    /// Epoch milliseconds; recordings without one are not numbered
    #[serde(default)]
    pub date: Option<i64>,

    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,

    #[serde(default)]
    pub available: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Failures of a recording source, already classified for retry
#[derive(Debug, Error, PartialEq)]
pub enum SourceError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    /// The recording is gone or never existed upstream
    #[error("recording {0} is not available")]
    Unavailable(String),
}

/// Where calls and recordings come from
#[async_trait]
pub trait RecordingSource: Send + Sync {
    /// Human-readable source name
    fn name(&self) -> &str;

    /// Calls changed since `since`, oldest API page first
    async fn list_calls(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<CallTask>, SourceError>;

    /// Recordings of one call
    async fn list_recordings(&self, call_guid: &str) -> Result<Vec<RemoteRecording>, SourceError>;

    /// Write the recording's bytes to `dest`; returns the byte count
    async fn download(&self, recording_id: &str, dest: &Path) -> Result<u64, SourceError>;
}

/// Failures of a transcriber, already classified for retry
#[derive(Debug, Error, PartialEq)]
pub enum TranscribeError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    /// No transcript exists for the recording yet
    #[error("{0}")]
    NotFound(String),
}

/// Raw transcript JSON and where it came from
#[derive(Debug, Clone)]
pub struct RawTranscript {
    pub source: PathBuf,
    pub json: Value,
}

/// Turns one audio file into transcript JSON
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        audio: &Path,
        recording_id: &str,
    ) -> Result<RawTranscript, TranscribeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_task_keeps_unknown_fields() {
        let call: CallTask = serde_json::from_str(
            r#"{"id": "71da9579-7730", "lastUpdate": 1724305416000, "owner": "desk-4"}"#,
        )
        .unwrap();

        assert_eq!(call.last_update_ms, 1_724_305_416_000);
        assert_eq!(call.extra["owner"], "desk-4");

        let back = serde_json::to_value(&call).unwrap();
        assert_eq!(back["lastUpdate"], 1_724_305_416_000_i64);
        assert_eq!(back["owner"], "desk-4");
    }

    #[test]
    fn test_recording_optional_fields() {
        let rec: RemoteRecording = serde_json::from_str(r#"{"id": "r1"}"#).unwrap();
        assert_eq!(rec.date, None);
        assert_eq!(rec.available, None);
    }
}
