//! Step 01: list calls and recordings from Spinoco and download the audio.
//!
//! Each run snapshots everything the source lists into
//! `metadata_calls.jsonl` and `metadata_recordings.jsonl`, then downloads
//! the recordings the ledger says still need it into `data/audio/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{CallTask, RecordingSource, RemoteRecording, SourceError};
use crate::config::ResolvedConfig;
use crate::core::fingerprint::content_hash;
use crate::core::manifest::{InputRef, Outputs};
use crate::core::run_dir::write_jsonl;
use crate::core::{AbortHandle, RunReport, UnitAction};
use crate::domain::ids::{self, IdError, RecordingKey};
use crate::domain::{Outcome, RunMode, RunStatus, WorkUnit};

use super::{StepContext, StepKind, StepOptions, StepOutputs, StepSummary};

pub const CALLS_FILE: &str = "metadata_calls.jsonl";
pub const RECORDINGS_FILE: &str = "metadata_recordings.jsonl";
pub const AUDIO_DIR: &str = "audio";

/// Ledger meta key holding the newest call `lastUpdate` (epoch ms) seen by a
/// successful run
pub const WATERMARK_KEY: &str = "last_call_update_ms";

const OGG_MAGIC: &[u8; 4] = b"OggS";

/// One call as written to `metadata_calls.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMeta {
    pub call_id: String,
    pub spinoco_call_guid: String,
    pub last_update_ms: i64,
    pub call_ts_utc: String,
    pub recording_count: usize,
    /// Upstream object, kept for audit
    pub raw: CallTask,
}

/// One recording as written to `metadata_recordings.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub spinoco_recording_id: String,
    pub spinoco_call_guid: String,
    pub recording_id: String,
    pub call_id: String,
    pub recording_date_ms: i64,
    pub recording_ts_utc: String,
    #[serde(default)]
    pub duration_s: Option<f64>,
    #[serde(default)]
    pub available: Option<bool>,
}

impl RecordingMeta {
    /// Audio path relative to the run's data directory
    pub fn audio_rel_path(&self) -> String {
        format!("{}/{}.ogg", AUDIO_DIR, self.recording_id)
    }
}

/// Epoch milliseconds as `YYYY-MM-DDTHH:MM:SSZ`
pub fn utc_iso_from_ms(ms: i64) -> Result<String, IdError> {
    if ms < 0 {
        return Err(IdError::InvalidTimestamp(ms));
    }
    let ts = DateTime::<Utc>::from_timestamp_millis(ms).ok_or(IdError::InvalidTimestamp(ms))?;
    Ok(ts.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// Parse `--since`: RFC 3339 or a plain `YYYY-MM-DD` (midnight UTC)
pub fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid timestamp {value:?}, expected RFC 3339 or YYYY-MM-DD"))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Normalize a call and its recordings. Recordings without a date are dropped.
pub fn normalize_call(
    call: &CallTask,
    recordings: &[RemoteRecording],
) -> Result<(CallMeta, Vec<RecordingMeta>), IdError> {
    let call_id = ids::call_id(call.last_update_ms, &call.id)?;

    let keys: Vec<RecordingKey<'_>> = recordings
        .iter()
        .map(|r| RecordingKey {
            upstream_id: &r.id,
            date_ms: r.date,
        })
        .collect();
    let by_id: HashMap<&str, &RemoteRecording> =
        recordings.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut metas = Vec::new();
    for (upstream_id, recording_id) in ids::make_recording_ids(&call_id, &keys) {
        let Some(remote) = by_id.get(upstream_id.as_str()) else {
            continue;
        };
        let Some(date_ms) = remote.date else {
            continue;
        };
        metas.push(RecordingMeta {
            spinoco_recording_id: upstream_id,
            spinoco_call_guid: call.id.clone(),
            recording_id,
            call_id: call_id.clone(),
            recording_date_ms: date_ms,
            recording_ts_utc: utc_iso_from_ms(date_ms)?,
            duration_s: remote.duration,
            available: remote.available,
        });
    }

    let meta = CallMeta {
        call_ts_utc: utc_iso_from_ms(call.last_update_ms)?,
        call_id,
        spinoco_call_guid: call.id.clone(),
        last_update_ms: call.last_update_ms,
        recording_count: metas.len(),
        raw: call.clone(),
    };

    Ok((meta, metas))
}

/// Result of one download
#[derive(Debug, Clone)]
pub struct DownloadedAudio {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Downloads one recording into the audio directory
pub struct DownloadAction {
    source: Arc<dyn RecordingSource>,
    audio_dir: PathBuf,
}

impl DownloadAction {
    pub fn new(source: Arc<dyn RecordingSource>, audio_dir: PathBuf) -> Self {
        Self { source, audio_dir }
    }
}

#[async_trait]
impl UnitAction for DownloadAction {
    type Payload = RecordingMeta;
    type Output = DownloadedAudio;

    async fn process(&self, unit: &WorkUnit<RecordingMeta>) -> Outcome<DownloadedAudio> {
        let meta = &unit.payload;
        if meta.available == Some(false) {
            return Outcome::Skip("recording marked unavailable upstream".to_string());
        }

        let final_path = self.audio_dir.join(format!("{}.ogg", meta.recording_id));
        let part_path = self.audio_dir.join(format!("{}.ogg.part", meta.recording_id));

        let bytes = match self.source.download(&meta.spinoco_recording_id, &part_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_quietly(&part_path).await;
                return match e {
                    SourceError::Unavailable(_) => Outcome::Skip(e.to_string()),
                    SourceError::Transient(msg) => Outcome::Transient(msg),
                    SourceError::Permanent(msg) => Outcome::Permanent(msg),
                };
            }
        };

        match has_ogg_header(&part_path).await {
            Ok(true) => {}
            Ok(false) => {
                remove_quietly(&part_path).await;
                return Outcome::Quarantine(format!(
                    "downloaded file for {} is not OGG audio",
                    meta.recording_id
                ));
            }
            Err(e) => {
                remove_quietly(&part_path).await;
                return Outcome::Transient(format!("Failed to read {}: {}", part_path.display(), e));
            }
        }

        if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
            remove_quietly(&part_path).await;
            return Outcome::Transient(format!(
                "Failed to move audio into place at {}: {}",
                final_path.display(),
                e
            ));
        }

        debug!(recording_id = %meta.recording_id, bytes, "Downloaded");
        Outcome::Ok(DownloadedAudio {
            path: final_path,
            bytes,
        })
    }
}

async fn has_ogg_header(path: &Path) -> std::io::Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(&magic == OGG_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

/// Run the ingest step against `source`
#[instrument(skip_all, fields(source = source.name()))]
pub async fn run(
    config: ResolvedConfig,
    options: StepOptions,
    source: Arc<dyn RecordingSource>,
    abort: AbortHandle,
) -> Result<StepSummary> {
    let mut ctx = StepContext::begin(StepKind::Ingest, config, options, abort)?;

    match execute(&mut ctx, source).await {
        Ok(done) => {
            let dry = ctx.options.mode.is_dry();
            let store = done.store;
            let summary = ctx.finish(&done.report, done.outputs)?;

            if summary.status == RunStatus::Success && !dry {
                if let Some(watermark) = done.watermark_ms {
                    store
                        .set_meta(WATERMARK_KEY, &watermark.to_string())
                        .context("Failed to store ingest watermark")?;
                    info!(watermark, "Watermark advanced");
                }
            }
            Ok(summary)
        }
        Err(e) => ctx.fail(&e),
    }
}

struct Executed {
    report: RunReport<DownloadedAudio>,
    outputs: StepOutputs,
    store: Arc<crate::core::StateStore>,
    watermark_ms: Option<i64>,
}

async fn execute(ctx: &mut StepContext, source: Arc<dyn RecordingSource>) -> Result<Executed> {
    let store = ctx.open_store(ctx.config.ingest.max_retry)?;
    let since = resolve_since(ctx, &store)?;
    info!(since = ?since.map(|s| s.to_rfc3339()), "Listing calls");

    let calls = source
        .list_calls(since, None)
        .await
        .context("Failed to list calls")?;

    let mut call_metas = Vec::new();
    let mut recording_metas = Vec::new();
    let mut notes = Vec::new();
    for call in &calls {
        let recordings = source
            .list_recordings(&call.id)
            .await
            .with_context(|| format!("Failed to list recordings of call {}", call.id))?;

        match normalize_call(call, &recordings) {
            Ok((meta, metas)) => {
                let dropped = recordings.len() - metas.len();
                if dropped > 0 {
                    debug!(call_id = %meta.call_id, dropped, "Recordings without a date dropped");
                }
                call_metas.push(meta);
                recording_metas.extend(metas);
            }
            Err(e) => {
                warn!(call_guid = %call.id, error = %e, "Skipping call with unusable identity");
                notes.push(format!("call {} skipped: {}", call.id, e));
            }
        }
        ctx.progress.report(
            "list",
            call_metas.len(),
            calls.len(),
            format!("{} calls listed", call_metas.len()),
        );
    }

    let data_dir = ctx.run_dir.data_dir();
    write_jsonl(&data_dir.join(CALLS_FILE), &call_metas)?;
    write_jsonl(&data_dir.join(RECORDINGS_FILE), &recording_metas)?;

    let audio_dir = data_dir.join(AUDIO_DIR);
    tokio::fs::create_dir_all(&audio_dir)
        .await
        .with_context(|| format!("Failed to create {}", audio_dir.display()))?;

    let units = recording_metas
        .iter()
        .map(|meta| {
            let hash = content_hash(&json!({
                "spinoco_recording_id": meta.spinoco_recording_id,
                "spinoco_call_guid": meta.spinoco_call_guid,
                "recording_date_ms": meta.recording_date_ms,
            }))?;
            Ok(WorkUnit::new(
                meta.recording_id.clone(),
                meta.spinoco_recording_id.clone(),
                hash,
                meta.clone(),
            ))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()
        .context("Failed to fingerprint recordings")?;

    let action = Arc::new(DownloadAction::new(source, audio_dir));
    let report = ctx.runner(Arc::clone(&store)).run(units, action).await?;

    let bytes: u64 = report.completed.iter().map(|(_, a)| a.bytes).sum();
    let mut metrics = Map::new();
    metrics.insert("calls_listed".to_string(), call_metas.len().into());
    metrics.insert("recordings_listed".to_string(), recording_metas.len().into());
    metrics.insert("bytes_downloaded".to_string(), bytes.into());

    let mut aux = std::collections::BTreeMap::new();
    aux.insert("calls".to_string(), format!("data/{CALLS_FILE}"));
    aux.insert("audio_dir".to_string(), format!("data/{AUDIO_DIR}"));

    let mut input_refs = vec![InputRef::new("source", source_name(&ctx.config))];
    if let Some(since) = since {
        input_refs.push(InputRef::new("since", since.to_rfc3339()));
    }

    Ok(Executed {
        report,
        outputs: StepOutputs {
            outputs: Outputs {
                primary: format!("data/{RECORDINGS_FILE}"),
                aux,
            },
            input_refs,
            metrics,
            notes,
        },
        store,
        watermark_ms: calls.iter().map(|c| c.last_update_ms).max(),
    })
}

/// `--since` wins; backfill falls back to the configured start, incremental
/// and dry runs to the stored watermark
fn resolve_since(
    ctx: &StepContext,
    store: &crate::core::StateStore,
) -> Result<Option<DateTime<Utc>>> {
    if let Some(since) = ctx.options.since {
        return Ok(Some(since));
    }

    match ctx.options.mode {
        RunMode::Backfill => ctx.config.ingest.since.as_deref().map(parse_since).transpose(),
        RunMode::Incr | RunMode::Dry => {
            let Some(raw) = store.get_meta(WATERMARK_KEY)? else {
                return Ok(None);
            };
            let ms: i64 = raw
                .parse()
                .with_context(|| format!("Corrupt ingest watermark {raw:?}"))?;
            Ok(DateTime::<Utc>::from_timestamp_millis(ms))
        }
    }
}

fn source_name(config: &ResolvedConfig) -> String {
    match &config.ingest.fixtures_dir {
        Some(dir) => format!("fixtures:{}", dir.display()),
        None => config.ingest.api_base_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FixtureSource;
    use crate::core::StateStore;
    use serde_json::Map as JsonMap;
    use tempfile::TempDir;

    fn call(guid: &str, ms: i64) -> CallTask {
        CallTask {
            id: guid.to_string(),
            last_update_ms: ms,
            extra: JsonMap::new(),
        }
    }

    fn recording(id: &str, date: Option<i64>) -> RemoteRecording {
        RemoteRecording {
            id: id.to_string(),
            date,
            duration: Some(12.5),
            available: Some(true),
            extra: JsonMap::new(),
        }
    }

    #[test]
    fn test_utc_iso_from_ms() {
        assert_eq!(utc_iso_from_ms(1_724_305_416_000).unwrap(), "2024-08-22T05:43:36Z");
        assert!(utc_iso_from_ms(-1).is_err());
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(
            parse_since("2024-08-22").unwrap().to_rfc3339(),
            "2024-08-22T00:00:00+00:00"
        );
        assert_eq!(
            parse_since("2024-08-22T07:43:36+02:00").unwrap().timestamp_millis(),
            1_724_305_416_000
        );
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn test_normalize_call_numbers_by_date() {
        let c = call("71da9579-7730-11ee-9300-a3a8e273fd52", 1_724_305_416_000);
        let recs = vec![
            recording("rec-b", Some(1_724_305_500_000)),
            recording("rec-a", Some(1_724_305_420_000)),
            recording("rec-undated", None),
        ];

        let (meta, metas) = normalize_call(&c, &recs).unwrap();
        assert_eq!(meta.call_id, "20240822_054336_71da9579");
        assert_eq!(meta.call_ts_utc, "2024-08-22T05:43:36Z");
        assert_eq!(meta.recording_count, 2);

        assert_eq!(metas[0].spinoco_recording_id, "rec-a");
        assert_eq!(metas[0].recording_id, "20240822_054336_71da9579_p01");
        assert_eq!(metas[1].spinoco_recording_id, "rec-b");
        assert_eq!(metas[1].recording_id, "20240822_054336_71da9579_p02");
        assert_eq!(metas[1].audio_rel_path(), "audio/20240822_054336_71da9579_p02.ogg");
    }

    #[test]
    fn test_normalize_rejects_short_guid() {
        assert!(normalize_call(&call("abc", 1_724_305_416_000), &[]).is_err());
    }

    fn fixture_source() -> Arc<dyn RecordingSource> {
        let mut recordings = HashMap::new();
        recordings.insert(
            "aaaaaaaa-0001".to_string(),
            vec![
                recording("rec-ok", Some(1_724_305_420_000)),
                recording("rec-fail", Some(1_724_305_430_000)),
                recording("rec-gone", Some(1_724_305_440_000)),
            ],
        );
        Arc::new(FixtureSource::from_parts(
            vec![call("aaaaaaaa-0001", 1_724_305_416_000)],
            recordings,
        ))
    }

    #[tokio::test]
    async fn test_ingest_run_outcomes() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::with_home(temp.path());

        let summary = run(
            config.clone(),
            StepOptions::default(),
            fixture_source(),
            AbortHandle::default(),
        )
        .await
        .unwrap();

        // ok + quarantined + skipped: one failure out of three
        assert_eq!(summary.counts.total, 3);
        assert_eq!(summary.counts.ok, 1);
        assert_eq!(summary.counts.quarantined, 1);
        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(summary.status, RunStatus::Partial);

        let audio = summary.run_dir.join("data").join(AUDIO_DIR);
        assert!(audio.join("20240822_054336_aaaaaaaa_p01.ogg").exists());
        assert!(!audio.join("20240822_054336_aaaaaaaa_p02.ogg").exists());
        assert!(!audio.join("20240822_054336_aaaaaaaa_p02.ogg.part").exists());

        // Partial run does not advance the watermark
        let store = StateStore::open(&config.state_path(StepKind::Ingest.step_id()), 3).unwrap();
        assert_eq!(store.get_meta(WATERMARK_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_successful_ingest_advances_watermark() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::with_home(temp.path());
        let mut recordings = HashMap::new();
        recordings.insert(
            "bbbbbbbb-0002".to_string(),
            vec![recording("rec-1", Some(1_724_305_420_000))],
        );
        let source: Arc<dyn RecordingSource> = Arc::new(FixtureSource::from_parts(
            vec![call("bbbbbbbb-0002", 1_724_305_416_000)],
            recordings,
        ));

        let summary = run(
            config.clone(),
            StepOptions::default(),
            Arc::clone(&source),
            AbortHandle::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert!(summary.run_dir.join("success.ok").exists());

        {
            let store =
                StateStore::open(&config.state_path(StepKind::Ingest.step_id()), 3).unwrap();
            assert_eq!(
                store.get_meta(WATERMARK_KEY).unwrap().as_deref(),
                Some("1724305416000")
            );
        }

        // Incremental rerun lists nothing newer than the watermark
        let again = run(config, StepOptions::default(), source, AbortHandle::default())
            .await
            .unwrap();
        assert_eq!(again.counts.total, 0);
        assert_eq!(again.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_guid_with_path_characters_is_not_ingested() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::with_home(temp.path().join("home"));
        let mut recordings = HashMap::new();
        recordings.insert(
            "../../etcxx".to_string(),
            vec![recording("rec-evil", Some(1_724_305_420_000))],
        );
        recordings.insert(
            "cccccccc-0003".to_string(),
            vec![recording("rec-1", Some(1_724_305_420_000))],
        );
        let source: Arc<dyn RecordingSource> = Arc::new(FixtureSource::from_parts(
            vec![
                call("../../etcxx", 1_724_305_416_000),
                call("cccccccc-0003", 1_724_305_416_000),
            ],
            recordings,
        ));

        let summary = run(config, StepOptions::default(), source, AbortHandle::default())
            .await
            .unwrap();

        assert_eq!(summary.counts.total, 1);
        assert_eq!(summary.counts.ok, 1);

        let manifest: crate::core::manifest::Manifest =
            crate::core::run_dir::read_json(&summary.run_dir.join("manifest.json")).unwrap();
        assert_eq!(manifest.notes.len(), 1);
        assert!(manifest.notes[0].contains("../../etcxx"));

        let audio: Vec<_> = std::fs::read_dir(summary.run_dir.join("data").join(AUDIO_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(audio, vec!["20240822_054336_cccccccc_p01.ogg"]);
        assert!(!summary.run_dir.join("data").join("etc").exists());
    }
}
