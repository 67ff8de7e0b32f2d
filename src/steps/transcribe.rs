//! Step 02: turn downloaded audio into normalized transcripts.
//!
//! Work units are the recordings listed by an ingest run. The transcriber
//! backend is injected; its JSON (whisper layout) is normalized into
//! recording-level documents and aggregated per call.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use crate::adapters::{TranscribeError, Transcriber};
use crate::config::{ResolvedConfig, TranscribeSettings};
use crate::core::fingerprint::{content_hash, hash_bytes};
use crate::core::manifest::{InputRef, Outputs};
use crate::core::run_dir::{read_jsonl, write_jsonl};
use crate::core::{AbortHandle, UnitAction};
use crate::domain::{Outcome, WorkUnit};

use super::ingest::{RecordingMeta, RECORDINGS_FILE};
use super::{upstream_file, StepContext, StepKind, StepOptions, StepOutputs, StepSummary};

pub const RECORDINGS_OUT: &str = "transcripts_recordings.jsonl";
pub const CALLS_OUT: &str = "transcripts_calls.jsonl";

/// One timed piece of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Set on call-level segments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
}

/// Which engine produced a transcript and how it was configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrInfo {
    pub provider: String,
    pub model: String,
    pub device: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetrics {
    pub seg_count: usize,
    pub avg_seg_len_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub audio_path: String,
    pub transcript_source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processing {
    pub asr_settings_hash: String,
    pub transcript_hash: String,
    pub processed_at_utc: String,
}

/// Recording-level transcript, one line of `transcripts_recordings.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingTranscript {
    pub call_id: String,
    pub recording_id: String,
    #[serde(default)]
    pub duration_s: Option<f64>,
    pub lang: String,
    pub asr: AsrInfo,
    pub segments: Vec<Segment>,
    pub text: String,
    pub metrics: RecordingMetrics,
    pub source: SourceInfo,
    pub processing: Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    pub recording_count: usize,
    pub total_segments: usize,
    pub avg_seg_len_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSource {
    pub recording_ids: Vec<String>,
    pub transcript_source: String,
}

/// Call-level transcript, one line of `transcripts_calls.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTranscript {
    pub call_id: String,
    pub duration_s: f64,
    pub lang: String,
    pub asr: AsrInfo,
    pub segments: Vec<Segment>,
    pub text: String,
    pub metrics: CallMetrics,
    pub source: CallSource,
    pub processing: Processing,
}

/// Separator line put in front of each recording's text in a call transcript
pub fn recording_separator(recording_id: &str) -> String {
    format!("[--- {recording_id} ---]")
}

/// Settings that determine a transcript, hashed into every unit fingerprint
fn settings_identity(settings: &TranscribeSettings) -> Value {
    json!({
        "provider": settings.provider,
        "model": settings.model,
        "language": settings.language,
        "device": settings.device,
    })
}

/// Normalize whisper JSON.
///
/// Accepts both the bare whisper layout (`text`, `segments`, `language` at
/// the top) and the wrapped one (`transcription` plus `metadata`).
pub fn normalize_recording(
    raw: &Value,
    meta: &RecordingMeta,
    audio_rel_path: &str,
    defaults: &TranscribeSettings,
    transcript_source: &str,
) -> Result<RecordingTranscript, String> {
    if !raw.is_object() {
        return Err("transcript JSON is not an object".to_string());
    }
    let transcription = raw.get("transcription").unwrap_or(raw);
    let metadata = raw.get("metadata").cloned().unwrap_or_else(|| json!({}));

    let segments: Vec<Segment> = transcription
        .get("segments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|seg| Segment {
                    start: seg.get("start").and_then(Value::as_f64).unwrap_or(0.0),
                    end: seg.get("end").and_then(Value::as_f64).unwrap_or(0.0),
                    text: seg
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                    recording_id: None,
                })
                .collect()
        })
        .unwrap_or_default();

    let mut text = transcription
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if text.is_empty() && !segments.is_empty() {
        text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
    }

    let str_field = |key: &str| metadata.get(key).and_then(Value::as_str).map(str::to_string);
    let lang = str_field("language")
        .or_else(|| raw.get("language").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| defaults.language.clone());
    let model = str_field("whisper_model").unwrap_or_else(|| defaults.model.clone());
    let device = str_field("device_used").unwrap_or_else(|| defaults.device.clone());

    let mut settings = Map::new();
    settings.insert("model".to_string(), model.clone().into());
    settings.insert("device".to_string(), device.clone().into());
    settings.insert("language".to_string(), lang.clone().into());
    for key in ["beam_size", "best_of", "temperature", "initial_prompt"] {
        if let Some(value) = metadata.get(key).filter(|v| !v.is_null()) {
            settings.insert(key.to_string(), value.clone());
        }
    }
    let asr_settings_hash = content_hash(&settings).map_err(|e| e.to_string())?;

    let seg_count = segments.len();
    let avg_seg_len_s = if seg_count > 0 {
        round2(segments.iter().map(|s| s.end - s.start).sum::<f64>() / seg_count as f64)
    } else {
        0.0
    };

    Ok(RecordingTranscript {
        call_id: meta.call_id.clone(),
        recording_id: meta.recording_id.clone(),
        duration_s: metadata
            .get("duration")
            .and_then(Value::as_f64)
            .or(meta.duration_s),
        lang,
        asr: AsrInfo {
            provider: defaults.provider.clone(),
            model,
            device,
            settings,
        },
        segments,
        processing: Processing {
            asr_settings_hash,
            transcript_hash: hash_bytes(text.as_bytes()),
            processed_at_utc: str_field("processed_at")
                .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        },
        text,
        metrics: RecordingMetrics {
            seg_count,
            avg_seg_len_s,
        },
        source: SourceInfo {
            audio_path: audio_rel_path.to_string(),
            transcript_source: transcript_source.to_string(),
        },
    })
}

/// Aggregate one call's recording transcripts, ordered by recording id.
///
/// Returns `None` for an empty slice.
pub fn aggregate_call(recordings: &[RecordingTranscript]) -> Option<CallTranscript> {
    let mut sorted: Vec<&RecordingTranscript> = recordings.iter().collect();
    sorted.sort_by(|a, b| a.recording_id.cmp(&b.recording_id));
    let first = *sorted.first()?;

    let segments: Vec<Segment> = sorted
        .iter()
        .flat_map(|rec| {
            rec.segments.iter().map(|seg| Segment {
                recording_id: Some(rec.recording_id.clone()),
                ..seg.clone()
            })
        })
        .collect();

    let text = sorted
        .iter()
        .filter(|rec| !rec.text.trim().is_empty())
        .map(|rec| format!("{}\n\n{}", recording_separator(&rec.recording_id), rec.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let total_segments = segments.len();
    let avg_seg_len_s = if total_segments > 0 {
        round2(segments.iter().map(|s| s.end - s.start).sum::<f64>() / total_segments as f64)
    } else {
        0.0
    };

    Some(CallTranscript {
        call_id: first.call_id.clone(),
        duration_s: sorted.iter().filter_map(|r| r.duration_s).sum(),
        lang: first.lang.clone(),
        asr: first.asr.clone(),
        metrics: CallMetrics {
            recording_count: sorted.len(),
            total_segments,
            avg_seg_len_s,
        },
        source: CallSource {
            recording_ids: sorted.iter().map(|r| r.recording_id.clone()).collect(),
            transcript_source: "aggregated".to_string(),
        },
        processing: Processing {
            asr_settings_hash: first.processing.asr_settings_hash.clone(),
            transcript_hash: hash_bytes(text.as_bytes()),
            processed_at_utc: first.processing.processed_at_utc.clone(),
        },
        segments,
        text,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// What the transcribe action needs per recording
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub meta: RecordingMeta,
    pub audio: PathBuf,
}

pub struct TranscribeAction {
    transcriber: Arc<dyn Transcriber>,
    settings: TranscribeSettings,
}

impl TranscribeAction {
    pub fn new(transcriber: Arc<dyn Transcriber>, settings: TranscribeSettings) -> Self {
        Self {
            transcriber,
            settings,
        }
    }
}

#[async_trait]
impl UnitAction for TranscribeAction {
    type Payload = AudioInput;
    type Output = RecordingTranscript;

    async fn process(&self, unit: &WorkUnit<AudioInput>) -> Outcome<RecordingTranscript> {
        let input = &unit.payload;
        if !input.audio.is_file() {
            return Outcome::Skip(format!("no audio at {}", input.audio.display()));
        }

        let raw = match self
            .transcriber
            .transcribe(&input.audio, &input.meta.recording_id)
            .await
        {
            Ok(raw) => raw,
            Err(TranscribeError::Transient(msg)) => return Outcome::Transient(msg),
            Err(TranscribeError::Permanent(msg)) => return Outcome::Permanent(msg),
            Err(TranscribeError::NotFound(msg)) => return Outcome::Skip(msg),
        };
        debug!(recording_id = %input.meta.recording_id, source = %raw.source.display(), "Transcript obtained");

        match normalize_recording(
            &raw.json,
            &input.meta,
            &input.meta.audio_rel_path(),
            &self.settings,
            self.transcriber.name(),
        ) {
            Ok(transcript) => Outcome::Ok(transcript),
            Err(msg) => Outcome::Permanent(format!("Unusable transcript JSON: {msg}")),
        }
    }
}

/// Run the transcribe step over an ingest run
#[instrument(skip_all, fields(transcriber = transcriber.name()))]
pub async fn run(
    config: ResolvedConfig,
    options: StepOptions,
    transcriber: Arc<dyn Transcriber>,
    abort: AbortHandle,
) -> Result<StepSummary> {
    let mut ctx = StepContext::begin(StepKind::Transcribe, config, options, abort)?;

    match execute(&mut ctx, transcriber).await {
        Ok((report, outputs)) => ctx.finish(&report, outputs),
        Err(e) => ctx.fail(&e),
    }
}

async fn execute(
    ctx: &mut StepContext,
    transcriber: Arc<dyn Transcriber>,
) -> Result<(crate::core::RunReport<RecordingTranscript>, StepOutputs)> {
    let (upstream_dir, upstream) = ctx.load_upstream()?;
    let store = ctx.open_store(ctx.config.transcribe.max_retry)?;

    let recordings_path = upstream_file(&upstream_dir, &upstream, RECORDINGS_FILE)?;
    let recordings: Vec<RecordingMeta> = read_jsonl(&recordings_path)?;
    let audio_root = upstream_dir.data_dir();

    let settings = ctx.config.transcribe.clone();
    let identity = settings_identity(&settings);
    let units = recordings
        .into_iter()
        .map(|meta| {
            let hash = content_hash(&json!({
                "settings": identity,
                "recording_id": meta.recording_id,
                "spinoco_recording_id": meta.spinoco_recording_id,
                "recording_date_ms": meta.recording_date_ms,
            }))?;
            let audio = audio_root.join(meta.audio_rel_path());
            Ok(WorkUnit::new(
                meta.recording_id.clone(),
                audio.display().to_string(),
                hash,
                AudioInput { meta, audio },
            ))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()
        .context("Failed to fingerprint recordings")?;
    info!(recordings = units.len(), input = %recordings_path.display(), "Work list loaded");

    let action = Arc::new(TranscribeAction::new(transcriber, settings));
    let report = ctx.runner(store).run(units, action).await?;

    let transcripts: Vec<&RecordingTranscript> = report.completed.iter().map(|(_, t)| t).collect();
    let mut by_call: BTreeMap<&str, Vec<RecordingTranscript>> = BTreeMap::new();
    for t in &transcripts {
        by_call.entry(t.call_id.as_str()).or_default().push((*t).clone());
    }
    let calls: Vec<CallTranscript> = by_call.values().filter_map(|recs| aggregate_call(recs)).collect();

    let data_dir = ctx.run_dir.data_dir();
    write_jsonl(&data_dir.join(RECORDINGS_OUT), transcripts.iter().copied())?;
    write_jsonl(&data_dir.join(CALLS_OUT), &calls)?;

    let segments: usize = transcripts.iter().map(|t| t.metrics.seg_count).sum();
    let languages: BTreeSet<&str> = transcripts.iter().map(|t| t.lang.as_str()).collect();
    let mut metrics = Map::new();
    metrics.insert("recordings_transcribed".to_string(), transcripts.len().into());
    metrics.insert("calls_aggregated".to_string(), calls.len().into());
    metrics.insert("segments_total".to_string(), segments.into());
    metrics.insert(
        "languages".to_string(),
        languages.into_iter().collect::<Vec<_>>().into(),
    );

    let mut aux = BTreeMap::new();
    aux.insert("calls".to_string(), format!("data/{CALLS_OUT}"));

    Ok((
        report,
        StepOutputs {
            outputs: Outputs {
                primary: format!("data/{RECORDINGS_OUT}"),
                aux,
            },
            input_refs: vec![InputRef::new("file", recordings_path.display().to_string())],
            metrics,
            notes: Vec::new(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(recording_id: &str) -> RecordingMeta {
        RecordingMeta {
            spinoco_recording_id: format!("spin-{recording_id}"),
            spinoco_call_guid: "71da9579-7730".to_string(),
            recording_id: recording_id.to_string(),
            call_id: "20240822_054336_71da9579".to_string(),
            recording_date_ms: 1_724_305_416_000,
            recording_ts_utc: "2024-08-22T05:43:36Z".to_string(),
            duration_s: Some(30.0),
            available: Some(true),
        }
    }

    fn whisper_json(text: &str) -> Value {
        json!({
            "transcription": {
                "text": format!("  {text} "),
                "segments": [
                    {"start": 0.0, "end": 2.0, "text": " Dobrý den "},
                    {"start": 2.0, "end": 5.0, "text": "volám kvůli faktuře"}
                ]
            },
            "metadata": {
                "whisper_model": "large-v3",
                "device_used": "cuda",
                "language": "cs",
                "beam_size": 5,
                "temperature": null,
                "duration": 5.0,
                "processed_at": "2024-08-23T10:00:00Z"
            }
        })
    }

    #[test]
    fn test_normalize_wrapped_layout() {
        let settings = TranscribeSettings::default();
        let m = meta("20240822_054336_71da9579_p01");
        let t = normalize_recording(
            &whisper_json("Dobrý den volám kvůli faktuře"),
            &m,
            &m.audio_rel_path(),
            &settings,
            "import",
        )
        .unwrap();

        assert_eq!(t.text, "Dobrý den volám kvůli faktuře");
        assert_eq!(t.segments[0].text, "Dobrý den");
        assert_eq!(t.metrics.seg_count, 2);
        assert_eq!(t.metrics.avg_seg_len_s, 2.5);
        assert_eq!(t.asr.device, "cuda");
        assert_eq!(t.asr.settings["beam_size"], 5);
        assert!(!t.asr.settings.contains_key("temperature"));
        assert_eq!(t.duration_s, Some(5.0));
        assert_eq!(t.processing.processed_at_utc, "2024-08-23T10:00:00Z");
        assert_eq!(t.source.audio_path, "audio/20240822_054336_71da9579_p01.ogg");
        assert_eq!(t.processing.transcript_hash.len(), 64);
    }

    #[test]
    fn test_normalize_bare_layout_falls_back_to_segments() {
        let settings = TranscribeSettings::default();
        let raw = json!({
            "language": "en",
            "segments": [{"start": 0.0, "end": 1.0, "text": "hello"}, {"start": 1.0, "end": 2.0, "text": "there"}]
        });
        let t = normalize_recording(&raw, &meta("r_p01"), "audio/r_p01.ogg", &settings, "command")
            .unwrap();
        assert_eq!(t.text, "hello there");
        assert_eq!(t.lang, "en");
        assert_eq!(t.asr.model, "large-v3");
        assert_eq!(t.duration_s, Some(30.0));
    }

    #[test]
    fn test_normalize_rejects_non_object() {
        let settings = TranscribeSettings::default();
        assert!(normalize_recording(&json!([1, 2]), &meta("r"), "a", &settings, "x").is_err());
    }

    #[test]
    fn test_aggregate_orders_by_recording_id() {
        let settings = TranscribeSettings::default();
        let p2 = normalize_recording(
            &whisper_json("druhá"),
            &meta("20240822_054336_71da9579_p02"),
            "a",
            &settings,
            "import",
        )
        .unwrap();
        let p1 = normalize_recording(
            &whisper_json("první"),
            &meta("20240822_054336_71da9579_p01"),
            "a",
            &settings,
            "import",
        )
        .unwrap();

        let call = aggregate_call(&[p2, p1]).unwrap();
        assert_eq!(
            call.text,
            "[--- 20240822_054336_71da9579_p01 ---]\n\nprvní\n\n[--- 20240822_054336_71da9579_p02 ---]\n\ndruhá"
        );
        assert_eq!(call.metrics.recording_count, 2);
        assert_eq!(call.metrics.total_segments, 4);
        assert_eq!(call.duration_s, 10.0);
        assert_eq!(
            call.segments[0].recording_id.as_deref(),
            Some("20240822_054336_71da9579_p01")
        );
        assert!(aggregate_call(&[]).is_none());
    }
}
