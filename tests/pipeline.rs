//! Pipeline Integration Tests
//!
//! Ingest from fixtures, transcribe from imported whisper JSON, anonymize,
//! and check what each run leaves on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use callpipe::adapters::{AsrBackend, FixtureSource, RecordingSource, Transcriber};
use callpipe::config::{ResolvedConfig, TranscribeMode};
use callpipe::core::manifest::{ErrorFile, Manifest};
use callpipe::core::run_dir::{read_json, read_jsonl};
use callpipe::core::AbortHandle;
use callpipe::domain::RunStatus;
use callpipe::steps::{anonymize, ingest, transcribe, StepKind, StepOptions, StepSummary};
use serde_json::{json, Value};
use tempfile::TempDir;

const CALL_A: &str = "20240822_054336_71da9579";
const CALL_B: &str = "20240822_064336_c0ffee00";

struct Harness {
    _temp: TempDir,
    config: ResolvedConfig,
    fixtures: PathBuf,
    transcripts: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let fixtures = temp.path().join("fixtures");
        let transcripts = temp.path().join("whisper");
        std::fs::create_dir_all(&fixtures).unwrap();
        std::fs::create_dir_all(&transcripts).unwrap();

        let mut config = ResolvedConfig::with_home(temp.path().join("home"));
        config.transcribe.mode = TranscribeMode::Import;
        config.transcribe.import_base_path = Some(transcripts.clone());

        Self {
            _temp: temp,
            config,
            fixtures,
            transcripts,
        }
    }

    fn write_fixtures(&self, calls: Value, recordings: Value) {
        std::fs::write(self.fixtures.join("calls.json"), calls.to_string()).unwrap();
        std::fs::write(self.fixtures.join("recordings.json"), recordings.to_string()).unwrap();
    }

    fn write_transcript(&self, recording_id: &str, body: &str) {
        std::fs::write(self.transcripts.join(format!("{recording_id}.json")), body).unwrap();
    }

    async fn ingest(&self) -> StepSummary {
        let source: Arc<dyn RecordingSource> =
            Arc::new(FixtureSource::load(&self.fixtures).unwrap());
        ingest::run(
            self.config.clone(),
            StepOptions::default(),
            source,
            AbortHandle::default(),
        )
        .await
        .unwrap()
    }

    async fn transcribe(&self, options: StepOptions) -> StepSummary {
        let backend: Arc<dyn Transcriber> =
            Arc::new(AsrBackend::from_settings(&self.config.transcribe).unwrap());
        transcribe::run(self.config.clone(), options, backend, AbortHandle::default())
            .await
            .unwrap()
    }

    async fn anonymize(&self, input_run: &str) -> StepSummary {
        anonymize::run(self.config.clone(), input_of(input_run), AbortHandle::default())
            .await
            .unwrap()
    }
}

fn input_of(run_id: &str) -> StepOptions {
    StepOptions {
        input_run: Some(run_id.to_string()),
        ..StepOptions::default()
    }
}

fn whisper(text: &str) -> String {
    json!({
        "transcription": {
            "text": text,
            "segments": [{"start": 0.0, "end": 4.0, "text": text}]
        },
        "metadata": {"whisper_model": "large-v3", "device_used": "cpu", "language": "cs", "duration": 4.0}
    })
    .to_string()
}

fn manifest(summary: &StepSummary) -> Manifest {
    read_json(&summary.run_dir.join("manifest.json")).unwrap()
}

fn data(summary: &StepSummary, file: &str) -> Vec<Value> {
    read_jsonl(&summary.run_dir.join("data").join(file)).unwrap()
}

fn two_call_fixtures(h: &Harness) {
    h.write_fixtures(
        json!([
            {"id": "71da9579-7730-11ee-9300-a3a8e273fd52", "lastUpdate": 1724305416000_i64},
            {"id": "c0ffee00-1111-2222-3333-444455556666", "lastUpdate": 1724309016000_i64}
        ]),
        json!({
            "71da9579-7730-11ee-9300-a3a8e273fd52": [
                {"id": "rec-a2", "date": 1724305500000_i64, "duration": 40.0, "available": true},
                {"id": "rec-a1", "date": 1724305420000_i64, "duration": 20.0, "available": true}
            ],
            "c0ffee00-1111-2222-3333-444455556666": [
                {"id": "rec-b1", "date": 1724309020000_i64, "duration": 30.0, "available": true}
            ]
        }),
    );
    h.write_transcript(&format!("{CALL_A}_p01"), &whisper("Dobrý den, volám z čísla 777 123 456."));
    h.write_transcript(
        &format!("{CALL_A}_p02"),
        &whisper("Můj email je jana.novakova@example.cz a číslo 777 123 456."),
    );
    h.write_transcript(&format!("{CALL_B}_p01"), &whisper("Účet CZ6508000000192000145399 prosím."));
}

#[tokio::test]
async fn test_end_to_end_pipeline() {
    let h = Harness::new();
    two_call_fixtures(&h);

    // Ingest
    let ingested = h.ingest().await;
    assert_eq!(ingested.status, RunStatus::Success);
    assert_eq!(ingested.counts.ok, 3);
    let m = manifest(&ingested);
    assert_eq!(m.schema, "bh.v1.raw_audio");
    assert_eq!(m.step_id, StepKind::Ingest.step_id());
    assert!(m.errors.is_empty());
    assert!(ingested.run_dir.join("success.ok").exists());
    assert!(ingested.run_dir.join("metrics.json").exists());
    assert!(!ingested.run_dir.join("error.json").exists());

    let recordings = data(&ingested, "metadata_recordings.jsonl");
    let ids: Vec<&str> = recordings.iter().map(|r| r["recording_id"].as_str().unwrap()).collect();
    assert_eq!(
        ids,
        vec![
            format!("{CALL_A}_p01"),
            format!("{CALL_A}_p02"),
            format!("{CALL_B}_p01")
        ]
    );
    assert_eq!(recordings[0]["spinoco_recording_id"], "rec-a1");
    assert_eq!(data(&ingested, "metadata_calls.jsonl").len(), 2);

    // Transcribe
    let transcribed = h.transcribe(input_of(&ingested.run_id)).await;
    assert_eq!(transcribed.status, RunStatus::Success);
    assert_eq!(transcribed.counts.ok, 3);
    let m = manifest(&transcribed);
    assert_eq!(m.input_run.as_deref(), Some(ingested.run_id.as_str()));
    assert_eq!(m.outputs.primary, "data/transcripts_recordings.jsonl");

    let calls = data(&transcribed, "transcripts_calls.jsonl");
    assert_eq!(calls.len(), 2);
    let call_a = calls.iter().find(|c| c["call_id"] == CALL_A).unwrap();
    let text = call_a["text"].as_str().unwrap();
    assert!(text.starts_with(&format!("[--- {CALL_A}_p01 ---]\n\n")));
    assert!(text.contains(&format!("[--- {CALL_A}_p02 ---]")));
    assert_eq!(call_a["metrics"]["recording_count"], 2);

    // Anonymize
    let redacted = h.anonymize(&transcribed.run_id).await;
    assert_eq!(redacted.status, RunStatus::Success);
    assert_eq!(redacted.counts.ok, 2);

    let calls = data(&redacted, "transcripts_calls_redacted.jsonl");
    let call_a = calls.iter().find(|c| c["call_id"] == CALL_A).unwrap();
    let text = call_a["text"].as_str().unwrap();
    assert!(!text.contains("777 123 456"));
    assert!(!text.contains("jana.novakova"));
    assert_eq!(text.matches("@PHONE_1").count(), 2);
    assert!(text.contains("@EMAIL_1"));
    assert_eq!(call_a["pii_stats"]["total_replacements"], 3);

    let recordings = data(&redacted, "transcripts_recordings_redacted.jsonl");
    let p02 = recordings
        .iter()
        .find(|r| r["recording_id"] == format!("{CALL_A}_p02").as_str())
        .unwrap();
    assert_eq!(p02["text"], "Můj email je @EMAIL_1 a číslo @PHONE_1.");

    let call_b = calls.iter().find(|c| c["call_id"] == CALL_B).unwrap();
    assert!(call_b["text"].as_str().unwrap().contains("@IBAN_1"));

    let vault: Value = read_json(
        &redacted
            .run_dir
            .join("data")
            .join("vault_map")
            .join(format!("{CALL_A}.json")),
    )
    .unwrap();
    assert_eq!(vault.as_object().unwrap().len(), 2);
    let raw = vault.to_string();
    assert!(!raw.contains("777 123 456"));
    assert!(!raw.contains("jana.novakova"));
}

#[tokio::test]
async fn test_rerun_of_transcribe_does_nothing() {
    let h = Harness::new();
    two_call_fixtures(&h);
    let ingested = h.ingest().await;

    let first = h.transcribe(input_of(&ingested.run_id)).await;
    assert_eq!(first.counts.ok, 3);

    let second = h.transcribe(input_of(&ingested.run_id)).await;
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.counts.ok, 0);
    assert_eq!(second.counts.skipped, 3);
    assert_eq!(second.status, RunStatus::Success);
    assert!(data(&second, "transcripts_recordings.jsonl").is_empty());
}

#[tokio::test]
async fn test_missing_audio_is_skipped() {
    let h = Harness::new();
    // 16 recordings; only the first is downloadable
    let recordings: Vec<Value> = (1..=16)
        .map(|n| {
            let id = if n == 1 { "rec-01".to_string() } else { format!("rec-gone-{n:02}") };
            json!({"id": id, "date": 1724305420000_i64 + n * 1000, "available": true})
        })
        .collect();
    h.write_fixtures(
        json!([{"id": "71da9579-7730-11ee-9300-a3a8e273fd52", "lastUpdate": 1724305416000_i64}]),
        json!({"71da9579-7730-11ee-9300-a3a8e273fd52": recordings}),
    );
    for n in 1..=16 {
        h.write_transcript(&format!("{CALL_A}_p{n:02}"), &whisper("ahoj"));
    }

    let ingested = h.ingest().await;
    assert_eq!(ingested.counts.total, 16);
    assert_eq!(ingested.counts.ok, 1);
    assert_eq!(ingested.counts.skipped, 15);
    assert_eq!(ingested.status, RunStatus::Success);

    let transcribed = h.transcribe(input_of(&ingested.run_id)).await;
    assert_eq!(transcribed.counts.total, 16);
    assert_eq!(transcribed.counts.ok, 1);
    assert_eq!(transcribed.counts.skipped, 15);
    assert_eq!(transcribed.counts.failed, 0);
    assert_eq!(transcribed.status, RunStatus::Success);
}

#[tokio::test]
async fn test_failure_then_targeted_retry() {
    let h = Harness::new();
    two_call_fixtures(&h);
    let broken = format!("{CALL_A}_p02");
    h.write_transcript(&broken, "{ not json");

    let ingested = h.ingest().await;
    let first = h.transcribe(input_of(&ingested.run_id)).await;
    assert_eq!(first.status, RunStatus::Partial);
    assert_eq!(first.counts.ok, 2);
    assert_eq!(first.counts.failed, 1);
    assert!(!first.run_dir.join("success.ok").exists());

    let m = manifest(&first);
    assert_eq!(m.errors.len(), 1);
    assert_eq!(m.errors[0].unit_id, broken);

    let error_file: ErrorFile = read_json(&first.run_dir.join("error.json")).unwrap();
    assert_eq!(error_file.failed.len(), 1);
    assert_eq!(error_file.failed[0].work_id, broken);
    assert!(!error_file.failed[0].retryable);
    assert_eq!(
        error_file.retry_command,
        format!("callpipe transcribe --input-run {} --only {}", ingested.run_id, broken)
    );

    // Fix the input and retry just that recording
    h.write_transcript(&broken, &whisper("opraveno"));
    let retry = h
        .transcribe(StepOptions {
            only: Some([broken.clone()].into_iter().collect()),
            ..input_of(&ingested.run_id)
        })
        .await;
    assert_eq!(retry.status, RunStatus::Success);
    assert_eq!(retry.counts.total, 1);
    assert_eq!(retry.counts.ok, 1);
}

#[tokio::test]
async fn test_missing_upstream_run_is_fatal() {
    let h = Harness::new();
    let summary = h.transcribe(input_of("01J5Z8Q3V4W6X7Y8Z9A0B1C2D3")).await;

    assert_eq!(summary.status, RunStatus::Error);
    assert_eq!(summary.exit_code(), 1);
    let m = manifest(&summary);
    assert_eq!(m.errors[0].error_key, "fatal");
    assert!(summary.run_dir.join("error.json").exists());
}

#[tokio::test]
async fn test_dry_ingest_downloads_nothing() {
    let h = Harness::new();
    two_call_fixtures(&h);

    let source: Arc<dyn RecordingSource> = Arc::new(FixtureSource::load(&h.fixtures).unwrap());
    let options = StepOptions {
        mode: callpipe::domain::RunMode::Dry,
        ..StepOptions::default()
    };
    let summary = ingest::run(h.config.clone(), options, source, AbortHandle::default())
        .await
        .unwrap();

    assert_eq!(summary.counts.planned, 3);
    assert_eq!(summary.counts.skipped, 3);
    assert_eq!(summary.status, RunStatus::Success);
    assert!(audio_files(&summary.run_dir).is_empty());
}

fn audio_files(run_dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(run_dir.join("data").join("audio"))
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}
