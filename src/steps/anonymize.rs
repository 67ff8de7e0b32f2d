//! Step 03: replace personal data in transcripts with stable tags.
//!
//! One work unit per call. Tags are numbered per call in order of first
//! appearance (`@PHONE_1`, `@EMAIL_1`, ...) and the same value gets the same
//! tag in the call transcript and in each of its recordings. Original values
//! never leave the action; the optional vault map stores only salted hashes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tracing::{info, instrument, warn};

use crate::config::{AnonymizeSettings, ResolvedConfig};
use crate::core::fingerprint::{content_hash, hash_bytes};
use crate::core::manifest::{InputRef, Outputs};
use crate::core::run_dir::{read_jsonl, write_json_atomic, write_jsonl};
use crate::core::{AbortHandle, RunReport, UnitAction};
use crate::domain::{Outcome, WorkUnit};

use super::transcribe::{CallTranscript, RecordingTranscript, Segment, CALLS_OUT, RECORDINGS_OUT};
use super::{upstream_file, StepContext, StepKind, StepOptions, StepOutputs, StepSummary};

pub const RECORDINGS_REDACTED: &str = "transcripts_recordings_redacted.jsonl";
pub const CALLS_REDACTED: &str = "transcripts_calls_redacted.jsonl";
pub const VAULT_DIR: &str = "vault_map";

/// Bumped whenever a pattern changes, so earlier output is redone
const PATTERN_SET_VERSION: u32 = 1;

const EMAIL_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const IBAN_PATTERN: &str = r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b";
const PHONE_PATTERN: &str = r"(\+?420[\s-]?)?(\d[\s-]?){9,11}";
const ADDRESS_PATTERN: &str = r"\b\d+\s+[\p{L}\s]+(?:ulice|třída|náměstí|nábřeží)\b";

/// Kinds of personal data the redactor recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PiiKind {
    Email,
    Iban,
    Phone,
    Address,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Email => "EMAIL",
            PiiKind::Iban => "IBAN",
            PiiKind::Phone => "PHONE",
            PiiKind::Address => "ADDRESS",
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values seen so far in one call, in order of first appearance per kind
#[derive(Debug, Default)]
pub struct TagContext {
    values: BTreeMap<PiiKind, Vec<String>>,
}

impl TagContext {
    /// Tag number for `value`, assigning the next one if it is new
    fn number(&mut self, kind: PiiKind, value: &str) -> usize {
        let seen = self.values.entry(kind).or_default();
        match seen.iter().position(|v| v == value) {
            Some(idx) => idx + 1,
            None => {
                seen.push(value.to_string());
                seen.len()
            }
        }
    }

    /// `tag -> sha256("<salt>:<value>")`
    pub fn vault_map(&self, prefix: &str, salt: &str) -> BTreeMap<String, String> {
        self.values
            .iter()
            .flat_map(|(kind, values)| {
                values.iter().enumerate().map(move |(idx, value)| {
                    (
                        format!("{prefix}{kind}_{}", idx + 1),
                        hash_bytes(format!("{salt}:{value}").as_bytes()),
                    )
                })
            })
            .collect()
    }
}

/// Replacement counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PiiStats {
    pub total_replacements: usize,
    pub by_type: BTreeMap<String, usize>,
}

impl PiiStats {
    fn add(&mut self, other: &PiiStats) {
        self.total_replacements += other.total_replacements;
        for (kind, count) in &other.by_type {
            *self.by_type.entry(kind.clone()).or_default() += count;
        }
    }
}

/// Regex-based redactor
pub struct Redactor {
    patterns: Vec<(PiiKind, Regex)>,
    tag_prefix: String,
}

impl Redactor {
    /// Specific patterns run first so a phone match cannot eat the digits
    /// of an IBAN
    pub fn new(settings: &AnonymizeSettings) -> Result<Self> {
        let mut sources = vec![
            (PiiKind::Email, EMAIL_PATTERN),
            (PiiKind::Iban, IBAN_PATTERN),
            (PiiKind::Phone, PHONE_PATTERN),
        ];
        if settings.enable_address {
            sources.push((PiiKind::Address, ADDRESS_PATTERN));
        }

        let patterns = sources
            .into_iter()
            .map(|(kind, source)| {
                let regex = RegexBuilder::new(source)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid {kind} pattern"))?;
                Ok((kind, regex))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            tag_prefix: settings.tag_prefix.clone(),
        })
    }

    /// Replace every match in `text`, numbering tags through `ctx`
    pub fn redact(&self, text: &str, ctx: &mut TagContext) -> (String, PiiStats) {
        let mut current = text.to_string();
        let mut stats = PiiStats::default();

        for (kind, regex) in &self.patterns {
            let mut out = String::with_capacity(current.len());
            let mut last = 0;
            let mut count = 0;

            for m in regex.find_iter(&current) {
                // Separators the pattern allows at the end belong to the surrounding text
                let value = m.as_str().trim_end_matches(|c: char| c.is_whitespace() || c == '-');
                if value.is_empty() {
                    continue;
                }
                let end = m.start() + value.len();

                out.push_str(&current[last..m.start()]);
                let n = ctx.number(*kind, value);
                out.push_str(&format!("{}{}_{}", self.tag_prefix, kind, n));
                last = end;
                count += 1;
            }
            out.push_str(&current[last..]);
            current = out;

            if count > 0 {
                stats.total_replacements += count;
                *stats.by_type.entry(kind.to_string()).or_default() += count;
            }
        }

        (current, stats)
    }

    fn redact_segments(&self, segments: &[Segment], ctx: &mut TagContext) -> Vec<Segment> {
        segments
            .iter()
            .map(|seg| Segment {
                text: self.redact(&seg.text, ctx).0,
                ..seg.clone()
            })
            .collect()
    }
}

/// A transcript document with its replacement counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redacted<T> {
    #[serde(flatten)]
    pub doc: T,
    pub pii_stats: PiiStats,
}

/// One call and the recordings it was aggregated from
#[derive(Debug, Clone)]
pub struct CallBundle {
    pub call: CallTranscript,
    pub recordings: Vec<RecordingTranscript>,
}

/// Redacted output of one call
#[derive(Debug, Clone)]
pub struct RedactedCall {
    pub call: Redacted<CallTranscript>,
    pub recordings: Vec<Redacted<RecordingTranscript>>,
    /// Empty unless vault maps are enabled
    pub vault: BTreeMap<String, String>,
}

/// Redact one call. Call text goes first, so numbering follows the order
/// values appear in the call transcript.
pub fn redact_bundle(redactor: &Redactor, bundle: &CallBundle) -> (RedactedCall, TagContext) {
    let mut ctx = TagContext::default();

    let (text, stats) = redactor.redact(&bundle.call.text, &mut ctx);
    let call = Redacted {
        doc: CallTranscript {
            text,
            segments: redactor.redact_segments(&bundle.call.segments, &mut ctx),
            ..bundle.call.clone()
        },
        pii_stats: stats,
    };

    let mut recordings: Vec<&RecordingTranscript> = bundle.recordings.iter().collect();
    recordings.sort_by(|a, b| a.recording_id.cmp(&b.recording_id));
    let recordings = recordings
        .into_iter()
        .map(|rec| {
            let (text, stats) = redactor.redact(&rec.text, &mut ctx);
            Redacted {
                doc: RecordingTranscript {
                    text,
                    segments: redactor.redact_segments(&rec.segments, &mut ctx),
                    ..rec.clone()
                },
                pii_stats: stats,
            }
        })
        .collect();

    (
        RedactedCall {
            call,
            recordings,
            vault: BTreeMap::new(),
        },
        ctx,
    )
}

pub struct AnonymizeAction {
    redactor: Redactor,
    /// Salt for vault hashes; `None` disables vault maps
    vault_salt: Option<String>,
}

impl AnonymizeAction {
    pub fn new(redactor: Redactor, vault_salt: Option<String>) -> Self {
        Self {
            redactor,
            vault_salt,
        }
    }
}

#[async_trait]
impl UnitAction for AnonymizeAction {
    type Payload = CallBundle;
    type Output = RedactedCall;

    async fn process(&self, unit: &WorkUnit<CallBundle>) -> Outcome<RedactedCall> {
        if unit.payload.recordings.is_empty() {
            return Outcome::Skip(format!("no recording transcripts for call {}", unit.id));
        }

        let (mut redacted, ctx) = redact_bundle(&self.redactor, &unit.payload);
        if let Some(salt) = &self.vault_salt {
            redacted.vault = ctx.vault_map(&self.redactor.tag_prefix, salt);
        }
        Outcome::Ok(redacted)
    }
}

/// Run the anonymize step over a transcribe run
#[instrument(skip_all)]
pub async fn run(
    config: ResolvedConfig,
    options: StepOptions,
    abort: AbortHandle,
) -> Result<StepSummary> {
    let mut ctx = StepContext::begin(StepKind::Anonymize, config, options, abort)?;

    match execute(&mut ctx).await {
        Ok((report, outputs)) => ctx.finish(&report, outputs),
        Err(e) => ctx.fail(&e),
    }
}

async fn execute(ctx: &mut StepContext) -> Result<(RunReport<RedactedCall>, StepOutputs)> {
    let (upstream_dir, upstream) = ctx.load_upstream()?;
    let settings = ctx.config.anonymize.clone();
    let store = ctx.open_store(settings.max_retry)?;

    let calls_path = upstream_file(&upstream_dir, &upstream, CALLS_OUT)?;
    let recordings_path = upstream_file(&upstream_dir, &upstream, RECORDINGS_OUT)?;
    let calls: Vec<CallTranscript> = read_jsonl(&calls_path)?;
    let recordings: Vec<RecordingTranscript> = read_jsonl(&recordings_path)?;

    let mut by_call: BTreeMap<String, Vec<RecordingTranscript>> = BTreeMap::new();
    for rec in recordings {
        by_call.entry(rec.call_id.clone()).or_default().push(rec);
    }

    let mut notes = Vec::new();
    let vault_salt = if settings.vault_map {
        match std::env::var(&settings.vault_salt_env) {
            Ok(salt) if !salt.is_empty() => Some(salt),
            _ => {
                warn!(env = %settings.vault_salt_env, "Vault salt not set, vault hashes are unsalted");
                notes.push(format!("{} not set; vault hashes are unsalted", settings.vault_salt_env));
                Some(String::new())
            }
        }
    } else {
        None
    };

    let identity = json!({
        "patterns": PATTERN_SET_VERSION,
        "tag_prefix": settings.tag_prefix,
        "enable_address": settings.enable_address,
    });
    let units = calls
        .into_iter()
        .map(|call| {
            let hash = content_hash(&json!({
                "settings": identity,
                "call_id": call.call_id,
                "transcript_hash": call.processing.transcript_hash,
            }))?;
            let recordings = by_call.remove(&call.call_id).unwrap_or_default();
            Ok(WorkUnit::new(
                call.call_id.clone(),
                call.call_id.clone(),
                hash,
                CallBundle { call, recordings },
            ))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()
        .context("Failed to fingerprint calls")?;
    if !by_call.is_empty() {
        warn!(orphans = by_call.len(), "Recording transcripts without a call transcript ignored");
    }
    info!(calls = units.len(), input = %calls_path.display(), "Work list loaded");

    let action = Arc::new(AnonymizeAction::new(Redactor::new(&settings)?, vault_salt));
    let report = ctx.runner(store).run(units, action).await?;

    let data_dir = ctx.run_dir.data_dir();
    let redacted_calls = report.completed.iter().map(|(_, r)| &r.call);
    write_jsonl(&data_dir.join(CALLS_REDACTED), redacted_calls)?;
    let redacted_recordings = report.completed.iter().flat_map(|(_, r)| r.recordings.iter());
    write_jsonl(&data_dir.join(RECORDINGS_REDACTED), redacted_recordings)?;

    let mut vaults_written = 0;
    if settings.vault_map {
        let vault_dir = data_dir.join(VAULT_DIR);
        std::fs::create_dir_all(&vault_dir)
            .with_context(|| format!("Failed to create {}", vault_dir.display()))?;
        for (call_id, redacted) in &report.completed {
            write_json_atomic(&vault_dir.join(format!("{call_id}.json")), &redacted.vault)?;
            vaults_written += 1;
        }
    }

    let mut totals = PiiStats::default();
    for (_, redacted) in &report.completed {
        totals.add(&redacted.call.pii_stats);
    }
    let mut metrics = Map::new();
    metrics.insert("calls_redacted".to_string(), report.completed.len().into());
    metrics.insert("pii_replacements_total".to_string(), totals.total_replacements.into());
    metrics.insert("pii_replacements_by_type".to_string(), json!(totals.by_type));
    metrics.insert("vault_maps_written".to_string(), vaults_written.into());

    let mut aux = BTreeMap::new();
    aux.insert("recordings".to_string(), format!("data/{RECORDINGS_REDACTED}"));
    if settings.vault_map {
        aux.insert("vault_map".to_string(), format!("data/{VAULT_DIR}"));
    }

    Ok((
        report,
        StepOutputs {
            outputs: Outputs {
                primary: format!("data/{CALLS_REDACTED}"),
                aux,
            },
            input_refs: vec![
                InputRef::new("file", calls_path.display().to_string()),
                InputRef::new("file", recordings_path.display().to_string()),
            ],
            metrics,
            notes,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::transcribe::{AsrInfo, CallMetrics, CallSource, Processing, RecordingMetrics, SourceInfo};

    fn redactor() -> Redactor {
        Redactor::new(&AnonymizeSettings::default()).unwrap()
    }

    #[test]
    fn test_redacts_phone_email_iban() {
        let r = redactor();
        let mut ctx = TagContext::default();
        let (text, stats) = r.redact(
            "Volejte +420 777 123 456 nebo pište na jan.novak@example.cz, účet CZ6508000000192000145399.",
            &mut ctx,
        );

        assert_eq!(
            text,
            "Volejte @PHONE_1 nebo pište na @EMAIL_1, účet @IBAN_1."
        );
        assert_eq!(stats.total_replacements, 3);
        assert_eq!(stats.by_type["PHONE"], 1);
    }

    #[test]
    fn test_same_value_same_tag() {
        let r = redactor();
        let mut ctx = TagContext::default();
        let (first, _) = r.redact("číslo 777123456 a 608111222", &mut ctx);
        let (second, stats) = r.redact("znovu 608111222", &mut ctx);

        assert_eq!(first, "číslo @PHONE_1 a @PHONE_2");
        assert_eq!(second, "znovu @PHONE_2");
        assert_eq!(stats.total_replacements, 1);
    }

    #[test]
    fn test_text_without_pii_untouched() {
        let r = redactor();
        let (text, stats) = r.redact("Dobrý den, jak vám mohu pomoci?", &mut TagContext::default());
        assert_eq!(text, "Dobrý den, jak vám mohu pomoci?");
        assert_eq!(stats, PiiStats::default());
    }

    #[test]
    fn test_address_is_opt_in() {
        let settings = AnonymizeSettings {
            enable_address: true,
            ..AnonymizeSettings::default()
        };
        let r = Redactor::new(&settings).unwrap();
        let (text, _) = r.redact("bydlím 12 Dlouhá ulice", &mut TagContext::default());
        assert_eq!(text, "bydlím @ADDRESS_1");

        let (plain, _) = redactor().redact("bydlím 12 Dlouhá ulice", &mut TagContext::default());
        assert_eq!(plain, "bydlím 12 Dlouhá ulice");
    }

    #[test]
    fn test_vault_map_is_salted() {
        let r = redactor();
        let mut ctx = TagContext::default();
        r.redact("a@b.cz", &mut ctx);

        let salted = ctx.vault_map("@", "pepper");
        assert_eq!(salted["@EMAIL_1"], hash_bytes(b"pepper:a@b.cz"));
        assert_ne!(ctx.vault_map("@", "other")["@EMAIL_1"], salted["@EMAIL_1"]);
    }

    fn asr() -> AsrInfo {
        AsrInfo {
            provider: "whisper".into(),
            model: "large-v3".into(),
            device: "cpu".into(),
            settings: Map::new(),
        }
    }

    fn processing() -> Processing {
        Processing {
            asr_settings_hash: "h".into(),
            transcript_hash: "t".into(),
            processed_at_utc: "2024-08-23T10:00:00Z".into(),
        }
    }

    fn recording(id: &str, text: &str) -> RecordingTranscript {
        RecordingTranscript {
            call_id: "20240822_054336_71da9579".into(),
            recording_id: id.into(),
            duration_s: Some(3.0),
            lang: "cs".into(),
            asr: asr(),
            segments: vec![Segment {
                start: 0.0,
                end: 3.0,
                text: text.into(),
                recording_id: None,
            }],
            text: text.into(),
            metrics: RecordingMetrics {
                seg_count: 1,
                avg_seg_len_s: 3.0,
            },
            source: SourceInfo {
                audio_path: format!("audio/{id}.ogg"),
                transcript_source: "import".into(),
            },
            processing: processing(),
        }
    }

    #[test]
    fn test_tags_consistent_across_call_and_recordings() {
        let p1 = recording("20240822_054336_71da9579_p01", "mail a@b.cz");
        let p2 = recording("20240822_054336_71da9579_p02", "číslo 777123456, mail a@b.cz");
        let call = CallTranscript {
            call_id: "20240822_054336_71da9579".into(),
            duration_s: 6.0,
            lang: "cs".into(),
            asr: asr(),
            segments: Vec::new(),
            text: format!(
                "[--- {} ---]\n\n{}\n\n[--- {} ---]\n\n{}",
                p1.recording_id, p1.text, p2.recording_id, p2.text
            ),
            metrics: CallMetrics {
                recording_count: 2,
                total_segments: 2,
                avg_seg_len_s: 3.0,
            },
            source: CallSource {
                recording_ids: vec![p1.recording_id.clone(), p2.recording_id.clone()],
                transcript_source: "aggregated".into(),
            },
            processing: processing(),
        };
        let bundle = CallBundle {
            call,
            recordings: vec![p2, p1],
        };

        let (redacted, ctx) = redact_bundle(&redactor(), &bundle);
        assert!(redacted.call.doc.text.contains("mail @EMAIL_1\n\n"));
        assert!(redacted.call.doc.text.ends_with("číslo @PHONE_1, mail @EMAIL_1"));
        assert_eq!(redacted.recordings[0].doc.text, "mail @EMAIL_1");
        assert_eq!(redacted.recordings[1].doc.text, "číslo @PHONE_1, mail @EMAIL_1");
        assert_eq!(redacted.recordings[1].doc.segments[0].text, "číslo @PHONE_1, mail @EMAIL_1");
        assert_eq!(redacted.call.pii_stats.total_replacements, 3);
        assert_eq!(ctx.vault_map("@", "s").len(), 2);

        // Same input, same output
        let (again, _) = redact_bundle(&redactor(), &bundle);
        assert_eq!(again.call.doc.text, redacted.call.doc.text);
    }

    #[test]
    fn test_redacted_serializes_flat() {
        let doc = Redacted {
            doc: recording("r_p01", "x"),
            pii_stats: PiiStats::default(),
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["recording_id"], "r_p01");
        assert_eq!(value["pii_stats"]["total_replacements"], 0);
    }
}
