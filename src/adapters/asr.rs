//! Speech-to-text backends.
//!
//! Two ways to get a transcript, chosen once from config:
//! - `Command`: run an external tool (whisper by default) per recording,
//!   then pick its JSON output by glob from a scratch directory
//! - `Import`: find transcript JSON someone already produced under a base
//!   directory
//!
//! The pipeline never depends on the specific tool; anything that writes
//! whisper-style JSON works.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use glob::Pattern;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::config::{TranscribeMode, TranscribeSettings};

use super::{RawTranscript, TranscribeError, Transcriber};

/// Longest stderr excerpt kept in an error message
const STDERR_EXCERPT: usize = 500;

/// External speech-to-text command
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    /// Program followed by arguments, with `{audio}` / `{out_dir}` placeholders
    command: Vec<String>,
    outputs_glob: String,
    timeout: Duration,
}

impl CommandTranscriber {
    pub fn new(command: Vec<String>, outputs_glob: impl Into<String>, timeout: Duration) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Transcriber command is empty");
        }
        Ok(Self {
            command,
            outputs_glob: outputs_glob.into(),
            timeout,
        })
    }

    /// Substitute placeholders into program and arguments
    fn render(&self, audio: &Path, out_dir: &Path) -> Vec<String> {
        let audio = audio.to_string_lossy();
        let out_dir = out_dir.to_string_lossy();
        self.command
            .iter()
            .map(|part| part.replace("{audio}", &audio).replace("{out_dir}", &out_dir))
            .collect()
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    fn name(&self) -> &str {
        "command"
    }

    #[instrument(skip(self, audio), fields(program = %self.command[0]))]
    async fn transcribe(
        &self,
        audio: &Path,
        recording_id: &str,
    ) -> Result<RawTranscript, TranscribeError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| TranscribeError::Transient(format!("Failed to create temp dir: {e}")))?;

        let argv = self.render(audio, scratch.path());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TranscribeError::Permanent("Transcriber command is empty".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscribeError::Transient(format!("Failed to spawn {program}: {e}")))?;

        // Dropping the future on timeout kills the child
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TranscribeError::Transient(format!(
                    "{} timed out after {:?}",
                    program, self.timeout
                ))
            })?
            .map_err(|e| TranscribeError::Transient(format!("Failed to wait for {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(TranscribeError::Permanent(format!(
                "{} failed with exit code {}: {}",
                program,
                output.status.code().unwrap_or(-1),
                excerpt
            )));
        }

        let json_path = first_match(scratch.path(), &self.outputs_glob, None).ok_or_else(|| {
            TranscribeError::Permanent(format!(
                "No transcript output matching {} for {}",
                self.outputs_glob, recording_id
            ))
        })?;
        debug!(output = %json_path.display(), "Transcriber produced output");

        read_transcript(&json_path).await
    }
}

/// Pre-existing transcript JSON under a base directory
#[derive(Debug, Clone)]
pub struct ImportTranscriber {
    base: PathBuf,
    outputs_glob: String,
}

impl ImportTranscriber {
    pub fn new(base: impl Into<PathBuf>, outputs_glob: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            outputs_glob: outputs_glob.into(),
        }
    }

    /// File for `recording_id`: the first match (by path) whose name contains the id
    pub fn locate(&self, recording_id: &str) -> Option<PathBuf> {
        let recursive = format!("**/{}", self.outputs_glob.trim_start_matches("**/"));
        first_match(&self.base, &recursive, Some(recording_id))
    }
}

#[async_trait]
impl Transcriber for ImportTranscriber {
    fn name(&self) -> &str {
        "import"
    }

    async fn transcribe(
        &self,
        _audio: &Path,
        recording_id: &str,
    ) -> Result<RawTranscript, TranscribeError> {
        let path = self.locate(recording_id).ok_or_else(|| {
            TranscribeError::NotFound(format!(
                "No transcript for {} under {}",
                recording_id,
                self.base.display()
            ))
        })?;

        read_transcript(&path).await
    }
}

/// The configured backend, selected once at startup
#[derive(Debug, Clone)]
pub enum AsrBackend {
    Command(CommandTranscriber),
    Import(ImportTranscriber),
}

impl AsrBackend {
    pub fn from_settings(settings: &TranscribeSettings) -> Result<Self> {
        match settings.mode {
            TranscribeMode::Run => Ok(Self::Command(CommandTranscriber::new(
                settings.command.clone(),
                settings.outputs_glob.clone(),
                Duration::from_secs(settings.timeout_s),
            )?)),
            TranscribeMode::Import => {
                let base = settings.import_base_path.clone().ok_or_else(|| {
                    anyhow::anyhow!("transcribe.import_base_path is required in import mode")
                })?;
                if !base.is_dir() {
                    anyhow::bail!("Import directory not found: {}", base.display());
                }
                Ok(Self::Import(ImportTranscriber::new(
                    base,
                    settings.outputs_glob.clone(),
                )))
            }
        }
    }
}

#[async_trait]
impl Transcriber for AsrBackend {
    fn name(&self) -> &str {
        match self {
            Self::Command(inner) => inner.name(),
            Self::Import(inner) => inner.name(),
        }
    }

    async fn transcribe(
        &self,
        audio: &Path,
        recording_id: &str,
    ) -> Result<RawTranscript, TranscribeError> {
        match self {
            Self::Command(inner) => inner.transcribe(audio, recording_id).await,
            Self::Import(inner) => inner.transcribe(audio, recording_id).await,
        }
    }
}

/// First path (sorted) matching `pattern` under `dir`, optionally requiring `name_contains`
fn first_match(dir: &Path, pattern: &str, name_contains: Option<&str>) -> Option<PathBuf> {
    let full = format!("{}/{}", Pattern::escape(&dir.to_string_lossy()), pattern);
    let mut matches: Vec<PathBuf> = glob::glob(&full)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter(|path| match name_contains {
            Some(needle) => path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().contains(needle)),
            None => true,
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

async fn read_transcript(path: &Path) -> Result<RawTranscript, TranscribeError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        TranscribeError::Permanent(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let json = serde_json::from_str(&content).map_err(|e| {
        TranscribeError::Permanent(format!("Malformed transcript JSON {}: {}", path.display(), e))
    })?;

    Ok(RawTranscript {
        source: path.to_path_buf(),
        json,
    })
}
