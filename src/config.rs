//! Configuration for callpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CALLPIPE_HOME, plus the token/salt variables
//!    named in the config)
//! 2. Config file (`--config <path>`, or `.callpipe/config.yaml` found in the
//!    current directory or a parent)
//! 3. Defaults (~/.callpipe)
//!
//! The resolved configuration is an explicit value handed to each step.
//! Nothing is cached process-wide.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::runner::DEFAULT_CONCURRENCY;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub transcribe: TranscribeSettings,
    #[serde(default)]
    pub anonymize: AnonymizeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State and runs root (relative to the .callpipe/ directory)
    pub home: Option<String>,
}

/// Worker pool and progress settings shared by all steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum time between progress file writes
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}
fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Spinoco download step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Name of the env var holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_ingest_max_retry")]
    pub max_retry: u32,

    /// Backfill start (ISO 8601); incremental runs use the stored watermark
    #[serde(default)]
    pub since: Option<String>,

    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,

    /// Read calls from fixture files instead of the API
    #[serde(default)]
    pub fixtures_dir: Option<PathBuf>,
}

fn default_api_base_url() -> String {
    "https://api.spinoco.com".to_string()
}
fn default_token_env() -> String {
    "SPINOCO_TOKEN".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_ingest_max_retry() -> u32 {
    3
}
fn default_request_timeout_s() -> u64 {
    60
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            token_env: default_token_env(),
            page_size: default_page_size(),
            max_retry: default_ingest_max_retry(),
            since: None,
            request_timeout_s: default_request_timeout_s(),
            fixtures_dir: None,
        }
    }
}

/// How transcripts are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscribeMode {
    /// Run the configured speech-to-text command per recording
    Run,
    /// Pick up transcript JSON produced elsewhere
    Import,
}

/// Speech-to-text step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeSettings {
    #[serde(default = "default_transcribe_mode")]
    pub mode: TranscribeMode,

    #[serde(default = "default_transcribe_max_retry")]
    pub max_retry: u32,

    /// Program and arguments; `{audio}` and `{out_dir}` are substituted
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Glob (relative to the output or import directory) locating transcript JSON
    #[serde(default = "default_outputs_glob")]
    pub outputs_glob: String,

    /// Root searched in import mode
    #[serde(default)]
    pub import_base_path: Option<PathBuf>,

    #[serde(default = "default_transcribe_timeout_s")]
    pub timeout_s: u64,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_device")]
    pub device: String,
}

fn default_transcribe_mode() -> TranscribeMode {
    TranscribeMode::Run
}
fn default_transcribe_max_retry() -> u32 {
    2
}
fn default_command() -> Vec<String> {
    [
        "whisper",
        "{audio}",
        "--output_dir",
        "{out_dir}",
        "--output_format",
        "json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_outputs_glob() -> String {
    "*.json".to_string()
}
fn default_transcribe_timeout_s() -> u64 {
    1800
} // 30 min
fn default_provider() -> String {
    "whisper".to_string()
}
fn default_model() -> String {
    "large-v3".to_string()
}
fn default_language() -> String {
    "cs".to_string()
}
fn default_device() -> String {
    "auto".to_string()
}

impl Default for TranscribeSettings {
    fn default() -> Self {
        Self {
            mode: default_transcribe_mode(),
            max_retry: default_transcribe_max_retry(),
            command: default_command(),
            outputs_glob: default_outputs_glob(),
            import_base_path: None,
            timeout_s: default_transcribe_timeout_s(),
            provider: default_provider(),
            model: default_model(),
            language: default_language(),
            device: default_device(),
        }
    }
}

/// PII redaction step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizeSettings {
    #[serde(default = "default_anonymize_max_retry")]
    pub max_retry: u32,

    /// Prefix of replacement tags, e.g. `@` gives `@PHONE_1`
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    /// Street address detection is noisy, so it is opt-in
    #[serde(default)]
    pub enable_address: bool,

    /// Write per-call tag to hashed-value maps
    #[serde(default = "default_true")]
    pub vault_map: bool,

    /// Name of the env var holding the vault hashing salt
    #[serde(default = "default_vault_salt_env")]
    pub vault_salt_env: String,
}

fn default_anonymize_max_retry() -> u32 {
    2
}
fn default_tag_prefix() -> String {
    "@".to_string()
}
fn default_true() -> bool {
    true
}
fn default_vault_salt_env() -> String {
    "CALLPIPE_VAULT_SALT".to_string()
}

impl Default for AnonymizeSettings {
    fn default() -> Self {
        Self {
            max_retry: default_anonymize_max_retry(),
            tag_prefix: default_tag_prefix(),
            enable_address: false,
            vault_map: true,
            vault_salt_env: default_vault_salt_env(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Root of state databases and run directories
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub runner: RunnerSettings,
    pub ingest: IngestSettings,
    pub transcribe: TranscribeSettings,
    pub anonymize: AnonymizeSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, no config file
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self::from_file(home.into(), None, ConfigFile::default())
    }

    fn from_file(home: PathBuf, config_file: Option<PathBuf>, file: ConfigFile) -> Self {
        Self {
            home,
            config_file,
            runner: file.runner,
            ingest: file.ingest,
            transcribe: file.transcribe,
            anonymize: file.anonymize,
        }
    }

    /// `<home>/runs`
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// `<home>/state/<step_id>.sqlite`
    pub fn state_path(&self, step_id: &str) -> PathBuf {
        self.home.join("state").join(format!("{step_id}.sqlite"))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".callpipe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources.
///
/// `explicit` is the `--config` argument; without it the usual discovery
/// applies.
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };
    let env_home = std::env::var("CALLPIPE_HOME").ok().filter(|h| !h.is_empty());

    resolve(config_file, env_home)
}

fn resolve(config_file: Option<PathBuf>, env_home: Option<String>) -> Result<ResolvedConfig> {
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let (Some(config_path), Some(home_path)) = (&config_file, &file.paths.home) {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".callpipe")
    };

    let mut resolved = ResolvedConfig::from_file(home, config_file.clone(), file);

    // Relative fixture/import paths are relative to the config file too
    if let Some(config_dir) = config_file.as_deref().and_then(Path::parent) {
        if let Some(dir) = &resolved.ingest.fixtures_dir {
            resolved.ingest.fixtures_dir = Some(resolve_path(config_dir, &dir.to_string_lossy()));
        }
        if let Some(dir) = &resolved.transcribe.import_base_path {
            resolved.transcribe.import_base_path =
                Some(resolve_path(config_dir, &dir.to_string_lossy()));
        }
    }

    Ok(resolved)
}
