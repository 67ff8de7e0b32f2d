//! On-disk layout of one run and the file helpers every step shares.
//!
//! ```text
//! <home>/runs/<step_id>/<run_id>/
//!   manifest.json   written once, at the end
//!   metrics.json
//!   progress.json   overwritten while running
//!   error.json      only when something failed
//!   success.ok      only when the run succeeded
//!   data/           step outputs
//! ```
//!
//! All JSON writes go through a temp file in the target directory followed
//! by a rename, so readers never see a half-written file.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const PROGRESS_FILE: &str = "progress.json";
pub const ERROR_FILE: &str = "error.json";
pub const SUCCESS_MARKER: &str = "success.ok";
pub const DATA_DIR: &str = "data";

/// Directory of one run of one step
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    /// Create the directory for a new run.
    ///
    /// Fails if a manifest already exists there: a finished run is immutable.
    pub fn create(runs_root: &Path, step_id: &str, run_id: &str) -> Result<Self> {
        let root = runs_root.join(step_id).join(run_id);
        let dir = Self { root };

        if dir.manifest_path().exists() {
            anyhow::bail!(
                "Run {} of step {} is already finalized at {}",
                run_id,
                step_id,
                dir.root.display()
            );
        }

        fs::create_dir_all(dir.data_dir())
            .with_context(|| format!("Failed to create run directory: {}", dir.root.display()))?;

        Ok(dir)
    }

    /// Point at an existing run (e.g. an upstream one)
    pub fn existing(runs_root: &Path, step_id: &str, run_id: &str) -> Result<Self> {
        let root = runs_root.join(step_id).join(run_id);
        if !root.is_dir() {
            anyhow::bail!("Run directory not found: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join(METRICS_FILE)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.root.join(PROGRESS_FILE)
    }

    pub fn error_path(&self) -> PathBuf {
        self.root.join(ERROR_FILE)
    }

    pub fn success_marker(&self) -> PathBuf {
        self.root.join(SUCCESS_MARKER)
    }

    /// Resolve a path recorded relative to the run directory
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Create or remove the zero-byte success marker
    pub fn set_success_marker(&self, success: bool) -> Result<()> {
        let marker = self.success_marker();
        if success {
            File::create(&marker)
                .with_context(|| format!("Failed to create {}", marker.display()))?;
        } else if marker.exists() {
            fs::remove_file(&marker)
                .with_context(|| format!("Failed to remove {}", marker.display()))?;
        }
        Ok(())
    }
}

/// Write pretty JSON via temp file + rename
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        Ok(())
    })
}

/// Write one compact JSON document per line via temp file + rename
pub fn write_jsonl<'a, T, I>(path: &Path, items: I) -> Result<usize>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut count = 0;
    write_atomic(path, |writer| {
        for item in items {
            serde_json::to_writer(&mut *writer, item)?;
            writer.write_all(b"\n")?;
            count += 1;
        }
        Ok(())
    })?;
    Ok(count)
}

/// Read a JSONL file, skipping blank lines
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut items = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("Malformed JSON at {}:{}", path.display(), idx + 1))?;
        items.push(item);
    }
    Ok(items)
}

/// Read a JSON document
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> Result<()>,
{
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    {
        let mut writer = BufWriter::new(&mut temp);
        fill(&mut writer)?;
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    temp.persist(path)
        .with_context(|| format!("Failed to move temp file into place: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Line {
        id: String,
        n: u32,
    }

    #[test]
    fn test_create_layout() {
        let temp = TempDir::new().unwrap();
        let dir = RunDir::create(temp.path(), "01_ingest_spinoco", "01JAH9A2W8F8Q6GQ4C7M3N2P1R")
            .unwrap();

        assert!(dir.data_dir().is_dir());
        assert!(dir
            .path()
            .ends_with("01_ingest_spinoco/01JAH9A2W8F8Q6GQ4C7M3N2P1R"));
    }

    #[test]
    fn test_finalized_run_cannot_be_recreated() {
        let temp = TempDir::new().unwrap();
        let dir = RunDir::create(temp.path(), "step", "run").unwrap();
        write_json_atomic(&dir.manifest_path(), &serde_json::json!({"status": "success"}))
            .unwrap();

        assert!(RunDir::create(temp.path(), "step", "run").is_err());
        assert!(RunDir::existing(temp.path(), "step", "run").is_ok());
        assert!(RunDir::existing(temp.path(), "step", "other").is_err());
    }

    #[test]
    fn test_jsonl_roundtrip_skips_blank_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data").join("items.jsonl");
        let items = vec![
            Line { id: "a".into(), n: 1 },
            Line { id: "b".into(), n: 2 },
        ];

        assert_eq!(write_jsonl(&path, &items).unwrap(), 2);

        let mut content = fs::read_to_string(&path).unwrap();
        content.push('\n');
        fs::write(&path, content).unwrap();

        let back: Vec<Line> = read_jsonl(&path).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn test_malformed_jsonl_reports_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.jsonl");
        fs::write(&path, "{\"id\":\"a\",\"n\":1}\nnot json\n").unwrap();

        let err = read_jsonl::<Line>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.jsonl:2"));
    }

    #[test]
    fn test_success_marker_toggles() {
        let temp = TempDir::new().unwrap();
        let dir = RunDir::create(temp.path(), "step", "run").unwrap();

        dir.set_success_marker(true).unwrap();
        assert_eq!(fs::metadata(dir.success_marker()).unwrap().len(), 0);

        dir.set_success_marker(false).unwrap();
        assert!(!dir.success_marker().exists());
    }
}
