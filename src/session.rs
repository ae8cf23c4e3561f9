use crate::camera::{CaptureSource, ImageRef, Roi};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// One labelled sample: `(image_reference, speed, angle)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRow {
    pub image: String,
    pub speed: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_index: u64,
    pub image_folder: PathBuf,
    pub label_file: PathBuf,
    pub rows: usize,
    pub start_time_unix_ms: u128,
    pub end_time_unix_ms: u128,
    pub label_sha256: String,
}

/// `log_{index}.csv` under the data directory.
pub fn label_path(data_dir: &Path, index: u64) -> PathBuf {
    data_dir.join(format!("log_{}.csv", index))
}

pub fn summary_path(data_dir: &Path, index: u64) -> PathBuf {
    data_dir.join(format!("log_{}.json", index))
}

pub(crate) fn unix_micros() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}

/// Samples of one recording session.
pub struct SessionLogger {
    index: u64,
    folder: PathBuf,
    data_dir: PathBuf,
    rows: Vec<LabelRow>,
    started_ms: u128,
    write_summary: bool,
    flushed: bool,
}

impl SessionLogger {
    pub fn open(index: u64, folder: PathBuf, data_dir: PathBuf, write_summary: bool) -> Self {
        tracing::info!("recording started in {}", folder.display());
        SessionLogger {
            index,
            folder,
            data_dir,
            rows: Vec::new(),
            started_ms: unix_micros() / 1000,
            write_summary,
            flushed: false,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn rows(&self) -> &[LabelRow] {
        &self.rows
    }

    pub fn label_path(&self) -> PathBuf {
        label_path(&self.data_dir, self.index)
    }

    fn summary_path(&self) -> PathBuf {
        summary_path(&self.data_dir, self.index)
    }

    /// Capture one frame and append its row. The row is only appended once
    /// the capture has returned, so every logged reference exists on disk.
    pub fn record_sample(
        &mut self,
        camera: &mut dyn CaptureSource,
        roi: Option<&Roi>,
        speed: f32,
        angle: f32,
    ) -> Result<ImageRef> {
        if self.flushed {
            bail!("session {} already flushed", self.index);
        }
        let stem = format!("img_{}_{}", self.rows.len(), unix_micros());
        let image = camera
            .capture(&self.folder.join(stem), roi)
            .with_context(|| format!("capturing sample {} of session {}", self.rows.len(), self.index))?;
        self.rows.push(LabelRow { image: image.to_string(), speed, angle });
        Ok(image)
    }

    /// Write `log_{index}.csv` (no header, capture order) and, if enabled, the
    /// JSON summary. Rows are cleared only after both writes succeed.
    pub fn flush(&mut self) -> Result<SessionSummary> {
        if self.flushed {
            bail!("session {} already flushed", self.index);
        }
        let label_path = self.label_path();
        write_labels(&label_path, &self.rows)?;

        let summary = SessionSummary {
            session_index: self.index,
            image_folder: self.folder.clone(),
            label_file: label_path.clone(),
            rows: self.rows.len(),
            start_time_unix_ms: self.started_ms,
            end_time_unix_ms: unix_micros() / 1000,
            label_sha256: file_sha256(&label_path)?,
        };
        if self.write_summary {
            write_summary(&self.summary_path(), &summary)?;
        }

        tracing::info!(
            "session {} saved: {} rows -> {} (images in {})",
            self.index,
            summary.rows,
            label_path.display(),
            self.folder.display()
        );
        self.rows.clear();
        self.flushed = true;
        Ok(summary)
    }
}

/// Label files are always newly created; an existing file is an error.
fn write_labels(path: &Path, rows: &[LabelRow]) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating label file {}", path.display()))?;
    let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    for row in rows {
        w.serialize(row)?;
    }
    w.flush()?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn write_summary(path: &Path, summary: &SessionSummary) -> Result<()> {
    if path.exists() {
        bail!("summary file {} already exists", path.display());
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_string_pretty(summary)?)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
