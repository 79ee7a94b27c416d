use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use filter_crop::config::RawConfig;
use filter_crop::pipeline::types::{ColorLayout, FrameBatch};
use filter_crop::pipeline::worker::OutputBatch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Outputs of one processed batch, as recorded in the manifest.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchRecord {
    pub id: usize,
    pub name: String,
    pub outputs: Vec<String>,
    pub duration_ms: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub input_root: PathBuf,
    pub config: RawConfig,
    pub batches: Vec<BatchRecord>,
}

/// Metadata written next to every output image.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FrameRecord {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub layout: ColorLayout,
    pub data: Map<String, Value>,
}

pub struct RunContext {
    pub output_dir: PathBuf,
    pub manifest: RunManifest,
}

impl RunContext {
    /// Prepares `output_root` for a new run. Refuses to reuse a directory
    /// that already holds a manifest.
    pub fn create(output_root: &Path, input_root: &Path, config: RawConfig) -> Result<Self> {
        if output_root.join(MANIFEST_FILE).exists() {
            return Err(anyhow!(
                "Output directory already holds a run: {}",
                output_root.display()
            ));
        }
        fs::create_dir_all(output_root)
            .with_context(|| format!("Failed to create {}", output_root.display()))?;

        let created_at = Utc::now();
        Ok(Self {
            output_dir: output_root.to_path_buf(),
            manifest: RunManifest {
                run_id: created_at.format("%Y%m%d_%H%M%S").to_string(),
                created_at,
                input_root: input_root.to_path_buf(),
                config,
                batches: Vec::new(),
            },
        })
    }

    /// Writes every frame of `batch` as `<batch>/<key>.png` plus a
    /// `<key>.json` record, and notes the batch in the manifest.
    pub fn write_batch(&mut self, batch: OutputBatch) -> Result<()> {
        let batch_dir = self.output_dir.join(&batch.name);
        fs::create_dir_all(&batch_dir)
            .with_context(|| format!("Failed to create {}", batch_dir.display()))?;

        let outputs = write_frames(&batch_dir, &batch.frames)?;
        self.manifest.batches.push(BatchRecord {
            id: batch.id,
            name: batch.name,
            outputs,
            duration_ms: batch.duration_ms,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<RunManifest> {
        self.manifest.batches.sort_by_key(|b| b.id);
        let path = self.output_dir.join(MANIFEST_FILE);
        let content = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(self.manifest)
    }
}

/// Output keys may contain path separators; flatten them into one file name.
fn file_stem_for(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

fn write_frames(dir: &Path, frames: &FrameBatch) -> Result<Vec<String>> {
    let mut outputs = Vec::with_capacity(frames.len());
    for (key, frame) in frames {
        let stem = file_stem_for(key);

        let image_path = dir.join(format!("{}.png", stem));
        frame
            .image
            .save(&image_path)
            .with_context(|| format!("Failed to write {}", image_path.display()))?;

        let record = FrameRecord {
            key: key.clone(),
            width: frame.width(),
            height: frame.height(),
            layout: frame.layout,
            data: frame.data.clone(),
        };
        let record_path = dir.join(format!("{}.json", stem));
        fs::write(&record_path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("Failed to write {}", record_path.display()))?;

        outputs.push(key.clone());
    }
    Ok(outputs)
}
