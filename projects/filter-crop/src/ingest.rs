// Loads input frames from disk and groups them into batches.
//
// Every image under the input root becomes one frame whose topic is the file
// stem; frames sharing a parent directory form one batch.

use anyhow::{anyhow, Context, Result};
use filter_crop::pipeline::types::{ColorLayout, Frame, FrameBatch, META_KEY};
use filter_crop::pipeline::worker::InputBatch;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

pub fn list_frame_files(input_root: &Path) -> Vec<PathBuf> {
    WalkDir::new(input_root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| FRAME_EXTENSIONS.contains(&s.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Name of the batch a frame file belongs to: its parent directory relative
/// to the input root, or the root's own name for top-level files.
fn batch_name(input_root: &Path, file: &Path) -> String {
    let parent = file.parent().unwrap_or(input_root);
    let relative = parent.strip_prefix(input_root).unwrap_or(parent);
    if relative.as_os_str().is_empty() {
        input_root
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("frames")
            .to_string()
    } else {
        relative.to_string_lossy().replace('\\', "/")
    }
}

/// Reads the optional `<stem>.json` next to a frame file.
fn read_sidecar(file: &Path) -> Result<Map<String, Value>> {
    let sidecar = file.with_extension("json");
    if !sidecar.exists() {
        return Ok(Map::new());
    }

    let content = fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read {}", sidecar.display()))?;
    match serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", sidecar.display()))?
    {
        Value::Object(meta) => Ok(meta),
        other => Err(anyhow!(
            "Sidecar {} must hold a JSON object, got {}",
            sidecar.display(),
            other
        )),
    }
}

pub fn load_frame(file: &Path) -> Result<Frame> {
    let image =
        image::open(file).with_context(|| format!("Failed to decode {}", file.display()))?;
    let meta = read_sidecar(file)?;
    let layout = ColorLayout::of_decoded(&image);

    let mut data = Map::new();
    data.insert(META_KEY.to_string(), Value::Object(meta));
    Ok(Frame::new(image, Value::Object(data), layout))
}

/// Loads every frame under `input_root`, one batch per directory, in sorted
/// order. Batch ids follow that order.
pub fn load_batches(input_root: &Path) -> Result<Vec<InputBatch>> {
    if !input_root.is_dir() {
        return Err(anyhow!(
            "Input directory does not exist: {}",
            input_root.display()
        ));
    }

    let mut grouped: BTreeMap<String, FrameBatch> = BTreeMap::new();
    for file in list_frame_files(input_root) {
        let topic = file
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("Invalid frame file name: {}", file.display()))?
            .to_string();

        let frames = grouped.entry(batch_name(input_root, &file)).or_default();
        if frames.contains_key(&topic) {
            tracing::warn!(
                "Skipping {}: topic '{}' already loaded for this batch",
                file.display(),
                topic
            );
            continue;
        }

        frames.insert(topic, load_frame(&file)?);
    }

    Ok(grouped
        .into_iter()
        .enumerate()
        .map(|(id, (name, frames))| InputBatch { id, name, frames })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_load_batches_groups_by_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("tick_001")).unwrap();
        fs::create_dir_all(root.join("tick_000")).unwrap();

        RgbImage::new(8, 6).save(root.join("tick_000/main.png")).unwrap();
        RgbImage::new(4, 4).save(root.join("tick_000/side.png")).unwrap();
        GrayImage::new(5, 5).save(root.join("tick_001/cam.png")).unwrap();
        fs::write(root.join("tick_000/notes.txt"), "ignored").unwrap();
        fs::write(
            root.join("tick_000/main.json"),
            json!({"id": 7, "detections": []}).to_string(),
        )
        .unwrap();

        let batches = load_batches(root).unwrap();
        assert_eq!(batches.len(), 2);

        assert_eq!(batches[0].id, 0);
        assert_eq!(batches[0].name, "tick_000");
        assert_eq!(
            batches[0].frames.keys().collect::<Vec<_>>(),
            vec!["main", "side"]
        );
        let main = &batches[0].frames["main"];
        assert_eq!(main.shape(), (6, 8, 3));
        assert_eq!(main.layout, ColorLayout::Rgb);
        assert_eq!(main.meta().unwrap()["id"], json!(7));
        assert!(batches[0].frames["side"].meta().unwrap().is_empty());

        assert_eq!(batches[1].name, "tick_001");
        assert_eq!(batches[1].frames["cam"].layout, ColorLayout::Gray);
    }

    #[test]
    fn test_top_level_files_use_root_name() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("session");
        fs::create_dir_all(&root).unwrap();
        RgbImage::new(2, 2).save(root.join("main.png")).unwrap();

        let batches = load_batches(&root).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].name, "session");
    }

    #[test]
    fn test_duplicate_topic_is_skipped() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        RgbImage::new(3, 3).save(root.join("cam.bmp")).unwrap();
        RgbImage::new(9, 9).save(root.join("cam.png")).unwrap();

        let batches = load_batches(root).unwrap();
        assert_eq!(batches[0].frames.len(), 1);
        assert_eq!(batches[0].frames["cam"].width(), 3);
    }

    #[test]
    fn test_invalid_sidecar_is_an_error() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        RgbImage::new(2, 2).save(root.join("cam.png")).unwrap();
        fs::write(root.join("cam.json"), "[1, 2]").unwrap();

        assert!(load_batches(root).is_err());
    }

    #[test]
    fn test_missing_input_root() {
        let dir = tempdir().unwrap();
        assert!(load_batches(&dir.path().join("absent")).is_err());
    }
}
