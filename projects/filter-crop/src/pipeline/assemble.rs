use crate::config::CropConfig;
use crate::pipeline::crop::Region;
use crate::pipeline::types::{Frame, FrameBatch, MAIN_TOPIC};
use indexmap::IndexMap;

/// Regions extracted per selected topic, in selection order.
pub type TopicRegions = IndexMap<String, Vec<Region>>;

/// Topic forwarded as `main`: the batch's own `main`, else its first topic.
pub fn canonical_main(batch: &FrameBatch) -> Option<&str> {
    if batch.contains_key(MAIN_TOPIC) {
        Some(MAIN_TOPIC)
    } else {
        batch.keys().next().map(String::as_str)
    }
}

/// Builds the output map of one invocation.
///
/// Every emitted frame is stamped with `skip_ocr = false` and its own key.
pub fn assemble(per_topic: TopicRegions, config: &CropConfig, batch: FrameBatch) -> FrameBatch {
    if config.mutate_original_frames {
        assemble_mutated(per_topic, batch)
    } else {
        assemble_copies(per_topic, config, batch)
    }
}

/// Copy mode: `main` plus one new frame per region.
fn assemble_copies(per_topic: TopicRegions, config: &CropConfig, mut batch: FrameBatch) -> FrameBatch {
    let Some(main_topic) = canonical_main(&batch).map(str::to_string) else {
        return FrameBatch::new();
    };

    let prefix = config.output_prefix();
    let mut derived = Vec::new();
    for (topic, regions) in per_topic {
        let Some(source) = batch.get(&topic) else {
            continue;
        };
        for region in regions {
            let key = region.output_key(prefix, &topic);
            derived.push((key, source.derive(region.image)));
        }
    }

    let mut out = FrameBatch::with_capacity(derived.len() + 1);
    if let Some(main) = batch.shift_remove(&main_topic) {
        insert_unique(&mut out, MAIN_TOPIC.to_string(), main);
    }
    for (key, frame) in derived {
        insert_unique(&mut out, key, frame);
    }

    out
}

/// Mutate mode: every input topic is forwarded, selected ones replaced by
/// their first region.
fn assemble_mutated(mut per_topic: TopicRegions, batch: FrameBatch) -> FrameBatch {
    let main_topic = canonical_main(&batch).map(str::to_string);

    let mut out = FrameBatch::with_capacity(batch.len() + 1);
    for (topic, mut frame) in batch {
        let first = per_topic
            .shift_remove(&topic)
            .and_then(|regions| regions.into_iter().next());
        if let Some(region) = first {
            frame.image = region.image;
        }
        out.insert(topic, frame);
    }

    if let Some(topic) = main_topic.filter(|t| t != MAIN_TOPIC) {
        if let Some(main) = out.get(&topic).cloned() {
            out.insert(MAIN_TOPIC.to_string(), main);
        }
    }

    for (key, frame) in out.iter_mut() {
        frame.stamp(key);
    }

    out
}

/// Inserts under `key`, or `key_2`, `key_3`, ... if taken, and stamps the
/// frame with the key actually used. A label that already looks numbered
/// (`person_2`) can be renamed too when a generated key got there first.
fn insert_unique(out: &mut FrameBatch, key: String, mut frame: Frame) {
    let key = if out.contains_key(&key) {
        let mut n = 2;
        let unique = loop {
            let candidate = format!("{}_{}", key, n);
            if !out.contains_key(&candidate) {
                break candidate;
            }
            n += 1;
        };
        tracing::debug!("Output key '{}' already taken, using '{}'", key, unique);
        unique
    } else {
        key
    };

    frame.stamp(&key);
    out.insert(key, frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::pipeline::crop::extract;
    use crate::pipeline::types::{ColorLayout, SKIP_OCR_FLAG, TOPIC_FIELD};
    use image::{DynamicImage, RgbImage};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    const SQUARE: &str = "[[(100, 100), (200, 100), (200, 200), (100, 200)]]";

    fn frame(meta: Value) -> Frame {
        Frame::new(
            DynamicImage::ImageRgb8(RgbImage::new(500, 500)),
            json!({ "meta": meta }),
            ColorLayout::Bgr,
        )
    }

    fn config(raw: RawConfig) -> CropConfig {
        raw.normalize(&HashMap::<String, String>::new()).unwrap()
    }

    fn run(config: &CropConfig, batch: FrameBatch, topics: &[&str]) -> FrameBatch {
        let per_topic = topics
            .iter()
            .map(|t| (t.to_string(), extract(&batch[*t], config)))
            .collect();
        assemble(per_topic, config, batch)
    }

    fn assert_stamped(out: &FrameBatch) {
        for (key, frame) in out {
            let meta = frame.meta().unwrap();
            assert_eq!(meta[SKIP_OCR_FLAG], json!(false), "{key}");
            assert_eq!(meta[TOPIC_FIELD], json!(key), "{key}");
        }
    }

    #[test]
    fn test_canonical_main() {
        let mut batch = FrameBatch::new();
        assert_eq!(canonical_main(&batch), None);
        batch.insert("cam2".to_string(), frame(json!({})));
        batch.insert("cam1".to_string(), frame(json!({})));
        assert_eq!(canonical_main(&batch), Some("cam2"));
        batch.insert("main".to_string(), frame(json!({})));
        assert_eq!(canonical_main(&batch), Some("main"));
    }

    #[test]
    fn test_copy_mode_polygon() {
        let cfg = config(
            RawConfig::new()
                .with("polygon_points", SQUARE)
                .with("output_prefix", "test_"),
        );
        let mut batch = FrameBatch::new();
        batch.insert("test".to_string(), frame(json!({"id": 1})));

        let out = run(&cfg, batch, &["test"]);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["main", "test_test"]);
        assert_eq!(out["main"].shape(), (500, 500, 3));
        assert_eq!(out["test_test"].shape(), (101, 101, 3));
        assert_eq!(out["test_test"].meta().unwrap()["id"], json!(1));
        assert_stamped(&out);
    }

    #[test]
    fn test_copy_mode_detection_keys_unprefixed() {
        let cfg = config(
            RawConfig::new()
                .with("polygon_points", SQUARE)
                .with("output_prefix", "test_"),
        );
        let mut batch = FrameBatch::new();
        batch.insert(
            "test".to_string(),
            frame(json!({"detections": [{"class": "person", "rois": [[50, 50, 150, 150], [200, 200, 300, 300]]}]})),
        );

        let out = run(&cfg, batch, &["test"]);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["main", "person", "person_2"]);
        assert_eq!(out["person"].shape(), (100, 100, 3));
        assert_eq!(out["person_2"].shape(), (100, 100, 3));
        assert_stamped(&out);
    }

    #[test]
    fn test_copy_mode_collisions_get_suffixes() {
        let cfg = config(RawConfig::new().with("output_prefix", ""));
        let dets = json!({"detections": [{"class": "person", "rois": [[0, 0, 10, 10]]}]});
        let mut batch = FrameBatch::new();
        batch.insert("topic1".to_string(), frame(dets.clone()));
        batch.insert("topic2".to_string(), frame(dets));

        let out = run(&cfg, batch, &["topic1", "topic2"]);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["main", "person", "person_2"]);
        assert_stamped(&out);
    }

    #[test]
    fn test_numbered_label_renamed_after_generated_key() {
        let cfg = config(RawConfig::new().with("output_prefix", ""));
        let mut batch = FrameBatch::new();
        batch.insert(
            "cam".to_string(),
            frame(json!({"detections": [
                {"class": "person", "rois": [[0, 0, 10, 10], [0, 0, 20, 20]]},
                {"class": "person_2", "rois": [[0, 0, 30, 30]]}
            ]})),
        );

        let out = run(&cfg, batch, &["cam"]);
        assert_eq!(
            out.keys().collect::<Vec<_>>(),
            vec!["main", "person", "person_2", "person_2_2"]
        );
        assert_eq!(out["person_2"].shape(), (20, 20, 3));
        assert_eq!(out["person_2_2"].shape(), (30, 30, 3));
        assert_stamped(&out);
    }

    #[test]
    fn test_copy_mode_main_is_not_overwritten() {
        let cfg = config(
            RawConfig::new()
                .with("polygon_points", SQUARE)
                .with("output_prefix", ""),
        );
        let mut batch = FrameBatch::new();
        batch.insert("main".to_string(), frame(json!({})));

        let out = run(&cfg, batch, &["main"]);
        assert_eq!(out["main"].shape(), (500, 500, 3));
        assert_eq!(out["main_2"].shape(), (101, 101, 3));
        assert_stamped(&out);
    }

    #[test]
    fn test_copy_mode_drops_unselected_topics() {
        let cfg = config(
            RawConfig::new()
                .with("polygon_points", SQUARE)
                .with("output_prefix", "cropped_"),
        );
        let mut batch = FrameBatch::new();
        batch.insert("main".to_string(), frame(json!({})));
        batch.insert("secondary".to_string(), frame(json!({})));

        let out = run(&cfg, batch, &["main"]);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["main", "cropped_main"]);
    }

    #[test]
    fn test_empty_batch() {
        let cfg = config(RawConfig::new().with("output_prefix", "x_"));
        assert!(assemble(TopicRegions::new(), &cfg, FrameBatch::new()).is_empty());
    }

    #[test]
    fn test_mutate_mode() {
        let cfg = config(
            RawConfig::new()
                .with("polygon_points", SQUARE)
                .with("mutate_original_frames", true),
        );
        let mut batch = FrameBatch::new();
        batch.insert("test".to_string(), frame(json!({"id": 1})));
        batch.insert("other".to_string(), frame(json!({"id": 2})));

        let out = run(&cfg, batch, &["test"]);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["test", "other", "main"]);
        assert_eq!(out["test"].shape(), (101, 101, 3));
        assert_eq!(out["other"].shape(), (500, 500, 3));
        assert_eq!(out["main"].shape(), (101, 101, 3));
        assert_stamped(&out);
    }

    #[test]
    fn test_mutate_mode_uses_first_region_only() {
        let cfg = config(RawConfig::new().with("mutate_original_frames", "true"));
        let mut batch = FrameBatch::new();
        batch.insert(
            "main".to_string(),
            frame(json!({"detections": [{"class": "person", "rois": [[0, 0, 30, 20], [0, 0, 5, 5]]}]})),
        );

        let out = run(&cfg, batch, &["main"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out["main"].shape(), (20, 30, 3));
        assert_stamped(&out);
    }
}
