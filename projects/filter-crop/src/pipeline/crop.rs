use crate::config::{CropConfig, DEFAULT_CLASS_NAME};
use crate::pipeline::geometry::{clip_to_frame, crop_region, full_frame, polygon_bounds};
use crate::pipeline::types::{BBox, Frame};
use image::DynamicImage;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Where a frame's regions come from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionSource<'a> {
    /// The configured polygon. `forced` is set when `crop_from_env` chose
    /// this mode regardless of detections.
    Polygon { forced: bool },
    /// Non-empty detection records from the frame's metadata.
    Detection(&'a [Value]),
}

impl<'a> RegionSource<'a> {
    /// Detections are used when present and non-empty, unless
    /// `crop_from_env` forces polygon mode.
    pub fn select(frame: &'a Frame, config: &CropConfig) -> Self {
        if config.crop_from_env {
            return RegionSource::Polygon { forced: true };
        }
        match frame.detections(&config.detection_key) {
            Some(records) if !records.is_empty() => RegionSource::Detection(records),
            _ => RegionSource::Polygon { forced: false },
        }
    }
}

/// How an extracted region is named in the output map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionName {
    /// Polygon crop without an explicit name: `{prefix}{topic}`.
    Topic,
    /// Polygon crop with a configured name: `{prefix}{name}`.
    Named(String),
    /// Detection crop, published under its label as-is.
    Detection(String),
}

/// A cropped sub-image and the name it is published under.
#[derive(Debug, Clone)]
pub struct Region {
    pub name: RegionName,
    pub bbox: BBox,
    pub image: DynamicImage,
}

impl Region {
    /// Output key for this region when cropped from `topic`.
    pub fn output_key(&self, prefix: &str, topic: &str) -> String {
        match &self.name {
            RegionName::Topic => format!("{}{}", prefix, topic),
            RegionName::Named(name) => format!("{}{}", prefix, name),
            RegionName::Detection(name) => name.clone(),
        }
    }
}

/// Extracts every region of `frame`, in output order.
pub fn extract(frame: &Frame, config: &CropConfig) -> Vec<Region> {
    match RegionSource::select(frame, config) {
        RegionSource::Polygon { forced } => extract_polygon(frame, config, forced)
            .into_iter()
            .collect(),
        RegionSource::Detection(records) => extract_detections(frame, config, records),
    }
}

fn non_empty(name: Option<&String>) -> Option<&String> {
    name.filter(|n| !n.is_empty())
}

fn extract_polygon(frame: &Frame, config: &CropConfig, forced: bool) -> Option<Region> {
    let (width, height) = (frame.width(), frame.height());

    let bbox = match config.polygon_points.as_deref() {
        Some(rings) => polygon_bounds(rings).and_then(|b| clip_to_frame(b, width, height)),
        None if forced => full_frame(width, height),
        None => return None,
    };
    let Some(bbox) = bbox else {
        tracing::warn!(
            "Polygon region lies outside the {}x{} frame, skipping",
            width,
            height
        );
        return None;
    };

    let name = match non_empty(config.custom_name.as_ref())
        .or_else(|| non_empty(config.class_name.as_ref()))
    {
        Some(name) => RegionName::Named(name.clone()),
        None if forced => RegionName::Named(DEFAULT_CLASS_NAME.to_string()),
        None => RegionName::Topic,
    };

    Some(Region {
        name,
        bbox,
        image: crop_region(&frame.image, &bbox),
    })
}

fn extract_detections(frame: &Frame, config: &CropConfig, records: &[Value]) -> Vec<Region> {
    let (width, height) = (frame.width(), frame.height());
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut regions = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        let Some(record) = record.as_object() else {
            tracing::warn!("Detection {} is not a mapping, skipping", idx);
            continue;
        };
        let Some(rois) = record.get(&config.detection_roi_field) else {
            tracing::debug!(
                "Detection {} has no '{}' field",
                idx,
                config.detection_roi_field
            );
            continue;
        };
        let label = detection_label(record, config);

        for roi in roi_list(rois) {
            let Some(bbox) = parse_roi(roi).and_then(|b| clip_to_frame(b, width, height)) else {
                tracing::warn!(
                    "Skipping invalid region {} for '{}' in detection {}",
                    roi,
                    label,
                    idx
                );
                continue;
            };

            let count = seen.entry(label.clone()).or_insert(0);
            *count += 1;
            let name = if *count == 1 {
                label.clone()
            } else {
                format!("{}_{}", label, count)
            };

            regions.push(Region {
                name: RegionName::Detection(name),
                bbox,
                image: crop_region(&frame.image, &bbox),
            });
        }
    }

    regions
}

/// Class label of a detection, falling back to `class_name` and then the
/// default class token when absent or empty.
fn detection_label(record: &Map<String, Value>, config: &CropConfig) -> String {
    let from_data = match record.get(&config.detection_class_field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    from_data
        .or_else(|| non_empty(config.class_name.as_ref()).cloned())
        .unwrap_or_else(|| DEFAULT_CLASS_NAME.to_string())
}

/// Rectangles of a regions field; a bare `[x1, y1, x2, y2]` counts as one.
fn roi_list(rois: &Value) -> Vec<&Value> {
    match rois {
        Value::Array(items) if items.first().is_some_and(Value::is_number) => vec![rois],
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// `[x1, y1, x2, y2]` with numeric entries; fractional pixels truncate.
fn parse_roi(roi: &Value) -> Option<[i64; 4]> {
    let coords = roi.as_array()?;
    if coords.len() != 4 {
        return None;
    }

    let mut out = [0i64; 4];
    for (slot, value) in out.iter_mut().zip(coords) {
        let v = value.as_f64()?;
        if !v.is_finite() {
            return None;
        }
        *slot = v as i64;
    }
    Some(out)
}
