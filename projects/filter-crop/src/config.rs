//! Stage configuration.
//!
//! Raw configuration arrives as a loosely typed mapping (often every value is
//! a string). [`RawConfig::normalize`] merges it with `FILTER_*` environment
//! overrides and built-in defaults and produces an immutable [`CropConfig`].
//!
//! Precedence, highest first:
//! 1. Explicit raw values (`null` counts as absent)
//! 2. Environment variables, `FILTER_<FIELD>`
//! 3. Defaults

use crate::pipeline::types::{Ring, MAIN_TOPIC};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ENV_PREFIX: &str = "FILTER_";

pub const DEFAULT_DETECTION_KEY: &str = "detections";
pub const DEFAULT_DETECTION_CLASS_FIELD: &str = "class";
pub const DEFAULT_DETECTION_ROI_FIELD: &str = "rois";
/// Output name / class label used when neither data nor config provides one.
pub const DEFAULT_CLASS_NAME: &str = "crop";

const POLYGON_POINTS: &str = "polygon_points";
const OUTPUT_PREFIX: &str = "output_prefix";
const MUTATE_ORIGINAL_FRAMES: &str = "mutate_original_frames";
const TOPIC_MODE: &str = "topic_mode";
const TOPICS: &str = "topics";
const DETECTION_KEY: &str = "detection_key";
const DETECTION_CLASS_FIELD: &str = "detection_class_field";
const DETECTION_ROI_FIELD: &str = "detection_roi_field";
const CUSTOM_NAME: &str = "custom_name";
const CLASS_NAME: &str = "class_name";
const CROP_FROM_ENV: &str = "crop_from_env";
const CROPPED_FRAME_PREFIX: &str = "cropped_frame_prefix";

const KNOWN_FIELDS: [&str; 12] = [
    POLYGON_POINTS,
    OUTPUT_PREFIX,
    MUTATE_ORIGINAL_FRAMES,
    TOPIC_MODE,
    TOPICS,
    DETECTION_KEY,
    DETECTION_CLASS_FIELD,
    DETECTION_ROI_FIELD,
    CUSTOM_NAME,
    CLASS_NAME,
    CROP_FROM_ENV,
    CROPPED_FRAME_PREFIX,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Polygon must have at least three vertices")]
    PolygonTooFewVertices,
    #[error("invalid polygon_points: {0}")]
    InvalidPolygon(String),
    #[error("output_prefix is required unless mutate_original_frames is true")]
    MissingOutputPrefix,
    #[error("topics must be non-empty when topic_mode is 'selected'")]
    MissingTopics,
    #[error("invalid topic_mode {0:?}, expected one of: all, main_only, selected")]
    InvalidTopicMode(String),
    #[error("{field} expects a boolean, got {value}")]
    InvalidBool { field: &'static str, value: String },
    #[error("{field} expects {expected}, got {value}")]
    InvalidValue {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which input topics participate in extraction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopicMode {
    #[default]
    All,
    MainOnly,
    Selected,
}

impl TopicMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicMode::All => "all",
            TopicMode::MainOnly => "main_only",
            TopicMode::Selected => "selected",
        }
    }
}

impl fmt::Display for TopicMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(TopicMode::All),
            "main_only" => Ok(TopicMode::MainOnly),
            "selected" => Ok(TopicMode::Selected),
            _ => Err(ConfigError::InvalidTopicMode(s.to_string())),
        }
    }
}

/// Source of `FILTER_*` overrides. Injected so normalization never has to
/// touch the real process environment in tests.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads overrides from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Environment variable name overriding `field`.
pub fn env_key(field: &str) -> String {
    format!("{}{}", ENV_PREFIX, field.to_ascii_uppercase())
}

/// Unvalidated configuration as handed over by the host runtime.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct RawConfig(Map<String, Value>);

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`RawConfig::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Explicitly present, non-null value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Validates and type-converts this configuration.
    pub fn normalize(&self, env: &dyn EnvSource) -> ConfigResult<CropConfig> {
        let resolver = Resolver { raw: self, env };

        // Polygon errors win over every other validation failure.
        let polygon_points = match resolver.value(POLYGON_POINTS) {
            Some(v) => parse_polygon(&v)?,
            None => None,
        };

        let mutate_original_frames = resolver
            .value(MUTATE_ORIGINAL_FRAMES)
            .map(|v| parse_bool(MUTATE_ORIGINAL_FRAMES, &v))
            .transpose()?
            .unwrap_or(false);
        let crop_from_env = resolver
            .value(CROP_FROM_ENV)
            .map(|v| parse_bool(CROP_FROM_ENV, &v))
            .transpose()?
            .unwrap_or(false);

        let cropped_frame_prefix = resolver.string(CROPPED_FRAME_PREFIX)?;
        let output_prefix = match self.get(OUTPUT_PREFIX) {
            Some(v) => Some(parse_string(OUTPUT_PREFIX, v)?),
            None => match self.get(CROPPED_FRAME_PREFIX) {
                Some(v) => Some(parse_string(CROPPED_FRAME_PREFIX, v)?),
                None => resolver.string(OUTPUT_PREFIX)?.or_else(|| cropped_frame_prefix.clone()),
            },
        };
        if !mutate_original_frames && output_prefix.is_none() {
            return Err(ConfigError::MissingOutputPrefix);
        }

        let topic_mode = match resolver.value(TOPIC_MODE) {
            Some(v) => parse_string(TOPIC_MODE, &v)?.parse::<TopicMode>()?,
            None => TopicMode::default(),
        };
        let topics = resolver
            .value(TOPICS)
            .map(|v| parse_topics(&v))
            .transpose()?
            .unwrap_or_default();
        let topics = match (topic_mode, topics.is_empty()) {
            (TopicMode::Selected, true) => return Err(ConfigError::MissingTopics),
            (_, true) => vec![MAIN_TOPIC.to_string()],
            (_, false) => topics,
        };

        let extra = self
            .0
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(CropConfig {
            polygon_points,
            output_prefix,
            mutate_original_frames,
            topic_mode,
            topics,
            detection_key: resolver
                .string(DETECTION_KEY)?
                .unwrap_or_else(|| DEFAULT_DETECTION_KEY.to_string()),
            detection_class_field: resolver
                .string(DETECTION_CLASS_FIELD)?
                .unwrap_or_else(|| DEFAULT_DETECTION_CLASS_FIELD.to_string()),
            detection_roi_field: resolver
                .string(DETECTION_ROI_FIELD)?
                .unwrap_or_else(|| DEFAULT_DETECTION_ROI_FIELD.to_string()),
            custom_name: resolver.string(CUSTOM_NAME)?,
            class_name: resolver.string(CLASS_NAME)?,
            crop_from_env,
            cropped_frame_prefix,
            extra,
        })
    }
}

impl From<Map<String, Value>> for RawConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RawConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

struct Resolver<'a> {
    raw: &'a RawConfig,
    env: &'a dyn EnvSource,
}

impl Resolver<'_> {
    fn value(&self, field: &str) -> Option<Cow<'_, Value>> {
        self.raw
            .get(field)
            .map(Cow::Borrowed)
            .or_else(|| self.env.var(&env_key(field)).map(|v| Cow::Owned(Value::String(v))))
    }

    fn string(&self, field: &'static str) -> ConfigResult<Option<String>> {
        self.value(field).map(|v| parse_string(field, &v)).transpose()
    }
}

/// Validated stage configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CropConfig {
    /// `None` disables polygon mode.
    pub polygon_points: Option<Vec<Ring>>,
    pub output_prefix: Option<String>,
    pub mutate_original_frames: bool,
    pub topic_mode: TopicMode,
    pub topics: Vec<String>,
    pub detection_key: String,
    pub detection_class_field: String,
    pub detection_roi_field: String,
    pub custom_name: Option<String>,
    pub class_name: Option<String>,
    pub crop_from_env: bool,
    pub cropped_frame_prefix: Option<String>,
    /// Keys this stage does not know, kept for the surrounding runtime.
    pub extra: BTreeMap<String, Value>,
}

impl CropConfig {
    pub fn output_prefix(&self) -> &str {
        self.output_prefix.as_deref().unwrap_or_default()
    }

    /// Raw form of this configuration; normalizing it yields `self` again.
    pub fn to_raw(&self) -> RawConfig {
        let mut raw: RawConfig = self.extra.clone().into_iter().collect();

        if let Some(rings) = &self.polygon_points {
            let rings: Vec<Value> = rings
                .iter()
                .map(|ring| {
                    Value::Array(
                        ring.iter()
                            .map(|&(x, y)| Value::Array(vec![x.into(), y.into()]))
                            .collect(),
                    )
                })
                .collect();
            raw.set(POLYGON_POINTS, rings);
        }
        if let Some(prefix) = &self.output_prefix {
            raw.set(OUTPUT_PREFIX, prefix.as_str());
        }
        raw.set(MUTATE_ORIGINAL_FRAMES, self.mutate_original_frames);
        raw.set(TOPIC_MODE, self.topic_mode.as_str());
        raw.set(TOPICS, self.topics.clone());
        raw.set(DETECTION_KEY, self.detection_key.as_str());
        raw.set(DETECTION_CLASS_FIELD, self.detection_class_field.as_str());
        raw.set(DETECTION_ROI_FIELD, self.detection_roi_field.as_str());
        if let Some(name) = &self.custom_name {
            raw.set(CUSTOM_NAME, name.as_str());
        }
        if let Some(name) = &self.class_name {
            raw.set(CLASS_NAME, name.as_str());
        }
        raw.set(CROP_FROM_ENV, self.crop_from_env);
        if let Some(prefix) = &self.cropped_frame_prefix {
            raw.set(CROPPED_FRAME_PREFIX, prefix.as_str());
        }

        raw
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

fn parse_bool(field: &'static str, value: &Value) -> ConfigResult<bool> {
    let invalid = || ConfigError::InvalidBool {
        field,
        value: describe(value),
    };
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

fn parse_string(field: &'static str, value: &Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConfigError::InvalidValue {
            field,
            expected: "a string",
            value: describe(other),
        }),
    }
}

fn parse_topics(value: &Value) -> ConfigResult<Vec<String>> {
    let invalid = || ConfigError::InvalidValue {
        field: TOPICS,
        expected: "a list of topic names",
        value: describe(value),
    };

    let names: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect::<ConfigResult<_>>()?,
        Value::String(s) if s.trim_start().starts_with('[') => {
            serde_json::from_str(s).map_err(|_| invalid())?
        }
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => return Err(invalid()),
    };

    let mut topics: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if !name.is_empty() && !topics.iter().any(|t| t == name) {
            topics.push(name.to_string());
        }
    }
    Ok(topics)
}

/// Parses polygon rings from structured JSON or their textual form.
///
/// Text may use tuples (`[[(1, 2), (3, 4), (5, 6)]]`) or lists. A single
/// un-nested ring is accepted as one ring. An empty list disables polygon
/// mode.
fn parse_polygon(value: &Value) -> ConfigResult<Option<Vec<Ring>>> {
    let parsed;
    let value = match value {
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return Ok(None);
            }
            let text = text.replace('(', "[").replace(')', "]");
            parsed = serde_json::from_str::<Value>(&text)
                .map_err(|e| ConfigError::InvalidPolygon(e.to_string()))?;
            &parsed
        }
        other => other,
    };

    let Value::Array(items) = value else {
        return Err(ConfigError::InvalidPolygon(
            "expected a list of rings".to_string(),
        ));
    };
    if items.is_empty() {
        return Ok(None);
    }

    let single_ring = items
        .first()
        .and_then(Value::as_array)
        .and_then(|first| first.first())
        .is_some_and(Value::is_number);

    let rings = if single_ring {
        vec![parse_ring(items)?]
    } else {
        items
            .iter()
            .map(|ring| match ring {
                Value::Array(points) => parse_ring(points),
                _ => Err(ConfigError::InvalidPolygon(
                    "each ring must be a list of vertices".to_string(),
                )),
            })
            .collect::<ConfigResult<Vec<_>>>()?
    };

    Ok(Some(rings))
}

fn parse_ring(points: &[Value]) -> ConfigResult<Ring> {
    let ring = points
        .iter()
        .map(parse_vertex)
        .collect::<ConfigResult<Ring>>()?;
    if ring.len() < 3 {
        return Err(ConfigError::PolygonTooFewVertices);
    }
    Ok(ring)
}

fn parse_vertex(point: &Value) -> ConfigResult<(i32, i32)> {
    let invalid = || ConfigError::InvalidPolygon(format!("bad vertex {}", point));
    match point.as_array().map(Vec::as_slice) {
        Some([x, y]) => Ok((
            parse_coordinate(x).ok_or_else(invalid)?,
            parse_coordinate(y).ok_or_else(invalid)?,
        )),
        _ => Err(invalid()),
    }
}

fn parse_coordinate(value: &Value) -> Option<i32> {
    if let Some(v) = value.as_i64() {
        return i32::try_from(v).ok();
    }
    let v = value.as_f64()?.round();
    (v.is_finite() && v >= i32::MIN as f64 && v <= i32::MAX as f64).then_some(v as i32)
}
