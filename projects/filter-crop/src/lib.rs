//! Crop stage for streaming video pipelines.
//!
//! Each invocation receives a batch of named frames and republishes
//! sub-regions of them, cut either from a configured polygon or from
//! detections an upstream stage stored in the frame metadata.

pub mod config;
pub mod pipeline;
pub mod stage;

pub use config::{ConfigError, CropConfig, EnvSource, ProcessEnv, RawConfig, TopicMode};
pub use pipeline::types::{ColorLayout, Frame, FrameBatch};
pub use stage::{FilterCrop, FrameFilter};
