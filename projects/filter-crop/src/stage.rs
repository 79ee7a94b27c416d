use crate::config::{ConfigResult, CropConfig, EnvSource, RawConfig};
use crate::pipeline::assemble::{assemble, TopicRegions};
use crate::pipeline::crop::extract;
use crate::pipeline::topics::select_topics;
use crate::pipeline::types::FrameBatch;
use std::time::Instant;

/// A pipeline stage invoked once per batch between `setup` and `shutdown`.
/// This separates "what the stage does to a batch" from "how batches are
/// delivered".
pub trait FrameFilter: Sized {
    type Config;

    fn normalize_config(raw: &RawConfig, env: &dyn EnvSource) -> ConfigResult<Self::Config>;

    fn setup(config: Self::Config) -> Self;

    /// Transforms one batch. Takes `&self` so one instance can serve several
    /// workers at once.
    fn process(&self, batch: FrameBatch) -> FrameBatch;

    fn shutdown(&mut self) {}
}

/// Crops polygon or detection regions out of incoming frames.
#[derive(Debug, Clone)]
pub struct FilterCrop {
    config: CropConfig,
}

impl FilterCrop {
    pub fn config(&self) -> &CropConfig {
        &self.config
    }
}

impl FrameFilter for FilterCrop {
    type Config = CropConfig;

    fn normalize_config(raw: &RawConfig, env: &dyn EnvSource) -> ConfigResult<CropConfig> {
        raw.normalize(env)
    }

    fn setup(config: CropConfig) -> Self {
        tracing::info!(
            "FilterCrop: topic_mode={}, mutate={}, polygon_rings={}, output_prefix={:?}",
            config.topic_mode,
            config.mutate_original_frames,
            config.polygon_points.as_ref().map_or(0, Vec::len),
            config.output_prefix
        );
        if !config.extra.is_empty() {
            tracing::debug!(
                "FilterCrop: ignoring unrecognized options {:?}",
                config.extra.keys().collect::<Vec<_>>()
            );
        }
        Self { config }
    }

    fn process(&self, batch: FrameBatch) -> FrameBatch {
        let start_inst = Instant::now();
        let input_count = batch.len();

        let present: Vec<&str> = batch.keys().map(String::as_str).collect();
        let selected = select_topics(self.config.topic_mode, &self.config.topics, &present);

        let mut per_topic = TopicRegions::with_capacity(selected.len());
        for topic in selected {
            if let Some(frame) = batch.get(&topic) {
                let regions = extract(frame, &self.config);
                per_topic.insert(topic, regions);
            }
        }
        let region_count: usize = per_topic.values().map(Vec::len).sum();

        let out = assemble(per_topic, &self.config, batch);

        tracing::debug!(
            "FilterCrop: {} inputs -> {} regions -> {} outputs in {:.2}ms",
            input_count,
            region_count,
            out.len(),
            start_inst.elapsed().as_secs_f64() * 1000.0
        );
        out
    }

    fn shutdown(&mut self) {
        tracing::info!("FilterCrop: shutdown");
    }
}
