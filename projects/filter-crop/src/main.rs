mod cli;
mod ingest;
mod run_context;

use anyhow::{Context, Result};
use cli::Args;
use crossbeam::channel;
use filter_crop::config::{ProcessEnv, RawConfig};
use filter_crop::pipeline::worker::{batch_worker, InputBatch, OutputBatch};
use filter_crop::stage::{FilterCrop, FrameFilter};
use indicatif::{ProgressBar, ProgressStyle};
use run_context::RunContext;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

fn load_raw_config(path: Option<&Path>, overrides: &[(String, String)]) -> Result<RawConfig> {
    let mut raw = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<RawConfig>(&content)
                .with_context(|| format!("Config {} must be a JSON object", path.display()))?
        }
        None => RawConfig::new(),
    };

    for (key, value) in overrides {
        raw.set(key.as_str(), value.as_str());
    }
    Ok(raw)
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let raw = load_raw_config(args.config.as_deref(), &args.overrides)?;
    let config = FilterCrop::normalize_config(&raw, &ProcessEnv).context("Invalid configuration")?;
    let filter = Arc::new(FilterCrop::setup(config));

    let batches = ingest::load_batches(&args.input)?;
    tracing::info!(
        "Loaded {} batches from {}",
        batches.len(),
        args.input.display()
    );

    let mut run = RunContext::create(&args.output, &args.input, filter.config().to_raw())?;

    let (tx_in, rx_in) = channel::bounded::<InputBatch>(args.workers * 2);
    let (tx_out, rx_out) = channel::unbounded::<OutputBatch>();

    let handles: Vec<_> = (0..args.workers)
        .map(|_| {
            let (rx, tx, filter) = (rx_in.clone(), tx_out.clone(), filter.clone());
            thread::spawn(move || batch_worker(rx, tx, filter))
        })
        .collect();
    drop(rx_in);
    drop(tx_out);

    let total = batches.len();
    let feeder = thread::spawn(move || {
        for batch in batches {
            if tx_in.send(batch).is_err() {
                tracing::error!("All crop workers exited early");
                break;
            }
        }
    });

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")?
            .progress_chars("#>-"),
    );

    for batch in rx_out {
        tracing::debug!(
            "Batch {} ({}) -> {} outputs in {:.2}ms",
            batch.id,
            batch.name,
            batch.frames.len(),
            batch.duration_ms
        );
        run.write_batch(batch)?;
        pb.inc(1);
    }
    pb.finish();

    if feeder.join().is_err() {
        tracing::error!("Batch feeder panicked");
    }
    let mut processed = 0;
    for handle in handles {
        match handle.join() {
            Ok(count) => processed += count,
            Err(_) => tracing::error!("Crop worker panicked"),
        }
    }

    let manifest = run.finish()?;
    tracing::info!(
        "Run {} complete: {}/{} batches written to {}",
        manifest.run_id,
        processed,
        total,
        args.output.display()
    );

    match Arc::try_unwrap(filter) {
        Ok(mut filter) => filter.shutdown(),
        Err(_) => tracing::warn!("Crop stage still shared at shutdown"),
    }

    Ok(())
}
