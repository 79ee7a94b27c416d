use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory of input frames; each subdirectory is one batch
    #[arg(long, env = "FILTER_CROP_INPUT")]
    pub input: PathBuf,

    /// Directory receiving cropped frames
    #[arg(long, env = "FILTER_CROP_OUTPUT")]
    pub output: PathBuf,

    /// JSON file with the stage configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Configuration override as key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub overrides: Vec<(String, String)>,

    /// Number of crop workers
    #[arg(long, default_value_t = 2, value_parser = parse_workers)]
    pub workers: usize,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn parse_key_value(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_workers(s: &str) -> Result<usize> {
    let workers: usize = s
        .trim()
        .parse()
        .map_err(|_| anyhow!("expected a worker count, got '{}'", s))?;
    if workers == 0 {
        return Err(anyhow!("at least one worker is required"));
    }
    Ok(workers)
}
