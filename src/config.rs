//! Engine configuration.
//!
//! Values come from an optional JSON config file (named by
//! `CUSTODY_CONFIG`), then environment overrides, then validation. The core
//! components consume the validated values only; no parsing logic leaks past
//! this module.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_LEDGER_PATH: &str = "custody_ledger.csv";
const DEFAULT_SHARPNESS_THRESHOLD: f64 = 5.0;
const DEFAULT_BRIGHTNESS_RATIO_THRESHOLD: f64 = 0.05;
const DEFAULT_PERSISTENCE_SAMPLES: u32 = 3;
const DEFAULT_GAP_FRAMES: u64 = 30;
const DEFAULT_MATCH_TOLERANCE: f64 = 0.5;
const DEFAULT_SAMPLE_STRIDE: u64 = 8;

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    ledger_path: Option<String>,
    signing_seed_path: Option<PathBuf>,
    tamper: Option<TamperConfigFile>,
    aggregation: Option<AggregationConfigFile>,
    sample_stride: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TamperConfigFile {
    sharpness_threshold: Option<f64>,
    brightness_ratio_threshold: Option<f64>,
    persistence_samples: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregationConfigFile {
    gap_frames: Option<u64>,
    match_tolerance: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ledger_path: String,
    /// Seed file for the persistent signing identity; `None` means an
    /// ephemeral identity is generated per run.
    pub signing_seed_path: Option<PathBuf>,
    pub sharpness_threshold: f64,
    pub brightness_ratio_threshold: f64,
    pub persistence_samples: u32,
    pub gap_frames: u64,
    pub match_tolerance: f64,
    /// Frame sub-sampling stride for metric and detector queries.
    pub sample_stride: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_path: DEFAULT_LEDGER_PATH.to_string(),
            signing_seed_path: None,
            sharpness_threshold: DEFAULT_SHARPNESS_THRESHOLD,
            brightness_ratio_threshold: DEFAULT_BRIGHTNESS_RATIO_THRESHOLD,
            persistence_samples: DEFAULT_PERSISTENCE_SAMPLES,
            gap_frames: DEFAULT_GAP_FRAMES,
            match_tolerance: DEFAULT_MATCH_TOLERANCE,
            sample_stride: DEFAULT_SAMPLE_STRIDE,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CUSTODY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let tamper = file.tamper.unwrap_or_default();
        let aggregation = file.aggregation.unwrap_or_default();
        Self {
            ledger_path: file
                .ledger_path
                .unwrap_or_else(|| DEFAULT_LEDGER_PATH.to_string()),
            signing_seed_path: file.signing_seed_path,
            sharpness_threshold: tamper
                .sharpness_threshold
                .unwrap_or(DEFAULT_SHARPNESS_THRESHOLD),
            brightness_ratio_threshold: tamper
                .brightness_ratio_threshold
                .unwrap_or(DEFAULT_BRIGHTNESS_RATIO_THRESHOLD),
            persistence_samples: tamper
                .persistence_samples
                .unwrap_or(DEFAULT_PERSISTENCE_SAMPLES),
            gap_frames: aggregation.gap_frames.unwrap_or(DEFAULT_GAP_FRAMES),
            match_tolerance: aggregation
                .match_tolerance
                .unwrap_or(DEFAULT_MATCH_TOLERANCE),
            sample_stride: file.sample_stride.unwrap_or(DEFAULT_SAMPLE_STRIDE),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CUSTODY_LEDGER_PATH") {
            if !path.trim().is_empty() {
                self.ledger_path = path;
            }
        }
        if let Ok(path) = std::env::var("CUSTODY_SIGNING_SEED_PATH") {
            if !path.trim().is_empty() {
                self.signing_seed_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(value) = std::env::var("CUSTODY_PERSISTENCE_SAMPLES") {
            self.persistence_samples = value
                .parse()
                .map_err(|_| anyhow!("CUSTODY_PERSISTENCE_SAMPLES must be an integer"))?;
        }
        if let Ok(value) = std::env::var("CUSTODY_GAP_FRAMES") {
            self.gap_frames = value
                .parse()
                .map_err(|_| anyhow!("CUSTODY_GAP_FRAMES must be an integer"))?;
        }
        if let Ok(value) = std::env::var("CUSTODY_SAMPLE_STRIDE") {
            self.sample_stride = value
                .parse()
                .map_err(|_| anyhow!("CUSTODY_SAMPLE_STRIDE must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.ledger_path.trim().is_empty() {
            return Err(anyhow!("ledger_path must not be empty"));
        }
        if self.sharpness_threshold <= 0.0 {
            return Err(anyhow!("sharpness_threshold must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.brightness_ratio_threshold)
            || self.brightness_ratio_threshold == 0.0
        {
            return Err(anyhow!(
                "brightness_ratio_threshold must be in (0, 1]"
            ));
        }
        if self.persistence_samples == 0 {
            return Err(anyhow!("persistence_samples must be at least 1"));
        }
        if self.match_tolerance <= 0.0 {
            return Err(anyhow!("match_tolerance must be greater than zero"));
        }
        if self.sample_stride == 0 {
            return Err(anyhow!("sample_stride must be at least 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
