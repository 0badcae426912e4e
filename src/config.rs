//! Runtime Configuration - Explicit Tunables
//!
//! Every threshold an operator may want to move lives here, loaded once at
//! startup. Confidence cutoffs are deliberately config values, not constants.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub intake: IntakeConfig,
    pub resolver: ResolverConfig,
    pub scheduler: SchedulerConfig,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntakeConfig {
    /// Files below this byte count are rejected as `TooSmall`.
    pub min_file_size_bytes: u64,
    /// Files above this byte count are rejected as `TooLarge`.
    pub max_file_size_bytes: u64,
    /// Minimum pixel count on the longest decoded side.
    pub min_resolution: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    /// Mappings scoring below this always require manual review.
    pub review_threshold: f64,
    /// Score for a numbered-variant match with one stripped suffix layer.
    pub variant_base_confidence: f64,
    /// Deduction per additional stripped suffix layer.
    pub variant_step: f64,
    /// Variant scores never fall below this.
    pub variant_floor: f64,
    /// Score for interchange-alias matches. Must stay below the variant
    /// floor so tier ordering is reflected in confidence ordering.
    pub alias_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub scan_interval_seconds: u64,
    /// Worker threads consuming the discovery queue.
    pub worker_count: usize,
    /// Render pool size; 0 means one thread per core.
    pub render_pool_size: usize,
    /// Timeout for one background-removal call.
    pub background_removal_timeout_seconds: u64,
    pub background_removal_model: String,
    /// First retry delay after a transient failure.
    pub retry_backoff_base_seconds: u64,
    /// Backoff delays are capped here.
    pub retry_backoff_cap_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathConfig {
    pub input_dir: PathBuf,
    pub production_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub state_file: PathBuf,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            min_file_size_bytes: 1024,
            max_file_size_bytes: 100 * 1024 * 1024,
            min_resolution: 2500,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.8,
            variant_base_confidence: 0.8,
            variant_step: 0.1,
            variant_floor: 0.6,
            alias_confidence: 0.55,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 30,
            worker_count: 2,
            render_pool_size: 0,
            background_removal_timeout_seconds: 120,
            background_removal_model: "isnet-general-use".to_string(),
            retry_backoff_base_seconds: 60,
            retry_backoff_cap_seconds: 3600,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/input"),
            production_dir: PathBuf::from("data/production"),
            assets_dir: PathBuf::from("assets"),
            state_file: PathBuf::from("data/metadata/file_records.json"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intake: IntakeConfig::default(),
            resolver: ResolverConfig::default(),
            scheduler: SchedulerConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load config from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
