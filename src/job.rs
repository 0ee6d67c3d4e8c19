//! Run configuration
//!
//! A `CompressionJob` is the run-level record threading stage, method,
//! budget, and paths through the pipeline. It is constructed once from
//! a YAML manifest at process start and read-only thereafter.
//!
//! ```yaml
//! stage: prune
//! compress_method: block_drop
//! block_drop_method: consecutive
//! drop_n: 4
//! n_compression_samples: 128
//! cutoff_len: 2048
//! dataset: c4
//! data_type: pt
//! model_path: /models/mixtral-8x7b
//! similarity_cache_file: /cache/mixtral_c4_sim.json
//! compressed_model_save_path: /models/mixtral-8x7b-drop4
//! ```

use crate::calibration::CalibrationConfig;
use crate::error::{CompressionError, Result};
use crate::select::DropPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Pipeline stage. `post_dropping` is a value of `block_drop_method`,
/// not a separate stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The compression stage (both passes run under it).
    #[default]
    Prune,
}

/// Compression method. Only whole-block removal lives in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressMethod {
    /// Remove whole transformer blocks.
    #[default]
    BlockDrop,
}

/// Which block-drop pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockDropMethod {
    /// Prune pass, discrete policy.
    Discrete,
    /// Prune pass, consecutive policy.
    Consecutive,
    /// Second pass: re-derive the plan from the cache, operate, save.
    PostDropping,
}

impl BlockDropMethod {
    /// The selection policy, if this method names one.
    pub fn policy(&self) -> Option<DropPolicy> {
        match self {
            BlockDropMethod::Discrete => Some(DropPolicy::Discrete),
            BlockDropMethod::Consecutive => Some(DropPolicy::Consecutive),
            BlockDropMethod::PostDropping => None,
        }
    }
}

/// Calibration data flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Pretraining-style text.
    #[default]
    Pt,
    /// Supervised-instruction pairs.
    Sft,
}

impl DataType {
    /// Stable name used in the cache fingerprint.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Pt => "pt",
            DataType::Sft => "sft",
        }
    }
}

fn default_samples() -> usize {
    128
}

fn default_cutoff_len() -> usize {
    2048
}

fn default_dataset() -> String {
    "c4".to_string()
}

fn default_seed() -> u64 {
    42
}

/// The run-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionJob {
    /// Pipeline stage.
    #[serde(default)]
    pub stage: Stage,
    /// Compression method.
    #[serde(default)]
    pub compress_method: CompressMethod,
    /// Block-drop pass and policy.
    pub block_drop_method: BlockDropMethod,
    /// Number of blocks to remove.
    pub drop_n: usize,
    /// Total calibration samples across all ranks.
    #[serde(default = "default_samples")]
    pub n_compression_samples: usize,
    /// Calibration sequence length.
    #[serde(default = "default_cutoff_len")]
    pub cutoff_len: usize,
    /// Calibration dataset name.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Calibration data flavor.
    #[serde(default)]
    pub data_type: DataType,
    /// Calibration sampling seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Checkpoint directory of the model to compress.
    pub model_path: PathBuf,
    /// Path of the shared similarity cache file.
    pub similarity_cache_file: PathBuf,
    /// Output checkpoint directory.
    pub compressed_model_save_path: PathBuf,
}

impl CompressionJob {
    /// Load and validate a job from a YAML manifest.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let job: Self = serde_yaml::from_str(&raw)?;
        job.validate()?;
        Ok(job)
    }

    /// Check the fields that can be checked without a loaded model.
    /// The budget check against the real block count happens in the
    /// pipeline, before any estimator work.
    pub fn validate(&self) -> Result<()> {
        if self.drop_n == 0 {
            return Err(CompressionError::InvalidConfig(
                "drop_n must be positive".to_string(),
            ));
        }
        if self.n_compression_samples == 0 {
            return Err(CompressionError::InvalidConfig(
                "n_compression_samples must be positive".to_string(),
            ));
        }
        if self.cutoff_len == 0 {
            return Err(CompressionError::InvalidConfig(
                "cutoff_len must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Calibration configuration derived from this job.
    pub fn calibration_config(&self) -> CalibrationConfig {
        CalibrationConfig::new()
            .with_num_samples(self.n_compression_samples)
            .with_seq_len(self.cutoff_len)
            .with_dataset(self.dataset.clone())
            .with_seed(self.seed)
    }

    /// Path of the drop-plan sidecar next to the checkpoint.
    pub fn drop_plan_path(&self) -> PathBuf {
        self.compressed_model_save_path.join("drop_plan.json")
    }

    /// Path of the old-to-new block mapping sidecar.
    pub fn block_mapping_path(&self) -> PathBuf {
        self.compressed_model_save_path.join("block_mapping.json")
    }

    /// Path of the pipeline metrics sidecar.
    pub fn metrics_path(&self) -> PathBuf {
        self.compressed_model_save_path.join("metrics.json")
    }
}
