//! Podar: block-drop compression for transformer checkpoints
//!
//! Podar compresses pretrained transformer models (including
//! mixture-of-experts variants) by removing whole computational blocks
//! rather than retraining. It decides *which* blocks to remove from
//! cached similarity measurements over calibration data, then
//! materializes a smaller checkpoint with the survivors renumbered.
//!
//! # Architecture
//!
//! - [`calibration`]: deterministic calibration batch sampling
//! - [`similarity`]: per-block similarity estimation and the persistent
//!   similarity cache shared across a distributed run
//! - [`select`]: the drop-plan selector (discrete vs. consecutive)
//! - [`surgeon`]: block removal and order-preserving renumbering
//! - [`pipeline`]: the two-stage prune / post_dropping state machine
//!
//! # Example
//!
//! ```ignore
//! use podar::{CompressionJob, CompressionPipeline, SingleProcess};
//!
//! let job = CompressionJob::from_yaml_file("compress.yaml")?;
//! let group = SingleProcess::new();
//! let mut pipeline = CompressionPipeline::new(&job, &group);
//! let plan = pipeline.run_prune(&model, &dataset)?;
//! ```
//!
//! No gradient updates occur anywhere in this crate: compression is a
//! pure checkpoint-to-checkpoint transformation.

pub mod calibration;
pub mod cli;
pub mod coordinate;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod model;
pub mod pipeline;
pub mod select;
pub mod similarity;
pub mod surgeon;

pub use calibration::{CalibrationConfig, CalibrationSampler, DatasetProvider, TokenBatch};
pub use coordinate::{ProcessGroup, SingleProcess};
pub use error::{CompressionError, Result};
pub use fingerprint::ModelFingerprint;
pub use job::{BlockDropMethod, CompressionJob, DataType};
pub use model::{Block, JsonModelProvider, ModelConfig, ModelHandle, ModelProvider};
pub use pipeline::{CompressionPipeline, PipelineMetrics, PipelineState};
pub use select::{BlockSelector, DropPlan, DropPolicy};
pub use similarity::{BlockSimilarityEstimator, SimilarityCache, SimilarityMatrix};
pub use surgeon::{BlockIndexMap, ModelSurgeon};
