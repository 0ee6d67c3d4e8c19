//! Model representation and checkpoint IO
//!
//! A model is an embedding table plus an ordered list of residual
//! blocks. Blocks are either dense feed-forward units or sparse MoE
//! units routed through a learned gate. The block list is the unit of
//! compression: the surgeon removes whole blocks and renumbers the
//! rest, never touching partial parameters.
//!
//! Checkpoints are directories holding `config.json` and `model.json`,
//! written through [`ModelProvider`].

use crate::error::{CompressionError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Structural configuration of a model.
///
/// `num_experts_per_block` and `expert_index_tables` are present only
/// for MoE checkpoints that already went through expert dropping; both
/// are indexed by block number and must be remapped whenever blocks
/// are removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family or checkpoint name.
    pub name: String,
    /// Number of transformer blocks.
    pub num_blocks: usize,
    /// Hidden state width.
    pub hidden_size: usize,
    /// Embedding vocabulary size.
    pub vocab_size: usize,
    /// Per-block expert counts (MoE checkpoints after expert drop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_experts_per_block: Option<Vec<usize>>,
    /// Per-block surviving-expert index tables (MoE checkpoints after
    /// expert drop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expert_index_tables: Option<Vec<Vec<usize>>>,
}

impl ModelConfig {
    /// Create a dense model configuration.
    pub fn dense(name: impl Into<String>, num_blocks: usize, hidden_size: usize, vocab_size: usize) -> Self {
        Self {
            name: name.into(),
            num_blocks,
            hidden_size,
            vocab_size,
            num_experts_per_block: None,
            expert_index_tables: None,
        }
    }

    /// Create an MoE model configuration with a uniform expert count.
    pub fn moe(
        name: impl Into<String>,
        num_blocks: usize,
        hidden_size: usize,
        vocab_size: usize,
        num_experts: usize,
    ) -> Self {
        Self {
            name: name.into(),
            num_blocks,
            hidden_size,
            vocab_size,
            num_experts_per_block: Some(vec![num_experts; num_blocks]),
            expert_index_tables: Some((0..num_blocks).map(|_| (0..num_experts).collect()).collect()),
        }
    }
}

/// A single expert: two-layer feed-forward with tanh activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expert {
    /// Weights: [hidden_size, hidden_size]
    pub w: Array2<f32>,
    /// Bias: [hidden_size]
    pub b: Array1<f32>,
}

impl Expert {
    /// Deterministic initialization: a fixed sinusoidal pattern scaled
    /// by fan-in, keyed by block and expert position so no two experts
    /// share weights.
    pub fn deterministic(hidden_size: usize, block_id: usize, expert_id: usize) -> Self {
        let scale = (2.0 / (2 * hidden_size) as f32).sqrt();
        let phase = (block_id * 31 + expert_id * 7) as f32;
        Self {
            w: Array2::from_shape_fn((hidden_size, hidden_size), |(i, j)| {
                ((i * hidden_size + j) as f32 * 0.3141 + phase).sin() * scale
            }),
            b: Array1::zeros(hidden_size),
        }
    }

    /// Apply the expert to a batch of token states: tanh(h @ W + b).
    pub fn forward(&self, hidden: &Array2<f32>) -> Array2<f32> {
        let mut out = hidden.dot(&self.w);
        out += &self.b;
        out.mapv_inplace(f32::tanh);
        out
    }
}

/// One transformer block. Both kinds are residual: the block's output
/// is its input plus the transformed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    /// Dense feed-forward block.
    Dense {
        /// The block's feed-forward unit.
        ffn: Expert,
    },
    /// Sparse MoE block: each token is routed to the expert with the
    /// highest gate score.
    Moe {
        /// Gate weights: [hidden_size, num_experts]
        gate: Array2<f32>,
        /// Expert networks.
        experts: Vec<Expert>,
    },
}

impl Block {
    /// Number of experts in this block (1 for dense).
    pub fn num_experts(&self) -> usize {
        match self {
            Block::Dense { .. } => 1,
            Block::Moe { experts, .. } => experts.len(),
        }
    }

    /// Forward pass over a batch of token states [tokens, hidden_size].
    pub fn forward(&self, hidden: &Array2<f32>) -> Array2<f32> {
        match self {
            Block::Dense { ffn } => hidden + &ffn.forward(hidden),
            Block::Moe { gate, experts } => {
                let scores = hidden.dot(gate); // [tokens, num_experts]
                let mut out = hidden.clone();
                for (t, token) in hidden.outer_iter().enumerate() {
                    let row = scores.row(t);
                    let expert_id = row
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map_or(0, |(i, _)| i);
                    let token = token.insert_axis(ndarray::Axis(0));
                    let delta = experts[expert_id].forward(&token.to_owned());
                    let mut out_row = out.row_mut(t);
                    out_row += &delta.row(0);
                }
                out
            }
        }
    }
}

/// A loaded model: embedding table plus the ordered block list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Structural configuration.
    pub config: ModelConfig,
    /// Token embedding: [vocab_size, hidden_size]
    pub embedding: Array2<f32>,
    /// Transformer blocks in depth order.
    pub blocks: Vec<Block>,
}

impl ModelHandle {
    /// Build a model with deterministic weights from a configuration.
    ///
    /// Dense blocks are produced unless the config carries expert
    /// counts, in which case each block becomes an MoE block of the
    /// configured size.
    pub fn synthetic(config: ModelConfig) -> Self {
        let embedding = Array2::from_shape_fn((config.vocab_size, config.hidden_size), |(i, j)| {
            ((i * config.hidden_size + j) as f32 * 0.173).cos() * 0.1
        });
        let blocks = (0..config.num_blocks)
            .map(|block_id| match &config.num_experts_per_block {
                None => Block::Dense {
                    ffn: Expert::deterministic(config.hidden_size, block_id, 0),
                },
                Some(counts) => {
                    let n = counts[block_id];
                    Block::Moe {
                        gate: Array2::from_shape_fn((config.hidden_size, n), |(i, j)| {
                            ((i * n + j + block_id) as f32 * 0.911).sin()
                        }),
                        experts: (0..n)
                            .map(|e| Expert::deterministic(config.hidden_size, block_id, e))
                            .collect(),
                    }
                }
            })
            .collect();
        Self {
            config,
            embedding,
            blocks,
        }
    }

    /// Embed a token batch into the hidden space: [tokens, hidden_size].
    pub fn embed(&self, token_ids: &[u32]) -> Array2<f32> {
        let vocab = self.config.vocab_size;
        let mut hidden = Array2::zeros((token_ids.len(), self.config.hidden_size));
        for (t, &id) in token_ids.iter().enumerate() {
            let row = self.embedding.row(id as usize % vocab);
            hidden.row_mut(t).assign(&row);
        }
        hidden
    }

    /// Number of transformer blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Checkpoint loading and saving contract.
pub trait ModelProvider {
    /// Load a model from a checkpoint directory.
    fn load(&self, path: &Path) -> Result<ModelHandle>;
    /// Save a model to a checkpoint directory.
    fn save(&self, model: &ModelHandle, path: &Path) -> Result<()>;
}

/// JSON checkpoint directories: `config.json` + `model.json`.
///
/// Each file is written to a temporary sibling and renamed into place,
/// `model.json` last, so a crash mid-save never leaves a readable but
/// half-written checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModelProvider;

impl JsonModelProvider {
    /// Create a provider.
    pub fn new() -> Self {
        Self
    }

    fn write_atomic(path: &Path, data: &str) -> Result<()> {
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ModelProvider for JsonModelProvider {
    fn load(&self, path: &Path) -> Result<ModelHandle> {
        let config_raw = fs::read_to_string(path.join("config.json"))?;
        let config: ModelConfig = serde_json::from_str(&config_raw)?;
        let model_raw = fs::read_to_string(path.join("model.json"))?;
        let model: ModelHandle = serde_json::from_str(&model_raw)?;
        if model.config != config {
            return Err(CompressionError::InvalidConfig(format!(
                "config.json and model.json disagree in {}",
                path.display()
            )));
        }
        Ok(model)
    }

    fn save(&self, model: &ModelHandle, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        let config_json = serde_json::to_string_pretty(&model.config)?;
        Self::write_atomic(&path.join("config.json"), &config_json)?;
        let model_json = serde_json::to_string(model)?;
        Self::write_atomic(&path.join("model.json"), &model_json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::TempDir;

    #[test]
    fn test_synthetic_dense_model() {
        let model = ModelHandle::synthetic(ModelConfig::dense("tiny", 4, 8, 32));
        assert_eq!(model.num_blocks(), 4);
        assert!(model.blocks.iter().all(|b| b.num_experts() == 1));
    }

    #[test]
    fn test_synthetic_moe_model() {
        let model = ModelHandle::synthetic(ModelConfig::moe("tiny-moe", 4, 8, 32, 4));
        assert_eq!(model.num_blocks(), 4);
        assert!(model.blocks.iter().all(|b| b.num_experts() == 4));
        assert_eq!(model.config.num_experts_per_block.as_deref(), Some(&[4, 4, 4, 4][..]));
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = ModelHandle::synthetic(ModelConfig::dense("tiny", 3, 8, 32));
        let b = ModelHandle::synthetic(ModelConfig::dense("tiny", 3, 8, 32));
        assert_eq!(a.embedding, b.embedding);
        for (ba, bb) in a.blocks.iter().zip(&b.blocks) {
            match (ba, bb) {
                (Block::Dense { ffn: fa }, Block::Dense { ffn: fb }) => {
                    assert_eq!(fa.w, fb.w);
                }
                _ => panic!("expected dense blocks"),
            }
        }
    }

    #[test]
    fn test_blocks_differ_from_each_other() {
        let model = ModelHandle::synthetic(ModelConfig::dense("tiny", 2, 8, 32));
        match (&model.blocks[0], &model.blocks[1]) {
            (Block::Dense { ffn: a }, Block::Dense { ffn: b }) => assert_ne!(a.w, b.w),
            _ => panic!("expected dense blocks"),
        }
    }

    #[test]
    fn test_embed_shape_and_determinism() {
        let model = ModelHandle::synthetic(ModelConfig::dense("tiny", 2, 8, 32));
        let tokens = [1u32, 5, 31, 33]; // 33 wraps to 1
        let hidden = model.embed(&tokens);
        assert_eq!(hidden.dim(), (4, 8));
        assert_eq!(hidden.row(0), hidden.row(3));
    }

    #[test]
    fn test_block_forward_is_residual() {
        let model = ModelHandle::synthetic(ModelConfig::dense("tiny", 1, 8, 32));
        let hidden = model.embed(&[0, 1, 2]);
        let out = model.blocks[0].forward(&hidden);
        assert_eq!(out.dim(), hidden.dim());
        // tanh output is bounded, so the residual keeps the result near
        // the input
        let max_delta = (&out - &hidden)
            .iter()
            .fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert!(max_delta <= 1.0 + 1e-6);
    }

    #[test]
    fn test_moe_forward_routes_tokens() {
        let model = ModelHandle::synthetic(ModelConfig::moe("tiny-moe", 1, 8, 32, 3));
        let hidden = model.embed(&[0, 1, 2, 3]);
        let out = model.blocks[0].forward(&hidden);
        assert_eq!(out.dim(), (4, 8));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = TempDir::new().unwrap();
        let provider = JsonModelProvider::new();
        let model = ModelHandle::synthetic(ModelConfig::moe("tiny-moe", 3, 8, 32, 2));

        provider.save(&model, dir.path()).unwrap();
        let loaded = provider.load(dir.path()).unwrap();

        assert_eq!(loaded.config, model.config);
        assert_eq!(loaded.num_blocks(), 3);
        let h = model.embed(&[7, 9]);
        let a = model.blocks[1].forward(&h);
        let b = loaded.blocks[1].forward(&h);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_load_missing_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let provider = JsonModelProvider::new();
        assert!(provider.load(&dir.path().join("nope")).is_err());
    }
}
