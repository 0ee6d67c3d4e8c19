//! Model surgery: block removal and renumbering
//!
//! Blocks stay in their original arena (the model's block list) until
//! the plan is finalized; then a single old-to-new index table is built
//! once and every block-indexed structure is remapped through it. The
//! relative order of surviving blocks never changes.
//!
//! A dangling reference after surgery is the primary correctness risk
//! of the whole subsystem, so an explicit consistency check runs before
//! anything can be saved.

use crate::error::{CompressionError, Result};
use crate::model::{ModelConfig, ModelHandle};
use crate::select::DropPlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Order-preserving old-index to new-index table for surviving blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexMap {
    old_to_new: BTreeMap<usize, usize>,
}

impl BlockIndexMap {
    /// Build the table for a model of `num_blocks` blocks under `plan`.
    pub fn from_plan(num_blocks: usize, plan: &DropPlan) -> Result<Self> {
        if let Some(&out_of_range) = plan.indices.iter().find(|&&i| i >= num_blocks) {
            return Err(CompressionError::DanglingReference {
                detail: format!(
                    "drop plan names block {out_of_range} but the model has {num_blocks} blocks"
                ),
            });
        }
        let mut old_to_new = BTreeMap::new();
        let mut next = 0usize;
        for old in 0..num_blocks {
            if !plan.drops(old) {
                old_to_new.insert(old, next);
                next += 1;
            }
        }
        Ok(Self { old_to_new })
    }

    /// New index of a surviving block, None if it was dropped.
    pub fn remap(&self, old: usize) -> Option<usize> {
        self.old_to_new.get(&old).copied()
    }

    /// Surviving original indices in ascending order.
    pub fn survivors(&self) -> Vec<usize> {
        self.old_to_new.keys().copied().collect()
    }

    /// Number of surviving blocks.
    pub fn len(&self) -> usize {
        self.old_to_new.len()
    }

    /// Whether no blocks survive (never true for a valid plan).
    pub fn is_empty(&self) -> bool {
        self.old_to_new.is_empty()
    }
}

/// Applies a drop plan to a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSurgeon;

impl ModelSurgeon {
    /// Create a surgeon.
    pub fn new() -> Self {
        Self
    }

    /// Remove the planned blocks, renumber the survivors, and remap
    /// every block-indexed auxiliary structure. The returned model has
    /// passed the post-surgery consistency check.
    pub fn apply(&self, model: &ModelHandle, plan: &DropPlan) -> Result<(ModelHandle, BlockIndexMap)> {
        let num_blocks = model.num_blocks();
        let map = BlockIndexMap::from_plan(num_blocks, plan)?;
        let survivors = map.survivors();

        let blocks = survivors.iter().map(|&old| model.blocks[old].clone()).collect();
        let config = Self::remap_config(&model.config, &survivors)?;
        let compressed = ModelHandle {
            config,
            embedding: model.embedding.clone(),
            blocks,
        };

        Self::verify(&compressed, &map, num_blocks, plan.drop_n())?;
        Ok((compressed, map))
    }

    /// Rebuild the config for the surviving blocks, remapping the
    /// per-block MoE tables kept for expert-drop compatibility.
    fn remap_config(config: &ModelConfig, survivors: &[usize]) -> Result<ModelConfig> {
        let mut new_config = config.clone();
        new_config.num_blocks = survivors.len();

        if let Some(counts) = &config.num_experts_per_block {
            new_config.num_experts_per_block = Some(
                survivors
                    .iter()
                    .map(|&old| {
                        counts.get(old).copied().ok_or_else(|| {
                            CompressionError::DanglingReference {
                                detail: format!("no expert count for surviving block {old}"),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        if let Some(tables) = &config.expert_index_tables {
            new_config.expert_index_tables = Some(
                survivors
                    .iter()
                    .map(|&old| {
                        tables.get(old).cloned().ok_or_else(|| {
                            CompressionError::DanglingReference {
                                detail: format!("no expert index table for surviving block {old}"),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        Ok(new_config)
    }

    /// Post-surgery consistency check: block counts line up, the
    /// renumbering is contiguous and order-preserving, and every
    /// auxiliary reference resolves to a surviving block.
    fn verify(
        compressed: &ModelHandle,
        map: &BlockIndexMap,
        original_blocks: usize,
        drop_n: usize,
    ) -> Result<()> {
        let expected = original_blocks - drop_n;
        if compressed.blocks.len() != expected {
            return Err(CompressionError::DanglingReference {
                detail: format!(
                    "surgery produced {} blocks, expected {expected}",
                    compressed.blocks.len()
                ),
            });
        }
        if compressed.config.num_blocks != expected {
            return Err(CompressionError::DanglingReference {
                detail: format!(
                    "config says {} blocks, surgery produced {expected}",
                    compressed.config.num_blocks
                ),
            });
        }
        // Renumbering must be the identity on order: new indices are
        // exactly 0..expected in survivor order.
        for (position, old) in map.survivors().iter().enumerate() {
            match map.remap(*old) {
                Some(new) if new == position => {}
                other => {
                    return Err(CompressionError::DanglingReference {
                        detail: format!("block {old} remaps to {other:?}, expected {position}"),
                    });
                }
            }
        }
        if let Some(counts) = &compressed.config.num_experts_per_block {
            if counts.len() != expected {
                return Err(CompressionError::DanglingReference {
                    detail: format!(
                        "expert-count table has {} entries for {expected} blocks",
                        counts.len()
                    ),
                });
            }
            for (new, (&count, block)) in counts.iter().zip(&compressed.blocks).enumerate() {
                if block.num_experts() != count {
                    return Err(CompressionError::DanglingReference {
                        detail: format!(
                            "block {new} holds {} experts but the table says {count}",
                            block.num_experts()
                        ),
                    });
                }
            }
        }
        if let Some(tables) = &compressed.config.expert_index_tables {
            if tables.len() != expected {
                return Err(CompressionError::DanglingReference {
                    detail: format!(
                        "expert index tables cover {} blocks, expected {expected}",
                        tables.len()
                    ),
                });
            }
        }
        Ok(())
    }
}
