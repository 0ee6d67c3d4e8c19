//! Drop-plan selection
//!
//! Two interchangeable policies consume the same similarity matrix:
//!
//! - **Discrete**: ranks blocks individually by how close each is to an
//!   identity transform (gap-1 similarity) and picks the top `drop_n`,
//!   scattered anywhere in the network.
//! - **Consecutive**: picks the single contiguous run of `drop_n`
//!   blocks whose entry and exit representations are most similar.
//!
//! Selection is pure: the same matrix, policy, and budget always yield
//! the same plan. The post_dropping stage depends on this to reproduce
//! the prune-stage plan from the cache without re-estimating.

use crate::error::{CompressionError, Result};
use crate::similarity::SimilarityMatrix;
use serde::{Deserialize, Serialize};

/// Block-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Individually ranked blocks, scattered drops.
    Discrete,
    /// One contiguous run of blocks.
    Consecutive,
}

impl DropPolicy {
    /// Display name for logs and sidecars.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropPolicy::Discrete => "discrete",
            DropPolicy::Consecutive => "consecutive",
        }
    }
}

/// The finalized drop decision: exactly `drop_n` distinct block
/// indices under the original ordering, plus the policy that produced
/// them. Indices are kept sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPlan {
    /// Policy that produced the plan.
    pub policy: DropPolicy,
    /// Dropped block indices, sorted ascending, no duplicates.
    pub indices: Vec<usize>,
}

impl DropPlan {
    /// Number of blocks this plan removes.
    pub fn drop_n(&self) -> usize {
        self.indices.len()
    }

    /// Whether `block` is dropped by this plan.
    pub fn drops(&self, block: usize) -> bool {
        self.indices.binary_search(&block).is_ok()
    }
}

/// Selects a drop plan from a similarity matrix.
#[derive(Debug, Clone, Copy)]
pub struct BlockSelector {
    policy: DropPolicy,
}

impl BlockSelector {
    /// Create a selector for a policy.
    pub fn new(policy: DropPolicy) -> Self {
        Self { policy }
    }

    /// The selector's policy.
    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Validate a drop budget against a block count. Called before any
    /// estimator work so a bad budget never costs a forward pass.
    pub fn validate_budget(drop_n: usize, num_blocks: usize) -> Result<()> {
        if drop_n == 0 || drop_n >= num_blocks {
            return Err(CompressionError::InvalidDropBudget { drop_n, num_blocks });
        }
        Ok(())
    }

    /// Produce the drop plan for `drop_n` blocks.
    pub fn select(&self, matrix: &SimilarityMatrix, drop_n: usize) -> Result<DropPlan> {
        Self::validate_budget(drop_n, matrix.num_blocks())?;
        let indices = match self.policy {
            DropPolicy::Discrete => Self::select_discrete(matrix, drop_n),
            DropPolicy::Consecutive => Self::select_consecutive(matrix, drop_n),
        };
        Ok(DropPlan {
            policy: self.policy,
            indices,
        })
    }

    /// Rank blocks by gap-1 similarity descending, stable tie-break on
    /// the lower index, and take the top `drop_n`.
    fn select_discrete(matrix: &SimilarityMatrix, drop_n: usize) -> Vec<usize> {
        let scores = matrix.gap_column(1);
        let mut order: Vec<usize> = (0..matrix.num_blocks()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        let mut dropped: Vec<usize> = order.into_iter().take(drop_n).collect();
        dropped.sort_unstable();
        dropped
    }

    /// Evaluate every contiguous run of `drop_n` blocks (non-circular:
    /// starts 0 ..= L - drop_n) and take the run whose entry and exit
    /// states are most similar; ties go to the lowest start.
    fn select_consecutive(matrix: &SimilarityMatrix, drop_n: usize) -> Vec<usize> {
        let l = matrix.num_blocks();
        let mut best_start = 0;
        let mut best_score = f32::NEG_INFINITY;
        for start in 0..=(l - drop_n) {
            let score = matrix
                .gap_score(start, drop_n)
                .unwrap_or(f32::NEG_INFINITY);
            if score > best_score {
                best_score = score;
                best_start = start;
            }
        }
        (best_start..best_start + drop_n).collect()
    }
}
