//! Error types for block-drop compression
//!
//! Every failure in the core is fatal: compression correctness depends
//! on determinism across ranks, so nothing here is transparently
//! retried. All errors abort a run before the checkpoint is written.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for compression operations
pub type Result<T> = std::result::Result<T, CompressionError>;

/// Errors that can occur during block-drop compression
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Cache payload exists but cannot be trusted (parse failure, shape
    /// mismatch against the current model, or fingerprint mismatch).
    /// Recomputing silently could mask a model/dataset mismatch
    /// upstream, so the operator must delete the file explicitly.
    #[error("corrupt similarity cache at {path}: {reason} (delete the file and re-run the prune stage)")]
    CacheCorrupt { path: PathBuf, reason: String },

    /// A similarity score came out non-finite. NaN must never reach the
    /// block-selection comparisons.
    #[error("non-finite similarity between hidden states {lhs} and {rhs}: {detail}")]
    NumericInstability {
        lhs: usize,
        rhs: usize,
        detail: String,
    },

    /// drop_n outside (0, num_blocks). Checked before any estimator
    /// work is started.
    #[error("invalid drop budget: drop_n = {drop_n} with {num_blocks} blocks (need 0 < drop_n < {num_blocks})")]
    InvalidDropBudget { drop_n: usize, num_blocks: usize },

    /// Surgery left a reference to a removed block. The checkpoint is
    /// not written.
    #[error("dangling block reference after surgery: {detail}")]
    DanglingReference { detail: String },

    /// post_dropping ran without a prior prune-stage cache entry.
    #[error("no similarity cache at {path}: run the prune stage (block_drop_method = discrete | consecutive) first")]
    CacheMiss { path: PathBuf },

    /// A distributed barrier was not satisfied in time. Fatal for all
    /// ranks: a partial quorum would produce inconsistent drop plans
    /// across the sharded checkpoint.
    #[error("coordination barrier not satisfied within {timeout:?} (rank {rank})")]
    CoordinationTimeout { rank: usize, timeout: Duration },

    /// Run configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML manifest error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CompressionError {
    /// No compression error is retryable: a retry without operator
    /// awareness would hide the nondeterminism that caused it.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Check whether this error indicates stale on-disk state that the
    /// operator has to clear by hand.
    #[must_use]
    pub fn requires_operator_cleanup(&self) -> bool {
        matches!(self, Self::CacheCorrupt { .. })
    }
}
