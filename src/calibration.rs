//! Calibration batch sampling
//!
//! Calibration samples are representative inputs used to measure block
//! redundancy; no gradient ever flows through them. Sampling is
//! deterministic for a given (dataset, split, seed) so that every rank
//! of a distributed run agrees on the batch sequence, and so that a
//! repeated run reproduces the cached similarities exactly.

use crate::coordinate::ProcessGroup;
use crate::error::{CompressionError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One tokenized calibration sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBatch {
    /// Token ids, exactly `seq_len` of them.
    pub input_ids: Vec<u32>,
}

/// Configuration for calibration sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Total number of calibration samples across all ranks.
    num_samples: usize,
    /// Sequence length each sample is tokenized to.
    seq_len: usize,
    /// Dataset identifier.
    dataset: String,
    /// Dataset split.
    split: String,
    /// Sampling seed.
    seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            num_samples: 128,
            seq_len: 2048,
            dataset: "c4".to_string(),
            split: "train".to_string(),
            seed: 42,
        }
    }
}

impl CalibrationConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total sample count.
    pub fn with_num_samples(mut self, n: usize) -> Self {
        self.num_samples = n;
        self
    }

    /// Set the sequence length.
    pub fn with_seq_len(mut self, len: usize) -> Self {
        self.seq_len = len;
        self
    }

    /// Set the dataset identifier.
    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    /// Set the dataset split.
    pub fn with_split(mut self, split: impl Into<String>) -> Self {
        self.split = split.into();
        self
    }

    /// Set the sampling seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Get the total sample count.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Get the sequence length.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }
}

/// Dataset access contract.
///
/// Implementations must be deterministic: the same (name, split, n,
/// seq_len) yields the same batches in the same order on every rank.
pub trait DatasetProvider {
    /// Draw `n` tokenized samples of length `seq_len`.
    fn sample(&self, name: &str, split: &str, n: usize, seq_len: usize) -> Result<Vec<TokenBatch>>;
}

/// Seeded synthetic token stream, standing in for hub-backed datasets.
#[derive(Debug, Clone)]
pub struct SyntheticTextDataset {
    /// Vocabulary size to draw token ids from.
    pub vocab_size: u32,
    /// Base seed; combined with the dataset and split names.
    pub seed: u64,
}

impl SyntheticTextDataset {
    /// Create a synthetic dataset.
    pub fn new(vocab_size: u32, seed: u64) -> Self {
        Self { vocab_size, seed }
    }

    fn stream_seed(&self, name: &str, split: &str) -> u64 {
        // Cheap stable string hash; must not vary across runs or
        // platforms, so no std RandomState here.
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in name.bytes().chain([0x1f]).chain(split.bytes()) {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        h ^ self.seed
    }
}

impl DatasetProvider for SyntheticTextDataset {
    fn sample(&self, name: &str, split: &str, n: usize, seq_len: usize) -> Result<Vec<TokenBatch>> {
        let mut rng = StdRng::seed_from_u64(self.stream_seed(name, split));
        Ok((0..n)
            .map(|_| TokenBatch {
                input_ids: (0..seq_len).map(|_| rng.gen_range(0..self.vocab_size)).collect(),
            })
            .collect())
    }
}

/// Draws the calibration batches for one rank of a run.
///
/// The full sample set is drawn identically on every rank and then
/// sharded into contiguous chunks, so rank assignment never perturbs
/// the global sample sequence.
#[derive(Debug, Clone)]
pub struct CalibrationSampler {
    config: CalibrationConfig,
}

impl CalibrationSampler {
    /// Create a sampler from a configuration.
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Sample this rank's shard of calibration batches: `num_samples /
    /// world_size` of them, a contiguous chunk of the global sequence.
    /// Suitable for work every rank performs on its own slice; a
    /// process computing on behalf of the whole group wants
    /// [`Self::sample_full`] instead.
    pub fn sample_for_rank(
        &self,
        provider: &dyn DatasetProvider,
        group: &dyn ProcessGroup,
    ) -> Result<Vec<TokenBatch>> {
        let all = self.sample_full(provider, group)?;
        let per_rank = all.len() / group.world_size();
        let start = group.rank() * per_rank;
        Ok(all[start..start + per_rank].to_vec())
    }

    /// Sample the entire calibration set, validated against the group
    /// shape. Used when one elected process computes for everyone: the
    /// result must cover all `num_samples` samples, not that process's
    /// shard.
    pub fn sample_full(
        &self,
        provider: &dyn DatasetProvider,
        group: &dyn ProcessGroup,
    ) -> Result<Vec<TokenBatch>> {
        let n = self.config.num_samples;
        let world = group.world_size();
        if n == 0 {
            return Err(CompressionError::InvalidConfig(
                "n_compression_samples must be positive".to_string(),
            ));
        }
        if n % world != 0 {
            return Err(CompressionError::InvalidConfig(format!(
                "n_compression_samples ({n}) must divide evenly across {world} processes"
            )));
        }
        provider.sample(&self.config.dataset, &self.config.split, n, self.config.seq_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::SingleProcess;

    #[test]
    fn test_synthetic_dataset_is_deterministic() {
        let ds = SyntheticTextDataset::new(1000, 42);
        let a = ds.sample("c4", "train", 4, 16).unwrap();
        let b = ds.sample("c4", "train", 4, 16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_split_different_stream() {
        let ds = SyntheticTextDataset::new(1000, 42);
        let train = ds.sample("c4", "train", 2, 16).unwrap();
        let val = ds.sample("c4", "validation", 2, 16).unwrap();
        assert_ne!(train, val);
    }

    #[test]
    fn test_different_seed_different_stream() {
        let a = SyntheticTextDataset::new(1000, 1).sample("c4", "train", 2, 16).unwrap();
        let b = SyntheticTextDataset::new(1000, 2).sample("c4", "train", 2, 16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tokens_within_vocab() {
        let ds = SyntheticTextDataset::new(50, 7);
        let batches = ds.sample("c4", "train", 3, 64).unwrap();
        for batch in &batches {
            assert_eq!(batch.input_ids.len(), 64);
            assert!(batch.input_ids.iter().all(|&t| t < 50));
        }
    }

    #[test]
    fn test_sampler_single_process_gets_everything() {
        let ds = SyntheticTextDataset::new(100, 42);
        let sampler =
            CalibrationSampler::new(CalibrationConfig::new().with_num_samples(8).with_seq_len(16));
        let group = SingleProcess::new();
        let batches = sampler.sample_for_rank(&ds, &group).unwrap();
        assert_eq!(batches.len(), 8);
    }

    /// Fixed-shape group for sharding tests; barriers are no-ops.
    struct FixedGroup {
        rank: usize,
        world: usize,
    }

    impl ProcessGroup for FixedGroup {
        fn rank(&self) -> usize {
            self.rank
        }

        fn world_size(&self) -> usize {
            self.world
        }

        fn barrier(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sample_full_covers_every_rank_shard() {
        // The elected computer consumes the whole sample set: its
        // batches must be the concatenation of all per-rank shards, in
        // order, regardless of which rank it holds.
        let ds = SyntheticTextDataset::new(100, 42);
        let sampler =
            CalibrationSampler::new(CalibrationConfig::new().with_num_samples(8).with_seq_len(16));
        let rank0 = FixedGroup { rank: 0, world: 2 };
        let rank1 = FixedGroup { rank: 1, world: 2 };

        let full = sampler.sample_full(&ds, &rank0).unwrap();
        assert_eq!(full.len(), 8);
        assert_eq!(full, sampler.sample_full(&ds, &rank1).unwrap());

        let shard0 = sampler.sample_for_rank(&ds, &rank0).unwrap();
        let shard1 = sampler.sample_for_rank(&ds, &rank1).unwrap();
        assert_eq!(shard0.len(), 4);
        assert_eq!(shard1.len(), 4);
        let mut rejoined = shard0;
        rejoined.extend(shard1);
        assert_eq!(rejoined, full);
    }

    #[test]
    fn test_sampler_rejects_uneven_split() {
        let ds = SyntheticTextDataset::new(100, 42);
        let sampler =
            CalibrationSampler::new(CalibrationConfig::new().with_num_samples(7).with_seq_len(16));
        let group = FixedGroup { rank: 0, world: 2 };
        let err = sampler.sample_full(&ds, &group).unwrap_err();
        assert!(matches!(err, CompressionError::InvalidConfig(_)));
    }

    #[test]
    fn test_sampler_rejects_zero_samples() {
        let ds = SyntheticTextDataset::new(100, 42);
        let sampler =
            CalibrationSampler::new(CalibrationConfig::new().with_num_samples(0).with_seq_len(16));
        let err = sampler.sample_for_rank(&ds, &SingleProcess::new()).unwrap_err();
        assert!(matches!(err, CompressionError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_builder() {
        let config = CalibrationConfig::new()
            .with_num_samples(64)
            .with_seq_len(512)
            .with_dataset("wikitext")
            .with_split("validation")
            .with_seed(7);
        assert_eq!(config.num_samples(), 64);
        assert_eq!(config.seq_len(), 512);
    }
}
