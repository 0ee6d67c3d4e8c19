//! Similarity cache fingerprinting
//!
//! The fingerprint captures everything the similarity computation
//! depends on. Two runs with identical fingerprints may reuse cached
//! results byte-for-byte; changing any field invalidates the entry.

use crate::job::{CompressionJob, DataType};
use crate::model::ModelHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a similarity computation, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFingerprint {
    /// Model path or checkpoint identifier.
    pub model_id: String,
    /// Calibration dataset name.
    pub dataset: String,
    /// Calibration data flavor (pretraining text vs. instruction pairs).
    pub data_type: DataType,
    /// Total calibration sample count across all ranks.
    pub n_samples: usize,
    /// Calibration sequence length.
    pub seq_len: usize,
    /// Similarity metric name.
    pub metric: String,
    /// Block count of the model the similarities were measured on.
    pub num_blocks: usize,
}

impl ModelFingerprint {
    /// Build the fingerprint for a job against a loaded model.
    pub fn from_job(job: &CompressionJob, model: &ModelHandle) -> Self {
        Self {
            model_id: job.model_path.display().to_string(),
            dataset: job.dataset.clone(),
            data_type: job.data_type,
            n_samples: job.n_compression_samples,
            seq_len: job.cutoff_len,
            metric: "cosine".to_string(),
            num_blocks: model.config.num_blocks,
        }
    }

    /// Hex SHA-256 digest over a canonical field encoding.
    ///
    /// Field order and separators are fixed; changing any field changes
    /// the digest.
    #[must_use]
    pub fn digest(&self) -> String {
        let canonical = format!(
            "model={}|dataset={}|data_type={}|n_samples={}|seq_len={}|metric={}|num_blocks={}",
            self.model_id,
            self.dataset,
            self.data_type.as_str(),
            self.n_samples,
            self.seq_len,
            self.metric,
            self.num_blocks,
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> ModelFingerprint {
        ModelFingerprint {
            model_id: "/models/mixtral-8x7b".into(),
            dataset: "c4".into(),
            data_type: DataType::Pt,
            n_samples: 128,
            seq_len: 2048,
            metric: "cosine".into(),
            num_blocks: 32,
        }
    }

    #[test]
    fn test_digest_is_stable() {
        let a = fingerprint();
        let b = fingerprint();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_every_field_changes_digest() {
        let base = fingerprint().digest();

        let mut fp = fingerprint();
        fp.model_id = "/models/other".into();
        assert_ne!(fp.digest(), base);

        let mut fp = fingerprint();
        fp.dataset = "wikitext".into();
        assert_ne!(fp.digest(), base);

        let mut fp = fingerprint();
        fp.data_type = DataType::Sft;
        assert_ne!(fp.digest(), base);

        let mut fp = fingerprint();
        fp.n_samples = 64;
        assert_ne!(fp.digest(), base);

        let mut fp = fingerprint();
        fp.seq_len = 1024;
        assert_ne!(fp.digest(), base);

        let mut fp = fingerprint();
        fp.metric = "l2".into();
        assert_ne!(fp.digest(), base);

        let mut fp = fingerprint();
        fp.num_blocks = 24;
        assert_ne!(fp.digest(), base);
    }

    #[test]
    fn test_digest_is_lowercase_hex() {
        let digest = fingerprint().digest();
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
