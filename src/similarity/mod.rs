//! Block similarity measurement and caching
//!
//! The similarity matrix records how close the model's representation
//! stays across spans of blocks. Row `i`, column `g - 1` holds the mean
//! cosine similarity between the hidden state entering block `i` and
//! the hidden state entering block `i + g` (where "entering block L"
//! means the output of the last block). Cells whose span would run past
//! the end of the model hold negative infinity:
//!
//! ```text
//! [[ 0.5,  0.5,  0.5,  0.5 ],
//!  [ 0.5,  0.5,  0.5, -inf ],
//!  [ 0.5,  0.5, -inf, -inf ],
//!  [ 0.5, -inf, -inf, -inf ]]   // L = 4
//! ```
//!
//! The gap-1 column scores each block individually (how close it is to
//! an identity transform); the gap-n column scores every contiguous run
//! of n blocks by comparing the run's entry and exit representations.

mod cache;
mod estimator;

pub use cache::SimilarityCache;
pub use estimator::BlockSimilarityEstimator;

use crate::error::{CompressionError, Result};
use crate::fingerprint::ModelFingerprint;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pairwise block similarity scores for one model + calibration set.
///
/// Immutable once built; owned by the cache after the first write.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    scores: Array2<f32>,
}

impl SimilarityMatrix {
    /// Create an empty matrix for a model with `num_blocks` blocks.
    /// All cells start at negative infinity.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            scores: Array2::from_elem((num_blocks, num_blocks), f32::NEG_INFINITY),
        }
    }

    /// Block count this matrix was measured on.
    pub fn num_blocks(&self) -> usize {
        self.scores.nrows()
    }

    /// Record the similarity across `gap` blocks starting at `block`.
    ///
    /// # Panics
    ///
    /// Panics if the span runs past the end of the model; only the
    /// estimator writes, and it only visits valid spans.
    pub fn set(&mut self, block: usize, gap: usize, score: f32) {
        assert!(gap >= 1 && block + gap <= self.num_blocks());
        self.scores[[block, gap - 1]] = score;
    }

    /// Similarity across `gap` blocks starting at `block`, if the span
    /// fits in the model.
    pub fn gap_score(&self, block: usize, gap: usize) -> Option<f32> {
        if gap >= 1 && block + gap <= self.num_blocks() {
            Some(self.scores[[block, gap - 1]])
        } else {
            None
        }
    }

    /// The full gap column: entry `i` scores the span `[i, i + gap)`,
    /// negative infinity where that span does not fit.
    pub fn gap_column(&self, gap: usize) -> Vec<f32> {
        (0..self.num_blocks())
            .map(|i| self.gap_score(i, gap).unwrap_or(f32::NEG_INFINITY))
            .collect()
    }

    /// Check that every valid cell is finite.
    pub fn validate_finite(&self) -> Result<()> {
        let l = self.num_blocks();
        for i in 0..l {
            for gap in 1..=(l - i) {
                let score = self.scores[[i, gap - 1]];
                if !score.is_finite() {
                    return Err(CompressionError::NumericInstability {
                        lhs: i,
                        rhs: i + gap,
                        detail: format!("similarity is {score}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// On-disk cache payload: the matrix plus the fingerprint it was
/// computed under, so stale entries are detected on read.
///
/// Only the L(L+1)/2 valid cells are stored, row by row (block 0's
/// gaps 1..=L, then block 1's gaps 1..=L-1, and so on). The negative
/// infinity padding is rebuilt on load; JSON has no encoding for
/// non-finite floats, so the padding must never touch the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSimilarity {
    /// Fingerprint digest of the run that produced this entry.
    pub digest: String,
    /// Block count; must match the current model on read.
    pub num_blocks: usize,
    /// Valid cells only, in row-major (block, gap) order.
    pub scores: Vec<f32>,
}

impl CachedSimilarity {
    fn valid_cells(num_blocks: usize) -> usize {
        num_blocks * (num_blocks + 1) / 2
    }

    /// Package a matrix for persistence.
    pub fn from_matrix(matrix: &SimilarityMatrix, fingerprint: &ModelFingerprint) -> Self {
        let l = matrix.num_blocks();
        let mut scores = Vec::with_capacity(Self::valid_cells(l));
        for block in 0..l {
            for gap in 1..=(l - block) {
                scores.push(matrix.scores[[block, gap - 1]]);
            }
        }
        Self {
            digest: fingerprint.digest(),
            num_blocks: l,
            scores,
        }
    }

    /// Unpack a stored payload, validating it against the requesting
    /// fingerprint. Any mismatch is a corrupt (stale) cache, never a
    /// silent miss.
    pub fn into_matrix(self, fingerprint: &ModelFingerprint, path: &Path) -> Result<SimilarityMatrix> {
        if self.digest != fingerprint.digest() {
            return Err(CompressionError::CacheCorrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "fingerprint mismatch: cached {}, requested {}",
                    self.digest,
                    fingerprint.digest()
                ),
            });
        }
        if self.num_blocks != fingerprint.num_blocks {
            return Err(CompressionError::CacheCorrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "cached for {} blocks, model has {}",
                    self.num_blocks, fingerprint.num_blocks
                ),
            });
        }
        let expected = Self::valid_cells(self.num_blocks);
        if self.scores.len() != expected {
            return Err(CompressionError::CacheCorrupt {
                path: path.to_path_buf(),
                reason: format!("payload holds {} scores, expected {expected}", self.scores.len()),
            });
        }
        let mut matrix = SimilarityMatrix::new(self.num_blocks);
        let mut next = self.scores.into_iter();
        for block in 0..self.num_blocks {
            for gap in 1..=(self.num_blocks - block) {
                // Length was checked above; the iterator cannot run dry.
                if let Some(score) = next.next() {
                    matrix.set(block, gap, score);
                }
            }
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DataType;

    fn fingerprint(num_blocks: usize) -> ModelFingerprint {
        ModelFingerprint {
            model_id: "m".into(),
            dataset: "c4".into(),
            data_type: DataType::Pt,
            n_samples: 8,
            seq_len: 16,
            metric: "cosine".into(),
            num_blocks,
        }
    }

    #[test]
    fn test_new_matrix_is_all_neg_inf() {
        let m = SimilarityMatrix::new(4);
        assert_eq!(m.num_blocks(), 4);
        assert_eq!(m.gap_score(0, 1), Some(f32::NEG_INFINITY));
    }

    #[test]
    fn test_set_and_gap_score() {
        let mut m = SimilarityMatrix::new(4);
        m.set(1, 2, 0.75);
        assert_eq!(m.gap_score(1, 2), Some(0.75));
        assert_eq!(m.gap_score(3, 2), None); // span [3, 5) past the end
        assert_eq!(m.gap_score(0, 5), None);
    }

    #[test]
    fn test_gap_column_pads_invalid_spans() {
        let mut m = SimilarityMatrix::new(3);
        m.set(0, 2, 0.9);
        m.set(1, 2, 0.8);
        let col = m.gap_column(2);
        assert_eq!(col.len(), 3);
        assert_eq!(col[0], 0.9);
        assert_eq!(col[1], 0.8);
        assert_eq!(col[2], f32::NEG_INFINITY);
    }

    #[test]
    fn test_validate_finite_rejects_unset_cells() {
        let m = SimilarityMatrix::new(2);
        assert!(m.validate_finite().is_err());
    }

    #[test]
    fn test_validate_finite_ok_when_filled() {
        let mut m = SimilarityMatrix::new(3);
        for i in 0..3 {
            for gap in 1..=(3 - i) {
                m.set(i, gap, 0.5);
            }
        }
        assert!(m.validate_finite().is_ok());
    }

    #[test]
    fn test_payload_roundtrip() {
        let fp = fingerprint(2);
        let mut m = SimilarityMatrix::new(2);
        m.set(0, 1, 0.25);
        m.set(1, 1, 0.5);
        m.set(0, 2, 0.125);
        let payload = CachedSimilarity::from_matrix(&m, &fp);
        let back = payload.into_matrix(&fp, Path::new("x")).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_payload_roundtrips_through_json() {
        // JSON renders non-finite floats as null, so the padding must
        // never be serialized: a matrix with its -inf cells intact has
        // to survive an actual serialize/deserialize cycle.
        let fp = fingerprint(3);
        let mut m = SimilarityMatrix::new(3);
        for i in 0..3 {
            for gap in 1..=(3 - i) {
                m.set(i, gap, 0.1 * (i + gap) as f32);
            }
        }
        let raw = serde_json::to_string(&CachedSimilarity::from_matrix(&m, &fp)).unwrap();
        assert!(!raw.contains("null"), "payload must hold only finite cells: {raw}");
        let payload: CachedSimilarity = serde_json::from_str(&raw).unwrap();
        let back = payload.into_matrix(&fp, Path::new("x")).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.gap_score(2, 2), None);
        assert_eq!(back.gap_column(3)[1], f32::NEG_INFINITY);
    }

    #[test]
    fn test_payload_rejects_wrong_fingerprint() {
        let fp = fingerprint(2);
        let m = SimilarityMatrix::new(2);
        let payload = CachedSimilarity::from_matrix(&m, &fp);
        let other = fingerprint(2);
        let other = ModelFingerprint {
            dataset: "wikitext".into(),
            ..other
        };
        let err = payload.into_matrix(&other, Path::new("x")).unwrap_err();
        assert!(matches!(err, CompressionError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_payload_rejects_shape_mismatch() {
        let fp = fingerprint(2);
        let m = SimilarityMatrix::new(2);
        let mut payload = CachedSimilarity::from_matrix(&m, &fp);
        payload.scores.pop();
        let err = payload.into_matrix(&fp, Path::new("x")).unwrap_err();
        assert!(matches!(err, CompressionError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_payload_rejects_stale_block_count() {
        // Cache written for a 2-block model, read against a 3-block
        // model: the digests differ, and even a digest collision would
        // be caught by the block-count check.
        let fp2 = fingerprint(2);
        let m = SimilarityMatrix::new(2);
        let payload = CachedSimilarity::from_matrix(&m, &fp2);
        let fp3 = fingerprint(3);
        let err = payload.into_matrix(&fp3, Path::new("x")).unwrap_err();
        assert!(matches!(err, CompressionError::CacheCorrupt { .. }));
    }
}
