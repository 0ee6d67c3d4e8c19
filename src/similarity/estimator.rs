//! Block similarity estimation over calibration data
//!
//! Runs each calibration batch through the model once, recording the
//! hidden state entering every block plus the final output (L + 1
//! streams), then scores every (entry, exit) pair by token-mean cosine
//! similarity. Scores are averaged over all tokens of all batches so
//! the scale is independent of the calibration sample count.
//!
//! The estimator is deterministic: identical batches and weights always
//! produce identical matrices. Any randomness belongs to the sampler.

use crate::calibration::TokenBatch;
use crate::error::{CompressionError, Result};
use crate::model::ModelHandle;
use crate::similarity::SimilarityMatrix;
use ndarray::Array2;

/// Estimates the block similarity matrix for one model.
#[derive(Debug)]
pub struct BlockSimilarityEstimator<'a> {
    model: &'a ModelHandle,
}

impl<'a> BlockSimilarityEstimator<'a> {
    /// Create an estimator over a loaded model.
    pub fn new(model: &'a ModelHandle) -> Self {
        Self { model }
    }

    /// Compute the similarity matrix from calibration batches.
    ///
    /// Fails with `NumericInstability` if any intermediate similarity
    /// is non-finite (degenerate zero-norm activations included); NaN
    /// must never reach the selector's comparisons.
    pub fn estimate(&self, batches: &[TokenBatch]) -> Result<SimilarityMatrix> {
        let l = self.model.num_blocks();
        if batches.is_empty() {
            return Err(CompressionError::InvalidConfig(
                "no calibration batches on this rank".to_string(),
            ));
        }

        // Accumulate in f64: similarity sums over many tokens lose
        // precision in f32 long before the scores themselves do.
        let n_states = l + 1;
        let mut cosine_sums = vec![0.0f64; n_states * n_states];
        let mut token_total = 0usize;

        for batch in batches {
            let states = self.hidden_state_streams(batch);
            let tokens = states[0].nrows();
            token_total += tokens;

            for i in 0..n_states {
                for j in (i + 1)..n_states {
                    let sum = Self::cosine_sum(&states[i], &states[j])
                        .ok_or_else(|| CompressionError::NumericInstability {
                            lhs: i,
                            rhs: j,
                            detail: "zero-norm or non-finite hidden state".to_string(),
                        })?;
                    cosine_sums[i * n_states + j] += sum;
                }
            }
        }

        let mut matrix = SimilarityMatrix::new(l);
        for i in 0..n_states {
            for j in (i + 1)..n_states {
                let mean = cosine_sums[i * n_states + j] / token_total as f64;
                if !mean.is_finite() {
                    return Err(CompressionError::NumericInstability {
                        lhs: i,
                        rhs: j,
                        detail: format!("mean similarity is {mean}"),
                    });
                }
                matrix.set(i, j - i, mean as f32);
            }
        }
        matrix.validate_finite()?;
        Ok(matrix)
    }

    /// Run one batch through the model, collecting the hidden state
    /// entering each block plus the final output.
    fn hidden_state_streams(&self, batch: &TokenBatch) -> Vec<Array2<f32>> {
        let mut states = Vec::with_capacity(self.model.num_blocks() + 1);
        let mut hidden = self.model.embed(&batch.input_ids);
        for block in &self.model.blocks {
            states.push(hidden.clone());
            hidden = block.forward(&hidden);
        }
        states.push(hidden);
        states
    }

    /// Sum of per-token cosine similarities between two state streams.
    /// Returns None on a zero-norm token or a non-finite value.
    fn cosine_sum(a: &Array2<f32>, b: &Array2<f32>) -> Option<f64> {
        let mut sum = 0.0f64;
        for (ra, rb) in a.outer_iter().zip(b.outer_iter()) {
            let mut dot = 0.0f64;
            let mut na = 0.0f64;
            let mut nb = 0.0f64;
            for (&x, &y) in ra.iter().zip(rb.iter()) {
                dot += f64::from(x) * f64::from(y);
                na += f64::from(x) * f64::from(x);
                nb += f64::from(y) * f64::from(y);
            }
            let denom = (na * nb).sqrt();
            if denom == 0.0 {
                return None;
            }
            let cos = dot / denom;
            if !cos.is_finite() {
                return None;
            }
            sum += cos;
        }
        Some(sum)
    }
}
