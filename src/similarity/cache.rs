//! Persistent similarity cache
//!
//! One file per fingerprint family, shared across every rank of a
//! distributed run. The coordinator is the only writer: it computes,
//! persists with a write-to-temp-then-rename, and releases the barrier;
//! the other ranks load only after the barrier, never by polling for
//! the file. A crash between compute and rename is observable only as
//! a repeated miss.

use crate::coordinate::ProcessGroup;
use crate::error::{CompressionError, Result};
use crate::fingerprint::ModelFingerprint;
use crate::similarity::{CachedSimilarity, SimilarityMatrix};
use std::fs;
use std::path::{Path, PathBuf};

/// Handle to the on-disk similarity cache.
#[derive(Debug, Clone)]
pub struct SimilarityCache {
    path: PathBuf,
}

impl SimilarityCache {
    /// Open a cache at the given file path. The file need not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an entry (valid or not) is present on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Return the cached matrix for `fingerprint`, computing and
    /// persisting it on a miss.
    ///
    /// On a hit `compute_fn` is never invoked. On a miss only the
    /// coordinator computes and writes; all ranks then pass a barrier
    /// and the non-coordinators read the freshly written entry.
    pub fn get_or_compute<F>(
        &self,
        fingerprint: &ModelFingerprint,
        group: &dyn ProcessGroup,
        compute_fn: F,
    ) -> Result<SimilarityMatrix>
    where
        F: FnOnce() -> Result<SimilarityMatrix>,
    {
        if self.exists() {
            return self.load_validated(fingerprint);
        }

        if group.is_coordinator() {
            let matrix = compute_fn()?;
            self.write_atomic(&matrix, fingerprint)?;
            group.barrier()?;
            Ok(matrix)
        } else {
            // The write happens-before this read through the barrier,
            // not through filesystem timing.
            group.barrier()?;
            self.load_validated(fingerprint)
        }
    }

    /// Read-only lookup for the post_dropping stage. A missing entry is
    /// `CacheMiss`: this stage assumes the prune stage already ran.
    pub fn read(&self, fingerprint: &ModelFingerprint) -> Result<SimilarityMatrix> {
        if !self.exists() {
            return Err(CompressionError::CacheMiss {
                path: self.path.clone(),
            });
        }
        self.load_validated(fingerprint)
    }

    fn load_validated(&self, fingerprint: &ModelFingerprint) -> Result<SimilarityMatrix> {
        let raw = fs::read_to_string(&self.path)?;
        let payload: CachedSimilarity =
            serde_json::from_str(&raw).map_err(|e| CompressionError::CacheCorrupt {
                path: self.path.clone(),
                reason: format!("unparseable payload: {e}"),
            })?;
        payload.into_matrix(fingerprint, &self.path)
    }

    fn write_atomic(&self, matrix: &SimilarityMatrix, fingerprint: &ModelFingerprint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let payload = CachedSimilarity::from_matrix(matrix, fingerprint);
        let data = serde_json::to_string(&payload)?;
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::SingleProcess;
    use crate::job::DataType;
    use std::cell::Cell;
    use tempfile::TempDir;

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

    fn matrix(l: usize) -> SimilarityMatrix {
        let mut m = SimilarityMatrix::new(l);
        for i in 0..l {
            for gap in 1..=(l - i) {
                m.set(i, gap, 1.0 / (1.0 + (i + gap) as f32));
            }
        }
        m
    }

    #[test]
    fn test_miss_computes_and_persists() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("sim.json"));
        let fp = fingerprint(3);
        let group = SingleProcess::new();

        let result = cache.get_or_compute(&fp, &group, || Ok(matrix(3))).unwrap();
        assert_eq!(result, matrix(3));
        assert!(cache.exists());
    }

    #[test]
    fn test_hit_skips_compute_fn() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("sim.json"));
        let fp = fingerprint(3);
        let group = SingleProcess::new();

        cache.get_or_compute(&fp, &group, || Ok(matrix(3))).unwrap();

        let invoked = Cell::new(false);
        let result = cache
            .get_or_compute(&fp, &group, || {
                invoked.set(true);
                Ok(matrix(3))
            })
            .unwrap();
        assert!(!invoked.get(), "compute_fn must not run on a hit");
        assert_eq!(result, matrix(3));
    }

    #[test]
    fn test_double_get_or_compute_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("sim.json"));
        let fp = fingerprint(4);
        let group = SingleProcess::new();

        cache.get_or_compute(&fp, &group, || Ok(matrix(4))).unwrap();
        let bytes_first = fs::read(cache.path()).unwrap();
        let a = cache.get_or_compute(&fp, &group, || Ok(matrix(4))).unwrap();
        let b = cache.get_or_compute(&fp, &group, || Ok(matrix(4))).unwrap();
        let bytes_second = fs::read(cache.path()).unwrap();

        assert_eq!(a, b);
        assert_eq!(bytes_first, bytes_second, "hits must not rewrite the entry");
    }

    #[test]
    fn test_read_without_entry_is_cache_miss() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("sim.json"));
        let err = cache.read(&fingerprint(3)).unwrap_err();
        assert!(matches!(err, CompressionError::CacheMiss { .. }));
    }

    #[test]
    fn test_garbage_payload_is_cache_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sim.json");
        fs::write(&path, "not json at all").unwrap();
        let cache = SimilarityCache::new(&path);
        let err = cache.read(&fingerprint(3)).unwrap_err();
        assert!(matches!(err, CompressionError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_stale_fingerprint_is_cache_corrupt_not_miss() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("sim.json"));
        let group = SingleProcess::new();
        cache
            .get_or_compute(&fingerprint(3), &group, || Ok(matrix(3)))
            .unwrap();

        let mut other = fingerprint(3);
        other.dataset = "wikitext".into();
        let invoked = Cell::new(false);
        let err = cache
            .get_or_compute(&other, &group, || {
                invoked.set(true);
                Ok(matrix(3))
            })
            .unwrap_err();
        assert!(matches!(err, CompressionError::CacheCorrupt { .. }));
        assert!(!invoked.get(), "stale entries must not be silently recomputed");
    }

    #[test]
    fn test_failed_compute_leaves_no_partial_write() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("sim.json"));
        let group = SingleProcess::new();
        let err = cache
            .get_or_compute(&fingerprint(3), &group, || {
                Err(CompressionError::NumericInstability {
                    lhs: 0,
                    rhs: 1,
                    detail: "test".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, CompressionError::NumericInstability { .. }));
        assert!(!cache.exists(), "a failed compute must look like a repeated miss");
    }

    #[test]
    fn test_cache_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let cache = SimilarityCache::new(dir.path().join("nested/deeper/sim.json"));
        cache
            .get_or_compute(&fingerprint(2), &SingleProcess::new(), || Ok(matrix(2)))
            .unwrap();
        assert!(cache.exists());
    }
}
