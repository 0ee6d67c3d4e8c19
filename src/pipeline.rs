//! Compression pipeline orchestration
//!
//! The pipeline runs as a state machine:
//!
//! ```text
//! Init -> Estimating -> Selecting -> SavedPlan            (prune pass)
//! Init -> Selecting -> Surgery -> Saving -> Done          (post_dropping pass)
//! ```
//!
//! with `Failed` reachable from every state. The prune pass estimates
//! similarities (skipped on a cache hit), selects the drop plan, and
//! persists the plan sidecars; the post_dropping pass re-derives the
//! identical plan from the cache, performs the surgery, and writes the
//! compressed checkpoint. All ranks hold at a barrier before saving so
//! the checkpoint is written exactly once, after every rank agrees on
//! the plan. Failures abort before anything is saved.

use crate::calibration::{CalibrationSampler, DatasetProvider};
use crate::coordinate::ProcessGroup;
use crate::error::{CompressionError, Result};
use crate::fingerprint::ModelFingerprint;
use crate::job::{BlockDropMethod, CompressionJob};
use crate::model::{ModelHandle, ModelProvider};
use crate::select::{BlockSelector, DropPlan, DropPolicy};
use crate::similarity::{BlockSimilarityEstimator, SimilarityCache, SimilarityMatrix};
use crate::surgeon::{BlockIndexMap, ModelSurgeon};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Instant;

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PipelineState {
    /// Not started.
    #[default]
    Init,
    /// Running calibration batches through the model.
    Estimating,
    /// Deriving the drop plan from the similarity matrix.
    Selecting,
    /// Prune pass finished: plan sidecars persisted.
    SavedPlan,
    /// Removing blocks and renumbering.
    Surgery,
    /// Writing the compressed checkpoint.
    Saving,
    /// post_dropping pass finished.
    Done,
    /// Aborted; nothing was saved after the failure.
    Failed,
}

impl PipelineState {
    /// Check if the pipeline reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::SavedPlan | PipelineState::Done | PipelineState::Failed)
    }

    /// Display name for logs.
    pub fn display_name(&self) -> &'static str {
        match self {
            PipelineState::Init => "Init",
            PipelineState::Estimating => "Estimating",
            PipelineState::Selecting => "Selecting",
            PipelineState::SavedPlan => "Saved Plan",
            PipelineState::Surgery => "Surgery",
            PipelineState::Saving => "Saving",
            PipelineState::Done => "Done",
            PipelineState::Failed => "Failed",
        }
    }
}

/// Metrics collected across a pipeline run, persisted as
/// `metrics.json` next to the checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Whether the similarity matrix came from the cache.
    pub cache_hit: bool,
    /// Block count before compression.
    pub blocks_before: usize,
    /// Block count after compression.
    pub blocks_after: usize,
    /// Dropped block indices under the original ordering.
    pub dropped: Vec<usize>,
    /// Mean similarity score over the dropped blocks (the run score
    /// for the consecutive policy).
    pub drop_score: Option<f32>,
    /// Duration of each stage in seconds.
    pub stage_durations: Vec<(PipelineState, f64)>,
}

impl PipelineMetrics {
    /// Record a stage duration.
    pub fn record_stage(&mut self, state: PipelineState, secs: f64) {
        self.stage_durations.push((state, secs));
    }

    /// Total time across recorded stages.
    pub fn total_duration_secs(&self) -> f64 {
        self.stage_durations.iter().map(|(_, d)| d).sum()
    }
}

/// Orchestrates the two block-drop passes over one job.
pub struct CompressionPipeline<'a> {
    job: &'a CompressionJob,
    group: &'a dyn ProcessGroup,
    state: PipelineState,
    metrics: PipelineMetrics,
}

impl<'a> CompressionPipeline<'a> {
    /// Create a pipeline for a job.
    pub fn new(job: &'a CompressionJob, group: &'a dyn ProcessGroup) -> Self {
        Self {
            job,
            group,
            state: PipelineState::Init,
            metrics: PipelineMetrics::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Collected metrics.
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Run the pass named by the job's `block_drop_method`.
    pub fn run(
        &mut self,
        model: &ModelHandle,
        dataset: &dyn DatasetProvider,
        provider: &dyn ModelProvider,
    ) -> Result<()> {
        match self.job.block_drop_method {
            BlockDropMethod::Discrete | BlockDropMethod::Consecutive => {
                self.run_prune(model, dataset).map(|_| ())
            }
            BlockDropMethod::PostDropping => self.run_post_dropping(model, provider),
        }
    }

    /// Prune pass: estimate (or reuse cached) similarities, select the
    /// drop plan, persist the plan sidecars.
    pub fn run_prune(
        &mut self,
        model: &ModelHandle,
        dataset: &dyn DatasetProvider,
    ) -> Result<DropPlan> {
        match self.prune_inner(model, dataset) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    /// post_dropping pass: re-derive the plan from the cache, run the
    /// surgery, save the compressed checkpoint.
    pub fn run_post_dropping(
        &mut self,
        model: &ModelHandle,
        provider: &dyn ModelProvider,
    ) -> Result<()> {
        match self.post_dropping_inner(model, provider) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    fn prune_inner(
        &mut self,
        model: &ModelHandle,
        dataset: &dyn DatasetProvider,
    ) -> Result<DropPlan> {
        let policy = self.job.block_drop_method.policy().ok_or_else(|| {
            CompressionError::InvalidConfig(
                "block_drop_method = post_dropping is not a prune pass".to_string(),
            )
        })?;
        // Budget check before any estimator work.
        BlockSelector::validate_budget(self.job.drop_n, model.num_blocks())?;
        self.metrics.blocks_before = model.num_blocks();

        let fingerprint = ModelFingerprint::from_job(self.job, model);
        let cache = SimilarityCache::new(&self.job.similarity_cache_file);
        let matrix = self.estimate_or_load(&cache, &fingerprint, model, dataset)?;

        self.state = PipelineState::Selecting;
        let started = Instant::now();
        let plan = BlockSelector::new(policy).select(&matrix, self.job.drop_n)?;
        self.metrics
            .record_stage(PipelineState::Selecting, started.elapsed().as_secs_f64());
        self.record_plan(&matrix, &plan);

        self.persist_plan_sidecars(model.num_blocks(), &plan)?;
        self.state = PipelineState::SavedPlan;
        Ok(plan)
    }

    fn post_dropping_inner(
        &mut self,
        model: &ModelHandle,
        provider: &dyn ModelProvider,
    ) -> Result<()> {
        BlockSelector::validate_budget(self.job.drop_n, model.num_blocks())?;
        self.metrics.blocks_before = model.num_blocks();

        let fingerprint = ModelFingerprint::from_job(self.job, model);
        let cache = SimilarityCache::new(&self.job.similarity_cache_file);
        // This pass assumes prune already ran: a missing entry is a
        // CacheMiss, never a recompute.
        let matrix = cache.read(&fingerprint)?;
        self.metrics.cache_hit = true;

        self.state = PipelineState::Selecting;
        let started = Instant::now();
        let recorded = self.load_recorded_plan()?;
        let plan = BlockSelector::new(recorded.policy).select(&matrix, self.job.drop_n)?;
        if plan != recorded {
            return Err(CompressionError::CacheCorrupt {
                path: self.job.similarity_cache_file.clone(),
                reason: format!(
                    "re-derived plan {:?} disagrees with the recorded plan {:?}",
                    plan.indices, recorded.indices
                ),
            });
        }
        self.metrics
            .record_stage(PipelineState::Selecting, started.elapsed().as_secs_f64());
        self.record_plan(&matrix, &plan);

        self.state = PipelineState::Surgery;
        let started = Instant::now();
        let (compressed, map) = ModelSurgeon::new().apply(model, &plan)?;
        self.metrics.blocks_after = compressed.num_blocks();
        self.metrics
            .record_stage(PipelineState::Surgery, started.elapsed().as_secs_f64());

        // Every rank must agree the plan is final before anything is
        // written.
        self.group.barrier()?;
        self.state = PipelineState::Saving;
        let started = Instant::now();
        if self.group.is_coordinator() {
            provider.save(&compressed, &self.job.compressed_model_save_path)?;
            self.write_sidecar(&self.job.drop_plan_path(), &plan)?;
            self.write_sidecar(&self.job.block_mapping_path(), &map)?;
            self.write_sidecar(&self.job.metrics_path(), &self.metrics.clone())?;
        }
        self.group.barrier()?;
        self.metrics
            .record_stage(PipelineState::Saving, started.elapsed().as_secs_f64());

        self.state = PipelineState::Done;
        Ok(())
    }

    /// Pull the matrix from the cache, estimating it on a miss. The
    /// Estimating state is skipped entirely on a hit.
    fn estimate_or_load(
        &mut self,
        cache: &SimilarityCache,
        fingerprint: &ModelFingerprint,
        model: &ModelHandle,
        dataset: &dyn DatasetProvider,
    ) -> Result<SimilarityMatrix> {
        let hit = cache.exists();
        self.metrics.cache_hit = hit;
        if !hit {
            self.state = PipelineState::Estimating;
        }
        let started = Instant::now();
        let sampler = CalibrationSampler::new(self.job.calibration_config());
        let group = self.group;
        let matrix = cache.get_or_compute(fingerprint, group, || {
            // Only the coordinator runs this closure, on behalf of the
            // whole group: the fingerprint records num_samples samples,
            // so the estimate must cover all of them, not one shard.
            let batches = sampler.sample_full(dataset, group)?;
            BlockSimilarityEstimator::new(model).estimate(&batches)
        })?;
        if !hit {
            self.metrics
                .record_stage(PipelineState::Estimating, started.elapsed().as_secs_f64());
        }
        Ok(matrix)
    }

    fn record_plan(&mut self, matrix: &SimilarityMatrix, plan: &DropPlan) {
        self.metrics.dropped = plan.indices.clone();
        self.metrics.blocks_after = self.metrics.blocks_before - plan.drop_n();
        self.metrics.drop_score = match plan.policy {
            DropPolicy::Discrete => {
                let sum: f32 = plan
                    .indices
                    .iter()
                    .filter_map(|&i| matrix.gap_score(i, 1))
                    .sum();
                Some(sum / plan.drop_n() as f32)
            }
            DropPolicy::Consecutive => matrix.gap_score(plan.indices[0], plan.drop_n()),
        };
    }

    /// Write the plan and mapping sidecars at the end of the prune
    /// pass. Coordinator writes, everyone waits.
    fn persist_plan_sidecars(&mut self, num_blocks: usize, plan: &DropPlan) -> Result<()> {
        if self.group.is_coordinator() {
            let map = BlockIndexMap::from_plan(num_blocks, plan)?;
            fs::create_dir_all(&self.job.compressed_model_save_path)?;
            self.write_sidecar(&self.job.drop_plan_path(), plan)?;
            self.write_sidecar(&self.job.block_mapping_path(), &map)?;
            self.write_sidecar(&self.job.metrics_path(), &self.metrics.clone())?;
        }
        self.group.barrier()
    }

    /// Read the prune pass's recorded plan back for the post_dropping
    /// pass (it carries the policy, which `post_dropping` replaces in
    /// the job config).
    fn load_recorded_plan(&self) -> Result<DropPlan> {
        let path = self.job.drop_plan_path();
        if !path.exists() {
            return Err(CompressionError::InvalidConfig(format!(
                "no drop plan at {}: run the prune stage first",
                path.display()
            )));
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_sidecar<T: Serialize>(&self, path: &std::path::Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
