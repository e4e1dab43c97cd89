// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `JobRunner` — the operational heart: executes one Job end-to-end
//! (download → merge → upload → retire).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, trace, warn};

use crate::block::{BlockId, BlockMeta, Job, NoCompactMark, SHARD_ID_LABEL};
use crate::bucket::{deletion_mark_key, no_compact_mark_key, put_complete_block, Bucket};
use crate::context::CompactionContext;
use crate::error::CompactionError;
use crate::health::{BlockHealth, IndexHealthChecker};
use crate::merger::BlockMerger;
use crate::metrics::Metrics;
use crate::planner::Planner;

/// The outcome of downloading and verifying one planned block.
enum DownloadOutcome {
    Ready(PathBuf),
    /// Out-of-order chunks, auto-skip configured: the block was marked
    /// no-compact instead of failing the job.
    Skipped,
}

/// The result of running one job.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    /// Whether the Scheduler should run another full pass even if the
    /// worker pool currently has no queued jobs.
    pub reschedule: bool,
    pub output_ids: Vec<BlockId>,
}

impl JobOutcome {
    fn no_op() -> Self {
        JobOutcome { reschedule: false, output_ids: Vec::new() }
    }
}

pub struct JobRunner {
    bucket: Arc<dyn Bucket>,
    merger: Arc<dyn BlockMerger>,
    health_checker: Arc<dyn IndexHealthChecker>,
    planner: Arc<dyn Planner>,
    compact_dir: PathBuf,
    metrics: Arc<Metrics>,
    skip_out_of_order: bool,
}

impl JobRunner {
    pub fn new(
        bucket: Arc<dyn Bucket>,
        merger: Arc<dyn BlockMerger>,
        health_checker: Arc<dyn IndexHealthChecker>,
        planner: Arc<dyn Planner>,
        compact_dir: PathBuf,
        metrics: Arc<Metrics>,
    ) -> Self {
        JobRunner {
            bucket,
            merger,
            health_checker,
            planner,
            compact_dir,
            metrics,
            skip_out_of_order: false,
        }
    }

    /// Enables auto-skip: an out-of-order block gets a no-compact mark
    /// instead of failing the job, and the iteration reschedules so the
    /// next `MetaStore::fetch` excludes it via `NoCompactFilter`.
    pub fn with_skip_out_of_order(mut self, skip: bool) -> Self {
        self.skip_out_of_order = skip;
        self
    }

    pub fn workdir_for(&self, job_key: &str) -> PathBuf {
        self.compact_dir.join(job_key)
    }

    pub fn compact_dir(&self) -> &Path {
        &self.compact_dir
    }

    /// The bucket this runner downloads from and uploads to, exposed so
    /// the Scheduler can drive the Issue-347 repair sub-routine against
    /// the same backend without threading a second handle through
    /// construction.
    pub fn bucket(&self) -> Arc<dyn Bucket> {
        Arc::clone(&self.bucket)
    }

    /// The merger this runner invokes, exposed for the same reason as
    /// [`Self::bucket`].
    pub fn merger(&self) -> Arc<dyn BlockMerger> {
        Arc::clone(&self.merger)
    }

    /// Executes `job`. Returns `Ok` with `reschedule=false` when the
    /// Planner found nothing to do this pass; `Ok` with
    /// `reschedule=true` on any iteration that made progress, including
    /// an all-empty merge result that only pruned inputs.
    pub async fn run(&self, job: &Job, ctx: &CompactionContext) -> Result<JobOutcome, CompactionError> {
        self.metrics.runs_started.inc();
        let workdir = self.workdir_for(&job.key);

        // Step 1: workdir setup (0750). Survives crashes to amortize
        // the next run's re-download; removed only on a clean exit.
        create_workdir(&workdir).await.map_err(CompactionError::retry)?;

        let result = self.run_inner(job, ctx, &workdir).await;

        match &result {
            Ok(_) => {
                if let Err(err) = tokio::fs::remove_dir_all(&workdir).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(job_key = %job.key, error = %err, "failed to clean up workdir after success");
                    }
                }
                self.metrics.runs_completed.inc();
            }
            Err(_) => {
                // Leave the workdir for post-mortem / re-download.
                self.metrics.runs_failed.inc();
            }
        }

        result
    }

    async fn run_inner(
        &self,
        job: &Job,
        ctx: &CompactionContext,
        workdir: &Path,
    ) -> Result<JobOutcome, CompactionError> {
        // Step 2: plan.
        let plan = self.planner.plan(&job.metas);
        if plan.is_empty() {
            trace!(job_key = %job.key, "planner returned an empty plan, nothing to do this pass");
            return Ok(JobOutcome::no_op());
        }

        // The rest of the run races the iteration's cancellation token
        // and `maxCompactionTime` deadline; a hit either way surfaces
        // as Retry, never Halt, since no output was uploaded.
        match ctx.run(self.execute_plan(job, plan, workdir)).await {
            Ok(result) => result,
            Err(ctx_err) => Err(CompactionError::retry(anyhow::anyhow!(ctx_err.to_string()))),
        }
    }

    async fn execute_plan(
        &self,
        job: &Job,
        plan: Vec<BlockMeta>,
        workdir: &Path,
    ) -> Result<JobOutcome, CompactionError> {
        // Step 3: download & verify, concurrently, fan-out = |plan|.
        let downloads = join_all(plan.iter().map(|meta| self.download_and_verify(meta, workdir))).await;
        let mut first_error: Option<CompactionError> = None;
        let mut input_dirs = Vec::with_capacity(plan.len());
        let mut any_skipped = false;
        for (meta, outcome) in plan.iter().zip(downloads) {
            match outcome {
                Ok(DownloadOutcome::Ready(dir)) => input_dirs.push((meta.id.clone(), dir)),
                Ok(DownloadOutcome::Skipped) => any_skipped = true,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if any_skipped {
            // A block was excluded via no-compact mark this pass; the
            // plan is now stale. Re-run on the next iteration once
            // `NoCompactFilter` has dropped it from the meta set.
            return Ok(JobOutcome { reschedule: true, output_ids: Vec::new() });
        }

        // Step 4: merge.
        let output_ids = if job.use_splitting {
            self.merger
                .compact_with_splitting(workdir, &input_dirs, job.splitting_shards)
                .await
                .map_err(CompactionError::halt)?
        } else {
            vec![self.merger.compact(workdir, &input_dirs).await.map_err(CompactionError::halt)?]
        };

        // Step 5: empty result.
        if output_ids.iter().all(BlockId::is_zero) {
            for meta in &plan {
                if meta.is_empty() {
                    self.mark_for_deletion(&meta.id).await?;
                }
            }
            return Ok(JobOutcome { reschedule: true, output_ids: Vec::new() });
        }

        // Step 6: finalize & upload each non-zero output, concurrently.
        let uploads = join_all(output_ids.iter().enumerate().filter(|(_, id)| !id.is_zero()).map(
            |(i, id)| self.finalize_and_upload(job, &plan, id, i, output_ids.len(), workdir),
        ))
        .await;
        let mut finalized = Vec::with_capacity(uploads.len());
        for result in uploads {
            finalized.push(result?);
        }

        self.metrics.group_compactions.inc();

        // Step 7: retire inputs — only after outputs are uploaded and
        // verified, so a crash or shutdown mid-retire never deletes an
        // input whose merged output never made it to the bucket.
        for (id, _dir) in &input_dirs {
            self.retire_input(id).await?;
        }

        Ok(JobOutcome { reschedule: true, output_ids: finalized })
    }

    async fn download_and_verify(
        &self,
        meta: &BlockMeta,
        workdir: &Path,
    ) -> Result<DownloadOutcome, CompactionError> {
        let dest = workdir.join(meta.id.as_str());
        tokio::fs::create_dir_all(&dest).await.map_err(CompactionError::retry)?;

        // Real download would stream meta/index/chunks from the bucket;
        // the byte format itself is out of scope here. We still touch
        // the bucket to surface transient fetch failures as Retry.
        let meta_bytes = self
            .bucket
            .get(&crate::bucket::meta_key(meta.id.as_str()))
            .await
            .map_err(|e| CompactionError::retry(anyhow::anyhow!(e)))?;
        let _ = meta_bytes;

        match self.health_checker.check(&meta.id, &dest).await.map_err(CompactionError::retry)? {
            BlockHealth::Healthy => Ok(DownloadOutcome::Ready(dest)),
            BlockHealth::Critical(reason) => {
                Err(CompactionError::halt(anyhow::anyhow!("block {} failed index health check: {reason}", meta.id)))
            }
            BlockHealth::OutOfOrder if self.skip_out_of_order => {
                self.mark_no_compact(&meta.id).await?;
                Ok(DownloadOutcome::Skipped)
            }
            BlockHealth::OutOfOrder => Err(CompactionError::OutOfOrder {
                block_id: meta.id.clone(),
                source: anyhow::anyhow!("out-of-order chunks in block {}", meta.id),
            }),
            BlockHealth::Issue347 => Err(CompactionError::Issue347 {
                block_id: meta.id.clone(),
                source: anyhow::anyhow!("issue-347 corruption in block {}", meta.id),
            }),
            BlockHealth::Prometheus5372(reason) => {
                Err(CompactionError::retry(anyhow::anyhow!("prometheus #5372 in block {}: {reason}", meta.id)))
            }
        }
    }

    async fn mark_no_compact(&self, id: &BlockId) -> Result<(), CompactionError> {
        let mark = NoCompactMark {
            block_id: id.clone(),
            timestamp_millis: now_millis(),
            reason: "out-of-order chunks, auto-skipped".to_string(),
        };
        let bytes = bytes::Bytes::from(serde_json::to_vec(&mark).expect("mark serializes"));
        self.bucket
            .upload(&no_compact_mark_key(id.as_str()), bytes)
            .await
            .map_err(|e| CompactionError::retry(anyhow::anyhow!(e)))?;
        self.metrics.blocks_marked_for_no_compaction.inc();
        Ok(())
    }

    async fn finalize_and_upload(
        &self,
        job: &Job,
        plan: &[BlockMeta],
        output_id: &BlockId,
        shard_index: usize,
        shard_count: usize,
        workdir: &Path,
    ) -> Result<BlockId, CompactionError> {
        let mut labels = job.labels.clone();
        if job.use_splitting {
            labels.insert(SHARD_ID_LABEL.to_string(), format!("{}_of_{}", shard_index + 1, shard_count));
        }

        // The merger may leave a `tombstones` file alongside the output
        // it wrote under `<workdir>/<outputID>/` to track series deleted
        // during the merge; that bookkeeping file never ships with the
        // uploaded block (§4.G step 6).
        let tombstones = workdir.join(output_id.as_str()).join("tombstones");
        if let Err(err) = tokio::fs::remove_file(&tombstones).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(job_key = %job.key, output_id = %output_id, error = %err, "failed to remove tombstones file before upload");
            }
        }

        // Sources/level/samples/bounds are derived from `plan` — the
        // subset the Planner actually selected, downloaded, and merged —
        // never from the job's full meta list. A Planner is free to
        // return a strict subset (see planner.rs); claiming provenance
        // for a sibling block that was never merged would let the next
        // pass's DeduplicateFilter mistake that untouched sibling for a
        // duplicate of this output and garbage-collect it.
        let sources: std::collections::BTreeSet<_> = plan.iter().flat_map(|m| m.compaction_sources.clone()).collect();
        let compaction_level = plan.iter().map(|m| m.compaction_level).max().unwrap_or(1) + 1;
        let num_samples = plan.iter().map(|m| m.num_samples).sum();
        let min_time = plan.iter().map(|m| m.min_time).min().unwrap_or(0);
        let max_time = plan.iter().map(|m| m.max_time).max().unwrap_or(0);

        let meta = BlockMeta {
            id: output_id.clone(),
            min_time,
            max_time,
            compaction_level,
            compaction_sources: sources,
            external_labels: labels,
            downsample_resolution: job.downsample_resolution,
            num_samples,
            hash_func: None,
            checksums: Default::default(),
        };

        // Verify the output's index against claimed min/max. We don't
        // hold real index bytes, so the check is on the metadata
        // invariant itself: the claimed range must be non-inverted.
        if meta.min_time > meta.max_time {
            return Err(CompactionError::halt(anyhow::anyhow!(
                "output block {} has inverted time range [{}, {}]",
                meta.id,
                meta.min_time,
                meta.max_time
            )));
        }

        put_complete_block(self.bucket.as_ref(), &meta)
            .await
            .map_err(|e| CompactionError::retry(anyhow::anyhow!(e)))?;

        debug!(job_key = %job.key, output_id = %output_id, "uploaded merged block");
        Ok(output_id.clone())
    }

    async fn mark_for_deletion(&self, id: &BlockId) -> Result<(), CompactionError> {
        let detached = CompactionContext::background().detach();
        let key = deletion_mark_key(id.as_str());
        let mark = serde_json::json!({ "block_id": id.as_str(), "reason": "empty input pruned by compaction" });
        let bytes = bytes::Bytes::from(serde_json::to_vec(&mark).expect("mark serializes"));
        let bucket = Arc::clone(&self.bucket);
        match detached.run(async move { bucket.upload(&key, bytes).await }).await {
            Ok(Ok(())) => {
                self.metrics.blocks_marked_for_deletion.inc();
                Ok(())
            }
            Ok(Err(err)) => Err(CompactionError::retry(anyhow::anyhow!(err))),
            Err(err) => Err(CompactionError::retry(anyhow::anyhow!(err.to_string()))),
        }
    }

    async fn retire_input(&self, id: &BlockId) -> Result<(), CompactionError> {
        self.mark_for_deletion(id).await?;
        let local_dir = self.compact_dir.join(id.as_str());
        if let Err(err) = tokio::fs::remove_dir_all(&local_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(block_id = %id, error = %err, "failed to remove retired block's local directory");
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn create_workdir(dir: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_workdir(dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
