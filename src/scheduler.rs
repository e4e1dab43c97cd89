// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `Scheduler`: the outer per-iteration loop tying the whole control
//! plane together — sync, GC, group, filter by ownership, plan, and
//! dispatch job execution across a bounded worker pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::Bucket;
use crate::config::CompactorConfig;
use crate::context::CompactionContext;
use crate::error::{self, CompactionError};
use crate::grouper::Grouper;
use crate::health::IndexHealthChecker;
use crate::job_runner::JobRunner;
use crate::merger::BlockMerger;
use crate::meta_store::MetaStore;
use crate::metrics::Metrics;
use crate::ownership::OwnershipOracle;
use crate::planner::Planner;
use crate::syncer::Syncer;

/// Summary of one `Scheduler::run_once` pass.
#[derive(Debug, Default)]
pub struct IterationReport {
    /// How many jobs were owned and dispatched this pass.
    pub jobs_dispatched: usize,
    /// `true` when no job produced output and no duplicate was
    /// collected — the signal the outer loop uses to decide whether to
    /// keep iterating without a fresh sync.
    pub finished_all_jobs: bool,
    /// `true` when `maxCompactionTime` elapsed before every owned job
    /// could be dispatched this pass. In-flight jobs were drained, not
    /// killed; undispatched jobs are picked up on the next pass.
    pub deadline_hit: bool,
}

pub struct Scheduler {
    syncer: Arc<Syncer>,
    grouper: Arc<dyn Grouper>,
    ownership: Arc<dyn OwnershipOracle>,
    job_runner: Arc<JobRunner>,
    config: CompactorConfig,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    /// Validates `config` before building the Scheduler, so a
    /// misconfigured `concurrency`/`block_sync_concurrency` of zero
    /// surfaces as a construction error instead of being silently
    /// clamped at dispatch time.
    pub fn new(
        syncer: Arc<Syncer>,
        grouper: Arc<dyn Grouper>,
        ownership: Arc<dyn OwnershipOracle>,
        job_runner: Arc<JobRunner>,
        config: CompactorConfig,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Scheduler { syncer, grouper, ownership, job_runner, config, metrics })
    }

    /// Assembles the whole pipeline — `MetaStore`, `Syncer`, `JobRunner`,
    /// and this `Scheduler` — from one `CompactorConfig` plus the
    /// external capabilities a caller provides. This is the entry point
    /// a binary reaches for; `Scheduler::new` stays available for
    /// callers (and tests) that already hold a `Syncer`/`JobRunner` they
    /// built by hand.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: CompactorConfig,
        bucket: Arc<dyn Bucket>,
        merger: Arc<dyn BlockMerger>,
        health_checker: Arc<dyn IndexHealthChecker>,
        planner: Arc<dyn Planner>,
        grouper: Arc<dyn Grouper>,
        ownership: Arc<dyn OwnershipOracle>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let meta_store = MetaStore::new(
            Arc::clone(&bucket),
            config.min_block_age,
            config.block_sync_concurrency,
            config.remove_no_compact_marked,
        );
        let syncer = Arc::new(Syncer::new(Arc::clone(&bucket), meta_store, Arc::clone(&metrics)));

        let job_runner = Arc::new(
            JobRunner::new(bucket, merger, health_checker, planner, config.compact_dir.clone(), Arc::clone(&metrics))
                .with_skip_out_of_order(config.skip_blocks_with_out_of_order_chunks),
        );

        Ok(Scheduler { syncer, grouper, ownership, job_runner, config, metrics })
    }

    /// Runs iterations until `cancel` fires, or forever if it never
    /// does. Each iteration's errors are logged; a `Halt` stops the
    /// whole loop since it signals a fundamental inconsistency.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CompactionError> {
        loop {
            if cancel.is_cancelled() {
                info!("scheduler cancelled, stopping");
                return Ok(());
            }

            let iter_ctx = CompactionContext::for_iteration(cancel.clone(), self.config.max_compaction_time);
            match self.run_once(&iter_ctx).await {
                Ok(report) => {
                    debug!(
                        jobs_dispatched = report.jobs_dispatched,
                        finished_all_jobs = report.finished_all_jobs,
                        deadline_hit = report.deadline_hit,
                        "iteration complete"
                    );
                    // A deadline hit stops the outer loop unconditionally
                    // (S6): whatever jobs didn't get dispatched this pass
                    // are picked up fresh next time the caller invokes
                    // `run`, rather than the Scheduler looping on its own
                    // past a budget the caller asked it to respect.
                    if report.deadline_hit || report.finished_all_jobs {
                        return Ok(());
                    }
                }
                Err(err) => {
                    if err.is_halt() {
                        warn!(error = %err, "halting error, stopping scheduler");
                        return Err(err);
                    }
                    warn!(error = %err, "iteration failed, will retry next pass");
                }
            }
        }
    }

    /// One full iteration: sync, GC, group, filter, sweep, dispatch.
    pub async fn run_once(&self, ctx: &CompactionContext) -> Result<IterationReport, CompactionError> {
        self.syncer.sync_metas().await?;
        let collected = self.syncer.garbage_collect().await?;

        let metas = self.syncer.metas();
        let mut jobs = self.grouper.groups(&metas);
        jobs = self.filter_own_jobs(jobs).await;
        self.sort_jobs(&mut jobs);

        if let Err(err) = self.sweep_stray_workdirs(&jobs).await {
            warn!(error = %err, "stray workdir sweep failed, continuing");
        }

        let concurrency = self.config.concurrency;
        let job_runner = Arc::clone(&self.job_runner);
        let ownership = Arc::clone(&self.ownership);
        let metrics = Arc::clone(&self.metrics);

        // `halted` is set by the first job to fail and is checked before
        // every subsequent item is pulled off `jobs`. Jobs already inside
        // `buffer_unordered`'s window when that happens are left to run
        // to completion and are folded into `results` below; only jobs
        // that haven't started yet are skipped.
        let halted = Arc::new(AtomicBool::new(false));

        // `maxCompactionTime` bounds the whole dispatch loop's wall
        // clock, not any single job (§4.H step 6, S6): once it elapses,
        // stop handing out new work but let jobs already dispatched run
        // to completion rather than aborting them. This is independent
        // of the per-job timeout `CompactionContext` applies inside
        // `JobRunner::run` (§6's "budget per Compact invocation").
        let dispatch_started = std::time::Instant::now();
        let max_compaction_time = self.config.max_compaction_time;
        let deadline_hit = Arc::new(AtomicBool::new(false));

        let dispatch = stream::iter(jobs.into_iter())
            .take_while({
                let halted = Arc::clone(&halted);
                let deadline_hit = Arc::clone(&deadline_hit);
                move |_| {
                    if halted.load(Ordering::Acquire) {
                        return future::ready(false);
                    }
                    if let Some(budget) = max_compaction_time {
                        if dispatch_started.elapsed() >= budget {
                            deadline_hit.store(true, Ordering::Release);
                            return future::ready(false);
                        }
                    }
                    future::ready(true)
                }
            })
            .map(|job| {
                let job_runner = Arc::clone(&job_runner);
                let ownership = Arc::clone(&ownership);
                let metrics = Arc::clone(&metrics);
                let halted = Arc::clone(&halted);
                let ctx = ctx.clone();
                async move {
                    // Ownership re-checked immediately before execution
                    // to minimize the race window against the first
                    // filter pass.
                    match ownership.owns(&job).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(job_key = %job.key, "ownership lost before dispatch, skipping");
                            return Ok(None);
                        }
                        Err(err) => {
                            warn!(job_key = %job.key, error = %err, "ownership oracle error, skipping job this pass");
                            return Ok(None);
                        }
                    }
                    let outcome = Self::run_job_with_repair(&job_runner, &job, &ctx, &metrics).await;
                    if outcome.is_err() {
                        halted.store(true, Ordering::Release);
                    }
                    outcome.map(Some)
                }
            })
            .buffer_unordered(concurrency);

        let results: Vec<Result<Option<crate::job_runner::JobOutcome>, CompactionError>> = dispatch.collect().await;

        let mut errors = Vec::new();
        let mut dispatched = 0usize;
        let mut any_progress = collected > 0;
        for result in results {
            match result {
                Ok(Some(outcome)) => {
                    dispatched += 1;
                    any_progress = any_progress || outcome.reschedule;
                }
                Ok(None) => {}
                Err(err) => errors.push(err),
            }
        }

        if let Some(aggregated) = error::aggregate(errors) {
            return Err(aggregated);
        }

        Ok(IterationReport {
            jobs_dispatched: dispatched,
            finished_all_jobs: !any_progress,
            deadline_hit: deadline_hit.load(Ordering::Acquire),
        })
    }

    /// Runs a job, catching the `Issue347` class specifically: on that
    /// classification the Scheduler drives the repair sub-routine
    /// (download → repair → verify → upload → mark original for
    /// deletion) itself rather than treating it like any other job
    /// failure. Repair success is reported as a reschedule-worthy
    /// outcome so the next `MetaStore::fetch` picks up the repaired
    /// block; repair failure re-surfaces the original `Issue347` error.
    async fn run_job_with_repair(
        job_runner: &JobRunner,
        job: &crate::block::Job,
        ctx: &CompactionContext,
        metrics: &Metrics,
    ) -> Result<crate::job_runner::JobOutcome, CompactionError> {
        match job_runner.run(job, ctx).await {
            Err(CompactionError::Issue347 { block_id, source }) => {
                let Some(original) = job.metas.iter().find(|m| m.id == block_id) else {
                    return Err(CompactionError::Issue347 { block_id, source });
                };
                let workdir = job_runner.workdir_for(&job.key);
                match crate::repair::repair_block(job_runner.bucket(), job_runner.merger(), &workdir, original).await
                {
                    Ok(repaired_id) => {
                        metrics.issue347_repairs_total.inc();
                        info!(
                            original = %block_id,
                            repaired = %repaired_id,
                            "issue-347 repair succeeded, flagging iteration to re-run"
                        );
                        Ok(crate::job_runner::JobOutcome { reschedule: true, output_ids: vec![repaired_id] })
                    }
                    Err(repair_err) => {
                        warn!(block_id = %block_id, error = %repair_err, "issue-347 repair failed, propagating original error");
                        Err(CompactionError::Issue347 { block_id, source })
                    }
                }
            }
            other => other,
        }
    }

    async fn filter_own_jobs(&self, jobs: Vec<crate::block::Job>) -> Vec<crate::block::Job> {
        let mut owned = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.ownership.owns(&job).await {
                Ok(true) => owned.push(job),
                Ok(false) => debug!(job_key = %job.key, "job not owned, skipping"),
                Err(err) => warn!(job_key = %job.key, error = %err, "ownership oracle error, skipping job"),
            }
        }
        owned
    }

    /// Jobs dispatch in `Key` ascending order, for deterministic test
    /// behavior. A deployment with different priority needs would sort
    /// here instead.
    fn sort_jobs(&self, jobs: &mut [crate::block::Job]) {
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// Removes local workdirs left behind by a crashed or killed prior
    /// process whose job no longer exists this pass — a workdir is only
    /// ever useful for re-downloading the same job's inputs.
    async fn sweep_stray_workdirs(&self, live_jobs: &[crate::block::Job]) -> anyhow::Result<()> {
        let live_keys: HashSet<&str> = live_jobs.iter().map(|j| j.key.as_str()).collect();
        let compact_dir = self.job_runner.compact_dir();

        let mut entries = match tokio::fs::read_dir(compact_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !live_keys.contains(name.as_ref()) {
                debug!(workdir = %name, "sweeping stray workdir");
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
            }
        }
        Ok(())
    }
}
