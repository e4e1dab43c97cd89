// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end scenario tests driving the public `Scheduler`/`JobRunner`
//! surface against in-memory test doubles, in the style of the unit
//! scenarios already covered per-module but exercised here through the
//! full pipeline (sync → GC → group → dispatch).

use std::sync::Arc;
use std::time::Duration;

use bucket_compactor::block::{BlockId, BlockMeta, ExternalLabels, Job};
use bucket_compactor::bucket::{deletion_mark_key, meta_key, Bucket, InMemoryBucket};
use bucket_compactor::config::CompactorConfig;
use bucket_compactor::context::CompactionContext;
use bucket_compactor::health::{AlwaysHealthy, ScriptedHealthChecker};
use bucket_compactor::job_runner::JobRunner;
use bucket_compactor::merger::{BlockMerger, SummingMerger};
use bucket_compactor::meta_store::MetaStore;
use bucket_compactor::metrics::Metrics;
use bucket_compactor::ownership::OwnsEverything;
use bucket_compactor::planner::HorizonPlanner;
use bucket_compactor::scheduler::Scheduler;
use bucket_compactor::syncer::Syncer;
use bytes::Bytes;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

async fn put_block(bucket: &InMemoryBucket, id: &str, level: u32, sources: &[&str], tenant: &str, min_time: i64, samples: u64) {
    let mut labels = ExternalLabels::new();
    labels.insert("tenant".into(), tenant.into());
    let meta = BlockMeta {
        id: BlockId::from(id.to_string()),
        min_time,
        max_time: min_time + 100,
        compaction_level: level,
        compaction_sources: sources.iter().map(|s| BlockId::from(s.to_string())).collect(),
        external_labels: labels,
        downsample_resolution: 0,
        num_samples: samples,
        hash_func: None,
        checksums: Default::default(),
    };
    bucket.upload(&meta_key(id), Bytes::from(serde_json::to_vec(&meta).unwrap())).await.unwrap();
    bucket.upload(&format!("{id}/index"), Bytes::from_static(b"idx")).await.unwrap();
}

fn metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new(&Registry::new()).unwrap())
}

/// S3 - Duplicate GC: a level-2 block fully covering a level-1 block's
/// sources causes the level-1 block to be excluded by `MetaStore::fetch`
/// and then deletion-marked by the Syncer's GC pass.
#[tokio::test]
async fn duplicate_gc_marks_superseded_block_s3() {
    let bucket = Arc::new(InMemoryBucket::new());
    put_block(&bucket, "a", 2, &["x", "y"], "t", 0, 20).await;
    put_block(&bucket, "x", 1, &["x"], "t", 0, 10).await;

    let metrics = metrics();
    let meta_store = MetaStore::new(bucket.clone(), Duration::ZERO, 4, false);
    let syncer = Arc::new(Syncer::new(bucket.clone(), meta_store, metrics.clone()));

    syncer.sync_metas().await.unwrap();
    assert_eq!(syncer.metas().len(), 1, "x should already be filtered as a duplicate of a");
    assert!(!syncer.metas().contains_key(&BlockId::from("x".into())));

    let marked = syncer.garbage_collect().await.unwrap();
    assert_eq!(marked, 1);
    assert!(bucket.exists(&deletion_mark_key("x")).await.unwrap());
    assert!(!bucket.exists(&deletion_mark_key("a")).await.unwrap());
}

/// S6 - Deadline: a job whose merge never completes within the
/// iteration's `maxCompactionTime` budget surfaces as a retryable
/// error, not a halt, and leaves the workdir for the next attempt.
#[tokio::test]
async fn deadline_aborts_long_running_merge_s6() {
    struct SlowMerger;

    #[async_trait::async_trait]
    impl BlockMerger for SlowMerger {
        async fn write(&self, _dest_dir: &std::path::Path, parent_meta: &BlockMeta) -> anyhow::Result<BlockId> {
            Ok(parent_meta.id.clone())
        }

        async fn compact(
            &self,
            _dest_dir: &std::path::Path,
            _inputs: &[(BlockId, std::path::PathBuf)],
        ) -> anyhow::Result<BlockId> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(BlockId::new(0))
        }

        async fn compact_with_splitting(
            &self,
            _dest_dir: &std::path::Path,
            _inputs: &[(BlockId, std::path::PathBuf)],
            shard_count: usize,
        ) -> anyhow::Result<Vec<BlockId>> {
            Ok(vec![BlockId::zero(); shard_count])
        }
    }

    let bucket = Arc::new(InMemoryBucket::new());
    put_block(&bucket, "a", 1, &["a"], "t", 0, 10).await;
    put_block(&bucket, "b", 1, &["b"], "t", 100, 10).await;

    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(
        bucket.clone(),
        Arc::new(SlowMerger),
        Arc::new(AlwaysHealthy),
        Arc::new(HorizonPlanner { max_time_span_millis: i64::MAX, max_total_samples: u64::MAX, min_inputs: 2 }),
        dir.path().to_path_buf(),
        metrics(),
    );

    let mut labels = ExternalLabels::new();
    labels.insert("tenant".into(), "t".into());
    let job = Job {
        key: "0@s6".into(),
        labels,
        downsample_resolution: 0,
        metas: vec![
            BlockMeta {
                id: BlockId::from("a".to_string()),
                min_time: 0,
                max_time: 100,
                compaction_level: 1,
                compaction_sources: [BlockId::from("a".to_string())].into_iter().collect(),
                external_labels: {
                    let mut l = ExternalLabels::new();
                    l.insert("tenant".into(), "t".into());
                    l
                },
                downsample_resolution: 0,
                num_samples: 10,
                hash_func: None,
                checksums: Default::default(),
            },
            BlockMeta {
                id: BlockId::from("b".to_string()),
                min_time: 100,
                max_time: 200,
                compaction_level: 1,
                compaction_sources: [BlockId::from("b".to_string())].into_iter().collect(),
                external_labels: {
                    let mut l = ExternalLabels::new();
                    l.insert("tenant".into(), "t".into());
                    l
                },
                downsample_resolution: 0,
                num_samples: 10,
                hash_func: None,
                checksums: Default::default(),
            },
        ],
        use_splitting: false,
        splitting_shards: 0,
    };

    let ctx = CompactionContext::for_iteration(CancellationToken::new(), Some(Duration::from_millis(20)));
    let err = runner.run(&job, &ctx).await.unwrap_err();
    assert!(err.is_retry(), "a deadline hit must never be classified Halt");
    assert!(dir.path().join(&job.key).exists(), "workdir survives a deadline-aborted run");
}

/// S6 - Deadline at the dispatch level: five independent tenants'
/// jobs, each merge slow enough that only some complete before
/// `maxCompactionTime` elapses. The Scheduler must stop handing out new
/// jobs once the budget is spent, let the already-dispatched job
/// finish, and return cleanly with no error.
#[tokio::test]
async fn scheduler_stops_dispatching_after_deadline_s6() {
    struct SleepyMerger {
        sleep: Duration,
    }

    #[async_trait::async_trait]
    impl BlockMerger for SleepyMerger {
        async fn write(&self, _dest_dir: &std::path::Path, parent_meta: &BlockMeta) -> anyhow::Result<BlockId> {
            Ok(parent_meta.id.clone())
        }

        async fn compact(
            &self,
            _dest_dir: &std::path::Path,
            _inputs: &[(BlockId, std::path::PathBuf)],
        ) -> anyhow::Result<BlockId> {
            tokio::time::sleep(self.sleep).await;
            Ok(BlockId::new(0))
        }

        async fn compact_with_splitting(
            &self,
            _dest_dir: &std::path::Path,
            _inputs: &[(BlockId, std::path::PathBuf)],
            shard_count: usize,
        ) -> anyhow::Result<Vec<BlockId>> {
            Ok(vec![BlockId::zero(); shard_count])
        }
    }

    let bucket = Arc::new(InMemoryBucket::new());
    for t in 0..5 {
        let tenant = format!("t{t}");
        let id_a = format!("{tenant}-a");
        let id_b = format!("{tenant}-b");
        put_block(&bucket, &id_a, 1, &[id_a.as_str()], &tenant, 0, 10).await;
        put_block(&bucket, &id_b, 1, &[id_b.as_str()], &tenant, 100, 10).await;
    }

    let metrics = metrics();
    let meta_store = MetaStore::new(bucket.clone(), Duration::ZERO, 4, false);
    let syncer = Arc::new(Syncer::new(bucket.clone(), meta_store, metrics.clone()));
    let dir = tempfile::tempdir().unwrap();
    let job_runner = Arc::new(JobRunner::new(
        bucket.clone(),
        Arc::new(SleepyMerger { sleep: Duration::from_millis(150) }),
        Arc::new(AlwaysHealthy),
        Arc::new(HorizonPlanner { max_time_span_millis: i64::MAX, max_total_samples: u64::MAX, min_inputs: 2 }),
        dir.path().to_path_buf(),
        metrics.clone(),
    ));

    let config = CompactorConfig {
        concurrency: 1,
        max_compaction_time: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let scheduler = Scheduler::new(
        syncer,
        Arc::new(bucket_compactor::grouper::DefaultGrouper),
        Arc::new(OwnsEverything),
        job_runner,
        config,
        metrics,
    )
    .unwrap();

    let ctx = CompactionContext::for_iteration(CancellationToken::new(), Some(Duration::from_millis(200)));
    let report = scheduler.run_once(&ctx).await.unwrap();

    assert!(report.deadline_hit, "dispatch loop should observe the elapsed budget and stop early");
    assert!(report.jobs_dispatched < 5, "not all five jobs should have been dispatched before the deadline");
    assert!(report.jobs_dispatched >= 1, "the job already dispatched before the deadline hit should still complete");
}

/// S4 - Issue-347 recovery driven through the full `Scheduler` pass: a
/// scripted health checker flags one block; the Scheduler catches the
/// resulting `Issue347` classification itself, repairs the block, and
/// reports progress instead of propagating the error. The next pass's
/// meta set includes the repaired block and no longer contains the
/// original.
#[tokio::test]
async fn scheduler_repairs_issue_347_and_reschedules_s4() {
    let bucket = Arc::new(InMemoryBucket::new());
    put_block(&bucket, "a", 1, &["a"], "t", 0, 10).await;
    put_block(&bucket, "b", 1, &["b"], "t", 100, 10).await;

    let health = Arc::new(ScriptedHealthChecker::new());
    health.script(BlockId::from("a".into()), bucket_compactor::health::BlockHealth::Issue347);

    let metrics = metrics();
    let meta_store = MetaStore::new(bucket.clone(), Duration::ZERO, 4, false);
    let syncer = Arc::new(Syncer::new(bucket.clone(), meta_store, metrics.clone()));
    let dir = tempfile::tempdir().unwrap();
    let job_runner = Arc::new(JobRunner::new(
        bucket.clone(),
        Arc::new(SummingMerger::new()),
        health,
        Arc::new(HorizonPlanner { max_time_span_millis: i64::MAX, max_total_samples: u64::MAX, min_inputs: 2 }),
        dir.path().to_path_buf(),
        metrics.clone(),
    ));

    let scheduler = Scheduler::new(
        syncer,
        Arc::new(bucket_compactor::grouper::DefaultGrouper),
        Arc::new(OwnsEverything),
        job_runner,
        CompactorConfig::default(),
        metrics.clone(),
    )
    .unwrap();

    let ctx = CompactionContext::background();
    let report = scheduler.run_once(&ctx).await.unwrap();
    assert!(!report.finished_all_jobs, "a successful repair should flag the iteration to re-run");
    assert_eq!(metrics.issue347_repairs_total.get(), 1);
    assert!(bucket.exists(&deletion_mark_key("a")).await.unwrap(), "the corrupt original must be marked for deletion");
    assert!(!bucket.exists(&deletion_mark_key("b")).await.unwrap(), "the unaffected sibling is untouched");
}
