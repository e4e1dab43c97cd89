// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Observed metrics. Names are pinned (not merely "illustrative") so
//! the counters are testable; built on `prometheus`, the crate the
//! teacher's `persist-client` uses directly for its own `Metrics` struct.

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};

#[derive(Debug, Clone)]
pub struct Metrics {
    pub runs_started: IntCounter,
    pub runs_completed: IntCounter,
    pub runs_failed: IntCounter,
    pub group_compactions: IntCounter,
    pub garbage_collected_blocks: IntCounter,
    pub blocks_marked_for_deletion: IntCounter,
    pub blocks_marked_for_no_compaction: IntCounter,
    pub issue347_repairs_total: IntCounter,
    pub gc_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        let runs_started = IntCounter::with_opts(Opts::new(
            "compactor_runs_started_total",
            "Total number of compaction runs started.",
        ))?;
        let runs_completed = IntCounter::with_opts(Opts::new(
            "compactor_runs_completed_total",
            "Total number of compaction runs completed without error.",
        ))?;
        let runs_failed = IntCounter::with_opts(Opts::new(
            "compactor_runs_failed_total",
            "Total number of compaction runs that ended with an error.",
        ))?;
        let group_compactions = IntCounter::with_opts(Opts::new(
            "compactor_group_compactions_total",
            "Total number of job executions that produced at least one new block.",
        ))?;
        let garbage_collected_blocks = IntCounter::with_opts(Opts::new(
            "compactor_garbage_collected_blocks_total",
            "Total number of blocks marked for deletion by the Syncer's GC pass.",
        ))?;
        let blocks_marked_for_deletion = IntCounter::with_opts(Opts::new(
            "compactor_blocks_marked_for_deletion_total",
            "Total number of blocks marked for deletion, from any source.",
        ))?;
        let blocks_marked_for_no_compaction = IntCounter::with_opts(Opts::new(
            "compactor_blocks_marked_for_no_compaction_total",
            "Total number of blocks marked do-not-compact.",
        ))?;
        let issue347_repairs_total = IntCounter::with_opts(Opts::new(
            "compactor_issue347_repairs_total",
            "Total number of Issue-347 corrupted blocks repaired.",
        ))?;
        let gc_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "compactor_gc_duration_seconds",
            "Time spent in Syncer::garbage_collect.",
        ))?;

        for c in [
            &runs_started,
            &runs_completed,
            &runs_failed,
            &group_compactions,
            &garbage_collected_blocks,
            &blocks_marked_for_deletion,
            &blocks_marked_for_no_compaction,
            &issue347_repairs_total,
        ] {
            registry.register(Box::new(c.clone()))?;
        }
        registry.register(Box::new(gc_duration_seconds.clone()))?;

        Ok(Metrics {
            runs_started,
            runs_completed,
            runs_failed,
            group_compactions,
            garbage_collected_blocks,
            blocks_marked_for_deletion,
            blocks_marked_for_no_compaction,
            issue347_repairs_total,
            gc_duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_conflicts() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).expect("metrics should register");
        metrics.runs_started.inc();
        assert_eq!(metrics.runs_started.get(), 1);
    }
}
