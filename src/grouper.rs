// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `Grouper`: partitions the meta set into independently compactable
//! `Job`s.

use std::collections::BTreeMap;

use crate::block::{BlockId, BlockMeta, Job};

pub trait Grouper: Send + Sync + std::fmt::Debug {
    /// Partitions `metas` into jobs, returned sorted by `Key` ascending
    /// for deterministic test behavior.
    fn groups(&self, metas: &BTreeMap<BlockId, BlockMeta>) -> Vec<Job>;
}

/// Partitions by `(downsample_resolution, hash(external_labels))`.
/// Never produces split-compaction jobs — that decision is left to a
/// pluggable Grouper with deployment-specific heuristics, not
/// implemented here.
#[derive(Debug, Default)]
pub struct DefaultGrouper;

impl Grouper for DefaultGrouper {
    fn groups(&self, metas: &BTreeMap<BlockId, BlockMeta>) -> Vec<Job> {
        let mut by_key: BTreeMap<String, Job> = BTreeMap::new();

        for meta in metas.values() {
            let key = Job::key_for(meta.downsample_resolution, &meta.external_labels);
            let job = by_key.entry(key.clone()).or_insert_with(|| Job {
                key,
                labels: meta.external_labels.clone(),
                downsample_resolution: meta.downsample_resolution,
                metas: Vec::new(),
                use_splitting: false,
                splitting_shards: 0,
            });
            job.metas.push(meta.clone());
        }

        let mut jobs: Vec<Job> = by_key.into_values().collect();
        for job in &mut jobs {
            job.metas.sort_by(|a, b| (a.min_time, &a.id).cmp(&(b.min_time, &b.id)));
        }
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }
}
