// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `Planner` (§4.F): given a Job's metas, decides which subset to merge
//! in this iteration. The exact selection policy is delegated (§4.F) —
//! this module provides the interface and one concrete, size-bounded
//! implementation.

use crate::block::BlockMeta;

pub trait Planner: Send + Sync + std::fmt::Debug {
    /// Returns the subset of `metas` to merge this iteration.
    ///
    /// Contract (§4.F):
    ///  (a) an empty return means "nothing to do, skip this job this pass";
    ///  (b) the returned blocks must be a subset of the input;
    ///  (c) order is preserved.
    fn plan(&self, metas: &[BlockMeta]) -> Vec<BlockMeta>;
}

/// Selects the longest contiguous, time-ordered run whose combined
/// sample count and time span both fit within configured horizons.
/// Compacting fewer than `min_inputs` blocks is skipped as not worth the
/// blob traffic, mirroring the "should_compact" heuristic pattern.
#[derive(Debug, Clone)]
pub struct HorizonPlanner {
    pub max_time_span_millis: i64,
    pub max_total_samples: u64,
    pub min_inputs: usize,
}

impl Default for HorizonPlanner {
    fn default() -> Self {
        HorizonPlanner {
            max_time_span_millis: 2 * 60 * 60 * 1000,
            max_total_samples: 10_000_000,
            min_inputs: 2,
        }
    }
}

impl Planner for HorizonPlanner {
    fn plan(&self, metas: &[BlockMeta]) -> Vec<BlockMeta> {
        if metas.len() < self.min_inputs {
            return Vec::new();
        }

        let mut best: Vec<BlockMeta> = Vec::new();
        let mut start = 0usize;
        while start < metas.len() {
            let mut end = start;
            let mut samples = 0u64;
            while end < metas.len() {
                let span = metas[end].max_time - metas[start].min_time;
                let next_samples = samples + metas[end].num_samples;
                if span > self.max_time_span_millis || next_samples > self.max_total_samples {
                    break;
                }
                samples = next_samples;
                end += 1;
            }
            let run = &metas[start..end.max(start + 1)];
            if run.len() >= self.min_inputs && run.len() > best.len() {
                best = run.to_vec();
            }
            start = end.max(start + 1);
        }

        best
    }
}
