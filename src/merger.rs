// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `BlockMerger` external capability: the TSDB-level byte-merge of
//! chunks and indexes. Out of scope to implement for real; an
//! in-memory [`SummingMerger`] stands in for tests, merging by summing
//! sample counts and unioning source sets rather than touching real
//! chunk bytes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::block::{BlockId, BlockMeta};

#[async_trait]
pub trait BlockMerger: Send + Sync + std::fmt::Debug {
    /// Writes a single new block from `parent_meta`'s shape (used by the
    /// Issue-347 repair routine).
    async fn write(&self, dest_dir: &Path, parent_meta: &BlockMeta) -> anyhow::Result<BlockId>;

    /// Merges `input_dirs` into a single output block under `dest_dir`.
    /// A zero [`BlockId`] means the result would be empty.
    async fn compact(
        &self,
        dest_dir: &Path,
        inputs: &[(BlockId, PathBuf)],
    ) -> anyhow::Result<BlockId>;

    /// Merges `input_dirs`, splitting the output by series hash into
    /// `shard_count` blocks. The i-th slot is the zero ID iff shard i is
    /// empty.
    async fn compact_with_splitting(
        &self,
        dest_dir: &Path,
        inputs: &[(BlockId, PathBuf)],
        shard_count: usize,
    ) -> anyhow::Result<Vec<BlockId>>;
}

/// A stand-in merger for tests: sums `num_samples` and unions
/// `compaction_sources`/time bounds rather than doing a real byte merge.
#[derive(Debug, Default)]
pub struct SummingMerger {
    metas: std::sync::Mutex<std::collections::BTreeMap<BlockId, BlockMeta>>,
}

impl SummingMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, meta: BlockMeta) {
        self.metas.lock().expect("lock poisoned").insert(meta.id.clone(), meta);
    }

    pub fn meta(&self, id: &BlockId) -> Option<BlockMeta> {
        self.metas.lock().expect("lock poisoned").get(id).cloned()
    }

    fn merge_metas(&self, inputs: &[(BlockId, PathBuf)]) -> Option<BlockMeta> {
        let metas = self.metas.lock().expect("lock poisoned");
        let mut iter = inputs.iter().filter_map(|(id, _)| metas.get(id).cloned());
        let mut acc = iter.next()?;
        for next in iter {
            acc.min_time = acc.min_time.min(next.min_time);
            acc.max_time = acc.max_time.max(next.max_time);
            acc.num_samples += next.num_samples;
            acc.compaction_sources.extend(next.compaction_sources);
            acc.compaction_level = acc.compaction_level.max(next.compaction_level);
        }
        acc.compaction_level += 1;
        Some(acc)
    }
}

#[async_trait]
impl BlockMerger for SummingMerger {
    async fn write(&self, _dest_dir: &Path, parent_meta: &BlockMeta) -> anyhow::Result<BlockId> {
        let id = BlockId::new(parent_meta.min_time.max(0) as u64);
        let mut meta = parent_meta.clone();
        meta.id = id.clone();
        self.register(meta);
        Ok(id)
    }

    async fn compact(
        &self,
        _dest_dir: &Path,
        inputs: &[(BlockId, PathBuf)],
    ) -> anyhow::Result<BlockId> {
        let Some(mut merged) = self.merge_metas(inputs) else {
            return Ok(BlockId::zero());
        };
        if merged.num_samples == 0 {
            return Ok(BlockId::zero());
        }
        let id = BlockId::new(merged.min_time.max(0) as u64);
        merged.id = id.clone();
        self.register(merged);
        Ok(id)
    }

    async fn compact_with_splitting(
        &self,
        _dest_dir: &Path,
        inputs: &[(BlockId, PathBuf)],
        shard_count: usize,
    ) -> anyhow::Result<Vec<BlockId>> {
        let Some(merged) = self.merge_metas(inputs) else {
            return Ok(vec![BlockId::zero(); shard_count]);
        };
        let per_shard = merged.num_samples / shard_count as u64;
        let remainder = merged.num_samples % shard_count as u64;
        let mut out = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let samples = per_shard + if (shard as u64) < remainder { 1 } else { 0 };
            if samples == 0 {
                out.push(BlockId::zero());
                continue;
            }
            let id = BlockId::new(merged.min_time.max(0) as u64 + shard as u64);
            let mut shard_meta = merged.clone();
            shard_meta.id = id.clone();
            shard_meta.num_samples = samples;
            self.register(shard_meta);
            out.push(id);
        }
        Ok(out)
    }
}
