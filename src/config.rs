// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration options recognized by the core. CLI parsing and
//! config-file loading are out of scope — callers construct this
//! struct directly and `validate` it, the way the teacher's
//! `CompactConfig::new` consumes an already-parsed `PersistConfig`.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Worker pool size. Must be > 0.
    pub concurrency: usize,
    /// `NoCompactFilter` fan-out. Must be > 0.
    pub block_sync_concurrency: usize,
    /// Auto-skip via no-compact marking when out-of-order chunks are
    /// found.
    pub skip_blocks_with_out_of_order_chunks: bool,
    /// Wall-clock budget per iteration. `None` is unbounded.
    pub max_compaction_time: Option<Duration>,
    /// Local working root for downloaded/merged blocks.
    pub compact_dir: PathBuf,
    /// Minimum age (from `BlockId`'s embedded timestamp) before a block
    /// is eligible for compaction, applied first in `MetaStore::fetch`'s
    /// filter order.
    pub min_block_age: Duration,
    /// If set, `NoCompactFilter` removes marked blocks from the meta map
    /// instead of merely recording them.
    pub remove_no_compact_marked: bool,
}

impl CompactorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be > 0");
        }
        if self.block_sync_concurrency == 0 {
            anyhow::bail!("blockSyncConcurrency must be > 0");
        }
        Ok(())
    }
}

impl Default for CompactorConfig {
    fn default() -> Self {
        CompactorConfig {
            concurrency: 4,
            block_sync_concurrency: 20,
            skip_blocks_with_out_of_order_chunks: false,
            max_compaction_time: None,
            compact_dir: PathBuf::from("./compact"),
            min_block_age: Duration::ZERO,
            remove_no_compact_marked: false,
        }
    }
}
