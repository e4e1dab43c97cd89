// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data model: [`BlockMeta`], [`Job`], and the sidecar marks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lexicographically sortable unique identifier of a block.
///
/// Formatted as a millisecond timestamp prefix followed by a random
/// suffix, so two IDs compare in creation order even across processes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(millis: u64) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        BlockId(format!("{millis:013x}{suffix}"))
    }

    /// The all-zero ID. Used by [`crate::merger::BlockMerger`] to signal an
    /// empty compaction result.
    pub fn zero() -> Self {
        BlockId("0".repeat(45))
    }

    pub fn is_zero(&self) -> bool {
        self.0.chars().all(|c| c == '0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The millisecond timestamp embedded in the ID prefix, used by
    /// `MetaStore`'s min-age filter.
    pub fn created_millis(&self) -> Option<u64> {
        u64::from_str_radix(self.0.get(..13)?, 16).ok()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        BlockId(s)
    }
}

/// Name/value external labels identifying the stream (tenant, shard,
/// downsample resolution). Blocks with different sets never merge.
pub type ExternalLabels = BTreeMap<String, String>;

/// A content hash over [`ExternalLabels`], used to key [`Job`]s.
pub fn hash_external_labels(labels: &ExternalLabels) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (k, v) in labels {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

pub const SHARD_ID_LABEL: &str = "__compactor_shard_id__";

/// Immutable descriptor of one stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: BlockId,
    pub min_time: i64,
    pub max_time: i64,
    pub compaction_level: u32,
    pub compaction_sources: BTreeSet<BlockId>,
    pub external_labels: ExternalLabels,
    pub downsample_resolution: u32,
    pub num_samples: u64,
    pub hash_func: Option<String>,
    pub checksums: BTreeMap<String, String>,
}

impl BlockMeta {
    /// A fresh level-1 block whose only compaction source is itself.
    pub fn level1(id: BlockId, min_time: i64, max_time: i64, labels: ExternalLabels) -> Self {
        let mut compaction_sources = BTreeSet::new();
        compaction_sources.insert(id.clone());
        BlockMeta {
            id,
            min_time,
            max_time,
            compaction_level: 1,
            compaction_sources,
            external_labels: labels,
            downsample_resolution: 0,
            num_samples: 0,
            hash_func: None,
            checksums: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }
}

/// A small sidecar record signalling a pending property of a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mark {
    pub block_id: BlockId,
    pub timestamp_millis: u64,
    pub reason: String,
}

pub type DeletionMark = Mark;
pub type NoCompactMark = Mark;

/// A unit of compaction work targeting one (resolution, label-set) group.
#[derive(Debug, Clone)]
pub struct Job {
    pub key: String,
    pub labels: ExternalLabels,
    pub downsample_resolution: u32,
    pub metas: Vec<BlockMeta>,
    pub use_splitting: bool,
    pub splitting_shards: usize,
}

impl Job {
    pub fn key_for(downsample_resolution: u32, labels: &ExternalLabels) -> String {
        format!("{}@{:x}", downsample_resolution, hash_external_labels(labels))
    }

    /// True iff every meta shares `labels` and `downsample_resolution`,
    /// and `metas` is sorted by `min_time` (tie-break `id`) ascending.
    pub fn is_well_formed(&self) -> bool {
        if self.use_splitting && self.splitting_shards < 2 {
            return false;
        }
        self.metas.iter().all(|m| {
            m.external_labels == self.labels && m.downsample_resolution == self.downsample_resolution
        }) && self
            .metas
            .windows(2)
            .all(|w| (w[0].min_time, &w[0].id) <= (w[1].min_time, &w[1].id))
    }
}
