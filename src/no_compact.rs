// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `NoCompactFilter` (§4.C): probes the bucket for `no-compact-mark`
//! sidecars concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::block::{BlockId, BlockMeta, NoCompactMark};
use crate::bucket::{no_compact_mark_key, Bucket, BucketError};

#[derive(Debug)]
pub struct NoCompactFilter {
    bucket: Arc<dyn Bucket>,
    fan_out: usize,
    remove: bool,
    marked_blocks: BTreeSet<BlockId>,
}

impl NoCompactFilter {
    pub fn new(bucket: Arc<dyn Bucket>, fan_out: usize, remove: bool) -> Self {
        NoCompactFilter {
            bucket,
            fan_out: fan_out.max(1),
            remove,
            marked_blocks: BTreeSet::new(),
        }
    }

    /// Probes every block in `metas` for a no-compact mark, up to
    /// `fan_out` concurrent bucket reads. If `remove` is set, marked
    /// blocks are deleted from `metas` in place; otherwise they're left
    /// for downstream consumers and only recorded (§4.C).
    pub async fn filter(&mut self, metas: &mut BTreeMap<BlockId, BlockMeta>) {
        let ids: Vec<BlockId> = metas.keys().cloned().collect();
        let bucket = Arc::clone(&self.bucket);

        let marked: Vec<BlockId> = stream::iter(ids.into_iter())
            .map(|id| {
                let bucket = Arc::clone(&bucket);
                async move {
                    match probe(bucket.as_ref(), &id).await {
                        Some(_mark) => Some(id),
                        None => None,
                    }
                }
            })
            .buffer_unordered(self.fan_out)
            .filter_map(|x| async move { x })
            .collect()
            .await;

        self.marked_blocks = marked.into_iter().collect();

        if self.remove {
            for id in &self.marked_blocks {
                metas.remove(id);
            }
        }
    }

    /// Blocks found to carry a no-compact mark in the most recent
    /// [`Self::filter`] call (§4.C).
    pub fn no_compact_marked_blocks(&self) -> &BTreeSet<BlockId> {
        &self.marked_blocks
    }
}

/// Returns `None` for a missing marker (ignored) or an unparseable one
/// (logged at WARN, treated as absent, never fails the pass) (§4.C).
async fn probe(bucket: &dyn Bucket, id: &BlockId) -> Option<NoCompactMark> {
    let key = no_compact_mark_key(id.as_str());
    match bucket.get(&key).await {
        Ok(bytes) => match serde_json::from_slice::<NoCompactMark>(&bytes) {
            Ok(mark) => Some(mark),
            Err(err) => {
                warn!(block_id = %id, error = %err, "unparseable no-compact-mark, treating as absent");
                None
            }
        },
        Err(BucketError::NotExist(_)) => None,
        Err(err) => {
            warn!(block_id = %id, error = %err, "failed to probe no-compact-mark, treating as absent");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ExternalLabels;
    use crate::bucket::InMemoryBucket;
    use bytes::Bytes;

    fn meta(id: &str) -> BlockMeta {
        BlockMeta {
            id: BlockId::from(id.to_string()),
            min_time: 0,
            max_time: 1,
            compaction_level: 1,
            compaction_sources: [BlockId::from(id.to_string())].into_iter().collect(),
            external_labels: ExternalLabels::new(),
            downsample_resolution: 0,
            num_samples: 1,
            hash_func: None,
            checksums: Default::default(),
        }
    }

    #[tokio::test]
    async fn missing_marker_is_ignored() {
        let bucket = Arc::new(InMemoryBucket::new());
        let mut filter = NoCompactFilter::new(bucket, 4, false);
        let mut metas = BTreeMap::new();
        metas.insert(BlockId::from("a".into()), meta("a"));
        filter.filter(&mut metas).await;
        assert!(filter.no_compact_marked_blocks().is_empty());
        assert_eq!(metas.len(), 1);
    }

    #[tokio::test]
    async fn marked_block_recorded_but_not_removed_by_default() {
        let bucket = Arc::new(InMemoryBucket::new());
        bucket
            .upload(
                &no_compact_mark_key("a"),
                Bytes::from(serde_json::to_vec(&NoCompactMark {
                    block_id: BlockId::from("a".into()),
                    timestamp_millis: 0,
                    reason: "manual".into(),
                }).unwrap()),
            )
            .await
            .unwrap();
        let mut filter = NoCompactFilter::new(bucket, 4, false);
        let mut metas = BTreeMap::new();
        metas.insert(BlockId::from("a".into()), meta("a"));
        filter.filter(&mut metas).await;
        assert!(filter.no_compact_marked_blocks().contains(&BlockId::from("a".into())));
        assert_eq!(metas.len(), 1, "remove=false must leave the block for downstream consumers");
    }

    #[tokio::test]
    async fn remove_mode_deletes_marked_block() {
        let bucket = Arc::new(InMemoryBucket::new());
        bucket
            .upload(
                &no_compact_mark_key("a"),
                Bytes::from(serde_json::to_vec(&NoCompactMark {
                    block_id: BlockId::from("a".into()),
                    timestamp_millis: 0,
                    reason: "manual".into(),
                }).unwrap()),
            )
            .await
            .unwrap();
        let mut filter = NoCompactFilter::new(bucket, 4, true);
        let mut metas = BTreeMap::new();
        metas.insert(BlockId::from("a".into()), meta("a"));
        filter.filter(&mut metas).await;
        assert!(metas.is_empty());
    }

    #[tokio::test]
    async fn unparseable_marker_treated_as_absent() {
        let bucket = Arc::new(InMemoryBucket::new());
        bucket
            .upload(&no_compact_mark_key("a"), Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let mut filter = NoCompactFilter::new(bucket, 4, false);
        let mut metas = BTreeMap::new();
        metas.insert(BlockId::from("a".into()), meta("a"));
        filter.filter(&mut metas).await;
        assert!(filter.no_compact_marked_blocks().is_empty());
    }
}
