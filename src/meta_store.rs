// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `MetaStore`: fetches, caches, and filters block metadata from the
//! bucket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt};

use crate::block::{BlockId, BlockMeta};
use crate::bucket::{deletion_mark_key, index_key, meta_key, Bucket, BucketError};
use crate::dedup::DeduplicateFilter;
use crate::error::CompactionError;
use crate::no_compact::NoCompactFilter;

/// The result of a [`MetaStore::fetch`]: a snapshot of fully-available
/// block metadata, plus the set of blocks whose metadata exists but
/// whose block files are incomplete. Partial blocks are *not*
/// candidates for compaction.
#[derive(Debug, Default, Clone)]
pub struct FetchResult {
    pub metas: BTreeMap<BlockId, BlockMeta>,
    pub partial: BTreeMap<BlockId, String>,
}

#[derive(Debug)]
pub struct MetaStore {
    bucket: Arc<dyn Bucket>,
    min_block_age: Duration,
    fetch_concurrency: usize,
    no_compact: NoCompactFilter,
    dedup: DeduplicateFilter,
}

impl MetaStore {
    pub fn new(
        bucket: Arc<dyn Bucket>,
        min_block_age: Duration,
        fetch_concurrency: usize,
        remove_no_compact_marked: bool,
    ) -> Self {
        MetaStore {
            no_compact: NoCompactFilter::new(Arc::clone(&bucket), fetch_concurrency, remove_no_compact_marked),
            bucket,
            min_block_age,
            fetch_concurrency: fetch_concurrency.max(1),
            dedup: DeduplicateFilter::new(),
        }
    }

    /// Fetches a fresh snapshot and applies all filters, in the fixed
    /// order mandated by §4.A: min-age → deletion-mark → no-compact →
    /// dedup. Order matters: deletion-mark must run before dedup so a
    /// block already marked deleted never makes a sibling look like a
    /// duplicate of a phantom.
    pub async fn fetch(&mut self) -> Result<FetchResult, CompactionError> {
        let mut result = self.list_and_parse().await?;

        self.apply_min_age(&mut result.metas);
        self.apply_deletion_marks(&mut result.metas).await;
        self.no_compact.filter(&mut result.metas).await;
        self.dedup.filter(&mut result.metas);

        Ok(result)
    }

    pub fn duplicate_ids(&self) -> &std::collections::BTreeSet<BlockId> {
        self.dedup.duplicate_ids()
    }

    pub fn no_compact_marked_blocks(&self) -> &std::collections::BTreeSet<BlockId> {
        self.no_compact.no_compact_marked_blocks()
    }

    async fn list_and_parse(&self) -> Result<FetchResult, CompactionError> {
        let keys = self
            .bucket
            .iter("")
            .await
            .map_err(|e| CompactionError::retry(anyhow::anyhow!(e)))?;

        let ids: Vec<BlockId> = keys
            .iter()
            .filter_map(|k| k.strip_suffix("/meta.json"))
            .map(|id| BlockId::from(id.to_string()))
            .collect();

        let bucket = Arc::clone(&self.bucket);
        let parsed: Vec<(BlockId, Result<BlockMeta, String>)> = stream::iter(ids)
            .map(|id| {
                let bucket = Arc::clone(&bucket);
                async move {
                    let meta_bytes = bucket.get(&meta_key(id.as_str())).await;
                    let outcome = match meta_bytes {
                        Ok(bytes) => match serde_json::from_slice::<BlockMeta>(&bytes) {
                            Ok(meta) => {
                                match bucket.exists(&index_key(id.as_str())).await {
                                    Ok(true) => Ok(meta),
                                    Ok(false) => Err("missing index file".to_string()),
                                    Err(err) => Err(err.to_string()),
                                }
                            }
                            Err(err) => Err(format!("unparseable meta.json: {err}")),
                        },
                        Err(err) => Err(err.to_string()),
                    };
                    (id, outcome)
                }
            })
            .buffer_unordered(self.fetch_concurrency)
            .collect()
            .await;

        let mut result = FetchResult::default();
        for (id, outcome) in parsed {
            match outcome {
                Ok(meta) => {
                    result.metas.insert(id, meta);
                }
                Err(reason) => {
                    result.partial.insert(id, reason);
                }
            }
        }
        Ok(result)
    }

    fn apply_min_age(&self, metas: &mut BTreeMap<BlockId, BlockMeta>) {
        if self.min_block_age.is_zero() {
            return;
        }
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let min_age_millis = self.min_block_age.as_millis() as u64;
        metas.retain(|id, _| match id.created_millis() {
            Some(created) => now_millis.saturating_sub(created) >= min_age_millis,
            None => true,
        });
    }

    async fn apply_deletion_marks(&self, metas: &mut BTreeMap<BlockId, BlockMeta>) {
        let ids: Vec<BlockId> = metas.keys().cloned().collect();
        let bucket = Arc::clone(&self.bucket);
        let deleted: Vec<BlockId> = stream::iter(ids)
            .map(|id| {
                let bucket = Arc::clone(&bucket);
                async move {
                    match bucket.exists(&deletion_mark_key(id.as_str())).await {
                        Ok(true) => Some(id),
                        Ok(false) => None,
                        Err(BucketError::NotExist(_)) => None,
                        Err(_) => None,
                    }
                }
            })
            .buffer_unordered(self.fetch_concurrency)
            .filter_map(|x| async move { x })
            .collect()
            .await;
        for id in deleted {
            metas.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ExternalLabels;
    use crate::bucket::InMemoryBucket;
    use bytes::Bytes;

    async fn put_block(bucket: &InMemoryBucket, id: &str, complete: bool) {
        let meta = BlockMeta {
            id: BlockId::from(id.to_string()),
            min_time: 0,
            max_time: 1,
            compaction_level: 1,
            compaction_sources: [BlockId::from(id.to_string())].into_iter().collect(),
            external_labels: ExternalLabels::new(),
            downsample_resolution: 0,
            num_samples: 10,
            hash_func: None,
            checksums: Default::default(),
        };
        bucket
            .upload(&meta_key(id), Bytes::from(serde_json::to_vec(&meta).unwrap()))
            .await
            .unwrap();
        if complete {
            bucket.upload(&format!("{id}/index"), Bytes::from_static(b"idx")).await.unwrap();
        }
    }

    #[tokio::test]
    async fn complete_block_is_fetched_incomplete_is_partial() {
        let bucket = Arc::new(InMemoryBucket::new());
        put_block(&bucket, "complete", true).await;
        put_block(&bucket, "partial", false).await;

        let mut store = MetaStore::new(bucket, Duration::ZERO, 4, false);
        let result = store.fetch().await.unwrap();

        assert!(result.metas.contains_key(&BlockId::from("complete".into())));
        assert!(result.partial.contains_key(&BlockId::from("partial".into())));
        assert!(!result.metas.contains_key(&BlockId::from("partial".into())));
    }

    #[tokio::test]
    async fn deletion_marked_block_excluded_before_dedup() {
        let bucket = Arc::new(InMemoryBucket::new());
        put_block(&bucket, "a", true).await;
        bucket.upload(&deletion_mark_key("a"), Bytes::from_static(b"{}")).await.unwrap();

        let mut store = MetaStore::new(bucket, Duration::ZERO, 4, false);
        let result = store.fetch().await.unwrap();

        assert!(!result.metas.contains_key(&BlockId::from("a".into())));
        assert!(store.duplicate_ids().is_empty(), "a removed deletion-marked block must never be classified a duplicate target");
    }

    #[tokio::test]
    async fn snapshot_is_rebuilt_each_fetch() {
        let bucket = Arc::new(InMemoryBucket::new());
        put_block(&bucket, "a", true).await;
        let mut store = MetaStore::new(Arc::clone(&bucket), Duration::ZERO, 4, false);
        let first = store.fetch().await.unwrap();
        assert_eq!(first.metas.len(), 1);

        put_block(&bucket, "b", true).await;
        let second = store.fetch().await.unwrap();
        assert_eq!(second.metas.len(), 2);
    }
}
