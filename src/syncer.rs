// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `Syncer` (§4.D): orchestrates `MetaStore`/`DeduplicateFilter`/
//! `NoCompactFilter` and performs garbage collection of superseded
//! blocks. Holds the current meta snapshot behind a mutex
//! (single-writer, many-reader, §5).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::block::{BlockId, BlockMeta};
use crate::bucket::{deletion_mark_key, Bucket};
use crate::context::CompactionContext;
use crate::error::CompactionError;
use crate::meta_store::{FetchResult, MetaStore};
use crate::metrics::Metrics;

#[derive(Debug)]
pub struct Syncer {
    bucket: Arc<dyn Bucket>,
    meta_store: AsyncMutex<MetaStore>,
    snapshot: StdMutex<FetchResult>,
    metrics: Arc<Metrics>,
}

impl Syncer {
    pub fn new(bucket: Arc<dyn Bucket>, meta_store: MetaStore, metrics: Arc<Metrics>) -> Self {
        Syncer {
            bucket,
            meta_store: AsyncMutex::new(meta_store),
            snapshot: StdMutex::new(FetchResult::default()),
            metrics,
        }
    }

    /// Replaces the snapshot with a fresh `MetaStore::fetch`. Errors are
    /// wrapped as Retry (§4.D).
    pub async fn sync_metas(&self) -> Result<(), CompactionError> {
        let mut meta_store = self.meta_store.lock().await;
        let fresh = meta_store.fetch().await?;
        *self.snapshot.lock().expect("lock poisoned") = fresh;
        Ok(())
    }

    /// A read-only defensive copy of the live snapshot (§9 "Snapshot
    /// semantics of Metas").
    pub fn metas(&self) -> BTreeMap<BlockId, BlockMeta> {
        self.snapshot.lock().expect("lock poisoned").metas.clone()
    }

    pub fn partial(&self) -> BTreeMap<BlockId, String> {
        self.snapshot.lock().expect("lock poisoned").partial.clone()
    }

    /// Marks every duplicate block not already deletion-marked, using a
    /// detached 5-minute context per mark (§4.D, §5, §9) so a shutdown
    /// mid-GC can't leave marks half-written. Each successful mark is
    /// also removed from the in-memory snapshot. A single failure aborts
    /// GC and is returned as Retry — GC is always safe to retry (§4.D).
    pub async fn garbage_collect(&self) -> Result<usize, CompactionError> {
        let start = Instant::now();
        let duplicate_ids: Vec<BlockId> = {
            let meta_store = self.meta_store.lock().await;
            meta_store.duplicate_ids().iter().cloned().collect()
        };

        let mut marked = 0usize;
        for id in duplicate_ids {
            let key = deletion_mark_key(id.as_str());
            if self.bucket.exists(&key).await.unwrap_or(false) {
                // Already deletion-marked; still drop it from the
                // snapshot so the next pass doesn't re-plan around it.
                self.snapshot.lock().expect("lock poisoned").metas.remove(&id);
                continue;
            }

            let detached = CompactionContext::background().detach();
            let mark = json!({
                "block_id": id.as_str(),
                "timestamp_millis": now_millis(),
                "reason": "garbage-collected: superseded by a higher-level compaction",
            });
            let bytes = bytes::Bytes::from(serde_json::to_vec(&mark).expect("mark serializes"));
            let bucket = Arc::clone(&self.bucket);
            let write = detached.run(async move { bucket.upload(&key, bytes).await }).await;

            match write {
                Ok(Ok(())) => {
                    self.snapshot.lock().expect("lock poisoned").metas.remove(&id);
                    self.metrics.garbage_collected_blocks.inc();
                    self.metrics.blocks_marked_for_deletion.inc();
                    marked += 1;
                    debug!(block_id = %id, "garbage collected duplicate block");
                }
                Ok(Err(err)) => {
                    warn!(block_id = %id, error = %err, "garbage collection write failed, aborting pass");
                    self.metrics.gc_duration_seconds.observe(start.elapsed().as_secs_f64());
                    return Err(CompactionError::retry(anyhow::anyhow!(err)));
                }
                Err(err) => {
                    warn!(block_id = %id, error = %err, "garbage collection write timed out, aborting pass");
                    self.metrics.gc_duration_seconds.observe(start.elapsed().as_secs_f64());
                    return Err(CompactionError::retry(anyhow::anyhow!(err.to_string())));
                }
            }
        }

        self.metrics.gc_duration_seconds.observe(start.elapsed().as_secs_f64());
        Ok(marked)
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
