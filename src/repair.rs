// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Issue-347 repair sub-routine (§4.I, §7): a specific repairable
//! corruption class. `MetaStore`/`JobRunner` never attempt general
//! repair (§1 Non-goals) — only this one.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::{BlockId, BlockMeta};
use crate::bucket::{deletion_mark_key, put_complete_block, Bucket};
use crate::context::CompactionContext;
use crate::error::CompactionError;
use crate::merger::BlockMerger;

/// Downloads the original block (conceptually — see module note),
/// repairs it via [`BlockMerger::write`], verifies the repaired block is
/// non-empty, uploads it, then mark-for-deletes the original using a
/// detached 5-minute context (§4.I, §5, §7).
///
/// On repair success returns the new [`BlockId`]; the caller should
/// flag the current iteration to re-run (§4.I). On failure the original
/// error propagates.
pub async fn repair_block(
    bucket: Arc<dyn Bucket>,
    merger: Arc<dyn BlockMerger>,
    work_dir: &Path,
    original: &BlockMeta,
) -> Result<BlockId, CompactionError> {
    debug!(block_id = %original.id, "starting issue-347 repair");

    let repaired_dir = work_dir.join(format!("{}-repair", original.id));
    let repaired_id = merger
        .write(&repaired_dir, original)
        .await
        .map_err(CompactionError::halt)?;

    if repaired_id.is_zero() {
        return Err(CompactionError::halt(anyhow::anyhow!(
            "repair of block {} produced an empty result",
            original.id
        )));
    }

    let mut repaired_meta = original.clone();
    repaired_meta.id = repaired_id.clone();
    put_complete_block(bucket.as_ref(), &repaired_meta)
        .await
        .map_err(|e| CompactionError::retry(anyhow::anyhow!(e)))?;

    let detached = CompactionContext::background().detach();
    let key = deletion_mark_key(original.id.as_str());
    let mark = serde_json::json!({
        "block_id": original.id.as_str(),
        "reason": "superseded by issue-347 repair",
    });
    let bytes = bytes::Bytes::from(serde_json::to_vec(&mark).expect("mark serializes"));
    let bucket_for_mark = Arc::clone(&bucket);
    let mark_result = detached.run(async move { bucket_for_mark.upload(&key, bytes).await }).await;
    match mark_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(block_id = %original.id, error = %err, "failed to mark repaired-away block for deletion");
            return Err(CompactionError::retry(anyhow::anyhow!(err)));
        }
        Err(err) => {
            warn!(block_id = %original.id, error = %err, "deletion mark write timed out after repair");
            return Err(CompactionError::retry(anyhow::anyhow!(err.to_string())));
        }
    }

    debug!(original = %original.id, repaired = %repaired_id, "issue-347 repair complete");
    Ok(repaired_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ExternalLabels;
    use crate::bucket::InMemoryBucket;
    use crate::merger::SummingMerger;

    fn meta(id: &str) -> BlockMeta {
        BlockMeta {
            id: BlockId::from(id.to_string()),
            min_time: 0,
            max_time: 100,
            compaction_level: 1,
            compaction_sources: [BlockId::from(id.to_string())].into_iter().collect(),
            external_labels: ExternalLabels::new(),
            downsample_resolution: 0,
            num_samples: 5,
            hash_func: None,
            checksums: Default::default(),
        }
    }

    #[tokio::test]
    async fn repair_uploads_new_block_and_marks_original() {
        let bucket: Arc<dyn Bucket> = Arc::new(InMemoryBucket::new());
        let merger: Arc<dyn BlockMerger> = Arc::new(SummingMerger::new());
        let original = meta("corrupt");

        let repaired_id = repair_block(Arc::clone(&bucket), merger, Path::new("/tmp"), &original)
            .await
            .unwrap();

        assert!(!repaired_id.is_zero());
        assert!(bucket.exists(&deletion_mark_key("corrupt")).await.unwrap());
        assert!(bucket.exists(&crate::bucket::meta_key(repaired_id.as_str())).await.unwrap());
    }
}
