// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `Bucket` external capability: the object-store driver the
//! control plane consumes. A production backend (S3/GCS/Azure) is out
//! of scope; [`InMemoryBucket`] backs the test suite.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

/// `Err` variant returned by [`Bucket::get`] when the key does not exist,
/// distinguished from other transient failures so callers can treat a
/// missing no-compact marker as "absent" rather than an error.
#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("key not found: {0}")]
    NotExist(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Bucket: Send + Sync + std::fmt::Debug {
    /// Lists all keys under `prefix`.
    async fn iter(&self, prefix: &str) -> Result<Vec<String>, BucketError>;
    async fn get(&self, key: &str) -> Result<Bytes, BucketError>;
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), BucketError>;
    async fn delete(&self, key: &str) -> Result<(), BucketError>;
    async fn exists(&self, key: &str) -> Result<bool, BucketError>;
}

/// An in-memory [`Bucket`] used by tests and by the examples in this
/// crate's doc tests. Not a production backend.
#[derive(Debug, Default)]
pub struct InMemoryBucket {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl InMemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().expect("lock poisoned").keys().cloned().collect()
    }
}

#[async_trait]
impl Bucket for InMemoryBucket {
    async fn iter(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        let objects = self.objects.lock().expect("lock poisoned");
        Ok(objects.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BucketError> {
        let objects = self.objects.lock().expect("lock poisoned");
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| BucketError::NotExist(key.to_string()))
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<(), BucketError> {
        let mut objects = self.objects.lock().expect("lock poisoned");
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        let mut objects = self.objects.lock().expect("lock poisoned");
        objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        let objects = self.objects.lock().expect("lock poisoned");
        Ok(objects.contains_key(key))
    }
}

pub fn meta_key(block_id: &str) -> String {
    format!("{block_id}/meta.json")
}

pub fn index_key(block_id: &str) -> String {
    format!("{block_id}/index")
}

/// Uploads the sidecar objects that make a block "complete" as far as
/// `MetaStore::fetch`'s partial-block check is concerned: its
/// `meta.json` and an `index` stub. Real chunk/index bytes are the
/// `BlockMerger`'s concern; this crate only ever writes marks and the
/// meta/index presence signal for newly produced blocks.
pub async fn put_complete_block(bucket: &dyn Bucket, meta: &crate::block::BlockMeta) -> Result<(), BucketError> {
    let meta_bytes = serde_json::to_vec(meta).map_err(|e| BucketError::Other(e.into()))?;
    bucket.upload(&meta_key(meta.id.as_str()), Bytes::from(meta_bytes)).await?;
    bucket.upload(&index_key(meta.id.as_str()), Bytes::from_static(b"index")).await?;
    Ok(())
}

pub fn deletion_mark_key(block_id: &str) -> String {
    format!("{block_id}/deletion-mark.json")
}

pub fn no_compact_mark_key(block_id: &str) -> String {
    format!("{block_id}/no-compact-mark.json")
}
