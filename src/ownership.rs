// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `OwnershipOracle` external capability (§3, §6): leader
//! election / shard assignment is out of scope (§1). Errors from the
//! oracle do not consume jobs; the caller logs and skips (§6).

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::block::Job;

#[async_trait]
pub trait OwnershipOracle: Send + Sync + std::fmt::Debug {
    async fn owns(&self, job: &Job) -> anyhow::Result<bool>;
}

/// An oracle that owns every job. Useful for single-worker deployments
/// and as the default in tests that don't exercise ownership races.
#[derive(Debug, Default)]
pub struct OwnsEverything;

#[async_trait]
impl OwnershipOracle for OwnsEverything {
    async fn owns(&self, _job: &Job) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// An oracle backed by a mutable set of owned job keys, so tests can
/// simulate rebalancing mid-pass (§4.H, §9 "Ownership re-check race").
#[derive(Debug, Default)]
pub struct StaticOwnership {
    owned_keys: Mutex<HashSet<String>>,
}

impl StaticOwnership {
    pub fn owning(keys: impl IntoIterator<Item = String>) -> Self {
        StaticOwnership {
            owned_keys: Mutex::new(keys.into_iter().collect()),
        }
    }

    pub fn revoke(&self, key: &str) {
        self.owned_keys.lock().expect("lock poisoned").remove(key);
    }

    pub fn grant(&self, key: String) {
        self.owned_keys.lock().expect("lock poisoned").insert(key);
    }
}

#[async_trait]
impl OwnershipOracle for StaticOwnership {
    async fn owns(&self, job: &Job) -> anyhow::Result<bool> {
        Ok(self.owned_keys.lock().expect("lock poisoned").contains(&job.key))
    }
}
