// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Index health probing, invoked by `JobRunner` right after downloading
//! a block. The actual TSDB-level index parser is out of scope — like
//! `BlockMerger`, this is an external capability the control plane
//! consumes; [`AlwaysHealthy`] and [`ScriptedHealthChecker`] stand in
//! for tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::block::BlockId;

/// The outcome of gathering index health stats for one downloaded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHealth {
    Healthy,
    /// A critical error — classified Halt.
    Critical(String),
    /// Out-of-order chunks — classified OutOfOrder(id).
    OutOfOrder,
    /// Issue-347 corruption — classified Issue347(id).
    Issue347,
    /// Prometheus #5372 — a plain wrapped error, not specially classified.
    Prometheus5372(String),
}

#[async_trait]
pub trait IndexHealthChecker: Send + Sync + std::fmt::Debug {
    async fn check(&self, block_id: &BlockId, downloaded_dir: &Path) -> anyhow::Result<BlockHealth>;
}

#[derive(Debug, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl IndexHealthChecker for AlwaysHealthy {
    async fn check(&self, _block_id: &BlockId, _downloaded_dir: &Path) -> anyhow::Result<BlockHealth> {
        Ok(BlockHealth::Healthy)
    }
}

/// A health checker with a fixed per-block answer, for exercising the
/// Issue-347/out-of-order/halt code paths in tests deterministically.
#[derive(Debug, Default)]
pub struct ScriptedHealthChecker {
    scripted: Mutex<BTreeMap<BlockId, BlockHealth>>,
}

impl ScriptedHealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, id: BlockId, health: BlockHealth) {
        self.scripted.lock().expect("lock poisoned").insert(id, health);
    }
}

#[async_trait]
impl IndexHealthChecker for ScriptedHealthChecker {
    async fn check(&self, block_id: &BlockId, _downloaded_dir: &Path) -> anyhow::Result<BlockHealth> {
        Ok(self
            .scripted
            .lock()
            .expect("lock poisoned")
            .get(block_id)
            .cloned()
            .unwrap_or(BlockHealth::Healthy))
    }
}
