// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! `DeduplicateFilter`: identifies blocks fully superseded by a
//! higher-level compaction within the same external-label group.

use std::collections::{BTreeMap, BTreeSet};

use crate::block::{BlockId, BlockMeta};

#[derive(Debug, Default)]
pub struct DeduplicateFilter {
    duplicate_ids: BTreeSet<BlockId>,
}

impl DeduplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the duplicate set from `metas` and mutates `metas` in
    /// place, removing every block classified as a duplicate. Runs last
    /// in the filter pipeline, after the other filters have already
    /// trimmed the candidate set.
    ///
    /// A block *B* is a duplicate of *A* iff `B.compaction_sources ⊆
    /// A.compaction_sources` and `A.compaction_level > B.compaction_level`
    /// (§8 invariant: subsumption requires a strictly higher level, so a
    /// block is never dropped in favor of a sibling at its own level).
    /// Separately, two blocks at the *same* level with identical source
    /// sets are exact duplicates (e.g. a retried upload) — the one with
    /// the larger `id` is kept.
    pub fn filter(&mut self, metas: &mut BTreeMap<BlockId, BlockMeta>) {
        self.duplicate_ids = compute_duplicates(metas);
        for id in &self.duplicate_ids {
            metas.remove(id);
        }
    }

    /// The set of duplicate IDs found by the most recent [`Self::filter`]
    /// call.
    pub fn duplicate_ids(&self) -> &BTreeSet<BlockId> {
        &self.duplicate_ids
    }
}

fn compute_duplicates(metas: &BTreeMap<BlockId, BlockMeta>) -> BTreeSet<BlockId> {
    let mut duplicates = BTreeSet::new();

    // Group by external-label set so we never compare across streams.
    let mut by_group: BTreeMap<Vec<(String, String)>, Vec<&BlockMeta>> = BTreeMap::new();
    for meta in metas.values() {
        let key: Vec<_> = meta.external_labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        by_group.entry(key).or_default().push(meta);
    }

    for group in by_group.values() {
        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                if is_subsumed(b, a) {
                    duplicates.insert(b.id.clone());
                } else if is_subsumed(a, b) {
                    duplicates.insert(a.id.clone());
                } else if a.compaction_level == b.compaction_level && a.compaction_sources == b.compaction_sources {
                    // Exact duplicate at the same level: keep the larger id.
                    let loser = if a.id > b.id { b } else { a };
                    duplicates.insert(loser.id.clone());
                }
            }
        }
    }

    duplicates
}

/// `b` is subsumed by `a` when `b`'s sources are a subset of `a`'s and
/// `a` is at a strictly higher compaction level.
fn is_subsumed(b: &BlockMeta, a: &BlockMeta) -> bool {
    a.compaction_level > b.compaction_level && b.compaction_sources.is_subset(&a.compaction_sources)
}
