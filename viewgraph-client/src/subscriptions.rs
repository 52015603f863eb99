// Copyright 2025 Viewgraph (https://github.com/viewgraph/viewgraph)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Watch bookkeeping: which resolutions depend on which records, and
//! which commits made them stale.
//!
//! Receipts are applied in commit order (the caller holds the store write
//! lock while applying), so staleness here is monotone: a watcher marked
//! stale by generation N stays stale until it re-resolves at a generation
//! of at least N.

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;
use viewgraph_core::{RecordKey, ViewgraphError};
use viewgraph_store::{CommitReceipt, RetainedSelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionId(u64);

struct SubscriptionEntry {
    selector: RetainedSelector,
    dependencies: HashSet<RecordKey>,
    stale: bool,
    /// Generation of the last commit that touched a dependency.
    invalidated_at: u64,
    /// Generation the current resolution was computed at.
    resolved_at: u64,
    pending_errors: Vec<ViewgraphError>,
}

/// Registry of live watches. Doubles as a GC root provider: every watched
/// selector retains its reachable subgraph.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: DashMap<u64, SubscriptionEntry>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn register(
        &self,
        selector: RetainedSelector,
        dependencies: HashSet<RecordKey>,
        generation: u64,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            SubscriptionEntry {
                selector,
                dependencies,
                stale: false,
                invalidated_at: 0,
                resolved_at: generation,
                pending_errors: Vec::new(),
            },
        );
        SubscriptionId(id)
    }

    pub(crate) fn deregister(&self, id: SubscriptionId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    /// Marks every subscription whose dependencies intersect the commit as
    /// stale, and routes normalization warnings to the watchers reading
    /// the records they happened on.
    pub(crate) fn apply_receipt(&self, receipt: &CommitReceipt) {
        if receipt.is_noop() {
            return;
        }
        let mut invalidated = 0usize;
        for mut entry in self.entries.iter_mut() {
            let subscription = entry.value_mut();
            if receipt
                .changed
                .iter()
                .any(|key| subscription.dependencies.contains(key))
            {
                subscription.stale = true;
                subscription.invalidated_at = receipt.generation;
                invalidated += 1;
            }
            for warning in &receipt.warnings {
                if subscription.dependencies.contains(&warning.key) {
                    subscription
                        .pending_errors
                        .push(ViewgraphError::Normalization(warning.clone()));
                }
            }
        }
        if invalidated > 0 {
            trace!(
                generation = receipt.generation,
                invalidated,
                "commit invalidated subscriptions"
            );
        }
    }

    pub(crate) fn is_stale(&self, id: SubscriptionId) -> bool {
        self.entries
            .get(&id.0)
            .map(|entry| entry.stale)
            .unwrap_or(false)
    }

    /// Installs a fresh resolution. Clears staleness only when the
    /// resolution is at least as new as the last invalidating commit.
    pub(crate) fn mark_resolved(
        &self,
        id: SubscriptionId,
        dependencies: HashSet<RecordKey>,
        generation: u64,
    ) {
        if let Some(mut entry) = self.entries.get_mut(&id.0) {
            entry.dependencies = dependencies;
            entry.resolved_at = generation;
            if entry.invalidated_at <= generation {
                entry.stale = false;
            }
        }
    }

    pub(crate) fn push_errors(&self, id: SubscriptionId, errors: Vec<ViewgraphError>) {
        if errors.is_empty() {
            return;
        }
        if let Some(mut entry) = self.entries.get_mut(&id.0) {
            entry.pending_errors.extend(errors);
        }
    }

    pub(crate) fn drain_errors(&self, id: SubscriptionId) -> Vec<ViewgraphError> {
        self.entries
            .get_mut(&id.0)
            .map(|mut entry| mem::take(&mut entry.pending_errors))
            .unwrap_or_default()
    }

    /// Selectors of every live subscription, for the mark phase of
    /// collection.
    pub(crate) fn selectors(&self) -> Vec<RetainedSelector> {
        self.entries
            .iter()
            .map(|entry| entry.selector.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
