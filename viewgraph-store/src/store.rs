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

//! The flat record table and its commit protocol.
//!
//! The store is a single-writer structure: callers serialize mutation
//! externally (the client wraps it in a `RwLock`). A normalization batch is
//! a sequence of [`RecordStore::write`] calls followed by one
//! [`RecordStore::seal_commit`], which bumps the generation exactly once if
//! anything changed and returns the receipt subscribers are notified with.

use std::collections::HashSet;

use ahash::AHashMap;
use tracing::debug;
use viewgraph_core::{MergeWarning, RecordKey};

use crate::record::Record;

/// Result of merging one patch into one record.
#[derive(Debug)]
pub struct WriteOutcome {
    pub changed: bool,
    pub warnings: Vec<MergeWarning>,
}

/// Accumulated effect of a sequence of writes within one batch.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub changed: HashSet<RecordKey>,
    pub warnings: Vec<MergeWarning>,
}

impl MergeOutcome {
    pub fn absorb(&mut self, key: RecordKey, outcome: WriteOutcome) {
        if outcome.changed {
            self.changed.insert(key);
        }
        self.warnings.extend(outcome.warnings);
    }
}

/// Summary of one committed batch: the generation it produced, every record
/// key it changed, and any merge conflicts it tolerated.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub generation: u64,
    pub changed: HashSet<RecordKey>,
    pub warnings: Vec<MergeWarning>,
}

impl CommitReceipt {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && self.warnings.is_empty()
    }
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub record_count: usize,
    pub generation: u64,
}

/// The normalized record table.
pub struct RecordStore {
    records: AHashMap<RecordKey, Record>,
    generation: u64,
}

impl Default for RecordStore {
    fn default() -> Self {
        RecordStore::new()
    }
}

impl RecordStore {
    /// Creates a store seeded with an empty client root record.
    pub fn new() -> Self {
        let mut records = AHashMap::new();
        records.insert(RecordKey::root(), Record::new());
        RecordStore {
            records,
            generation: 0,
        }
    }

    /// Generation of the last committed batch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.contains_key(key)
    }

    /// Merges a patch into the record at `key`, creating it if absent.
    ///
    /// Changed records are stamped with the generation the enclosing batch
    /// will commit as (`generation + 1`).
    pub fn write(&mut self, key: RecordKey, patch: Record) -> WriteOutcome {
        let pending = self.generation + 1;
        let mut warnings = Vec::new();
        let record = self.records.entry(key.clone()).or_default();
        let changed = record.merge_from(&key, patch, &mut warnings);
        if changed {
            record.touch(pending);
        }
        WriteOutcome { changed, warnings }
    }

    /// Removes a record outright. Reserved for the garbage collector;
    /// normalization never deletes.
    pub fn delete(&mut self, key: &RecordKey) -> bool {
        self.records.remove(key).is_some()
    }

    /// Ends a batch: bumps the generation once if any record changed and
    /// returns the receipt describing the batch.
    pub fn seal_commit(
        &mut self,
        changed: HashSet<RecordKey>,
        warnings: Vec<MergeWarning>,
    ) -> CommitReceipt {
        if !changed.is_empty() {
            self.generation += 1;
        }
        let receipt = CommitReceipt {
            generation: self.generation,
            changed,
            warnings,
        };
        debug!(
            generation = receipt.generation,
            changed = receipt.changed.len(),
            warnings = receipt.warnings.len(),
            "sealed normalization batch"
        );
        receipt
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            record_count: self.records.len(),
            generation: self.generation,
        }
    }
}
