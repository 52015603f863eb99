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

//! Mark-sweep collection of records no retained selector can reach.
//!
//! Marking walks each retained selector's selection tree through the store,
//! following only the storage keys those selections actually read. A record
//! referenced by some field nothing selects anymore is garbage even though
//! a link to it still exists, which is exactly the case simple reference
//! counting cannot express.
//!
//! Marking is conservative where the store cannot decide: a branch on an
//! abstract type is always traversed, and a record without a stored
//! `__typename` passes every concrete condition. Over-marking keeps a few
//! records alive one sweep longer; under-marking would delete live data.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use viewgraph_core::{
    FragmentRegistry, FragmentSpec, OperationSpec, RecordKey, Selection, VariableBindings,
};

use crate::record::{Record, StoreValue};
use crate::store::RecordStore;

/// One root the collector must keep alive: a selection tree, the record it
/// is anchored at, and the variables it was executed with.
#[derive(Debug, Clone)]
pub struct RetainedSelector {
    root: RecordKey,
    source: SelectorSource,
    variables: VariableBindings,
}

/// Where a retained selector's selections come from.
#[derive(Debug, Clone)]
pub enum SelectorSource {
    Operation(Arc<OperationSpec>),
    Fragment(Arc<FragmentSpec>),
}

impl SelectorSource {
    fn selections(&self) -> &[Selection] {
        match self {
            SelectorSource::Operation(operation) => &operation.selections,
            SelectorSource::Fragment(fragment) => &fragment.selections,
        }
    }
}

impl RetainedSelector {
    /// Retains everything a root operation reaches. Operations anchor at the
    /// client root record.
    pub fn operation(operation: Arc<OperationSpec>, mut variables: VariableBindings) -> Self {
        variables.apply_defaults(&operation.argument_definitions);
        RetainedSelector {
            root: RecordKey::root(),
            source: SelectorSource::Operation(operation),
            variables,
        }
    }

    /// Retains everything a fragment reaches from the given entity.
    pub fn fragment(
        fragment: Arc<FragmentSpec>,
        root: RecordKey,
        mut variables: VariableBindings,
    ) -> Self {
        variables.apply_defaults(&fragment.argument_definitions);
        RetainedSelector {
            root,
            source: SelectorSource::Fragment(fragment),
            variables,
        }
    }

    pub fn root(&self) -> &RecordKey {
        &self.root
    }
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub marked: usize,
    pub swept: usize,
}

/// Marks every record reachable from the retained selectors, then deletes
/// the rest. The client root record is always retained.
pub fn collect(
    store: &mut RecordStore,
    registry: &FragmentRegistry,
    roots: &[RetainedSelector],
) -> SweepStats {
    let mut marker = Marker {
        store,
        registry,
        marked: HashSet::new(),
        seen: HashSet::new(),
    };
    marker.marked.insert(RecordKey::root());
    for selector in roots {
        marker.mark(
            selector.root.clone(),
            selector.source.selections(),
            &selector.variables,
        );
    }
    let marked = marker.marked;

    let doomed: Vec<RecordKey> = store
        .keys()
        .filter(|key| !marked.contains(*key))
        .cloned()
        .collect();
    let swept = doomed.len();
    for key in doomed {
        store.delete(&key);
    }

    let stats = SweepStats {
        marked: marked.len(),
        swept,
    };
    info!(
        marked = stats.marked,
        swept = stats.swept,
        "garbage collection sweep complete"
    );
    stats
}

struct Marker<'a> {
    store: &'a RecordStore,
    registry: &'a FragmentRegistry,
    marked: HashSet<RecordKey>,
    /// Cycle guard: (record, selection-slice identity, variable scope).
    seen: HashSet<(RecordKey, usize, u64)>,
}

impl Marker<'_> {
    fn mark(&mut self, key: RecordKey, selections: &[Selection], variables: &VariableBindings) {
        let guard = (
            key.clone(),
            selections.as_ptr() as usize,
            variables.fingerprint(),
        );
        if !self.seen.insert(guard) {
            return;
        }
        self.marked.insert(key.clone());
        let Some(record) = self.store.get(&key) else {
            return;
        };

        for selection in selections {
            match selection {
                Selection::ScalarField(_) => {}
                Selection::LinkedField(field) => {
                    let storage = if field.is_connection() {
                        crate::connection::connection_storage_key(field, variables)
                    } else {
                        field.storage_key(variables)
                    };
                    // connection records mirror the edges/pageInfo selection
                    // shape, so one generic walk covers both cases
                    match record.get(&storage) {
                        Some(StoreValue::Ref(child)) => {
                            self.mark(child.clone(), &field.selections, variables);
                        }
                        Some(StoreValue::RefList(links)) => {
                            for child in links.iter().flatten() {
                                self.mark(child.clone(), &field.selections, variables);
                            }
                        }
                        _ => {}
                    }
                }
                Selection::InlineFragment(fragment) => {
                    if branch_reachable(
                        record,
                        fragment.abstract_key.as_deref(),
                        &fragment.type_condition,
                    ) {
                        self.mark(key.clone(), &fragment.selections, variables);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let Some(fragment) = self.registry.get(&spread.name) else {
                        // collection must not fail; unmatched spreads just
                        // mark nothing extra
                        warn!(
                            fragment = spread.name.as_str(),
                            "retained selector spreads an unregistered fragment"
                        );
                        continue;
                    };
                    if !branch_reachable(
                        record,
                        fragment.abstract_key.as_deref(),
                        &fragment.type_condition,
                    ) {
                        continue;
                    }
                    let scope = VariableBindings::for_spread(
                        &fragment.argument_definitions,
                        &spread.args,
                        variables,
                    );
                    self.mark(key.clone(), &fragment.selections, &scope);
                }
            }
        }
    }
}

/// Whether a type-conditioned branch can apply to a stored record. Unlike
/// read-side narrowing this errs toward `true`: abstract conditions always
/// traverse, and a record with no stored typename passes concrete ones.
fn branch_reachable(record: &Record, abstract_key: Option<&str>, condition: &str) -> bool {
    if abstract_key.is_some() {
        return true;
    }
    match record.typename() {
        Some(typename) => typename == condition,
        None => true,
    }
}
