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

//! Fragment resolution: store records in, denormalized [`View`]s out.
//!
//! Resolution walks a fragment's selections against the store, collecting
//! every record it reads into a view arena and every record key it touched
//! into a dependency set (the set subscriptions are invalidated by).
//!
//! ## Memoization
//!
//! Fragment spreads are the memoization boundary. A resolved spread becomes
//! a [`FragmentSubtree`] cached under (entity, fragment identity, variable
//! fingerprint, store generation); while nothing commits, every resolution
//! of that spread returns pointer-identical records. Any commit moves the
//! generation and naturally misses the cache, so stale subtrees simply age
//! out of the memo without explicit invalidation.
//!
//! ## Polymorphism
//!
//! Type conditions narrow against the record's stored `__isX` marker first
//! and an optional [`TypeHierarchy`] second. A record that cannot be
//! decided either way resolves as missing data - never as a guessed branch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use tracing::trace;
use viewgraph_core::{
    FragmentRegistry, FragmentSpec, MissingField, RecordKey, Selection, TypeHierarchy,
    VariableBindings, ViewgraphError, TYPENAME_FIELD,
};
use viewgraph_store::{connection, Record, RecordStore, StoreValue};

use crate::view::{View, ViewRecord, ViewValue};

/// Identity of one fragment-at-entity resolution: the entity key, the
/// registered fragment's pointer identity, and the variable fingerprint.
type BoundaryKey = (RecordKey, usize, u64);

/// Memo key: a [`BoundaryKey`] plus the store generation it was resolved
/// at.
pub type MemoKey = (RecordKey, usize, u64, u64);

/// Shared memo of resolved fragment subtrees, keyed by [`MemoKey`].
pub type ViewMemo = moka::sync::Cache<MemoKey, Arc<FragmentSubtree>>;

/// Everything one fragment spread resolved to, shareable across views.
#[derive(Debug)]
pub struct FragmentSubtree {
    pub(crate) record: Arc<ViewRecord>,
    pub(crate) records: HashMap<RecordKey, Arc<ViewRecord>>,
    pub(crate) dependencies: HashSet<RecordKey>,
    pub(crate) missing: Vec<MissingField>,
    pub(crate) errors: Vec<ViewgraphError>,
    pub(crate) missing_data: bool,
}

impl FragmentSubtree {
    /// The resolved view of the entity the fragment was anchored at.
    pub fn record(&self) -> &Arc<ViewRecord> {
        &self.record
    }
}

/// The complete result of resolving one fragment against the store.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Arena of every record the resolution read.
    pub view: View,
    /// Every record key the resolution touched, present or not. A commit
    /// changing any of these invalidates the resolution.
    pub dependencies: HashSet<RecordKey>,
    /// Fields the selections asked for that the store does not hold.
    pub missing: Vec<MissingField>,
    /// Read errors: dangling references, shape conflicts, type mismatches.
    pub errors: Vec<ViewgraphError>,
    /// Store generation the resolution was computed at.
    pub generation: u64,
    /// True when any required field or record was absent or undecidable.
    pub is_missing_data: bool,
}

impl Resolution {
    /// The resolved entity record, or `None` when nothing could be read at
    /// all (unknown key, failed type condition). Partial records are
    /// returned partial; `is_missing_data` says whether anything selected
    /// was absent.
    pub fn data(&self) -> Option<&Arc<ViewRecord>> {
        self.view.root_record()
    }
}

/// How a record relates to a type condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeMatch {
    Match,
    /// The store cannot decide; resolution reports missing data.
    Unknown,
    Mismatch,
}

/// Resolves fragments against a read-locked store.
pub struct FragmentResolver<'a> {
    store: &'a RecordStore,
    registry: &'a FragmentRegistry,
    hierarchy: Option<&'a TypeHierarchy>,
    memo: Option<&'a ViewMemo>,
}

impl<'a> FragmentResolver<'a> {
    pub fn new(store: &'a RecordStore, registry: &'a FragmentRegistry) -> Self {
        FragmentResolver {
            store,
            registry,
            hierarchy: None,
            memo: None,
        }
    }

    pub fn with_hierarchy(mut self, hierarchy: &'a TypeHierarchy) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    pub fn with_memo(mut self, memo: &'a ViewMemo) -> Self {
        self.memo = Some(memo);
        self
    }

    /// Resolves `fragment` anchored at `entity`.
    ///
    /// Never fails as a whole: problems are collected onto the resolution
    /// so one bad branch cannot take down an otherwise usable view.
    pub fn resolve(
        &self,
        fragment: &Arc<FragmentSpec>,
        entity: &RecordKey,
        variables: &VariableBindings,
    ) -> Resolution {
        let mut variables = variables.clone();
        variables.apply_defaults(&fragment.argument_definitions);

        let mut out = Collector::default();
        let mut stack = HashSet::new();
        out.dependencies.insert(entity.clone());

        match self.store.get(entity) {
            None => {
                out.errors
                    .push(ViewgraphError::UnknownEntityKey(entity.clone()));
                out.missing_data = true;
            }
            Some(record) => match self.narrow(
                entity,
                record,
                &fragment.type_condition,
                fragment.abstract_key.as_deref(),
            ) {
                TypeMatch::Match => {
                    self.resolve_boundary(&mut out, &mut stack, entity, fragment, &variables);
                }
                TypeMatch::Unknown => {
                    out.note_undecided(entity, record, fragment.abstract_key.as_deref());
                }
                TypeMatch::Mismatch => {
                    // at the anchor this is a caller error, not a skippable
                    // branch
                    out.errors.push(ViewgraphError::TypeMismatch {
                        key: entity.clone(),
                        expected: fragment.type_condition.clone(),
                        actual: record.typename().unwrap_or("<unknown>").to_string(),
                    });
                    out.missing_data = true;
                }
            },
        }

        trace!(
            entity = %entity,
            fragment = fragment.name.as_str(),
            records = out.records.len(),
            missing = out.missing.len(),
            "resolved fragment"
        );
        Resolution {
            view: View::from_parts(Some(entity.clone()), out.records),
            dependencies: out.dependencies,
            missing: out.missing,
            errors: out.errors,
            generation: self.store.generation(),
            is_missing_data: out.missing_data,
        }
    }

    /// Resolves one fragment boundary, going through the memo when one is
    /// attached.
    fn resolve_boundary(
        &self,
        out: &mut Collector,
        stack: &mut HashSet<BoundaryKey>,
        key: &RecordKey,
        fragment: &Arc<FragmentSpec>,
        variables: &VariableBindings,
    ) {
        let boundary = (
            key.clone(),
            Arc::as_ptr(fragment) as usize,
            variables.fingerprint(),
        );
        if stack.contains(&boundary) {
            // re-entrant spread on cyclic data: cut here, keep the
            // dependency so invalidation still works
            out.dependencies.insert(key.clone());
            out.cycle_cut = true;
            return;
        }
        if let Some(memo) = self.memo {
            let memo_key = (
                boundary.0.clone(),
                boundary.1,
                boundary.2,
                self.store.generation(),
            );
            if let Some(subtree) = memo.get(&memo_key) {
                out.absorb(&subtree);
                return;
            }
        }
        stack.insert(boundary.clone());

        let mut sub = Collector::default();
        sub.dependencies.insert(key.clone());
        let mut fields = BTreeMap::new();
        match self.store.get(key) {
            None => {
                sub.errors.push(ViewgraphError::UnknownEntityKey(key.clone()));
                sub.missing_data = true;
            }
            Some(record) => {
                self.read_selections(
                    &mut sub,
                    stack,
                    key,
                    record,
                    &fragment.selections,
                    variables,
                    &mut fields,
                );
            }
        }
        let record = Arc::new(ViewRecord::from_parts(
            key.clone(),
            self.store
                .get(key)
                .and_then(Record::typename)
                .map(str::to_owned),
            fields,
        ));
        sub.share(Arc::clone(&record));

        let cut = sub.cycle_cut;
        let subtree = Arc::new(FragmentSubtree {
            record,
            records: mem::take(&mut sub.records),
            dependencies: mem::take(&mut sub.dependencies),
            missing: mem::take(&mut sub.missing),
            errors: mem::take(&mut sub.errors),
            missing_data: sub.missing_data,
        });
        // a subtree whose walk was cut by the re-entrancy guard is only
        // correct in this stack context, so it must not be memoized
        if !cut {
            if let Some(memo) = self.memo {
                memo.insert(
                    (
                        boundary.0.clone(),
                        boundary.1,
                        boundary.2,
                        self.store.generation(),
                    ),
                    Arc::clone(&subtree),
                );
            }
        }
        out.absorb(&subtree);
        out.cycle_cut |= cut;
        stack.remove(&boundary);
    }

    #[allow(clippy::too_many_arguments)]
    fn read_selections(
        &self,
        out: &mut Collector,
        stack: &mut HashSet<BoundaryKey>,
        key: &RecordKey,
        record: &Record,
        selections: &[Selection],
        variables: &VariableBindings,
        fields: &mut BTreeMap<String, ViewValue>,
    ) {
        for selection in selections {
            match selection {
                Selection::ScalarField(field) => {
                    if field.name == TYPENAME_FIELD {
                        match record.typename() {
                            Some(typename) => {
                                fields.insert(
                                    field.response_key().to_string(),
                                    ViewValue::Scalar(typename.into()),
                                );
                            }
                            None => out.note_missing(key, TYPENAME_FIELD),
                        }
                        continue;
                    }
                    let storage = field.storage_key(variables);
                    match record.get(&storage) {
                        Some(StoreValue::Scalar(value)) => {
                            fields.insert(
                                field.response_key().to_string(),
                                ViewValue::Scalar(value.clone()),
                            );
                        }
                        Some(StoreValue::Null) => {
                            fields.insert(field.response_key().to_string(), ViewValue::Null);
                        }
                        Some(other) => out.errors.push(ViewgraphError::TypeMismatch {
                            key: key.clone(),
                            expected: "scalar".to_string(),
                            actual: other.class().to_string(),
                        }),
                        None => out.note_missing(key, &storage),
                    }
                }
                Selection::LinkedField(field) => {
                    let storage = if field.is_connection() {
                        connection::connection_storage_key(field, variables)
                    } else {
                        field.storage_key(variables)
                    };
                    match record.get(&storage) {
                        Some(StoreValue::Ref(child)) if !field.plural => {
                            self.resolve_record(out, stack, child, &field.selections, variables);
                            fields.insert(
                                field.response_key().to_string(),
                                ViewValue::Ref(child.clone()),
                            );
                        }
                        Some(StoreValue::RefList(links)) if field.plural => {
                            for child in links.iter().flatten() {
                                self.resolve_record(
                                    out,
                                    stack,
                                    child,
                                    &field.selections,
                                    variables,
                                );
                            }
                            fields.insert(
                                field.response_key().to_string(),
                                ViewValue::RefList(links.clone()),
                            );
                        }
                        Some(StoreValue::Null) => {
                            fields.insert(field.response_key().to_string(), ViewValue::Null);
                        }
                        Some(other) => out.errors.push(ViewgraphError::TypeMismatch {
                            key: key.clone(),
                            expected: if field.plural {
                                "reference list".to_string()
                            } else {
                                "reference".to_string()
                            },
                            actual: other.class().to_string(),
                        }),
                        None => out.note_missing(key, &storage),
                    }
                }
                Selection::InlineFragment(fragment) => {
                    match self.narrow(
                        key,
                        record,
                        &fragment.type_condition,
                        fragment.abstract_key.as_deref(),
                    ) {
                        TypeMatch::Match => {
                            // inline selections flatten onto this record
                            self.read_selections(
                                out,
                                stack,
                                key,
                                record,
                                &fragment.selections,
                                variables,
                                fields,
                            );
                        }
                        TypeMatch::Unknown => {
                            out.note_undecided(key, record, fragment.abstract_key.as_deref());
                        }
                        TypeMatch::Mismatch => {}
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let Some(fragment) = self.registry.get(&spread.name) else {
                        out.errors
                            .push(ViewgraphError::UnknownFragment(spread.name.clone()));
                        out.missing_data = true;
                        continue;
                    };
                    match self.narrow(
                        key,
                        record,
                        &fragment.type_condition,
                        fragment.abstract_key.as_deref(),
                    ) {
                        TypeMatch::Match => {
                            let scope = VariableBindings::for_spread(
                                &fragment.argument_definitions,
                                &spread.args,
                                variables,
                            );
                            self.resolve_boundary(out, stack, key, &fragment, &scope);
                        }
                        TypeMatch::Unknown => {
                            out.note_undecided(key, record, fragment.abstract_key.as_deref());
                        }
                        TypeMatch::Mismatch => {}
                    }
                }
            }
        }
    }

    /// Resolves a linked record into the arena. Within one boundary the
    /// variable scope is fixed, so (key, selection identity) is enough to
    /// guard against cyclic links.
    fn resolve_record(
        &self,
        out: &mut Collector,
        stack: &mut HashSet<BoundaryKey>,
        key: &RecordKey,
        selections: &[Selection],
        variables: &VariableBindings,
    ) {
        out.dependencies.insert(key.clone());
        if !out.visited.insert((key.clone(), selections.as_ptr() as usize)) {
            return;
        }
        let Some(record) = self.store.get(key) else {
            out.errors.push(ViewgraphError::UnknownEntityKey(key.clone()));
            out.missing_data = true;
            return;
        };
        let mut fields = BTreeMap::new();
        self.read_selections(out, stack, key, record, selections, variables, &mut fields);
        out.share(Arc::new(ViewRecord::from_parts(
            key.clone(),
            record.typename().map(str::to_owned),
            fields,
        )));
    }

    /// Decides whether a stored record satisfies a type condition.
    fn narrow(
        &self,
        key: &RecordKey,
        record: &Record,
        condition: &str,
        abstract_key: Option<&str>,
    ) -> TypeMatch {
        // the client root is typeless and matches any operation root
        if key.is_root() {
            return TypeMatch::Match;
        }
        if let Some(marker) = abstract_key {
            if record.get(marker).is_some() {
                return TypeMatch::Match;
            }
            // marker never fetched: the hierarchy may still decide
            return match record.typename() {
                Some(typename) => match self.hierarchy {
                    Some(hierarchy) if hierarchy.implements(typename, condition) => {
                        TypeMatch::Match
                    }
                    Some(hierarchy) if hierarchy.knows(typename) => TypeMatch::Mismatch,
                    _ => TypeMatch::Unknown,
                },
                None => TypeMatch::Unknown,
            };
        }
        match record.typename() {
            Some(typename) if typename == condition => TypeMatch::Match,
            Some(_) => TypeMatch::Mismatch,
            None => TypeMatch::Unknown,
        }
    }
}

/// Accumulator for one resolution pass (or one fragment boundary within
/// it).
#[derive(Default)]
struct Collector {
    records: HashMap<RecordKey, Arc<ViewRecord>>,
    dependencies: HashSet<RecordKey>,
    missing: Vec<MissingField>,
    errors: Vec<ViewgraphError>,
    missing_data: bool,
    /// (key, selection identity) pairs already built in this boundary.
    visited: HashSet<(RecordKey, usize)>,
    /// Set when the re-entrancy guard cut the walk somewhere below.
    cycle_cut: bool,
}

impl Collector {
    /// Adds a record view to the arena, unioning with any view of the same
    /// record that is already there.
    fn share(&mut self, record: Arc<ViewRecord>) {
        use std::collections::hash_map::Entry;
        match self.records.entry(record.key().clone()) {
            Entry::Occupied(mut entry) => {
                let merged = ViewRecord::union(entry.get(), &record);
                entry.insert(merged);
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
    }

    /// Folds a resolved subtree (memoized or fresh) into this collector.
    fn absorb(&mut self, subtree: &FragmentSubtree) {
        for record in subtree.records.values() {
            self.share(Arc::clone(record));
        }
        self.dependencies
            .extend(subtree.dependencies.iter().cloned());
        self.missing.extend(subtree.missing.iter().cloned());
        self.errors.extend(subtree.errors.iter().cloned());
        self.missing_data |= subtree.missing_data;
    }

    fn note_missing(&mut self, key: &RecordKey, field: &str) {
        self.missing.push(MissingField {
            key: key.clone(),
            field: field.to_string(),
        });
        self.missing_data = true;
    }

    /// Records that a type condition could not be decided: the field whose
    /// absence blocks the decision is what a refetch would need.
    fn note_undecided(&mut self, key: &RecordKey, record: &Record, abstract_key: Option<&str>) {
        let field = match (abstract_key, record.typename()) {
            (Some(marker), Some(_)) => marker,
            _ => TYPENAME_FIELD,
        };
        self.note_missing(key, field);
    }
}
