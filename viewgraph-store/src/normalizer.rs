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

//! Payload normalization: response trees in, flat records out.
//!
//! The normalizer walks a payload and the selection tree that produced it
//! in lockstep. Fields are read at their response key (alias) and written
//! at their canonical storage key; nested objects become linked records,
//! keyed by global id when present and by a path-synthesized key otherwise.
//! Connection fields hand off to [`crate::connection`] so pages merge
//! instead of replacing each other.
//!
//! Normalization is total over the payload it is given: entries the payload
//! lacks are skipped (they stay missing in the store, read-side resolution
//! reports them), and a payload entry whose shape contradicts the store is
//! written anyway with a [`MergeWarning`] on the outcome.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use viewgraph_core::{
    FragmentRegistry, LinkedField, MergeWarning, RecordKey, Result, Selection, TransportError,
    VariableBindings, ViewgraphError, TYPENAME_FIELD,
};

use crate::connection::{self, IncomingEdge, PageInfoPatch};
use crate::record::{Record, StoreValue};
use crate::store::RecordStore;

const ID_FIELD: &str = "id";

/// Everything one [`normalize_response`] call did to the store.
#[derive(Debug)]
pub struct NormalizeOutcome {
    /// The record the payload was anchored at.
    pub root: RecordKey,
    /// Keys of every record the batch changed.
    pub written: HashSet<RecordKey>,
    /// Shape conflicts the batch tolerated (last write won).
    pub warnings: Vec<MergeWarning>,
}

/// Normalizes one response payload into the store.
///
/// The caller seals the batch afterwards via [`RecordStore::seal_commit`]
/// with the outcome's `written` and `warnings`.
pub fn normalize_response(
    store: &mut RecordStore,
    registry: &FragmentRegistry,
    root: &RecordKey,
    selections: &[Selection],
    variables: &VariableBindings,
    payload: &Value,
) -> Result<NormalizeOutcome> {
    let Some(object) = payload.as_object() else {
        return Err(TransportError::Protocol(
            "response payload root must be a JSON object".to_string(),
        )
        .into());
    };

    let mut normalizer = Normalizer {
        store,
        registry,
        written: HashSet::new(),
        warnings: Vec::new(),
    };
    normalizer.normalize_object(root, selections, variables, object)?;

    debug!(
        root = %root,
        written = normalizer.written.len(),
        warnings = normalizer.warnings.len(),
        "normalized response payload"
    );
    Ok(NormalizeOutcome {
        root: root.clone(),
        written: normalizer.written,
        warnings: normalizer.warnings,
    })
}

struct Normalizer<'a> {
    store: &'a mut RecordStore,
    registry: &'a FragmentRegistry,
    written: HashSet<RecordKey>,
    warnings: Vec<MergeWarning>,
}

impl Normalizer<'_> {
    fn record_write(&mut self, key: RecordKey, patch: Record) {
        let outcome = self.store.write(key.clone(), patch);
        if outcome.changed {
            self.written.insert(key);
        }
        self.warnings.extend(outcome.warnings);
    }

    fn normalize_object(
        &mut self,
        key: &RecordKey,
        selections: &[Selection],
        variables: &VariableBindings,
        payload: &Map<String, Value>,
    ) -> Result<()> {
        let mut patch = Record::new();
        if let Some(typename) = payload.get(TYPENAME_FIELD).and_then(Value::as_str) {
            patch.set_typename(typename);
        }
        self.collect_fields(&mut patch, key, selections, variables, payload)?;
        self.record_write(key.clone(), patch);
        Ok(())
    }

    fn collect_fields(
        &mut self,
        patch: &mut Record,
        key: &RecordKey,
        selections: &[Selection],
        variables: &VariableBindings,
        payload: &Map<String, Value>,
    ) -> Result<()> {
        for selection in selections {
            match selection {
                Selection::ScalarField(field) => {
                    // the typename is carried on the record itself
                    if field.name == TYPENAME_FIELD {
                        continue;
                    }
                    let Some(raw) = payload.get(field.response_key()) else {
                        continue;
                    };
                    let value = if raw.is_null() {
                        StoreValue::Null
                    } else {
                        StoreValue::Scalar(raw.clone())
                    };
                    patch.set(field.storage_key(variables), value);
                }
                Selection::LinkedField(field) if field.is_connection() => {
                    self.collect_connection(patch, key, field, variables, payload)?;
                }
                Selection::LinkedField(field) => {
                    let Some(raw) = payload.get(field.response_key()) else {
                        continue;
                    };
                    let storage = field.storage_key(variables);
                    let value = if field.plural {
                        self.normalize_plural(key, &storage, field, variables, raw)?
                    } else {
                        self.normalize_link(key, &storage, field, variables, raw)?
                    };
                    patch.set(storage, value);
                }
                Selection::InlineFragment(fragment) => {
                    if !branch_applies(
                        fragment.abstract_key.as_deref(),
                        &fragment.type_condition,
                        payload,
                    ) {
                        continue;
                    }
                    // persist the abstract marker so reads can narrow later
                    if let Some(marker) = &fragment.abstract_key {
                        if let Some(raw) = payload.get(marker) {
                            patch.set(marker.clone(), StoreValue::Scalar(raw.clone()));
                        }
                    }
                    self.collect_fields(patch, key, &fragment.selections, variables, payload)?;
                }
                Selection::FragmentSpread(spread) => {
                    let Some(fragment) = self.registry.get(&spread.name) else {
                        return Err(ViewgraphError::UnknownFragment(spread.name.clone()));
                    };
                    if !branch_applies(
                        fragment.abstract_key.as_deref(),
                        &fragment.type_condition,
                        payload,
                    ) {
                        continue;
                    }
                    if let Some(marker) = &fragment.abstract_key {
                        if let Some(raw) = payload.get(marker) {
                            patch.set(marker.clone(), StoreValue::Scalar(raw.clone()));
                        }
                    }
                    let scope = VariableBindings::for_spread(
                        &fragment.argument_definitions,
                        &spread.args,
                        variables,
                    );
                    self.collect_fields(patch, key, &fragment.selections, &scope, payload)?;
                }
            }
        }
        Ok(())
    }

    fn normalize_link(
        &mut self,
        parent: &RecordKey,
        storage: &str,
        field: &LinkedField,
        variables: &VariableBindings,
        raw: &Value,
    ) -> Result<StoreValue> {
        match raw {
            Value::Null => Ok(StoreValue::Null),
            Value::Object(object) => {
                let child = linked_key(parent, storage, object, None);
                self.normalize_object(&child, &field.selections, variables, object)?;
                Ok(StoreValue::Ref(child))
            }
            other => {
                warn!(
                    field = field.name.as_str(),
                    "linked field payload is not an object; storing as scalar"
                );
                Ok(StoreValue::Scalar(other.clone()))
            }
        }
    }

    fn normalize_plural(
        &mut self,
        parent: &RecordKey,
        storage: &str,
        field: &LinkedField,
        variables: &VariableBindings,
        raw: &Value,
    ) -> Result<StoreValue> {
        let Some(items) = raw.as_array() else {
            warn!(
                field = field.name.as_str(),
                "plural linked field payload is not an array; storing as scalar"
            );
            return Ok(StoreValue::Scalar(raw.clone()));
        };

        let mut links = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match item {
                Value::Null => links.push(None),
                Value::Object(object) => {
                    let child = linked_key(parent, storage, object, Some(index));
                    self.normalize_object(&child, &field.selections, variables, object)?;
                    links.push(Some(child));
                }
                _ => {
                    warn!(
                        field = field.name.as_str(),
                        index, "plural linked element is not an object; keeping a null slot"
                    );
                    links.push(None);
                }
            }
        }
        Ok(StoreValue::RefList(links))
    }

    fn collect_connection(
        &mut self,
        patch: &mut Record,
        parent: &RecordKey,
        field: &LinkedField,
        variables: &VariableBindings,
        payload: &Map<String, Value>,
    ) -> Result<()> {
        let Some(raw) = payload.get(field.response_key()) else {
            return Ok(());
        };
        let storage = connection::connection_storage_key(field, variables);
        if raw.is_null() {
            patch.set(storage, StoreValue::Null);
            return Ok(());
        }
        let Some(object) = raw.as_object() else {
            warn!(
                field = field.name.as_str(),
                "connection payload is not an object; skipping"
            );
            return Ok(());
        };

        let connection_key = RecordKey::child_of(parent, &storage);
        let direction = connection::merge_direction(&field.args, variables);

        let mut incoming: Vec<IncomingEdge> = Vec::new();
        let edges_field = find_linked(&field.selections, connection::EDGES);
        if let Some(edges_field) = edges_field {
            let raw_edges = object
                .get(edges_field.response_key())
                .and_then(Value::as_array);
            if let Some(raw_edges) = raw_edges {
                incoming.reserve(raw_edges.len());
                let node_fields: Vec<&LinkedField> = edges_field
                    .selections
                    .iter()
                    .filter_map(|sel| match sel {
                        Selection::LinkedField(f) if f.name == connection::NODE => Some(f),
                        _ => None,
                    })
                    .collect();
                let cursor_key = edges_field
                    .selections
                    .iter()
                    .find_map(|sel| match sel {
                        Selection::ScalarField(f) if f.name == connection::CURSOR => {
                            Some(f.response_key())
                        }
                        _ => None,
                    })
                    .unwrap_or(connection::CURSOR);

                for (index, raw_edge) in raw_edges.iter().enumerate() {
                    let Some(edge_object) = raw_edge.as_object() else {
                        warn!(index, "connection edge is not an object; skipping");
                        continue;
                    };
                    let cursor = edge_object
                        .get(cursor_key)
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    let has_node = node_fields
                        .iter()
                        .any(|nf| edge_object.get(nf.response_key()).is_some_and(Value::is_object));
                    let node_id = node_fields.iter().find_map(|nf| {
                        edge_object
                            .get(nf.response_key())
                            .and_then(Value::as_object)
                            .and_then(|node| node.get(ID_FIELD))
                            .and_then(Value::as_str)
                    });

                    let edge =
                        connection::edge_key(&connection_key, node_id, cursor.as_deref(), index);
                    let node = has_node.then(|| {
                        node_id
                            .map(RecordKey::global)
                            .unwrap_or_else(|| RecordKey::child_of(&edge, connection::NODE))
                    });

                    if let Some(node_key) = &node {
                        for node_field in &node_fields {
                            if let Some(node_object) = edge_object
                                .get(node_field.response_key())
                                .and_then(Value::as_object)
                            {
                                self.normalize_object(
                                    node_key,
                                    &node_field.selections,
                                    variables,
                                    node_object,
                                )?;
                            }
                        }
                    }
                    incoming.push(IncomingEdge { edge, node, cursor });
                }
            }
        }

        let page_info = page_info_patch(
            find_linked(&field.selections, connection::PAGE_INFO),
            object,
        );
        let outcome =
            connection::merge_page(&mut *self.store, &connection_key, direction, incoming, page_info);
        self.written.extend(outcome.changed);
        self.warnings.extend(outcome.warnings);

        patch.set(storage, StoreValue::Ref(connection_key));
        Ok(())
    }
}

/// Key for a linked record: global id when the payload carries one,
/// otherwise a key synthesized from the path that reached it.
fn linked_key(
    parent: &RecordKey,
    storage: &str,
    object: &Map<String, Value>,
    index: Option<usize>,
) -> RecordKey {
    if let Some(id) = object.get(ID_FIELD).and_then(Value::as_str) {
        return RecordKey::global(id);
    }
    match index {
        Some(index) => RecordKey::element_of(parent, storage, index),
        None => RecordKey::child_of(parent, storage),
    }
}

/// Whether a type-conditioned branch applies to a payload object.
///
/// Abstract branches require the `__isX` marker the server echoes for
/// implementing types. Concrete branches compare `__typename`; a payload
/// without one cannot be narrowed, so the branch applies and field presence
/// decides what gets written.
fn branch_applies(
    abstract_key: Option<&str>,
    condition: &str,
    payload: &Map<String, Value>,
) -> bool {
    if let Some(marker) = abstract_key {
        return payload.contains_key(marker);
    }
    match payload.get(TYPENAME_FIELD).and_then(Value::as_str) {
        Some(typename) => typename == condition,
        None => true,
    }
}

fn find_linked<'s>(selections: &'s [Selection], name: &str) -> Option<&'s LinkedField> {
    selections.iter().find_map(|sel| match sel {
        Selection::LinkedField(field) if field.name == name => Some(field),
        _ => None,
    })
}

fn page_info_patch(
    field: Option<&LinkedField>,
    connection_object: &Map<String, Value>,
) -> PageInfoPatch {
    let response_key = field
        .map(LinkedField::response_key)
        .unwrap_or(connection::PAGE_INFO);
    let Some(object) = connection_object.get(response_key).and_then(Value::as_object) else {
        return PageInfoPatch::default();
    };

    let read = |schema: &str| -> Option<&Value> {
        let key = field
            .and_then(|f| {
                f.selections.iter().find_map(|sel| match sel {
                    Selection::ScalarField(sf) if sf.name == schema => Some(sf.response_key()),
                    _ => None,
                })
            })
            .unwrap_or(schema);
        object.get(key)
    };

    PageInfoPatch {
        has_next_page: read(connection::HAS_NEXT_PAGE).and_then(Value::as_bool),
        has_previous_page: read(connection::HAS_PREVIOUS_PAGE).and_then(Value::as_bool),
        start_cursor: read(connection::START_CURSOR).cloned(),
        end_cursor: read(connection::END_CURSOR).cloned(),
    }
}
