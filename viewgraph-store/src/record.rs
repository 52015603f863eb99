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

//! The record model: flat field maps keyed by canonical storage keys.
//!
//! A record never embeds another record. Nested payload objects become
//! [`StoreValue::Ref`] / [`StoreValue::RefList`] entries pointing at other
//! records by key, which is what makes overlapping query results converge
//! on a single copy of each entity.

use std::collections::BTreeMap;

use serde_json::Value;
use viewgraph_core::{MergeWarning, RecordKey, ValueClass};

/// One field value on a record.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    /// The server returned an explicit `null`.
    Null,
    /// A JSON scalar, or arbitrary JSON for custom scalar types.
    Scalar(Value),
    /// A link to one record.
    Ref(RecordKey),
    /// An ordered list of links; `None` slots keep payload nulls in place.
    RefList(Vec<Option<RecordKey>>),
}

impl StoreValue {
    pub fn class(&self) -> ValueClass {
        match self {
            StoreValue::Null => ValueClass::Null,
            StoreValue::Scalar(_) => ValueClass::Scalar,
            StoreValue::Ref(_) => ValueClass::Ref,
            StoreValue::RefList(_) => ValueClass::RefList,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            StoreValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&RecordKey> {
        match self {
            StoreValue::Ref(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&[Option<RecordKey>]> {
        match self {
            StoreValue::RefList(keys) => Some(keys),
            _ => None,
        }
    }
}

/// A normalized record: an optional concrete typename plus a field map.
///
/// `updated_at` carries the store generation of the last batch that changed
/// the record; the store stamps it, merges never compare it.
#[derive(Debug, Clone, Default)]
pub struct Record {
    typename: Option<String>,
    fields: BTreeMap<String, StoreValue>,
    updated_at: u64,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    pub fn typename(&self) -> Option<&str> {
        self.typename.as_deref()
    }

    pub fn set_typename(&mut self, typename: impl Into<String>) {
        self.typename = Some(typename.into());
    }

    pub fn get(&self, field: &str) -> Option<&StoreValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: StoreValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &StoreValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub(crate) fn touch(&mut self, generation: u64) {
        self.updated_at = generation;
    }

    /// Merges a patch into this record field by field.
    ///
    /// Equal values are no-ops. A non-null value replacing a non-null value
    /// of a different shape class wins but is reported as a warning; lists
    /// always replace wholesale. Returns whether anything changed.
    pub(crate) fn merge_from(
        &mut self,
        key: &RecordKey,
        patch: Record,
        warnings: &mut Vec<MergeWarning>,
    ) -> bool {
        let mut changed = false;

        if patch.typename.is_some() && patch.typename != self.typename {
            self.typename = patch.typename;
            changed = true;
        }

        for (field, incoming) in patch.fields {
            match self.fields.get(&field) {
                Some(existing) if *existing == incoming => {}
                Some(existing) => {
                    let existing_class = existing.class();
                    let incoming_class = incoming.class();
                    if existing_class != incoming_class
                        && existing_class != ValueClass::Null
                        && incoming_class != ValueClass::Null
                    {
                        warnings.push(MergeWarning {
                            key: key.clone(),
                            field: field.clone(),
                            existing: existing_class,
                            incoming: incoming_class,
                        });
                    }
                    self.fields.insert(field, incoming);
                    changed = true;
                }
                None => {
                    self.fields.insert(field, incoming);
                    changed = true;
                }
            }
        }

        changed
    }
}
