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

//! Denormalized read views.
//!
//! A [`View`] is an immutable snapshot produced by one resolution: an arena
//! of [`ViewRecord`]s indexed by record key, plus the key the resolution was
//! anchored at. Records reference each other by key rather than by nesting,
//! so cyclic graphs denormalize without blowing up and shared records appear
//! once no matter how many paths reach them.
//!
//! Record views are shared behind `Arc`. When two resolutions produce the
//! same fragment subtree, they hand out pointer-identical records, so
//! consumers can use `Arc::ptr_eq` as a cheap "did my data change" test.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use viewgraph_core::RecordKey;

/// A resolved field value on a [`ViewRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum ViewValue {
    Null,
    Scalar(Value),
    Ref(RecordKey),
    RefList(Vec<Option<RecordKey>>),
}

impl ViewValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ViewValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&RecordKey> {
        match self {
            ViewValue::Ref(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&[Option<RecordKey>]> {
        match self {
            ViewValue::RefList(keys) => Some(keys),
            _ => None,
        }
    }
}

/// One record as a resolution saw it.
///
/// Fields are indexed by response key - the alias a selection asked for -
/// unlike store records, which index by canonical storage key. A view is
/// what the selection requested, not what the store holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRecord {
    key: RecordKey,
    typename: Option<String>,
    fields: BTreeMap<String, ViewValue>,
}

impl ViewRecord {
    pub(crate) fn from_parts(
        key: RecordKey,
        typename: Option<String>,
        fields: BTreeMap<String, ViewValue>,
    ) -> Self {
        ViewRecord {
            key,
            typename,
            fields,
        }
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn typename(&self) -> Option<&str> {
        self.typename.as_deref()
    }

    pub fn get(&self, field: &str) -> Option<&ViewValue> {
        self.fields.get(field)
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(ViewValue::as_scalar)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.scalar(field).and_then(Value::as_str)
    }

    pub fn boolean(&self, field: &str) -> Option<bool> {
        self.scalar(field).and_then(Value::as_bool)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.scalar(field).and_then(Value::as_i64)
    }

    pub fn link(&self, field: &str) -> Option<&RecordKey> {
        self.fields.get(field).and_then(ViewValue::as_link)
    }

    pub fn links(&self, field: &str) -> Option<&[Option<RecordKey>]> {
        self.fields.get(field).and_then(ViewValue::as_links)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &ViewValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Combines two views of the same record, reusing an existing `Arc`
    /// whenever one side already covers the other. Identity only changes
    /// when the content actually differs, which keeps `Arc::ptr_eq`
    /// meaningful for memoized subtrees.
    pub(crate) fn union(a: &Arc<ViewRecord>, b: &Arc<ViewRecord>) -> Arc<ViewRecord> {
        if Arc::ptr_eq(a, b) || covers(a, b) {
            return Arc::clone(a);
        }
        if covers(b, a) {
            return Arc::clone(b);
        }
        let mut fields = a.fields.clone();
        for (name, value) in &b.fields {
            fields.insert(name.clone(), value.clone());
        }
        Arc::new(ViewRecord {
            key: a.key.clone(),
            typename: b.typename.clone().or_else(|| a.typename.clone()),
            fields,
        })
    }
}

/// Whether `outer` already contains everything `inner` holds.
fn covers(outer: &ViewRecord, inner: &ViewRecord) -> bool {
    (inner.typename.is_none() || inner.typename == outer.typename)
        && inner
            .fields
            .iter()
            .all(|(name, value)| outer.fields.get(name) == Some(value))
}

/// An immutable snapshot of everything one resolution read.
#[derive(Debug, Clone, Default)]
pub struct View {
    root: Option<RecordKey>,
    records: HashMap<RecordKey, Arc<ViewRecord>>,
}

impl View {
    pub(crate) fn from_parts(
        root: Option<RecordKey>,
        records: HashMap<RecordKey, Arc<ViewRecord>>,
    ) -> Self {
        View { root, records }
    }

    pub fn root(&self) -> Option<&RecordKey> {
        self.root.as_ref()
    }

    pub fn root_record(&self) -> Option<&Arc<ViewRecord>> {
        self.root.as_ref().and_then(|key| self.records.get(key))
    }

    pub fn record(&self, key: &RecordKey) -> Option<&Arc<ViewRecord>> {
        self.records.get(key)
    }

    /// Follows a reference field from one record to the record it points
    /// at, staying inside this snapshot.
    pub fn follow(&self, record: &ViewRecord, field: &str) -> Option<&Arc<ViewRecord>> {
        self.record(record.link(field)?)
    }

    /// Follows a plural reference field; slots that were null or outside
    /// the snapshot come back as `None`.
    pub fn follow_all(&self, record: &ViewRecord, field: &str) -> Vec<Option<&Arc<ViewRecord>>> {
        record
            .links(field)
            .map(|links| {
                links
                    .iter()
                    .map(|slot| slot.as_ref().and_then(|key| self.record(key)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn records(&self) -> impl Iterator<Item = (&RecordKey, &Arc<ViewRecord>)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
