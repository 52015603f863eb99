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

//! Fragment specifications and the registry spreads resolve through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::args::VariableDefinition;
use crate::error::{Result, ViewgraphError};
use crate::selection::Selection;

/// A named, reusable selection set rooted on one type condition.
///
/// Fragments are registered once and shared behind `Arc`; the pointer
/// identity of a registered spec doubles as its memoization identity in
/// resolvers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpec {
    pub name: String,
    /// The type condition, named `type` in descriptor JSON.
    #[serde(rename = "type")]
    pub type_condition: String,
    /// Marker field (`__isX`) when the condition is an abstract type.
    #[serde(default)]
    pub abstract_key: Option<String>,
    #[serde(default)]
    pub argument_definitions: Vec<VariableDefinition>,
    #[serde(default)]
    pub selections: Vec<Selection>,
}

impl FragmentSpec {
    pub fn new(name: impl Into<String>, type_condition: impl Into<String>) -> Self {
        FragmentSpec {
            name: name.into(),
            type_condition: type_condition.into(),
            abstract_key: None,
            argument_definitions: Vec::new(),
            selections: Vec::new(),
        }
    }

    pub fn with_abstract_key(mut self, abstract_key: impl Into<String>) -> Self {
        self.abstract_key = Some(abstract_key.into());
        self
    }

    pub fn with_argument(mut self, definition: VariableDefinition) -> Self {
        self.argument_definitions.push(definition);
        self
    }

    pub fn with_selections(mut self, selections: Vec<Selection>) -> Self {
        self.selections = selections;
        self
    }

    /// Loads a spec from descriptor JSON.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(ViewgraphError::descriptor)
    }
}

/// Name-indexed registry of fragment specs.
///
/// Spreads reference fragments by name only; normalization and resolution
/// look the target up here. Registration replaces any previous spec under
/// the same name, which invalidates memoized views naturally because the
/// replacement has a fresh pointer identity.
#[derive(Debug, Default)]
pub struct FragmentRegistry {
    fragments: DashMap<String, Arc<FragmentSpec>>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        FragmentRegistry {
            fragments: DashMap::new(),
        }
    }

    pub fn register(&self, spec: FragmentSpec) -> Arc<FragmentSpec> {
        let shared = Arc::new(spec);
        self.fragments
            .insert(shared.name.clone(), Arc::clone(&shared));
        shared
    }

    pub fn get(&self, name: &str) -> Option<Arc<FragmentSpec>> {
        self.fragments.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fragments.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Optional concrete-to-abstract type table used to narrow stale records
/// whose `__isX` marker was never fetched.
///
/// The table only answers for types it was told about. Resolution never
/// guesses: a type the table does not know stays undecided and surfaces as
/// missing data instead of a wrong branch.
#[derive(Debug, Clone, Default)]
pub struct TypeHierarchy {
    implements: HashMap<String, HashSet<String>>,
}

impl TypeHierarchy {
    pub fn new() -> Self {
        TypeHierarchy {
            implements: HashMap::new(),
        }
    }

    /// Declares that `concrete` implements (or is a member of) the abstract
    /// type `abstract_type`.
    pub fn declare(&mut self, concrete: impl Into<String>, abstract_type: impl Into<String>) {
        self.implements
            .entry(concrete.into())
            .or_default()
            .insert(abstract_type.into());
    }

    /// Whether the table has any entry for `concrete`.
    pub fn knows(&self, concrete: &str) -> bool {
        self.implements.contains_key(concrete)
    }

    pub fn implements(&self, concrete: &str, abstract_type: &str) -> bool {
        self.implements
            .get(concrete)
            .is_some_and(|types| types.contains(abstract_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_round_trip() {
        let registry = FragmentRegistry::new();
        assert!(registry.is_empty());

        let spec = FragmentSpec::new("SpanRow", "Span")
            .with_selections(vec![Selection::scalar("id"), Selection::scalar("name")]);
        let shared = registry.register(spec);

        let fetched = registry.get("SpanRow").expect("registered fragment");
        assert!(Arc::ptr_eq(&shared, &fetched));
        assert!(registry.contains("SpanRow"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Unknown").is_none());
    }

    #[test]
    fn test_reregistration_replaces_identity() {
        let registry = FragmentRegistry::new();
        let first = registry.register(FragmentSpec::new("SpanRow", "Span"));
        let second = registry.register(FragmentSpec::new("SpanRow", "Span"));
        assert!(!Arc::ptr_eq(&first, &second));
        let fetched = registry.get("SpanRow").expect("registered fragment");
        assert!(Arc::ptr_eq(&second, &fetched));
    }

    #[test]
    fn test_fragment_from_descriptor_json() {
        let spec = FragmentSpec::from_json(json!({
            "name": "NodeLabel",
            "type": "Node",
            "abstractKey": "__isNode",
            "argumentDefinitions": [ { "name": "verbose", "defaultValue": false } ],
            "selections": [ { "kind": "ScalarField", "name": "id" } ]
        }))
        .expect("valid descriptor");
        assert_eq!(spec.name, "NodeLabel");
        assert_eq!(spec.abstract_key.as_deref(), Some("__isNode"));
        assert_eq!(spec.argument_definitions.len(), 1);

        let err = FragmentSpec::from_json(json!({"type": "Span"})).unwrap_err();
        assert!(matches!(err, ViewgraphError::Descriptor(_)));
    }

    #[test]
    fn test_type_hierarchy_never_guesses() {
        let mut hierarchy = TypeHierarchy::new();
        hierarchy.declare("Span", "Node");
        hierarchy.declare("Trace", "Node");

        assert!(hierarchy.implements("Span", "Node"));
        assert!(!hierarchy.implements("Span", "Timestamped"));
        assert!(hierarchy.knows("Trace"));
        // unknown type: no entry at all, callers must treat it as undecided
        assert!(!hierarchy.knows("Project"));
        assert!(!hierarchy.implements("Project", "Node"));
    }
}
