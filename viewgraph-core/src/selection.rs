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

//! Selection descriptors.
//!
//! Operations and fragments are described by trees of [`Selection`] nodes in
//! the same `kind`-tagged JSON shape compilers emit for generated artifacts,
//! so descriptors can be loaded straight from build output:
//!
//! ```json
//! {
//!   "kind": "LinkedField",
//!   "alias": "rootSpan",
//!   "name": "node",
//!   "concreteType": "Span",
//!   "selections": [ { "kind": "ScalarField", "name": "id" } ]
//! }
//! ```
//!
//! Descriptors are data, not schema: normalization and resolution trust the
//! shapes they declare and report mismatches instead of guessing.

use serde::{Deserialize, Serialize};

use crate::args::{storage_key, Argument, VariableBindings};

/// Schema meta field carrying the concrete type of a payload object.
pub const TYPENAME_FIELD: &str = "__typename";

/// One node of a selection tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Selection {
    ScalarField(ScalarField),
    LinkedField(LinkedField),
    InlineFragment(InlineFragment),
    FragmentSpread(FragmentSpread),
}

impl Selection {
    /// Shorthand for an unaliased scalar field without arguments.
    pub fn scalar(name: impl Into<String>) -> Self {
        Selection::ScalarField(ScalarField::new(name))
    }
}

/// A leaf field holding a JSON scalar (or arbitrary JSON for custom scalar
/// types).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Precomputed key emitted by a compiler; when present it wins over
    /// runtime canonicalization.
    #[serde(default)]
    pub storage_key: Option<String>,
}

impl ScalarField {
    pub fn new(name: impl Into<String>) -> Self {
        ScalarField {
            alias: None,
            name: name.into(),
            args: Vec::new(),
            storage_key: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Argument>) -> Self {
        self.args = args;
        self
    }

    /// Key the field is read from and written to in a payload object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Key the field occupies on its store record.
    pub fn storage_key(&self, variables: &VariableBindings) -> String {
        match &self.storage_key {
            Some(precomputed) => precomputed.clone(),
            None => storage_key(&self.name, &self.args, variables),
        }
    }
}

/// A field whose value is another record or a list of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Concrete type of the linked record when the schema guarantees one.
    #[serde(default)]
    pub concrete_type: Option<String>,
    #[serde(default)]
    pub plural: bool,
    #[serde(default)]
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub storage_key: Option<String>,
    /// Present when the field follows the cursor-connection convention and
    /// its pages should merge into one connection record.
    #[serde(default)]
    pub connection: Option<ConnectionDirective>,
}

impl LinkedField {
    pub fn new(name: impl Into<String>) -> Self {
        LinkedField {
            alias: None,
            name: name.into(),
            args: Vec::new(),
            concrete_type: None,
            plural: false,
            selections: Vec::new(),
            storage_key: None,
            connection: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Argument>) -> Self {
        self.args = args;
        self
    }

    pub fn with_concrete_type(mut self, concrete_type: impl Into<String>) -> Self {
        self.concrete_type = Some(concrete_type.into());
        self
    }

    pub fn plural(mut self) -> Self {
        self.plural = true;
        self
    }

    pub fn with_selections(mut self, selections: Vec<Selection>) -> Self {
        self.selections = selections;
        self
    }

    pub fn with_connection(mut self, directive: ConnectionDirective) -> Self {
        self.connection = Some(directive);
        self
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Key the field occupies on its store record. Connection fields are
    /// keyed separately; see `connection_storage_key` in the store crate.
    pub fn storage_key(&self, variables: &VariableBindings) -> String {
        match &self.storage_key {
            Some(precomputed) => precomputed.clone(),
            None => storage_key(&self.name, &self.args, variables),
        }
    }

    pub fn is_connection(&self) -> bool {
        self.connection.is_some()
    }
}

/// A branch of selections that only applies to one concrete or abstract
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFragment {
    /// The type condition, named `type` in descriptor JSON.
    #[serde(rename = "type")]
    pub type_condition: String,
    /// Marker field (`__isX`) servers echo when a payload object's type
    /// implements the abstract type `X`. Absent for concrete conditions.
    #[serde(rename = "abstractKey", default)]
    pub abstract_key: Option<String>,
    #[serde(default)]
    pub selections: Vec<Selection>,
}

impl InlineFragment {
    pub fn new(type_condition: impl Into<String>, selections: Vec<Selection>) -> Self {
        InlineFragment {
            type_condition: type_condition.into(),
            abstract_key: None,
            selections,
        }
    }

    pub fn with_abstract_key(mut self, abstract_key: impl Into<String>) -> Self {
        self.abstract_key = Some(abstract_key.into());
        self
    }
}

/// A reference to a named fragment registered with the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpread {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Argument>,
}

impl FragmentSpread {
    pub fn new(name: impl Into<String>) -> Self {
        FragmentSpread {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Argument>) -> Self {
        self.args = args;
        self
    }
}

/// Connection identity declared on a paginated field.
///
/// The stable `key` names the connection independently of pagination
/// arguments; `filters` lists the argument names that DO distinguish
/// connections (a filtered list and an unfiltered one must not merge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDirective {
    pub key: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

impl ConnectionDirective {
    pub fn new(key: impl Into<String>) -> Self {
        ConnectionDirective {
            key: key.into(),
            filters: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: Vec<String>) -> Self {
        self.filters = filters;
        self
    }
}
