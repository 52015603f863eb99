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

//! Operation descriptors and executable requests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::args::{VariableBindings, VariableDefinition};
use crate::error::{Result, ViewgraphError};
use crate::selection::Selection;

/// A root query descriptor: a name, declared variables, and a selection
/// tree anchored at the client root record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    pub name: String,
    #[serde(default)]
    pub argument_definitions: Vec<VariableDefinition>,
    #[serde(default)]
    pub selections: Vec<Selection>,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>) -> Self {
        OperationSpec {
            name: name.into(),
            argument_definitions: Vec::new(),
            selections: Vec::new(),
        }
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

/// An operation bound to a concrete variable scope.
///
/// The fingerprint identifies the request for transport dispatch and
/// in-flight deduplication: two requests with the same operation name and
/// canonically-equal variables collapse onto one fetch.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    operation: Arc<OperationSpec>,
    variables: VariableBindings,
    fingerprint: u64,
}

impl QueryRequest {
    pub fn new(operation: Arc<OperationSpec>, mut variables: VariableBindings) -> Self {
        variables.apply_defaults(&operation.argument_definitions);
        let fingerprint = seahash::hash(
            format!("{}|{}", operation.name, variables.canonical()).as_bytes(),
        );
        QueryRequest {
            operation,
            variables,
            fingerprint,
        }
    }

    pub fn operation(&self) -> &Arc<OperationSpec> {
        &self.operation
    }

    pub fn operation_name(&self) -> &str {
        &self.operation.name
    }

    pub fn variables(&self) -> &VariableBindings {
        &self.variables
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}
