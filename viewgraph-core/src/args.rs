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

//! Field arguments, variable bindings, and storage-key canonicalization.
//!
//! Two selections of the same field with the same argument values must land
//! on the same store field. [`storage_key`] guarantees that by rendering
//! arguments in sorted order with a canonical JSON encoding of each value,
//! regardless of the order a descriptor lists them in or whether they arrive
//! as literals or variable references.
//!
//! ## Storage keys
//!
//! ```text
//! descendants(first:50)
//! spans(filter:{"kind":"llm"},first:30)
//! name                     <- no arguments at all
//! ```
//!
//! Arguments that resolve to `null` (or to an unbound variable) are omitted,
//! so `field(limit:null)` and `field` share one store field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single field or fragment argument from a selection descriptor.
///
/// Mirrors the wire shape of generated artifacts: `kind` discriminates
/// between inline literals and references into the variable scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Argument {
    /// A constant value baked into the descriptor.
    Literal { name: String, value: Value },
    /// A reference to a variable bound at execution time.
    Variable {
        name: String,
        #[serde(rename = "variableName")]
        variable_name: String,
    },
}

impl Argument {
    pub fn literal(name: impl Into<String>, value: Value) -> Self {
        Argument::Literal {
            name: name.into(),
            value,
        }
    }

    pub fn variable(name: impl Into<String>, variable_name: impl Into<String>) -> Self {
        Argument::Variable {
            name: name.into(),
            variable_name: variable_name.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Argument::Literal { name, .. } => name,
            Argument::Variable { name, .. } => name,
        }
    }

    /// Resolves the argument against the given bindings.
    ///
    /// Returns `None` for a `null` literal, an unbound variable, or a
    /// variable bound to `null` - those arguments are dropped from storage
    /// keys entirely.
    pub fn resolve<'a>(&'a self, variables: &'a VariableBindings) -> Option<&'a Value> {
        match self {
            Argument::Literal { value, .. } => (!value.is_null()).then_some(value),
            Argument::Variable { variable_name, .. } => variables.resolved(variable_name),
        }
    }
}

/// Declaration of a variable accepted by an operation or fragment, with an
/// optional default applied when the caller leaves it unbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<Value>,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        VariableDefinition {
            name: name.into(),
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Variable scope for one execution or one fragment spread.
///
/// Bindings are kept in a `BTreeMap` so the canonical rendering used for
/// request fingerprints falls out of plain iteration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableBindings(BTreeMap<String, Value>);

impl VariableBindings {
    pub fn new() -> Self {
        VariableBindings(BTreeMap::new())
    }

    /// Builder-style insert, convenient for tests and call sites that
    /// assemble a scope inline.
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn unset(&mut self, name: &str) {
        self.0.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Like [`get`](Self::get) but treats an explicit `null` binding as
    /// absent, matching how storage keys omit null arguments.
    pub fn resolved(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|value| !value.is_null())
    }

    /// Fills in defaults for every definition the scope leaves unbound.
    pub fn apply_defaults(&mut self, definitions: &[VariableDefinition]) {
        for definition in definitions {
            if self.resolved(&definition.name).is_some() {
                continue;
            }
            if let Some(default) = &definition.default_value {
                if !default.is_null() {
                    self.0.insert(definition.name.clone(), default.clone());
                }
            }
        }
    }

    /// Derives the scope a fragment spread executes under: the outer scope,
    /// overridden by the spread's own arguments, backfilled with the
    /// fragment's declared defaults.
    pub fn for_spread(
        definitions: &[VariableDefinition],
        spread_args: &[Argument],
        outer: &VariableBindings,
    ) -> VariableBindings {
        let mut child = outer.clone();
        for arg in spread_args {
            match arg.resolve(outer) {
                Some(value) => child.set(arg.name(), value.clone()),
                None => child.unset(arg.name()),
            }
        }
        child.apply_defaults(definitions);
        child
    }

    /// Canonical single-line rendering of the whole scope, used for request
    /// fingerprints and fragment memoization keys.
    pub fn canonical(&self) -> String {
        let mut out = String::from("{");
        for (index, (name, value)) in self.0.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&Value::String(name.clone()).to_string());
            out.push(':');
            out.push_str(&canonical_json(value));
        }
        out.push('}');
        out
    }

    /// Stable 64-bit fingerprint of the scope contents.
    pub fn fingerprint(&self) -> u64 {
        seahash::hash(self.canonical().as_bytes())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Renders a JSON value with object keys recursively sorted, so structurally
/// equal values always produce the same text.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => String::from("null"),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(entries) => {
            let mut names: Vec<&String> = entries.keys().collect();
            names.sort();
            let rendered: Vec<String> = names
                .into_iter()
                .map(|name| {
                    format!(
                        "{}:{}",
                        Value::String(name.clone()),
                        canonical_json(&entries[name])
                    )
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// Canonical storage key for a field: the schema name followed by resolved
/// arguments in sorted order, or the bare name when no argument survives
/// resolution.
pub fn storage_key(name: &str, args: &[Argument], variables: &VariableBindings) -> String {
    let mut resolved: Vec<(&str, String)> = args
        .iter()
        .filter_map(|arg| {
            arg.resolve(variables)
                .map(|value| (arg.name(), canonical_json(value)))
        })
        .collect();
    if resolved.is_empty() {
        return name.to_string();
    }
    resolved.sort_by(|a, b| a.0.cmp(b.0));
    let rendered: Vec<String> = resolved
        .into_iter()
        .map(|(arg, value)| format!("{arg}:{value}"))
        .collect();
    format!("{}({})", name, rendered.join(","))
}
