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

//! # Viewgraph Core
//!
//! Shared vocabulary of the viewgraph normalized graph cache:
//!
//! - **Record keys** ([`key`]): global-id and path-synthesized identifiers
//!   for normalized records.
//! - **Arguments** ([`args`]): variable scopes and canonical storage-key
//!   encoding, so equal argument values always address the same field.
//! - **Selections** ([`selection`]): descriptor trees in the `kind`-tagged
//!   JSON shape of generated artifacts.
//! - **Fragments** ([`fragment`]): named selection sets, the registry that
//!   resolves spreads, and the optional type hierarchy for abstract
//!   narrowing.
//! - **Operations** ([`operation`]): root queries and fingerprinted
//!   requests.
//! - **Errors** ([`error`]): the workspace-wide taxonomy.
//!
//! The store and client crates build on these types; nothing here touches
//! payloads or records directly.

pub mod args;
pub mod error;
pub mod fragment;
pub mod key;
pub mod operation;
pub mod selection;

pub use args::{canonical_json, storage_key, Argument, VariableBindings, VariableDefinition};
pub use error::{
    MergeWarning, MissingField, Result, TransportError, ValueClass, ViewgraphError,
};
pub use fragment::{FragmentRegistry, FragmentSpec, TypeHierarchy};
pub use key::{RecordKey, ROOT_KEY};
pub use operation::{OperationSpec, QueryRequest};
pub use selection::{
    ConnectionDirective, FragmentSpread, InlineFragment, LinkedField, ScalarField, Selection,
    TYPENAME_FIELD,
};
